//! In-memory cache for hot blobs

use depot_common::ResourceId;
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::RwLock;

/// LRU cache of fully-downloaded blob bytes, keyed by resource id.
pub(crate) struct ReadCache {
    entries: RwLock<LruCache<ResourceId, Vec<u8>>>,
    max_blob_size: usize,
    enabled: bool,
}

impl ReadCache {
    pub(crate) fn new(capacity: usize, max_blob_size: usize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            max_blob_size,
            enabled: capacity > 0,
        }
    }

    /// Whether a blob of this size belongs in the cache at all.
    pub(crate) fn admits(&self, length: u64) -> bool {
        self.enabled && length <= self.max_blob_size as u64
    }

    pub(crate) async fn get(&self, id: &ResourceId) -> Option<Vec<u8>> {
        let mut entries = self.entries.write().await;
        entries.get(id).cloned()
    }

    pub(crate) async fn insert(&self, id: ResourceId, data: Vec<u8>) {
        if !self.admits(data.len() as u64) {
            return;
        }
        let mut entries = self.entries.write().await;
        entries.put(id, data);
    }

    pub(crate) async fn invalidate(&self, id: &ResourceId) {
        let mut entries = self.entries.write().await;
        entries.pop(id);
    }
}
