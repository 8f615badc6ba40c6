//! In-memory catalog backed by a single write lock

use super::{Removal, Reservation, Resource, ResourceCatalog};
use async_trait::async_trait;
use chrono::Utc;
use depot_common::{ContentHash, DepotError, ResourceId, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Index {
    by_hash: HashMap<ContentHash, ResourceId>,
    by_id: HashMap<ResourceId, Resource>,
}

/// Transactional in-memory `ResourceCatalog`.
///
/// One `RwLock` guards the whole index; every mutation runs its full
/// read-modify-write inside a single write guard, which is what makes
/// create-or-increment, the completion compare-and-set, and
/// decrement-then-delete atomic with respect to each other. The guard is
/// only ever held for map operations, never across blob I/O.
pub struct MemoryCatalog {
    inner: RwLock<Index>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Index::default()),
        }
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceCatalog for MemoryCatalog {
    async fn get(&self, id: ResourceId) -> Result<Resource> {
        let index = self.inner.read().await;
        index
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| DepotError::NotFound(format!("resource {id}")))
    }

    async fn find(&self, hash: &ContentHash) -> Result<ResourceId> {
        let index = self.inner.read().await;
        index
            .by_hash
            .get(hash)
            .copied()
            .ok_or_else(|| DepotError::NotFound(format!("hash {hash}")))
    }

    async fn put(&self, hash: &ContentHash, length: u64) -> Result<Reservation> {
        let mut index = self.inner.write().await;
        if let Some(id) = index.by_hash.get(hash).copied() {
            let resource = index
                .by_id
                .get_mut(&id)
                .ok_or_else(|| DepotError::Internal(format!("hash index points at missing resource {id}")))?;
            resource.refcount += 1;
            return Ok(Reservation {
                id,
                path: resource.path.clone(),
            });
        }

        let id = ResourceId::generate();
        index.by_hash.insert(hash.clone(), id);
        index.by_id.insert(
            id,
            Resource {
                id,
                hash: hash.clone(),
                length,
                path: None,
                refcount: 1,
                created_at: Utc::now(),
            },
        );
        debug!("reserved resource {} for hash {}", id, hash);
        Ok(Reservation { id, path: None })
    }

    async fn upload_complete(&self, id: ResourceId, path: &str) -> Result<()> {
        let mut index = self.inner.write().await;
        let resource = index
            .by_id
            .get_mut(&id)
            .ok_or_else(|| DepotError::NotFound(format!("resource {id}")))?;
        if resource.path.is_some() {
            return Err(DepotError::AlreadyUploaded(id.to_string()));
        }
        resource.path = Some(path.to_string());
        debug!("resource {} completed at {}", id, path);
        Ok(())
    }

    async fn remove(&self, id: ResourceId) -> Result<Removal> {
        let mut index = self.inner.write().await;
        let resource = index
            .by_id
            .get_mut(&id)
            .ok_or_else(|| DepotError::NotFound(format!("resource {id}")))?;
        resource.refcount -= 1;
        if resource.refcount > 0 {
            return Ok(Removal {
                was_deleted: false,
                path: resource.path.clone(),
            });
        }

        let resource = index
            .by_id
            .remove(&id)
            .ok_or_else(|| DepotError::Internal(format!("resource {id} vanished mid-removal")))?;
        index.by_hash.remove(&resource.hash);
        debug!("destroyed resource {} for hash {}", id, resource.hash);
        Ok(Removal {
            was_deleted: true,
            path: resource.path,
        })
    }
}
