//! Hash-indexed resource catalog with reference counting
//!
//! The catalog is the single source of truth for the hash -> resource
//! mapping and for reference lifetimes. It never touches blob bytes; the
//! physical path is opaque metadata recorded at upload completion.

mod memory;

pub use memory::MemoryCatalog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depot_common::{ContentHash, ResourceId, Result};
use serde::{Deserialize, Serialize};

/// Metadata for one deduplicated piece of content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub hash: ContentHash,
    /// Byte length declared when the entry was reserved.
    pub length: u64,
    /// Physical location in the blob backend; `None` while the upload is
    /// still in flight.
    pub path: Option<String>,
    pub refcount: u64,
    /// Reservation time, for reaping of long-pending uploads.
    pub created_at: DateTime<Utc>,
}

impl Resource {
    /// A resource reserved but not yet bound to physical bytes.
    pub fn is_pending(&self) -> bool {
        self.path.is_none()
    }
}

/// Result of a create-or-increment reservation.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ResourceId,
    /// Physical path if an upload already completed for this hash.
    pub path: Option<String>,
}

/// Result of a reference release.
#[derive(Debug, Clone)]
pub struct Removal {
    /// True exactly when this release destroyed the entry, making the
    /// caller responsible for deleting the physical bytes.
    pub was_deleted: bool,
    pub path: Option<String>,
}

/// Persistent registry of resources, deduplicated by content hash.
///
/// All mutations are transactional units: `put` never admits two creators
/// for one hash, `upload_complete` is a linearized compare-and-set on the
/// path, and `remove` never exposes a refcount of zero without also
/// removing the entry. Implementations must not hold their serialization
/// primitive across blob I/O.
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    /// Fetch the resource with the given id.
    async fn get(&self, id: ResourceId) -> Result<Resource>;

    /// Resolve a content hash to its resource id. Pure lookup; neither
    /// creates nor increments.
    async fn find(&self, hash: &ContentHash) -> Result<ResourceId>;

    /// Ensure an entry exists for `hash`: increment its refcount if it
    /// does, otherwise create it with refcount 1 and no path. The
    /// returned path is `None` until `upload_complete` records one.
    async fn put(&self, hash: &ContentHash, length: u64) -> Result<Reservation>;

    /// Record that the resource is fully uploaded at `path`. Fails with
    /// `AlreadyUploaded` if another uploader recorded a path first; the
    /// loser owns the cleanup of its own bytes.
    async fn upload_complete(&self, id: ResourceId, path: &str) -> Result<()>;

    /// Drop one reference, destroying the entry when the count reaches
    /// zero.
    async fn remove(&self, id: ResourceId) -> Result<Removal>;
}
