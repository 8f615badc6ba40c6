//! Namespaced storage facade
//!
//! `ManagedStore` turns per-scope path writes into catalog operations
//! plus backend I/O. It owns the `(scope, path) -> resource id` index,
//! drives the two-phase upload lifecycle (reserve, then bind bytes), and
//! runs the proof-of-ownership exchange that lets a caller reference
//! existing content without re-uploading it.

use crate::backend::{Backend, ByteStream, CountingReader};
use crate::cache::ReadCache;
use crate::catalog::ResourceCatalog;
use crate::proof::{self, ChallengeSeed, OwnershipChallenge, OwnershipProof};
use dashmap::DashMap;
use depot_common::{ContentHash, DepotError, ResourceId, Result, Scope};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

type PathKey = (Scope, String);

/// Tuning knobs for a `ManagedStore`.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Read-cache capacity in entries; 0 disables the cache.
    pub cache_capacity: usize,
    /// Largest blob the read cache will hold.
    pub max_cached_blob_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 256,
            max_cached_blob_size: 4 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `DEPOT_CACHE_CAPACITY` and
    /// `DEPOT_CACHE_MAX_BLOB_SIZE` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = std::env::var("DEPOT_CACHE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.cache_capacity = n;
        }
        if let Some(n) = std::env::var("DEPOT_CACHE_MAX_BLOB_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.max_cached_blob_size = n;
        }
        config
    }
}

/// Scoped front-end over a catalog and a blob backend.
pub struct ManagedStore {
    catalog: Arc<dyn ResourceCatalog>,
    backend: Arc<dyn Backend>,
    index: DashMap<PathKey, ResourceId>,
    cache: ReadCache,
    seed: ChallengeSeed,
}

impl ManagedStore {
    pub fn new(
        catalog: Arc<dyn ResourceCatalog>,
        backend: Arc<dyn Backend>,
        config: StoreConfig,
    ) -> Result<Self> {
        Ok(Self {
            catalog,
            backend,
            index: DashMap::new(),
            cache: ReadCache::new(config.cache_capacity, config.max_cached_blob_size),
            seed: ChallengeSeed::generate()?,
        })
    }

    /// The catalog this store records references in.
    pub fn catalog(&self) -> Arc<dyn ResourceCatalog> {
        self.catalog.clone()
    }

    /// Stream the data at `path` within `scope`, with its length.
    ///
    /// A path whose resource is still uploading yields `UploadPending`:
    /// the reference is valid, the bytes are not there yet, and the
    /// caller should retry.
    pub async fn get(&self, scope: &Scope, path: &str) -> Result<(ByteStream, u64)> {
        let id = self
            .index
            .get(&(scope.clone(), path.to_string()))
            .map(|entry| *entry.value())
            .ok_or_else(|| DepotError::NotFound(format!("{scope}:{path}")))?;

        let resource = self.catalog.get(id).await?;
        let Some(physical) = resource.path else {
            return Err(DepotError::UploadPending(format!("{scope}:{path}")));
        };

        if self.cache.admits(resource.length) {
            if let Some(data) = self.cache.get(&id).await {
                return Ok((Box::new(Cursor::new(data)), resource.length));
            }
            let mut stream = self.backend.get(&physical).await?;
            let mut data = Vec::with_capacity(resource.length as usize);
            stream.read_to_end(&mut data).await?;
            self.cache.insert(id, data.clone()).await;
            return Ok((Box::new(Cursor::new(data)), resource.length));
        }

        let stream = self.backend.get(&physical).await?;
        Ok((stream, resource.length))
    }

    /// Store `length` bytes from `reader` at `path` within `scope`,
    /// without verifying a declared hash. `length < 0` reads to EOF.
    pub async fn put<R>(&self, scope: &Scope, path: &str, reader: R, length: i64) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.put_and_check_hash(scope, path, reader, length, None).await
    }

    /// Store data at `path` within `scope`, verifying the content against
    /// `expected` when one is declared.
    ///
    /// With a declared hash and a known length, the catalog reservation
    /// happens before any byte moves; content the catalog already holds
    /// is referenced without uploading at all. Without a declared hash
    /// (or with an unknown length) the stream is staged to a fresh
    /// backend path first to learn its hash. Either way a lost
    /// completion race is absorbed: the loser deletes its own staged
    /// bytes and adopts the winner's copy.
    #[instrument(skip(self, reader, expected), fields(scope = %scope, path = %path))]
    pub async fn put_and_check_hash<R>(
        &self,
        scope: &Scope,
        path: &str,
        mut reader: R,
        length: i64,
        expected: Option<&ContentHash>,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        if let (Some(hash), true) = (expected, length >= 0) {
            return self
                .put_reserved(scope, path, &mut reader, length as u64, hash)
                .await;
        }
        self.put_staged(scope, path, &mut reader, length, expected).await
    }

    /// Reserve-first flow: the hash is declared, so dedup is decided
    /// before any upload, and the reference is published while the
    /// upload is in flight (readers see `UploadPending` until the bytes
    /// are bound).
    async fn put_reserved(
        &self,
        scope: &Scope,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        hash: &ContentHash,
    ) -> Result<()> {
        let reservation = self.catalog.put(hash, length).await?;
        if reservation.path.is_some() {
            debug!("content for {} already stored, linking only", hash);
            return self.link(scope, path, reservation.id).await;
        }

        // Publish the reference before moving bytes: readers polling this
        // path see UploadPending instead of NotFound while the upload
        // runs. The reference it displaces is only released once the new
        // content is actually bound.
        let displaced = self
            .index
            .insert((scope.clone(), path.to_string()), reservation.id);

        let staged = staging_path();
        let outcome = match self.backend.put(&staged, reader, length as i64).await {
            Ok(checksum) if checksum == hash.as_str() => {
                match self.catalog.upload_complete(reservation.id, &staged).await {
                    Ok(()) => Ok(()),
                    Err(DepotError::AlreadyUploaded(_)) => {
                        // a peer finished first; our copy is redundant
                        self.discard_staged(&staged).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(checksum) => Err(DepotError::Verification(format!(
                "content hash mismatch: declared {}, stored {}",
                hash, checksum
            ))),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                if let Some(old) = displaced {
                    self.release(old).await?;
                }
                Ok(())
            }
            Err(e) => {
                self.abort_upload(scope, path, reservation.id, displaced, &staged)
                    .await;
                Err(e)
            }
        }
    }

    /// Stage-first flow: the hash is only known after the bytes have
    /// been consumed, so the stream lands on a fresh backend path before
    /// the catalog hears about it.
    async fn put_staged(
        &self,
        scope: &Scope,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: i64,
        expected: Option<&ContentHash>,
    ) -> Result<()> {
        let staged = staging_path();
        let mut counting = CountingReader::new(reader);
        let checksum = match self.backend.put(&staged, &mut counting, length).await {
            Ok(checksum) => checksum,
            Err(e) => {
                self.discard_staged(&staged).await;
                return Err(e);
            }
        };
        let actual_length = if length >= 0 {
            length as u64
        } else {
            counting.count()
        };

        if let Some(hash) = expected {
            if checksum != hash.as_str() {
                self.discard_staged(&staged).await;
                return Err(DepotError::Verification(format!(
                    "content hash mismatch: declared {}, stored {}",
                    hash, checksum
                )));
            }
        }
        let hash = ContentHash::from_digest(checksum);

        let reservation = match self.catalog.put(&hash, actual_length).await {
            Ok(reservation) => reservation,
            Err(e) => {
                self.discard_staged(&staged).await;
                return Err(e);
            }
        };
        if reservation.path.is_some() {
            // identical content is already stored; ours is redundant
            self.discard_staged(&staged).await;
            return self.link(scope, path, reservation.id).await;
        }

        match self.catalog.upload_complete(reservation.id, &staged).await {
            Ok(()) => self.link(scope, path, reservation.id).await,
            Err(DepotError::AlreadyUploaded(_)) => {
                self.discard_staged(&staged).await;
                self.link(scope, path, reservation.id).await
            }
            Err(e) => {
                if let Err(release_err) = self.release(reservation.id).await {
                    warn!("rollback of reservation {} failed: {}", reservation.id, release_err);
                }
                self.discard_staged(&staged).await;
                Err(e)
            }
        }
    }

    /// Delete the data at `path` within `scope`, releasing its resource
    /// reference and deleting the physical bytes when it was the last
    /// one. A path with no entry is `NotFound`.
    pub async fn remove(&self, scope: &Scope, path: &str) -> Result<()> {
        let (_, id) = self
            .index
            .remove(&(scope.clone(), path.to_string()))
            .ok_or_else(|| DepotError::NotFound(format!("{scope}:{path}")))?;
        self.release(id).await
    }

    /// Ask to reference content by hash without uploading it. Returns the
    /// byte-range challenge the caller must answer from their own copy,
    /// or `NotFound` when the content is absent (or not yet fully
    /// uploaded, which cannot be verified) and a full put is required.
    /// No reference is taken until the proof is accepted.
    pub async fn request_claim(
        &self,
        scope: &Scope,
        path: &str,
        hash: &ContentHash,
    ) -> Result<OwnershipChallenge> {
        let id = self.catalog.find(hash).await?;
        let resource = self.catalog.get(id).await?;
        if resource.is_pending() {
            return Err(DepotError::NotFound(format!("hash {hash}")));
        }

        Ok(OwnershipChallenge {
            scope: scope.clone(),
            path: path.to_string(),
            hash: hash.clone(),
            range: proof::derive_range(&self.seed, hash, resource.length),
        })
    }

    /// Verify a challenge answer against the stored copy and, on
    /// success, record the claimed reference. The challenged range is
    /// recomputed server-side; nothing the claimant sends is trusted
    /// beyond the checksum itself.
    #[instrument(skip(self, response), fields(scope = %response.scope, path = %response.path))]
    pub async fn prove_claim(&self, response: OwnershipProof) -> Result<()> {
        let id = self.catalog.find(&response.hash).await?;
        let resource = self.catalog.get(id).await?;
        let Some(physical) = resource.path else {
            return Err(DepotError::NotFound(format!("hash {}", response.hash)));
        };

        let range = proof::derive_range(&self.seed, &response.hash, resource.length);
        let stream = self.backend.get(&physical).await?;
        let expected = proof::range_checksum(stream, &range).await?;
        if expected != response.range_checksum {
            return Err(DepotError::Verification(format!(
                "ownership proof rejected for {}",
                response.hash
            )));
        }

        let reservation = self.catalog.put(&response.hash, resource.length).await?;
        if reservation.path.is_none() {
            // the resource was fully removed and re-reserved between the
            // range check and the increment; there are no bytes behind it
            if let Err(e) = self.release(reservation.id).await {
                warn!("rollback of claim on {} failed: {}", reservation.id, e);
            }
            return Err(DepotError::NotFound(format!("hash {}", response.hash)));
        }
        self.link(&response.scope, &response.path, reservation.id).await
    }

    /// Point `(scope, path)` at `id`, releasing whatever reference the
    /// entry previously held.
    async fn link(&self, scope: &Scope, path: &str, id: ResourceId) -> Result<()> {
        let displaced = self.index.insert((scope.clone(), path.to_string()), id);
        if let Some(old) = displaced {
            self.release(old).await?;
        }
        Ok(())
    }

    /// Drop one catalog reference; on the last one, delete the physical
    /// bytes and evict the cache entry.
    async fn release(&self, id: ResourceId) -> Result<()> {
        let removal = self.catalog.remove(id).await?;
        if !removal.was_deleted {
            return Ok(());
        }
        self.cache.invalidate(&id).await;
        if let Some(path) = removal.path {
            match self.backend.remove(&path).await {
                Ok(()) | Err(DepotError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Unwind a failed reserve-first upload: withdraw the published
    /// reference if it is still ours, restore whatever the path pointed
    /// at before, roll back the reservation, and discard any staged
    /// bytes.
    async fn abort_upload(
        &self,
        scope: &Scope,
        path: &str,
        id: ResourceId,
        displaced: Option<ResourceId>,
        staged: &str,
    ) {
        let key = (scope.clone(), path.to_string());
        self.index.remove_if(&key, |_, linked| *linked == id);
        if let Some(old) = displaced {
            self.index.entry(key).or_insert(old);
        }
        if let Err(e) = self.release(id).await {
            warn!("rollback of reservation {} failed: {}", id, e);
        }
        self.discard_staged(staged).await;
    }

    async fn discard_staged(&self, staged: &str) {
        match self.backend.remove(staged).await {
            Ok(()) | Err(DepotError::NotFound(_)) => {}
            Err(e) => warn!("failed to discard staged bytes at {}: {}", staged, e),
        }
    }
}

/// Fresh physical path for one upload attempt.
fn staging_path() -> String {
    format!("blobs/{}", Uuid::new_v4())
}
