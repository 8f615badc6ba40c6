//! Proof-of-ownership challenge derivation and verification
//!
//! A claimant who already possesses content can obtain a reference to it
//! without uploading: the store challenges them to checksum a byte range
//! of their own copy. The range is a pure function of
//! `(hash, length, server seed)`, so no challenge state is kept, and the
//! seed never leaves the process, so the range cannot be predicted from
//! the public hash and length alone.

use crate::backend::ByteStream;
use depot_common::{ContentHash, DepotError, Result, Scope};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};
use tokio::io::AsyncReadExt;

/// Widest range a claimant is asked to checksum.
const MAX_RANGE_BYTES: u64 = 512;

/// Server-side secret that makes challenge ranges unpredictable.
pub(crate) struct ChallengeSeed([u8; 32]);

impl ChallengeSeed {
    pub(crate) fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        SystemRandom::new()
            .fill(&mut seed)
            .map_err(|_| DepotError::Internal("system randomness unavailable".to_string()))?;
        Ok(Self(seed))
    }
}

/// Byte range within a resource, `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

/// Challenge issued when a claim request finds the hash in the catalog.
/// Ephemeral: valid only for the request/response round trip that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipChallenge {
    pub scope: Scope,
    pub path: String,
    pub hash: ContentHash,
    pub range: ByteRange,
}

impl OwnershipChallenge {
    /// Answer the challenge from the claimant's own copy of the content.
    pub fn respond(&self, data: &[u8]) -> Result<OwnershipProof> {
        let end = self
            .range
            .offset
            .checked_add(self.range.length)
            .filter(|end| *end <= data.len() as u64)
            .ok_or_else(|| {
                DepotError::Verification(format!(
                    "challenged range {}+{} exceeds content of {} bytes",
                    self.range.offset,
                    self.range.length,
                    data.len()
                ))
            })?;

        let mut hasher = Sha384::new();
        hasher.update(&data[self.range.offset as usize..end as usize]);
        Ok(OwnershipProof {
            scope: self.scope.clone(),
            path: self.path.clone(),
            hash: self.hash.clone(),
            range_checksum: format!("{:x}", hasher.finalize()),
        })
    }
}

/// Claimant's answer: the checksum of the challenged range of their copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipProof {
    pub scope: Scope,
    pub path: String,
    pub hash: ContentHash,
    pub range_checksum: String,
}

/// Derive the challenged range for a resource. Deterministic per seed so
/// verification can recompute it; always within `[0, length)`.
pub(crate) fn derive_range(seed: &ChallengeSeed, hash: &ContentHash, length: u64) -> ByteRange {
    let mut hasher = Sha384::new();
    hasher.update(seed.0);
    hasher.update(hash.as_str().as_bytes());
    hasher.update(length.to_le_bytes());
    let digest = hasher.finalize();

    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    let offset = if length == 0 {
        0
    } else {
        u64::from_le_bytes(word) % length
    };

    ByteRange {
        offset,
        length: MAX_RANGE_BYTES.min(length - offset),
    }
}

/// Checksum the challenged range of a backend stream.
pub(crate) async fn range_checksum(mut stream: ByteStream, range: &ByteRange) -> Result<String> {
    let mut discard = (&mut stream).take(range.offset);
    tokio::io::copy(&mut discard, &mut tokio::io::sink()).await?;

    let mut data = Vec::with_capacity(range.length as usize);
    (&mut stream).take(range.length).read_to_end(&mut data).await?;
    if data.len() as u64 != range.length {
        return Err(DepotError::Backend(format!(
            "short read checksumming range: got {} of {} bytes",
            data.len(),
            range.length
        )));
    }

    let mut hasher = Sha384::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}
