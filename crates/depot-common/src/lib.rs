// Shared vocabulary types for the depot storage layer.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};
use thiserror::Error;
use uuid::Uuid;

/// Hex length of a SHA-384 digest.
pub const CONTENT_HASH_HEX_LEN: usize = 96;

#[derive(Error, Debug)]
pub enum DepotError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("upload already completed for resource {0}")]
    AlreadyUploaded(String),

    #[error("upload pending: {0}")]
    UploadPending(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

// Define the primary Result type for depot operations
pub type Result<T> = std::result::Result<T, DepotError>;

/// Opaque identifier of a catalog resource, assigned when the entry is
/// first created and stable for the resource's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Hex-encoded SHA-384 content fingerprint; the deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Digest a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha384::new();
        hasher.update(data);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Accept a caller-supplied hex digest, rejecting anything that is
    /// not 96 lowercase hex characters.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != CONTENT_HASH_HEX_LEN {
            return Err(DepotError::Verification(format!(
                "hash must be {} hex characters, got {}",
                CONTENT_HASH_HEX_LEN,
                s.len()
            )));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DepotError::Verification(
                "hash contains non-hex characters".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }

    /// Wrap a digest already produced by a backend write.
    pub fn from_digest(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Namespace key under which paths resolve to resources. Scoping rules
/// live in the key format; only model scoping is constructed today.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope(String);

impl Scope {
    /// Scope for a model/tenant identified by an opaque id.
    pub fn model(id: impl Display) -> Self {
        Self(format!("model-{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_digest() {
        let hash = ContentHash::from_bytes(b"some content");
        assert_eq!(hash.as_str().len(), CONTENT_HASH_HEX_LEN);
        assert!(hash.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(hash, ContentHash::from_bytes(b"some content"));
        assert_ne!(hash, ContentHash::from_bytes(b"other content"));
    }

    #[test]
    fn test_hash_parse_rejects_garbage() {
        assert!(ContentHash::parse("abc123").is_err());
        assert!(ContentHash::parse(&"g".repeat(CONTENT_HASH_HEX_LEN)).is_err());

        let valid = "a".repeat(CONTENT_HASH_HEX_LEN);
        assert_eq!(ContentHash::parse(&valid).unwrap().as_str(), valid);
    }

    #[test]
    fn test_scope_key_format() {
        let scope = Scope::model("0af63b48");
        assert_eq!(scope.as_str(), "model-0af63b48");

        let json = serde_json::to_string(&scope).unwrap();
        assert!(json.contains("model-0af63b48"));
    }

    #[test]
    fn test_resource_ids_unique() {
        assert_ne!(ResourceId::generate(), ResourceId::generate());
    }
}
