//! S3-compatible object store backend

use super::{Backend, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use depot_common::{DepotError, Result};
use sha2::{Digest, Sha384};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Backend over any S3-compatible object store (AWS S3, MinIO, R2, DO
/// Spaces, etc.).
pub struct ObjectBackend {
    store: Arc<dyn object_store::ObjectStore>,
    prefix: object_store::path::Path,
}

impl ObjectBackend {
    /// Create from an object store URL (s3://bucket/prefix,
    /// https://minio.example.com/bucket).
    pub fn from_url(url: &str) -> Result<Self> {
        use object_store::parse_url;

        let parsed_url = url::Url::parse(url)
            .map_err(|e| DepotError::Backend(format!("invalid object store URL: {e}")))?;

        let (store, path) = parse_url(&parsed_url)
            .map_err(|e| DepotError::Backend(format!("failed to parse object store URL: {e}")))?;

        Ok(Self {
            store: Arc::from(store),
            prefix: path,
        })
    }

    /// Create with explicit S3 configuration.
    pub fn new_s3(bucket: String, region: String, endpoint: Option<String>) -> Result<Self> {
        use object_store::aws::AmazonS3Builder;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&bucket)
            .with_region(&region);

        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(&endpoint);
        }

        // Allow anonymous access or credentials from environment
        builder = builder.with_allow_http(true);

        let store = builder
            .build()
            .map_err(|e| DepotError::Backend(format!("failed to create S3 backend: {e}")))?;

        Ok(Self {
            store: Arc::new(store),
            prefix: object_store::path::Path::from(""),
        })
    }

    fn location(&self, path: &str) -> object_store::path::Path {
        path.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.prefix.clone(), |loc, part| loc.child(part))
    }
}

#[async_trait]
impl Backend for ObjectBackend {
    async fn get(&self, path: &str) -> Result<ByteStream> {
        let location = self.location(path);

        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(DepotError::NotFound(path.to_string()))
            }
            Err(e) => {
                return Err(DepotError::Backend(format!(
                    "failed to get blob from object store: {e}"
                )))
            }
        };

        let bytes = result
            .bytes()
            .await
            .map_err(|e| DepotError::Backend(format!("failed to read blob bytes: {e}")))?;

        Ok(Box::new(Cursor::new(bytes.to_vec())))
    }

    async fn put(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: i64,
    ) -> Result<String> {
        use object_store::PutPayload;

        let mut data = Vec::new();
        if length >= 0 {
            let mut limited = reader.take(length as u64);
            limited.read_to_end(&mut data).await?;
            if data.len() as u64 != length as u64 {
                return Err(DepotError::Backend(format!(
                    "short read writing {path}: got {} of {length} bytes",
                    data.len()
                )));
            }
        } else {
            reader.read_to_end(&mut data).await?;
        }

        let mut hasher = Sha384::new();
        hasher.update(&data);
        let checksum = format!("{:x}", hasher.finalize());

        let location = self.location(path);
        let payload = PutPayload::from(Bytes::from(data));
        self.store
            .put(&location, payload)
            .await
            .map_err(|e| DepotError::Backend(format!("failed to put blob to object store: {e}")))?;

        debug!("stored blob at {} in object store", location);
        Ok(checksum)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let location = self.location(path);

        match self.store.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                Err(DepotError::NotFound(path.to_string()))
            }
            Err(e) => Err(DepotError::Backend(format!(
                "failed to delete blob from object store: {e}"
            ))),
        }
    }
}
