//! Local filesystem backend

use super::{Backend, ByteStream};
use async_trait::async_trait;
use depot_common::{DepotError, Result};
use sha2::{Digest, Sha384};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Filesystem backend rooted at a directory.
///
/// Writes go to a temporary sibling first and are renamed into place
/// after `sync_all`, so a path either holds a complete blob or nothing.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub async fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn get(&self, path: &str) -> Result<ByteStream> {
        match fs::File::open(self.resolve(path)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(DepotError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: i64,
    ) -> Result<String> {
        let dest = self.resolve(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = dest.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        match write_stream(&mut file, reader, length).await {
            Ok((checksum, written)) => {
                file.sync_all().await?;
                drop(file);
                fs::rename(&temp_path, &dest).await?;
                debug!("stored {} bytes at {}", written, path);
                Ok(checksum)
            }
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(DepotError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Pump the stream into the file while hashing it, enforcing a declared
/// length when one was given.
async fn write_stream(
    file: &mut fs::File,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    length: i64,
) -> Result<(String, u64)> {
    let mut hasher = Sha384::new();
    let mut limited: Box<dyn AsyncRead + Send + Unpin + '_> = if length >= 0 {
        Box::new(reader.take(length as u64))
    } else {
        Box::new(reader)
    };

    let mut written: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = limited.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        written += n as u64;
    }

    if length >= 0 && written != length as u64 {
        return Err(DepotError::Backend(format!(
            "short read: got {written} of {length} bytes"
        )));
    }

    Ok((format!("{:x}", hasher.finalize()), written))
}
