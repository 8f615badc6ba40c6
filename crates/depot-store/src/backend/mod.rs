//! Path-addressed byte storage backends
//!
//! A backend is an opaque key -> blob store: it can stream bytes out of a
//! path, stream bytes into a path while reporting a SHA-384 checksum of
//! what it wrote, and delete a path. Writers never share a physical path;
//! every upload attempt targets a fresh one.

mod local;
#[cfg(feature = "object-storage")]
mod object;

pub use local::LocalBackend;
#[cfg(feature = "object-storage")]
pub use object::ObjectBackend;

use async_trait::async_trait;
use depot_common::Result;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Readable byte stream handed out by a backend.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Storage backend trait for different blob storage implementations
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch the byte stream stored at `path`.
    async fn get(&self, path: &str) -> Result<ByteStream>;

    /// Write `length` bytes from `reader` to `path`, returning the hex
    /// SHA-384 checksum of the bytes written. A negative `length` means
    /// read to EOF; a declared length that the stream cannot satisfy is a
    /// backend error and leaves nothing behind at `path`.
    async fn put(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        length: i64,
    ) -> Result<String>;

    /// Delete the data at `path`.
    async fn remove(&self, path: &str) -> Result<()>;
}

/// Reader adapter that counts the bytes pulled through it, for callers
/// that only learn a stream's length by consuming it.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    /// Bytes read so far.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut me.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            me.count += (buf.filled().len() - before) as u64;
        }
        result
    }
}
