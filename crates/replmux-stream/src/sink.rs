//! Mutually exclusive writes to a shared sink

use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::BoxWriter;

/// Sink shared between concurrent writers.
///
/// Each `write` holds the lock for the whole call, so the bytes of two
/// writes never interleave in the wrapped sink. There is no buffering:
/// every call goes straight to the wrapped writer and is flushed.
pub struct SynchronizedSink<W = BoxWriter> {
    inner: Arc<Mutex<W>>,
}

/// The usual type-erased form handed around between components
pub type SharedSink = SynchronizedSink<BoxWriter>;

impl<W> Clone for SynchronizedSink<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W> fmt::Debug for SynchronizedSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedSink")
            .field("writers", &Arc::strong_count(&self.inner))
            .finish()
    }
}

impl<W: AsyncWrite + Unpin + Send> SynchronizedSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Write all of `buf` while holding the lock.
    ///
    /// Errors from the wrapped sink are returned as-is.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.inner.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(buf.len())
    }

    /// Shut down the wrapped writer; readers on the other end see EOF
    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}

impl SharedSink {
    pub fn boxed(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::new(Box::new(writer))
    }
}
