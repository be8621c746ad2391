use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::GrabError;

/// Byte sink for decoded (or to-be-decoded) article data.
///
/// This is the seam between the NNTP session, the yEnc decoder, the magic
/// sniffer, and the on-disk segment file: each layer wraps the next and
/// forwards bytes inward.
#[async_trait::async_trait]
pub trait ArticleSink: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<(), GrabError>;

    /// Flush and release the underlying resource. Implementations must
    /// tolerate being called more than once.
    async fn close(&mut self) -> Result<(), GrabError>;
}

/// Shared handle to a sink.
///
/// The dispatcher creates a segment's output sink, hands a clone to the
/// decoder chain, and keeps one on the segment so the response handler (or
/// the segment's own done transition) can close it later. Only one task
/// writes at a time; the lock defends the handoff, not concurrent writers.
#[derive(Clone)]
pub struct SinkHandle {
    inner: Arc<Mutex<Box<dyn ArticleSink>>>,
}

impl SinkHandle {
    pub fn new(sink: Box<dyn ArticleSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    pub async fn write(&self, buf: &[u8]) -> Result<(), GrabError> {
        self.inner.lock().await.write(buf).await
    }

    pub async fn close(&self) -> Result<(), GrabError> {
        self.inner.lock().await.close().await
    }
}

#[async_trait::async_trait]
impl ArticleSink for SinkHandle {
    async fn write(&mut self, buf: &[u8]) -> Result<(), GrabError> {
        SinkHandle::write(self, buf).await
    }

    async fn close(&mut self) -> Result<(), GrabError> {
        SinkHandle::close(self).await
    }
}

/// In-memory sink, used by tests and by callers that want to inspect
/// decoded bytes without touching disk.
#[derive(Clone, Default)]
pub struct BufferSink {
    buf: Arc<std::sync::Mutex<Vec<u8>>>,
    closed: Arc<std::sync::Mutex<u32>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().expect("buffer lock").clone()
    }

    /// How many times this sink has been closed.
    pub fn close_count(&self) -> u32 {
        *self.closed.lock().expect("close lock")
    }
}

#[async_trait::async_trait]
impl ArticleSink for BufferSink {
    async fn write(&mut self, buf: &[u8]) -> Result<(), GrabError> {
        self.buf.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GrabError> {
        *self.closed.lock().expect("close lock") += 1;
        Ok(())
    }
}
