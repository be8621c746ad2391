use std::sync::Arc;

use gleaner_core::{ArticleSink, GrabError};

use crate::header::header_type;
use crate::types::FileTyper;

/// How many leading bytes we need before classifying.
const REQUIRED_HEADER_BYTES: usize = 10;

/// A transparent sink wrapper that inspects the first decoded bytes of a
/// file and upgrades its detected type. After its byte budget has been
/// consumed it is a pure pass-through.
pub struct Sniffer {
    inner: Box<dyn ArticleSink>,
    target: Arc<dyn FileTyper>,
    buf: Vec<u8>,
    done: bool,
}

impl Sniffer {
    pub fn new(inner: Box<dyn ArticleSink>, target: Arc<dyn FileTyper>) -> Self {
        Self {
            inner,
            target,
            buf: Vec::with_capacity(REQUIRED_HEADER_BYTES),
            done: false,
        }
    }

    fn sniff(&mut self) {
        self.target.set_file_type(header_type(&self.buf));
        self.buf.clear();
        self.done = true;
    }
}

#[async_trait::async_trait]
impl ArticleSink for Sniffer {
    async fn write(&mut self, buf: &[u8]) -> Result<(), GrabError> {
        if !self.done {
            self.buf.extend_from_slice(buf);
            if self.buf.len() >= REQUIRED_HEADER_BYTES {
                self.sniff();
            }
        }
        self.inner.write(buf).await
    }

    async fn close(&mut self) -> Result<(), GrabError> {
        self.inner.close().await
    }
}
