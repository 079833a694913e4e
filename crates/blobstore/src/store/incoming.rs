//! Uploads that arrive in several pieces before becoming a blob

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::blob::{Blob, BlobBuilder};

/// An upload in progress
///
/// Each call to [`appending_stream`](Self::appending_stream) continues where
/// the previous writer stopped.
pub trait IncomingBlob: Send {
    fn id(&self) -> &str;

    /// Writer appending to the upload
    fn appending_stream(&mut self) -> Result<Box<dyn Write + '_>>;

    /// Bytes received so far
    fn current_size(&self) -> Result<u64>;

    fn expected_size(&self) -> Option<u64>;

    fn set_expected_size(&mut self, size: u64);

    fn last_accessed(&self) -> DateTime<Utc>;

    /// Finish the upload and hand back the blob
    fn blob(&mut self) -> Result<Blob>;

    /// Throw the partial upload away
    fn cancel(&mut self);
}

/// Incoming blob that only buffers locally (non-resumable backends)
pub struct BufferedIncomingBlob {
    id: String,
    builder: BlobBuilder,
    expected_size: Option<u64>,
    last_accessed: DateTime<Utc>,
}

impl BufferedIncomingBlob {
    pub fn new(id: impl Into<String>, builder: BlobBuilder) -> Self {
        Self {
            id: id.into(),
            builder,
            expected_size: None,
            last_accessed: Utc::now(),
        }
    }
}

impl IncomingBlob for BufferedIncomingBlob {
    fn id(&self) -> &str {
        &self.id
    }

    fn appending_stream(&mut self) -> Result<Box<dyn Write + '_>> {
        self.last_accessed = Utc::now();
        Ok(Box::new(&mut self.builder))
    }

    fn current_size(&self) -> Result<u64> {
        Ok(self.builder.total_bytes())
    }

    fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    fn set_expected_size(&mut self, size: u64) {
        self.expected_size = Some(size);
        self.builder.set_size_hint(size);
    }

    fn last_accessed(&self) -> DateTime<Utc> {
        self.last_accessed
    }

    fn blob(&mut self) -> Result<Blob> {
        self.last_accessed = Utc::now();
        self.builder.finish()
    }

    fn cancel(&mut self) {
        self.builder.dispose();
    }
}
