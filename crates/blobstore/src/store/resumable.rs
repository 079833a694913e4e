//! Uploads that stream to a remote store as they arrive
//!
//! Every byte is written twice: once into a local [`BlobBuilder`] and once
//! to the backend's [`RemoteUpload`]. The two byte counts are compared
//! whenever the caller asks for the current size, so a client resuming an
//! upload never continues from a position the remote side disagrees with.

use std::io::{self, Write};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::blob::{Blob, BlobBuilder};
use super::incoming::IncomingBlob;
use crate::error::UploadSizeMismatch;

/// Remote half of one in-progress upload
pub trait RemoteUpload: Send {
    /// Backend identifier for this upload, used later to commit it
    fn upload_id(&self) -> &str;

    fn write_to_external(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes the backend has durably received
    fn remote_size(&self) -> Result<u64>;

    /// Discard the remote half
    fn abort(&mut self) {}
}

/// Backends that accept streaming uploads
pub trait ResumableBackend: Send + Sync {
    fn begin_upload(&self, id: &str) -> Result<Box<dyn RemoteUpload>>;

    /// Commit an upload, returning the permanent locator
    fn finish_upload(&self, upload_id: &str) -> Result<String>;
}

/// Incoming blob mirrored to a remote upload
pub struct ExternalResumableIncomingBlob {
    id: String,
    builder: BlobBuilder,
    remote: Box<dyn RemoteUpload>,
    expected_size: Option<u64>,
    last_accessed: DateTime<Utc>,
}

impl ExternalResumableIncomingBlob {
    pub fn new(id: impl Into<String>, builder: BlobBuilder, remote: Box<dyn RemoteUpload>) -> Self {
        Self {
            id: id.into(),
            builder,
            remote,
            expected_size: None,
            last_accessed: Utc::now(),
        }
    }

    pub fn upload_id(&self) -> &str {
        self.remote.upload_id()
    }
}

impl IncomingBlob for ExternalResumableIncomingBlob {
    fn id(&self) -> &str {
        &self.id
    }

    fn appending_stream(&mut self) -> Result<Box<dyn Write + '_>> {
        self.last_accessed = Utc::now();
        Ok(Box::new(ExternalResumableOutputStream {
            local: &mut self.builder,
            remote: &mut self.remote,
        }))
    }

    fn current_size(&self) -> Result<u64> {
        let local = self.builder.total_bytes();
        let remote = self.remote.remote_size()?;
        if local != remote {
            warn!(
                "[UPLOAD] {} size mismatch: local {} remote {}",
                self.id, local, remote
            );
            return Err(UploadSizeMismatch { local, remote }.into());
        }
        Ok(local)
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
        let blob = self.builder.finish()?;
        debug!(
            "[UPLOAD] {} finished locally, remote upload {}",
            self.id,
            self.remote.upload_id()
        );
        Ok(blob.into_uploaded(self.remote.upload_id()))
    }

    fn cancel(&mut self) {
        self.builder.dispose();
        self.remote.abort();
    }
}

/// Writer feeding both halves of a resumable upload
pub struct ExternalResumableOutputStream<'a> {
    local: &'a mut BlobBuilder,
    remote: &'a mut Box<dyn RemoteUpload>,
}

impl Write for ExternalResumableOutputStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.local.append(buf).map_err(io::Error::other)?;
        self.remote.write_to_external(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.local.flush()
    }
}
