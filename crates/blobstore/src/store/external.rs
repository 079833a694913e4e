//! Store manager for remote object stores
//!
//! The backend decides locators (usually random or path-like). Staging
//! pushes content to the backend and keeps a copy in the local
//! [`ContentCache`]; linking only records the locator because the remote
//! object is already where it needs to be.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};

use super::blob::{Blob, BlobBuilder};
use super::cache::ContentCache;
use super::digest::DigestingReader;
use super::handles::{MailboxBlob, StagedBlob};
use super::incoming::{BufferedIncomingBlob, IncomingBlob};
use super::resumable::{ExternalResumableIncomingBlob, ResumableBackend};
use super::traits::{ResumableUpload, StoreFeature, StoreManager};
use crate::error::{BackendError, is_not_found};
use crate::models::{Mailbox, MailboxBlobInfo};

/// The primitives a remote object store has to provide
pub trait ExternalBackend: Send + Sync {
    /// Write content and return the locator it is stored under
    ///
    /// `actual_size` is a hint; implementations must read `data` to the end.
    fn write_stream_to_store(
        &self,
        data: &mut dyn Read,
        actual_size: Option<u64>,
        mbox: &Mailbox,
    ) -> Result<String>;

    /// Content at a locator, `None` if nothing is stored there
    fn read_stream_from_store(
        &self,
        locator: &str,
        mbox: &Mailbox,
    ) -> Result<Option<Box<dyn Read + Send>>>;

    /// Returns false if nothing was stored at the locator
    fn delete_from_store(&self, locator: &str, mbox: &Mailbox) -> Result<bool>;

    fn declared_features(&self) -> &[StoreFeature] {
        &[]
    }

    /// Streaming upload support, if the backend has it
    fn resumable(&self) -> Option<&dyn ResumableBackend> {
        None
    }
}

pub struct ExternalStoreManager<B> {
    backend: B,
    incoming_dir: PathBuf,
    cache: ContentCache,
}

impl<B: ExternalBackend> ExternalStoreManager<B> {
    pub fn new(
        backend: B,
        incoming_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let incoming_dir = incoming_dir.into();
        std::fs::create_dir_all(&incoming_dir).with_context(|| {
            format!("Failed to create incoming directory {}", incoming_dir.display())
        })?;
        Ok(Self {
            backend,
            incoming_dir,
            cache: ContentCache::new(cache_dir)?,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Drop every locally cached copy
    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear()
    }

    fn fetch(&self, locator: &str, mbox: &Mailbox) -> Result<Blob> {
        self.cache.get_or_fetch(locator, || {
            debug!("[EXTERNAL] Cache miss for {}, reading from backend", locator);
            self.backend.read_stream_from_store(locator, mbox)
        })
    }

    fn register(
        &self,
        staged: &StagedBlob,
        dest: &Mailbox,
        item_id: i32,
        revision: i32,
    ) -> MailboxBlob {
        MailboxBlob::new(dest, item_id, revision, staged.locator(), staged.size())
            .with_digest(staged.digest())
    }

    fn release(&self, locator: &str, mbox: &Mailbox) -> Result<bool> {
        self.cache.remove(locator)?;
        self.backend
            .delete_from_store(locator, mbox)
            .map_err(|e| BackendError::with_source(format!("deleting {}", locator), e).into())
    }
}

impl<B: ExternalBackend> ResumableUpload for ExternalStoreManager<B> {
    fn finish_upload(&self, blob: &Blob) -> Result<String> {
        let resumable = self
            .backend
            .resumable()
            .ok_or_else(|| anyhow!("backend does not support resumable uploads"))?;
        let upload_id = blob
            .upload_id()
            .ok_or_else(|| anyhow!("blob {} was not uploaded remotely", blob.path().display()))?;
        resumable.finish_upload(upload_id).map_err(|e| {
            BackendError::with_source(format!("finishing upload {}", upload_id), e).into()
        })
    }
}

impl<B: ExternalBackend> StoreManager for ExternalStoreManager<B> {
    fn startup(&self) -> Result<()> {
        info!("[EXTERNAL] Store manager started, incoming {}", self.incoming_dir.display());
        Ok(())
    }

    fn shutdown(&self) {
        if let Err(e) = self.cache.clear() {
            warn!("[EXTERNAL] Failed to clear cache on shutdown: {}", e);
        }
    }

    fn declared_features(&self) -> &[StoreFeature] {
        self.backend.declared_features()
    }

    fn resumable(&self) -> Option<&dyn ResumableUpload> {
        self.backend.resumable().map(|_| self as &dyn ResumableUpload)
    }

    fn blob_builder(&self) -> Result<BlobBuilder> {
        // Remote objects are stored as the raw bytes
        let mut builder = BlobBuilder::create(&self.incoming_dir)?;
        builder.disable_compression(true);
        Ok(builder)
    }

    fn new_incoming_blob(&self, id: &str) -> Result<Box<dyn IncomingBlob>> {
        match self.backend.resumable() {
            Some(resumable) => {
                let remote = resumable
                    .begin_upload(id)
                    .map_err(|e| BackendError::with_source(format!("starting upload {}", id), e))?;
                let builder = self.blob_builder()?;
                Ok(Box::new(ExternalResumableIncomingBlob::new(id, builder, remote)))
            }
            None => Ok(Box::new(BufferedIncomingBlob::new(id, self.blob_builder()?))),
        }
    }

    fn stage(&self, blob: &Blob, mbox: &Mailbox) -> Result<StagedBlob> {
        if blob.upload_id().is_some() && self.backend.resumable().is_some() {
            // Content already streamed during upload; only commit it
            let locator = self.finish_upload(blob)?;
            self.cache.put(&locator, blob)?;
            let (digest, size) = (blob.digest_string()?, blob.raw_size()?);
            return Ok(StagedBlob::new(mbox, digest, size, locator));
        }

        let mut reader = DigestingReader::new(blob.input_stream()?);
        let locator = self
            .backend
            .write_stream_to_store(&mut reader, blob.raw_size().ok(), mbox)
            .map_err(|e| {
                BackendError::with_source(format!("staging {}", blob.path().display()), e)
            })?;
        let (digest, size) = reader.finish();
        self.cache.put(&locator, blob)?;
        debug!("[EXTERNAL] Staged {} bytes for mailbox {} at {}", size, mbox.id, locator);
        Ok(StagedBlob::new(mbox, digest.to_base64url(), size, locator))
    }

    fn stage_stream(
        &self,
        data: &mut dyn Read,
        actual_size: Option<u64>,
        mbox: &Mailbox,
    ) -> Result<StagedBlob> {
        let mut builder = self.blob_builder()?;
        if let Some(size) = actual_size {
            builder.set_size_hint(size);
        }
        builder.append_reader(data)?;
        let blob = builder.finish()?;
        let staged = self.stage(&blob, mbox);
        self.delete_blob(&blob)?;
        staged
    }

    fn link(
        &self,
        src: &StagedBlob,
        dest: &Mailbox,
        item_id: i32,
        revision: i32,
    ) -> Result<MailboxBlob> {
        Ok(self.register(src, dest, item_id, revision))
    }

    fn copy(
        &self,
        src: &MailboxBlob,
        dest: &Mailbox,
        item_id: i32,
        revision: i32,
    ) -> Result<MailboxBlob> {
        let mut content = self.content(src)?;
        let staged = self.stage_stream(&mut content, src.size(), dest)?;
        self.link(&staged, dest, item_id, revision)
    }

    fn rename_to(
        &self,
        src: &StagedBlob,
        dest: &Mailbox,
        item_id: i32,
        revision: i32,
    ) -> Result<MailboxBlob> {
        Ok(self.register(src, dest, item_id, revision))
    }

    fn delete_staged(&self, staged: &StagedBlob) -> Result<bool> {
        if !staged.is_inserted() {
            return Ok(false);
        }
        self.release(staged.locator(), staged.mailbox())
    }

    fn delete_mailbox_blob(&self, mblob: &MailboxBlob) -> Result<bool> {
        self.release(mblob.locator(), mblob.mailbox())
    }

    fn get_mailbox_blob(
        &self,
        mbox: &Mailbox,
        item_id: i32,
        revision: i32,
        locator: &str,
        validate: bool,
    ) -> Result<Option<MailboxBlob>> {
        if !validate {
            let size = match self.cache.get(locator)? {
                Some(blob) => Some(blob.raw_size()?),
                None => None,
            };
            return Ok(Some(MailboxBlob::new(mbox, item_id, revision, locator, size)));
        }
        match self.fetch(locator, mbox) {
            Ok(blob) => Ok(Some(
                MailboxBlob::new(mbox, item_id, revision, locator, blob.raw_size()?)
                    .with_digest(blob.digest_string()?),
            )),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_blob(&self, mblob: &MailboxBlob) -> Result<Blob> {
        self.fetch(mblob.locator(), mblob.mailbox())
    }

    fn content(&self, mblob: &MailboxBlob) -> Result<Box<dyn Read + Send>> {
        self.fetch(mblob.locator(), mblob.mailbox())?.input_stream()
    }

    fn delete_store(&self, mbox: &Mailbox, blobs: &[MailboxBlobInfo]) -> Result<bool> {
        for info in blobs {
            self.cache.remove(&info.locator)?;
            if let Err(e) = self.backend.delete_from_store(&info.locator, mbox) {
                warn!(
                    "[EXTERNAL] Failed to delete {} for mailbox {}: {}",
                    info.locator, mbox.id, e
                );
            }
        }
        Ok(true)
    }
}
