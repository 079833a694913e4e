//! The storage backend contract
//!
//! Content moves through three stages: an incoming [`Blob`] on local disk,
//! a [`StagedBlob`] durably placed in the backend, and a [`MailboxBlob`]
//! bound to a mail item revision. Backends opt into extra behaviour by
//! exposing capability traits; [`StoreManager::supports`] is derived from
//! which capabilities a backend hands out.

use std::io::Read;

use anyhow::Result;

use super::blob::{Blob, BlobBuilder};
use super::digest::ContentDigest;
use super::handles::{MailboxBlob, StagedBlob};
use super::incoming::{BufferedIncomingBlob, IncomingBlob};
use crate::models::{Mailbox, MailboxBlobInfo};

/// Features callers branch on instead of on backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreFeature {
    /// Content is visible to every mail server, not just this host
    Centralized,
    /// `delete_store` removes a whole mailbox's content efficiently
    BulkDelete,
    /// Incoming uploads stream straight to the backend
    ResumableUpload,
    /// The backend deduplicates on create; callers skip local duplicate checks
    SingleInstanceServerCreate,
}

/// Locators are a pure function of content bytes
pub trait ContentAddressable: Send + Sync {
    /// Locator for content with the given hash
    fn locator_for_hash(&self, hash: &ContentDigest) -> String;

    /// Locator the given blob would be stored under
    fn locator_for_blob(&self, blob: &Blob) -> Result<String> {
        Ok(self.locator_for_hash(&blob.digest()?))
    }
}

/// One physical copy per digest, reference counted by the backend
pub trait SingleInstance: Send + Sync {
    /// Fetch existing content by hash
    ///
    /// A successful fetch adds one reference on the backend. Returns `None`
    /// when no content with that hash exists.
    fn get_sis_blob(&self, hash: &ContentDigest) -> Result<Option<Blob>>;
}

/// Incoming content streams to the backend while it is being received
pub trait ResumableUpload: Send + Sync {
    /// Commit an uploaded blob remotely, returning its permanent locator
    fn finish_upload(&self, blob: &Blob) -> Result<String>;
}

/// A blob storage backend
///
/// Calls run on the caller's thread and may block on I/O. Ordering of
/// stage/link calls within a mailbox is the caller's job.
pub trait StoreManager: Send + Sync {
    fn startup(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    /// Features that are not tied to a capability trait
    fn declared_features(&self) -> &[StoreFeature] {
        &[]
    }

    fn supports(&self, feature: StoreFeature) -> bool {
        match feature {
            StoreFeature::ResumableUpload => self.resumable().is_some(),
            StoreFeature::SingleInstanceServerCreate => self.single_instance().is_some(),
            other => self.declared_features().contains(&other),
        }
    }

    fn content_addressable(&self) -> Option<&dyn ContentAddressable> {
        None
    }

    fn single_instance(&self) -> Option<&dyn SingleInstance> {
        None
    }

    fn resumable(&self) -> Option<&dyn ResumableUpload> {
        None
    }

    /// Builder for streaming or chunked incoming content
    fn blob_builder(&self) -> Result<BlobBuilder>;

    /// Materialize arbitrary input as a local blob
    ///
    /// `store_as_is` disables compression. Only local durability.
    fn store_incoming(&self, data: &mut dyn Read, store_as_is: bool) -> Result<Blob> {
        let mut builder = self.blob_builder()?;
        builder.disable_compression(store_as_is);
        builder.append_reader(data)?;
        builder.finish()
    }

    /// Start a (possibly remote-streaming) upload identified by `id`
    fn new_incoming_blob(&self, id: &str) -> Result<Box<dyn IncomingBlob>> {
        Ok(Box::new(BufferedIncomingBlob::new(id, self.blob_builder()?)))
    }

    /// Durably place a local blob into the backend, scoped to `mbox`
    ///
    /// Retrying with identical content must be safe.
    fn stage(&self, blob: &Blob, mbox: &Mailbox) -> Result<StagedBlob>;

    /// Stage straight from a stream; `actual_size` is a hint and may be absent
    fn stage_stream(
        &self,
        data: &mut dyn Read,
        actual_size: Option<u64>,
        mbox: &Mailbox,
    ) -> Result<StagedBlob>;

    /// Bind staged content to an item revision
    fn link(&self, src: &StagedBlob, dest: &Mailbox, item_id: i32, revision: i32)
    -> Result<MailboxBlob>;

    /// Duplicate linked content to another item, possibly in another mailbox
    fn copy(&self, src: &MailboxBlob, dest: &Mailbox, item_id: i32, revision: i32)
    -> Result<MailboxBlob>;

    /// Like `link`, but the staged content may be moved rather than shared
    fn rename_to(
        &self,
        src: &StagedBlob,
        dest: &Mailbox,
        item_id: i32,
        revision: i32,
    ) -> Result<MailboxBlob>;

    /// Remove a local incoming blob. Returns false if it was already gone.
    fn delete_blob(&self, blob: &Blob) -> Result<bool> {
        delete_quietly(blob.path())
    }

    /// Remove abandoned staged content. Returns false if it was already gone.
    fn delete_staged(&self, staged: &StagedBlob) -> Result<bool>;

    /// Irreversibly remove an item revision's content. Returns false if it was
    /// already gone.
    fn delete_mailbox_blob(&self, mblob: &MailboxBlob) -> Result<bool>;

    /// Reconstruct a handle from persisted metadata
    ///
    /// With `validate`, returns `None` when the content is missing.
    fn get_mailbox_blob(
        &self,
        mbox: &Mailbox,
        item_id: i32,
        revision: i32,
        locator: &str,
        validate: bool,
    ) -> Result<Option<MailboxBlob>>;

    /// Local copy of linked content
    fn local_blob(&self, mblob: &MailboxBlob) -> Result<Blob>;

    /// Stream linked content
    fn content(&self, mblob: &MailboxBlob) -> Result<Box<dyn Read + Send>>;

    /// Stream an incoming blob's content
    fn blob_content(&self, blob: &Blob) -> Result<Box<dyn Read + Send>> {
        blob.input_stream()
    }

    /// Remove every listed blob of a mailbox
    fn delete_store(&self, mbox: &Mailbox, blobs: &[MailboxBlobInfo]) -> Result<bool>;
}

/// Remove a file, treating "already absent" as `Ok(false)`
pub(crate) fn delete_quietly(path: &std::path::Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("Failed to delete {}", path.display())))
        }
    }
}
