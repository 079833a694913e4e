//! Identity of content after staging and after linking

use std::path::{Path, PathBuf};

use super::blob::Blob;
use crate::models::{Mailbox, MailboxBlobInfo};

/// Content durably placed in a store but not yet bound to a mail item
///
/// `digest` and `size` describe exactly what is retrievable at `locator`.
/// A staged blob that is never linked is garbage, not an error.
#[derive(Debug, Clone)]
pub struct StagedBlob {
    mailbox: Mailbox,
    digest: String,
    size: u64,
    locator: String,
    local: Option<Blob>,
    inserted: bool,
    staged_directly: bool,
}

impl StagedBlob {
    pub fn new(
        mailbox: &Mailbox,
        digest: impl Into<String>,
        size: u64,
        locator: impl Into<String>,
    ) -> Self {
        Self {
            mailbox: mailbox.clone(),
            digest: digest.into(),
            size,
            locator: locator.into(),
            local: None,
            inserted: true,
            staged_directly: false,
        }
    }

    /// Stores that stage in place keep the local blob to link from
    pub fn with_local(mut self, blob: Blob) -> Self {
        self.local = Some(blob);
        self
    }

    /// The store spooled this content itself (`stage_stream`), so the
    /// local file belongs to the staged blob and goes with it
    pub fn staged_directly(mut self) -> Self {
        self.staged_directly = true;
        self
    }

    /// Marks content that already existed remotely (single-instance hit),
    /// so deleting the staged blob must not remove someone else's copy
    pub fn already_present(mut self) -> Self {
        self.inserted = false;
        self
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn local_blob(&self) -> Option<&Blob> {
        self.local.as_ref()
    }

    /// False when staging matched content that was already in the store
    pub fn is_inserted(&self) -> bool {
        self.inserted
    }

    pub fn is_staged_directly(&self) -> bool {
        self.staged_directly
    }
}

/// Content permanently bound to (mailbox, item, revision)
#[derive(Debug, Clone)]
pub struct MailboxBlob {
    mailbox: Mailbox,
    item_id: i32,
    revision: i32,
    locator: String,
    size: Option<u64>,
    digest: Option<String>,
    path: Option<PathBuf>,
}

impl MailboxBlob {
    /// `size` may be `None` when the content was not looked at
    pub fn new(
        mailbox: &Mailbox,
        item_id: i32,
        revision: i32,
        locator: impl Into<String>,
        size: impl Into<Option<u64>>,
    ) -> Self {
        Self {
            mailbox: mailbox.clone(),
            item_id,
            revision,
            locator: locator.into(),
            size: size.into(),
            digest: None,
            path: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Volume stores know the file the content lives in
    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn item_id(&self) -> i32 {
        self.item_id
    }

    pub fn revision(&self) -> i32 {
        self.revision
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Uncompressed length, unknown for unvalidated lookups of uncached content
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Metadata row describing this blob
    ///
    /// An unknown size is recorded as zero.
    pub fn info(&self) -> MailboxBlobInfo {
        MailboxBlobInfo {
            mailbox_id: self.mailbox.id,
            item_id: self.item_id,
            revision: self.revision,
            locator: self.locator.clone(),
            digest: self.digest.clone().unwrap_or_default(),
            size: self.size.unwrap_or_default(),
        }
    }
}
