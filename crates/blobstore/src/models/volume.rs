//! Local storage volumes and the dedup resumability cursor

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::MailboxId;

pub type VolumeId = i16;

/// What a volume holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    Message,
    MessageSecondary,
    Index,
}

impl VolumeKind {
    /// Message volumes are the ones that hold blobs
    pub fn holds_blobs(&self) -> bool {
        matches!(self, VolumeKind::Message | VolumeKind::MessageSecondary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeKind::Message => "message",
            VolumeKind::MessageSecondary => "message_secondary",
            VolumeKind::Index => "index",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(VolumeKind::Message),
            "message_secondary" => Some(VolumeKind::MessageSecondary),
            "index" => Some(VolumeKind::Index),
            _ => None,
        }
    }
}

/// Where an interrupted dedup scan of a volume left off
///
/// Dates are unix seconds. `current_sync_date == 0` means no scan is in
/// flight; otherwise it is the cutoff the in-flight scan was started with
/// and `group_id` is the last mailbox group fully scanned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub last_sync_date: i64,
    pub current_sync_date: i64,
    pub group_id: i32,
}

impl VolumeMetadata {
    pub fn new(last_sync_date: i64, current_sync_date: i64, group_id: i32) -> Self {
        Self {
            last_sync_date,
            current_sync_date,
            group_id,
        }
    }

    /// True when a previous scan stopped part way through
    pub fn is_resuming(&self) -> bool {
        self.current_sync_date != 0
    }
}

/// A local filesystem partition holding message blobs
///
/// Blob paths are spread over two directory levels derived from the mailbox
/// id and the item id, `bits` and `group_bits` controlling the fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub kind: VolumeKind,
    pub root: PathBuf,
    #[serde(default = "default_group_bits")]
    pub mailbox_group_bits: u8,
    #[serde(default = "default_bits")]
    pub mailbox_bits: u8,
    #[serde(default = "default_group_bits")]
    pub file_group_bits: u8,
    #[serde(default = "default_bits")]
    pub file_bits: u8,
    #[serde(default)]
    pub compress_blobs: bool,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: u64,
    #[serde(default)]
    pub metadata: VolumeMetadata,
}

fn default_bits() -> u8 {
    12
}

fn default_group_bits() -> u8 {
    8
}

fn default_compression_threshold() -> u64 {
    4096
}

impl Volume {
    pub fn new(id: VolumeId, kind: VolumeKind, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            kind,
            root: root.into(),
            mailbox_group_bits: default_group_bits(),
            mailbox_bits: default_bits(),
            file_group_bits: default_group_bits(),
            file_bits: default_bits(),
            compress_blobs: false,
            compression_threshold: default_compression_threshold(),
            metadata: VolumeMetadata::default(),
        }
    }

    pub fn with_compression(mut self, threshold: u64) -> Self {
        self.compress_blobs = true;
        self.compression_threshold = threshold;
        self
    }

    /// Directory holding all message blobs of a mailbox
    ///
    /// `<root>/<mbox >> mailbox_bits masked>/<mbox>/msg`
    pub fn mailbox_dir(&self, mailbox_id: MailboxId) -> PathBuf {
        let id = mailbox_id.0 as i64;
        let group = (id >> self.mailbox_bits) & mask(self.mailbox_group_bits);
        self.root
            .join(group.to_string())
            .join(id.to_string())
            .join("msg")
    }

    /// Full path of an item revision's blob
    ///
    /// `<mailbox_dir>/<item >> file_bits masked>/<item>-<revision>.msg`
    pub fn blob_path(&self, mailbox_id: MailboxId, item_id: i32, revision: i32) -> PathBuf {
        let item = item_id as i64;
        let group = (item >> self.file_bits) & mask(self.file_group_bits);
        self.mailbox_dir(mailbox_id)
            .join(group.to_string())
            .join(format!("{item_id}-{revision}.msg"))
    }

    /// Where a revision's blob goes, `<item>-<revision>.msg.zst` when compressed
    pub fn blob_path_for(
        &self,
        mailbox_id: MailboxId,
        item_id: i32,
        revision: i32,
        compressed: bool,
    ) -> PathBuf {
        let path = self.blob_path(mailbox_id, item_id, revision);
        if compressed {
            path.with_extension("msg.zst")
        } else {
            path
        }
    }

    /// Path of the file a revision is actually stored in
    ///
    /// Falls back to the uncompressed name when neither file exists.
    pub fn stored_blob_path(&self, mailbox_id: MailboxId, item_id: i32, revision: i32) -> PathBuf {
        let compressed = self.blob_path_for(mailbox_id, item_id, revision, true);
        if compressed.is_file() {
            compressed
        } else {
            self.blob_path(mailbox_id, item_id, revision)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn mask(bits: u8) -> i64 {
    (1i64 << bits) - 1
}
