//! Dedup bookkeeping rows

use super::{MailboxId, VolumeId};

/// Inode facts about one physical file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub inode: u64,
    pub size: u64,
}

/// One physical blob instance on a volume, tracked by the deduper
///
/// `processed` means the file already points at the canonical inode for
/// its digest, or was the only file with that digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReference {
    pub id: i64,
    pub mailbox_id: MailboxId,
    pub volume_id: VolumeId,
    pub item_id: i32,
    pub revision: i32,
    pub digest: String,
    pub processed: bool,
    /// Filled lazily while deduping
    pub file_info: Option<FileInfo>,
}
