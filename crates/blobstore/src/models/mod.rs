//! Domain models shared by the stores and the deduper

mod mailbox;
mod reference;
mod volume;

pub use mailbox::{Mailbox, MailboxBlobInfo, MailboxId};
pub use reference::{BlobReference, FileInfo};
pub use volume::{Volume, VolumeId, VolumeKind, VolumeMetadata};
