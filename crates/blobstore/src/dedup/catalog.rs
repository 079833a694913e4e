//! Bookkeeping the deduper reads and writes
//!
//! Three kinds of rows: volumes (with their scan cursor), the mail-item
//! blob records the mailbox layer keeps, and the per-volume blob references
//! the deduper builds from them.

use anyhow::Result;

use crate::models::{BlobReference, Mailbox, MailboxBlobInfo, Volume, VolumeId, VolumeMetadata};

/// Persistence used by [`BlobDeduper`](super::BlobDeduper)
///
/// Date bounds are unix seconds and inclusive; `None` leaves that side open.
pub trait BlobCatalog: Send + Sync {
    // Volumes

    /// Insert or update a volume's layout; an existing scan cursor is kept
    fn upsert_volume(&self, volume: &Volume) -> Result<()>;

    fn volume(&self, id: VolumeId) -> Result<Option<Volume>>;

    fn volumes(&self) -> Result<Vec<Volume>>;

    fn update_volume_metadata(&self, id: VolumeId, metadata: VolumeMetadata) -> Result<()>;

    // Mail items

    fn upsert_mailbox(&self, mailbox: &Mailbox) -> Result<()>;

    /// Distinct mailbox group ids, ascending
    fn mailbox_group_ids(&self) -> Result<Vec<i32>>;

    /// Record that an item revision's blob lives on `volume_id`
    fn record_item_blob(
        &self,
        info: &MailboxBlobInfo,
        volume_id: VolumeId,
        created: i64,
    ) -> Result<()>;

    /// Item blobs on a volume, optionally limited to one mailbox group and
    /// a creation date range
    fn all_blobs(
        &self,
        group_id: Option<i32>,
        volume_id: VolumeId,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<MailboxBlobInfo>>;

    // Blob references

    /// Returns false when the reference already existed
    ///
    /// The volume is taken from `info.locator`.
    fn add_blob_reference(&self, info: &MailboxBlobInfo) -> Result<bool>;

    fn blob_references(&self, digest: &str, volume_id: VolumeId) -> Result<Vec<BlobReference>>;

    fn volume_blob_references(&self, volume_id: VolumeId) -> Result<Vec<BlobReference>>;

    fn unique_digests(&self, volume_id: VolumeId) -> Result<Vec<String>>;

    fn update_processed(&self, id: i64, processed: bool) -> Result<()>;

    fn delete_blob_ref(&self, id: i64) -> Result<bool>;

    /// Drop every reference on a volume, returning how many went
    fn delete_blob_refs(&self, volume_id: VolumeId) -> Result<usize>;

    fn delete_all_blob_refs(&self) -> Result<usize>;
}

/// Volume id a file-store locator names
pub(crate) fn locator_volume(locator: &str) -> Result<VolumeId> {
    locator
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("locator {:?} is not a volume id", locator))
}

/// Whether `date` lies in the inclusive range
pub(crate) fn in_range(date: i64, from: Option<i64>, to: Option<i64>) -> bool {
    from.is_none_or(|f| date >= f) && to.is_none_or(|t| date <= t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_volume() {
        assert_eq!(locator_volume("3").unwrap(), 3);
        assert!(locator_volume("abc").is_err());
    }

    #[test]
    fn test_in_range_is_inclusive() {
        assert!(in_range(10, Some(10), Some(20)));
        assert!(in_range(20, Some(10), Some(20)));
        assert!(!in_range(21, Some(10), Some(20)));
        assert!(in_range(-5, None, None));
    }
}
