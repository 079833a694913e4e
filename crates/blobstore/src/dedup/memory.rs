//! In-memory catalog
//!
//! Used by tests and by embedders that keep item metadata elsewhere.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Result, anyhow};

use super::catalog::{BlobCatalog, in_range, locator_volume};
use crate::models::{
    BlobReference, Mailbox, MailboxBlobInfo, MailboxId, Volume, VolumeId, VolumeMetadata,
};

/// (mailbox, item, revision)
type ItemKey = (MailboxId, i32, i32);

struct ItemBlob {
    info: MailboxBlobInfo,
    volume_id: VolumeId,
    created: i64,
}

#[derive(Default)]
struct Tables {
    volumes: BTreeMap<VolumeId, Volume>,
    mailboxes: HashMap<MailboxId, Mailbox>,
    item_blobs: BTreeMap<ItemKey, ItemBlob>,
    /// Keyed by id; ids are never reused
    refs: BTreeMap<i64, BlobReference>,
    next_ref_id: i64,
}

#[derive(Default)]
pub struct InMemoryBlobCatalog {
    tables: RwLock<Tables>,
}

impl InMemoryBlobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("catalog lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| anyhow!("catalog lock poisoned"))
    }
}

impl BlobCatalog for InMemoryBlobCatalog {
    fn upsert_volume(&self, volume: &Volume) -> Result<()> {
        let mut tables = self.write()?;
        let metadata = tables
            .volumes
            .get(&volume.id)
            .map(|v| v.metadata)
            .unwrap_or(volume.metadata);
        let mut volume = volume.clone();
        volume.metadata = metadata;
        tables.volumes.insert(volume.id, volume);
        Ok(())
    }

    fn volume(&self, id: VolumeId) -> Result<Option<Volume>> {
        Ok(self.read()?.volumes.get(&id).cloned())
    }

    fn volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.read()?.volumes.values().cloned().collect())
    }

    fn update_volume_metadata(&self, id: VolumeId, metadata: VolumeMetadata) -> Result<()> {
        let mut tables = self.write()?;
        let volume = tables
            .volumes
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown volume {}", id))?;
        volume.metadata = metadata;
        Ok(())
    }

    fn upsert_mailbox(&self, mailbox: &Mailbox) -> Result<()> {
        self.write()?.mailboxes.insert(mailbox.id, mailbox.clone());
        Ok(())
    }

    fn mailbox_group_ids(&self) -> Result<Vec<i32>> {
        let groups: BTreeSet<i32> = self.read()?.mailboxes.values().map(|m| m.group_id).collect();
        Ok(groups.into_iter().collect())
    }

    fn record_item_blob(
        &self,
        info: &MailboxBlobInfo,
        volume_id: VolumeId,
        created: i64,
    ) -> Result<()> {
        let key = (info.mailbox_id, info.item_id, info.revision);
        self.write()?.item_blobs.insert(
            key,
            ItemBlob {
                info: info.clone(),
                volume_id,
                created,
            },
        );
        Ok(())
    }

    fn all_blobs(
        &self,
        group_id: Option<i32>,
        volume_id: VolumeId,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<MailboxBlobInfo>> {
        let tables = self.read()?;
        let in_group = |mailbox_id: &MailboxId| match group_id {
            None => true,
            Some(group) => tables
                .mailboxes
                .get(mailbox_id)
                .is_some_and(|m| m.group_id == group),
        };
        Ok(tables
            .item_blobs
            .values()
            .filter(|b| b.volume_id == volume_id)
            .filter(|b| in_range(b.created, from, to))
            .filter(|b| in_group(&b.info.mailbox_id))
            .map(|b| b.info.clone())
            .collect())
    }

    fn add_blob_reference(&self, info: &MailboxBlobInfo) -> Result<bool> {
        let volume_id = locator_volume(&info.locator)?;
        let mut tables = self.write()?;
        let exists = tables.refs.values().any(|r| {
            r.volume_id == volume_id
                && r.mailbox_id == info.mailbox_id
                && r.item_id == info.item_id
                && r.revision == info.revision
        });
        if exists {
            return Ok(false);
        }
        tables.next_ref_id += 1;
        let id = tables.next_ref_id;
        tables.refs.insert(
            id,
            BlobReference {
                id,
                mailbox_id: info.mailbox_id,
                volume_id,
                item_id: info.item_id,
                revision: info.revision,
                digest: info.digest.clone(),
                processed: false,
                file_info: None,
            },
        );
        Ok(true)
    }

    fn blob_references(&self, digest: &str, volume_id: VolumeId) -> Result<Vec<BlobReference>> {
        Ok(self
            .read()?
            .refs
            .values()
            .filter(|r| r.volume_id == volume_id && r.digest == digest)
            .cloned()
            .collect())
    }

    fn volume_blob_references(&self, volume_id: VolumeId) -> Result<Vec<BlobReference>> {
        Ok(self
            .read()?
            .refs
            .values()
            .filter(|r| r.volume_id == volume_id)
            .cloned()
            .collect())
    }

    fn unique_digests(&self, volume_id: VolumeId) -> Result<Vec<String>> {
        let digests: BTreeSet<String> = self
            .read()?
            .refs
            .values()
            .filter(|r| r.volume_id == volume_id)
            .map(|r| r.digest.clone())
            .collect();
        Ok(digests.into_iter().collect())
    }

    fn update_processed(&self, id: i64, processed: bool) -> Result<()> {
        if let Some(reference) = self.write()?.refs.get_mut(&id) {
            reference.processed = processed;
        }
        Ok(())
    }

    fn delete_blob_ref(&self, id: i64) -> Result<bool> {
        Ok(self.write()?.refs.remove(&id).is_some())
    }

    fn delete_blob_refs(&self, volume_id: VolumeId) -> Result<usize> {
        let mut tables = self.write()?;
        let before = tables.refs.len();
        tables.refs.retain(|_, r| r.volume_id != volume_id);
        Ok(before - tables.refs.len())
    }

    fn delete_all_blob_refs(&self) -> Result<usize> {
        let mut tables = self.write()?;
        let count = tables.refs.len();
        tables.refs.clear();
        Ok(count)
    }
}
