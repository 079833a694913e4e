//! Local volume blob store
//!
//! Blobs live on local filesystem volumes; the locator is the volume id.
//! Directory layout per volume:
//! ```text
//! <root>/
//!   0/                     # mailbox id >> mailbox_bits
//!     5/msg/               # mailbox 5
//!       0/                 # item id >> file_bits
//!         300-2.msg        # item 300, revision 2
//!         301-1.msg.zst    # zstd-compressed blob
//! ```
//! Staging keeps the incoming file where it is; linking hard-links it into
//! the volume and falls back to a copy across filesystems. Whether a file is
//! compressed is part of its name, never guessed from its content.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, anyhow};
use log::{debug, warn};

use super::blob::{Blob, BlobBuilder, COMPRESSED_EXTENSION, is_compressed_path};
use super::handles::{MailboxBlob, StagedBlob};
use super::traits::{StoreManager, delete_quietly};
use crate::error::BlobNotFound;
use crate::fsport::{LinkPort, default_link_port};
use crate::models::{Mailbox, MailboxBlobInfo, MailboxId, Volume, VolumeId};

/// File-based blob storage over one or more volumes
pub struct FileBlobStore {
    incoming_dir: PathBuf,
    volumes: HashMap<VolumeId, Volume>,
    current_volume: RwLock<VolumeId>,
    links: Arc<dyn LinkPort>,
}

impl FileBlobStore {
    /// Create a store writing new blobs to `current_volume`
    pub fn new(
        incoming_dir: impl Into<PathBuf>,
        volumes: Vec<Volume>,
        current_volume: VolumeId,
    ) -> Result<Self> {
        let incoming_dir = incoming_dir.into();
        fs::create_dir_all(&incoming_dir).with_context(|| {
            format!("Failed to create incoming directory {}", incoming_dir.display())
        })?;

        let volumes: HashMap<_, _> = volumes.into_iter().map(|v| (v.id, v)).collect();
        if !volumes.contains_key(&current_volume) {
            return Err(anyhow!("current volume {} is not configured", current_volume));
        }
        for volume in volumes.values().filter(|v| v.kind.holds_blobs()) {
            fs::create_dir_all(&volume.root).with_context(|| {
                format!("Failed to create volume root {}", volume.root.display())
            })?;
        }

        Ok(Self {
            incoming_dir,
            volumes,
            current_volume: RwLock::new(current_volume),
            links: default_link_port(),
        })
    }

    /// Use a different link implementation (e.g. copy-only)
    pub fn with_link_port(mut self, links: Arc<dyn LinkPort>) -> Self {
        self.links = links;
        self
    }

    /// Switch the volume new blobs are linked into
    pub fn set_current_volume(&self, id: VolumeId) -> Result<()> {
        if !self.volumes.contains_key(&id) {
            return Err(anyhow!("volume {} is not configured", id));
        }
        let mut current = self
            .current_volume
            .write()
            .map_err(|_| anyhow!("current volume lock poisoned"))?;
        *current = id;
        Ok(())
    }

    pub fn current_volume(&self) -> Result<&Volume> {
        let id = *self
            .current_volume
            .read()
            .map_err(|_| anyhow!("current volume lock poisoned"))?;
        self.volume(id)
    }

    pub fn volume(&self, id: VolumeId) -> Result<&Volume> {
        self.volumes
            .get(&id)
            .ok_or_else(|| anyhow!("unknown volume {}", id))
    }

    fn volume_for_locator(&self, locator: &str) -> Result<&Volume> {
        let id: VolumeId = locator
            .parse()
            .with_context(|| format!("Invalid volume locator {:?}", locator))?;
        self.volume(id)
    }

    /// Path of an item revision's stored blob on the volume named by `locator`
    pub fn blob_path(
        &self,
        mailbox_id: MailboxId,
        item_id: i32,
        revision: i32,
        locator: &str,
    ) -> Result<PathBuf> {
        Ok(self
            .volume_for_locator(locator)?
            .stored_blob_path(mailbox_id, item_id, revision))
    }

    fn mailbox_blob_path(&self, mblob: &MailboxBlob) -> Result<PathBuf> {
        match mblob.path() {
            Some(path) => Ok(path.to_path_buf()),
            None => self.blob_path(
                mblob.mailbox().id,
                mblob.item_id(),
                mblob.revision(),
                mblob.locator(),
            ),
        }
    }

    /// Link (or copy) `src` to `dest`, replacing whatever was there
    fn place(&self, src: &Path, dest: &Path) -> Result<()> {
        prepare_target(dest)?;
        if dest.exists() {
            warn!("[STORE] Overwriting existing blob {}", dest.display());
            fs::remove_file(dest)?;
        }
        if let Err(e) = self.links.link(src, dest) {
            debug!(
                "[STORE] Link {} -> {} failed ({}), copying instead",
                src.display(),
                dest.display(),
                e
            );
            fs::copy(src, dest).with_context(|| {
                format!("Failed to copy {} to {}", src.display(), dest.display())
            })?;
        }
        Ok(())
    }

    fn staged_source<'a>(&self, staged: &'a StagedBlob) -> Result<&'a Blob> {
        staged
            .local_blob()
            .ok_or_else(|| anyhow!("staged blob {} has no local file", staged.locator()))
    }

    fn linked(
        &self,
        staged: &StagedBlob,
        dest: &Mailbox,
        item_id: i32,
        revision: i32,
        path: PathBuf,
    ) -> MailboxBlob {
        MailboxBlob::new(dest, item_id, revision, staged.locator(), staged.size())
            .with_digest(staged.digest())
            .with_path(path)
    }
}

impl StoreManager for FileBlobStore {
    fn blob_builder(&self) -> Result<BlobBuilder> {
        let volume = self.current_volume()?;
        let threshold = volume
            .compress_blobs
            .then_some(volume.compression_threshold);
        Ok(BlobBuilder::create(&self.incoming_dir)?.with_compression_threshold(threshold))
    }

    fn stage(&self, blob: &Blob, mbox: &Mailbox) -> Result<StagedBlob> {
        let volume = self.current_volume()?;
        // The digest was taken while the incoming file was written
        let digest = blob.digest_string()?;
        let size = blob.raw_size()?;
        Ok(StagedBlob::new(mbox, digest, size, volume.id.to_string()).with_local(blob.clone()))
    }

    fn stage_stream(
        &self,
        data: &mut dyn Read,
        _actual_size: Option<u64>,
        mbox: &Mailbox,
    ) -> Result<StagedBlob> {
        let blob = self.store_incoming(data, false)?;
        Ok(self.stage(&blob, mbox)?.staged_directly())
    }

    fn link(
        &self,
        src: &StagedBlob,
        dest: &Mailbox,
        item_id: i32,
        revision: i32,
    ) -> Result<MailboxBlob> {
        let source = self.staged_source(src)?;
        let path = self
            .volume_for_locator(src.locator())?
            .blob_path_for(dest.id, item_id, revision, source.is_compressed());
        self.place(source.path(), &path)?;
        debug!(
            "[STORE] Linked {} to mailbox {} item {}-{}",
            source.path().display(),
            dest.id.0,
            item_id,
            revision
        );
        Ok(self.linked(src, dest, item_id, revision, path))
    }

    fn copy(
        &self,
        src: &MailboxBlob,
        dest: &Mailbox,
        item_id: i32,
        revision: i32,
    ) -> Result<MailboxBlob> {
        let src_path = self.mailbox_blob_path(src)?;
        let volume = self.current_volume()?;
        let path = volume.blob_path_for(dest.id, item_id, revision, is_compressed_path(&src_path));
        if src_path != path {
            self.place(&src_path, &path)?;
        }
        let mut copied =
            MailboxBlob::new(dest, item_id, revision, volume.id.to_string(), src.size())
                .with_path(path);
        if let Some(digest) = src.digest() {
            copied = copied.with_digest(digest);
        }
        Ok(copied)
    }

    fn rename_to(
        &self,
        src: &StagedBlob,
        dest: &Mailbox,
        item_id: i32,
        revision: i32,
    ) -> Result<MailboxBlob> {
        let source = self.staged_source(src)?;
        let path = self
            .volume_for_locator(src.locator())?
            .blob_path_for(dest.id, item_id, revision, source.is_compressed());
        prepare_target(&path)?;
        if fs::rename(source.path(), &path).is_err() {
            // Different filesystem: copy, then drop the source
            self.place(source.path(), &path)?;
            delete_quietly(source.path())?;
        }
        Ok(self.linked(src, dest, item_id, revision, path))
    }

    fn delete_staged(&self, staged: &StagedBlob) -> Result<bool> {
        // Otherwise the staged file is the caller's incoming blob
        match staged.local_blob() {
            Some(blob) if staged.is_staged_directly() => delete_quietly(blob.path()),
            _ => Ok(false),
        }
    }

    fn delete_mailbox_blob(&self, mblob: &MailboxBlob) -> Result<bool> {
        delete_quietly(&self.mailbox_blob_path(mblob)?)
    }

    fn get_mailbox_blob(
        &self,
        mbox: &Mailbox,
        item_id: i32,
        revision: i32,
        locator: &str,
        validate: bool,
    ) -> Result<Option<MailboxBlob>> {
        let path = self.blob_path(mbox.id, item_id, revision, locator)?;
        let size = if path.exists() {
            Some(Blob::from_file(&path)?.raw_size()?)
        } else if validate {
            return Ok(None);
        } else {
            None
        };
        Ok(Some(
            MailboxBlob::new(mbox, item_id, revision, locator, size).with_path(path),
        ))
    }

    fn local_blob(&self, mblob: &MailboxBlob) -> Result<Blob> {
        let path = self.mailbox_blob_path(mblob)?;
        if !path.exists() {
            return Err(BlobNotFound {
                locator: path.display().to_string(),
            }
            .into());
        }
        Blob::from_file(path)
    }

    fn content(&self, mblob: &MailboxBlob) -> Result<Box<dyn Read + Send>> {
        self.local_blob(mblob)?.input_stream()
    }

    fn delete_store(&self, mbox: &Mailbox, blobs: &[MailboxBlobInfo]) -> Result<bool> {
        for info in blobs {
            let path = self.blob_path(mbox.id, info.item_id, info.revision, &info.locator)?;
            if let Err(e) = delete_quietly(&path) {
                warn!("[STORE] Failed to delete {}: {:#}", path.display(), e);
            }
        }
        Ok(true)
    }
}

/// Create the parent directory and drop the other compression variant of `dest`
fn prepare_target(dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let other = if is_compressed_path(dest) {
        dest.with_extension("")
    } else {
        let mut name = dest.as_os_str().to_owned();
        name.push(".");
        name.push(COMPRESSED_EXTENSION);
        PathBuf::from(name)
    };
    if delete_quietly(&other)? {
        debug!("[STORE] Replaced {} with {}", other.display(), dest.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsport::CopyLinkPort;
    use crate::models::VolumeKind;
    use tempfile::tempdir;

    fn create_test_store(dir: &Path) -> FileBlobStore {
        let volume = Volume::new(1, VolumeKind::Message, dir.join("vol1"));
        FileBlobStore::new(dir.join("incoming"), vec![volume], 1).unwrap()
    }

    fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_store_stage_link_read() {
        let dir = tempdir().unwrap();
        let store = create_test_store(dir.path());
        let mbox = Mailbox::new(5, "acct-5");

        let blob = store.store_incoming(&mut &b"hello world"[..], false).unwrap();
        assert_eq!(blob.raw_size().unwrap(), 11);

        let staged = store.stage(&blob, &mbox).unwrap();
        assert_eq!(staged.locator(), "1");
        assert_eq!(staged.size(), 11);

        let mblob = store.link(&staged, &mbox, 42, 1).unwrap();
        assert_eq!(
            mblob.path().unwrap(),
            dir.path().join("vol1/0/5/msg/0/42-1.msg")
        );
        assert_eq!(read_all(store.content(&mblob).unwrap()), b"hello world");

        let again = store
            .get_mailbox_blob(&mbox, 42, 1, "1", true)
            .unwrap()
            .unwrap();
        assert_eq!(again.size(), Some(11));

        assert!(store.delete_mailbox_blob(&mblob).unwrap());
        assert!(!store.delete_mailbox_blob(&mblob).unwrap());
        assert!(store.get_mailbox_blob(&mbox, 42, 1, "1", true).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_link_shares_inode_with_incoming() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        let store = create_test_store(dir.path());
        let mbox = Mailbox::new(5, "acct-5");

        let blob = store.store_incoming(&mut &b"shared"[..], false).unwrap();
        let staged = store.stage(&blob, &mbox).unwrap();
        let mblob = store.link(&staged, &mbox, 1, 1).unwrap();

        let a = fs::metadata(blob.path()).unwrap().ino();
        let b = fs::metadata(mblob.path().unwrap()).unwrap().ino();
        assert_eq!(a, b);
    }

    #[test]
    fn test_copy_and_rename() {
        let dir = tempdir().unwrap();
        let store = create_test_store(dir.path()).with_link_port(Arc::new(CopyLinkPort));
        let mbox = Mailbox::new(5, "acct-5");
        let other = Mailbox::new(6, "acct-6");

        let blob = store.store_incoming(&mut &b"payload"[..], false).unwrap();
        let staged = store.stage(&blob, &mbox).unwrap();
        let mblob = store.link(&staged, &mbox, 10, 1).unwrap();

        let copied = store.copy(&mblob, &other, 11, 1).unwrap();
        assert_eq!(read_all(store.content(&copied).unwrap()), b"payload");

        let renamed = store.rename_to(&staged, &other, 12, 1).unwrap();
        assert_eq!(read_all(store.content(&renamed).unwrap()), b"payload");
        assert!(!blob.path().exists());
    }

    #[test]
    fn test_compressed_volume() {
        let dir = tempdir().unwrap();
        let volume =
            Volume::new(2, VolumeKind::Message, dir.path().join("vol2")).with_compression(16);
        let store = FileBlobStore::new(dir.path().join("incoming"), vec![volume], 2).unwrap();
        let mbox = Mailbox::new(1, "acct-1");
        let data = "Received: from example.org\r\n".repeat(100);

        let blob = store.store_incoming(&mut data.as_bytes(), false).unwrap();
        assert!(blob.is_compressed());

        let staged = store.stage(&blob, &mbox).unwrap();
        assert_eq!(staged.size(), data.len() as u64);
        let mblob = store.link(&staged, &mbox, 3, 1).unwrap();
        assert_eq!(
            mblob.path().unwrap(),
            dir.path().join("vol2/0/1/msg/0/3-1.msg.zst")
        );
        assert_eq!(read_all(store.content(&mblob).unwrap()), data.as_bytes());

        let found = store.get_mailbox_blob(&mbox, 3, 1, "2", true).unwrap().unwrap();
        assert_eq!(found.size(), Some(data.len() as u64));
        assert_eq!(read_all(store.content(&found).unwrap()), data.as_bytes());

        // store_as_is skips compression
        let raw = store.store_incoming(&mut data.as_bytes(), true).unwrap();
        assert!(!raw.is_compressed());
    }

    #[test]
    fn test_missing_content_is_not_found() {
        let dir = tempdir().unwrap();
        let store = create_test_store(dir.path());
        let mbox = Mailbox::new(5, "acct-5");

        let mblob = store.get_mailbox_blob(&mbox, 9, 9, "1", false).unwrap().unwrap();
        assert_eq!(mblob.size(), None);
        let err = store.content(&mblob).err().unwrap();
        assert!(crate::error::is_not_found(&err));
    }

    #[test]
    fn test_content_with_zstd_magic_stays_raw() {
        let dir = tempdir().unwrap();
        let store = create_test_store(dir.path());
        let mbox = Mailbox::new(5, "acct-5");
        let data = [0x28, 0xB5, 0x2F, 0xFD, b'h', b'i'];

        let blob = store.store_incoming(&mut &data[..], false).unwrap();
        let staged = store.stage(&blob, &mbox).unwrap();
        let mblob = store.link(&staged, &mbox, 42, 1).unwrap();
        assert_eq!(read_all(store.content(&mblob).unwrap()), data);

        let found = store.get_mailbox_blob(&mbox, 42, 1, "1", true).unwrap().unwrap();
        assert_eq!(found.size(), Some(data.len() as u64));
        assert_eq!(read_all(store.content(&found).unwrap()), data);
    }

    #[test]
    fn test_relinking_replaces_other_compression_variant() {
        let dir = tempdir().unwrap();
        let volume =
            Volume::new(2, VolumeKind::Message, dir.path().join("vol2")).with_compression(16);
        let store = FileBlobStore::new(dir.path().join("incoming"), vec![volume], 2).unwrap();
        let mbox = Mailbox::new(1, "acct-1");
        let big = "Received: from example.org\r\n".repeat(100);

        let first = store.stage_stream(&mut big.as_bytes(), None, &mbox).unwrap();
        let compressed = store.rename_to(&first, &mbox, 7, 1).unwrap();
        assert!(compressed.path().unwrap().exists());

        let second = store.stage_stream(&mut &b"tiny"[..], None, &mbox).unwrap();
        let raw = store.rename_to(&second, &mbox, 7, 1).unwrap();
        assert!(!compressed.path().unwrap().exists());

        let found = store.get_mailbox_blob(&mbox, 7, 1, "2", true).unwrap().unwrap();
        assert_eq!(found.path(), raw.path());
        assert_eq!(read_all(store.content(&found).unwrap()), b"tiny");
    }

    #[test]
    fn test_delete_staged_removes_spooled_file() {
        let dir = tempdir().unwrap();
        let store = create_test_store(dir.path());
        let mbox = Mailbox::new(5, "acct-5");
        let incoming_files = || fs::read_dir(dir.path().join("incoming")).unwrap().count();

        let staged = store.stage_stream(&mut &b"x"[..], None, &mbox).unwrap();
        assert!(staged.is_staged_directly());
        let mblob = store.link(&staged, &mbox, 1, 1).unwrap();
        assert_eq!(incoming_files(), 1);

        assert!(store.delete_staged(&staged).unwrap());
        assert!(!store.delete_staged(&staged).unwrap());
        assert_eq!(incoming_files(), 0);
        assert_eq!(read_all(store.content(&mblob).unwrap()), b"x");
        assert!(store.delete_mailbox_blob(&mblob).unwrap());

        // Content staged from a caller's blob stays with the caller
        let blob = store.store_incoming(&mut &b"y"[..], false).unwrap();
        let staged = store.stage(&blob, &mbox).unwrap();
        assert!(!store.delete_staged(&staged).unwrap());
        assert!(blob.path().exists());
    }

    #[test]
    fn test_unknown_volume_rejected() {
        let dir = tempdir().unwrap();
        let store = create_test_store(dir.path());
        assert!(store.set_current_volume(9).is_err());
        assert!(store.blob_path(MailboxId(1), 1, 1, "9").is_err());
        assert!(store.blob_path(MailboxId(1), 1, 1, "not-a-volume").is_err());
    }
}
