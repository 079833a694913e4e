//! Content-addressed stores
//!
//! The locator is derived from the SHA-256 of the content, so staging the
//! same bytes twice lands on the same locator. Every write takes a
//! reference on the object and every delete drops one, so items sharing a
//! locator keep their content until the last of them is deleted. A
//! single-instance backend also lets staging skip the upload entirely when
//! the content is already there.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};

use super::blob::{Blob, BlobBuilder};
use super::cache::ContentCache;
use super::digest::{ContentDigest, DigestingReader};
use super::handles::{MailboxBlob, StagedBlob};
use super::traits::{ContentAddressable, SingleInstance, StoreFeature, StoreManager};
use crate::error::{BackendError, DigestMismatch, is_not_found};
use crate::models::{Mailbox, MailboxBlobInfo};

/// Primitives of a content-addressed backend
pub trait ContentAddressableBackend: Send + Sync {
    /// Lowercase hex SHA-256 unless the backend wants something else
    fn locator_for_hash(&self, hash: &ContentDigest) -> String {
        hash.to_hex()
    }

    /// Store content under a locator computed by the caller
    fn write_stream_to_store(
        &self,
        data: &mut dyn Read,
        actual_size: Option<u64>,
        mbox: &Mailbox,
        locator: &str,
    ) -> Result<()>;

    fn read_stream_from_store(
        &self,
        locator: &str,
        mbox: &Mailbox,
    ) -> Result<Option<Box<dyn Read + Send>>>;

    /// Drop one reference; the object goes with the last one
    fn delete_from_store(&self, locator: &str, mbox: &Mailbox) -> Result<bool>;

    fn declared_features(&self) -> &[StoreFeature] {
        &[StoreFeature::Centralized]
    }

    fn single_instance(&self) -> Option<&dyn SingleInstanceBackend> {
        None
    }
}

/// Reference-counted backends
pub trait SingleInstanceBackend: Send + Sync {
    /// Open existing content and take a reference on it
    fn sis_fetch(&self, locator: &str) -> Result<Option<Box<dyn Read + Send>>>;
}

pub struct ContentAddressableStoreManager<B> {
    backend: B,
    incoming_dir: PathBuf,
    cache: ContentCache,
}

impl<B: ContentAddressableBackend> ContentAddressableStoreManager<B> {
    pub fn new(
        backend: B,
        incoming_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let incoming_dir = incoming_dir.into();
        fs::create_dir_all(&incoming_dir).with_context(|| {
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

    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear()
    }

    fn fetch(&self, locator: &str, mbox: &Mailbox) -> Result<Blob> {
        self.cache
            .get_or_fetch(locator, || self.backend.read_stream_from_store(locator, mbox))
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

impl<B: ContentAddressableBackend> ContentAddressable for ContentAddressableStoreManager<B> {
    fn locator_for_hash(&self, hash: &ContentDigest) -> String {
        self.backend.locator_for_hash(hash)
    }
}

impl<B: ContentAddressableBackend> SingleInstance for ContentAddressableStoreManager<B> {
    fn get_sis_blob(&self, hash: &ContentDigest) -> Result<Option<Blob>> {
        let sis = self
            .backend
            .single_instance()
            .ok_or_else(|| anyhow!("backend is not single-instance"))?;
        let locator = self.backend.locator_for_hash(hash);
        match sis.sis_fetch(&locator)? {
            Some(mut reader) => Ok(Some(self.cache.put_stream(&locator, &mut reader)?)),
            None => Ok(None),
        }
    }
}

impl<B: ContentAddressableBackend> StoreManager for ContentAddressableStoreManager<B> {
    fn startup(&self) -> Result<()> {
        info!("[CAS] Store manager started, incoming {}", self.incoming_dir.display());
        Ok(())
    }

    fn declared_features(&self) -> &[StoreFeature] {
        self.backend.declared_features()
    }

    fn content_addressable(&self) -> Option<&dyn ContentAddressable> {
        Some(self)
    }

    fn single_instance(&self) -> Option<&dyn SingleInstance> {
        self.backend.single_instance().map(|_| self as &dyn SingleInstance)
    }

    fn blob_builder(&self) -> Result<BlobBuilder> {
        let mut builder = BlobBuilder::create(&self.incoming_dir)?;
        builder.disable_compression(true);
        Ok(builder)
    }

    fn stage(&self, blob: &Blob, mbox: &Mailbox) -> Result<StagedBlob> {
        let hash = blob.digest()?;
        let locator = self.backend.locator_for_hash(&hash);

        if self.backend.single_instance().is_some() {
            if let Some(existing) = self.get_sis_blob(&hash)? {
                debug!("[CAS] {} already stored, took a reference", locator);
                let size = existing.raw_size()?;
                let staged = StagedBlob::new(mbox, hash.to_base64url(), size, locator);
                return Ok(staged.already_present());
            }
        }

        let mut reader = DigestingReader::new(blob.input_stream()?);
        self.backend
            .write_stream_to_store(&mut reader, blob.raw_size().ok(), mbox, &locator)
            .map_err(|e| BackendError::with_source(format!("staging {}", locator), e))?;
        let (written, size) = reader.finish();
        if written != hash {
            // The locator no longer describes what was written
            if let Err(e) = self.backend.delete_from_store(&locator, mbox) {
                warn!("[CAS] Failed to remove mis-hashed {}: {}", locator, e);
            }
            return Err(DigestMismatch {
                expected: hash.to_base64url(),
                actual: written.to_base64url(),
            }
            .into());
        }
        self.cache.put(&locator, blob)?;
        debug!("[CAS] Staged {} bytes at {}", size, locator);
        Ok(StagedBlob::new(mbox, written.to_base64url(), size, locator))
    }

    fn stage_stream(
        &self,
        data: &mut dyn Read,
        actual_size: Option<u64>,
        mbox: &Mailbox,
    ) -> Result<StagedBlob> {
        // The locator needs the hash, so spool locally first
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

    /// Restaging takes a new reference for the copy
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

    /// Releases the reference staging took, whether it wrote or hit
    fn delete_staged(&self, staged: &StagedBlob) -> Result<bool> {
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
                    "[CAS] Failed to delete {} for mailbox {}: {}",
                    info.locator, mbox.id, e
                );
            }
        }
        Ok(true)
    }
}

/// Content-addressed objects in a local directory tree
///
/// Objects live at `<base>/<hex[..2]>/<hex>` and a `<hex>.refs` file next
/// to each object holds its reference count. Single-instance mode also lets
/// callers take a reference on existing content without rewriting it.
pub struct LocalCasStore {
    base_dir: PathBuf,
    single_instance: bool,
    refs_lock: Mutex<()>,
}

pub type SimpleCasStoreManager = ContentAddressableStoreManager<LocalCasStore>;

impl LocalCasStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create store directory {}", base_dir.display()))?;
        Ok(Self {
            base_dir,
            single_instance: false,
            refs_lock: Mutex::new(()),
        })
    }

    /// Let staging reuse existing objects instead of rewriting them
    pub fn with_single_instance(mut self) -> Self {
        self.single_instance = true;
        self
    }

    fn object_path(&self, locator: &str) -> Result<PathBuf> {
        let valid = locator
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if locator.len() < 3 || !valid {
            return Err(anyhow!("invalid locator {:?}", locator));
        }
        Ok(self.base_dir.join(&locator[..2]).join(locator))
    }

    fn refs_path(object: &Path) -> PathBuf {
        object.with_extension("refs")
    }

    /// Current reference count; zero when absent
    pub fn ref_count(&self, locator: &str) -> Result<u64> {
        let object = self.object_path(locator)?;
        if !object.exists() {
            return Ok(0);
        }
        read_refs(&Self::refs_path(&object))
    }

    fn adjust_refs(&self, object: &Path, delta: i64) -> Result<u64> {
        let refs_path = Self::refs_path(object);
        let current = read_refs(&refs_path)? as i64;
        let updated = (current + delta).max(0) as u64;
        write_atomic(&refs_path, updated.to_string().as_bytes())?;
        Ok(updated)
    }

    fn lock_refs(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.refs_lock
            .lock()
            .map_err(|_| anyhow!("reference count lock poisoned"))
    }
}

fn read_refs(path: &Path) -> Result<u64> {
    match fs::read_to_string(path) {
        Ok(s) => s
            .trim()
            .parse()
            .with_context(|| format!("Corrupt reference count in {}", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("Failed to read {}", path.display())))
        }
    }
}

/// Write to a temp file then rename over the target
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    let mut file = File::create(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

impl ContentAddressableBackend for LocalCasStore {
    fn write_stream_to_store(
        &self,
        data: &mut dyn Read,
        _actual_size: Option<u64>,
        _mbox: &Mailbox,
        locator: &str,
    ) -> Result<()> {
        let object = self.object_path(locator)?;
        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = self.lock_refs()?;

        // Always consume the stream so the caller sees the full digest
        let tmp = object.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        io::copy(data, &mut file)?;
        file.sync_all()?;
        drop(file);

        if object.exists() {
            fs::remove_file(&tmp)?;
        } else {
            fs::rename(&tmp, &object)
                .with_context(|| format!("Failed to store {}", object.display()))?;
        }
        let refs = self.adjust_refs(&object, 1)?;
        debug!("[CAS] {} now has {} references", locator, refs);
        Ok(())
    }

    fn read_stream_from_store(
        &self,
        locator: &str,
        _mbox: &Mailbox,
    ) -> Result<Option<Box<dyn Read + Send>>> {
        let object = self.object_path(locator)?;
        match File::open(&object) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(anyhow::Error::new(e).context(format!("Failed to open {}", object.display())))
            }
        }
    }

    fn delete_from_store(&self, locator: &str, _mbox: &Mailbox) -> Result<bool> {
        let object = self.object_path(locator)?;
        let _guard = self.lock_refs()?;
        if !object.exists() {
            return Ok(false);
        }
        let refs = self.adjust_refs(&object, -1)?;
        if refs > 0 {
            debug!("[CAS] {} still has {} references", locator, refs);
            return Ok(true);
        }
        let _ = fs::remove_file(Self::refs_path(&object));
        fs::remove_file(&object)
            .with_context(|| format!("Failed to delete {}", object.display()))?;
        Ok(true)
    }

    fn single_instance(&self) -> Option<&dyn SingleInstanceBackend> {
        if self.single_instance {
            Some(self)
        } else {
            None
        }
    }
}

impl SingleInstanceBackend for LocalCasStore {
    fn sis_fetch(&self, locator: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let object = self.object_path(locator)?;
        let _guard = self.lock_refs()?;
        let file = match File::open(&object) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(
                    anyhow::Error::new(e).context(format!("Failed to open {}", object.display()))
                );
            }
        };
        self.adjust_refs(&object, 1)?;
        Ok(Some(Box::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HELLO_HEX: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn create_test_manager(dir: &Path, sis: bool) -> SimpleCasStoreManager {
        let mut store = LocalCasStore::new(dir.join("cas")).unwrap();
        if sis {
            store = store.with_single_instance();
        }
        ContentAddressableStoreManager::new(store, dir.join("incoming"), dir.join("cache"))
            .unwrap()
    }

    #[test]
    fn test_locator_is_content_hash() {
        let dir = tempdir().unwrap();
        let sm = create_test_manager(dir.path(), false);
        let mbox = Mailbox::new(1, "acct");

        let staged = sm.stage_stream(&mut &b"hello world"[..], Some(11), &mbox).unwrap();
        assert_eq!(staged.locator(), HELLO_HEX);
        assert_eq!(staged.size(), 11);
        assert!(dir.path().join("cas/b9").join(HELLO_HEX).exists());

        let again = sm.stage_stream(&mut &b"hello world"[..], None, &mbox).unwrap();
        assert_eq!(again.locator(), staged.locator());
        assert!(sm.content_addressable().is_some());
        assert!(sm.supports(StoreFeature::Centralized));
        assert!(!sm.supports(StoreFeature::SingleInstanceServerCreate));
    }

    #[test]
    fn test_wrong_size_hint_is_ignored() {
        let dir = tempdir().unwrap();
        let sm = create_test_manager(dir.path(), false);
        let mbox = Mailbox::new(1, "acct");

        let staged = sm.stage_stream(&mut &b"hello world"[..], Some(3), &mbox).unwrap();
        assert_eq!(staged.size(), 11);
        assert_eq!(staged.digest(), ContentDigest::of(b"hello world").to_base64url());
    }

    #[test]
    fn test_sis_reference_counting() {
        let dir = tempdir().unwrap();
        let sm = create_test_manager(dir.path(), true);
        assert!(sm.supports(StoreFeature::SingleInstanceServerCreate));
        let mbox = Mailbox::new(1, "acct");

        let first = sm.stage_stream(&mut &b"hello world"[..], None, &mbox).unwrap();
        assert!(first.is_inserted());
        assert_eq!(sm.backend().ref_count(HELLO_HEX).unwrap(), 1);

        let second = sm.stage_stream(&mut &b"hello world"[..], None, &mbox).unwrap();
        assert!(!second.is_inserted());
        assert_eq!(sm.backend().ref_count(HELLO_HEX).unwrap(), 2);

        let hash = ContentDigest::of(b"hello world");
        let blob = sm.get_sis_blob(&hash).unwrap().unwrap();
        assert_eq!(blob.content().unwrap(), b"hello world");
        assert_eq!(sm.backend().ref_count(HELLO_HEX).unwrap(), 3);

        assert!(sm.get_sis_blob(&ContentDigest::of(b"nope")).unwrap().is_none());

        let mblob = sm.link(&first, &mbox, 1, 1).unwrap();
        for expected in [2, 1, 0] {
            assert!(sm.delete_mailbox_blob(&mblob).unwrap());
            assert_eq!(sm.backend().ref_count(HELLO_HEX).unwrap(), expected);
        }
        assert!(!dir.path().join("cas/b9").join(HELLO_HEX).exists());
        assert!(!sm.delete_mailbox_blob(&mblob).unwrap());
    }

    #[test]
    fn test_round_trip_and_missing() {
        let dir = tempdir().unwrap();
        let sm = create_test_manager(dir.path(), false);
        let mbox = Mailbox::new(1, "acct");

        let staged = sm.stage_stream(&mut &b"some content"[..], None, &mbox).unwrap();
        let mblob = sm.link(&staged, &mbox, 3, 1).unwrap();
        sm.clear_cache().unwrap();
        assert_eq!(sm.local_blob(&mblob).unwrap().content().unwrap(), b"some content");

        let found = sm
            .get_mailbox_blob(&mbox, 3, 1, staged.locator(), true)
            .unwrap()
            .unwrap();
        assert_eq!(found.size(), Some(12));

        sm.delete_mailbox_blob(&mblob).unwrap();
        assert!(sm.get_mailbox_blob(&mbox, 3, 1, staged.locator(), true).unwrap().is_none());
    }

    #[test]
    fn test_copy_outlives_deleted_original() {
        let dir = tempdir().unwrap();
        let sm = create_test_manager(dir.path(), false);
        let a = Mailbox::new(1, "a");
        let b = Mailbox::new(2, "b");

        let staged = sm.stage_stream(&mut &b"shared"[..], None, &a).unwrap();
        let original = sm.link(&staged, &a, 1, 1).unwrap();
        let copied = sm.copy(&original, &b, 2, 1).unwrap();
        assert_eq!(copied.locator(), original.locator());
        assert_eq!(sm.backend().ref_count(original.locator()).unwrap(), 2);

        assert!(sm.delete_mailbox_blob(&original).unwrap());
        sm.clear_cache().unwrap();
        assert_eq!(sm.local_blob(&copied).unwrap().content().unwrap(), b"shared");

        assert!(sm.delete_mailbox_blob(&copied).unwrap());
        assert_eq!(sm.backend().ref_count(copied.locator()).unwrap(), 0);
        assert!(sm.get_mailbox_blob(&b, 2, 1, copied.locator(), true).unwrap().is_none());
    }

    #[test]
    fn test_unvalidated_lookup_leaves_size_unknown() {
        let dir = tempdir().unwrap();
        let sm = create_test_manager(dir.path(), false);
        let mbox = Mailbox::new(1, "acct");

        let staged = sm.stage_stream(&mut &b"sized"[..], None, &mbox).unwrap();
        let cached = sm.get_mailbox_blob(&mbox, 1, 1, staged.locator(), false).unwrap().unwrap();
        assert_eq!(cached.size(), Some(5));

        sm.clear_cache().unwrap();
        let uncached = sm.get_mailbox_blob(&mbox, 1, 1, staged.locator(), false).unwrap().unwrap();
        assert_eq!(uncached.size(), None);
    }

    #[test]
    fn test_invalid_locator_rejected() {
        let dir = tempdir().unwrap();
        let store = LocalCasStore::new(dir.path()).unwrap();
        let mbox = Mailbox::new(1, "acct");
        assert!(store.read_stream_from_store("../etc/passwd", &mbox).is_err());
    }
}
