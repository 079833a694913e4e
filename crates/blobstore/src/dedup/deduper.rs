//! Hard-link deduplication of message volumes
//!
//! A run walks each requested volume in two phases. The scan phase copies
//! item blob records into per-volume blob references one mailbox group at a
//! time, saving a cursor after every group so an interrupted run resumes
//! where it stopped. The digest phase then visits every distinct digest and
//! relinks all files sharing it onto one inode.
//!
//! Files are replaced by linking a temporary name and renaming it over the
//! original, so readers always see either the old or the new file.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use log::{debug, error, info, warn};
use rayon::prelude::*;

use super::catalog::BlobCatalog;
use crate::fsport::{LinkPort, default_link_port};
use crate::models::{BlobReference, FileInfo, Volume, VolumeId, VolumeMetadata};
use crate::store::is_compressed_path;

const HOLD_SUFFIX: &str = "_HOLD";
const TEMP_SUFFIX: &str = "_TEMP";

/// How a run (or reset) ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Completed,
    /// Another run or reset holds the deduper
    AlreadyRunning,
    /// Stopped on request; the saved cursor lets the next run resume
    Cancelled,
}

/// Result of starting a background run
#[derive(Debug)]
pub enum DedupStart {
    Started(JoinHandle<DedupOutcome>),
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    StopRequested,
}

struct DedupState {
    run: RunState,
    links_created: u64,
    size_saved: u64,
    volume_blobs_progress: Vec<(VolumeId, String)>,
    blob_digests_progress: Vec<(VolumeId, String)>,
}

pub struct BlobDeduper {
    catalog: Arc<dyn BlobCatalog>,
    links: Arc<dyn LinkPort>,
    state: Mutex<DedupState>,
}

/// Puts the deduper back to idle however the run ends
struct RunGuard<'a>(&'a BlobDeduper);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state();
        state.run = RunState::Idle;
    }
}

impl BlobDeduper {
    pub fn new(catalog: Arc<dyn BlobCatalog>, links: Arc<dyn LinkPort>) -> Self {
        Self {
            catalog,
            links,
            state: Mutex::new(DedupState {
                run: RunState::Idle,
                links_created: 0,
                size_saved: 0,
                volume_blobs_progress: Vec::new(),
                blob_digests_progress: Vec::new(),
            }),
        }
    }

    /// Deduper using hard links where the platform has them
    pub fn with_default_links(catalog: Arc<dyn BlobCatalog>) -> Self {
        Self::new(catalog, default_link_port())
    }

    // The state is plain counters, so a panic elsewhere leaves it usable
    fn state(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the deduper; false when a run is already in flight
    fn try_begin(&self, reset_totals: bool) -> bool {
        let mut state = self.state();
        if state.run != RunState::Idle {
            return false;
        }
        state.run = RunState::Running;
        if reset_totals {
            state.links_created = 0;
            state.size_saved = 0;
            state.volume_blobs_progress.clear();
            state.blob_digests_progress.clear();
        }
        true
    }

    /// Start a run on a background thread named "BlobDeduper"
    pub fn process(self: &Arc<Self>, volume_ids: Vec<VolumeId>) -> Result<DedupStart> {
        if !self.try_begin(true) {
            info!("[DEDUPE] Dedupe already in progress, only one request can run at a time");
            return Ok(DedupStart::AlreadyRunning);
        }
        let deduper = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("BlobDeduper".to_string())
            .spawn(move || {
                let _guard = RunGuard(&deduper);
                deduper.run_volumes(&volume_ids)
            });
        match spawned {
            Ok(handle) => Ok(DedupStart::Started(handle)),
            Err(e) => {
                self.state().run = RunState::Idle;
                Err(anyhow::Error::new(e).context("Failed to spawn deduper thread"))
            }
        }
    }

    /// Run on the calling thread
    pub fn run(&self, volume_ids: &[VolumeId]) -> DedupOutcome {
        if !self.try_begin(true) {
            return DedupOutcome::AlreadyRunning;
        }
        let _guard = RunGuard(self);
        self.run_volumes(volume_ids)
    }

    /// Ask a running dedupe to stop after the current group or digest
    pub fn stop_processing(&self) {
        let mut state = self.state();
        if state.run == RunState::Running {
            info!("[DEDUPE] Stop requested");
            state.run = RunState::StopRequested;
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().run != RunState::Idle
    }

    fn stop_requested(&self) -> bool {
        self.state().run == RunState::StopRequested
    }

    /// Links created and bytes saved by the current or last run
    pub fn count_and_size(&self) -> (u64, u64) {
        let state = self.state();
        (state.links_created, state.size_saved)
    }

    /// Scan progress per volume, as "done/total" mailbox groups
    pub fn volume_blobs_progress(&self) -> Vec<(VolumeId, String)> {
        self.state().volume_blobs_progress.clone()
    }

    /// Digest progress per volume, as "done/total" digests
    pub fn blob_digests_progress(&self) -> Vec<(VolumeId, String)> {
        self.state().blob_digests_progress.clone()
    }

    fn set_volume_blobs_progress(&self, volume_id: VolumeId, progress: String) {
        set_progress(&mut self.state().volume_blobs_progress, volume_id, progress);
    }

    fn set_blob_digests_progress(&self, volume_id: VolumeId, progress: String) {
        set_progress(&mut self.state().blob_digests_progress, volume_id, progress);
    }

    fn add_count_and_size(&self, links: u64, size: u64) {
        let mut state = self.state();
        state.links_created += links;
        state.size_saved += size;
    }

    /// Forget dedup bookkeeping so the next run rescans from scratch
    ///
    /// An empty list resets every message volume.
    pub fn reset_volume_blobs(&self, volume_ids: &[VolumeId]) -> Result<DedupOutcome> {
        if !self.try_begin(false) {
            info!("[DEDUPE] Dedupe is in progress, stop it before resetting");
            return Ok(DedupOutcome::AlreadyRunning);
        }
        let _guard = RunGuard(self);

        if volume_ids.is_empty() {
            let removed = self.catalog.delete_all_blob_refs()?;
            for volume in self.catalog.volumes()? {
                if volume.kind.holds_blobs() {
                    self.catalog
                        .update_volume_metadata(volume.id, VolumeMetadata::default())?;
                }
            }
            info!("[DEDUPE] Reset all volumes, removed {} references", removed);
        } else {
            for &id in volume_ids {
                let volume = self
                    .catalog
                    .volume(id)?
                    .ok_or_else(|| anyhow!("unknown volume {}", id))?;
                let removed = self.catalog.delete_blob_refs(volume.id)?;
                self.catalog
                    .update_volume_metadata(volume.id, VolumeMetadata::default())?;
                info!("[DEDUPE] Reset volume {}, removed {} references", id, removed);
            }
        }
        Ok(DedupOutcome::Completed)
    }

    fn run_volumes(&self, volume_ids: &[VolumeId]) -> DedupOutcome {
        let mut outcome = DedupOutcome::Completed;
        for &id in volume_ids {
            info!("[DEDUPE] Running deduper for volume {}", id);
            match self.dedupe_volume(id) {
                Ok(DedupOutcome::Cancelled) => {
                    info!("[DEDUPE] Received the stop signal, stopping");
                    outcome = DedupOutcome::Cancelled;
                    break;
                }
                Ok(_) => {}
                Err(e) => error!("[DEDUPE] Error while deduping volume {}: {:#}", id, e),
            }
        }
        let (links, size) = self.count_and_size();
        info!(
            "[DEDUPE] Deduping done. Total of {} links created and saved approximately {} bytes",
            links, size
        );
        outcome
    }

    fn dedupe_volume(&self, volume_id: VolumeId) -> Result<DedupOutcome> {
        let volume = self
            .catalog
            .volume(volume_id)?
            .ok_or_else(|| anyhow!("unknown volume {}", volume_id))?;
        if !volume.kind.holds_blobs() {
            return Err(anyhow!(
                "volume {} is a {} volume",
                volume_id,
                volume.kind.as_str()
            ));
        }

        if self.populate_volume_blobs(&volume)? == DedupOutcome::Cancelled {
            return Ok(DedupOutcome::Cancelled);
        }

        let digests = self.catalog.unique_digests(volume_id)?;
        let total = digests.len();
        self.set_blob_digests_progress(volume_id, format!("0/{}", total));
        for (i, digest) in digests.iter().enumerate() {
            let (links, size) = self.process_digest(digest, &volume)?;
            self.add_count_and_size(links, size);
            self.set_blob_digests_progress(volume_id, format!("{}/{}", i + 1, total));
            if self.stop_requested() {
                return Ok(DedupOutcome::Cancelled);
            }
        }
        Ok(DedupOutcome::Completed)
    }

    /// Scan item blobs into references, group by group
    ///
    /// A resumed scan skips groups already done, then runs once more to
    /// catch up with blobs created since it was first started.
    fn populate_volume_blobs(&self, volume: &Volume) -> Result<DedupOutcome> {
        let mut metadata = volume.metadata;
        loop {
            let resumed = metadata.is_resuming();
            if !resumed {
                metadata.current_sync_date = Utc::now().timestamp();
            }

            let groups = self.catalog.mailbox_group_ids()?;
            for (i, &group_id) in groups.iter().enumerate() {
                if resumed && group_id <= metadata.group_id {
                    continue;
                }
                let blobs = self.catalog.all_blobs(
                    Some(group_id),
                    volume.id,
                    Some(metadata.last_sync_date),
                    Some(metadata.current_sync_date),
                )?;
                let mut added = 0;
                for info in &blobs {
                    if self.catalog.add_blob_reference(info)? {
                        added += 1;
                    }
                }
                debug!(
                    "[DEDUPE] Volume {} group {}: {} blobs, {} new references",
                    volume.id,
                    group_id,
                    blobs.len(),
                    added
                );

                metadata.group_id = group_id;
                self.catalog.update_volume_metadata(volume.id, metadata)?;
                self.set_volume_blobs_progress(volume.id, format!("{}/{}", i + 1, groups.len()));
                if self.stop_requested() {
                    return Ok(DedupOutcome::Cancelled);
                }
            }

            metadata = VolumeMetadata::new(metadata.current_sync_date, 0, 0);
            self.catalog.update_volume_metadata(volume.id, metadata)?;
            if !resumed {
                return Ok(DedupOutcome::Completed);
            }
        }
    }

    fn process_digest(&self, digest: &str, volume: &Volume) -> Result<(u64, u64)> {
        let mut refs = self.catalog.blob_references(digest, volume.id)?;
        match refs.len() {
            0 => Ok((0, 0)),
            1 => {
                // Nothing to share with
                if !refs[0].processed {
                    self.catalog.update_processed(refs[0].id, true)?;
                }
                Ok((0, 0))
            }
            n => {
                debug!("[DEDUPE] Deduping {} files for digest {} volume {}", n, digest, volume.id);
                self.dedupe(&mut refs, volume)
            }
        }
    }

    /// Relink every file of one digest onto a single inode
    ///
    /// Compressed and raw files hold different bytes for the same digest,
    /// so each kind is linked among itself.
    fn dedupe(&self, refs: &mut [BlobReference], volume: &Volume) -> Result<(u64, u64)> {
        let paths: Vec<PathBuf> = refs
            .iter()
            .map(|r| volume.stored_blob_path(r.mailbox_id, r.item_id, r.revision))
            .collect();
        let infos: Vec<Option<FileInfo>> = paths
            .par_iter()
            .map(|path| match self.links.file_info(path) {
                Ok(info) => info,
                Err(e) => {
                    debug!("[DEDUPE] Cannot stat {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        for (reference, info) in refs.iter_mut().zip(infos) {
            reference.file_info = info;
        }

        let mut links_created = 0;
        let mut size_saved = 0;
        for compressed in [false, true] {
            let (group, group_paths): (Vec<BlobReference>, Vec<PathBuf>) = refs
                .iter()
                .zip(&paths)
                .filter(|(_, path)| is_compressed_path(path) == compressed)
                .map(|(r, path)| (r.clone(), path.clone()))
                .unzip();
            if group.len() < 2 && group.iter().all(|r| r.processed) {
                continue;
            }
            let (links, size) = self.link_group(&group, &group_paths)?;
            links_created += links;
            size_saved += size;
        }
        Ok((links_created, size_saved))
    }

    /// Point every path of `refs` at the inode the group should share
    fn link_group(&self, refs: &[BlobReference], paths: &[PathBuf]) -> Result<(u64, u64)> {
        let Some((source_inode, source_path)) = choose_source(refs, paths) else {
            return Ok((0, 0));
        };

        // Pin the source inode while other paths are relinked
        let hold = with_suffix(&source_path, HOLD_SUFFIX);
        remove_stale(&hold);
        if let Err(e) = self.links.link(&source_path, &hold) {
            warn!(
                "[DEDUPE] Ignoring error while creating a link for {}: {}",
                source_path.display(),
                e
            );
            return Ok((0, 0));
        }

        let mut links_created = 0;
        let mut size_saved = 0;
        for (reference, path) in refs.iter().zip(paths) {
            if reference.processed {
                continue;
            }
            let Some(info) = reference.file_info else {
                continue;
            };
            if info.inode == source_inode {
                self.catalog.update_processed(reference.id, true)?;
                continue;
            }
            match self.relink(&hold, path) {
                Ok(()) => {
                    self.catalog.update_processed(reference.id, true)?;
                    links_created += 1;
                    if self.links.shares_storage() {
                        size_saved += info.size;
                    }
                }
                Err(e) => warn!(
                    "[DEDUPE] Ignoring error while deduping {}: {:#}",
                    path.display(),
                    e
                ),
            }
        }

        if let Err(e) = fs::remove_file(&hold) {
            warn!("[DEDUPE] Failed to remove {}: {}", hold.display(), e);
        }
        Ok((links_created, size_saved))
    }

    /// Link `hold` to a temp name next to `path`, then rename it over `path`
    fn relink(&self, hold: &Path, path: &Path) -> Result<()> {
        let temp = with_suffix(path, TEMP_SUFFIX);
        remove_stale(&temp);
        let linked = self
            .links
            .link(hold, &temp)
            .with_context(|| format!("Failed to link {}", temp.display()))
            .and_then(|()| {
                fs::rename(&temp, path)
                    .with_context(|| format!("Failed to rename over {}", path.display()))
            });
        if linked.is_err() {
            remove_stale(&temp);
        }
        linked
    }
}

/// Canonical file for a digest group
///
/// Prefers a file already marked processed, else the inode most paths in
/// the group point at (first seen wins ties).
fn choose_source(refs: &[BlobReference], paths: &[PathBuf]) -> Option<(u64, PathBuf)> {
    if let Some((info, path)) = refs
        .iter()
        .zip(paths)
        .find_map(|(r, p)| r.file_info.filter(|_| r.processed).map(|i| (i, p)))
    {
        return Some((info.inode, path.clone()));
    }

    let mut counts: Vec<(u64, usize, &PathBuf)> = Vec::new();
    for (reference, path) in refs.iter().zip(paths) {
        let Some(info) = reference.file_info else {
            continue;
        };
        match counts.iter_mut().find(|(inode, _, _)| *inode == info.inode) {
            Some(entry) => entry.1 += 1,
            None => counts.push((info.inode, 1, path)),
        }
    }
    let mut best: Option<(u64, usize, &PathBuf)> = None;
    for entry in counts {
        if best.is_none_or(|b| entry.1 > b.1) {
            best = Some(entry);
        }
    }
    best.map(|(inode, _, path)| (inode, path.clone()))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_stale(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("[DEDUPE] Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn set_progress(progress: &mut Vec<(VolumeId, String)>, volume_id: VolumeId, value: String) {
    match progress.iter_mut().find(|(id, _)| *id == volume_id) {
        Some(entry) => entry.1 = value,
        None => progress.push((volume_id, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::InMemoryBlobCatalog;
    use crate::fsport::CopyLinkPort;
    use crate::models::{Mailbox, MailboxBlobInfo, MailboxId, VolumeKind};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        catalog: Arc<InMemoryBlobCatalog>,
        volume: Volume,
    }

    fn create_fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let volume = Volume::new(1, VolumeKind::Message, dir.path().join("vol1"));
        let catalog = Arc::new(InMemoryBlobCatalog::new());
        catalog.upsert_volume(&volume).unwrap();
        Fixture {
            _dir: dir,
            catalog,
            volume,
        }
    }

    /// Write a distinct file for an item and record it as created an hour ago
    fn add_item(fixture: &Fixture, mailbox: &Mailbox, item_id: i32, content: &[u8]) -> PathBuf {
        add_item_at(fixture, mailbox, item_id, content, Utc::now().timestamp() - 3600).0
    }

    fn add_item_at(
        fixture: &Fixture,
        mailbox: &Mailbox,
        item_id: i32,
        content: &[u8],
        created: i64,
    ) -> (PathBuf, MailboxBlobInfo) {
        fixture.catalog.upsert_mailbox(mailbox).unwrap();
        let path = fixture.volume.blob_path(mailbox.id, item_id, 1);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        let info = MailboxBlobInfo {
            mailbox_id: mailbox.id,
            item_id,
            revision: 1,
            locator: fixture.volume.id.to_string(),
            digest: crate::store::ContentDigest::of(content).to_base64url(),
            size: content.len() as u64,
        };
        fixture.catalog.record_item_blob(&info, fixture.volume.id, created).unwrap();
        (path, info)
    }

    fn deduper(fixture: &Fixture) -> BlobDeduper {
        BlobDeduper::with_default_links(fixture.catalog.clone())
    }

    #[cfg(unix)]
    #[test]
    fn test_compressed_and_raw_files_are_linked_separately() {
        use std::os::unix::fs::MetadataExt;

        let fixture = create_fixture();
        let mbox = Mailbox::new(5, "acct");
        let content = b"same message, stored two ways";
        let raw: Vec<PathBuf> = (1..=2).map(|i| add_item(&fixture, &mbox, i, content)).collect();
        let compressed: Vec<PathBuf> = (3..=4)
            .map(|i| {
                let raw_path = add_item(&fixture, &mbox, i, content);
                let path = fixture.volume.blob_path_for(mbox.id, i, 1, true);
                fs::rename(&raw_path, &path).unwrap();
                fs::write(&path, b"zstd frame").unwrap();
                path
            })
            .collect();

        let deduper = deduper(&fixture);
        assert_eq!(deduper.run(&[1]), DedupOutcome::Completed);
        assert_eq!(deduper.count_and_size().0, 2);

        let raw_inode = fs::metadata(&raw[0]).unwrap().ino();
        let compressed_inode = fs::metadata(&compressed[0]).unwrap().ino();
        assert_ne!(raw_inode, compressed_inode);
        assert_eq!(fs::metadata(&raw[1]).unwrap().ino(), raw_inode);
        assert_eq!(fs::metadata(&compressed[1]).unwrap().ino(), compressed_inode);
        assert_eq!(fs::read(&raw[1]).unwrap(), content);
        assert_eq!(fs::read(&compressed[1]).unwrap(), b"zstd frame");
    }

    #[cfg(unix)]
    #[test]
    fn test_identical_files_share_one_inode() {
        use std::os::unix::fs::MetadataExt;

        let fixture = create_fixture();
        let mbox = Mailbox::new(5, "acct");
        let content = b"duplicate message body";
        let paths: Vec<PathBuf> = (1..=4).map(|i| add_item(&fixture, &mbox, i, content)).collect();
        add_item(&fixture, &mbox, 10, b"unique");

        let deduper = deduper(&fixture);
        assert_eq!(deduper.run(&[1]), DedupOutcome::Completed);

        let inode = fs::metadata(&paths[0]).unwrap().ino();
        for path in &paths {
            assert_eq!(fs::metadata(path).unwrap().ino(), inode);
            assert_eq!(fs::read(path).unwrap(), content);
        }
        assert_eq!(deduper.count_and_size(), (3, 3 * content.len() as u64));
        assert!(fixture
            .catalog
            .volume_blob_references(1)
            .unwrap()
            .iter()
            .all(|r| r.processed));

        // No hold or temp links left behind
        let dir = paths[0].parent().unwrap();
        let names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(HOLD_SUFFIX) && !n.ends_with(TEMP_SUFFIX)));
    }

    #[cfg(unix)]
    #[test]
    fn test_second_run_creates_no_links() {
        let fixture = create_fixture();
        let mbox = Mailbox::new(5, "acct");
        for i in 1..=3 {
            add_item(&fixture, &mbox, i, b"same");
        }
        let deduper = deduper(&fixture);
        deduper.run(&[1]);
        assert_eq!(deduper.count_and_size().0, 2);

        deduper.run(&[1]);
        assert_eq!(deduper.count_and_size(), (0, 0));
    }

    #[cfg(unix)]
    #[test]
    fn test_source_prefers_most_shared_inode() {
        use std::os::unix::fs::MetadataExt;

        let fixture = create_fixture();
        let mbox = Mailbox::new(5, "acct");
        let a = add_item(&fixture, &mbox, 1, b"same");
        let b = add_item(&fixture, &mbox, 2, b"same");
        let c = add_item(&fixture, &mbox, 3, b"same");
        // b and c already share an inode
        fs::remove_file(&c).unwrap();
        fs::hard_link(&b, &c).unwrap();
        let shared = fs::metadata(&b).unwrap().ino();

        let deduper = deduper(&fixture);
        deduper.run(&[1]);
        assert_eq!(fs::metadata(&a).unwrap().ino(), shared);
        assert_eq!(deduper.count_and_size(), (1, 4));
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let fixture = create_fixture();
        let mbox = Mailbox::new(5, "acct");
        add_item(&fixture, &mbox, 1, b"same");
        add_item(&fixture, &mbox, 2, b"same");
        let gone = add_item(&fixture, &mbox, 3, b"same");
        fs::remove_file(&gone).unwrap();

        let deduper = deduper(&fixture);
        assert_eq!(deduper.run(&[1]), DedupOutcome::Completed);
        assert_eq!(deduper.count_and_size().0, 1);
        assert!(!gone.exists());
    }

    #[test]
    fn test_copy_port_saves_nothing() {
        let fixture = create_fixture();
        let mbox = Mailbox::new(5, "acct");
        let paths: Vec<PathBuf> = (1..=3).map(|i| add_item(&fixture, &mbox, i, b"same")).collect();

        let deduper = BlobDeduper::new(fixture.catalog.clone(), Arc::new(CopyLinkPort));
        deduper.run(&[1]);
        assert_eq!(deduper.count_and_size(), (2, 0));
        for path in &paths {
            assert_eq!(fs::read(path).unwrap(), b"same");
        }
    }

    #[test]
    fn test_progress_and_cursor() {
        let fixture = create_fixture();
        add_item(&fixture, &Mailbox::new(1, "a").in_group(1), 1, b"x");
        add_item(&fixture, &Mailbox::new(2, "b").in_group(2), 2, b"x");

        let deduper = deduper(&fixture);
        deduper.run(&[1]);
        assert_eq!(deduper.volume_blobs_progress(), vec![(1, "2/2".to_string())]);
        assert_eq!(deduper.blob_digests_progress(), vec![(1, "1/1".to_string())]);

        let metadata = fixture.catalog.volume(1).unwrap().unwrap().metadata;
        assert!(metadata.last_sync_date > 0);
        assert_eq!(metadata.current_sync_date, 0);
        assert_eq!(metadata.group_id, 0);
    }

    #[test]
    fn test_resume_skips_finished_groups() {
        let fixture = create_fixture();
        let hour_ago = Utc::now().timestamp() - 3600;
        let first_mbox = Mailbox::new(1, "a").in_group(1);
        let (_, first) = add_item_at(&fixture, &first_mbox, 1, b"x", hour_ago);
        add_item(&fixture, &Mailbox::new(2, "b").in_group(2), 2, b"y");

        // A previous scan finished group 1 and was interrupted
        let started = Utc::now().timestamp();
        fixture.catalog.add_blob_reference(&first).unwrap();
        fixture
            .catalog
            .update_volume_metadata(1, VolumeMetadata::new(0, started, 1))
            .unwrap();
        // Arrived in group 1 after the interrupted scan began
        add_item_at(&fixture, &Mailbox::new(1, "a").in_group(1), 3, b"z", started);

        let deduper = deduper(&fixture);
        assert_eq!(deduper.run(&[1]), DedupOutcome::Completed);

        let refs = fixture.catalog.volume_blob_references(1).unwrap();
        let mut items: Vec<i32> = refs.iter().map(|r| r.item_id).collect();
        items.sort_unstable();
        // Item 2 from the resumed pass, item 3 from the catch-up pass
        assert_eq!(items, vec![1, 2, 3]);
        assert!(refs.iter().any(|r| r.mailbox_id == MailboxId(2)));
        let metadata = fixture.catalog.volume(1).unwrap().unwrap().metadata;
        assert!(!metadata.is_resuming());
        assert!(metadata.last_sync_date >= started);
    }

    #[test]
    fn test_single_flight() {
        let fixture = create_fixture();
        let deduper = deduper(&fixture);
        assert!(deduper.try_begin(true));
        assert!(deduper.is_running());
        assert_eq!(deduper.run(&[1]), DedupOutcome::AlreadyRunning);
        assert_eq!(deduper.reset_volume_blobs(&[]).unwrap(), DedupOutcome::AlreadyRunning);

        deduper.stop_processing();
        assert!(deduper.stop_requested());
        deduper.state().run = RunState::Idle;
        assert!(!deduper.is_running());
    }

    #[test]
    fn test_stop_cancels_and_keeps_cursor() {
        let fixture = create_fixture();
        add_item(&fixture, &Mailbox::new(1, "a").in_group(1), 1, b"x");
        add_item(&fixture, &Mailbox::new(2, "b").in_group(2), 2, b"x");

        let deduper = deduper(&fixture);
        assert!(deduper.try_begin(true));
        deduper.stop_processing();
        let outcome = deduper.run_volumes(&[1]);
        deduper.state().run = RunState::Idle;

        assert_eq!(outcome, DedupOutcome::Cancelled);
        let metadata = fixture.catalog.volume(1).unwrap().unwrap().metadata;
        assert!(metadata.is_resuming());
        assert_eq!(metadata.group_id, 1);

        // The next run resumes and finishes
        assert_eq!(deduper.run(&[1]), DedupOutcome::Completed);
        assert_eq!(deduper.count_and_size().0, 1);
        assert!(!fixture.catalog.volume(1).unwrap().unwrap().metadata.is_resuming());
    }

    #[test]
    fn test_reset_volume_blobs() {
        let fixture = create_fixture();
        add_item(&fixture, &Mailbox::new(1, "a"), 1, b"x");
        let deduper = deduper(&fixture);
        deduper.run(&[1]);
        assert!(!fixture.catalog.volume_blob_references(1).unwrap().is_empty());

        assert_eq!(deduper.reset_volume_blobs(&[1]).unwrap(), DedupOutcome::Completed);
        assert!(fixture.catalog.volume_blob_references(1).unwrap().is_empty());
        assert_eq!(
            fixture.catalog.volume(1).unwrap().unwrap().metadata,
            VolumeMetadata::default()
        );

        deduper.run(&[1]);
        assert_eq!(deduper.reset_volume_blobs(&[]).unwrap(), DedupOutcome::Completed);
        assert!(fixture.catalog.volume_blob_references(1).unwrap().is_empty());
        assert!(deduper.reset_volume_blobs(&[9]).is_err());
        assert!(!deduper.is_running());
    }

    #[test]
    fn test_background_process() {
        let fixture = create_fixture();
        let mbox = Mailbox::new(5, "acct");
        for i in 1..=2 {
            add_item(&fixture, &mbox, i, b"same");
        }
        let deduper = Arc::new(deduper(&fixture));
        let handle = match deduper.process(vec![1]).unwrap() {
            DedupStart::Started(handle) => handle,
            DedupStart::AlreadyRunning => panic!("deduper was idle"),
        };
        assert_eq!(handle.join().unwrap(), DedupOutcome::Completed);
        assert!(!deduper.is_running());
        assert_eq!(deduper.count_and_size().0, 1);
    }

    #[test]
    fn test_unknown_volume_is_logged_not_fatal() {
        let fixture = create_fixture();
        let deduper = deduper(&fixture);
        assert_eq!(deduper.run(&[42]), DedupOutcome::Completed);
    }
}
