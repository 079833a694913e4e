//! Directory-backed remote store
//!
//! Stands in for an object store: each account gets a directory and every
//! write lands in a fresh `zimbrablob[_N].msg` file, never overwriting an
//! existing one. With an upload directory configured it also accepts
//! resumable uploads, one `upload-<id>[_N].upl` file per upload.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::debug;

use super::external::{ExternalBackend, ExternalStoreManager};
use super::resumable::{RemoteUpload, ResumableBackend};
use super::traits::delete_quietly;
use crate::models::Mailbox;

const BLOB_BASE_NAME: &str = "zimbrablob";
const BLOB_EXTENSION: &str = "msg";
const UPLOAD_EXTENSION: &str = "upl";

pub type SimpleStoreManager = ExternalStoreManager<SimpleStore>;

pub struct SimpleStore {
    base_dir: PathBuf,
    upload_dir: Option<PathBuf>,
}

impl SimpleStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create store directory {}", base_dir.display()))?;
        Ok(Self {
            base_dir,
            upload_dir: None,
        })
    }

    /// Accept resumable uploads, staging them under `upload_dir`
    pub fn with_uploads(mut self, upload_dir: impl Into<PathBuf>) -> Result<Self> {
        let upload_dir = upload_dir.into();
        fs::create_dir_all(&upload_dir).with_context(|| {
            format!("Failed to create upload directory {}", upload_dir.display())
        })?;
        self.upload_dir = Some(upload_dir);
        Ok(self)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn account_dir(&self, mbox: &Mailbox) -> PathBuf {
        self.base_dir.join(mbox.account_id())
    }
}

/// Create `<dir>/<base>.<ext>`, or `<base>_1`, `<base>_2`... if taken
fn create_unique(dir: &Path, base: &str, ext: &str) -> Result<(PathBuf, File)> {
    let mut count = 0u32;
    loop {
        let name = if count == 0 {
            format!("{}.{}", base, ext)
        } else {
            format!("{}_{}.{}", base, count, ext)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => count += 1,
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to create {}", path.display())));
            }
        }
    }
}

impl ExternalBackend for SimpleStore {
    fn write_stream_to_store(
        &self,
        data: &mut dyn Read,
        _actual_size: Option<u64>,
        mbox: &Mailbox,
    ) -> Result<String> {
        let dir = self.account_dir(mbox);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create account directory {}", dir.display()))?;
        let (path, mut file) = create_unique(&dir, BLOB_BASE_NAME, BLOB_EXTENSION)?;
        io::copy(data, &mut file)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.sync_all()?;
        debug!("[EXTERNAL] Wrote {}", path.display());
        Ok(path.to_string_lossy().into_owned())
    }

    fn read_stream_from_store(
        &self,
        locator: &str,
        _mbox: &Mailbox,
    ) -> Result<Option<Box<dyn Read + Send>>> {
        match File::open(locator) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to open {}", locator))),
        }
    }

    fn delete_from_store(&self, locator: &str, _mbox: &Mailbox) -> Result<bool> {
        delete_quietly(Path::new(locator))
    }

    fn resumable(&self) -> Option<&dyn ResumableBackend> {
        self.upload_dir.as_ref().map(|_| self as &dyn ResumableBackend)
    }
}

impl ResumableBackend for SimpleStore {
    fn begin_upload(&self, id: &str) -> Result<Box<dyn RemoteUpload>> {
        let dir = self
            .upload_dir
            .as_ref()
            .ok_or_else(|| anyhow!("no upload directory configured"))?;
        let (path, file) = create_unique(dir, &format!("upload-{}", id), UPLOAD_EXTENSION)?;
        debug!("[UPLOAD] Writing to new file {}", path.display());
        Ok(Box::new(FileUpload {
            id: path.to_string_lossy().into_owned(),
            path,
            file,
        }))
    }

    fn finish_upload(&self, upload_id: &str) -> Result<String> {
        if !Path::new(upload_id).exists() {
            return Err(anyhow!("upload {} does not exist", upload_id));
        }
        Ok(upload_id.to_string())
    }
}

/// Remote half of an upload: a plain file, its path doubling as the id
struct FileUpload {
    id: String,
    path: PathBuf,
    file: File,
}

impl RemoteUpload for FileUpload {
    fn upload_id(&self) -> &str {
        &self.id
    }

    fn write_to_external(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .with_context(|| format!("Failed to write upload {}", self.path.display()))
    }

    fn remote_size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)
            .with_context(|| format!("Failed to stat upload {}", self.path.display()))?
            .len())
    }

    fn abort(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
