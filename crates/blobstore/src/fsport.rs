//! Filesystem link port
//!
//! Hard links and inode numbers are POSIX behaviour. Everything that needs
//! them goes through [`LinkPort`], so platforms without hard links can fall
//! back to copying: no space is saved, but every path still holds the
//! right content.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::models::FileInfo;

pub trait LinkPort: Send + Sync {
    /// Inode facts for a path, `None` if it does not exist
    fn file_info(&self, path: &Path) -> io::Result<Option<FileInfo>>;

    /// Make `dst` a new name for the content at `src`; `dst` must not exist
    fn link(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Whether `link` shares storage (true) or duplicates it (false)
    fn shares_storage(&self) -> bool;
}

/// Real hard links
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct HardLinkPort;

#[cfg(unix)]
impl LinkPort for HardLinkPort {
    fn file_info(&self, path: &Path) -> io::Result<Option<FileInfo>> {
        use std::os::unix::fs::MetadataExt;

        match fs::metadata(path) {
            Ok(meta) => Ok(Some(FileInfo {
                inode: meta.ino(),
                size: meta.len(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn link(&self, src: &Path, dst: &Path) -> io::Result<()> {
        fs::hard_link(src, dst)
    }

    fn shares_storage(&self) -> bool {
        true
    }
}

/// Copy-based fallback
///
/// Every path is its own "inode", identified by a hash of the path.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyLinkPort;

impl LinkPort for CopyLinkPort {
    fn file_info(&self, path: &Path) -> io::Result<Option<FileInfo>> {
        use std::hash::{Hash, Hasher};

        match fs::metadata(path) {
            Ok(meta) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                path.hash(&mut hasher);
                // zero means "no inode" to callers
                let inode = hasher.finish().max(1);
                Ok(Some(FileInfo {
                    inode,
                    size: meta.len(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn link(&self, src: &Path, dst: &Path) -> io::Result<()> {
        if dst.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", dst.display()),
            ));
        }
        fs::copy(src, dst).map(|_| ())
    }

    fn shares_storage(&self) -> bool {
        false
    }
}

/// Hard links where the platform has them, copies elsewhere
pub fn default_link_port() -> Arc<dyn LinkPort> {
    #[cfg(unix)]
    {
        Arc::new(HardLinkPort)
    }
    #[cfg(not(unix))]
    {
        Arc::new(CopyLinkPort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[cfg(unix)]
    #[test]
    fn test_hard_link_shares_inode() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").unwrap();

        let port = HardLinkPort;
        port.link(&a, &b).unwrap();

        let ia = port.file_info(&a).unwrap().unwrap();
        let ib = port.file_info(&b).unwrap().unwrap();
        assert_eq!(ia.inode, ib.inode);
        assert_eq!(ia.size, 4);
    }

    #[test]
    fn test_copy_port_keeps_distinct_files() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").unwrap();

        let port = CopyLinkPort;
        port.link(&a, &b).unwrap();
        assert_eq!(fs::read(&b).unwrap(), b"same");
        assert!(port.link(&a, &b).is_err());

        let ia = port.file_info(&a).unwrap().unwrap();
        let ib = port.file_info(&b).unwrap().unwrap();
        assert_ne!(ia.inode, ib.inode);
        assert!(!port.shares_storage());
    }

    #[test]
    fn test_missing_file_info() {
        let dir = tempdir().unwrap();
        let port = default_link_port();
        assert!(port.file_info(&dir.path().join("nope")).unwrap().is_none());
    }
}
