//! Local content cache for remote stores
//!
//! Keyed by locator. Entries are files under the cache directory so that a
//! cached blob can be handed out like any other local [`Blob`]. There is no
//! eviction: entries go away on explicit removal, on `clear`, or when the
//! same locator is cached again. A cached file that vanished from disk is
//! dropped on lookup so callers fall through to the remote store.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result, anyhow};
use log::{debug, warn};

use super::blob::{Blob, BlobBuilder};
use crate::error::BlobNotFound;

pub struct ContentCache {
    dir: PathBuf,
    entries: RwLock<HashMap<String, Blob>>,
}

impl ContentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        Ok(Self {
            dir,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Cached blob for a locator, if its file is still there
    pub fn get(&self, locator: &str) -> Result<Option<Blob>> {
        let cached = {
            let entries = self
                .entries
                .read()
                .map_err(|_| anyhow!("content cache lock poisoned"))?;
            entries.get(locator).cloned()
        };
        match cached {
            Some(blob) if blob.path().exists() => Ok(Some(blob)),
            Some(_) => {
                debug!("[EXTERNAL] Cached file for {} is gone, dropping entry", locator);
                self.remove(locator)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Cache a copy of a local blob's file
    pub fn put(&self, locator: &str, blob: &Blob) -> Result<Blob> {
        let path = self.new_entry_path();
        if fs::hard_link(blob.path(), &path).is_err() {
            fs::copy(blob.path(), &path).with_context(|| {
                format!("Failed to cache {} for {}", blob.path().display(), locator)
            })?;
        }
        let cached = Blob::new(
            path,
            blob.is_compressed(),
            blob.raw_size().ok(),
            blob.digest().ok(),
        );
        self.insert(locator, cached.clone())?;
        Ok(cached)
    }

    /// Cache whatever a reader yields
    pub fn put_stream(&self, locator: &str, reader: &mut dyn Read) -> Result<Blob> {
        let mut builder = BlobBuilder::create(&self.dir)?;
        builder.append_reader(reader)?;
        let blob = builder.finish()?;
        self.insert(locator, blob.clone())?;
        Ok(blob)
    }

    /// Cached blob, or fetch it with `load` and cache the result
    pub fn get_or_fetch<F>(&self, locator: &str, load: F) -> Result<Blob>
    where
        F: FnOnce() -> Result<Option<Box<dyn Read + Send>>>,
    {
        if let Some(blob) = self.get(locator)? {
            return Ok(blob);
        }
        match load()? {
            Some(mut reader) => self.put_stream(locator, &mut reader),
            None => Err(BlobNotFound {
                locator: locator.to_string(),
            }
            .into()),
        }
    }

    pub fn remove(&self, locator: &str) -> Result<()> {
        let removed = self
            .entries
            .write()
            .map_err(|_| anyhow!("content cache lock poisoned"))?
            .remove(locator);
        if let Some(blob) = removed {
            remove_file_quietly(&blob);
        }
        Ok(())
    }

    /// Drop every entry
    pub fn clear(&self) -> Result<()> {
        let drained: Vec<Blob> = self
            .entries
            .write()
            .map_err(|_| anyhow!("content cache lock poisoned"))?
            .drain()
            .map(|(_, blob)| blob)
            .collect();
        for blob in &drained {
            remove_file_quietly(blob);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, locator: &str, blob: Blob) -> Result<()> {
        let previous = self
            .entries
            .write()
            .map_err(|_| anyhow!("content cache lock poisoned"))?
            .insert(locator.to_string(), blob);
        if let Some(old) = previous {
            remove_file_quietly(&old);
        }
        Ok(())
    }

    fn new_entry_path(&self) -> PathBuf {
        self.dir.join(format!("{}.cache", uuid::Uuid::new_v4()))
    }
}

fn remove_file_quietly(blob: &Blob) {
    if let Err(e) = fs::remove_file(blob.path()) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("[EXTERNAL] Failed to remove cached {}: {}", blob.path().display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_blob(dir: &std::path::Path, data: &[u8]) -> Blob {
        let mut builder = BlobBuilder::create(dir).unwrap();
        builder.append(data).unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().join("cache")).unwrap();
        let blob = make_blob(dir.path(), b"cached bytes");

        let cached = cache.put("loc-1", &blob).unwrap();
        assert_ne!(cached.path(), blob.path());
        assert_eq!(cache.get("loc-1").unwrap().unwrap().content().unwrap(), b"cached bytes");

        // Source can go away; the cache keeps its own copy
        fs::remove_file(blob.path()).unwrap();
        assert!(cache.get("loc-1").unwrap().is_some());

        cache.remove("loc-1").unwrap();
        assert!(cache.get("loc-1").unwrap().is_none());
        assert!(!cached.path().exists());
    }

    #[test]
    fn test_vanished_file_drops_entry() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().join("cache")).unwrap();
        let cached = cache.put_stream("loc", &mut &b"abc"[..]).unwrap();

        fs::remove_file(cached.path()).unwrap();
        assert!(cache.get("loc").unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_or_fetch() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().join("cache")).unwrap();

        let blob = cache
            .get_or_fetch("remote", || Ok(Some(Box::new(&b"from remote"[..]))))
            .unwrap();
        assert_eq!(blob.content().unwrap(), b"from remote");

        // Second lookup is served from the cache
        let blob = cache
            .get_or_fetch("remote", || panic!("should not fetch"))
            .unwrap();
        assert_eq!(blob.content().unwrap(), b"from remote");

        let err = cache.get_or_fetch("missing", || Ok(None)).unwrap_err();
        assert!(err.downcast_ref::<BlobNotFound>().is_some());
    }

    #[test]
    fn test_overwrite_and_clear() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path().join("cache")).unwrap();
        let first = cache.put_stream("loc", &mut &b"one"[..]).unwrap();
        cache.put_stream("loc", &mut &b"two"[..]).unwrap();
        assert!(!first.path().exists());
        assert_eq!(cache.len(), 1);

        cache.clear().unwrap();
        assert!(cache.is_empty());
    }
}
