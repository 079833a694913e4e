//! Local blob handles and the streaming builder that produces them

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};

use super::digest::{ContentDigest, StreamingDigest};
use crate::error::BuilderFinished;

/// File extension marking zstd-compressed blob files
pub const COMPRESSED_EXTENSION: &str = "zst";

/// Default zstd level (same speed/ratio trade-off the message store uses)
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// A local file holding blob content
///
/// Raw size and digest are computed on first use when the producer did not
/// already know them. A blob carrying an `upload_id` was streamed to a
/// remote store while it was being written locally.
#[derive(Debug, Clone)]
pub struct Blob {
    path: PathBuf,
    compressed: bool,
    raw_size: OnceLock<u64>,
    digest: OnceLock<ContentDigest>,
    upload_id: Option<String>,
}

impl Blob {
    pub(crate) fn new(
        path: PathBuf,
        compressed: bool,
        raw_size: Option<u64>,
        digest: Option<ContentDigest>,
    ) -> Self {
        let blob = Self {
            path,
            compressed,
            raw_size: OnceLock::new(),
            digest: OnceLock::new(),
            upload_id: None,
        };
        if let Some(size) = raw_size {
            let _ = blob.raw_size.set(size);
        }
        if let Some(digest) = digest {
            let _ = blob.digest.set(digest);
        }
        blob
    }

    /// Wrap an existing file; a `.zst` extension means zstd-compressed
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(anyhow::anyhow!("Failed to open blob {}", path.display()));
        }
        let compressed = is_compressed_path(&path);
        Ok(Self::new(path, compressed, None, None))
    }

    /// Mark this blob as the local mirror of a remote resumable upload
    pub fn into_uploaded(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Remote upload id when this blob was streamed by a resumable upload
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Uncompressed content length
    pub fn raw_size(&self) -> Result<u64> {
        if let Some(size) = self.raw_size.get() {
            return Ok(*size);
        }
        let size = if self.compressed {
            io::copy(&mut self.input_stream()?, &mut io::sink())?
        } else {
            self.stored_size()?
        };
        let _ = self.raw_size.set(size);
        Ok(size)
    }

    /// Bytes occupied on disk
    pub fn stored_size(&self) -> Result<u64> {
        let meta = fs::metadata(&self.path)
            .with_context(|| format!("Failed to stat blob {}", self.path.display()))?;
        Ok(meta.len())
    }

    /// SHA-256 of the uncompressed content
    pub fn digest(&self) -> Result<ContentDigest> {
        if let Some(digest) = self.digest.get() {
            return Ok(*digest);
        }
        let (digest, size) = ContentDigest::of_reader(&mut self.input_stream()?)
            .with_context(|| format!("Failed to digest blob {}", self.path.display()))?;
        let _ = self.raw_size.set(size);
        let _ = self.digest.set(digest);
        Ok(digest)
    }

    /// Digest in its stored (base64url) form
    pub fn digest_string(&self) -> Result<String> {
        Ok(self.digest()?.to_base64url())
    }

    /// Reader over the uncompressed content
    pub fn input_stream(&self) -> Result<Box<dyn Read + Send>> {
        open_content(&self.path, self.compressed)
    }

    /// Whole uncompressed content in memory
    pub fn content(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.input_stream()?.read_to_end(&mut data)?;
        Ok(data)
    }
}

/// Open a blob file, decompressing when asked
pub(crate) fn open_content(path: &Path, compressed: bool) -> Result<Box<dyn Read + Send>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open blob {}", path.display()))?;
    if compressed {
        let decoder = zstd::Decoder::new(file).context("Failed to start blob decompression")?;
        Ok(Box::new(decoder))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Whether a blob file name marks it as compressed
pub fn is_compressed_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == COMPRESSED_EXTENSION)
}

/// Accumulates streamed content into a local file and yields one [`Blob`]
///
/// Appends are only legal before [`finish`](Self::finish). Content larger
/// than the compression threshold is zstd-compressed at finish time unless
/// compression was disabled.
#[derive(Debug)]
pub struct BlobBuilder {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    digest: Option<StreamingDigest>,
    total_bytes: u64,
    size_hint: u64,
    compression_threshold: Option<u64>,
    disable_compression: bool,
    finished: bool,
}

impl BlobBuilder {
    /// Start a new blob file in `dir`
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create incoming directory {}", dir.display()))?;
        let path = dir.join(format!("{}.msg", uuid::Uuid::new_v4()));
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Failed to create blob file {}", path.display()))?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            digest: Some(StreamingDigest::default()),
            total_bytes: 0,
            size_hint: 0,
            compression_threshold: None,
            disable_compression: false,
            finished: false,
        })
    }

    /// Compress the result when it grows beyond `threshold` bytes
    pub fn with_compression_threshold(mut self, threshold: Option<u64>) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn set_size_hint(&mut self, size: u64) -> &mut Self {
        self.size_hint = size;
        self
    }

    pub fn size_hint(&self) -> u64 {
        self.size_hint
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn compression_threshold(&self) -> Option<u64> {
        self.compression_threshold
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Skip the streaming digest; the blob will hash itself lazily if asked
    pub fn disable_digest(&mut self, disable: bool) -> &mut Self {
        if disable {
            self.digest = None;
        } else if self.digest.is_none() && self.total_bytes == 0 {
            self.digest = Some(StreamingDigest::default());
        }
        self
    }

    pub fn disable_compression(&mut self, disable: bool) -> &mut Self {
        self.disable_compression = disable;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn append(&mut self, data: &[u8]) -> Result<&mut Self> {
        if self.finished {
            return Err(BuilderFinished.into());
        }
        let writer = self.writer.as_mut().ok_or(BuilderFinished)?;
        writer
            .write_all(data)
            .with_context(|| format!("Failed to write blob file {}", self.path.display()))?;
        if let Some(digest) = self.digest.as_mut() {
            digest.update(data);
        }
        self.total_bytes += data.len() as u64;
        Ok(self)
    }

    /// Append everything the reader yields, returning the byte count
    pub fn append_reader(&mut self, reader: &mut dyn Read) -> Result<u64> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut copied = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read incoming content"),
            };
            self.append(&buf[..n])?;
            copied += n as u64;
        }
        Ok(copied)
    }

    /// Close the file and produce the blob
    pub fn finish(&mut self) -> Result<Blob> {
        if self.finished {
            return Err(BuilderFinished.into());
        }
        self.finished = true;

        let mut writer = self.writer.take().ok_or(BuilderFinished)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        let compress = !self.disable_compression
            && self
                .compression_threshold
                .is_some_and(|threshold| self.total_bytes > threshold);
        if compress {
            self.path = compress_file(&self.path)?;
        }

        Ok(Blob::new(
            self.path.clone(),
            compress,
            Some(self.total_bytes),
            self.digest.take().map(StreamingDigest::finish),
        ))
    }

    /// Abandon the builder and remove its file
    pub fn dispose(&mut self) {
        self.writer = None;
        if !self.finished {
            self.finished = true;
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("[STORE] Failed to remove {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

impl Write for BlobBuilder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for BlobBuilder {
    fn drop(&mut self) {
        if !self.finished {
            self.dispose();
        }
    }
}

/// Replace a raw file with a zstd-compressed `<name>.zst` (write temp, then rename)
fn compress_file(path: &Path) -> Result<PathBuf> {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(COMPRESSED_EXTENSION);
    let compressed_path = PathBuf::from(name);
    let temp_path = compressed_path.with_extension("zst.tmp");
    {
        let mut input = BufReader::new(File::open(path)?);
        let output = BufWriter::new(File::create(&temp_path)?);
        let mut encoder = zstd::Encoder::new(output, DEFAULT_COMPRESSION_LEVEL)?;
        io::copy(&mut input, &mut encoder)?;
        let mut output = encoder.finish().context("Failed to compress blob")?;
        output.flush()?;
    }
    fs::rename(&temp_path, &compressed_path).with_context(|| {
        format!("Failed to replace {} with compressed copy", path.display())
    })?;
    fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
    Ok(compressed_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_builder_produces_blob() {
        let dir = tempdir().unwrap();
        let mut builder = BlobBuilder::create(dir.path()).unwrap();
        builder.append(b"hello ").unwrap();
        builder.append(b"world").unwrap();
        assert_eq!(builder.total_bytes(), 11);

        let blob = builder.finish().unwrap();
        assert_eq!(blob.raw_size().unwrap(), 11);
        assert!(!blob.is_compressed());
        assert_eq!(blob.content().unwrap(), b"hello world");
        assert_eq!(blob.digest().unwrap(), ContentDigest::of(b"hello world"));
    }

    #[test]
    fn test_append_after_finish_fails() {
        let dir = tempdir().unwrap();
        let mut builder = BlobBuilder::create(dir.path()).unwrap();
        builder.append(b"data").unwrap();
        builder.finish().unwrap();

        let err = builder.append(b"more").unwrap_err();
        assert!(err.downcast_ref::<BuilderFinished>().is_some());
        assert!(builder.finish().is_err());
        assert!(builder.is_finished());
    }

    #[test]
    fn test_compression_above_threshold() {
        let dir = tempdir().unwrap();
        let data = "Subject: hello\r\n\r\n".repeat(500);
        let mut builder = BlobBuilder::create(dir.path())
            .unwrap()
            .with_compression_threshold(Some(100));
        builder.append(data.as_bytes()).unwrap();

        let blob = builder.finish().unwrap();
        assert!(blob.is_compressed());
        assert!(blob.stored_size().unwrap() < data.len() as u64);
        assert_eq!(blob.content().unwrap(), data.as_bytes());

        // The file name carries the compression
        assert_eq!(blob.path().extension().unwrap(), COMPRESSED_EXTENSION);
        assert!(!blob.path().with_extension("").exists());
        let reopened = Blob::from_file(blob.path()).unwrap();
        assert!(reopened.is_compressed());
        assert_eq!(reopened.raw_size().unwrap(), data.len() as u64);
    }

    #[test]
    fn test_disable_compression() {
        let dir = tempdir().unwrap();
        let data = vec![b'a'; 10_000];
        let mut builder = BlobBuilder::create(dir.path())
            .unwrap()
            .with_compression_threshold(Some(100));
        builder.disable_compression(true);
        builder.append(&data).unwrap();

        let blob = builder.finish().unwrap();
        assert!(!blob.is_compressed());
        assert_eq!(blob.stored_size().unwrap(), 10_000);
    }

    #[test]
    fn test_disabled_digest_computed_lazily() {
        let dir = tempdir().unwrap();
        let mut builder = BlobBuilder::create(dir.path()).unwrap();
        builder.disable_digest(true);
        builder.append(b"lazy").unwrap();

        let blob = builder.finish().unwrap();
        assert_eq!(blob.digest().unwrap(), ContentDigest::of(b"lazy"));
    }

    #[test]
    fn test_empty_blob() {
        let dir = tempdir().unwrap();
        let mut builder = BlobBuilder::create(dir.path()).unwrap();
        let blob = builder.finish().unwrap();
        assert_eq!(blob.raw_size().unwrap(), 0);
        assert!(blob.content().unwrap().is_empty());
        assert!(!Blob::from_file(blob.path()).unwrap().is_compressed());
    }

    #[test]
    fn test_dispose_removes_file() {
        let dir = tempdir().unwrap();
        let mut builder = BlobBuilder::create(dir.path()).unwrap();
        builder.append(b"abandoned").unwrap();
        let path = builder.path().to_path_buf();
        assert!(path.exists());

        builder.dispose();
        assert!(!path.exists());
    }

    #[test]
    fn test_write_impl_with_io_copy() {
        let dir = tempdir().unwrap();
        let mut builder = BlobBuilder::create(dir.path()).unwrap();
        let data = vec![7u8; 200_000];
        io::copy(&mut data.as_slice(), &mut builder).unwrap();

        let blob = builder.finish().unwrap();
        assert_eq!(blob.raw_size().unwrap(), 200_000);
    }
}
