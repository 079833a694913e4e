//! SHA-256 content digests and the digesting reader used while staging

use std::fmt;
use std::io::{self, Read};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// SHA-256 of a blob's raw (uncompressed) bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Digest a byte slice in one go
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Digest everything a reader yields
    pub fn of_reader(reader: &mut dyn Read) -> io::Result<(Self, u64)> {
        let mut digesting = DigestingReader::new(reader);
        io::copy(&mut digesting, &mut io::sink())?;
        Ok(digesting.finish())
    }

    /// Lowercase hex, the form content-addressable locators use
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Unpadded base64url, the form stored in blob metadata
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parse either the hex or the base64url form
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = if s.len() == 64 {
            hex::decode(s).ok()?
        } else {
            URL_SAFE_NO_PAD.decode(s).ok()?
        };
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64url())
    }
}

/// Reader filter that hashes and counts every byte passing through
pub struct DigestingReader<R> {
    inner: R,
    hasher: Sha256,
    position: u64,
}

impl<R: Read> DigestingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            position: 0,
        }
    }

    /// Bytes read so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Digest and byte count of everything read so far
    pub fn finish(self) -> (ContentDigest, u64) {
        (ContentDigest(self.hasher.finalize().into()), self.position)
    }
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

/// Incremental digest for writers (used by `BlobBuilder`)
#[derive(Debug, Default)]
pub(crate) struct StreamingDigest(Sha256);

impl StreamingDigest {
    pub(crate) fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub(crate) fn finish(self) -> ContentDigest {
        ContentDigest(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_HEX: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_hex_matches_known_sha256() {
        assert_eq!(ContentDigest::of(b"hello world").to_hex(), HELLO_HEX);
    }

    #[test]
    fn test_parse_both_forms() {
        let digest = ContentDigest::of(b"hello world");
        assert_eq!(ContentDigest::parse(&digest.to_hex()), Some(digest));
        assert_eq!(ContentDigest::parse(&digest.to_base64url()), Some(digest));
        assert_eq!(ContentDigest::parse("not a digest"), None);
    }

    #[test]
    fn test_digesting_reader_counts_and_hashes() {
        let data = b"hello world";
        let mut reader = DigestingReader::new(&data[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(reader.position(), 11);

        let (digest, size) = reader.finish();
        assert_eq!(size, 11);
        assert_eq!(digest.to_hex(), HELLO_HEX);
        assert_eq!(out, data);
    }

    #[test]
    fn test_empty_input() {
        let (digest, size) = ContentDigest::of_reader(&mut &b""[..]).unwrap();
        assert_eq!(size, 0);
        assert_eq!(digest, ContentDigest::of(b""));
    }
}
