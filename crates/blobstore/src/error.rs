//! Typed errors callers branch on
//!
//! Everything else travels as `anyhow::Error` with context attached.
//! Use `err.downcast_ref::<T>()` to recognise one of these.

/// A storage backend failed (remote call, credentials, connectivity)
#[derive(Debug, thiserror::Error)]
#[error("storage backend failure: {message}")]
pub struct BackendError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Content is not present at the given locator
#[derive(Debug, thiserror::Error)]
#[error("blob not found: {locator}")]
pub struct BlobNotFound {
    pub locator: String,
}

/// Resumable upload: local and remote byte counts disagree
///
/// The upload must be discarded and restarted by the client.
#[derive(Debug, thiserror::Error)]
#[error("upload size mismatch: {local} bytes written locally, remote reports {remote}")]
pub struct UploadSizeMismatch {
    pub local: u64,
    pub remote: u64,
}

/// A `BlobBuilder` was used after `finish()`
#[derive(Debug, thiserror::Error)]
#[error("blob builder is already finished")]
pub struct BuilderFinished;

/// Staged content hashed differently from the blob it was read from
#[derive(Debug, thiserror::Error)]
#[error("digest changed while staging: expected {expected}, wrote {actual}")]
pub struct DigestMismatch {
    pub expected: String,
    pub actual: String,
}

/// Returns true if the error chain contains a [`BlobNotFound`] or an
/// `io::ErrorKind::NotFound`
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<BlobNotFound>().is_some()
            || cause
                .downcast_ref::<std::io::Error>()
                .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_downcast_size_mismatch() {
        let err: anyhow::Error = UploadSizeMismatch { local: 10, remote: 9 }.into();
        let mismatch = err.downcast_ref::<UploadSizeMismatch>().unwrap();
        assert_eq!(mismatch.local, 10);
        assert_eq!(mismatch.remote, 9);
    }

    #[test]
    fn test_is_not_found_through_context() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Err::<(), _>(io).context("reading blob").unwrap_err();
        assert!(is_not_found(&err));

        let err: anyhow::Error = BlobNotFound {
            locator: "abc".into(),
        }
        .into();
        assert!(is_not_found(&err));

        let err: anyhow::Error = BackendError::new("timeout").into();
        assert!(!is_not_found(&err));
    }
}
