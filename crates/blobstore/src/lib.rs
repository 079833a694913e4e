//! Blob storage for a mail server
//!
//! This crate provides:
//! - Local blobs and a streaming builder with optional zstd compression
//! - The [`StoreManager`] contract and its backends (local volumes,
//!   external object stores, content-addressed and single-instance stores)
//! - Resumable uploads that stream to a remote store as they arrive
//! - A hard-link deduper for local message volumes
//!
//! Backends are chosen at startup from [`StoreConfig`] and handed around as
//! `Arc<dyn StoreManager>`.

pub mod config;
pub mod dedup;
pub mod error;
pub mod fsport;
pub mod models;
pub mod store;

pub use config::{BackendConfig, StoreConfig, open_store_manager};
pub use dedup::{
    BlobCatalog, BlobDeduper, DedupOutcome, DedupStart, InMemoryBlobCatalog, SqliteBlobCatalog,
};
pub use error::{
    BackendError, BlobNotFound, BuilderFinished, DigestMismatch, UploadSizeMismatch, is_not_found,
};
pub use fsport::{CopyLinkPort, LinkPort, default_link_port};
#[cfg(unix)]
pub use fsport::HardLinkPort;
pub use models::{
    BlobReference, FileInfo, Mailbox, MailboxBlobInfo, MailboxId, Volume, VolumeId, VolumeKind,
    VolumeMetadata,
};
pub use store::{
    Blob, BlobBuilder, ContentAddressable, ContentDigest, FileBlobStore, IncomingBlob,
    MailboxBlob, ResumableUpload, SingleInstance, StagedBlob, StoreFeature, StoreManager,
};
