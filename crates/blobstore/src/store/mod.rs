//! Blob storage backends
//!
//! Every backend implements [`StoreManager`]. The local volume store keeps
//! blobs as files on disk; external stores push content to a remote
//! backend and keep a local cache; content-addressed stores derive the
//! locator from the content hash.

mod blob;
mod cache;
mod cas;
mod digest;
mod external;
mod file;
mod handles;
mod incoming;
mod resumable;
mod simple;
mod traits;

pub use blob::{
    Blob, BlobBuilder, COMPRESSED_EXTENSION, DEFAULT_COMPRESSION_LEVEL, is_compressed_path,
};
pub use cache::ContentCache;
pub use cas::{
    ContentAddressableBackend, ContentAddressableStoreManager, LocalCasStore,
    SimpleCasStoreManager, SingleInstanceBackend,
};
pub use digest::{ContentDigest, DigestingReader};
pub use external::{ExternalBackend, ExternalStoreManager};
pub use file::FileBlobStore;
pub use handles::{MailboxBlob, StagedBlob};
pub use incoming::{BufferedIncomingBlob, IncomingBlob};
pub use resumable::{
    ExternalResumableIncomingBlob, ExternalResumableOutputStream, RemoteUpload, ResumableBackend,
};
pub use simple::{SimpleStore, SimpleStoreManager};
pub use traits::{
    ContentAddressable, ResumableUpload, SingleInstance, StoreFeature, StoreManager,
};
