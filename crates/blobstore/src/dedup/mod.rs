//! Hard-link deduplication of local message volumes
//!
//! [`BlobDeduper`] walks a volume's blob references, groups them by digest,
//! and relinks duplicates onto one inode. Progress and the scan cursor live
//! in a [`BlobCatalog`] so runs can be stopped and resumed.

mod catalog;
mod deduper;
mod memory;
mod sqlite;

pub use catalog::BlobCatalog;
pub use deduper::{BlobDeduper, DedupOutcome, DedupStart};
pub use memory::InMemoryBlobCatalog;
pub use sqlite::SqliteBlobCatalog;
