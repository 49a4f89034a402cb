//! Backing store adapter boundary
//!
//! The streaming core only ever talks to the remote object store through
//! [`BackingStore`]. How the adapter authenticates or rate-limits is its own
//! business.

pub mod client;
pub mod errors;
#[cfg(test)]
pub mod memory;
pub mod types;

use async_trait::async_trait;

pub use client::HttpStore;
pub use errors::StoreError;
#[cfg(test)]
pub use memory::MemoryStore;
pub use types::*;

#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Look up size, content type and name of a remote object
    async fn fetch_metadata(&self, id: &FileId) -> Result<FileMetadata, StoreError>;

    /// Open a reader over the inclusive byte span `start..=end`
    async fn open_range(&self, id: &FileId, start: u64, end: u64)
        -> Result<ByteStream, StoreError>;
}
