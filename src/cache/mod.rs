//! Metadata caching layer
//!
//! Memoizes identifier → metadata lookups against the backing store with a
//! fixed TTL, and coalesces concurrent misses for the same identifier.

pub mod metadata;

pub use metadata::MetadataCache;
