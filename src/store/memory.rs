//! In-process backing store
//!
//! Serves objects from memory for the test suites. Supports artificial
//! latency and mid-stream faults so the coordinator's timeout and abort
//! paths can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::errors::StoreError;
use super::types::{ByteStream, FileId, FileMetadata};
use super::BackingStore;

/// Size of the pieces a range read is split into
const DEFAULT_PIECE_SIZE: usize = 64 * 1024;

struct StoredFile {
    data: Bytes,
    content_type: Option<String>,
    file_name: Option<String>,
}

/// Decrements the open-stream gauge when a range stream is dropped
struct OpenStreamGuard(Arc<AtomicUsize>);

impl Drop for OpenStreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Memory-backed store with call counters
pub struct MemoryStore {
    files: RwLock<HashMap<FileId, StoredFile>>,
    piece_size: usize,
    metadata_delay: Duration,
    piece_delay: Duration,
    /// Fail the stream once this many bytes of a range have been produced
    fail_after: Option<u64>,
    metadata_calls: AtomicU64,
    open_calls: AtomicU64,
    open_streams: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            piece_size: DEFAULT_PIECE_SIZE,
            metadata_delay: Duration::ZERO,
            piece_delay: Duration::ZERO,
            fail_after: None,
            metadata_calls: AtomicU64::new(0),
            open_calls: AtomicU64::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_piece_size(mut self, piece_size: usize) -> Self {
        self.piece_size = piece_size.max(1);
        self
    }

    pub fn with_metadata_delay(mut self, delay: Duration) -> Self {
        self.metadata_delay = delay;
        self
    }

    pub fn with_piece_delay(mut self, delay: Duration) -> Self {
        self.piece_delay = delay;
        self
    }

    pub fn with_fail_after(mut self, bytes: u64) -> Self {
        self.fail_after = Some(bytes);
        self
    }

    /// Add or replace an object
    pub fn insert(
        &self,
        id: &FileId,
        data: impl Into<Bytes>,
        content_type: Option<&str>,
        file_name: Option<&str>,
    ) {
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(
            id.clone(),
            StoredFile {
                data: data.into(),
                content_type: content_type.map(str::to_string),
                file_name: file_name.map(str::to_string),
            },
        );
    }

    /// Number of metadata lookups served
    pub fn metadata_calls(&self) -> u64 {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    /// Number of range reads opened
    pub fn open_calls(&self) -> u64 {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Number of range streams not yet dropped
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn data_for(&self, id: &FileId) -> Result<Bytes, StoreError> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(id)
            .map(|f| f.data.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn fetch_metadata(&self, id: &FileId) -> Result<FileMetadata, StoreError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if !self.metadata_delay.is_zero() {
            tokio::time::sleep(self.metadata_delay).await;
        }

        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let file = files
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let meta = FileMetadata::new(id.clone(), file.data.len() as u64, file.content_type.clone());
        Ok(match &file.file_name {
            Some(name) => meta.with_file_name(name.clone()),
            None => meta,
        })
    }

    async fn open_range(
        &self,
        id: &FileId,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, StoreError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.data_for(id)?;
        if start > end || end >= data.len() as u64 {
            return Err(StoreError::Request(format!(
                "range {}-{} outside object of {} bytes",
                start,
                end,
                data.len()
            )));
        }

        trace!(file_id = %id, start, end, "Opening in-memory range");

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let guard = OpenStreamGuard(Arc::clone(&self.open_streams));
        let span = data.slice(start as usize..=end as usize);
        let piece_size = self.piece_size;
        let piece_delay = self.piece_delay;
        let fail_after = self.fail_after;

        let stream = futures::stream::unfold(
            (span, 0usize, guard),
            move |(span, offset, guard)| async move {
                if offset >= span.len() {
                    return None;
                }
                if let Some(limit) = fail_after {
                    if offset as u64 >= limit {
                        return Some((
                            Err(StoreError::Network("connection reset by backend".into())),
                            (span.slice(0..0), 0, guard),
                        ));
                    }
                }
                if !piece_delay.is_zero() {
                    tokio::time::sleep(piece_delay).await;
                }
                let next = (offset + piece_size).min(span.len());
                let piece = span.slice(offset..next);
                Some((Ok(piece), (span, next, guard)))
            },
        );

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_range_read_and_counters() {
        let store = MemoryStore::new().with_piece_size(3);
        let id = FileId::parse("1_1").unwrap();
        store.insert(&id, b"0123456789".to_vec(), Some("text/plain"), None);

        let meta = store.fetch_metadata(&id).await.unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(meta.content_type, "text/plain");

        let mut stream = store.open_range(&id, 2, 7).await.unwrap();
        assert_eq!(store.open_streams(), 1);
        let mut out = Vec::new();
        while let Some(piece) = stream.next().await {
            out.extend_from_slice(&piece.unwrap());
        }
        assert_eq!(out, b"234567");
        drop(stream);

        assert_eq!(store.open_streams(), 0);
        assert_eq!(store.metadata_calls(), 1);
        assert_eq!(store.open_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let store = MemoryStore::new();
        let id = FileId::parse("404_1").unwrap();
        assert!(matches!(
            store.fetch_metadata(&id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.open_range(&id, 0, 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new().with_piece_size(4).with_fail_after(4);
        let id = FileId::parse("1_2").unwrap();
        store.insert(&id, vec![7u8; 16], None, None);

        let mut stream = store.open_range(&id, 0, 15).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(StoreError::Network(_))
        ));
    }
}
