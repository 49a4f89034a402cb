//! Fetch Coordinator
//!
//! Pulls a byte span from the backing store in fixed-size chunks and hands
//! each chunk to a bounded sink as soon as it is complete. Upstream fan-out
//! per identifier is capped by a [`FetchSlot`]; a request that cannot get a
//! slot within the queue timeout fails with `Overloaded` instead of hanging.
//!
//! A fetch has two phases so the HTTP layer can tell a clean failure from a
//! torn response:
//! 1. [`FetchCoordinator::begin`] acquires the slot, opens the upstream range
//!    and reads the first chunk. Nothing has been sent to the client yet.
//! 2. [`FetchStream::pump`] forwards the remaining chunks. Errors from here
//!    on can only be logged and end the connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::config::FetchConfig;
use crate::error::{Result, StreamError};
use crate::store::{BackingStore, ByteStream, FileId};
use crate::stream::range::ByteRange;

/// Seconds a rejected client is told to wait
const OVERLOADED_RETRY_AFTER_SECS: u64 = 1;

/// Receiving end of a fetch; closed when the client disconnects
pub type ChunkSink = mpsc::Sender<Result<Bytes>>;

/// Permits and waiters for one identifier
struct FileSlots {
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
}

type SlotMap = DashMap<FileId, Arc<FileSlots>>;

/// Holds a place in an identifier's wait queue
struct QueuePosition<'a>(&'a AtomicUsize);

impl Drop for QueuePosition<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-identifier permit limiting concurrent upstream fetches
///
/// The identifier's entry is created on first use and dropped from the map
/// once the last permit is returned and nobody is queued on it.
pub struct FetchSlot {
    id: FileId,
    permit: Option<OwnedSemaphorePermit>,
    entry: Option<Arc<FileSlots>>,
    slots: Arc<SlotMap>,
}

impl Drop for FetchSlot {
    fn drop(&mut self) {
        // Let go of our own handles first so the strong count reflects other holders only
        drop(self.permit.take());
        drop(self.entry.take());
        let removed = self
            .slots
            .remove_if(&self.id, |_, entry| Arc::strong_count(entry) == 1)
            .is_some();
        trace!(file_id = %self.id, removed, "Released fetch slot");
    }
}

pub struct FetchCoordinator {
    store: Arc<dyn BackingStore>,
    slots: Arc<SlotMap>,
    config: FetchConfig,
}

impl FetchCoordinator {
    pub fn new(store: Arc<dyn BackingStore>, config: FetchConfig) -> Self {
        Self {
            store,
            slots: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Number of identifiers with an active or queued fetch
    pub fn active_files(&self) -> usize {
        self.slots.len()
    }

    /// Acquire a fetch slot for `id`
    ///
    /// A busy identifier admits at most `max_queued_per_file` waiters, each
    /// for at most the queue timeout. Anyone beyond that is `Overloaded`.
    pub async fn acquire_slot(&self, id: &FileId) -> Result<FetchSlot> {
        let entry = {
            let entry = self.slots.entry(id.clone()).or_insert_with(|| {
                Arc::new(FileSlots {
                    permits: Arc::new(Semaphore::new(self.config.max_per_file)),
                    queued: AtomicUsize::new(0),
                })
            });
            Arc::clone(entry.value())
        };

        let overloaded = || StreamError::Overloaded {
            file_id: id.to_string(),
            retry_after_secs: OVERLOADED_RETRY_AFTER_SECS,
        };

        let permit = match Arc::clone(&entry.permits).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(_) if self.config.queue_timeout.is_zero() => Err(overloaded()),
            Err(_) => {
                let ahead = entry.queued.fetch_add(1, Ordering::SeqCst);
                let _position = QueuePosition(&entry.queued);
                if ahead >= self.config.max_queued_per_file {
                    Err(overloaded())
                } else {
                    debug!(file_id = %id, ahead, "Fetch slots busy, queueing");
                    let queued = Arc::clone(&entry.permits).acquire_owned();
                    match tokio::time::timeout(self.config.queue_timeout, queued).await {
                        Ok(Ok(permit)) => Ok(permit),
                        _ => Err(overloaded()),
                    }
                }
            }
        };

        // Build the slot even on failure so its Drop prunes the map entry
        let mut slot = FetchSlot {
            id: id.clone(),
            permit: None,
            entry: Some(entry),
            slots: Arc::clone(&self.slots),
        };
        match permit {
            Ok(permit) => {
                slot.permit = Some(permit);
                Ok(slot)
            }
            Err(e) => {
                warn!(file_id = %id, max = self.config.max_per_file, "Rejecting fetch, slots exhausted");
                Err(e)
            }
        }
    }

    /// Start fetching `range` of `id`
    ///
    /// Any error returned here happened before a byte reached the client.
    pub async fn begin(&self, id: &FileId, range: ByteRange) -> Result<FetchStream> {
        if range.is_empty() {
            return Err(StreamError::BadRequest(format!(
                "empty span {}-{}",
                range.start, range.end
            )));
        }
        let slot = self.acquire_slot(id).await?;
        let deadline = self.config.upstream_timeout;

        let upstream = match tokio::time::timeout(
            deadline,
            self.store.open_range(id, range.start, range.end),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(StreamError::UpstreamTimeout(format!(
                    "opening {} bytes {}-{} exceeded {:?}",
                    id, range.start, range.end, deadline
                )))
            }
        };

        debug!(file_id = %id, start = range.start, end = range.end, "Upstream range opened");

        let mut stream = FetchStream {
            id: id.clone(),
            upstream,
            pending: BytesMut::new(),
            first: None,
            remaining: range.len(),
            chunk_size: self.config.chunk_size,
            read_timeout: deadline,
            _slot: slot,
        };
        stream.first = stream.next_chunk().await?;
        Ok(stream)
    }
}

/// An opened upstream read, holding its fetch slot until dropped
pub struct FetchStream {
    id: FileId,
    upstream: ByteStream,
    /// Bytes received but not yet emitted as a full chunk
    pending: BytesMut,
    /// Chunk read during `begin`
    first: Option<Bytes>,
    /// Bytes of the range not yet emitted
    remaining: u64,
    chunk_size: usize,
    read_timeout: Duration,
    _slot: FetchSlot,
}

impl FetchStream {
    /// Next chunk of at most `chunk_size` bytes, `None` once the range is done
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = self.remaining.min(self.chunk_size as u64) as usize;

        while self.pending.len() < want {
            let piece = match tokio::time::timeout(self.read_timeout, self.upstream.next()).await {
                Ok(Some(Ok(piece))) => piece,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => {
                    return Err(StreamError::Upstream(format!(
                        "upstream for {} ended with {} bytes outstanding",
                        self.id,
                        self.remaining - self.pending.len() as u64
                    )))
                }
                Err(_) => {
                    return Err(StreamError::UpstreamTimeout(format!(
                        "chunk read for {} exceeded {:?}",
                        self.id, self.read_timeout
                    )))
                }
            };
            self.pending.extend_from_slice(&piece);
        }

        let chunk = self.pending.split_to(want).freeze();
        self.remaining -= chunk.len() as u64;
        if self.remaining == 0 {
            // Anything past the range end is the adapter over-delivering
            self.pending.clear();
        }
        Ok(Some(chunk))
    }

    /// Forward the whole range into `sink`
    ///
    /// Returns the number of bytes delivered. Stops with `Cancelled` as soon as
    /// the sink is closed, dropping the upstream read and the slot with it.
    pub async fn pump(mut self, sink: &ChunkSink) -> Result<u64> {
        let mut sent = 0u64;

        if let Some(chunk) = self.first.take() {
            sent += chunk.len() as u64;
            if sink.send(Ok(chunk)).await.is_err() {
                return Err(StreamError::Cancelled);
            }
        }

        loop {
            // Poll the sink alongside the read so a disconnect aborts a stalled upstream
            let next = tokio::select! {
                biased;
                _ = sink.closed() => return Err(StreamError::Cancelled),
                next = self.next_chunk() => next?,
            };
            let Some(chunk) = next else { break };

            sent += chunk.len() as u64;
            if sink.send(Ok(chunk)).await.is_err() {
                return Err(StreamError::Cancelled);
            }
        }

        trace!(file_id = %self.id, bytes = sent, "Range fully delivered");
        Ok(sent)
    }
}
