//! Queue interface consumed by the dispatch engine, plus an in-memory queue.
//!
//! Entries stay in the queue while a delivery attempt is running; a worker
//! only *peeks* a batch and removes it (commits) once the send succeeded.

use std::{
    cmp::Reverse,
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_common::tracing::trace;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    error::{DispatchError, SystemError},
    priority::Priority,
};

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// A queued message with its redelivery bookkeeping.
///
/// Clones share the redelivery counter and outcome slot, so a batch peeked
/// from a queue updates the queued entry in place.
#[derive(Clone)]
pub struct QueueEntry {
    inner: Arc<EntryInner>,
}

struct EntryInner {
    id: u64,
    priority: Priority,
    key: String,
    payload: Arc<[u8]>,
    redelivered: AtomicU32,
    outcome: Mutex<Option<String>>,
    expires_at: Option<Instant>,
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.inner.id)
            .field("priority", &self.inner.priority)
            .field("key", &self.inner.key)
            .field("bytes", &self.inner.payload.len())
            .field("redelivered", &self.redelivered())
            .finish_non_exhaustive()
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for QueueEntry {}

impl QueueEntry {
    /// Create an entry. Ids increase monotonically in creation order.
    pub fn new(priority: Priority, key: impl Into<String>, payload: impl Into<Arc<[u8]>>) -> Self {
        Self::build(priority, key.into(), payload.into(), None)
    }

    /// Create an entry that is discarded instead of delivered once `ttl` has
    /// passed.
    pub fn expiring(
        priority: Priority,
        key: impl Into<String>,
        payload: impl Into<Arc<[u8]>>,
        ttl: Duration,
    ) -> Self {
        Self::build(priority, key.into(), payload.into(), Some(Instant::now() + ttl))
    }

    fn build(priority: Priority, key: String, payload: Arc<[u8]>, expires_at: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(EntryInner {
                id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
                priority,
                key,
                payload,
                redelivered: AtomicU32::new(0),
                outcome: Mutex::new(None),
                expires_at,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    /// Approximate memory footprint used for burst limits.
    pub fn size_in_bytes(&self) -> u64 {
        u64::try_from(self.inner.payload.len() + self.inner.key.len()).unwrap_or(u64::MAX)
    }

    /// How many failed delivery attempts included this entry.
    pub fn redelivered(&self) -> u32 {
        self.inner.redelivered.load(Ordering::Acquire)
    }

    pub fn increment_redelivered(&self) -> u32 {
        self.inner.redelivered.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record what the endpoint returned for this entry.
    pub fn set_outcome(&self, outcome: impl Into<String>) {
        *self.inner.outcome.lock() = Some(outcome.into());
    }

    pub fn outcome(&self) -> Option<String> {
        self.inner.outcome.lock().clone()
    }

    /// Expired entries are never delivered.
    pub fn is_expired(&self) -> bool {
        self.inner
            .expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }

    fn sort_key(&self) -> (Reverse<Priority>, u64) {
        (Reverse(self.inner.priority), self.inner.id)
    }
}

/// Hook invoked after entries were added to a queue.
#[async_trait]
pub trait QueuePutListener: Send + Sync {
    async fn put_post(&self, added: usize);
}

/// Storage the dispatch engine drains.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append an entry and notify the put listener.
    async fn put(&self, entry: QueueEntry) -> Result<(), DispatchError>;

    /// Return, without removing, the longest run of entries sharing the
    /// highest priority present, in queue order, bounded by `max_entries`
    /// and `max_bytes` (`None` = unbounded). A non-empty queue always yields
    /// at least one entry.
    async fn peek_same_priority(
        &self,
        max_entries: Option<usize>,
        max_bytes: Option<u64>,
    ) -> Result<Vec<QueueEntry>, DispatchError>;

    /// Remove the given entries wherever they are; returns how many were
    /// found.
    async fn remove_random(&self, entries: &[QueueEntry]) -> Result<usize, DispatchError>;

    fn num_of_entries(&self) -> usize;

    fn num_of_bytes(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.num_of_entries() == 0
    }

    /// Register (or clear) the put listener. Only a weak reference is kept.
    fn set_put_listener(&self, listener: Option<Weak<dyn QueuePutListener>>);
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<(Reverse<Priority>, u64), QueueEntry>,
    bytes: u64,
}

/// In-memory [`Queue`] ordered by priority, then insertion.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    /// Maximum number of entries (None = unlimited)
    capacity: Option<usize>,
    listener: Mutex<Option<Weak<dyn QueuePutListener>>>,
}

impl fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("entries", &self.num_of_entries())
            .field("bytes", &self.num_of_bytes())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// All entries in delivery order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.state.lock().entries.values().cloned().collect()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn put(&self, entry: QueueEntry) -> Result<(), DispatchError> {
        {
            let mut state = self.state.lock();
            if let Some(capacity) = self.capacity {
                if state.entries.len() >= capacity {
                    return Err(SystemError::Queue(format!(
                        "Memory queue capacity exceeded: {}/{capacity} entries",
                        state.entries.len()
                    ))
                    .into());
                }
            }

            state.bytes = state.bytes.saturating_add(entry.size_in_bytes());
            trace!(id = entry.id(), priority = %entry.priority(), "Queued entry");
            state.entries.insert(entry.sort_key(), entry);
        }

        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.put_post(1).await;
        }

        Ok(())
    }

    async fn peek_same_priority(
        &self,
        max_entries: Option<usize>,
        max_bytes: Option<u64>,
    ) -> Result<Vec<QueueEntry>, DispatchError> {
        let state = self.state.lock();
        let mut batch = Vec::new();
        let mut bytes = 0u64;
        let mut priority = None;

        for entry in state.entries.values() {
            if !batch.is_empty() && max_entries.is_some_and(|max| batch.len() >= max) {
                break;
            }

            match priority {
                None => priority = Some(entry.priority()),
                Some(p) if p != entry.priority() => break,
                Some(_) => {}
            }

            let size = entry.size_in_bytes();
            if !batch.is_empty() && max_bytes.is_some_and(|max| bytes.saturating_add(size) > max) {
                break;
            }

            bytes = bytes.saturating_add(size);
            batch.push(entry.clone());
        }

        Ok(batch)
    }

    async fn remove_random(&self, entries: &[QueueEntry]) -> Result<usize, DispatchError> {
        let mut state = self.state.lock();
        let mut removed = 0;

        for entry in entries {
            if let Some(entry) = state.entries.remove(&entry.sort_key()) {
                state.bytes = state.bytes.saturating_sub(entry.size_in_bytes());
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn num_of_entries(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn num_of_bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    fn set_put_listener(&self, listener: Option<Weak<dyn QueuePutListener>>) {
        *self.listener.lock() = listener;
    }
}
