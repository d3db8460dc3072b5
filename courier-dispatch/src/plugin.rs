//! Extension points around a delivery cycle.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{connection::ConnectionState, error::DispatchError, queue::QueueEntry};

/// Pre-send filter and post-commit hook.
#[async_trait]
pub trait DispatchInterceptor: Send + Sync {
    /// Inspect or transform a batch before it is sent. Entries left out of
    /// the returned batch are considered handled and are committed together
    /// with the sent ones.
    async fn handle_next_messages(
        &self,
        entries: Vec<QueueEntry>,
    ) -> Result<Vec<QueueEntry>, DispatchError>;

    /// Called with the sent entries once they were removed from the queue.
    async fn post_handle_next_messages(&self, _sent: &[QueueEntry]) {}
}

/// Observer of delivery outcomes.
#[async_trait]
pub trait PostSendListener: Send + Sync {
    async fn post_send(&self, entries: &[QueueEntry]);

    /// Returns `true` when the failure was fully handled and the regular
    /// error handling should be skipped.
    async fn sending_failed(&self, _entries: &[QueueEntry], _error: &DispatchError) -> bool {
        false
    }
}

/// Observer of aggregate state changes of a logical connection.
///
/// Called outside of any connection lock, one change at a time and in the
/// order the changes happened. Implementations must not block, and must not
/// query or drive the logical connection from inside the callback; spawn a
/// task for that.
pub trait ConnectionStatusListener: Send + Sync {
    fn on_state_change(
        &self,
        old: ConnectionState,
        new: ConnectionState,
        error: Option<&DispatchError>,
    );
}

/// What to do with a batch whose delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Leave the entries queued for the next attempt.
    Retry,
    /// Hand the entries to the dead-letter sink and remove them.
    DeadLetter,
    /// Escalate: log and stop active dispatch.
    Propagate,
}

/// Decides how worker failures are handled.
pub trait WorkerErrorHandler: Send + Sync {
    fn on_worker_error(&self, entries: &[QueueEntry], error: &DispatchError) -> ErrorDisposition;

    /// Filter an error before it reaches a synchronous caller. `None`
    /// swallows it and reports success.
    fn filter_sync_error(
        &self,
        _entries: &[QueueEntry],
        error: DispatchError,
    ) -> Option<DispatchError> {
        Some(error)
    }
}

/// Dead-letters terminal failures, retries temporary ones and propagates
/// system errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHandler;

impl WorkerErrorHandler for DefaultErrorHandler {
    fn on_worker_error(&self, _entries: &[QueueEntry], error: &DispatchError) -> ErrorDisposition {
        match error {
            DispatchError::Temporary(_) => ErrorDisposition::Retry,
            DispatchError::Permanent(_) => ErrorDisposition::DeadLetter,
            DispatchError::System(_) => ErrorDisposition::Propagate,
        }
    }
}

/// Destination of entries that will never be delivered.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn store(&self, entries: &[QueueEntry], error: &DispatchError) -> Result<(), DispatchError>;
}

/// [`DeadLetterSink`] keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<(QueueEntry, String)>>,
}

impl MemoryDeadLetters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored entries with the reason they were dead-lettered.
    pub fn letters(&self) -> Vec<(QueueEntry, String)> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn store(&self, entries: &[QueueEntry], error: &DispatchError) -> Result<(), DispatchError> {
        let reason = error.to_string();
        self.letters
            .lock()
            .extend(entries.iter().map(|entry| (entry.clone(), reason.clone())));
        Ok(())
    }
}
