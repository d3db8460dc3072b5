//! One delivery cycle.
//!
//! A pulling worker peeks a batch from the manager's queue, sends it over the
//! logical connection and only removes it once the send succeeded, so a
//! failure at any point leaves the entries queued. Every failure of a cycle,
//! including queue and interceptor errors, goes to the manager's error
//! handler. A pushing worker sends a
//! batch handed to it by a synchronous producer and reports the outcome
//! straight back.

use std::sync::Arc;

use courier_common::{internal, tracing::debug};

use crate::{error::DispatchError, manager::ManagerInner, queue::QueueEntry};

/// Result of one pulling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was queued.
    Empty,
    /// Entries were removed from the queue: delivered, expired or filtered.
    Committed { sent: usize, discarded: usize },
    /// Delivery failed and was handed to the error handler.
    Failed,
}

impl CycleOutcome {
    /// The queue changed, another cycle may have work to do.
    #[must_use]
    pub const fn made_progress(self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Runs delivery cycles on behalf of a dispatch manager.
pub struct DispatchWorker {
    owner: Arc<ManagerInner>,
}

impl DispatchWorker {
    pub(crate) fn new(owner: Arc<ManagerInner>) -> Self {
        Self { owner }
    }

    /// Run one pulling cycle on a pool slot and tell the manager when done.
    pub async fn run(self) {
        let outcome = self.pull().await;
        debug!(name = %self.owner.name(), outcome = ?outcome, "Delivery cycle finished");
        self.owner.worker_done(outcome.made_progress());
    }

    /// Peek, filter, send and commit one batch.
    ///
    /// Failures are handed to the manager's error handler together with the
    /// entries they concern and reported as [`CycleOutcome::Failed`].
    pub async fn pull(&self) -> CycleOutcome {
        let mut pending = Vec::new();

        match self.try_pull(&mut pending).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.owner.handle_worker_error(&pending, error).await;
                CycleOutcome::Failed
            }
        }
    }

    /// `pending` tracks the entries a failure would concern.
    async fn try_pull(&self, pending: &mut Vec<QueueEntry>) -> Result<CycleOutcome, DispatchError> {
        let owner = &self.owner;
        let (max_entries, max_bytes) = owner
            .logical()
            .preferred_address()
            .map_or((None, None), |address| {
                (address.max_entries(), address.max_bytes())
            });

        let peeked = owner
            .queue()
            .peek_same_priority(max_entries, max_bytes)
            .await?;
        if peeked.is_empty() {
            return Ok(CycleOutcome::Empty);
        }
        pending.clone_from(&peeked);

        let (expired, live): (Vec<_>, Vec<_>) =
            peeked.iter().cloned().partition(QueueEntry::is_expired);
        if !expired.is_empty() {
            debug!(name = %owner.name(), count = expired.len(), "Discarding expired entries");
        }

        let batch = match owner.interceptor() {
            Some(interceptor) => interceptor.handle_next_messages(live).await?,
            None => live,
        };

        // Whatever will not be sent is never retried either
        let dropped: Vec<_> = peeked
            .iter()
            .filter(|entry| !batch.contains(entry))
            .cloned()
            .collect();
        let discarded = if dropped.is_empty() {
            0
        } else {
            owner.queue().remove_random(&dropped).await?
        };

        if batch.is_empty() {
            return Ok(CycleOutcome::Committed { sent: 0, discarded });
        }
        pending.clone_from(&batch);

        internal!(
            "{}: sending batch of {} entries (priority {})",
            owner.name(),
            batch.len(),
            batch[0].priority()
        );

        match owner.logical().send(&batch).await {
            Ok(_) => {
                owner.queue().remove_random(&batch).await?;
                owner.after_send(&batch).await;
                Ok(CycleOutcome::Committed {
                    sent: batch.len(),
                    discarded,
                })
            }
            Err(error) => {
                owner.handle_send_failure(&batch, error).await;
                Ok(CycleOutcome::Failed)
            }
        }
    }

    /// Deliver `entries` directly and hand the outcome to the caller.
    ///
    /// # Errors
    ///
    /// The send error as filtered by the error handler.
    pub async fn push(&self, entries: Vec<QueueEntry>) -> Result<Vec<String>, DispatchError> {
        let owner = &self.owner;

        let batch = match owner.interceptor() {
            Some(interceptor) => interceptor.handle_next_messages(entries).await?,
            None => entries,
        };
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        match owner.logical().send(&batch).await {
            Ok(receipts) => {
                owner.after_send(&batch).await;
                Ok(receipts)
            }
            Err(error) => {
                if let Some(listener) = owner.post_send_listener() {
                    if listener.sending_failed(&batch, &error).await {
                        return Ok(Vec::new());
                    }
                }

                match owner.error_handler().filter_sync_error(&batch, error) {
                    Some(error) => Err(error),
                    None => Ok(Vec::new()),
                }
            }
        }
    }
}
