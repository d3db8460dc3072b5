//! Bounded, dynamically sized pool of worker slots.
//!
//! Tasks go through a bounded channel; once it is full [`WorkerPool::execute`]
//! waits for room, which is what throttles producers. Slots are tokio tasks:
//! `warm_start` of them are started eagerly, more are added on demand up to
//! `max_size`, and slots above `min_size` exit after `idle_lifetime` without
//! work. Slots never keep the runtime from shutting down.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use courier_common::{
    internal,
    tracing::{debug, error},
};
use futures_util::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    runtime::Handle,
    sync::mpsc,
    task::JoinSet,
};

use crate::{
    config::PoolConfig,
    error::{DispatchError, SystemError},
};

type Task = BoxFuture<'static, ()>;

/// Point-in-time view of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Slots currently running
    pub live: usize,
    /// Slots waiting for work
    pub idle: usize,
    /// Tasks submitted but not yet picked up
    pub queued: usize,
    /// Tasks run to completion (or panicked)
    pub completed: u64,
    pub shutdown: bool,
}

struct Inner {
    name: String,
    config: PoolConfig,
    runtime: Handle,
    /// Dropped on shutdown so draining slots see the channel close
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    slots: Mutex<JoinSet<()>>,
    live: AtomicUsize,
    idle: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
    shutdown: AtomicBool,
}

impl Inner {
    /// Reserve a slot if nobody is idle and the pool may still grow.
    ///
    /// Callers count their task in `queued` first: a slot going idle either
    /// sees that count and stays, or has already left `idle` and is not
    /// relied upon here.
    fn reserve_slot(&self) -> bool {
        if self.idle.load(Ordering::SeqCst) > 0 {
            return false;
        }

        let mut live = self.live.load(Ordering::SeqCst);
        loop {
            if live >= self.config.max_size {
                return false;
            }
            match self
                .live
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
    }

    /// Give a slot up on idle timeout, keeping at least `min_size` alive and
    /// never leaving submitted work behind.
    fn retire_slot(&self) -> bool {
        let mut live = self.live.load(Ordering::Acquire);
        loop {
            if live <= self.config.min_size || self.queued.load(Ordering::SeqCst) > 0 {
                return false;
            }
            match self
                .live
                .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
    }

    /// Reserve the first slot of an empty pool.
    fn reserve_first_slot(&self) -> bool {
        self.live
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Counts a task in `queued` until it is handed to the channel; a submitter
/// cancelled while waiting for room takes its count back.
struct QueuedTicket<'a> {
    queued: &'a AtomicUsize,
    sent: bool,
}

impl<'a> QueuedTicket<'a> {
    fn new(queued: &'a AtomicUsize) -> Self {
        queued.fetch_add(1, Ordering::SeqCst);
        Self {
            queued,
            sent: false,
        }
    }
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        if !self.sent {
            // An immediate shutdown may have reset the count already
            let _ = self
                .queued
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| q.checked_sub(1));
        }
    }
}

/// Cloneable handle to a pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool on the current tokio runtime and start the warm slots.
    ///
    /// # Errors
    ///
    /// Fails on invalid sizing or outside of a tokio runtime.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Result<Self, DispatchError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            SystemError::Internal(format!("Worker pool requires a tokio runtime: {e}"))
        })?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let warm = config.warm_start.min(config.max_size);

        let pool = Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                runtime,
                sender: Mutex::new(Some(sender)),
                receiver: tokio::sync::Mutex::new(receiver),
                slots: Mutex::new(JoinSet::new()),
                live: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        };

        for _ in 0..warm {
            pool.inner.live.fetch_add(1, Ordering::AcqRel);
            pool.spawn_slot();
        }

        internal!(
            level = DEBUG,
            "Worker pool {} started with {warm} slots",
            pool.inner.name
        );

        Ok(pool)
    }

    fn spawn_slot(&self) {
        let inner = Arc::clone(&self.inner);
        let mut slots = self.inner.slots.lock();
        // Reap slots that already exited
        while slots.try_join_next().is_some() {}
        slots.spawn_on(run_slot(inner), &self.inner.runtime);
    }

    /// Submit a task, waiting while the pool is saturated.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::PoolShutdown`] once the pool was shut down.
    pub async fn execute<F>(&self, task: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SystemError::PoolShutdown.into());
        }

        let sender = self
            .inner
            .sender
            .lock()
            .clone()
            .ok_or(SystemError::PoolShutdown)?;

        let mut ticket = QueuedTicket::new(&self.inner.queued);

        if self.inner.reserve_slot() {
            self.spawn_slot();
        }

        let permit = sender
            .reserve()
            .await
            .map_err(|_| SystemError::PoolShutdown)?;
        permit.send(task.boxed());
        ticket.sent = true;

        // Every slot may have retired while this task waited for room
        if !self.inner.shutdown.load(Ordering::Acquire) && self.inner.reserve_first_slot() {
            self.spawn_slot();
        }

        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.inner.live.load(Ordering::Acquire),
            idle: self.inner.idle.load(Ordering::Acquire),
            queued: self.inner.queued.load(Ordering::Acquire),
            completed: self.inner.completed.load(Ordering::Acquire),
            shutdown: self.inner.shutdown.load(Ordering::Acquire),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting tasks, let the slots finish everything already
    /// submitted, then wait for them to exit.
    pub async fn shutdown_after_draining(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.sender.lock().take();

        internal!(level = DEBUG, "Draining worker pool {}", self.inner.name);

        let mut slots = std::mem::take(&mut *self.inner.slots.lock());
        while slots.join_next().await.is_some() {}
    }

    /// Stop accepting tasks, cancel running ones in place and discard the
    /// ones still waiting. Returns the number of discarded tasks.
    pub async fn shutdown(&self) -> usize {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.sender.lock().take();

        let mut slots = std::mem::take(&mut *self.inner.slots.lock());
        slots.abort_all();
        while slots.join_next().await.is_some() {}

        let mut receiver = self.inner.receiver.lock().await;
        receiver.close();
        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        drop(receiver);

        self.inner.queued.store(0, Ordering::Release);
        self.inner.idle.store(0, Ordering::Release);
        self.inner.live.store(0, Ordering::Release);

        internal!(
            level = DEBUG,
            "Worker pool {} shut down, {discarded} queued tasks discarded",
            self.inner.name
        );

        discarded
    }
}

async fn run_slot(inner: Arc<Inner>) {
    let idle_lifetime = inner.config.idle_lifetime();

    loop {
        inner.idle.fetch_add(1, Ordering::SeqCst);
        let next = tokio::time::timeout(idle_lifetime, async {
            inner.receiver.lock().await.recv().await
        })
        .await;
        inner.idle.fetch_sub(1, Ordering::SeqCst);

        match next {
            Ok(Some(task)) => {
                inner.queued.fetch_sub(1, Ordering::SeqCst);
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    error!(pool = %inner.name, "Worker task panicked");
                }
                inner.completed.fetch_add(1, Ordering::AcqRel);
            }
            Ok(None) => break,
            Err(_) => {
                if inner.retire_slot() {
                    debug!(pool = %inner.name, "Idle slot exiting");
                    return;
                }
            }
        }
    }

    inner.live.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    fn config(min: usize, max: usize, warm: usize, queue: usize) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            warm_start: warm,
            idle_lifetime_ms: 1_000,
            queue_capacity: queue,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_start_and_idle_eviction() {
        let pool = WorkerPool::new("test", config(1, 4, 3, 4)).expect("pool");
        assert_eq!(pool.stats().live, 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_runs_tasks() {
        let pool = WorkerPool::new("test", config(0, 2, 0, 4)).expect("pool");
        let (tx, rx) = oneshot::channel();

        pool.execute(async move {
            let _ = tx.send(42);
        })
        .await
        .expect("execute");

        assert_eq!(rx.await.expect("task ran"), 42);
        tokio::task::yield_now().await;
        assert_eq!(pool.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_blocks_submitter() {
        let pool = WorkerPool::new("test", config(1, 1, 1, 1)).expect("pool");
        let (release, hold) = oneshot::channel::<()>();

        pool.execute(async move {
            let _ = hold.await;
        })
        .await
        .expect("first task");
        tokio::task::yield_now().await;

        // Fills the single queue slot
        pool.execute(async {}).await.expect("second task");

        let third = tokio::time::timeout(Duration::from_millis(100), pool.execute(async {})).await;
        assert!(third.is_err(), "submitter must block while saturated");

        let _ = release.send(());
        tokio::time::timeout(Duration::from_millis(100), pool.execute(async {}))
            .await
            .expect("room again")
            .expect("execute");
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_after_shutdown_fails() {
        let pool = WorkerPool::new("test", config(1, 2, 1, 2)).expect("pool");
        pool.shutdown_after_draining().await;

        let error = pool.execute(async {}).await.expect_err("pool is shut down");
        assert_eq!(error, SystemError::PoolShutdown.into());
        assert!(pool.stats().shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_submitted_as_last_slot_retires_still_runs() {
        let pool = WorkerPool::new("test", config(0, 1, 0, 4)).expect("pool");
        let (tx, rx) = oneshot::channel();

        // A slot still counted idle but already on its way out
        pool.inner.idle.store(1, Ordering::SeqCst);
        pool.execute(async move {
            let _ = tx.send(());
        })
        .await
        .expect("execute");
        pool.inner.idle.store(0, Ordering::SeqCst);

        tokio::time::timeout(Duration::from_millis(100), rx)
            .await
            .expect("a slot picked the task up")
            .expect("task ran");
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_task_keeps_idle_slot_alive() {
        let pool = WorkerPool::new("test", config(0, 1, 1, 4)).expect("pool");
        tokio::task::yield_now().await;

        pool.inner.queued.fetch_add(1, Ordering::SeqCst);
        assert!(!pool.inner.retire_slot());
        pool.inner.queued.fetch_sub(1, Ordering::SeqCst);
        assert!(pool.inner.retire_slot());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(WorkerPool::new("test", config(3, 2, 0, 1)).is_err());
    }
}
