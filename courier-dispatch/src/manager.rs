//! Owner of a queue and the logical connection draining it.
//!
//! The manager decides *when* a [`DispatchWorker`] runs: whenever entries are
//! put, the logical connection comes alive, a worker finished with entries
//! left, or the periodic dispatch interval elapses. At most one worker runs
//! per manager, which keeps entries of one priority in queue order.
//!
//! Draining the queue into the dead-letter sink claims the same worker slot,
//! so a batch is never handled by a delivery cycle and a drain at once.
//! Requests that arrive while the slot is taken are remembered and replayed
//! when it is released.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use courier_common::{
    Signal, internal,
    tracing::{debug, error, info, warn},
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{
    sync::{Notify, broadcast},
    time::Instant,
};

use crate::{
    address::Address,
    config::DispatchConfig,
    connection::ConnectionState,
    connector::ConnectorFactory,
    error::{DispatchError, PermanentError},
    logical::{LogicalConnection, LogicalSnapshot},
    plugin::{
        ConnectionStatusListener, DeadLetterSink, DefaultErrorHandler, DispatchInterceptor,
        ErrorDisposition, PostSendListener, WorkerErrorHandler,
    },
    pool::{PoolStats, WorkerPool},
    queue::{Queue, QueueEntry, QueuePutListener},
    timer::Timeout,
    worker::DispatchWorker,
};

pub(crate) struct ManagerInner {
    me: Weak<ManagerInner>,
    config: DispatchConfig,
    queue: Arc<dyn Queue>,
    logical: LogicalConnection,
    pool: WorkerPool,
    interceptor: RwLock<Option<Arc<dyn DispatchInterceptor>>>,
    post_send: RwLock<Option<Arc<dyn PostSendListener>>>,
    error_handler: RwLock<Arc<dyn WorkerErrorHandler>>,
    dead_letters: RwLock<Option<Arc<dyn DeadLetterSink>>>,
    worker_active: AtomicBool,
    /// A dispatch was requested while the worker slot was taken
    dispatch_pending: AtomicBool,
    /// A dead-letter drain was requested while the worker slot was taken
    drain_pending: AtomicBool,
    drain_error: Mutex<Option<DispatchError>>,
    dispatch_active: AtomicBool,
    shutting_down: AtomicBool,
    worker_idle: Notify,
}

impl ManagerInner {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub(crate) fn logical(&self) -> &LogicalConnection {
        &self.logical
    }

    pub(crate) fn interceptor(&self) -> Option<Arc<dyn DispatchInterceptor>> {
        self.interceptor.read().clone()
    }

    pub(crate) fn post_send_listener(&self) -> Option<Arc<dyn PostSendListener>> {
        self.post_send.read().clone()
    }

    pub(crate) fn error_handler(&self) -> Arc<dyn WorkerErrorHandler> {
        Arc::clone(&self.error_handler.read())
    }

    async fn schedule_dispatch(&self) -> Result<bool, DispatchError> {
        if !self.dispatch_active.load(Ordering::Acquire)
            || self.shutting_down.load(Ordering::Acquire)
            || !self.logical.is_alive()
            || self.queue.is_empty()
        {
            return Ok(false);
        }

        if !self.claim_worker(&self.dispatch_pending) {
            return Ok(false);
        }

        let Some(me) = self.me.upgrade() else {
            self.release_worker();
            return Ok(false);
        };

        if let Err(error) = self.pool.execute(DispatchWorker::new(me).run()).await {
            self.release_worker();
            return Err(error);
        }

        Ok(true)
    }

    /// Take the worker slot. On failure `pending` is left set, and the holder
    /// replays the request once it releases the slot.
    fn claim_worker(&self, pending: &AtomicBool) -> bool {
        // Raised before the attempt so a holder releasing concurrently sees it
        pending.store(true, Ordering::SeqCst);
        if self
            .worker_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        pending.store(false, Ordering::SeqCst);
        true
    }

    fn release_worker(&self) {
        self.worker_active.store(false, Ordering::SeqCst);
        self.worker_idle.notify_waiters();
    }

    /// Release the worker slot and replay whatever was requested meanwhile.
    pub(crate) fn worker_done(&self, progress: bool) {
        self.release_worker();

        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let drain = self.drain_pending.swap(false, Ordering::SeqCst);
        let dispatch = self.dispatch_pending.swap(false, Ordering::SeqCst);
        if !drain && !dispatch && (!progress || self.queue.is_empty()) {
            return;
        }

        // Rescheduling from inside a pool slot must not wait on the pool
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if drain {
                let error = me.drain_error.lock().take();
                me.dead_letter_all(error).await;
                if !dispatch {
                    return;
                }
            }
            if let Err(error) = me.schedule_dispatch().await {
                warn!(name = %me.name(), error = %error, "Failed to reschedule dispatch");
            }
        });
    }

    /// Successful delivery hooks, after the batch was committed.
    pub(crate) async fn after_send(&self, entries: &[QueueEntry]) {
        if let Some(listener) = self.post_send_listener() {
            listener.post_send(entries).await;
        }
        if let Some(interceptor) = self.interceptor() {
            interceptor.post_handle_next_messages(entries).await;
        }
    }

    /// A failed send: the post-send listener gets the first say, then the
    /// error handler.
    pub(crate) async fn handle_send_failure(&self, entries: &[QueueEntry], error: DispatchError) {
        if let Some(listener) = self.post_send_listener() {
            if listener.sending_failed(entries, &error).await {
                debug!(name = %self.name(), "Send failure handled by listener");
                return;
            }
        }

        self.handle_worker_error(entries, error).await;
    }

    /// Any failure of a delivery cycle, decided by the error handler.
    pub(crate) async fn handle_worker_error(&self, entries: &[QueueEntry], error: DispatchError) {
        match self.error_handler().on_worker_error(entries, &error) {
            ErrorDisposition::Retry => {
                debug!(
                    name = %self.name(),
                    count = entries.len(),
                    error = %error,
                    "Delivery failed, entries stay queued"
                );
            }
            ErrorDisposition::DeadLetter => self.dead_letter(entries, &error).await,
            ErrorDisposition::Propagate => {
                error!(
                    name = %self.name(),
                    count = entries.len(),
                    error = %error,
                    "Unrecoverable delivery failure, disabling dispatch"
                );
                self.dispatch_active.store(false, Ordering::Release);
            }
        }
    }

    async fn dead_letter(&self, entries: &[QueueEntry], error: &DispatchError) {
        if entries.is_empty() {
            warn!(name = %self.name(), error = %error, "Worker error with no entries to dead-letter");
            return;
        }

        let sink = self.dead_letters.read().clone();
        if let Some(sink) = sink {
            if let Err(store_error) = sink.store(entries, error).await {
                error!(
                    name = %self.name(),
                    error = %store_error,
                    "Dead-letter sink refused entries, leaving them queued"
                );
                return;
            }
        } else {
            warn!(
                name = %self.name(),
                count = entries.len(),
                error = %error,
                "No dead-letter sink configured, dropping entries"
            );
        }

        if let Err(remove_error) = self.queue.remove_random(entries).await {
            error!(name = %self.name(), error = %remove_error, "Failed to remove dead-lettered entries");
        }
    }

    /// Drain the queue into the dead-letter sink after every connection died.
    /// Runs in the worker slot; if a worker holds it the drain happens once
    /// that worker is done.
    async fn dead_letter_all(&self, error: Option<DispatchError>) {
        if !self.claim_worker(&self.drain_pending) {
            debug!(name = %self.name(), "Worker running, dead-letter drain deferred");
            if error.is_some() {
                *self.drain_error.lock() = error;
            }
            return;
        }
        self.drain_error.lock().take();

        // Members may have come back while the drain waited for the slot
        if !self.logical.is_dead() || self.shutting_down.load(Ordering::Acquire) {
            self.worker_done(false);
            return;
        }

        let error = error.map_or_else(
            || {
                PermanentError::ConnectionDead(format!("{}: every connection is dead", self.name()))
                    .into()
            },
            DispatchError::into_dead,
        );
        self.drain(&error).await;
        self.worker_done(false);
    }

    async fn drain(&self, error: &DispatchError) {
        let handler = self.error_handler();
        let mut total = 0;

        loop {
            let batch = match self.queue.peek_same_priority(None, None).await {
                Ok(batch) if !batch.is_empty() => batch,
                Ok(_) => break,
                Err(peek_error) => {
                    error!(name = %self.name(), error = %peek_error, "Failed to read queue");
                    break;
                }
            };

            if handler.on_worker_error(&batch, error) != ErrorDisposition::DeadLetter {
                break;
            }

            let before = self.queue.num_of_entries();
            self.dead_letter(&batch, error).await;
            if self.queue.num_of_entries() >= before {
                break;
            }
            total += batch.len();
        }

        if total > 0 {
            warn!(name = %self.name(), count = total, "Dead-lettered queued entries");
        }
    }
}

#[async_trait]
impl QueuePutListener for ManagerInner {
    async fn put_post(&self, _added: usize) {
        if let Err(error) = self.schedule_dispatch().await {
            warn!(name = %self.name(), error = %error, "Failed to schedule dispatch");
        }
    }
}

impl ConnectionStatusListener for ManagerInner {
    fn on_state_change(
        &self,
        old: ConnectionState,
        new: ConnectionState,
        error: Option<&DispatchError>,
    ) {
        info!(name = %self.name(), from = %old, to = %new, "Logical connection state changed");

        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let Some(me) = self.me.upgrade() else {
            return;
        };

        match new {
            ConnectionState::Alive => {
                tokio::spawn(async move {
                    if let Err(error) = me.schedule_dispatch().await {
                        warn!(name = %me.name(), error = %error, "Failed to schedule dispatch");
                    }
                });
            }
            ConnectionState::Dead => {
                let error = error.cloned();
                tokio::spawn(async move { me.dead_letter_all(error).await });
            }
            ConnectionState::Polling | ConnectionState::Undef => {}
        }
    }
}

/// Drives delivery from one queue to one logical destination.
#[derive(Clone)]
pub struct DispatchManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for DispatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchManager")
            .field("name", &self.inner.config.name)
            .field("logical", &self.inner.logical)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

impl DispatchManager {
    /// # Errors
    ///
    /// Fails when `config` does not validate.
    pub fn new(
        config: DispatchConfig,
        queue: Arc<dyn Queue>,
        factory: Arc<dyn ConnectorFactory>,
        pool: WorkerPool,
        timeout: Timeout,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let logical = LogicalConnection::new(config.name.clone(), factory, timeout);

        Ok(Self {
            inner: Arc::new_cyclic(|me| ManagerInner {
                me: me.clone(),
                config,
                queue,
                logical,
                pool,
                interceptor: RwLock::new(None),
                post_send: RwLock::new(None),
                error_handler: RwLock::new(Arc::new(DefaultErrorHandler)),
                dead_letters: RwLock::new(None),
                worker_active: AtomicBool::new(false),
                dispatch_pending: AtomicBool::new(false),
                drain_pending: AtomicBool::new(false),
                drain_error: Mutex::new(None),
                dispatch_active: AtomicBool::new(true),
                shutting_down: AtomicBool::new(false),
                worker_idle: Notify::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.inner.queue
    }

    pub fn logical(&self) -> &LogicalConnection {
        &self.inner.logical
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn set_interceptor(&self, interceptor: Option<Arc<dyn DispatchInterceptor>>) {
        *self.inner.interceptor.write() = interceptor;
    }

    pub fn set_post_send_listener(&self, listener: Option<Arc<dyn PostSendListener>>) {
        *self.inner.post_send.write() = listener;
    }

    pub fn set_error_handler(&self, handler: Arc<dyn WorkerErrorHandler>) {
        *self.inner.error_handler.write() = handler;
    }

    pub fn set_dead_letter_sink(&self, sink: Option<Arc<dyn DeadLetterSink>>) {
        *self.inner.dead_letters.write() = sink;
    }

    /// Register with the queue and the logical connection, connect every
    /// configured address and start draining.
    ///
    /// # Errors
    ///
    /// Fails when every configured address is dead after initialising.
    pub async fn initialize(&self) -> Result<(), DispatchError> {
        let weak = Arc::downgrade(&self.inner);
        let put_listener: Weak<dyn QueuePutListener> = weak.clone();
        let status_listener: Weak<dyn ConnectionStatusListener> = weak;
        self.inner.queue.set_put_listener(Some(put_listener));
        self.inner.logical.set_status_listener(Some(status_listener));

        internal!(level = INFO, "Initialising dispatch manager {}", self.name());

        self.inner
            .logical
            .initialize(&self.inner.config.addresses)
            .await?;
        self.schedule_dispatch().await?;
        Ok(())
    }

    /// Apply a new address list; surviving endpoints keep their state.
    ///
    /// # Errors
    ///
    /// As [`LogicalConnection::initialize`].
    pub async fn reconfigure(&self, addresses: &[Address]) -> Result<(), DispatchError> {
        self.inner.logical.initialize(addresses).await?;
        self.schedule_dispatch().await?;
        Ok(())
    }

    /// Start a worker if there is anything to deliver and none is running.
    /// Returns whether a worker was submitted.
    ///
    /// # Errors
    ///
    /// Fails when the pool no longer accepts work.
    pub async fn schedule_dispatch(&self) -> Result<bool, DispatchError> {
        self.inner.schedule_dispatch().await
    }

    pub fn is_worker_active(&self) -> bool {
        self.inner.worker_active.load(Ordering::SeqCst)
    }

    pub fn is_dispatch_active(&self) -> bool {
        self.inner.dispatch_active.load(Ordering::Acquire)
    }

    /// Pause or resume queue draining. Resuming schedules a worker right away.
    pub async fn set_dispatch_active(&self, active: bool) {
        let was = self.inner.dispatch_active.swap(active, Ordering::AcqRel);
        if active && !was {
            info!(name = %self.name(), "Dispatch resumed");
            if let Err(error) = self.schedule_dispatch().await {
                warn!(name = %self.name(), error = %error, "Failed to schedule dispatch");
            }
        } else if !active && was {
            info!(name = %self.name(), "Dispatch paused");
        }
    }

    /// Deliver `entries` on the caller's task, bypassing queue and pool.
    ///
    /// # Errors
    ///
    /// The send error, after the error handler's sync filter.
    pub async fn sync_push(&self, entries: Vec<QueueEntry>) -> Result<Vec<String>, DispatchError> {
        DispatchWorker::new(Arc::clone(&self.inner))
            .push(entries)
            .await
    }

    /// Kick dispatch every `dispatch_interval` until a shutdown signal
    /// arrives, then shut down.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; the signature leaves room for startup
    /// failures.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), DispatchError> {
        internal!("Dispatch manager {} starting", self.name());

        let mut kick = tokio::time::interval(self.inner.config.dispatch_interval());
        kick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the first tick to avoid immediate execution
        kick.tick().await;

        loop {
            tokio::select! {
                _ = kick.tick() => {
                    match self.schedule_dispatch().await {
                        Ok(true) => debug!(name = %self.name(), "Periodic dispatch started a worker"),
                        Ok(false) => {}
                        Err(error) => error!(name = %self.name(), error = %error, "Periodic dispatch failed"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Dispatch manager {} received shutdown signal", self.name());
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(error) => {
                            error!(name = %self.name(), "Dispatch manager shutdown channel error: {error}");
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Wait (bounded by the shutdown timeout) for a running worker, then shut
    /// the logical connection down. Queued entries stay queued.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);

        let shutdown_timeout = self.inner.config.shutdown_timeout();
        let start = Instant::now();

        loop {
            let idle = self.inner.worker_idle.notified();
            if !self.is_worker_active() {
                break;
            }
            let remaining = shutdown_timeout.saturating_sub(start.elapsed());
            if tokio::time::timeout(remaining, idle).await.is_err() {
                if self.is_worker_active() {
                    warn!(
                        name = %self.name(),
                        "Shutdown timeout exceeded, the in-flight batch stays queued"
                    );
                }
                break;
            }
        }

        self.inner.logical.shutdown().await;
        internal!(level = INFO, "Dispatch manager {} shut down", self.name());
    }

    pub fn dump(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            name: self.name().to_string(),
            dispatch_active: self.is_dispatch_active(),
            worker_active: self.is_worker_active(),
            queued_entries: self.inner.queue.num_of_entries(),
            queued_bytes: self.inner.queue.num_of_bytes(),
            logical: self.inner.logical.dump(),
            pool: self.inner.pool.stats(),
        }
    }
}

/// Diagnostic view of a [`DispatchManager`].
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub name: String,
    pub dispatch_active: bool,
    pub worker_active: bool,
    pub queued_entries: usize,
    pub queued_bytes: u64,
    pub logical: LogicalSnapshot,
    pub pool: PoolStats,
}
