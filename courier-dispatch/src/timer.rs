//! Shared delayed-task facility.
//!
//! A single driver task sleeps until the earliest deadline in a min-heap and
//! fires the callbacks that are due. Connections use it for their ping and
//! polling schedules instead of owning a timer each.
//!
//! Callbacks are spawned onto the runtime, so a slow callback never delays
//! the others. They should still only kick off work, not perform it.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use courier_common::tracing::trace;
use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{Instant, sleep_until},
};

use crate::error::{DispatchError, SystemError};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

#[derive(Debug, PartialEq, Eq)]
struct Deadline {
    at: Instant,
    key: u64,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other.at.cmp(&self.at).then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Deadline>,
    /// Live callbacks; heap entries without one here were removed
    callbacks: HashMap<u64, Callback>,
    next_key: u64,
    shutdown: bool,
}

impl State {
    /// Pop everything due at `now`, returning the callbacks and the next
    /// deadline still pending.
    fn take_due(&mut self, now: Instant) -> (Vec<Callback>, Option<Instant>) {
        let mut due = Vec::new();

        while let Some(deadline) = self.heap.peek() {
            if !self.callbacks.contains_key(&deadline.key) {
                self.heap.pop();
                continue;
            }

            if deadline.at > now {
                return (due, Some(deadline.at));
            }

            let Some(deadline) = self.heap.pop() else {
                break;
            };
            if let Some(callback) = self.callbacks.remove(&deadline.key) {
                due.push(callback);
            }
        }

        (due, None)
    }
}

struct Shared {
    state: Mutex<State>,
    wake: Arc<Notify>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

/// Cloneable handle to the timer driver.
///
/// The driver stops once [`Timeout::shutdown`] is called or the last handle
/// is dropped.
#[derive(Clone)]
pub struct Timeout {
    shared: Arc<Shared>,
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("pending", &self.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Timeout {
    /// Start a driver on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside of a tokio runtime.
    pub fn start() -> Result<Self, DispatchError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            SystemError::Internal(format!("Timer requires a tokio runtime: {e}"))
        })?;

        let wake = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Arc::clone(&wake),
        });

        runtime.spawn(drive(Arc::downgrade(&shared), wake));

        Ok(Self { shared })
    }

    /// Run `callback` once `delay` has elapsed.
    ///
    /// After [`Timeout::shutdown`] the callback is dropped without running.
    pub fn add(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerKey {
        let mut state = self.shared.state.lock();
        let key = state.next_key;
        state.next_key += 1;

        if !state.shutdown {
            state.heap.push(Deadline {
                at: Instant::now() + delay,
                key,
            });
            state.callbacks.insert(key, Box::new(callback));
        }
        drop(state);

        self.shared.wake.notify_one();
        TimerKey(key)
    }

    /// Cancel a pending callback. Returns `false` if it already fired or was
    /// removed before.
    pub fn remove(&self, key: TimerKey) -> bool {
        self.shared.state.lock().callbacks.remove(&key.0).is_some()
    }

    /// Cancel `key` (if any) and schedule `callback` in its place.
    pub fn refresh(
        &self,
        key: Option<TimerKey>,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerKey {
        if let Some(key) = key {
            self.remove(key);
        }
        self.add(delay, callback)
    }

    /// Number of callbacks still pending.
    pub fn len(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending callback and stop the driver.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.heap.clear();
            state.callbacks.clear();
        }
        self.shared.wake.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }
}

async fn drive(shared: Weak<Shared>, wake: Arc<Notify>) {
    loop {
        let next = {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let mut state = shared.state.lock();
            if state.shutdown {
                break;
            }

            let (due, next) = state.take_due(Instant::now());
            drop(state);

            for callback in due {
                tokio::spawn(async move { callback() });
            }

            next
        };

        match next {
            Some(deadline) => {
                tokio::select! {
                    () = sleep_until(deadline) => {}
                    () = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }

    trace!("Timer driver stopped");
}
