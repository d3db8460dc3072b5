//! One physical connection and its state machine.
//!
//! # State Transitions
//!
//! ```text
//!            success                       failure, budget left
//!  ┌───────┐ ───────> ┌───────┐ ─────────────────────────────> ┌─────────┐
//!  │ Undef │          │ Alive │ <───────────────────────────── │ Polling │
//!  └───────┘ ───────> └───────┘            success             └─────────┘
//!      │   failure,       │                                         │
//!      │   budget left    │ auth / terminal error                   │ budget exhausted,
//!      │   (to Polling)   v                                         │ auth / terminal error
//!      └────────────> ┌──────┐ <────────────────────────────────────┘
//!                     │ Dead │  (never left)
//!                     └──────┘
//! ```
//!
//! Every transition runs under the owning logical connection's transition
//! lock, so a ping firing on the timer and a failing send can not interleave
//! their updates of the aggregate state.
//!
//! While alive the connection pings its endpoint every `ping_interval`; while
//! polling it reconnects every `delay` (the first retry after losing an alive
//! connection happens immediately to ride out short blips).

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use courier_common::{
    incoming, internal, outgoing,
    tracing::{debug, info, warn},
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::{
    address::Address,
    connector::{Connector, ConnectorFactory},
    error::{DispatchError, ErrorClass, PermanentError, TemporaryError},
    logical::LogicalShared,
    queue::QueueEntry,
    statistics::{DeliveryStatistics, Progress, StatisticsSnapshot},
    timer::{Timeout, TimerKey},
};

/// Delay used for the first poll after an alive connection failed.
const IMMEDIATE_RETRY_DELAY: Duration = Duration::ZERO;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Created, not yet initialised.
    Undef,
    /// Endpoint reachable and serving.
    Alive,
    /// Endpoint lost; periodically trying to get it back.
    Polling,
    /// Terminal.
    Dead,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undef => "UNDEF",
            Self::Alive => "ALIVE",
            Self::Polling => "POLLING",
            Self::Dead => "DEAD",
        })
    }
}

/// What a fired timer asks the connection to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Health check an established connection.
    Ping,
    /// Re-establish the physical connection, then health check it.
    Reconnect,
}

/// Outcome of a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

impl Transition {
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.new == ConnectionState::Dead
    }
}

#[derive(Debug)]
struct Core {
    state: ConnectionState,
    retry_counter: u32,
    timer: Option<TimerKey>,
    stalled: bool,
    last_error: Option<String>,
}

/// A connection to one [`Address`].
pub struct Connection {
    id: u64,
    me: Weak<Connection>,
    owner: Weak<LogicalShared>,
    address: RwLock<Arc<Address>>,
    connector: Box<dyn Connector>,
    statistics: Arc<DeliveryStatistics>,
    timeout: Timeout,
    core: Mutex<Core>,
    server_accepts_requests: AtomicBool,
    physical_connection_ok: AtomicBool,
    /// Taken from the address on creation, cleared on first initialise
    recovered: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address.read().to_string())
            .field("state", &core.state)
            .field("retry_counter", &core.retry_counter)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        owner: Weak<LogicalShared>,
        address: Address,
        factory: &dyn ConnectorFactory,
        timeout: Timeout,
    ) -> Result<Arc<Self>, DispatchError> {
        let statistics = Arc::new(DeliveryStatistics::new());
        let connector = factory.create(&address, Arc::clone(&statistics))?;
        let recovered = address.from_persistence_recovery;

        Ok(Arc::new_cyclic(|me| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            owner,
            address: RwLock::new(Arc::new(address)),
            connector,
            statistics,
            timeout,
            core: Mutex::new(Core {
                state: ConnectionState::Undef,
                retry_counter: 0,
                timer: None,
                stalled: false,
                last_error: None,
            }),
            server_accepts_requests: AtomicBool::new(false),
            physical_connection_ok: AtomicBool::new(false),
            recovered: AtomicBool::new(recovered),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Consistent snapshot of the current address configuration.
    pub fn address(&self) -> Arc<Address> {
        Arc::clone(&self.address.read())
    }

    /// Swap in new policy settings for the same endpoint.
    pub(crate) fn set_address(&self, address: Address) {
        *self.address.write() = Arc::new(address);
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lock().state
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Alive
    }

    pub fn is_polling(&self) -> bool {
        self.state() == ConnectionState::Polling
    }

    pub fn is_dead(&self) -> bool {
        self.state() == ConnectionState::Dead
    }

    pub fn retry_counter(&self) -> u32 {
        self.core.lock().retry_counter
    }

    /// An in-flight transfer made no byte progress between two pings.
    pub fn is_stalled(&self) -> bool {
        self.core.lock().stalled
    }

    pub fn server_accepts_requests(&self) -> bool {
        self.server_accepts_requests.load(Ordering::Acquire)
    }

    pub fn physical_connection_ok(&self) -> bool {
        self.physical_connection_ok.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> &Arc<DeliveryStatistics> {
        &self.statistics
    }

    fn dead_error(&self) -> DispatchError {
        PermanentError::ConnectionDead(format!("{} is dead", self.address())).into()
    }

    /// Connect and health check the endpoint.
    ///
    /// A retryable failure counts as a failed attempt and leaves the
    /// connection polling; any other failure kills it and is returned.
    ///
    /// # Errors
    ///
    /// Returns the terminal error when the connection ends up dead.
    pub async fn initialize(&self) -> Result<(), DispatchError> {
        let address = self.address();

        if self.recovered.swap(false, Ordering::AcqRel) {
            internal!(
                level = INFO,
                "{address} recovered from persistence, polling instead of connecting"
            );
            let error: DispatchError =
                TemporaryError::Polling(format!("{address} recovered from persistence")).into();
            return if self.handle_transition(false, Some(&error)).is_dead() {
                Err(error.into_dead())
            } else {
                Ok(())
            };
        }

        internal!("Initialising connection {} to {address}", self.id);

        match self.connect_and_check(&address).await {
            Ok(()) => {
                self.handle_transition(true, None);
                Ok(())
            }
            Err(error) => {
                let transition = self.handle_transition(false, Some(&error));
                if transition.is_dead() {
                    Err(error.into_dead())
                } else {
                    debug!(address = %address, error = %error, "Initial connect failed, polling");
                    Ok(())
                }
            }
        }
    }

    async fn connect_and_check(&self, address: &Address) -> Result<(), DispatchError> {
        self.physical_connection_ok.store(false, Ordering::Release);
        self.connector.connect(address).await?;
        self.physical_connection_ok.store(true, Ordering::Release);
        self.exchange_ping(address, "").await.map(|_| ())
    }

    async fn exchange_ping(&self, address: &Address, data: &str) -> Result<String, DispatchError> {
        self.statistics.record_ping();
        let response =
            tokio::time::timeout(address.ping_response_timeout(), self.connector.ping(data))
                .await
                .unwrap_or_else(|_| {
                    Err(TemporaryError::ResponseTimeout(format!(
                        "{address} did not answer a ping within {}ms",
                        address.ping_response_timeout_ms
                    ))
                    .into())
                })?;

        self.statistics.record_received(1);
        incoming!("Ping response from {address} on connection {}: {response}", self.id);
        Ok(response)
    }

    /// Deliver a batch over this connection.
    ///
    /// On failure every entry's redelivery counter is incremented and the
    /// failure is run through the state machine before the error is
    /// returned. If that transition killed the connection the error comes
    /// back tagged as "connection dead".
    ///
    /// # Errors
    ///
    /// Fails immediately when the connection is dead, otherwise returns the
    /// connector's error.
    pub async fn send(&self, entries: &[QueueEntry]) -> Result<Vec<String>, DispatchError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        if self.is_dead() {
            return Err(self.dead_error());
        }

        let result = {
            let _in_flight = self.statistics.begin();
            outgoing!(
                "Sending {} entries to {} over connection {}",
                entries.len(),
                self.address(),
                self.id
            );
            self.connector.send(entries).await
        };

        match result {
            Ok(receipts) => {
                self.statistics.record_sent(entries.len());
                for (entry, receipt) in entries.iter().zip(&receipts) {
                    entry.set_outcome(receipt.clone());
                }
                self.handle_transition(true, None);
                Ok(receipts)
            }
            Err(error) => {
                self.statistics.record_send_failure();
                for entry in entries {
                    entry.increment_redelivered();
                }

                if self.handle_transition(false, Some(&error)).is_dead() {
                    Err(error.into_dead())
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Health check the endpoint.
    ///
    /// When a send or receive is in flight the round trip is skipped: byte
    /// progress since the previous ping counts as success. Without progress
    /// the connection is either flagged as stalled, or, if the address asks
    /// for it, the ping fails.
    ///
    /// # Errors
    ///
    /// Returns the ping error after the failure transition.
    pub async fn ping(&self, data: &str) -> Result<String, DispatchError> {
        if self.is_dead() {
            return Err(self.dead_error());
        }

        let address = self.address();

        match self.statistics.check_progress() {
            Progress::Advancing => {
                self.core.lock().stalled = false;
                self.handle_transition(true, None);
                return Ok(String::new());
            }
            Progress::Stalled if address.stall_is_failure => {
                let error: DispatchError = TemporaryError::ResponseTimeout(format!(
                    "{address} made no progress on an in-flight transfer since the last ping"
                ))
                .into();
                return Err(self.fail(error));
            }
            Progress::Stalled => {
                warn!(
                    connection = self.id,
                    address = %address,
                    "In-flight transfer made no progress since the last ping, flagging as stalled"
                );
                self.mark_stalled();
                return Ok(String::new());
            }
            Progress::Idle => {}
        }

        match self.exchange_ping(&address, data).await {
            Ok(response) => {
                self.core.lock().stalled = false;
                self.handle_transition(true, None);
                Ok(response)
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    fn fail(&self, error: DispatchError) -> DispatchError {
        if self.handle_transition(false, Some(&error)).is_dead() {
            error.into_dead()
        } else {
            error
        }
    }

    fn mark_stalled(&self) {
        let mut core = self.core.lock();
        core.stalled = true;
        if core.state == ConnectionState::Alive {
            if let Some(interval) = self.address().ping_interval() {
                self.schedule(&mut core, interval, TimerAction::Ping);
            }
        }
    }

    /// Entry point for the shared timer. Errors stay here: there is no caller
    /// to report them to, the state machine already recorded them.
    pub async fn timeout(&self, action: TimerAction) {
        if self.is_dead() {
            return;
        }

        match action {
            TimerAction::Ping => {
                if let Err(error) = self.ping("").await {
                    debug!(connection = self.id, error = %error, "Scheduled ping failed");
                }
            }
            TimerAction::Reconnect => {
                let address = self.address();
                debug!(connection = self.id, address = %address, "Polling endpoint");
                if let Err(error) = self.connector.connect(&address).await {
                    self.physical_connection_ok.store(false, Ordering::Release);
                    self.handle_transition(false, Some(&error));
                    return;
                }

                self.physical_connection_ok.store(true, Ordering::Release);
                if let Err(error) = self.ping("").await {
                    debug!(connection = self.id, error = %error, "Ping after reconnect failed");
                }
            }
        }
    }

    /// Run one outcome through the state machine.
    ///
    /// No-op once dead. Returns the old and new state.
    pub fn handle_transition(
        &self,
        to_success: bool,
        error: Option<&DispatchError>,
    ) -> Transition {
        let owner = self.owner.upgrade();
        let mut aggregate = owner.as_ref().map(|owner| owner.lock_transitions());

        let address = self.address();
        let mut core = self.core.lock();
        let old = core.state;

        if old == ConnectionState::Dead {
            return Transition { old, new: old };
        }

        let class = match (to_success, ErrorClass::of(error)) {
            (true, _) => ErrorClass::None,
            // Failure reported without a cause
            (false, ErrorClass::None) => ErrorClass::Retryable,
            (false, class) => class,
        };

        let new = match class {
            ErrorClass::None => {
                core.retry_counter = 0;
                core.last_error = None;
                self.server_accepts_requests.store(true, Ordering::Release);
                if let Some(interval) = address.ping_interval() {
                    self.schedule(&mut core, interval, TimerAction::Ping);
                } else {
                    self.cancel(&mut core);
                }
                ConnectionState::Alive
            }
            ErrorClass::Retryable | ErrorClass::ServerDeny => {
                if class == ErrorClass::ServerDeny {
                    self.server_accepts_requests.store(false, Ordering::Release);
                }

                if address.may_retry(core.retry_counter) {
                    core.retry_counter += 1;
                    let delay = if old == ConnectionState::Alive {
                        IMMEDIATE_RETRY_DELAY
                    } else {
                        address.jittered_delay()
                    };
                    self.schedule(&mut core, delay, TimerAction::Reconnect);
                    ConnectionState::Polling
                } else {
                    ConnectionState::Dead
                }
            }
            ErrorClass::Authentication | ErrorClass::Terminal => ConnectionState::Dead,
        };

        if let Some(error) = error {
            core.last_error = Some(error.to_string());
        }
        if new == ConnectionState::Dead {
            self.cancel(&mut core);
        }
        core.state = new;
        let retry_counter = core.retry_counter;
        drop(core);

        match (old, new) {
            (_, ConnectionState::Dead) => warn!(
                connection = self.id,
                address = %address,
                from = %old,
                retry_counter,
                error = ?error.map(ToString::to_string),
                "Connection is dead, no further attempts will be made"
            ),
            (ConnectionState::Alive, ConnectionState::Alive) => {}
            (_, ConnectionState::Alive) => info!(
                connection = self.id,
                address = %address,
                from = %old,
                "Connection is alive"
            ),
            (_, ConnectionState::Polling) => info!(
                connection = self.id,
                address = %address,
                from = %old,
                retry_counter,
                retries = address.retries,
                error = ?error.map(ToString::to_string),
                "Connection lost, polling"
            ),
            _ => {}
        }

        let change = match (owner.as_ref(), aggregate.as_mut()) {
            (Some(owner), Some(aggregate)) => match new {
                ConnectionState::Alive => owner.to_alive(aggregate, self),
                ConnectionState::Polling => owner.to_polling(aggregate, self, error),
                ConnectionState::Dead => owner.to_dead(aggregate, self, error),
                ConnectionState::Undef => None,
            },
            _ => None,
        };
        let ordered = match (owner.as_ref(), change) {
            (Some(owner), Some(_)) => Some(owner.lock_notifications()),
            _ => None,
        };
        drop(aggregate);

        if let (Some(owner), Some(change)) = (owner.as_ref(), change) {
            owner.notify(change, error);
        }
        drop(ordered);

        Transition { old, new }
    }

    fn schedule(&self, core: &mut Core, delay: Duration, action: TimerAction) {
        let me = self.me.clone();
        core.timer = Some(self.timeout.refresh(core.timer.take(), delay, move || {
            if let Some(connection) = me.upgrade() {
                tokio::spawn(async move { connection.timeout(action).await });
            }
        }));
    }

    fn cancel(&self, core: &mut Core) {
        if let Some(key) = core.timer.take() {
            self.timeout.remove(key);
        }
    }

    /// Kill the connection without going through the state machine and
    /// release the transport. In-flight sends notice on their next state
    /// check.
    pub async fn shutdown(&self) {
        {
            let mut core = self.core.lock();
            core.state = ConnectionState::Dead;
            self.cancel(&mut core);
        }
        internal!("Shutting down connection {} to {}", self.id, self.address());
        self.connector.shutdown().await;
        self.physical_connection_ok.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let core = self.core.lock();
        ConnectionSnapshot {
            id: self.id,
            address: self.address().to_string(),
            state: core.state,
            retry_counter: core.retry_counter,
            stalled: core.stalled,
            timer_pending: core.timer.is_some(),
            last_error: core.last_error.clone(),
            server_accepts_requests: self.server_accepts_requests(),
            physical_connection_ok: self.physical_connection_ok(),
            statistics: self.statistics.snapshot(),
        }
    }
}

/// Diagnostic view of a [`Connection`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub address: String,
    pub state: ConnectionState,
    pub retry_counter: u32,
    pub stalled: bool,
    pub timer_pending: bool,
    pub last_error: Option<String>,
    pub server_accepts_requests: bool,
    pub physical_connection_ok: bool,
    pub statistics: StatisticsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Alive.to_string(), "ALIVE");
        assert_eq!(ConnectionState::Dead.to_string(), "DEAD");
    }

    #[test]
    fn test_transition_is_dead() {
        let transition = Transition {
            old: ConnectionState::Polling,
            new: ConnectionState::Dead,
        };
        assert!(transition.is_dead());
    }
}
