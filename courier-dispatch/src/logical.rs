//! Failover over an ordered list of addresses.
//!
//! A [`LogicalConnection`] owns one [`Connection`] per configured address and
//! presents them as a single connection. Sends go to the first alive member
//! in configuration order; the logical state is derived from the members:
//!
//! ```text
//! any member ALIVE             -> ALIVE
//! else any member POLLING      -> POLLING
//! else any member UNDEF        -> UNDEF    (still initialising)
//! else                         -> DEAD
//! ```
//!
//! Member transitions and reconfiguration both run under one transition
//! lock, the member list itself is published as an immutable snapshot so
//! senders never hold a lock across I/O.

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use courier_common::{
    internal,
    tracing::{info, warn},
};
use futures_util::future::join_all;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;

use crate::{
    address::Address,
    connection::{Connection, ConnectionSnapshot, ConnectionState},
    connector::ConnectorFactory,
    error::{DispatchError, PermanentError, SystemError, TemporaryError},
    plugin::ConnectionStatusListener,
    queue::QueueEntry,
    timer::Timeout,
};

/// A change of the aggregate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

/// Aggregate state of a set of member states.
pub fn aggregate_state(states: impl IntoIterator<Item = ConnectionState>) -> ConnectionState {
    let mut result = ConnectionState::Dead;

    for state in states {
        result = match (result, state) {
            (_, ConnectionState::Alive) => return ConnectionState::Alive,
            (_, ConnectionState::Polling) | (ConnectionState::Polling, _) => {
                ConnectionState::Polling
            }
            (_, ConnectionState::Undef) | (ConnectionState::Undef, _) => ConnectionState::Undef,
            _ => ConnectionState::Dead,
        };
    }

    result
}

/// State guarded by the transition lock.
#[derive(Debug)]
pub(crate) struct Aggregate {
    state: ConnectionState,
}

pub(crate) struct LogicalShared {
    name: String,
    transitions: Mutex<Aggregate>,
    /// Replaced wholesale, only while holding `transitions`
    connections: RwLock<Arc<Vec<Arc<Connection>>>>,
    listener: RwLock<Option<Weak<dyn ConnectionStatusListener>>>,
    /// Taken before `transitions` is released so listeners see changes in
    /// the order they were computed
    notifications: Mutex<()>,
    factory: Arc<dyn ConnectorFactory>,
    timeout: Timeout,
    shut_down: AtomicBool,
}

impl LogicalShared {
    pub(crate) fn lock_transitions(&self) -> MutexGuard<'_, Aggregate> {
        self.transitions.lock()
    }

    pub(crate) fn lock_notifications(&self) -> MutexGuard<'_, ()> {
        self.notifications.lock()
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Connection>>> {
        Arc::clone(&self.connections.read())
    }

    fn recompute(&self, aggregate: &mut Aggregate) -> Option<StateChange> {
        let new = if self.shut_down.load(Ordering::Acquire) {
            ConnectionState::Dead
        } else {
            aggregate_state(self.snapshot().iter().map(|c| c.state()))
        };

        if new == aggregate.state {
            return None;
        }

        let old = std::mem::replace(&mut aggregate.state, new);
        Some(StateChange { old, new })
    }

    pub(crate) fn to_alive(
        &self,
        aggregate: &mut Aggregate,
        connection: &Connection,
    ) -> Option<StateChange> {
        let change = self.recompute(aggregate);
        if change.is_some() {
            info!(
                name = %self.name,
                via = %connection.address(),
                "Logical connection is alive"
            );
        }
        change
    }

    pub(crate) fn to_polling(
        &self,
        aggregate: &mut Aggregate,
        connection: &Connection,
        error: Option<&DispatchError>,
    ) -> Option<StateChange> {
        let change = self.recompute(aggregate);
        if change.is_some_and(|c| c.new == ConnectionState::Polling) {
            warn!(
                name = %self.name,
                last = %connection.address(),
                error = ?error.map(ToString::to_string),
                "No member connection is alive, polling"
            );
        }
        change
    }

    pub(crate) fn to_dead(
        &self,
        aggregate: &mut Aggregate,
        connection: &Connection,
        error: Option<&DispatchError>,
    ) -> Option<StateChange> {
        let change = self.recompute(aggregate);
        if change.is_some_and(|c| c.new == ConnectionState::Dead) {
            warn!(
                name = %self.name,
                last = %connection.address(),
                error = ?error.map(ToString::to_string),
                "Every member connection is dead"
            );
        }
        change
    }

    /// Report a change to the listener. Must be called without holding any
    /// connection lock.
    pub(crate) fn notify(&self, change: StateChange, error: Option<&DispatchError>) {
        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_state_change(change.old, change.new, error);
        }
    }
}

/// One logical destination backed by an ordered list of addresses.
#[derive(Clone)]
pub struct LogicalConnection {
    shared: Arc<LogicalShared>,
}

impl fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("connections", &self.shared.snapshot().len())
            .finish()
    }
}

impl LogicalConnection {
    pub fn new(name: impl Into<String>, factory: Arc<dyn ConnectorFactory>, timeout: Timeout) -> Self {
        Self {
            shared: Arc::new(LogicalShared {
                name: name.into(),
                transitions: Mutex::new(Aggregate {
                    state: ConnectionState::Undef,
                }),
                connections: RwLock::new(Arc::new(Vec::new())),
                listener: RwLock::new(None),
                notifications: Mutex::new(()),
                factory,
                timeout,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Register (or clear) the aggregate state listener. Only a weak
    /// reference is kept.
    pub fn set_status_listener(&self, listener: Option<Weak<dyn ConnectionStatusListener>>) {
        *self.shared.listener.write() = listener;
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.transitions.lock().state
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

    /// Member connections in configuration order.
    pub fn connections(&self) -> Arc<Vec<Arc<Connection>>> {
        self.shared.snapshot()
    }

    /// Address of the member a send would currently use, falling back to the
    /// first configured one.
    pub fn preferred_address(&self) -> Option<Arc<Address>> {
        let connections = self.shared.snapshot();
        connections
            .iter()
            .find(|c| c.is_alive())
            .or_else(|| connections.first())
            .map(|c| c.address())
    }

    /// Apply an address list.
    ///
    /// Endpoints already present keep their connection (and its state) and
    /// only take over the new policy settings. Endpoints that disappeared
    /// are shut down, new ones are created and initialised.
    ///
    /// # Errors
    ///
    /// Fails on an empty list, after shutdown, or when every member ended up
    /// dead while initialising.
    pub async fn initialize(&self, addresses: &[Address]) -> Result<(), DispatchError> {
        if addresses.is_empty() {
            return Err(SystemError::Configuration(format!(
                "{}: at least one address is required",
                self.shared.name
            ))
            .into());
        }

        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(PermanentError::ConnectionDead(format!(
                "{} has been shut down",
                self.shared.name
            ))
            .into());
        }

        let (removed, fresh) = {
            let mut aggregate = self.shared.transitions.lock();
            let current = self.shared.snapshot();
            let mut next: Vec<Arc<Connection>> = Vec::with_capacity(addresses.len());
            let mut fresh = Vec::new();

            for address in addresses {
                if next.iter().any(|c| c.address().same_endpoint(address)) {
                    warn!(name = %self.shared.name, address = %address, "Ignoring duplicate address");
                    continue;
                }

                if let Some(existing) = current.iter().find(|c| c.address().same_endpoint(address)) {
                    existing.set_address(address.clone());
                    next.push(Arc::clone(existing));
                } else {
                    let connection = Connection::new(
                        Arc::downgrade(&self.shared),
                        address.clone(),
                        self.shared.factory.as_ref(),
                        self.shared.timeout.clone(),
                    )?;
                    fresh.push(Arc::clone(&connection));
                    next.push(connection);
                }
            }

            let removed: Vec<_> = current
                .iter()
                .filter(|c| !next.iter().any(|n| Arc::ptr_eq(n, c)))
                .cloned()
                .collect();

            *self.shared.connections.write() = Arc::new(next);
            let change = self.shared.recompute(&mut aggregate);
            if let Some(change) = change {
                let _ordered = self.shared.lock_notifications();
                drop(aggregate);
                self.shared.notify(change, None);
            }
            (removed, fresh)
        };

        internal!(
            level = DEBUG,
            "{}: {} connections added, {} removed",
            self.shared.name,
            fresh.len(),
            removed.len()
        );

        join_all(removed.iter().map(|c| c.shutdown())).await;

        let mut last_error = None;
        for connection in &fresh {
            if let Err(error) = connection.initialize().await {
                warn!(
                    name = %self.shared.name,
                    address = %connection.address(),
                    error = %error,
                    "Failed to initialise connection"
                );
                last_error = Some(error);
            }
        }

        let mut aggregate = self.shared.lock_transitions();
        if let Some(change) = self.shared.recompute(&mut aggregate) {
            let _ordered = self.shared.lock_notifications();
            drop(aggregate);
            self.shared.notify(change, last_error.as_ref());
        } else {
            drop(aggregate);
        }

        match last_error {
            Some(error) if self.is_dead() => Err(error),
            _ => Ok(()),
        }
    }

    /// Deliver a batch through the first alive member, failing over to the
    /// next alive one in configuration order.
    ///
    /// # Errors
    ///
    /// When no member could deliver: "connection dead" if the aggregate is
    /// dead, "currently polling" while polling, "no connection" otherwise.
    pub async fn send(&self, entries: &[QueueEntry]) -> Result<Vec<String>, DispatchError> {
        let connections = self.shared.snapshot();
        let mut last_error = None;

        for connection in connections.iter().filter(|c| c.is_alive()) {
            match connection.send(entries).await {
                Ok(receipts) => return Ok(receipts),
                Err(error) => {
                    warn!(
                        name = %self.shared.name,
                        address = %connection.address(),
                        error = %error,
                        "Send failed, trying next connection"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(self.unavailable(last_error))
    }

    /// Health check every member that is not dead; the first answer in
    /// configuration order wins.
    ///
    /// # Errors
    ///
    /// As [`LogicalConnection::send`] when no member answered.
    pub async fn ping(&self, data: &str) -> Result<String, DispatchError> {
        let connections = self.shared.snapshot();
        let results = join_all(
            connections
                .iter()
                .filter(|c| !c.is_dead())
                .map(|c| c.ping(data)),
        )
        .await;

        let mut last_error = None;
        for result in results {
            match result {
                Ok(response) => return Ok(response),
                Err(error) => last_error = Some(error),
            }
        }

        Err(self.unavailable(last_error))
    }

    fn unavailable(&self, last_error: Option<DispatchError>) -> DispatchError {
        let detail = last_error.map_or_else(
            || format!("{}: no alive connection", self.shared.name),
            |error| format!("{}: {error}", self.shared.name),
        );

        match self.state() {
            ConnectionState::Dead => PermanentError::ConnectionDead(detail).into(),
            ConnectionState::Polling => TemporaryError::Polling(detail).into(),
            ConnectionState::Alive | ConnectionState::Undef => {
                TemporaryError::NoConnection(detail).into()
            }
        }
    }

    /// Shut every member down. The logical connection is dead afterwards and
    /// can not be initialised again.
    pub async fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);

        let connections = {
            let mut aggregate = self.shared.transitions.lock();
            let connections = std::mem::take(&mut *self.shared.connections.write());
            if let Some(change) = self.shared.recompute(&mut aggregate) {
                let _ordered = self.shared.lock_notifications();
                drop(aggregate);
                self.shared.notify(change, None);
            }
            connections
        };

        internal!(
            level = INFO,
            "Shutting down logical connection {} ({} members)",
            self.shared.name,
            connections.len()
        );

        join_all(connections.iter().map(|c| c.shutdown())).await;
    }

    pub fn dump(&self) -> LogicalSnapshot {
        LogicalSnapshot {
            name: self.shared.name.clone(),
            state: self.state(),
            connections: self.shared.snapshot().iter().map(|c| c.snapshot()).collect(),
        }
    }
}

/// Diagnostic view of a [`LogicalConnection`].
#[derive(Debug, Clone, Serialize)]
pub struct LogicalSnapshot {
    pub name: String,
    pub state: ConnectionState,
    pub connections: Vec<ConnectionSnapshot>,
}
