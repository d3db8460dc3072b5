//! Scriptable in-process connector
//!
//! Every endpoint name maps to one shared [`MockEndpoint`], so a test can
//! script outcomes before or after the dispatch engine creates its
//! connections:
//!
//! ```rust,ignore
//! let factory = MockConnectorFactory::new();
//! factory.endpoint("primary").fail_connect(TemporaryError::ConnectionFailed("down".into()));
//! factory.endpoint("primary").push_send(Ok(()));
//! ```
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use courier_dispatch::{
    Address, Connector, ConnectorFactory, DeliveryStatistics, DispatchError, ProgressListener,
    QueueEntry, SystemError,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Outcome queue with a fallback used once the script ran out.
#[derive(Debug)]
struct Script {
    queued: VecDeque<Result<(), DispatchError>>,
    fallback: Result<(), DispatchError>,
}

impl Script {
    fn ok() -> Self {
        Self {
            queued: VecDeque::new(),
            fallback: Ok(()),
        }
    }

    fn next(&mut self) -> Result<(), DispatchError> {
        self.queued
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Shared behaviour and recordings of one endpoint.
#[derive(Debug)]
pub struct MockEndpoint {
    name: String,
    connect: Mutex<Script>,
    send: Mutex<Script>,
    ping: Mutex<Script>,
    sent: Mutex<Vec<Vec<u64>>>,
    connects: AtomicUsize,
    pings: AtomicUsize,
    shutdowns: AtomicUsize,
    hold_sends: AtomicBool,
    release: Notify,
    statistics: Mutex<Option<Arc<DeliveryStatistics>>>,
}

impl MockEndpoint {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connect: Mutex::new(Script::ok()),
            send: Mutex::new(Script::ok()),
            ping: Mutex::new(Script::ok()),
            sent: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            hold_sends: AtomicBool::new(false),
            release: Notify::new(),
            statistics: Mutex::new(None),
        }
    }

    /// Every further connect fails with `error`.
    pub fn fail_connect(&self, error: impl Into<DispatchError>) {
        self.connect.lock().fallback = Err(error.into());
    }

    /// Every further ping fails with `error`.
    pub fn fail_ping(&self, error: impl Into<DispatchError>) {
        self.ping.lock().fallback = Err(error.into());
    }

    /// Every further send fails with `error`.
    pub fn fail_send(&self, error: impl Into<DispatchError>) {
        self.send.lock().fallback = Err(error.into());
    }

    /// Connect, ping and send succeed again.
    pub fn heal(&self) {
        self.connect.lock().fallback = Ok(());
        self.ping.lock().fallback = Ok(());
        self.send.lock().fallback = Ok(());
    }

    pub fn push_connect(&self, outcome: Result<(), DispatchError>) {
        self.connect.lock().queued.push_back(outcome);
    }

    pub fn push_ping(&self, outcome: Result<(), DispatchError>) {
        self.ping.lock().queued.push_back(outcome);
    }

    pub fn push_send(&self, outcome: Result<(), DispatchError>) {
        self.send.lock().queued.push_back(outcome);
    }

    /// Sends block until [`MockEndpoint::release_sends`].
    pub fn hold_sends(&self) {
        self.hold_sends.store(true, Ordering::SeqCst);
    }

    pub fn release_sends(&self) {
        self.hold_sends.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Report written bytes as the connector would while transferring.
    pub fn report_progress(&self, bytes: u64) {
        if let Some(statistics) = self.statistics.lock().as_ref() {
            statistics.progress_write(bytes);
        }
    }

    /// Ids of every delivered batch, in delivery order.
    pub fn sent_batches(&self) -> Vec<Vec<u64>> {
        self.sent.lock().clone()
    }

    pub fn sent_ids(&self) -> Vec<u64> {
        self.sent.lock().iter().flatten().copied().collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

/// Connector handed to the engine; all behaviour lives in the endpoint.
pub struct MockConnector {
    endpoint: Arc<MockEndpoint>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _address: &Address) -> Result<(), DispatchError> {
        self.endpoint.connects.fetch_add(1, Ordering::SeqCst);
        self.endpoint.connect.lock().next()
    }

    async fn send(&self, entries: &[QueueEntry]) -> Result<Vec<String>, DispatchError> {
        let released = self.endpoint.release.notified();
        if self.endpoint.hold_sends.load(Ordering::SeqCst) {
            released.await;
        }

        let outcome = self.endpoint.send.lock().next();
        outcome?;

        self.endpoint
            .sent
            .lock()
            .push(entries.iter().map(QueueEntry::id).collect());
        Ok(entries
            .iter()
            .map(|entry| format!("{}:{}", self.endpoint.name, entry.id()))
            .collect())
    }

    async fn ping(&self, data: &str) -> Result<String, DispatchError> {
        self.endpoint.pings.fetch_add(1, Ordering::SeqCst);
        let outcome = self.endpoint.ping.lock().next();
        outcome.map(|()| format!("pong {data}"))
    }

    async fn shutdown(&self) {
        self.endpoint.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds [`MockConnector`]s keyed by endpoint name.
#[derive(Debug, Default)]
pub struct MockConnectorFactory {
    endpoints: Mutex<HashMap<String, Arc<MockEndpoint>>>,
    refuse_protocol: Mutex<Option<String>>,
}

impl MockConnectorFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The endpoint named `name`, created on first use.
    pub fn endpoint(&self, name: &str) -> Arc<MockEndpoint> {
        Arc::clone(
            self.endpoints
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MockEndpoint::new(name))),
        )
    }

    /// Fail to create connectors for `protocol`.
    pub fn refuse(&self, protocol: &str) {
        *self.refuse_protocol.lock() = Some(protocol.to_string());
    }
}

impl ConnectorFactory for MockConnectorFactory {
    fn create(
        &self,
        address: &Address,
        statistics: Arc<DeliveryStatistics>,
    ) -> Result<Box<dyn Connector>, DispatchError> {
        if self.refuse_protocol.lock().as_deref() == Some(address.protocol.as_str()) {
            return Err(SystemError::Configuration(format!(
                "Unsupported protocol {}",
                address.protocol
            ))
            .into());
        }

        let endpoint = self.endpoint(&address.endpoint);
        *endpoint.statistics.lock() = Some(statistics);
        Ok(Box::new(MockConnector { endpoint }))
    }
}
