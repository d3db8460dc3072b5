//! Test support utilities for the dispatch engine
//!
//! Provides a scriptable connector plus builders for the pieces most tests
//! need: addresses with short delays, logical connections and managers over
//! an in-memory queue.
#![allow(dead_code)] // Test utility module - not all methods used in every test

pub mod mock_connector;

use std::sync::Arc;

use courier_dispatch::{
    Address, ConnectionState, ConnectionStatusListener, DispatchConfig, DispatchError,
    DispatchManager, LogicalConnection, MemoryQueue, PoolConfig, Priority, QueueEntry, Timeout,
    WorkerPool,
};
pub use mock_connector::{MockConnectorFactory, MockEndpoint};
use parking_lot::Mutex;

/// Address on the mock protocol with test friendly timings: polls every
/// 100ms, pings every second, unlimited retries and batch size.
pub fn address(endpoint: &str) -> Address {
    let mut address = Address::new("mock", endpoint);
    address.delay_ms = 100;
    address.ping_interval_ms = 1_000;
    address.ping_response_timeout_ms = 500;
    address.burst_mode_max_entries = -1;
    address
}

pub fn entry(priority: Priority, payload: &str) -> QueueEntry {
    QueueEntry::new(priority, "test", payload.as_bytes().to_vec())
}

/// Let spawned tasks run without advancing the clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Advance the (paused) clock and let timer callbacks run.
pub async fn advance(millis: u64) {
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
    settle().await;
}

pub fn logical(factory: &Arc<MockConnectorFactory>) -> LogicalConnection {
    let timeout = Timeout::start().expect("tokio runtime");
    LogicalConnection::new("test", Arc::clone(factory) as _, timeout)
}

/// Aggregate state changes seen by a listener.
#[derive(Debug, Default)]
pub struct RecordingListener {
    changes: Mutex<Vec<(ConnectionState, ConnectionState, Option<String>)>>,
}

impl RecordingListener {
    pub fn changes(&self) -> Vec<(ConnectionState, ConnectionState)> {
        self.changes
            .lock()
            .iter()
            .map(|(old, new, _)| (*old, *new))
            .collect()
    }

    pub fn last_error(&self) -> Option<String> {
        self.changes.lock().last().and_then(|(_, _, e)| e.clone())
    }
}

impl ConnectionStatusListener for RecordingListener {
    fn on_state_change(
        &self,
        old: ConnectionState,
        new: ConnectionState,
        error: Option<&DispatchError>,
    ) {
        self.changes
            .lock()
            .push((old, new, error.map(ToString::to_string)));
    }
}

pub fn pool_config() -> PoolConfig {
    PoolConfig {
        min_size: 1,
        max_size: 4,
        warm_start: 1,
        idle_lifetime_ms: 60_000,
        queue_capacity: 8,
    }
}

/// A manager over a fresh [`MemoryQueue`], not yet initialised.
pub fn manager(
    factory: &Arc<MockConnectorFactory>,
    addresses: Vec<Address>,
) -> (DispatchManager, Arc<MemoryQueue>) {
    courier_common::logging::init();

    let mut config = DispatchConfig::new("test", addresses);
    config.pool = pool_config();
    config.dispatch_interval_ms = 200;
    config.shutdown_timeout_secs = 5;

    let queue = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new("test", config.pool.clone()).expect("pool");
    let timeout = Timeout::start().expect("tokio runtime");
    let manager = DispatchManager::new(
        config,
        Arc::clone(&queue) as _,
        Arc::clone(factory) as _,
        pool,
        timeout,
    )
    .expect("valid configuration");

    (manager, queue)
}
