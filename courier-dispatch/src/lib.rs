//! Dispatch engine draining message queues towards remote endpoints
//!
//! This crate provides:
//! - A per-endpoint connection state machine with ping and polling schedules
//! - Failover across an ordered list of addresses behind one logical connection
//! - Batching workers that commit queue entries only after confirmed delivery
//! - A bounded worker pool that throttles producers when saturated

mod address;
mod config;
mod connection;
mod connector;
mod error;
mod logical;
mod manager;
mod plugin;
mod pool;
mod priority;
pub mod queue;
mod statistics;
mod timer;
mod worker;

// Re-export configuration types
pub use address::{Address, AddressKey};
pub use config::{CONFIG_ENV, DispatchConfig, PoolConfig, find_config_file};
// Re-export connection types
pub use connection::{Connection, ConnectionSnapshot, ConnectionState, TimerAction, Transition};
pub use connector::{Connector, ConnectorFactory};
pub use logical::{LogicalConnection, LogicalSnapshot, StateChange, aggregate_state};
// Re-export error types
pub use error::{DispatchError, ErrorClass, PermanentError, SystemError, TemporaryError};
// Re-export core types
pub use manager::{DispatchManager, ManagerSnapshot};
pub use plugin::{
    ConnectionStatusListener, DeadLetterSink, DefaultErrorHandler, DispatchInterceptor,
    ErrorDisposition, MemoryDeadLetters, PostSendListener, WorkerErrorHandler,
};
pub use pool::{PoolStats, WorkerPool};
pub use priority::Priority;
pub use queue::{MemoryQueue, Queue, QueueEntry, QueuePutListener};
pub use statistics::{DeliveryStatistics, InFlight, Progress, ProgressListener, StatisticsSnapshot};
pub use timer::{Timeout, TimerKey};
pub use worker::{CycleOutcome, DispatchWorker};
