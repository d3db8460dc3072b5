//! Pluggable low-level transport behind each physical connection.
//!
//! The dispatch engine never frames or serialises anything itself; a
//! [`Connector`] owns the wire and reports its outcome as a typed
//! [`DispatchError`] so connection transitions can classify it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    address::Address, error::DispatchError, queue::QueueEntry,
    statistics::DeliveryStatistics,
};

/// Transport for one endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish (or re-establish) the physical connection.
    async fn connect(&self, address: &Address) -> Result<(), DispatchError>;

    /// Deliver a batch, returning one receipt per entry in the same order.
    async fn send(&self, entries: &[QueueEntry]) -> Result<Vec<String>, DispatchError>;

    /// Health check. The response is protocol specific.
    async fn ping(&self, data: &str) -> Result<String, DispatchError>;

    /// Release the physical connection. Must not fail.
    async fn shutdown(&self);
}

/// Builds a [`Connector`] for an address.
///
/// The statistics handed over are the connection's own; connectors report
/// byte progress through them so stalled transfers can be detected.
pub trait ConnectorFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the address' protocol is not supported.
    fn create(
        &self,
        address: &Address,
        statistics: Arc<DeliveryStatistics>,
    ) -> Result<Box<dyn Connector>, DispatchError>;
}
