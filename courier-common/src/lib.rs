//! Shared primitives for the courier workspace: logging setup, span-scoped
//! log macros and the lifecycle [`Signal`] broadcast between components.

pub mod logging;

pub use tracing;

/// Lifecycle signal broadcast to long running components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting new work and wind down.
    Shutdown,
    /// Everything has been torn down.
    Finalised,
}
