//! Typed error handling for dispatch operations.
//!
//! Errors are split the same way the state machine reacts to them:
//! - Temporary failures (network blips, standby servers) - retried within the
//!   address' retry budget
//! - Permanent failures (dead connections, rejected credentials) - terminal
//! - System errors - configuration, queue and internal problems, never retried

use thiserror::Error;

/// Top-level dispatch error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Failure that may succeed on a later attempt.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// Failure that will not go away by retrying.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Local problem unrelated to the remote endpoint.
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Transient communication failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemporaryError {
    /// Could not establish the physical connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection broke while in use.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The remote side did not answer in time, or an in-flight transfer
    /// stopped making progress.
    #[error("Response timeout: {0}")]
    ResponseTimeout(String),

    /// The endpoint is reachable but not accepting work right now.
    #[error("Server in standby: {0}")]
    ServerStandby(String),

    /// The connection is polling for its endpoint and cannot serve requests.
    #[error("Currently polling, cannot service this request: {0}")]
    Polling(String),

    /// No member connection was able to take the request.
    #[error("No connection available: {0}")]
    NoConnection(String),
}

/// Terminal failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermanentError {
    /// The connection reached its terminal state.
    #[error("Connection is dead: {0}")]
    ConnectionDead(String),

    /// Credentials were refused; no retry can fix this without intervention.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote side refused the request for a reason unrelated to
    /// communication.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Errors raised by the engine itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SystemError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The queue refused an operation.
    #[error("Queue error: {0}")]
    Queue(String),

    /// The worker pool no longer accepts tasks.
    #[error("Worker pool is shut down")]
    PoolShutdown,

    /// Programming or internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a connection transition reacts to an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The operation succeeded.
    None,
    /// Transient communication failure, subject to the retry budget.
    Retryable,
    /// Rejected credentials; terminal regardless of the retry budget.
    Authentication,
    /// Endpoint reachable but declining work; soft failure, still retried.
    ServerDeny,
    /// Anything else; terminal.
    Terminal,
}

impl ErrorClass {
    /// Classify the outcome of a send, ping or connect.
    #[must_use]
    pub const fn of(error: Option<&DispatchError>) -> Self {
        match error {
            None => Self::None,
            Some(e) if e.is_authentication() => Self::Authentication,
            Some(e) if e.is_server_deny() => Self::ServerDeny,
            Some(e) if e.is_retryable() => Self::Retryable,
            Some(_) => Self::Terminal,
        }
    }
}

impl DispatchError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Any failure that originates in talking to the remote endpoint.
    #[must_use]
    pub const fn is_communication(&self) -> bool {
        matches!(
            self,
            Self::Temporary(_) | Self::Permanent(PermanentError::ConnectionDead(_))
        )
    }

    /// Communication failures a connection may recover from by polling.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.is_temporary()
    }

    #[must_use]
    pub const fn is_authentication(&self) -> bool {
        matches!(self, Self::Permanent(PermanentError::AuthenticationFailed(_)))
    }

    #[must_use]
    pub const fn is_server_deny(&self) -> bool {
        matches!(self, Self::Temporary(TemporaryError::ServerStandby(_)))
    }

    #[must_use]
    pub const fn is_dead(&self) -> bool {
        matches!(self, Self::Permanent(PermanentError::ConnectionDead(_)))
    }

    #[must_use]
    pub const fn is_polling(&self) -> bool {
        matches!(self, Self::Temporary(TemporaryError::Polling(_)))
    }

    /// Re-tag this error as the terminal "connection dead" error, keeping the
    /// original description.
    #[must_use]
    pub fn into_dead(self) -> Self {
        if self.is_dead() {
            return self;
        }

        Self::Permanent(PermanentError::ConnectionDead(self.to_string()))
    }

    /// The classification used by connection transitions.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        ErrorClass::of(Some(self))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_temporary_errors_are_retryable_communication() {
        let error = DispatchError::from(TemporaryError::ConnectionFailed("refused".to_string()));
        assert!(error.is_temporary());
        assert!(error.is_retryable());
        assert!(error.is_communication());
        assert!(!error.is_permanent());
        assert!(!error.is_system());
        assert_eq!(error.class(), ErrorClass::Retryable);
    }

    #[test]
    fn test_authentication_is_terminal_class() {
        let error = DispatchError::from(PermanentError::AuthenticationFailed("bad".to_string()));
        assert!(error.is_authentication());
        assert!(!error.is_retryable());
        assert!(!error.is_communication());
        assert_eq!(error.class(), ErrorClass::Authentication);
    }

    #[test]
    fn test_server_standby_is_soft_failure() {
        let error = DispatchError::from(TemporaryError::ServerStandby("busy".to_string()));
        assert!(error.is_server_deny());
        assert!(error.is_retryable());
        assert_eq!(error.class(), ErrorClass::ServerDeny);
    }

    #[test]
    fn test_other_errors_are_terminal() {
        let rejected = DispatchError::from(PermanentError::Rejected("no".to_string()));
        assert_eq!(rejected.class(), ErrorClass::Terminal);

        let internal = DispatchError::from(SystemError::Internal("bug".to_string()));
        assert_eq!(internal.class(), ErrorClass::Terminal);
        assert_eq!(ErrorClass::of(None), ErrorClass::None);
    }

    #[test]
    fn test_into_dead_keeps_description() {
        let error = DispatchError::from(TemporaryError::ConnectionLost("reset".to_string()));
        let dead = error.into_dead();
        assert!(dead.is_dead());
        assert!(dead.is_communication());
        assert_eq!(
            dead.to_string(),
            "Permanent failure: Connection is dead: Temporary failure: Connection lost: reset"
        );

        let again = dead.clone().into_dead();
        assert_eq!(again, dead);
    }

    #[test]
    fn test_error_display() {
        let error = DispatchError::from(TemporaryError::Polling("socket://a".to_string()));
        assert_eq!(
            error.to_string(),
            "Temporary failure: Currently polling, cannot service this request: socket://a"
        );
        assert!(error.is_polling());

        let error = DispatchError::from(SystemError::PoolShutdown);
        assert_eq!(error.to_string(), "System error: Worker pool is shut down");
    }
}
