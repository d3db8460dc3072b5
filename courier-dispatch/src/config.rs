//! Dispatch configuration, loaded from RON.
//!
//! ```ron
//! (
//!     name: "orders",
//!     addresses: [
//!         (protocol: "socket", endpoint: "primary:5555", retries: 5, delay_ms: 1000),
//!         (protocol: "socket", endpoint: "backup:5555"),
//!     ],
//!     pool: (max_size: 8),
//! )
//! ```

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    address::Address,
    error::{DispatchError, SystemError},
};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Slots kept alive even when idle
    ///
    /// Default: 2
    #[serde(default = "defaults::min_size")]
    pub min_size: usize,

    /// Upper bound on concurrently running tasks
    ///
    /// Default: 50
    #[serde(default = "defaults::max_size")]
    pub max_size: usize,

    /// Slots started eagerly when the pool is created
    ///
    /// Default: 2
    #[serde(default = "defaults::warm_start")]
    pub warm_start: usize,

    /// How long a slot above `min_size` may sit idle before it exits
    /// (milliseconds)
    ///
    /// Default: 180000 (3 minutes)
    #[serde(default = "defaults::idle_lifetime_ms")]
    pub idle_lifetime_ms: u64,

    /// Tasks waiting for a slot before submitters block
    ///
    /// Default: 64
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: defaults::min_size(),
            max_size: defaults::max_size(),
            warm_start: defaults::warm_start(),
            idle_lifetime_ms: defaults::idle_lifetime_ms(),
            queue_capacity: defaults::queue_capacity(),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn idle_lifetime(&self) -> Duration {
        Duration::from_millis(self.idle_lifetime_ms)
    }

    /// # Errors
    ///
    /// Rejects `max_size == 0`, `min_size > max_size` and
    /// `queue_capacity == 0`.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_size == 0 {
            return Err(invalid("pool.max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(invalid(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("pool.queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration of one dispatch manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub name: String,

    /// Endpoints in failover order
    pub addresses: Vec<Address>,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Periodic re-check of the queue (milliseconds)
    ///
    /// Default: 1000
    #[serde(default = "defaults::dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// Time a running worker gets to finish on shutdown (seconds)
    ///
    /// Default: 30
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl DispatchConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, addresses: Vec<Address>) -> Self {
        Self {
            name: name.into(),
            addresses,
            pool: PoolConfig::default(),
            dispatch_interval_ms: defaults::dispatch_interval_ms(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
        }
    }

    #[must_use]
    pub const fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Parse and validate a RON document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when parsing or validation fails.
    pub fn from_ron_str(config: &str) -> Result<Self, DispatchError> {
        let config: Self = ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .from_str(config)
            .map_err(|e| invalid(format!("Failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration file found by [`find_config_file`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no file is found, it can not be
    /// read, or its content is invalid.
    pub fn load() -> Result<Self, DispatchError> {
        Self::load_from(&find_config_file()?)
    }

    /// # Errors
    ///
    /// Returns a configuration error when the file can not be read or its
    /// content is invalid.
    pub fn load_from(path: &Path) -> Result<Self, DispatchError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            invalid(format!("Failed to read config from {}: {e}", path.display()))
        })?;
        Self::from_ron_str(&content)
    }

    /// # Errors
    ///
    /// Rejects an empty or duplicated address list and invalid pool sizing.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.addresses.is_empty() {
            return Err(invalid(format!("{}: at least one address is required", self.name)));
        }

        let mut seen = HashSet::new();
        for address in &self.addresses {
            if !seen.insert(address.key()) {
                return Err(invalid(format!(
                    "{}: address {address} is configured more than once",
                    self.name
                )));
            }
        }

        self.pool.validate()
    }
}

fn invalid(message: impl Into<String>) -> DispatchError {
    SystemError::Configuration(message.into()).into()
}

/// Find the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.config.ron (current working directory)
/// 3. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
///
/// Fails when `COURIER_CONFIG` names a missing file or no default path
/// exists.
pub fn find_config_file() -> Result<PathBuf, DispatchError> {
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(invalid(format!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        )));
    }

    if let Some(path) = DEFAULT_PATHS.iter().map(PathBuf::from).find(|p| p.exists()) {
        return Ok(path);
    }

    let paths_tried = DEFAULT_PATHS
        .iter()
        .map(|p| format!("  - {p}"))
        .collect::<Vec<_>>()
        .join("\n");

    Err(invalid(format!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )))
}

mod defaults {
    pub const fn min_size() -> usize {
        2
    }

    pub const fn max_size() -> usize {
        50
    }

    pub const fn warm_start() -> usize {
        2
    }

    pub const fn idle_lifetime_ms() -> u64 {
        180_000
    }

    pub const fn queue_capacity() -> usize {
        64
    }

    pub const fn dispatch_interval_ms() -> u64 {
        1_000
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = DispatchConfig::from_ron_str(
            r#"(
                name: "orders",
                addresses: [(protocol: "socket", endpoint: "primary:5555")],
            )"#,
        )
        .expect("valid configuration");

        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.dispatch_interval(), Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));

        let address = &config.addresses[0];
        assert_eq!(address.retries, -1);
        assert_eq!(address.delay_ms, 5000);
        assert_eq!(address.ping_interval_ms, 10_000);
        assert_eq!(address.burst_mode_max_entries, 1);
        assert_eq!(address.burst_mode_max_bytes, -1);
        assert!(!address.stall_is_failure);
    }

    #[test]
    fn test_full_configuration() {
        let config = DispatchConfig::from_ron_str(
            r#"(
                name: "orders",
                addresses: [
                    (protocol: "socket", endpoint: "primary:5555", retries: 5, delay_ms: 100),
                    (protocol: "socket", endpoint: "backup:5555", burst_mode_max_entries: -1),
                ],
                pool: (min_size: 1, max_size: 4, warm_start: 0, queue_capacity: 8),
                dispatch_interval_ms: 250,
            )"#,
        )
        .expect("valid configuration");

        assert_eq!(config.addresses.len(), 2);
        assert_eq!(config.addresses[0].retries, 5);
        assert_eq!(config.addresses[1].max_entries(), None);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.idle_lifetime(), Duration::from_secs(180));
        assert_eq!(config.dispatch_interval_ms, 250);
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            (r#"(name: "a", addresses: [])"#, "at least one address"),
            (
                r#"(name: "a", addresses: [(protocol: "p", endpoint: "e"), (protocol: "p", endpoint: "e", retries: 3)])"#,
                "more than once",
            ),
            (
                r#"(name: "a", addresses: [(protocol: "p", endpoint: "e")], pool: (min_size: 5, max_size: 2))"#,
                "exceeds",
            ),
            (
                r#"(name: "a", addresses: [(protocol: "p", endpoint: "e")], pool: (min_size: 0, max_size: 0))"#,
                "max_size",
            ),
            (
                r#"(name: "a", addresses: [(protocol: "p", endpoint: "e")], pool: (queue_capacity: 0))"#,
                "queue_capacity",
            ),
            (r#"(name: "a""#, "Failed to parse"),
        ];

        for (input, expected) in cases {
            let error = DispatchConfig::from_ron_str(input).expect_err(input);
            assert!(error.is_system(), "{input}");
            assert!(
                error.to_string().contains(expected),
                "{input}: {error} does not mention {expected}"
            );
        }
    }

    #[test]
    fn test_load_from_missing_file() {
        let error = DispatchConfig::load_from(Path::new("/nonexistent/courier.config.ron"))
            .expect_err("missing file");
        assert!(error.to_string().contains("Failed to read config"));
    }
}
