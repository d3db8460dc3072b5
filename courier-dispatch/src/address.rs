//! Endpoint descriptors.

use std::{fmt, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A remote endpoint together with the policy used to reach it.
///
/// Two addresses are the same endpoint when their [`Address::key`] matches;
/// the remaining fields may change on reconfiguration without the
/// connection being rebuilt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    /// Protocol identity understood by the connector, e.g. `"socket"`.
    pub protocol: String,

    /// Protocol specific location of the endpoint.
    pub endpoint: String,

    /// Number of failed attempts tolerated before the connection is
    /// declared dead. `-1` retries forever.
    ///
    /// Default: -1
    #[serde(default = "defaults::retries")]
    pub retries: i32,

    /// Delay between polling attempts (milliseconds)
    ///
    /// Default: 5000
    #[serde(default = "defaults::delay_ms")]
    pub delay_ms: u64,

    /// Interval between health pings while alive (milliseconds), `0` disables
    /// pinging.
    ///
    /// Default: 10000
    #[serde(default = "defaults::ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// How long a ping may take before it counts as failed (milliseconds)
    ///
    /// Default: 60000
    #[serde(default = "defaults::ping_response_timeout_ms")]
    pub ping_response_timeout_ms: u64,

    /// Maximum number of entries pulled from the queue per delivery attempt,
    /// `-1` for no limit.
    ///
    /// Default: 1
    #[serde(default = "defaults::burst_mode_max_entries")]
    pub burst_mode_max_entries: i32,

    /// Maximum number of bytes pulled from the queue per delivery attempt,
    /// `-1` for no limit.
    ///
    /// Default: -1
    #[serde(default = "defaults::burst_mode_max_bytes")]
    pub burst_mode_max_bytes: i64,

    /// Treat an in-flight transfer that made no byte progress between two
    /// pings as a failed ping, instead of only flagging it as stalled.
    ///
    /// Default: false
    #[serde(default)]
    pub stall_is_failure: bool,

    /// Randomises the polling delay within ±`retry_jitter_factor`.
    ///
    /// Default: 0.0 (exact delay)
    #[serde(default)]
    pub retry_jitter_factor: f64,

    /// The address was restored from persistence and the endpoint should be
    /// polled rather than contacted straight away on first start.
    ///
    /// Default: false
    #[serde(default)]
    pub from_persistence_recovery: bool,
}

/// Identity of an endpoint, independent of its policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressKey {
    pub protocol: String,
    pub endpoint: String,
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.endpoint)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.endpoint)
    }
}

impl Address {
    /// Create an address with default policy.
    #[must_use]
    pub fn new(protocol: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            endpoint: endpoint.into(),
            retries: defaults::retries(),
            delay_ms: defaults::delay_ms(),
            ping_interval_ms: defaults::ping_interval_ms(),
            ping_response_timeout_ms: defaults::ping_response_timeout_ms(),
            burst_mode_max_entries: defaults::burst_mode_max_entries(),
            burst_mode_max_bytes: defaults::burst_mode_max_bytes(),
            stall_is_failure: false,
            retry_jitter_factor: 0.0,
            from_persistence_recovery: false,
        }
    }

    #[must_use]
    pub fn key(&self) -> AddressKey {
        AddressKey {
            protocol: self.protocol.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    #[must_use]
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.endpoint == other.endpoint
    }

    /// Whether another failed attempt is allowed after `retry_counter`
    /// failures.
    #[must_use]
    pub fn may_retry(&self, retry_counter: u32) -> bool {
        self.retries < 0 || i64::from(retry_counter) < i64::from(self.retries)
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// The polling delay with jitter applied.
    #[must_use]
    pub fn jittered_delay(&self) -> Duration {
        let delay = self.delay();
        if self.retry_jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let secs = delay.as_secs_f64();
        let range = secs * self.retry_jitter_factor.min(1.0);
        let jitter: f64 = rand::rng().random_range(-range..=range);
        Duration::from_secs_f64((secs + jitter).max(0.0))
    }

    /// The ping interval, `None` when pinging is disabled.
    #[must_use]
    pub const fn ping_interval(&self) -> Option<Duration> {
        if self.ping_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.ping_interval_ms))
        }
    }

    #[must_use]
    pub const fn ping_response_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_response_timeout_ms)
    }

    /// Burst limit on entries, `None` when unlimited.
    #[must_use]
    pub fn max_entries(&self) -> Option<usize> {
        usize::try_from(self.burst_mode_max_entries).ok()
    }

    /// Burst limit on bytes, `None` when unlimited.
    #[must_use]
    pub fn max_bytes(&self) -> Option<u64> {
        u64::try_from(self.burst_mode_max_bytes).ok()
    }
}

mod defaults {
    pub const fn retries() -> i32 {
        -1
    }

    pub const fn delay_ms() -> u64 {
        5000
    }

    pub const fn ping_interval_ms() -> u64 {
        10_000
    }

    pub const fn ping_response_timeout_ms() -> u64 {
        60_000
    }

    pub const fn burst_mode_max_entries() -> i32 {
        1
    }

    pub const fn burst_mode_max_bytes() -> i64 {
        -1
    }
}
