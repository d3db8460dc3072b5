//! Message priority levels.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, SystemError};

/// Delivery priority, `0` (lowest) to `9` (highest).
///
/// Higher priorities are drained from a queue first; entries of equal
/// priority keep their enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Self = Self(0);
    pub const LOW: Self = Self(3);
    pub const NORM: Self = Self(5);
    pub const HIGH: Self = Self(7);
    pub const MAX: Self = Self(9);

    /// Create a priority, clamping out-of-range values to [`Priority::MAX`].
    #[must_use]
    pub const fn new(value: u8) -> Self {
        if value > Self::MAX.0 {
            Self::MAX
        } else {
            Self(value)
        }
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORM
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl FromStr for Priority {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(value) = s.parse::<u8>() {
            return Ok(Self::new(value));
        }

        match s.to_ascii_uppercase().as_str() {
            "MIN" | "MIN1" => Ok(Self::MIN),
            "LOW" => Ok(Self::LOW),
            "NORM" | "NORMAL" => Ok(Self::NORM),
            "HIGH" => Ok(Self::HIGH),
            "MAX" => Ok(Self::MAX),
            _ => Err(SystemError::Configuration(format!("Unknown priority '{s}'")).into()),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MIN => f.write_str("MIN"),
            Self::LOW => f.write_str("LOW"),
            Self::NORM => f.write_str("NORM"),
            Self::HIGH => f.write_str("HIGH"),
            Self::MAX => f.write_str("MAX"),
            Self(other) => write!(f, "{other}"),
        }
    }
}
