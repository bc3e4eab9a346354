//! Connection options.
//!
//! Options can be built in code with the `with_*` methods or loaded from
//! JSON. Durations are expressed in milliseconds on the wire.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use sparkwire::{ConnectionOptions, Strategy};
//!
//! let options = ConnectionOptions::new()
//!     .with_ping(Duration::from_secs(10))
//!     .with_queue_size(64)
//!     .with_strategy(Strategy::DISCONNECT | Strategy::TIMEOUT);
//!
//! let same = ConnectionOptions::from_json(
//!     r#"{ "ping": 10000, "queueSize": 64, "strategy": "disconnect,timeout" }"#,
//! )?;
//! ```
//!
//! # Defaults
//!
//! | Option | Default |
//! |--------|---------|
//! | `reconnect.min` | 500 ms |
//! | `reconnect.max` | unbounded |
//! | `reconnect.retries` | 25 |
//! | `reconnect.factor` | 2 |
//! | `reconnect.timeout` | 30000 ms |
//! | `ping` | 25000 ms (0 disables) |
//! | `pong` | 10000 ms |
//! | `timeout` | 10000 ms (0 disables) |
//! | `queueSize` | unbounded |
//! | `strategy` | `disconnect,online,timeout` |
//! | `manual` | `false` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_RECONNECT_MIN: Duration = Duration::from_millis(500);
const DEFAULT_RECONNECT_RETRIES: u32 = 25;
const DEFAULT_RECONNECT_FACTOR: f64 = 2.0;
const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PING: Duration = Duration::from_secs(25);
const DEFAULT_PONG: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Strategy
// ============================================================================

/// Set of conditions that trigger automatic reconnection.
///
/// Parsed from a comma separated list of `disconnect`, `online` and
/// `timeout`; `none` yields the empty set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Strategy(u8);

impl Strategy {
    /// Never reconnect.
    pub const NONE: Self = Self(0);
    /// Reconnect when an open transport closes.
    pub const DISCONNECT: Self = Self(1);
    /// Reconnect when the network comes back online.
    pub const ONLINE: Self = Self(1 << 1);
    /// Reconnect when the initial connect times out.
    pub const TIMEOUT: Self = Self(1 << 2);
    /// Every condition.
    pub const ALL: Self = Self(Self::DISCONNECT.0 | Self::ONLINE.0 | Self::TIMEOUT.0);

    const NAMES: [(Self, &'static str); 3] = [
        (Self::DISCONNECT, "disconnect"),
        (Self::ONLINE, "online"),
        (Self::TIMEOUT, "timeout"),
    ];

    /// Returns `true` if every condition in `other` is enabled.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no condition is enabled.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns a copy without the given conditions.
    #[inline]
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for Strategy {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut strategy = Self::NONE;

        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let name = name.to_ascii_lowercase();
            if name == "none" || name == "false" {
                return Ok(Self::NONE);
            }

            let (flag, _) = Self::NAMES
                .iter()
                .find(|(_, known)| *known == name)
                .ok_or_else(|| Error::config(format!("Unknown reconnect strategy: {name}")))?;
            strategy = strategy | *flag;
        }

        Ok(strategy)
    }
}

impl TryFrom<String> for Strategy {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Strategy> for String {
    fn from(strategy: Strategy) -> Self {
        strategy.to_string()
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }

        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(","))
    }
}

// ============================================================================
// ReconnectOptions
// ============================================================================

/// Backoff policy for automatic reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectOptions {
    /// Delay before the first attempt.
    #[serde(with = "millis")]
    pub min: Duration,

    /// Upper bound for any delay; `None` is unbounded.
    #[serde(with = "optional_millis")]
    pub max: Option<Duration>,

    /// Attempts allowed before giving up.
    pub retries: u32,

    /// Exponential growth factor.
    pub factor: f64,

    /// Time a single attempt may take; `None` waits for the transport.
    #[serde(with = "optional_millis")]
    pub timeout: Option<Duration>,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            min: DEFAULT_RECONNECT_MIN,
            max: None,
            retries: DEFAULT_RECONNECT_RETRIES,
            factor: DEFAULT_RECONNECT_FACTOR,
            timeout: Some(DEFAULT_RECONNECT_TIMEOUT),
        }
    }
}

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Behaviour of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Backoff policy.
    pub reconnect: ReconnectOptions,

    /// Heartbeat interval; `None` disables the heartbeat.
    #[serde(with = "optional_millis")]
    pub ping: Option<Duration>,

    /// Time allowed for a pong after each ping.
    #[serde(with = "millis")]
    pub pong: Duration,

    /// Initial connect timeout; `None` waits forever.
    #[serde(with = "optional_millis")]
    pub timeout: Option<Duration>,

    /// Maximum buffered outgoing messages; `None` is unbounded.
    pub queue_size: Option<usize>,

    /// Conditions that trigger reconnection.
    pub strategy: Strategy,

    /// When `true` the connection waits for an explicit `open()`.
    pub manual: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectOptions::default(),
            ping: Some(DEFAULT_PING),
            pong: DEFAULT_PONG,
            timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            queue_size: None,
            strategy: Strategy::default(),
            manual: false,
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads options from JSON. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if a value is out of range
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks that the options describe a usable policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !self.reconnect.factor.is_finite() || self.reconnect.factor < 1.0 {
            return Err(Error::config(format!(
                "reconnect.factor must be at least 1, got {}",
                self.reconnect.factor
            )));
        }

        if let Some(max) = self.reconnect.max
            && max < self.reconnect.min
        {
            return Err(Error::config(format!(
                "reconnect.max ({}ms) is below reconnect.min ({}ms)",
                max.as_millis(),
                self.reconnect.min.as_millis()
            )));
        }

        for (name, value) in [
            ("ping", self.ping),
            ("timeout", self.timeout),
            ("reconnect.timeout", self.reconnect.timeout),
        ] {
            if value.is_some_and(|d| d.is_zero()) {
                return Err(Error::config(format!(
                    "{name} must be positive, leave it unset to disable"
                )));
            }
        }

        if self.ping.is_some() && self.pong.is_zero() {
            return Err(Error::config("pong timeout must be positive when ping is enabled"));
        }

        if self.queue_size == Some(0) {
            return Err(Error::config("queueSize must be positive"));
        }

        Ok(())
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectionOptions {
    /// Sets the full reconnect policy.
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the minimum reconnect delay.
    #[inline]
    #[must_use]
    pub fn with_reconnect_min(mut self, min: Duration) -> Self {
        self.reconnect.min = min;
        self
    }

    /// Caps every reconnect delay.
    #[inline]
    #[must_use]
    pub fn with_reconnect_max(mut self, max: Duration) -> Self {
        self.reconnect.max = Some(max);
        self
    }

    /// Sets how many reconnect attempts are allowed.
    #[inline]
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.reconnect.retries = retries;
        self
    }

    /// Sets the backoff growth factor.
    #[inline]
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.reconnect.factor = factor;
        self
    }

    /// Sets the heartbeat interval. A zero interval disables the heartbeat.
    #[inline]
    #[must_use]
    pub fn with_ping(mut self, interval: Duration) -> Self {
        self.ping = Some(interval).filter(|d| !d.is_zero());
        self
    }

    /// Disables the heartbeat.
    #[inline]
    #[must_use]
    pub fn without_ping(mut self) -> Self {
        self.ping = None;
        self
    }

    /// Sets the pong timeout.
    #[inline]
    #[must_use]
    pub fn with_pong(mut self, timeout: Duration) -> Self {
        self.pong = timeout;
        self
    }

    /// Sets the initial connect timeout. A zero timeout waits forever.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout).filter(|d| !d.is_zero());
        self
    }

    /// Disables the initial connect timeout.
    #[inline]
    #[must_use]
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Bounds the outgoing buffer.
    #[inline]
    #[must_use]
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    /// Sets the reconnect strategy.
    #[inline]
    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Requires an explicit `open()` call.
    #[inline]
    #[must_use]
    pub fn with_manual(mut self) -> Self {
        self.manual = true;
        self
    }
}

// ============================================================================
// Serde Helpers
// ============================================================================

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `0` and `null` both mean "disabled".
mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}

// ============================================================================
// Tests
// ============================================================================
