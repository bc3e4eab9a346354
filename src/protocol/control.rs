//! In-band control messages.
//!
//! Control messages share the application data stream. They are plain
//! strings of the form `<sentinel>::<subtype>::<value>` and travel through
//! the codec like any other payload, but never through the transform
//! pipeline.
//!
//! # Subtypes
//!
//! | Wire form | Direction | Meaning |
//! |-----------|-----------|---------|
//! | `sparkwire::ping::<ms>` | client → server | Heartbeat probe |
//! | `sparkwire::pong::<ms>` | server → client | Heartbeat answer, echoes the probe timestamp |
//! | `sparkwire::id::` | client → server | Request for the assigned connection id |
//! | `sparkwire::id::<id>` | server → client | Assigned connection id |
//! | `sparkwire::server::close` | server → client | Graceful close, do not reconnect |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

// ============================================================================
// Constants
// ============================================================================

/// Reserved token every control message starts with.
pub const SENTINEL: &str = "sparkwire";

/// Separator between sentinel, subtype and value.
const SEPARATOR: &str = "::";

// ============================================================================
// ControlMessage
// ============================================================================

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Heartbeat probe carrying the sender's epoch milliseconds.
    Ping(u64),
    /// Heartbeat answer echoing the probe timestamp.
    Pong(u64),
    /// Request for the connection id.
    IdRequest,
    /// Connection id assigned by the accepting side.
    Id(String),
    /// The accepting side is closing on purpose.
    ServerClose,
}

impl ControlMessage {
    /// Recognizes a control message in a decoded payload.
    ///
    /// Returns `None` for anything that is not a string carrying the
    /// sentinel, and for sentinel strings with an unknown subtype or a
    /// malformed value; such payloads are ordinary application data.
    #[must_use]
    pub fn parse(data: &Value) -> Option<Self> {
        let text = data.as_str()?;
        let rest = text.strip_prefix(SENTINEL)?.strip_prefix(SEPARATOR)?;
        let (subtype, value) = rest.split_once(SEPARATOR)?;

        match subtype {
            "ping" => value.parse().ok().map(Self::Ping),
            "pong" => value.parse().ok().map(Self::Pong),
            "id" if value.is_empty() => Some(Self::IdRequest),
            "id" => Some(Self::Id(value.to_owned())),
            "server" if value == "close" => Some(Self::ServerClose),
            _ => None,
        }
    }

    /// `true` for messages the accepting side sends to a client.
    #[inline]
    #[must_use]
    pub fn is_client_bound(&self) -> bool {
        matches!(self, Self::Pong(_) | Self::Id(_) | Self::ServerClose)
    }

    /// `true` for messages a client sends to the accepting side.
    #[inline]
    #[must_use]
    pub fn is_server_bound(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::IdRequest)
    }

    /// Creates a ping stamped with the current time.
    #[inline]
    #[must_use]
    pub fn ping_now() -> Self {
        Self::Ping(now_millis())
    }

    /// Returns the wire form as a JSON string value, ready for the codec.
    #[inline]
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::String(self.to_string())
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping(ts) => write!(f, "{SENTINEL}{SEPARATOR}ping{SEPARATOR}{ts}"),
            Self::Pong(ts) => write!(f, "{SENTINEL}{SEPARATOR}pong{SEPARATOR}{ts}"),
            Self::IdRequest => write!(f, "{SENTINEL}{SEPARATOR}id{SEPARATOR}"),
            Self::Id(id) => write!(f, "{SENTINEL}{SEPARATOR}id{SEPARATOR}{id}"),
            Self::ServerClose => write!(f, "{SENTINEL}{SEPARATOR}server{SEPARATOR}close"),
        }
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Milliseconds since the Unix epoch.
///
/// Heartbeat timestamps cross the wire, so they use wall-clock time rather
/// than a monotonic instant.
#[inline]
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_pong_round_trip() {
        let message = ControlMessage::Pong(1_700_000_000_123);
        assert_eq!(message.to_string(), "sparkwire::pong::1700000000123");
        assert_eq!(ControlMessage::parse(&message.to_value()), Some(message));
    }

    #[test]
    fn test_parse_id() {
        let value = json!("sparkwire::id::127.0.0.1:4100-1");
        assert_eq!(
            ControlMessage::parse(&value),
            Some(ControlMessage::Id("127.0.0.1:4100-1".into()))
        );
    }

    #[test]
    fn test_parse_id_request() {
        assert_eq!(
            ControlMessage::parse(&json!("sparkwire::id::")),
            Some(ControlMessage::IdRequest)
        );
    }

    #[test]
    fn test_parse_server_close() {
        assert_eq!(
            ControlMessage::parse(&json!("sparkwire::server::close")),
            Some(ControlMessage::ServerClose)
        );
    }

    #[test]
    fn test_server_subtype_other_value_is_data() {
        assert_eq!(ControlMessage::parse(&json!("sparkwire::server::open")), None);
    }

    #[test]
    fn test_unknown_subtype_is_data() {
        assert_eq!(ControlMessage::parse(&json!("sparkwire::bogus::1")), None);
    }

    #[test]
    fn test_malformed_timestamp_is_data() {
        assert_eq!(ControlMessage::parse(&json!("sparkwire::pong::soon")), None);
    }

    #[test]
    fn test_unprefixed_and_non_string_are_data() {
        assert_eq!(ControlMessage::parse(&json!("hello::pong::1")), None);
        assert_eq!(ControlMessage::parse(&json!("sparkwire")), None);
        assert_eq!(ControlMessage::parse(&json!({ "pong": 1 })), None);
        assert_eq!(ControlMessage::parse(&json!(42)), None);
    }

    #[test]
    fn test_ping_now_is_recent() {
        let before = now_millis();
        let ControlMessage::Ping(ts) = ControlMessage::ping_now() else {
            panic!("expected ping");
        };
        assert!(ts >= before);
    }
}
