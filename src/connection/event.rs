//! Events published by a [`Connection`](crate::Connection).
//!
//! | Event | When |
//! |-------|------|
//! | `Open` | Transport opened, buffer flushed |
//! | `Data` | An incoming message passed the pipeline |
//! | `Error` | Codec, transform or transport failure (only if someone listens) |
//! | `Close` | An open connection closed |
//! | `End` | The connection is finished and will not reconnect by itself |
//! | `ReadyStateChange` | Ready state moved |
//! | `Timeout` | Initial connect timed out |
//! | `ReconnectScheduled` | Backoff timer armed |
//! | `Reconnect` | Attempt issued |
//! | `Reconnected` | Attempt succeeded |
//! | `ReconnectTimeout` | Attempt took too long |
//! | `ReconnectFailed` | Retries exhausted |
//! | `Online` / `Offline` | Network or heartbeat liveness changed |
//! | `Heartbeat` | Pong received |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::Error;
use crate::events::BusEvent;

use super::ReadyState;

// ============================================================================
// Event
// ============================================================================

/// Something that happened on a connection.
#[derive(Debug, Clone)]
pub enum Event {
    /// The transport opened.
    Open,
    /// A message arrived.
    Data {
        /// Payload after incoming transforms.
        data: Value,
        /// Frame as received from the transport.
        raw: String,
    },
    /// A non-fatal failure.
    Error(Arc<Error>),
    /// The open connection closed.
    Close,
    /// The connection is finished.
    End,
    /// Ready state changed.
    ReadyStateChange(ReadyState),
    /// Initial connect timed out.
    Timeout,
    /// A reconnect attempt is about to start.
    Reconnect {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A reconnect attempt was scheduled.
    ReconnectScheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// Reconnection succeeded.
    Reconnected {
        /// Attempts it took.
        attempts: u32,
    },
    /// A reconnect attempt took too long.
    ReconnectTimeout {
        /// The attempt that timed out.
        attempt: u32,
    },
    /// Retries exhausted; `End` follows.
    ReconnectFailed {
        /// Attempts made.
        attempts: u32,
    },
    /// Connectivity restored.
    Online,
    /// Connectivity lost.
    Offline,
    /// Heartbeat answered.
    Heartbeat {
        /// Measured round trip.
        latency: Duration,
    },
}

/// Topic of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::Open`]
    Open,
    /// [`Event::Data`]
    Data,
    /// [`Event::Error`]
    Error,
    /// [`Event::Close`]
    Close,
    /// [`Event::End`]
    End,
    /// [`Event::ReadyStateChange`]
    ReadyStateChange,
    /// [`Event::Timeout`]
    Timeout,
    /// [`Event::Reconnect`]
    Reconnect,
    /// [`Event::ReconnectScheduled`]
    ReconnectScheduled,
    /// [`Event::Reconnected`]
    Reconnected,
    /// [`Event::ReconnectTimeout`]
    ReconnectTimeout,
    /// [`Event::ReconnectFailed`]
    ReconnectFailed,
    /// [`Event::Online`]
    Online,
    /// [`Event::Offline`]
    Offline,
    /// [`Event::Heartbeat`]
    Heartbeat,
}

impl BusEvent for Event {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Data { .. } => EventKind::Data,
            Self::Error(_) => EventKind::Error,
            Self::Close => EventKind::Close,
            Self::End => EventKind::End,
            Self::ReadyStateChange(_) => EventKind::ReadyStateChange,
            Self::Timeout => EventKind::Timeout,
            Self::Reconnect { .. } => EventKind::Reconnect,
            Self::ReconnectScheduled { .. } => EventKind::ReconnectScheduled,
            Self::Reconnected { .. } => EventKind::Reconnected,
            Self::ReconnectTimeout { .. } => EventKind::ReconnectTimeout,
            Self::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            Self::Online => EventKind::Online,
            Self::Offline => EventKind::Offline,
            Self::Heartbeat { .. } => EventKind::Heartbeat,
        }
    }
}
