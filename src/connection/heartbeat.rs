//! Heartbeat monitor.
//!
//! While the connection is open a ping control message goes out every
//! `ping` interval, and the matching pong must come back within `pong`.
//! A missing pong is how a half-open transport is detected: the state
//! machine then treats the connection as closed by the remote.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tracing::trace;

use crate::protocol::{ControlMessage, now_millis};

use super::timers::{TimerKind, Timers};

// ============================================================================
// HeartbeatMonitor
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct HeartbeatMonitor {
    ping: Option<Duration>,
    pong: Duration,
}

impl HeartbeatMonitor {
    pub(crate) fn new(ping: Option<Duration>, pong: Duration) -> Self {
        Self { ping, pong }
    }

    /// Arms the first probe. Does nothing when the heartbeat is disabled.
    pub(crate) fn start(&self, timers: &mut Timers) {
        timers.clear(TimerKind::Pong);
        if let Some(interval) = self.ping {
            timers.set(TimerKind::Ping, interval);
        }
    }

    pub(crate) fn stop(&self, timers: &mut Timers) {
        timers.clear(TimerKind::Ping);
        timers.clear(TimerKind::Pong);
    }

    /// The ping timer fired: returns the probe to send.
    pub(crate) fn probe(&self) -> ControlMessage {
        let probe = ControlMessage::ping_now();
        trace!(?probe, "Heartbeat probe");
        probe
    }

    /// The probe reached the transport; the pong deadline starts now.
    pub(crate) fn sent(&self, timers: &mut Timers) {
        timers.set(TimerKind::Pong, self.pong);
    }

    /// A pong arrived. Returns the measured round trip when it answers the
    /// outstanding probe, and re-arms the next probe.
    pub(crate) fn answer(&self, timers: &mut Timers, timestamp: u64) -> Option<Duration> {
        if !timers.clear(TimerKind::Pong) {
            trace!(timestamp, "Pong without outstanding probe");
            return None;
        }

        if let Some(interval) = self.ping {
            timers.set(TimerKind::Ping, interval);
        }

        Some(Duration::from_millis(now_millis().saturating_sub(timestamp)))
    }
}

// ============================================================================
// Tests
// ============================================================================
