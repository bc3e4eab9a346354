//! Named timers.
//!
//! The state machine keeps at most one deadline per [`TimerKind`]. Setting a
//! timer replaces its previous deadline and clearing is idempotent, so every
//! exit path can simply clear what it no longer wants.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

// ============================================================================
// Constants
// ============================================================================

/// Stand-in for delays too large to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// ============================================================================
// TimerKind
// ============================================================================

/// The timers a connection can have pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    /// Initial connect timeout.
    Connect,
    /// Next heartbeat probe.
    Ping,
    /// Deadline for the pong answering the last probe.
    Pong,
    /// Backoff delay before the next reconnect attempt.
    Reconnect,
    /// Deadline for the reconnect attempt in flight.
    Attempt,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Reconnect => "reconnect",
            Self::Attempt => "attempt",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Timers
// ============================================================================

/// Deadlines keyed by name.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    deadlines: FxHashMap<TimerKind, Instant>,
}

impl Timers {
    /// Arms `kind` to fire after `delay`, replacing any previous deadline.
    pub(crate) fn set(&mut self, kind: TimerKind, delay: Duration) {
        trace!(timer = %kind, delay_ms = delay.as_millis() as u64, "Timer set");
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        self.deadlines.insert(kind, deadline);
    }

    /// Disarms `kind`. Returns `true` if it was pending.
    pub(crate) fn clear(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    /// Disarms everything.
    pub(crate) fn clear_all(&mut self) {
        if !self.deadlines.is_empty() {
            trace!(count = self.deadlines.len(), "Timers cleared");
        }
        self.deadlines.clear();
    }

    pub(crate) fn is_active(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest pending deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes and returns the earliest timer whose deadline has passed.
    ///
    /// Ties are broken by [`TimerKind`] declaration order so behaviour does
    /// not depend on map iteration order.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerKind> {
        let kind = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .min_by_key(|(kind, deadline)| (**deadline, rank(**kind)))
            .map(|(kind, _)| *kind)?;

        self.deadlines.remove(&kind);
        Some(kind)
    }
}

fn rank(kind: TimerKind) -> u8 {
    match kind {
        TimerKind::Connect => 0,
        TimerKind::Ping => 1,
        TimerKind::Pong => 2,
        TimerKind::Reconnect => 3,
        TimerKind::Attempt => 4,
    }
}

// ============================================================================
// Tests
// ============================================================================
