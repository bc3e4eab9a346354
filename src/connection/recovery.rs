//! Reconnect scheduling.
//!
//! The recovery controller owns the single in-progress [`ReconnectAttempt`]
//! and decides when the next attempt runs and when to give up. Timers and
//! events are driven by the state machine; this module only keeps the
//! bookkeeping and the backoff arithmetic.
//!
//! # Backoff
//!
//! | Attempt | Delay |
//! |---------|-------|
//! | 1 | `min` |
//! | n > 1 | `min(round(U[0,1) * min * factor^n), max)` |
//!
//! The random factor spreads clients out so a restarted server is not hit
//! by every client at the same instant.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tracing::debug;

use super::options::ReconnectOptions;

// ============================================================================
// ReconnectAttempt
// ============================================================================

/// State of the reconnect sequence in progress.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReconnectAttempt {
    /// 1-based attempt counter.
    pub(crate) attempt: u32,
    /// Delay computed for the current attempt.
    pub(crate) scheduled: Duration,
    /// `true` between issuing the reconnect and hearing back from the transport.
    pub(crate) in_flight: bool,
}

/// Outcome of [`Recovery::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Schedule {
    /// Wait `delay`, then run attempt number `attempt`.
    Scheduled { attempt: u32, delay: Duration },
    /// Retries are used up.
    Exhausted { attempts: u32 },
}

// ============================================================================
// Recovery
// ============================================================================

#[derive(Debug)]
pub(crate) struct Recovery {
    options: ReconnectOptions,
    attempt: Option<ReconnectAttempt>,
}

impl Recovery {
    pub(crate) fn new(options: ReconnectOptions) -> Self {
        Self {
            options,
            attempt: None,
        }
    }

    /// `true` while a reconnect sequence is in progress.
    #[inline]
    pub(crate) fn is_reconnecting(&self) -> bool {
        self.attempt.is_some()
    }

    /// `true` while an attempt is waiting on the transport.
    #[inline]
    pub(crate) fn in_flight(&self) -> bool {
        self.attempt.as_ref().is_some_and(|attempt| attempt.in_flight)
    }

    /// Current attempt number, if reconnecting.
    #[inline]
    pub(crate) fn attempt(&self) -> Option<u32> {
        self.attempt.as_ref().map(|attempt| attempt.attempt)
    }

    /// Delay the current attempt waited for.
    #[inline]
    pub(crate) fn scheduled(&self) -> Option<Duration> {
        self.attempt.as_ref().map(|attempt| attempt.scheduled)
    }

    /// Time allowed for a single attempt.
    #[inline]
    pub(crate) fn attempt_timeout(&self) -> Option<Duration> {
        self.options.timeout
    }

    /// Advances to the next attempt and computes its delay.
    ///
    /// On exhaustion the attempt state is cleared.
    pub(crate) fn schedule(&mut self) -> Schedule {
        let attempt = self.attempt.as_ref().map_or(1, |current| current.attempt + 1);

        if attempt > self.options.retries {
            let attempts = attempt - 1;
            debug!(attempts, "Reconnect retries exhausted");
            self.attempt = None;
            return Schedule::Exhausted { attempts };
        }

        let delay = backoff(&self.options, attempt, rand::random::<f64>());
        self.attempt = Some(ReconnectAttempt {
            attempt,
            scheduled: delay,
            in_flight: false,
        });

        debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        Schedule::Scheduled { attempt, delay }
    }

    /// Marks the scheduled attempt as issued. Returns its number.
    pub(crate) fn start(&mut self) -> Option<u32> {
        let attempt = self.attempt.as_mut()?;
        attempt.in_flight = true;
        Some(attempt.attempt)
    }

    /// Consumes an in-flight attempt as failed.
    ///
    /// Returns `false` when no attempt was in flight, which means the
    /// failure report is stale (for example the close that follows an error
    /// for the same failed handshake).
    pub(crate) fn fail(&mut self) -> bool {
        match self.attempt.as_mut() {
            Some(attempt) if attempt.in_flight => {
                attempt.in_flight = false;
                true
            }
            _ => false,
        }
    }

    /// Ends the sequence after a successful open.
    ///
    /// Returns the number of attempts it took.
    pub(crate) fn succeed(&mut self) -> Option<u32> {
        self.attempt.take().map(|attempt| attempt.attempt)
    }

    /// Drops any sequence in progress without reporting failure.
    pub(crate) fn reset(&mut self) {
        self.attempt = None;
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Delay before attempt number `attempt`, given a uniform sample `unit` in `[0, 1)`.
pub(crate) fn backoff(options: &ReconnectOptions, attempt: u32, unit: f64) -> Duration {
    if attempt <= 1 {
        return options.min;
    }

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = (unit * options.min.as_millis() as f64 * options.factor.powi(exponent)).round();
    // Float-to-int casts saturate, and NaN maps to zero.
    let delay = Duration::from_millis(raw as u64);

    match options.max {
        Some(max) => delay.min(max),
        None => delay,
    }
}

// ============================================================================
// Tests
// ============================================================================
