//! Type-safe identifiers.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//!
//! | Type | Identifies |
//! |------|------------|
//! | [`SparkId`] | An accepted connection within one [`Server`](crate::Server) |
//! | [`ListenerId`] | A listener registered on an event bus |

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Borrow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ============================================================================
// SparkId
// ============================================================================

/// Identifier of a [`Spark`](crate::Spark).
///
/// Unique among the sparks of one server for as long as the server lives.
/// Generated ids have the form `<address>-<counter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SparkId(Arc<str>);

impl SparkId {
    /// Wraps an externally supplied id.
    #[inline]
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Builds a generated id from the remote address and a registry counter.
    #[inline]
    #[must_use]
    pub fn generate(address: SocketAddr, counter: u64) -> Self {
        Self::new(format!("{address}-{counter}"))
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SparkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SparkId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SparkId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SparkId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

// ============================================================================
// ListenerId
// ============================================================================

/// Handle returned when a listener is registered on an event bus.
///
/// Pass it back to `off` to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
