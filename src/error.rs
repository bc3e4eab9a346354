//! Error types for sparkwire.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use sparkwire::{Connection, Result};
//!
//! async fn example(connection: &Connection) -> Result<()> {
//!     connection.write(serde_json::json!({ "hello": "world" }))?;
//!     let id = connection.id().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::Url`] |
//! | Codec | [`Error::Encode`], [`Error::Decode`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectTimeout`], [`Error::ConnectionClosed`] |
//! | Recovery | [`Error::ReconnectExhausted`], [`Error::ReconnectTimeout`] |
//! | Usage | [`Error::Detached`], [`Error::DuplicateSpark`] |
//! | Pipeline | [`Error::TransformAbort`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |
//!
//! None of these are thrown out of the event path: errors raised while a
//! connection is running are delivered as [`Event::Error`](crate::Event::Error)
//! to registered listeners, or logged when nobody listens.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::SparkId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when connection or server options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Endpoint URL could not be parsed.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    // ========================================================================
    // Codec Errors
    // ========================================================================
    /// Codec failed to encode an outgoing payload.
    ///
    /// The message is dropped.
    #[error("Encode error: {message}")]
    Encode {
        /// Description of the encoder failure.
        message: String,
    },

    /// Codec failed to decode an incoming frame.
    ///
    /// The frame is dropped.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the decoder failure.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport reported a failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The transport did not open within the connect timeout.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Transport closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Recovery Errors
    // ========================================================================
    /// Every allowed reconnect attempt failed.
    #[error("Reconnect failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// A single reconnect attempt took longer than allowed.
    #[error("Reconnect attempt {attempt} timed out after {timeout_ms}ms")]
    ReconnectTimeout {
        /// The attempt that timed out.
        attempt: u32,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Usage Errors
    // ========================================================================
    /// Handle used after its connection was destroyed.
    #[error("{operation} called on a destroyed connection")]
    Detached {
        /// The public operation that was attempted.
        operation: &'static str,
    },

    /// A spark with the same id is already registered.
    #[error("Spark id already registered: {id}")]
    DuplicateSpark {
        /// The conflicting id.
        id: SparkId,
    },

    // ========================================================================
    // Pipeline Errors
    // ========================================================================
    /// An asynchronous transform aborted the message.
    #[error("Transform aborted: {message}")]
    TransformAbort {
        /// Reason given by the transform.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an encode error.
    #[inline]
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connect timeout error.
    #[inline]
    pub fn connect_timeout(timeout_ms: u64) -> Self {
        Self::ConnectTimeout { timeout_ms }
    }

    /// Creates a reconnect exhausted error.
    #[inline]
    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::ReconnectExhausted { attempts }
    }

    /// Creates a reconnect timeout error.
    #[inline]
    pub fn reconnect_timeout(attempt: u32, timeout_ms: u64) -> Self {
        Self::ReconnectTimeout {
            attempt,
            timeout_ms,
        }
    }

    /// Creates a detached handle error.
    #[inline]
    pub fn detached(operation: &'static str) -> Self {
        Self::Detached { operation }
    }

    /// Creates a duplicate spark error.
    #[inline]
    pub fn duplicate_spark(id: SparkId) -> Self {
        Self::DuplicateSpark { id }
    }

    /// Creates a transform abort error.
    ///
    /// Asynchronous transforms return this to abandon a message.
    #[inline]
    pub fn transform(message: impl Into<String>) -> Self {
        Self::TransformAbort {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::ReconnectTimeout { .. }
        )
    }

    /// Returns `true` if this is a codec error.
    #[inline]
    #[must_use]
    pub fn is_codec_error(&self) -> bool {
        matches!(self, Self::Encode { .. } | Self::Decode { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors leave the connection usable; the affected
    /// message or attempt is simply dropped.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Encode { .. }
                | Self::Decode { .. }
                | Self::TransformAbort { .. }
                | Self::ConnectTimeout { .. }
                | Self::ReconnectTimeout { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_detached_display() {
        let err = Error::detached("write");
        assert_eq!(err.to_string(), "write called on a destroyed connection");
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::connect_timeout(10_000).is_timeout());
        assert!(Error::reconnect_timeout(3, 30_000).is_timeout());
        assert!(!Error::connection("test").is_timeout());
    }

    #[test]
    fn test_is_codec_error() {
        assert!(Error::encode("cyclic").is_codec_error());
        assert!(Error::decode("garbage").is_codec_error());
        assert!(!Error::ConnectionClosed.is_codec_error());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::connect_timeout(1000).is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(!Error::config("test").is_connection_error());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::transform("rejected").is_recoverable());
        assert!(!Error::reconnect_exhausted(25).is_recoverable());
        assert!(!Error::detached("end").is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_url_error() {
        let err: Error = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, Error::Url(_)));
    }
}
