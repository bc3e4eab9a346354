//! Payload codecs.
//!
//! A codec turns application values into the text frames handed to the
//! transport and back. Both directions may suspend, so the trait is async.
//!
//! # Example
//!
//! ```ignore
//! use sparkwire::protocol::{Codec, JsonCodec};
//!
//! let raw = JsonCodec.encode(&serde_json::json!([1, 2])).await?;
//! assert_eq!(raw, "[1,2]");
//! ```

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// Codec
// ============================================================================

/// Encoder/decoder pair used by both sides of a connection.
///
/// Failures are never fatal: the affected message is dropped and the error
/// is surfaced as an `Error` event.
#[async_trait]
pub trait Codec: Send + Sync + 'static {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// Encodes an outgoing payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if the value cannot be represented.
    async fn encode(&self, data: &Value) -> Result<String>;

    /// Decodes an incoming frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the frame is malformed.
    async fn decode(&self, raw: &str) -> Result<Value>;
}

// ============================================================================
// JsonCodec
// ============================================================================

/// JSON text codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[async_trait]
impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn encode(&self, data: &Value) -> Result<String> {
        serde_json::to_string(data).map_err(|e| Error::encode(e.to_string()))
    }

    async fn decode(&self, raw: &str) -> Result<Value> {
        serde_json::from_str(raw).map_err(|e| Error::decode(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================
