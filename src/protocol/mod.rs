//! Wire-level protocol pieces.
//!
//! | Piece | Purpose |
//! |-------|---------|
//! | [`Codec`] | Turns values into text frames and back |
//! | [`ControlMessage`] | In-band heartbeat, id and close signals |
//!
//! Incoming frames are decoded first, then checked for a control message;
//! only non-control payloads reach the transform pipeline.

// ============================================================================
// Submodules
// ============================================================================

/// Codec contract and the JSON codec.
pub mod codec;

/// Control message framing.
pub mod control;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{Codec, JsonCodec};
pub use control::{ControlMessage, SENTINEL, now_millis};
