//! Transport layer.
//!
//! The core is transport-agnostic: connections and sparks talk to an
//! adapter over a [`TransportLink`]. This module defines that contract and
//! ships the WebSocket adapter used by default.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                                   ┌─────────────────┐
//! │   Connection    │        Directive / Signal         │  WebSocket      │
//! │   (client)      │◄─────────────────────────────────►│  adapter task   │◄──► socket
//! └─────────────────┘          TransportLink            └─────────────────┘
//!
//! ┌─────────────────┐                                   ┌─────────────────┐
//! │   Spark         │◄─────────────────────────────────►│  serve()        │◄──► accepted socket
//! └─────────────────┘                                   └─────────────────┘
//! ```
//!
//! Any other transport (long polling, an in-process channel in tests) only
//! needs to consume [`Directive`]s from an [`AdapterEnd`] and report
//! [`Signal`]s back.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `link` | Directive/Signal channel pair |
//! | `websocket` | `tokio-tungstenite` adapter |

// ============================================================================
// Submodules
// ============================================================================

/// Directive/Signal channel contract.
pub mod link;

/// WebSocket adapter.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use link::{AdapterEnd, Directive, Signal, TransportLink, link};
pub use websocket::{WebSocketTransport, serve};
