//! sparkwire - Resilient bidirectional messaging over pluggable transports.
//!
//! This library keeps a logical connection alive over an unreliable
//! real-time transport: it reconnects with randomized exponential backoff,
//! detects half-open sockets with an in-band heartbeat, buffers writes while
//! disconnected, and runs every message through user-supplied transforms.
//!
//! # Architecture
//!
//! The library has two sides:
//!
//! - **Initiating side**: a [`Connection`] dials an endpoint and keeps it alive
//! - **Accepting side**: a [`Server`] registers one [`Spark`] per inbound connection
//!
//! Key design principles:
//!
//! - Each connection and each spark owns a tokio task that holds all of its state
//! - Transports are adapters speaking [`Directive`]s and [`Signal`]s
//! - Control messages (`sparkwire::<subtype>::<value>`) share the data stream
//! - Transform terminal actions fire strictly in submission order
//!
//! # Quick Start
//!
//! ```no_run
//! use sparkwire::{Connection, Event, EventKind, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let connection = Connection::builder("ws://localhost:8080").connect()?;
//!
//!     connection.on(EventKind::Open, |_| println!("connected"));
//!     connection.on(EventKind::Data, |event| {
//!         if let Event::Data { data, .. } = event {
//!             println!("received {data}");
//!         }
//!     });
//!
//!     // Buffered until the transport opens
//!     connection.write(&serde_json::json!({ "hello": "world" }))?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`connection`] | Client state machine, options, events |
//! | [`server`] | Spark registry, sparks, WebSocket listener |
//! | [`pipeline`] | Incoming/outgoing transform sequences |
//! | [`events`] | Typed publish/subscribe bus |
//! | [`protocol`] | Codecs and control messages |
//! | [`transport`] | Adapter contract and WebSocket adapter |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//!
//! # Features
//!
//! - **Reconnection**: randomized exponential backoff, bounded retries, per-attempt timeout
//! - **Heartbeat**: ping/pong liveness with latency measurement
//! - **Buffering**: bounded FIFO of writes issued while disconnected
//! - **Transforms**: sync and async, able to rewrite, suppress or abort messages

// ============================================================================
// Modules
// ============================================================================

/// Client connection: state machine, options and events.
///
/// Use [`Connection::builder()`] to create a connection.
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Typed publish/subscribe event bus.
pub mod events;

/// Type-safe identifiers.
pub mod identifiers;

/// Transform pipeline shared by connections and sparks.
pub mod pipeline;

/// Codecs and in-band control messages.
pub mod protocol;

/// Accepting side: server registry and sparks.
pub mod server;

/// Transport adapter contract and the WebSocket adapter.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Connection types
pub use connection::{
    Connection, ConnectionBuilder, ConnectionOptions, Event, EventKind, ReadyState,
    ReconnectOptions, Strategy,
};

// Error types
pub use error::{Error, Result};

// Event bus
pub use events::{BusEvent, EventBus};

// Identifier types
pub use identifiers::{ListenerId, SparkId};

// Pipeline types
pub use pipeline::{Direction, Packet, Step, Transform, TransformPipeline};

// Protocol types
pub use protocol::{Codec, ControlMessage, JsonCodec};

// Server types
pub use server::{
    Plugin, Server, ServerBuilder, ServerEvent, ServerEventKind, Spark, SparkEvent,
    SparkEventKind, SparkInfo,
};

// Transport types
pub use transport::{AdapterEnd, Directive, Signal, TransportLink, WebSocketTransport};
