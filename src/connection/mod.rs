//! Client connection.
//!
//! A [`Connection`] is a cheap, cloneable handle to a state machine running
//! on its own tokio task. The task owns the transport link, the outgoing
//! buffer, every timer and the reconnect bookkeeping; handles only send it
//! commands and read a few atomics it publishes.
//!
//! # Example
//!
//! ```no_run
//! use sparkwire::{Connection, Event, EventKind, Result};
//!
//! # async fn example() -> Result<()> {
//! let connection = Connection::builder("ws://localhost:8080").connect()?;
//!
//! connection.on(EventKind::Data, |event| {
//!     if let Event::Data { data, .. } = event {
//!         println!("received {data}");
//!     }
//! });
//!
//! connection.write(&serde_json::json!({ "hello": "world" }))?;
//! println!("assigned id: {}", connection.id().await?);
//! connection.end();
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

mod buffer;
mod builder;
mod event;
mod heartbeat;
mod machine;
mod options;
mod recovery;
mod timers;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ConnectionBuilder;
pub use event::{Event, EventKind};
pub use options::{ConnectionOptions, ReconnectOptions, Strategy};

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::identifiers::ListenerId;
use crate::pipeline::{Direction, Transform, TransformPipeline};

use machine::Command;

// ============================================================================
// ReadyState
// ============================================================================

/// Lifecycle position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// No transport; possibly waiting to reconnect.
    Closed,
    /// Transport requested, not yet open.
    Opening,
    /// Transport open, frames flow.
    Open,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Opening,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Opening => 1,
            Self::Open => 2,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Opening => f.write_str("opening"),
            Self::Open => f.write_str("open"),
        }
    }
}

// ============================================================================
// Shared
// ============================================================================

/// State published by the machine for lock-free reads from handles.
#[derive(Debug)]
pub(crate) struct Shared {
    ready_state: AtomicU8,
    writable: AtomicBool,
    online: AtomicBool,
    latency_ms: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            ready_state: AtomicU8::new(ReadyState::Closed.as_u8()),
            writable: AtomicBool::new(true),
            online: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_ready_state(&self, state: ReadyState) {
        self.ready_state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Release);
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to a resilient client connection.
///
/// Cloning is cheap; every clone drives the same connection. The
/// connection task stops after [`destroy`](Self::destroy) or once the last
/// handle is dropped.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    bus: Arc<EventBus<Event>>,
    shared: Arc<Shared>,
    pipeline: Arc<TransformPipeline>,
    url: Arc<Url>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url.as_str())
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Starts configuring a connection to `url`.
    #[inline]
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(url)
    }

    pub(crate) fn from_parts(
        commands: mpsc::UnboundedSender<Command>,
        bus: Arc<EventBus<Event>>,
        shared: Arc<Shared>,
        pipeline: Arc<TransformPipeline>,
        url: Url,
    ) -> Self {
        Self {
            commands,
            bus,
            shared,
            pipeline,
            url: Arc::new(url),
        }
    }
}

// ============================================================================
// Connection - Events
// ============================================================================

impl Connection {
    /// The event bus of this connection.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventBus<Event> {
        &self.bus
    }

    /// Registers a listener for one kind of event.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.on(kind, listener)
    }

    /// Streams every event through a channel.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.bus.subscribe()
    }

    /// Registers a transform. Applies to messages processed after this call.
    pub fn transform(&self, direction: Direction, transform: Transform) {
        self.pipeline.push(direction, transform);
    }
}

// ============================================================================
// Connection - Operations
// ============================================================================

impl Connection {
    /// Opens the connection. Does nothing unless it is closed.
    ///
    /// # Errors
    ///
    /// [`Error::Detached`] if the connection was destroyed.
    pub fn open(&self) -> Result<()> {
        self.send(Command::Open, "open")
    }

    /// Queues a message.
    ///
    /// Returns `Ok(false)` when the connection has ended; the message is
    /// dropped. Messages written while not open are buffered and flushed in
    /// order once the transport opens.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if `data` cannot be represented as JSON
    /// - [`Error::Detached`] if the connection was destroyed
    pub fn write<T: Serialize + ?Sized>(&self, data: &T) -> Result<bool> {
        if !self.shared.writable.load(Ordering::Acquire) {
            return Ok(false);
        }
        let value = serde_json::to_value(data)?;
        self.send(Command::Write(value), "write")?;
        Ok(true)
    }

    /// Closes the connection for good. Idempotent.
    pub fn end(&self) {
        let _ = self.send(Command::End(None), "end");
    }

    /// Writes a final message, then closes.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if `data` cannot be represented as JSON
    /// - [`Error::Detached`] if the connection was destroyed
    pub fn end_with<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        let value = serde_json::to_value(data)?;
        self.send(Command::End(Some(value)), "end")
    }

    /// Ends the connection, drops every listener and stops its task.
    pub fn destroy(&self) {
        if self.commands.send(Command::Destroy).is_err() {
            debug!(url = %self.url, "Destroy on a stopped connection");
        }
    }

    /// Asks the server for the id it assigned to this connection.
    ///
    /// The request is buffered like any other write while not open.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection ends first
    /// - [`Error::Detached`] if the connection was destroyed
    pub async fn id(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::RequestId(tx), "id")?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Reports a network connectivity change.
    ///
    /// Ignored unless the `online` strategy is enabled.
    ///
    /// # Errors
    ///
    /// [`Error::Detached`] if the connection was destroyed.
    pub fn set_network_online(&self, online: bool) -> Result<()> {
        self.send(Command::Network { online }, "set_network_online")
    }

    fn send(&self, command: Command, operation: &'static str) -> Result<()> {
        if self.commands.send(command).is_ok() {
            return Ok(());
        }

        if self.bus.has_listeners(EventKind::Error) {
            self.bus.emit(&Event::Error(Arc::new(Error::detached(operation))));
        } else {
            warn!(url = %self.url, operation, "Connection used after destroy");
        }
        Err(Error::detached(operation))
    }
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Current ready state.
    #[inline]
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.shared.ready_state.load(Ordering::Acquire))
    }

    /// `false` once the connection has ended.
    #[inline]
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.shared.writable.load(Ordering::Acquire)
    }

    /// Last known connectivity.
    #[inline]
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::Acquire)
    }

    /// Last measured latency: open time at first, then heartbeat round trips.
    #[inline]
    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.shared.latency_ms.load(Ordering::Acquire))
    }

    /// Endpoint URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

// ============================================================================
// Tests
// ============================================================================
