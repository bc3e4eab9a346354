//! Accepting-side connection handle.
//!
//! A [`Spark`] is created by [`Server::accept`](super::Server::accept) for
//! every inbound transport. Like a client connection it runs on its own
//! task, but it has no reconnect logic: once its transport closes, or local
//! code calls [`end`](Spark::end), it leaves the registry for good.
//!
//! # Lifecycle
//!
//! 1. Registered under its id as soon as it is accepted
//! 2. `Connection` announced on the server after the next scheduling tick
//! 3. Messages flow through the server's shared pipeline
//! 4. `End` on the spark, `Disconnection` on the server, listeners detached

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesOrdered;
use futures_util::{FutureExt, StreamExt};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::events::{BusEvent, EventBus};
use crate::identifiers::{ListenerId, SparkId};
use crate::pipeline::{Direction, Packet, TransformPipeline};
use crate::protocol::{Codec, ControlMessage};
use crate::transport::{Directive, Signal, TransportLink};

use super::{ServerEvent, ServerInner};

// ============================================================================
// SparkInfo
// ============================================================================

/// What is known about an inbound connection when it is accepted.
#[derive(Debug, Clone)]
pub struct SparkInfo {
    /// Remote address.
    pub address: SocketAddr,
    /// Handshake headers, names lowercased.
    pub headers: FxHashMap<String, String>,
    /// Query parameters of the handshake URL.
    pub query: FxHashMap<String, String>,
    /// Externally supplied id; generated when `None`.
    pub id: Option<SparkId>,
}

impl SparkInfo {
    /// Creates info for a connection from `address` with no headers or query.
    #[inline]
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            headers: FxHashMap::default(),
            query: FxHashMap::default(),
            id: None,
        }
    }

    /// Adds a header. The name is lowercased.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Adds a query parameter.
    #[inline]
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Supplies the id instead of generating one.
    #[inline]
    #[must_use]
    pub fn with_id(mut self, id: impl Into<SparkId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

// ============================================================================
// SparkEvent
// ============================================================================

/// Something that happened on a spark.
#[derive(Debug, Clone)]
pub enum SparkEvent {
    /// A message arrived and passed the incoming pipeline.
    Data {
        /// Payload after incoming transforms.
        data: Value,
        /// Frame as received.
        raw: String,
    },
    /// A non-fatal failure.
    Error(Arc<Error>),
    /// The client sent a heartbeat probe; a pong was queued.
    Heartbeat {
        /// Timestamp carried by the probe.
        timestamp: u64,
    },
    /// The spark is finished. Listeners are detached right after.
    End,
}

/// Topic of a [`SparkEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SparkEventKind {
    /// [`SparkEvent::Data`]
    Data,
    /// [`SparkEvent::Error`]
    Error,
    /// [`SparkEvent::Heartbeat`]
    Heartbeat,
    /// [`SparkEvent::End`]
    End,
}

impl BusEvent for SparkEvent {
    type Kind = SparkEventKind;

    fn kind(&self) -> SparkEventKind {
        match self {
            Self::Data { .. } => SparkEventKind::Data,
            Self::Error(_) => SparkEventKind::Error,
            Self::Heartbeat { .. } => SparkEventKind::Heartbeat,
            Self::End => SparkEventKind::End,
        }
    }
}

// ============================================================================
// Spark
// ============================================================================

#[derive(Debug)]
enum SparkCommand {
    Write(Value),
    End(Option<Value>),
}

/// Handle to one accepted connection.
///
/// Cloning is cheap. The registry holds one clone until the spark ends.
#[derive(Clone)]
pub struct Spark {
    id: SparkId,
    info: Arc<SparkInfo>,
    commands: mpsc::UnboundedSender<SparkCommand>,
    bus: Arc<EventBus<SparkEvent>>,
    writable: Arc<AtomicBool>,
}

impl fmt::Debug for Spark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spark")
            .field("id", &self.id)
            .field("address", &self.info.address)
            .finish_non_exhaustive()
    }
}

impl Spark {
    /// Unique id within the owning server.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &SparkId {
        &self.id
    }

    /// Remote address.
    #[inline]
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.info.address
    }

    /// Handshake headers, names lowercased.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &FxHashMap<String, String> {
        &self.info.headers
    }

    /// Handshake query parameters.
    #[inline]
    #[must_use]
    pub fn query(&self) -> &FxHashMap<String, String> {
        &self.info.query
    }

    /// `false` once the spark is ending.
    #[inline]
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// The spark's event bus.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventBus<SparkEvent> {
        &self.bus
    }

    /// Registers a listener for one kind of event.
    pub fn on<F>(&self, kind: SparkEventKind, listener: F) -> ListenerId
    where
        F: Fn(&SparkEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, listener)
    }

    /// Streams every event through a channel.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SparkEvent> {
        self.bus.subscribe()
    }

    /// Queues a message. Returns `Ok(false)` once the spark is ending.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if `data` cannot be represented as JSON.
    pub fn write<T: Serialize + ?Sized>(&self, data: &T) -> Result<bool> {
        if !self.is_writable() {
            return Ok(false);
        }
        let value = serde_json::to_value(data)?;
        Ok(self.commands.send(SparkCommand::Write(value)).is_ok())
    }

    /// Closes the spark and tells the client not to reconnect. Idempotent.
    pub fn end(&self) {
        let _ = self.commands.send(SparkCommand::End(None));
    }

    /// Writes a final message, then closes.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if `data` cannot be represented as JSON.
    pub fn end_with<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        let value = serde_json::to_value(data)?;
        let _ = self.commands.send(SparkCommand::End(Some(value)));
        Ok(())
    }
}

// ============================================================================
// Spawning
// ============================================================================

/// Creates the handle and the task that drives it. The caller registers the
/// handle and spawns the task.
pub(super) fn create(
    id: SparkId,
    info: SparkInfo,
    link: TransportLink,
    server: &Arc<ServerInner>,
) -> (Spark, BoxFuture<'static, ()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let bus = Arc::new(EventBus::new());
    let writable = Arc::new(AtomicBool::new(true));

    let spark = Spark {
        id: id.clone(),
        info: Arc::new(info),
        commands: commands_tx,
        bus: Arc::clone(&bus),
        writable: Arc::clone(&writable),
    };

    let task = SparkTask {
        id,
        codec: Arc::clone(&server.codec),
        pipeline: Arc::clone(&server.pipeline),
        server: Arc::downgrade(server),
        bus,
        writable,
        link,
        commands: commands_rx,
        outgoing: FuturesOrdered::new(),
        incoming: FuturesOrdered::new(),
        ending: false,
        finished: false,
    };

    (spark, task.run().boxed())
}

// ============================================================================
// SparkTask
// ============================================================================

enum Outbound {
    Frame(String),
    Suppressed,
    Failed(Error),
}

enum Inbound {
    Control(ControlMessage),
    Data { data: Value, raw: String },
    Suppressed,
    Failed(Error),
}

struct SparkTask {
    id: SparkId,
    codec: Arc<dyn Codec>,
    pipeline: Arc<TransformPipeline>,
    server: Weak<ServerInner>,
    bus: Arc<EventBus<SparkEvent>>,
    writable: Arc<AtomicBool>,
    link: TransportLink,
    commands: mpsc::UnboundedReceiver<SparkCommand>,
    outgoing: FuturesOrdered<BoxFuture<'static, Outbound>>,
    incoming: FuturesOrdered<BoxFuture<'static, Inbound>>,
    ending: bool,
    finished: bool,
}

impl SparkTask {
    async fn run(mut self) {
        // Listeners attached right after accept() must see the announcement.
        tokio::task::yield_now().await;
        self.announce();

        while !self.finished {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SparkCommand::Write(data)) => self.write(data),
                    Some(SparkCommand::End(data)) => self.end(data),
                    None => self.teardown(),
                },

                signal = self.link.signals.recv() => match signal {
                    Some(Signal::Message(raw)) => self.receive(raw),
                    Some(Signal::Errored(error)) => self.safe_error(error),
                    Some(Signal::Connected) => trace!(id = %self.id, "Transport ready"),
                    Some(Signal::Disconnected) | None => {
                        debug!(id = %self.id, "Transport closed");
                        self.teardown();
                    }
                },

                Some(outbound) = self.outgoing.next(), if !self.outgoing.is_empty() => {
                    match outbound {
                        Outbound::Frame(frame) => {
                            let _ = self.link.direct(Directive::Send(frame));
                        }
                        Outbound::Suppressed => {}
                        Outbound::Failed(error) => self.safe_error(error),
                    }
                    if self.ending && self.outgoing.is_empty() {
                        self.teardown();
                    }
                }

                Some(inbound) = self.incoming.next(), if !self.incoming.is_empty() => {
                    self.handle_inbound(inbound);
                }
            }
        }
    }

    fn announce(&self) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let spark = server.sparks.read().get(&self.id).cloned();
        if let Some(spark) = spark {
            debug!(id = %self.id, address = %spark.address(), "Spark connected");
            server.bus.emit(&ServerEvent::Connection(spark));
        }
    }

    fn write(&mut self, data: Value) {
        if self.ending {
            return;
        }

        let run = self.pipeline.run(Direction::Outgoing, Packet::outgoing(data));
        let codec = Arc::clone(&self.codec);
        self.outgoing.push_back(
            async move {
                match run.await {
                    Ok(Some(packet)) => match codec.encode(&packet.data).await {
                        Ok(raw) => Outbound::Frame(raw),
                        Err(e) => Outbound::Failed(e),
                    },
                    Ok(None) => Outbound::Suppressed,
                    Err(e) => Outbound::Failed(e),
                }
            }
            .boxed(),
        );
    }

    fn write_control(&mut self, message: ControlMessage) {
        let codec = Arc::clone(&self.codec);
        let value = message.to_value();
        self.outgoing.push_back(
            async move {
                match codec.encode(&value).await {
                    Ok(raw) => Outbound::Frame(raw),
                    Err(e) => Outbound::Failed(e),
                }
            }
            .boxed(),
        );
    }

    fn end(&mut self, data: Option<Value>) {
        if self.ending {
            return;
        }
        if let Some(data) = data {
            self.write(data);
        }
        self.write_control(ControlMessage::ServerClose);
        self.ending = true;
        self.writable.store(false, Ordering::Release);
        debug!(id = %self.id, "Spark ending");
    }

    fn receive(&mut self, raw: String) {
        let codec = Arc::clone(&self.codec);
        let pipeline = Arc::clone(&self.pipeline);

        self.incoming.push_back(
            async move {
                let data = match codec.decode(&raw).await {
                    Ok(data) => data,
                    Err(e) => return Inbound::Failed(e),
                };

                if let Some(control) = ControlMessage::parse(&data)
                    && control.is_server_bound()
                {
                    return Inbound::Control(control);
                }

                let original = raw.clone();
                match pipeline.run(Direction::Incoming, Packet::incoming(data, raw)).await {
                    Ok(Some(packet)) => Inbound::Data {
                        data: packet.data,
                        raw: original,
                    },
                    Ok(None) => Inbound::Suppressed,
                    Err(e) => Inbound::Failed(e),
                }
            }
            .boxed(),
        );
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Control(ControlMessage::Ping(timestamp)) => {
                self.bus.emit(&SparkEvent::Heartbeat { timestamp });
                if !self.ending {
                    self.write_control(ControlMessage::Pong(timestamp));
                }
            }
            Inbound::Control(ControlMessage::IdRequest) => {
                if !self.ending {
                    self.write_control(ControlMessage::Id(self.id.to_string()));
                }
            }
            Inbound::Control(other) => trace!(?other, "Control message ignored"),
            Inbound::Data { data, raw } => {
                if !self.ending {
                    self.bus.emit(&SparkEvent::Data { data, raw });
                }
            }
            Inbound::Suppressed => {}
            Inbound::Failed(error) => self.safe_error(error),
        }
    }

    fn teardown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.ending = true;
        self.writable.store(false, Ordering::Release);
        let _ = self.link.direct(Directive::Disconnect);

        self.bus.emit(&SparkEvent::End);

        if let Some(server) = self.server.upgrade() {
            server.sparks.write().remove(&self.id);
            debug!(id = %self.id, remaining = server.sparks.read().len(), "Spark disconnected");
            server.bus.emit(&ServerEvent::Disconnection(self.id.clone()));
        }

        self.bus.clear();
    }

    fn safe_error(&self, error: Error) {
        if self.bus.has_listeners(SparkEventKind::Error) {
            self.bus.emit(&SparkEvent::Error(Arc::new(error)));
        } else {
            warn!(id = %self.id, error = %error, "Unhandled spark error");
        }
    }
}
