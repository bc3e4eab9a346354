//! Accepting side: the spark registry.
//!
//! A [`Server`] owns every live [`Spark`] by id, the transform pipeline all
//! of them share, and an event bus announcing arrivals and departures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                 Server                   │
//! │  pipeline (shared by every spark)        │
//! │  ┌────────────────────────────────────┐  │
//! │  │ "10.0.0.7:51234-1" → Spark         │  │
//! │  │ "10.0.0.9:40110-2" → Spark         │  │
//! │  └────────────────────────────────────┘  │
//! └──────────────────────────────────────────┘
//!          ▲ Weak                 │ owns
//!          └────── SparkTask ◄────┘
//! ```
//!
//! Sparks hold only a weak reference back to the registry.
//!
//! # Example
//!
//! ```no_run
//! use sparkwire::{Server, ServerEvent, ServerEventKind};
//!
//! # async fn example() -> sparkwire::Result<()> {
//! let server = Server::new();
//! server.on(ServerEventKind::Connection, |event| {
//!     if let ServerEvent::Connection(spark) = event {
//!         let _ = spark.write(&"welcome");
//!     }
//! });
//! let addr = server.listen("127.0.0.1:0").await?;
//! println!("listening on ws://{addr}");
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

mod listener;
mod spark;

// ============================================================================
// Re-exports
// ============================================================================

pub use spark::{Spark, SparkEvent, SparkEventKind, SparkInfo};

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{BusEvent, EventBus};
use crate::identifiers::{ListenerId, SparkId};
use crate::pipeline::{Direction, Transform, TransformPipeline};
use crate::protocol::{Codec, JsonCodec};
use crate::transport::TransportLink;

// ============================================================================
// ServerEvent
// ============================================================================

/// Something that happened on a server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A spark was accepted. Fired one scheduling tick after `accept`.
    Connection(Spark),
    /// A spark ended and left the registry.
    Disconnection(SparkId),
    /// A failure not tied to a single spark.
    Error(Arc<Error>),
}

/// Topic of a [`ServerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    /// [`ServerEvent::Connection`]
    Connection,
    /// [`ServerEvent::Disconnection`]
    Disconnection,
    /// [`ServerEvent::Error`]
    Error,
}

impl BusEvent for ServerEvent {
    type Kind = ServerEventKind;

    fn kind(&self) -> ServerEventKind {
        match self {
            Self::Connection(_) => ServerEventKind::Connection,
            Self::Disconnection(_) => ServerEventKind::Disconnection,
            Self::Error(_) => ServerEventKind::Error,
        }
    }
}

// ============================================================================
// Plugin
// ============================================================================

/// Extension installed on a server at build time.
///
/// Plugins are installed in registration order, each receiving the fully
/// constructed server. Typical plugins register transforms or listeners.
pub trait Plugin: Send + Sync + 'static {
    /// Unique name within a server.
    fn name(&self) -> &str;

    /// Installs the plugin.
    fn install(&self, server: &Server);
}

// ============================================================================
// ServerBuilder
// ============================================================================

/// Configures a [`Server`].
pub struct ServerBuilder {
    codec: Arc<dyn Codec>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            plugins: Vec::new(),
        }
    }
}

impl ServerBuilder {
    /// Replaces the codec used by every spark.
    #[inline]
    #[must_use]
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Appends a plugin.
    #[inline]
    #[must_use]
    pub fn plugin(mut self, plugin: impl Plugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Builds the server and installs its plugins in order.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if two plugins share a name.
    pub fn build(self) -> Result<Server> {
        let mut seen = FxHashSet::default();
        for plugin in &self.plugins {
            if !seen.insert(plugin.name().to_owned()) {
                return Err(Error::config(format!(
                    "plugin '{}' registered twice",
                    plugin.name()
                )));
            }
        }

        let server = Server::from_parts(self.codec, self.plugins);

        for plugin in &server.inner.plugins {
            debug!(plugin = plugin.name(), "Installing plugin");
            plugin.install(&server);
        }

        Ok(server)
    }
}

// ============================================================================
// Server
// ============================================================================

pub(crate) struct ServerInner {
    pub(crate) sparks: RwLock<FxHashMap<SparkId, Spark>>,
    /// Every id handed out, live or departed.
    issued: Mutex<FxHashSet<SparkId>>,
    pub(crate) pipeline: Arc<TransformPipeline>,
    pub(crate) bus: EventBus<ServerEvent>,
    counter: AtomicU64,
    pub(crate) codec: Arc<dyn Codec>,
    plugins: Vec<Arc<dyn Plugin>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

/// Registry of accepted connections.
///
/// Cloning is cheap; clones share the registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("sparks", &self.len())
            .field("plugins", &self.plugins())
            .finish_non_exhaustive()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Creates a server with the JSON codec and no plugins.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(Arc::new(JsonCodec), Vec::new())
    }

    fn from_parts(codec: Arc<dyn Codec>, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                sparks: RwLock::new(FxHashMap::default()),
                issued: Mutex::new(FxHashSet::default()),
                pipeline: Arc::new(TransformPipeline::new()),
                bus: EventBus::new(),
                counter: AtomicU64::new(0),
                codec,
                plugins,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts configuring a server.
    #[inline]
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Names of installed plugins, in installation order.
    #[must_use]
    pub fn plugins(&self) -> Vec<&str> {
        self.inner.plugins.iter().map(|p| p.name()).collect()
    }
}

// ============================================================================
// Server - Events & Transforms
// ============================================================================

impl Server {
    /// The server's event bus.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventBus<ServerEvent> {
        &self.inner.bus
    }

    /// Registers a listener for one kind of event.
    pub fn on<F>(&self, kind: ServerEventKind, listener: F) -> ListenerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, listener)
    }

    /// Streams every event through a channel.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        self.inner.bus.subscribe()
    }

    /// Registers a transform shared by every spark, current and future.
    pub fn transform(&self, direction: Direction, transform: Transform) {
        self.inner.pipeline.push(direction, transform);
    }

    /// Reports a server-level error to listeners, or logs it.
    pub(crate) fn safe_error(&self, error: Error) {
        if self.inner.bus.has_listeners(ServerEventKind::Error) {
            self.inner.bus.emit(&ServerEvent::Error(Arc::new(error)));
        } else {
            warn!(error = %error, "Unhandled server error");
        }
    }
}

// ============================================================================
// Server - Registry
// ============================================================================

impl Server {
    /// Looks up a live spark.
    #[must_use]
    pub fn spark(&self, id: &str) -> Option<Spark> {
        self.inner.sparks.read().get(id).cloned()
    }

    /// Snapshot of every live spark.
    #[must_use]
    pub fn sparks(&self) -> Vec<Spark> {
        self.inner.sparks.read().values().cloned().collect()
    }

    /// Number of live sparks.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sparks.read().len()
    }

    /// Returns `true` if no spark is live.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for every live spark. Runs on a snapshot, so `f` may end
    /// sparks.
    pub fn for_each<F: FnMut(&Spark)>(&self, mut f: F) {
        for spark in self.sparks() {
            f(&spark);
        }
    }

    /// Writes `data` to every live spark. Returns how many accepted it.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if `data` cannot be represented as JSON.
    pub fn write_all<T: Serialize + ?Sized>(&self, data: &T) -> Result<usize> {
        let value = serde_json::to_value(data)?;
        let mut delivered = 0;
        for spark in self.sparks() {
            if spark.write(&value)? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Accepts a connection delivered by a transport adapter.
    ///
    /// The spark is registered immediately; `Connection` is announced after
    /// the next scheduling tick so listeners attached right after this call
    /// still see it.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateSpark`] if a supplied id was ever issued by this
    ///   server, even to a spark that has since disconnected
    /// - [`Error::Config`] if no tokio runtime is running
    pub fn accept(&self, info: SparkInfo, link: TransportLink) -> Result<Spark> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::config("sparks must be accepted inside a tokio runtime"))?;

        let mut sparks = self.inner.sparks.write();
        let mut issued = self.inner.issued.lock();
        let id = match info.id.clone() {
            Some(id) if issued.contains(&id) => return Err(Error::duplicate_spark(id)),
            Some(id) => id,
            None => loop {
                let counter = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
                let candidate = SparkId::generate(info.address, counter);
                if !issued.contains(&candidate) {
                    break candidate;
                }
            },
        };
        issued.insert(id.clone());
        drop(issued);

        let (spark, task) = spark::create(id.clone(), info, link, &self.inner);
        sparks.insert(id.clone(), spark.clone());
        drop(sparks);

        runtime.spawn(task);
        debug!(id = %id, "Spark accepted");
        Ok(spark)
    }

    /// Ends every spark and stops every listener.
    pub fn destroy(&self) {
        let listeners: Vec<JoinHandle<()>> = self.inner.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.abort();
        }

        let sparks = self.sparks();
        info!(sparks = sparks.len(), "Destroying server");
        for spark in sparks {
            spark.end();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
