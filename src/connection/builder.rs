//! Builder for [`Connection`] instances.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use sparkwire::{Connection, ConnectionOptions};
//!
//! # fn example() -> sparkwire::Result<()> {
//! let connection = Connection::builder("wss://example.com/live")
//!     .options(ConnectionOptions::new().with_ping(Duration::from_secs(10)))
//!     .connect()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::pipeline::{Direction, Transform, TransformPipeline};
use crate::protocol::{Codec, JsonCodec};
use crate::transport::{TransportLink, WebSocketTransport};

use super::machine::{self, Machine};
use super::options::ConnectionOptions;
use super::{Connection, Shared};

// ============================================================================
// ConnectionBuilder
// ============================================================================

/// Configures and starts a [`Connection`].
///
/// Use [`Connection::builder()`] to create one.
pub struct ConnectionBuilder {
    /// Endpoint URL as given.
    url: String,
    /// Behaviour options.
    options: ConnectionOptions,
    /// Payload codec.
    codec: Arc<dyn Codec>,
    /// Transforms registered before start.
    pipeline: Arc<TransformPipeline>,
}

impl ConnectionBuilder {
    /// Creates a builder with default options and the JSON codec.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: ConnectionOptions::default(),
            codec: Arc::new(JsonCodec),
            pipeline: Arc::new(TransformPipeline::new()),
        }
    }

    /// Replaces the options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the codec.
    #[inline]
    #[must_use]
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Registers a transform before the connection starts.
    #[inline]
    #[must_use]
    pub fn transform(self, direction: Direction, transform: Transform) -> Self {
        self.pipeline.push(direction, transform);
        self
    }

    /// Starts the connection over the WebSocket transport.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if the URL does not parse
    /// - [`Error::Config`] if the options are invalid or no runtime is running
    pub fn connect(self) -> Result<Connection> {
        let url = self.validate_url()?;
        self.options.validate()?;
        let link = WebSocketTransport::spawn(url)?;
        self.connect_with(link)
    }

    /// Starts the connection over a caller-supplied transport adapter.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if the URL does not parse
    /// - [`Error::Config`] if the options are invalid or no runtime is running
    pub fn connect_with(self, link: TransportLink) -> Result<Connection> {
        let url = self.validate_url()?;
        self.options.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(EventBus::new());
        let shared = Arc::new(Shared::new());

        let machine = Machine::new(
            url.clone(),
            self.options,
            self.codec,
            Arc::clone(&self.pipeline),
            Arc::clone(&bus),
            Arc::clone(&shared),
            link,
            commands_rx,
        );
        machine::spawn(machine)?;

        debug!(url = %url, "Connection started");
        Ok(Connection::from_parts(
            commands_tx,
            bus,
            shared,
            self.pipeline,
            url,
        ))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ConnectionBuilder {
    fn validate_url(&self) -> Result<Url> {
        if self.url.trim().is_empty() {
            return Err(Error::config(
                "Connection URL is required.\n\
                 Example: Connection::builder(\"ws://localhost:8080\")",
            ));
        }
        Ok(Url::parse(&self.url)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
