//! Message transform pipeline.
//!
//! A pipeline holds two ordered, append-only sequences of transforms, one
//! per [`Direction`]. Every message runs through the sequence for its
//! direction before its terminal action: incoming messages are then emitted
//! as `Data` events, outgoing messages are encoded and handed to the
//! transport.
//!
//! # Transforms
//!
//! | Variant | Signature | Suppress | Abort |
//! |---------|-----------|----------|-------|
//! | [`Transform::Sync`] | `Fn(&mut Packet) -> bool` | return `false` | n/a |
//! | [`Transform::Async`] | `Fn(Packet) -> Future<Result<Step>>` | `Ok(Step::Suppress)` | `Err(_)` |
//!
//! Entries run strictly one after another for a given packet. A run works
//! on a snapshot of the sequence, so transforms registered while it is in
//! flight only apply to later messages.
//!
//! # Example
//!
//! ```ignore
//! use sparkwire::pipeline::{Direction, Step, Transform};
//!
//! pipeline.push(Direction::Outgoing, Transform::sync(|packet| {
//!     packet.data["sentAt"] = serde_json::json!(42);
//!     true
//! }));
//!
//! pipeline.push(Direction::Incoming, Transform::asynchronous(|packet| async move {
//!     if packet.data.is_null() {
//!         return Ok(Step::Suppress);
//!     }
//!     Ok(Step::Continue(packet))
//! }));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

use crate::error::Result;

// ============================================================================
// Direction
// ============================================================================

/// Which way a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the transport towards application code.
    Incoming,
    /// From application code towards the transport.
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => f.write_str("incoming"),
            Self::Outgoing => f.write_str("outgoing"),
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A message threading through one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Decoded payload. Transforms may rewrite it.
    pub data: Value,
    /// Original encoded frame. Only set for incoming messages.
    pub raw: Option<String>,
}

impl Packet {
    /// Creates an outgoing packet.
    #[inline]
    #[must_use]
    pub fn outgoing(data: Value) -> Self {
        Self { data, raw: None }
    }

    /// Creates an incoming packet that remembers its raw frame.
    #[inline]
    #[must_use]
    pub fn incoming(data: Value, raw: impl Into<String>) -> Self {
        Self {
            data,
            raw: Some(raw.into()),
        }
    }
}

// ============================================================================
// Transform
// ============================================================================

/// What an asynchronous transform decided.
#[derive(Debug)]
pub enum Step {
    /// Hand the (possibly rewritten) packet to the next entry.
    Continue(Packet),
    /// Drop the message; the terminal action is skipped.
    Suppress,
}

/// Synchronous transform body.
pub type SyncFn = dyn Fn(&mut Packet) -> bool + Send + Sync;

/// Asynchronous transform body.
pub type AsyncFn = dyn Fn(Packet) -> BoxFuture<'static, Result<Step>> + Send + Sync;

/// A registered transform.
///
/// The variant is chosen at registration; it is never inferred.
#[derive(Clone)]
pub enum Transform {
    /// Runs inline. Returning `false` suppresses the message.
    Sync(Arc<SyncFn>),
    /// May suspend. Resolves to a [`Step`] or aborts with an error.
    Async(Arc<AsyncFn>),
}

impl Transform {
    /// Wraps a synchronous transform.
    pub fn sync<F>(transform: F) -> Self
    where
        F: Fn(&mut Packet) -> bool + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(transform))
    }

    /// Wraps an asynchronous transform.
    pub fn asynchronous<F, Fut>(transform: F) -> Self
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Step>> + Send + 'static,
    {
        Self::Async(Arc::new(move |packet| transform(packet).boxed()))
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Transform::Sync"),
            Self::Async(_) => f.write_str("Transform::Async"),
        }
    }
}

// ============================================================================
// TransformPipeline
// ============================================================================

/// Ordered incoming and outgoing transform sequences.
///
/// Shared by reference between a [`Server`](crate::Server) and all of its
/// sparks; a [`Connection`](crate::Connection) owns its own.
#[derive(Debug, Default)]
pub struct TransformPipeline {
    incoming: RwLock<Vec<Transform>>,
    outgoing: RwLock<Vec<Transform>>,
}

impl TransformPipeline {
    /// Creates an empty pipeline.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transform to one direction.
    pub fn push(&self, direction: Direction, transform: Transform) {
        trace!(%direction, ?transform, "Transform registered");
        self.sequence(direction).write().push(transform);
    }

    /// Number of transforms registered for a direction.
    #[must_use]
    pub fn len(&self, direction: Direction) -> usize {
        self.sequence(direction).read().len()
    }

    /// Returns `true` if no transform is registered in either direction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.incoming.read().is_empty() && self.outgoing.read().is_empty()
    }

    /// Runs a packet through the current sequence for `direction`.
    ///
    /// Resolves to `Ok(Some(packet))` when every entry let it through,
    /// `Ok(None)` when an entry suppressed it, and `Err` when an
    /// asynchronous entry aborted.
    pub fn run(&self, direction: Direction, packet: Packet) -> BoxFuture<'static, Result<Option<Packet>>> {
        let entries = self.sequence(direction).read().clone();
        apply(direction, entries, packet).boxed()
    }

    fn sequence(&self, direction: Direction) -> &RwLock<Vec<Transform>> {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }
}

async fn apply(
    direction: Direction,
    entries: Vec<Transform>,
    mut packet: Packet,
) -> Result<Option<Packet>> {
    for (index, entry) in entries.iter().enumerate() {
        match entry {
            Transform::Sync(transform) => {
                if !transform(&mut packet) {
                    trace!(%direction, index, "Message suppressed by sync transform");
                    return Ok(None);
                }
            }
            Transform::Async(transform) => match transform(packet).await? {
                Step::Continue(next) => packet = next,
                Step::Suppress => {
                    trace!(%direction, index, "Message suppressed by async transform");
                    return Ok(None);
                }
            },
        }
    }

    Ok(Some(packet))
}

// ============================================================================
// Tests
// ============================================================================
