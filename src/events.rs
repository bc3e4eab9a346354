//! Publish/subscribe event bus.
//!
//! Every [`Connection`](crate::Connection), [`Spark`](crate::Spark) and
//! [`Server`](crate::Server) composes one [`EventBus`]. Listeners subscribe
//! to a topic (the event's kind) or to every event, and run synchronously on
//! the task that emits.
//!
//! # Example
//!
//! ```ignore
//! use sparkwire::{Event, EventKind};
//!
//! connection.events().on(EventKind::Data, |event| {
//!     if let Event::Data { data, .. } = event {
//!         println!("received {data}");
//!     }
//! });
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::identifiers::ListenerId;

// ============================================================================
// BusEvent
// ============================================================================

/// An event that can travel over an [`EventBus`].
pub trait BusEvent: Clone + Send + Sync + 'static {
    /// Topic key, usually a fieldless mirror of the event enum.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Returns the topic this event is published on.
    fn kind(&self) -> Self::Kind;
}

// ============================================================================
// Types
// ============================================================================

/// Internal listener; returning `false` unregisters it.
type Listener<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

struct Entry<E> {
    id: ListenerId,
    once: bool,
    listener: Listener<E>,
}

impl<E> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            listener: Arc::clone(&self.listener),
        }
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Topic-based event bus.
///
/// Emission snapshots the listener list first, so listeners may register or
/// remove listeners (including themselves) while being called.
pub struct EventBus<E: BusEvent> {
    topics: RwLock<FxHashMap<E::Kind, Vec<Entry<E>>>>,
    wildcard: RwLock<Vec<Entry<E>>>,
    next_id: AtomicU64,
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(FxHashMap::default()),
            wildcard: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a listener for one topic.
    pub fn on<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(Some(kind), false, wrap(listener))
    }

    /// Registers a listener that is removed after its first call.
    pub fn once<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(Some(kind), true, wrap(listener))
    }

    /// Registers a listener for every topic.
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(None, false, wrap(listener))
    }

    /// Returns a channel receiving a copy of every event.
    ///
    /// The subscription ends when the receiver is dropped.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener<E> = Arc::new(move |event: &E| tx.send(event.clone()).is_ok());
        self.insert(None, false, listener);
        rx
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        {
            let mut wildcard = self.wildcard.write();
            let before = wildcard.len();
            wildcard.retain(|entry| entry.id != id);
            if wildcard.len() != before {
                return true;
            }
        }

        let mut topics = self.topics.write();
        for entries in topics.values_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            if entries.len() != before {
                return true;
            }
        }
        false
    }

    /// Returns how many listeners would receive an event of this kind.
    #[must_use]
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        let topical = self.topics.read().get(&kind).map_or(0, Vec::len);
        topical + self.wildcard.read().len()
    }

    /// Returns `true` if an event of this kind would reach anyone.
    #[inline]
    #[must_use]
    pub fn has_listeners(&self, kind: E::Kind) -> bool {
        self.listener_count(kind) > 0
    }

    /// Delivers an event to its topic listeners, then to wildcard listeners.
    ///
    /// Returns `true` if at least one listener was called.
    pub fn emit(&self, event: &E) -> bool {
        let kind = event.kind();
        let targets: Vec<Entry<E>> = {
            let topics = self.topics.read();
            let wildcard = self.wildcard.read();
            topics
                .get(&kind)
                .into_iter()
                .flatten()
                .chain(wildcard.iter())
                .cloned()
                .collect()
        };

        if targets.is_empty() {
            trace!(?kind, "No listeners for event");
            return false;
        }

        let mut expired = Vec::new();
        for entry in &targets {
            let keep = (entry.listener)(event);
            if entry.once || !keep {
                expired.push(entry.id);
            }
        }

        for id in expired {
            self.off(id);
        }

        true
    }

    /// Detaches every listener.
    pub fn clear(&self) {
        self.topics.write().clear();
        self.wildcard.write().clear();
    }

    fn insert(&self, kind: Option<E::Kind>, once: bool, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry { id, once, listener };

        match kind {
            Some(kind) => self.topics.write().entry(kind).or_default().push(entry),
            None => self.wildcard.write().push(entry),
        }

        id
    }
}

fn wrap<E, F>(listener: F) -> Listener<E>
where
    E: BusEvent,
    F: Fn(&E) + Send + Sync + 'static,
{
    Arc::new(move |event: &E| {
        listener(event);
        true
    })
}

// ============================================================================
// Tests
// ============================================================================
