//! Channel contract between the core and a transport adapter.
//!
//! The core never touches sockets. It sends [`Directive`]s to an adapter and
//! reacts to the [`Signal`]s the adapter reports back:
//!
//! ```text
//! ┌──────────────────┐   Directive::{Connect, Send, Disconnect, Reconnect}   ┌──────────────┐
//! │ Connection/Spark │ ────────────────────────────────────────────────────► │   Adapter    │
//! │  (TransportLink) │ ◄──────────────────────────────────────────────────── │ (AdapterEnd) │
//! └──────────────────┘   Signal::{Connected, Message, Errored, Disconnected} └──────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::mpsc;

use crate::error::Error;

// ============================================================================
// Directive
// ============================================================================

/// Instruction from the core to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Begin connecting.
    Connect,
    /// Deliver an encoded frame.
    Send(String),
    /// Close the transport; the core will not ask for it again unless it
    /// sends another `Connect` or `Reconnect`.
    Disconnect,
    /// Drop whatever transport exists and connect afresh.
    Reconnect,
}

// ============================================================================
// Signal
// ============================================================================

/// Report from the adapter to the core.
#[derive(Debug)]
pub enum Signal {
    /// The transport is open.
    Connected,
    /// An encoded frame arrived.
    Message(String),
    /// The transport failed. Usually followed by `Disconnected`.
    Errored(Error),
    /// The transport closed.
    Disconnected,
}

// ============================================================================
// Link
// ============================================================================

/// Creates a connected core/adapter channel pair.
#[must_use]
pub fn link() -> (TransportLink, AdapterEnd) {
    let (directive_tx, directive_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();

    (
        TransportLink {
            directives: directive_tx,
            signals: signal_rx,
        },
        AdapterEnd {
            directives: directive_rx,
            signals: signal_tx,
        },
    )
}

/// Core side of a link, consumed by a [`Connection`](crate::Connection) or
/// [`Spark`](crate::Spark).
#[derive(Debug)]
pub struct TransportLink {
    pub(crate) directives: mpsc::UnboundedSender<Directive>,
    pub(crate) signals: mpsc::UnboundedReceiver<Signal>,
}

impl TransportLink {
    /// Sends a directive. Returns `false` once the adapter is gone.
    pub(crate) fn direct(&self, directive: Directive) -> bool {
        self.directives.send(directive).is_ok()
    }
}

/// Adapter side of a link.
#[derive(Debug)]
pub struct AdapterEnd {
    directives: mpsc::UnboundedReceiver<Directive>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl AdapterEnd {
    /// Waits for the next directive. `None` once the core is gone.
    pub async fn next_directive(&mut self) -> Option<Directive> {
        self.directives.recv().await
    }

    /// Takes a directive if one is queued.
    pub fn try_next_directive(&mut self) -> Option<Directive> {
        self.directives.try_recv().ok()
    }

    /// Reports a signal. Returns `false` once the core is gone.
    pub fn signal(&self, signal: Signal) -> bool {
        self.signals.send(signal).is_ok()
    }

    /// Reports that the transport opened.
    pub fn connected(&self) -> bool {
        self.signal(Signal::Connected)
    }

    /// Reports an incoming frame.
    pub fn message(&self, raw: impl Into<String>) -> bool {
        self.signal(Signal::Message(raw.into()))
    }

    /// Reports a transport failure.
    pub fn errored(&self, error: Error) -> bool {
        self.signal(Signal::Errored(error))
    }

    /// Reports that the transport closed.
    pub fn disconnected(&self) -> bool {
        self.signal(Signal::Disconnected)
    }

    /// Splits into the directive receiver and a cloneable signal sender.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<Directive>,
        mpsc::UnboundedSender<Signal>,
    ) {
        (self.directives, self.signals)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directives_flow_to_adapter() {
        let (core, mut adapter) = link();
        assert!(core.direct(Directive::Connect));
        assert!(core.direct(Directive::Send("x".into())));

        assert_eq!(adapter.next_directive().await, Some(Directive::Connect));
        assert_eq!(adapter.try_next_directive(), Some(Directive::Send("x".into())));
        assert_eq!(adapter.try_next_directive(), None);
    }

    #[tokio::test]
    async fn test_signals_flow_to_core() {
        let (mut core, adapter) = link();
        assert!(adapter.connected());
        assert!(adapter.message("frame"));

        assert!(matches!(core.signals.recv().await, Some(Signal::Connected)));
        assert!(matches!(core.signals.recv().await, Some(Signal::Message(raw)) if raw == "frame"));
    }

    #[test]
    fn test_dropped_core_is_reported() {
        let (core, adapter) = link();
        drop(core);
        assert!(!adapter.disconnected());
    }
}
