//! Connection state machine.
//!
//! One tokio task per connection owns every piece of mutable state: ready
//! state, timers, the outgoing buffer, heartbeat and recovery bookkeeping.
//! The task multiplexes five sources with `tokio::select!`:
//!
//! - Commands from [`Connection`](super::Connection) handles
//! - Signals from the transport adapter
//! - Completed pipeline runs (incoming and outgoing, each in submission order)
//! - Encoded heartbeat probes, which never wait behind user transforms
//! - The earliest pending timer
//!
//! Handlers never suspend, so each one observes and leaves a consistent state.
//!
//! # Ready State
//!
//! ```text
//!            open()              Connected
//! CLOSED ─────────────► OPENING ───────────► OPEN
//!   ▲                      │                  │
//!   └──────────────────────┴──────────────────┘
//!        error / timeout / close / end()
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::mem;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesOrdered;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::pipeline::{Direction, Packet, TransformPipeline};
use crate::protocol::{Codec, ControlMessage};
use crate::transport::{Directive, Signal, TransportLink};

use super::buffer::MessageBuffer;
use super::event::{Event, EventKind};
use super::heartbeat::HeartbeatMonitor;
use super::options::{ConnectionOptions, Strategy};
use super::recovery::{Recovery, Schedule};
use super::timers::{TimerKind, Timers};
use super::{ReadyState, Shared};

// ============================================================================
// Types
// ============================================================================

/// Requests from connection handles.
#[derive(Debug)]
pub(crate) enum Command {
    Open,
    Write(Value),
    End(Option<Value>),
    RequestId(oneshot::Sender<String>),
    Network { online: bool },
    Destroy,
}

/// Result of an outgoing pipeline run.
enum Outbound {
    Frame(String),
    Suppressed,
    Failed(Error),
}

/// Result of an incoming pipeline run.
enum Inbound {
    Control(ControlMessage),
    Data { data: Value, raw: String },
    Suppressed,
    Failed(Error),
}

// ============================================================================
// Machine
// ============================================================================

pub(crate) struct Machine {
    url: Url,
    options: ConnectionOptions,
    codec: Arc<dyn Codec>,
    pipeline: Arc<TransformPipeline>,
    bus: Arc<EventBus<Event>>,
    shared: Arc<Shared>,
    link: TransportLink,
    adapter_alive: bool,
    commands: mpsc::UnboundedReceiver<Command>,

    ready: ReadyState,
    opening_since: Instant,
    online: bool,
    /// Set by `server::close`, consumed by the next close.
    graceful_close: bool,
    /// `end()` ran; writes are refused until the next open.
    ended: bool,
    /// `end()` is waiting for outgoing runs to drain.
    closing: bool,

    buffer: MessageBuffer,
    timers: Timers,
    heartbeat: HeartbeatMonitor,
    recovery: Recovery,

    outgoing: FuturesOrdered<BoxFuture<'static, Outbound>>,
    incoming: FuturesOrdered<BoxFuture<'static, Inbound>>,
    probes: FuturesOrdered<BoxFuture<'static, Result<String>>>,
    id_waiters: Vec<oneshot::Sender<String>>,
}

impl Machine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        url: Url,
        options: ConnectionOptions,
        codec: Arc<dyn Codec>,
        pipeline: Arc<TransformPipeline>,
        bus: Arc<EventBus<Event>>,
        shared: Arc<Shared>,
        link: TransportLink,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            buffer: MessageBuffer::new(options.queue_size),
            heartbeat: HeartbeatMonitor::new(options.ping, options.pong),
            recovery: Recovery::new(options.reconnect.clone()),
            url,
            options,
            codec,
            pipeline,
            bus,
            shared,
            link,
            adapter_alive: true,
            commands,
            ready: ReadyState::Closed,
            opening_since: Instant::now(),
            online: true,
            graceful_close: false,
            ended: false,
            closing: false,
            timers: Timers::default(),
            outgoing: FuturesOrdered::new(),
            incoming: FuturesOrdered::new(),
            probes: FuturesOrdered::new(),
            id_waiters: Vec::new(),
        }
    }

    /// Event loop. Returns once destroyed or every handle is dropped.
    pub(crate) async fn run(mut self) {
        if !self.options.manual {
            self.open();
        }

        loop {
            let deadline = self.timers.next_deadline();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Destroy) | None => {
                            self.destroy();
                            break;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }

                signal = self.link.signals.recv(), if self.adapter_alive => {
                    match signal {
                        Some(signal) => self.handle_signal(signal),
                        None => {
                            debug!(url = %self.url, "Transport adapter went away");
                            self.adapter_alive = false;
                            self.on_disconnected();
                        }
                    }
                }

                Some(outbound) = self.outgoing.next(), if !self.outgoing.is_empty() => {
                    self.handle_outbound(outbound);
                }

                Some(inbound) = self.incoming.next(), if !self.incoming.is_empty() => {
                    self.handle_inbound(inbound);
                }

                Some(probe) = self.probes.next(), if !self.probes.is_empty() => {
                    self.on_probe_encoded(probe);
                }

                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_timers();
                }
            }
        }

        debug!(url = %self.url, "Connection task terminated");
    }
}

// ============================================================================
// Machine - Commands
// ============================================================================

impl Machine {
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open => self.open(),
            Command::Write(data) => self.write(data),
            Command::End(data) => self.end(data),
            Command::RequestId(reply) => self.request_id(reply),
            Command::Network { online } => self.network_change(online),
            Command::Destroy => self.destroy(),
        }
    }

    fn open(&mut self) {
        if self.ready != ReadyState::Closed {
            trace!(state = ?self.ready, "Open ignored, already opening or open");
            return;
        }

        let reconnecting = self.recovery.is_reconnecting();
        if !reconnecting && let Some(timeout) = self.options.timeout {
            self.timers.set(TimerKind::Connect, timeout);
        }

        self.revive();
        self.opening_since = Instant::now();
        self.set_ready(ReadyState::Opening);

        let directive = if reconnecting {
            Directive::Reconnect
        } else {
            Directive::Connect
        };
        debug!(url = %self.url, ?directive, "Opening connection");
        self.direct(directive);
    }

    fn write(&mut self, data: Value) {
        if self.ended {
            debug!("Write after end dropped");
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

    /// Queues a control message behind pending writes, skipping transforms.
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
        if self.closing {
            return;
        }

        if self.ready == ReadyState::Closed && !self.timers.is_active(TimerKind::Connect) {
            if self.recovery.is_reconnecting() {
                debug!("End while waiting to reconnect");
                self.recovery.reset();
                self.finish();
            }
            return;
        }

        if let Some(data) = data {
            self.write(data);
        }

        self.ended = true;
        self.shared.set_writable(false);
        self.timers.clear_all();
        self.recovery.reset();
        self.closing = true;

        if self.outgoing.is_empty() {
            self.close_and_finish();
        }
    }

    fn request_id(&mut self, reply: oneshot::Sender<String>) {
        if self.ended {
            return;
        }
        self.id_waiters.push(reply);
        if self.id_waiters.len() == 1 {
            self.write_control(ControlMessage::IdRequest);
        }
    }

    fn network_change(&mut self, online: bool) {
        if !self.options.strategy.contains(Strategy::ONLINE) {
            trace!(online, "Network change ignored by strategy");
            return;
        }

        if online {
            if self.online {
                return;
            }
            self.set_online(true);
            if self.ready == ReadyState::Closed {
                self.recovery.reset();
                self.revive();
                self.reconnect();
            }
        } else {
            if !self.online {
                return;
            }
            self.set_online(false);
            self.end(None);
            self.recovery.reset();
        }
    }

    fn destroy(&mut self) {
        debug!(url = %self.url, "Destroying connection");
        self.outgoing = FuturesOrdered::new();
        if self.closing {
            self.close_and_finish();
        } else {
            self.end(None);
        }
        self.timers.clear_all();
        self.bus.clear();
    }
}

// ============================================================================
// Machine - Transport Signals
// ============================================================================

impl Machine {
    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Connected => self.on_connected(),
            Signal::Message(raw) => self.receive(raw),
            Signal::Errored(error) => self.on_errored(error),
            Signal::Disconnected => self.on_disconnected(),
        }
    }

    fn on_connected(&mut self) {
        if self.ended {
            debug!("Transport opened after end, closing it");
            self.direct(Directive::Disconnect);
            return;
        }
        if self.ready == ReadyState::Open {
            return;
        }

        self.timers.clear(TimerKind::Connect);
        self.timers.clear(TimerKind::Reconnect);
        self.timers.clear(TimerKind::Attempt);

        if let Some(attempts) = self.recovery.succeed() {
            debug!(attempts, "Reconnected");
            self.emit(Event::Reconnected { attempts });
        }

        self.set_ready(ReadyState::Open);
        self.shared.set_latency(self.opening_since.elapsed());
        self.heartbeat.start(&mut self.timers);

        let frames: Vec<String> = self.buffer.drain().collect();
        if !frames.is_empty() {
            debug!(count = frames.len(), "Flushing buffered frames");
        }
        for frame in frames {
            self.direct(Directive::Send(frame));
        }

        self.emit(Event::Open);
    }

    fn on_errored(&mut self, error: Error) {
        if self.recovery.in_flight() {
            debug!(error = %error, "Reconnect attempt failed");
            self.attempt_failed();
            return;
        }

        self.safe_error(error);

        if self.timers.is_active(TimerKind::Connect) {
            if self.options.strategy.contains(Strategy::TIMEOUT) {
                self.reconnect();
            } else {
                self.end(None);
            }
        }
    }

    fn on_disconnected(&mut self) {
        if mem::take(&mut self.graceful_close) {
            debug!("Closed by server, not reconnecting");
            self.end(None);
            return;
        }

        if self.recovery.is_reconnecting() {
            if self.recovery.in_flight() {
                self.attempt_failed();
            } else {
                trace!("Close while waiting to reconnect ignored");
            }
            return;
        }

        let previous = self.ready;
        self.set_ready(ReadyState::Closed);

        if self.timers.is_active(TimerKind::Connect) {
            self.end(None);
            return;
        }

        if previous != ReadyState::Open {
            if previous == ReadyState::Opening
                && !self.ended
                && self.options.strategy.contains(Strategy::DISCONNECT)
            {
                self.reconnect();
            }
            return;
        }

        self.timers.clear_all();
        self.emit(Event::Close);

        if !self.ended && self.options.strategy.contains(Strategy::DISCONNECT) {
            self.reconnect();
        } else {
            self.finish();
        }
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
                    && control.is_client_bound()
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
}

// ============================================================================
// Machine - Pipeline Results
// ============================================================================

impl Machine {
    fn handle_outbound(&mut self, outbound: Outbound) {
        match outbound {
            Outbound::Frame(frame) => self.send_frame(frame),
            Outbound::Suppressed => {}
            Outbound::Failed(error) => self.safe_error(error),
        }

        if self.closing && self.outgoing.is_empty() {
            self.close_and_finish();
        }
    }

    fn send_frame(&mut self, frame: String) {
        if self.ready == ReadyState::Open {
            self.direct(Directive::Send(frame));
            return;
        }

        if self.closing || self.ended {
            trace!("Frame dropped, connection not open");
            return;
        }

        trace!(buffered = self.buffer.len() + 1, "Connection not open, frame buffered");
        self.buffer.push(frame);
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Control(ControlMessage::Pong(timestamp)) => self.on_pong(timestamp),
            Inbound::Control(ControlMessage::Id(id)) => {
                for waiter in self.id_waiters.drain(..) {
                    let _ = waiter.send(id.clone());
                }
            }
            Inbound::Control(ControlMessage::ServerClose) => {
                debug!("Server announced close");
                self.graceful_close = true;
            }
            Inbound::Control(other) => trace!(?other, "Control message ignored"),
            Inbound::Data { data, raw } => self.emit(Event::Data { data, raw }),
            Inbound::Suppressed => {}
            Inbound::Failed(error) => self.safe_error(error),
        }
    }

    fn on_pong(&mut self, timestamp: u64) {
        if let Some(latency) = self.heartbeat.answer(&mut self.timers, timestamp) {
            self.set_online(true);
            self.shared.set_latency(latency);
            self.emit(Event::Heartbeat { latency });
        }
    }
}

// ============================================================================
// Machine - Timers
// ============================================================================

impl Machine {
    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(kind) = self.timers.pop_expired(now) {
            trace!(timer = %kind, "Timer fired");
            match kind {
                TimerKind::Connect => self.on_connect_timeout(),
                TimerKind::Ping => self.on_ping_due(),
                TimerKind::Pong => self.on_pong_timeout(),
                TimerKind::Reconnect => self.on_reconnect_due(),
                TimerKind::Attempt => self.on_attempt_timeout(),
            }
        }
    }

    fn on_connect_timeout(&mut self) {
        let timeout_ms = self.options.timeout.map_or(0, |t| t.as_millis() as u64);
        warn!(url = %self.url, timeout_ms, "Connect timed out");
        self.emit(Event::Timeout);

        if self.options.strategy.contains(Strategy::TIMEOUT) {
            self.reconnect();
        } else {
            self.safe_error(Error::connect_timeout(timeout_ms));
            self.end(None);
        }
    }

    fn on_ping_due(&mut self) {
        if self.ready != ReadyState::Open {
            return;
        }
        let codec = Arc::clone(&self.codec);
        let value = self.heartbeat.probe().to_value();
        self.probes
            .push_back(async move { codec.encode(&value).await }.boxed());
    }

    /// Probes go straight to the adapter and are never buffered.
    fn on_probe_encoded(&mut self, probe: Result<String>) {
        match probe {
            Ok(frame) if self.ready == ReadyState::Open && !self.closing => {
                self.direct(Directive::Send(frame));
                self.heartbeat.sent(&mut self.timers);
            }
            Ok(_) => trace!("Probe dropped, connection not open"),
            Err(error) => {
                self.safe_error(error);
                if self.ready == ReadyState::Open && !self.closing {
                    self.heartbeat.start(&mut self.timers);
                }
            }
        }
    }

    fn on_pong_timeout(&mut self) {
        warn!(url = %self.url, "Heartbeat timed out, connection presumed dead");
        self.set_online(false);
        self.on_disconnected();
    }

    fn on_reconnect_due(&mut self) {
        let Some(attempt) = self.recovery.start() else {
            return;
        };

        debug!(
            attempt,
            waited_ms = self.recovery.scheduled().map_or(0, |d| d.as_millis() as u64),
            "Reconnecting"
        );
        self.emit(Event::Reconnect { attempt });

        if let Some(timeout) = self.recovery.attempt_timeout() {
            self.timers.set(TimerKind::Attempt, timeout);
        }
        self.open();
    }

    fn on_attempt_timeout(&mut self) {
        let attempt = self.recovery.attempt().unwrap_or_default();
        let timeout_ms = self
            .recovery
            .attempt_timeout()
            .map_or(0, |t| t.as_millis() as u64);
        warn!(error = %Error::reconnect_timeout(attempt, timeout_ms), "Reconnect attempt abandoned");
        self.emit(Event::ReconnectTimeout { attempt });
        self.direct(Directive::Disconnect);
        self.attempt_failed();
    }
}

// ============================================================================
// Machine - Recovery
// ============================================================================

impl Machine {
    fn reconnect(&mut self) {
        self.timers.clear(TimerKind::Connect);
        self.stop_heartbeat();
        self.set_ready(ReadyState::Closed);

        match self.recovery.schedule() {
            Schedule::Scheduled { attempt, delay } => {
                self.emit(Event::ReconnectScheduled { attempt, delay });
                self.timers.set(TimerKind::Reconnect, delay);
            }
            Schedule::Exhausted { attempts } => {
                warn!(url = %self.url, error = %Error::reconnect_exhausted(attempts), "Giving up reconnecting");
                self.timers.clear_all();
                self.emit(Event::ReconnectFailed { attempts });
                self.finish();
            }
        }
    }

    fn attempt_failed(&mut self) {
        if !self.recovery.fail() {
            return;
        }
        self.timers.clear(TimerKind::Attempt);
        self.reconnect();
    }
}

// ============================================================================
// Machine - Helpers
// ============================================================================

impl Machine {
    /// Final step of `end()`: tells the adapter, closes, finishes.
    fn close_and_finish(&mut self) {
        self.closing = false;
        self.set_ready(ReadyState::Closed);
        self.emit(Event::Close);
        self.finish();
    }

    /// Terminal state: no timers, no buffer, adapter told to disconnect, `End` emitted.
    fn finish(&mut self) {
        self.ended = true;
        self.closing = false;
        self.shared.set_writable(false);
        self.stop_heartbeat();
        self.timers.clear_all();
        self.buffer.clear();
        self.id_waiters.clear();
        self.set_ready(ReadyState::Closed);
        self.direct(Directive::Disconnect);
        debug!(url = %self.url, "Connection ended");
        self.emit(Event::End);
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat.stop(&mut self.timers);
        self.probes = FuturesOrdered::new();
    }

    /// Leaves the ended state so writes are admitted again.
    fn revive(&mut self) {
        self.ended = false;
        self.shared.set_writable(true);
    }

    fn set_ready(&mut self, state: ReadyState) {
        if self.ready == state {
            return;
        }
        trace!(from = ?self.ready, to = ?state, "Ready state change");
        self.ready = state;
        self.shared.set_ready_state(state);
        self.emit(Event::ReadyStateChange(state));
    }

    fn set_online(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;
        self.shared.set_online(online);
        self.emit(if online { Event::Online } else { Event::Offline });
    }

    fn direct(&mut self, directive: Directive) {
        if self.adapter_alive && !self.link.direct(directive) {
            debug!("Transport adapter dropped its directive channel");
        }
    }

    fn emit(&self, event: Event) {
        self.bus.emit(&event);
    }

    /// Delivers an error only if someone listens for it.
    fn safe_error(&self, error: Error) {
        if self.bus.has_listeners(EventKind::Error) {
            self.bus.emit(&Event::Error(Arc::new(error)));
        } else {
            warn!(error = %error, "Unhandled connection error");
        }
    }
}

/// Convenience for handle-side spawning.
pub(crate) fn spawn(machine: Machine) -> Result<()> {
    tokio::runtime::Handle::try_current()
        .map_err(|_| Error::config("a connection must be created inside a tokio runtime"))?
        .spawn(machine.run());
    Ok(())
}
