//! Connection state machine driven through an in-memory adapter.
//!
//! Every test runs on a paused clock, so timers fire as soon as the runtime
//! is otherwise idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use sparkwire::{
    AdapterEnd, Connection, ConnectionOptions, Direction, Directive, Error, Event, EventKind,
    ReadyState, Step, Strategy, Transform, transport,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

// ============================================================================
// Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(120);

fn quiet() -> ConnectionOptions {
    ConnectionOptions::new().without_ping().without_timeout()
}

fn start(options: ConnectionOptions) -> (Connection, AdapterEnd, UnboundedReceiver<Event>) {
    let (core, adapter) = transport::link();
    let connection = Connection::builder("ws://localhost:8080")
        .options(options)
        .connect_with(core)
        .expect("connection starts");
    let events = connection.subscribe();
    (connection, adapter, events)
}

async fn directive(adapter: &mut AdapterEnd) -> Directive {
    timeout(WAIT, adapter.next_directive())
        .await
        .expect("directive in time")
        .expect("core alive")
}

async fn expect_event(events: &mut UnboundedReceiver<Event>, kind: EventKind) -> Event {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("bus alive");
            if sparkwire::BusEvent::kind(&event) == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind:?} event"))
}

/// Lets the connection task drain everything it can do right now.
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(sparkwire::BusEvent::kind(&event));
    }
    kinds
}

async fn open(adapter: &mut AdapterEnd, events: &mut UnboundedReceiver<Event>) {
    assert_eq!(directive(adapter).await, Directive::Connect);
    assert!(adapter.connected());
    expect_event(events, EventKind::Open).await;
}

// ============================================================================
// Buffering & Ordering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_buffered_writes_flush_in_order() {
    let (connection, mut adapter, mut events) = start(quiet());

    for n in 1..=3 {
        assert!(connection.write(&n).expect("write"));
    }

    assert_eq!(directive(&mut adapter).await, Directive::Connect);
    settle().await;
    assert_eq!(adapter.try_next_directive(), None);

    assert!(adapter.connected());
    expect_event(&mut events, EventKind::Open).await;
    assert!(connection.write(&4).expect("write"));

    for expected in ["1", "2", "3", "4"] {
        assert_eq!(directive(&mut adapter).await, Directive::Send(expected.into()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_queue_size_evicts_oldest() {
    let (connection, mut adapter, mut events) = start(quiet().with_queue_size(2));

    for n in 1..=3 {
        connection.write(&n).expect("write");
    }
    assert_eq!(directive(&mut adapter).await, Directive::Connect);
    settle().await;

    assert!(adapter.connected());
    expect_event(&mut events, EventKind::Open).await;
    assert_eq!(directive(&mut adapter).await, Directive::Send("2".into()));
    assert_eq!(directive(&mut adapter).await, Directive::Send("3".into()));
}

#[tokio::test(start_paused = true)]
async fn test_sync_suppress_prevents_send() {
    let (connection, mut adapter, mut events) = start(quiet());
    connection.transform(
        Direction::Outgoing,
        Transform::sync(|packet| packet.data != json!("drop")),
    );
    open(&mut adapter, &mut events).await;

    connection.write(&"drop").expect("write");
    connection.write(&"keep").expect("write");

    assert_eq!(directive(&mut adapter).await, Directive::Send("\"keep\"".into()));
    settle().await;
    assert_eq!(adapter.try_next_directive(), None);
}

#[tokio::test(start_paused = true)]
async fn test_outgoing_transform_rewrites_payload() {
    let (connection, mut adapter, mut events) = start(quiet());
    connection.transform(
        Direction::Outgoing,
        Transform::asynchronous(|mut packet| async move {
            sleep(Duration::from_millis(10)).await;
            packet.data = json!({ "wrapped": packet.data });
            Ok(Step::Continue(packet))
        }),
    );
    open(&mut adapter, &mut events).await;

    connection.write(&1).expect("write");
    connection.write(&2).expect("write");

    assert_eq!(
        directive(&mut adapter).await,
        Directive::Send(r#"{"wrapped":1}"#.into())
    );
    assert_eq!(
        directive(&mut adapter).await,
        Directive::Send(r#"{"wrapped":2}"#.into())
    );
}

// ============================================================================
// Incoming
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_data_event_carries_raw_frame() {
    let (connection, mut adapter, mut events) = start(quiet());
    connection.transform(
        Direction::Incoming,
        Transform::sync(|packet| {
            packet.data["seen"] = json!(true);
            true
        }),
    );
    open(&mut adapter, &mut events).await;

    assert!(adapter.message(r#"{"n":1}"#));
    let Event::Data { data, raw } = expect_event(&mut events, EventKind::Data).await else {
        panic!("expected data");
    };
    assert_eq!(data, json!({ "n": 1, "seen": true }));
    assert_eq!(raw, r#"{"n":1}"#);
}

#[tokio::test(start_paused = true)]
async fn test_transform_abort_surfaces_as_error() {
    let (connection, mut adapter, mut events) = start(quiet());
    connection.transform(
        Direction::Incoming,
        Transform::asynchronous(|_| async { Err(Error::transform("rejected")) }),
    );
    open(&mut adapter, &mut events).await;

    adapter.message("1");
    let Event::Error(error) = expect_event(&mut events, EventKind::Error).await else {
        panic!("expected error");
    };
    assert!(matches!(*error, Error::TransformAbort { .. }));

    settle().await;
    assert!(!drain(&mut events).contains(&EventKind::Data));
}

#[tokio::test(start_paused = true)]
async fn test_decode_error_is_dropped() {
    let (_connection, mut adapter, mut events) = start(quiet());
    open(&mut adapter, &mut events).await;

    adapter.message("{not json");
    let Event::Error(error) = expect_event(&mut events, EventKind::Error).await else {
        panic!("expected error");
    };
    assert!(error.is_codec_error());

    adapter.message("2");
    expect_event(&mut events, EventKind::Data).await;
}

#[tokio::test(start_paused = true)]
async fn test_control_messages_skip_pipeline() {
    let (connection, mut adapter, mut events) = start(quiet());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    connection.transform(
        Direction::Incoming,
        Transform::sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }),
    );
    open(&mut adapter, &mut events).await;

    adapter.message("\"sparkwire::pong::1\"");
    adapter.message("\"sparkwire::bogus::1\"");
    expect_event(&mut events, EventKind::Data).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// End
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_end_is_idempotent() {
    let (connection, mut adapter, mut events) = start(quiet());
    open(&mut adapter, &mut events).await;

    connection.end();
    connection.end();
    assert_eq!(directive(&mut adapter).await, Directive::Disconnect);
    settle().await;

    let kinds = drain(&mut events);
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::Close).count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::End).count(), 1);
    assert_eq!(connection.ready_state(), ReadyState::Closed);
    assert!(!connection.write(&"late").expect("write"));
    assert_eq!(adapter.try_next_directive(), None);
}

#[tokio::test(start_paused = true)]
async fn test_end_with_sends_final_message_first() {
    let (connection, mut adapter, mut events) = start(quiet());
    open(&mut adapter, &mut events).await;

    connection.end_with(&"bye").expect("end");
    assert_eq!(directive(&mut adapter).await, Directive::Send("\"bye\"".into()));
    assert_eq!(directive(&mut adapter).await, Directive::Disconnect);
    expect_event(&mut events, EventKind::End).await;
}

#[tokio::test(start_paused = true)]
async fn test_end_while_closed_is_noop() {
    let (connection, mut adapter, mut events) = start(quiet().with_manual());

    connection.end();
    settle().await;
    assert!(drain(&mut events).is_empty());
    assert_eq!(adapter.try_next_directive(), None);
}

#[tokio::test(start_paused = true)]
async fn test_manual_waits_for_open() {
    let (connection, mut adapter, mut events) = start(quiet().with_manual());
    settle().await;
    assert_eq!(adapter.try_next_directive(), None);

    connection.open().expect("open");
    open(&mut adapter, &mut events).await;
    assert_eq!(connection.ready_state(), ReadyState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_stops_task() {
    let (connection, mut adapter, mut events) = start(quiet());
    open(&mut adapter, &mut events).await;

    connection.destroy();
    assert_eq!(directive(&mut adapter).await, Directive::Disconnect);
    settle().await;

    let err = connection.open().unwrap_err();
    assert!(matches!(err, Error::Detached { operation: "open" }));
}

#[tokio::test(start_paused = true)]
async fn test_destroy_while_ending_still_closes() {
    let (connection, mut adapter, mut events) = start(quiet());
    connection.transform(
        Direction::Outgoing,
        Transform::asynchronous(|packet| async move {
            sleep(Duration::from_secs(10)).await;
            Ok(Step::Continue(packet))
        }),
    );
    open(&mut adapter, &mut events).await;

    connection.write(&"pending").expect("write");
    connection.end();
    settle().await;
    assert!(!drain(&mut events).contains(&EventKind::Close));

    connection.destroy();
    assert_eq!(directive(&mut adapter).await, Directive::Disconnect);
    expect_event(&mut events, EventKind::Close).await;
    expect_event(&mut events, EventKind::End).await;
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion() {
    let options = quiet()
        .with_retries(2)
        .with_reconnect_min(Duration::from_millis(100))
        .with_reconnect_max(Duration::from_millis(200));
    let (connection, mut adapter, mut events) = start(options);
    open(&mut adapter, &mut events).await;

    adapter.disconnected();
    expect_event(&mut events, EventKind::Close).await;

    for attempt in 1..=2 {
        let Event::ReconnectScheduled { attempt: scheduled, .. } =
            expect_event(&mut events, EventKind::ReconnectScheduled).await
        else {
            panic!("expected schedule");
        };
        assert_eq!(scheduled, attempt);

        assert_eq!(directive(&mut adapter).await, Directive::Reconnect);
        adapter.errored(Error::connection("refused"));
        adapter.disconnected();
    }

    let Event::ReconnectFailed { attempts } =
        expect_event(&mut events, EventKind::ReconnectFailed).await
    else {
        panic!("expected failure");
    };
    assert_eq!(attempts, 2);
    expect_event(&mut events, EventKind::End).await;
    assert_eq!(directive(&mut adapter).await, Directive::Disconnect);
    assert!(!connection.is_writable());

    // Well past reconnect.max and the default attempt timeout.
    sleep(Duration::from_secs(120)).await;
    assert_eq!(adapter.try_next_directive(), None);
    let late = drain(&mut events);
    assert!(
        !late.iter().any(|kind| matches!(
            kind,
            EventKind::Reconnect
                | EventKind::ReconnectScheduled
                | EventKind::ReconnectTimeout
                | EventKind::ReconnectFailed
        )),
        "recovery kept running after exhaustion: {late:?}"
    );
    assert_eq!(connection.ready_state(), ReadyState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_success_reports_attempts() {
    let options = quiet().with_reconnect_min(Duration::from_millis(100));
    let (connection, mut adapter, mut events) = start(options);
    open(&mut adapter, &mut events).await;

    adapter.disconnected();
    assert_eq!(directive(&mut adapter).await, Directive::Reconnect);
    expect_event(&mut events, EventKind::Reconnect).await;

    connection.write(&"during").expect("write");
    settle().await;
    adapter.connected();

    let Event::Reconnected { attempts } = expect_event(&mut events, EventKind::Reconnected).await
    else {
        panic!("expected reconnected");
    };
    assert_eq!(attempts, 1);
    assert_eq!(directive(&mut adapter).await, Directive::Send("\"during\"".into()));
    assert_eq!(connection.ready_state(), ReadyState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_strategy_off_ends() {
    let (_connection, mut adapter, mut events) =
        start(quiet().with_strategy(Strategy::NONE));
    open(&mut adapter, &mut events).await;

    adapter.disconnected();
    expect_event(&mut events, EventKind::End).await;
    settle().await;
    assert!(!drain(&mut events).contains(&EventKind::ReconnectScheduled));
}

#[tokio::test(start_paused = true)]
async fn test_graceful_close_does_not_reconnect() {
    let (_connection, mut adapter, mut events) = start(quiet());
    open(&mut adapter, &mut events).await;

    adapter.message("\"sparkwire::server::close\"");
    settle().await;
    adapter.disconnected();

    expect_event(&mut events, EventKind::End).await;
    settle().await;
    assert!(!drain(&mut events).contains(&EventKind::ReconnectScheduled));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempt_timeout() {
    let mut options = quiet().with_reconnect_min(Duration::from_millis(100));
    options.reconnect.timeout = Some(Duration::from_millis(500));
    let (_connection, mut adapter, mut events) = start(options);
    open(&mut adapter, &mut events).await;

    adapter.disconnected();
    assert_eq!(directive(&mut adapter).await, Directive::Reconnect);

    let Event::ReconnectTimeout { attempt } =
        expect_event(&mut events, EventKind::ReconnectTimeout).await
    else {
        panic!("expected attempt timeout");
    };
    assert_eq!(attempt, 1);
    assert_eq!(directive(&mut adapter).await, Directive::Disconnect);

    let Event::ReconnectScheduled { attempt, .. } =
        expect_event(&mut events, EventKind::ReconnectScheduled).await
    else {
        panic!("expected schedule");
    };
    assert_eq!(attempt, 2);
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_reconnects() {
    let options = ConnectionOptions::new()
        .without_ping()
        .with_timeout(Duration::from_millis(100));
    let (_connection, mut adapter, mut events) = start(options);
    assert_eq!(directive(&mut adapter).await, Directive::Connect);

    expect_event(&mut events, EventKind::Timeout).await;
    expect_event(&mut events, EventKind::ReconnectScheduled).await;
    assert_eq!(directive(&mut adapter).await, Directive::Reconnect);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_without_strategy_ends() {
    let options = ConnectionOptions::new()
        .without_ping()
        .with_timeout(Duration::from_millis(100))
        .with_strategy(Strategy::DISCONNECT);
    let (_connection, mut adapter, mut events) = start(options);
    assert_eq!(directive(&mut adapter).await, Directive::Connect);

    expect_event(&mut events, EventKind::Timeout).await;
    expect_event(&mut events, EventKind::End).await;
    settle().await;
    assert!(!drain(&mut events).contains(&EventKind::ReconnectScheduled));
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_never_times_out() {
    let options = ConnectionOptions::new()
        .without_ping()
        .with_timeout(Duration::ZERO);
    let (connection, mut adapter, mut events) = start(options);
    assert_eq!(directive(&mut adapter).await, Directive::Connect);

    sleep(Duration::from_secs(60)).await;
    assert!(!drain(&mut events).contains(&EventKind::Timeout));
    assert_eq!(adapter.try_next_directive(), None);
    assert_eq!(connection.ready_state(), ReadyState::Opening);
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_zero_ping_sends_no_probe() {
    let options = ConnectionOptions::new()
        .without_timeout()
        .with_ping(Duration::ZERO);
    let (connection, mut adapter, mut events) = start(options);
    open(&mut adapter, &mut events).await;

    sleep(Duration::from_secs(60)).await;
    assert_eq!(adapter.try_next_directive(), None);
    assert_eq!(connection.ready_state(), ReadyState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_probe_not_delayed_by_slow_outgoing_transform() {
    let options = ConnectionOptions::new()
        .without_timeout()
        .with_ping(Duration::from_millis(50))
        .with_pong(Duration::from_millis(20));
    let (connection, mut adapter, mut events) = start(options);
    connection.transform(
        Direction::Outgoing,
        Transform::asynchronous(|packet| async move {
            sleep(Duration::from_millis(40)).await;
            Ok(Step::Continue(packet))
        }),
    );
    open(&mut adapter, &mut events).await;

    sleep(Duration::from_millis(45)).await;
    connection.write(&"slow").expect("write");

    let Directive::Send(frame) = directive(&mut adapter).await else {
        panic!("expected ping");
    };
    assert!(frame.starts_with("\"sparkwire::ping::"));
    adapter.message(frame.replace("::ping::", "::pong::"));
    expect_event(&mut events, EventKind::Heartbeat).await;

    assert_eq!(directive(&mut adapter).await, Directive::Send("\"slow\"".into()));
    settle().await;
    let kinds = drain(&mut events);
    assert!(!kinds.contains(&EventKind::Offline));
    assert!(!kinds.contains(&EventKind::Close));
    assert_eq!(connection.ready_state(), ReadyState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_missing_pong_closes_and_reconnects() {
    let options = ConnectionOptions::new()
        .without_timeout()
        .with_ping(Duration::from_millis(50))
        .with_pong(Duration::from_millis(20));
    let (connection, mut adapter, mut events) = start(options);
    open(&mut adapter, &mut events).await;

    let Directive::Send(frame) = directive(&mut adapter).await else {
        panic!("expected ping");
    };
    assert!(frame.starts_with("\"sparkwire::ping::"));

    expect_event(&mut events, EventKind::Offline).await;
    expect_event(&mut events, EventKind::Close).await;
    expect_event(&mut events, EventKind::ReconnectScheduled).await;
    assert!(!connection.is_online());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_missing_pong_waits_for_pong_to_go_online() {
    let options = ConnectionOptions::new()
        .without_timeout()
        .with_ping(Duration::from_millis(50))
        .with_pong(Duration::from_millis(20))
        .with_reconnect_min(Duration::from_millis(100));
    let (connection, mut adapter, mut events) = start(options);
    open(&mut adapter, &mut events).await;

    directive(&mut adapter).await;
    expect_event(&mut events, EventKind::Offline).await;
    assert_eq!(directive(&mut adapter).await, Directive::Reconnect);
    drain(&mut events);

    adapter.connected();
    settle().await;
    let kinds = drain(&mut events);
    assert!(kinds.contains(&EventKind::Open));
    assert!(!kinds.contains(&EventKind::Online));
    assert!(!connection.is_online());

    let Directive::Send(frame) = directive(&mut adapter).await else {
        panic!("expected ping");
    };
    adapter.message(frame.replace("::ping::", "::pong::"));
    expect_event(&mut events, EventKind::Online).await;
    expect_event(&mut events, EventKind::Heartbeat).await;
    assert!(connection.is_online());
}

#[tokio::test(start_paused = true)]
async fn test_pong_keeps_connection_alive() {
    let options = ConnectionOptions::new()
        .without_timeout()
        .with_ping(Duration::from_millis(50))
        .with_pong(Duration::from_millis(20));
    let (connection, mut adapter, mut events) = start(options);
    open(&mut adapter, &mut events).await;

    for _ in 0..3 {
        let Directive::Send(frame) = directive(&mut adapter).await else {
            panic!("expected ping");
        };
        adapter.message(frame.replace("::ping::", "::pong::"));
        expect_event(&mut events, EventKind::Heartbeat).await;
    }

    settle().await;
    assert!(!drain(&mut events).contains(&EventKind::Close));
    assert_eq!(connection.ready_state(), ReadyState::Open);
}

// ============================================================================
// Network & Id
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_network_offline_then_online() {
    let options = quiet().with_reconnect_min(Duration::from_millis(100));
    let (connection, mut adapter, mut events) = start(options);
    open(&mut adapter, &mut events).await;

    connection.set_network_online(false).expect("offline");
    expect_event(&mut events, EventKind::Offline).await;
    expect_event(&mut events, EventKind::End).await;
    assert_eq!(directive(&mut adapter).await, Directive::Disconnect);

    connection.set_network_online(true).expect("online");
    expect_event(&mut events, EventKind::Online).await;
    expect_event(&mut events, EventKind::ReconnectScheduled).await;
    assert_eq!(directive(&mut adapter).await, Directive::Reconnect);

    adapter.connected();
    expect_event(&mut events, EventKind::Open).await;
    assert!(connection.write(&"back").expect("write"));
}

#[tokio::test(start_paused = true)]
async fn test_network_change_ignored_without_online_strategy() {
    let (connection, mut adapter, mut events) =
        start(quiet().with_strategy(Strategy::DISCONNECT));
    open(&mut adapter, &mut events).await;

    connection.set_network_online(false).expect("offline");
    settle().await;
    assert!(drain(&mut events).is_empty());
    assert_eq!(connection.ready_state(), ReadyState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_id_request_resolves() {
    let (connection, mut adapter, mut events) = start(quiet());

    let requester = connection.clone();
    let id = tokio::spawn(async move { requester.id().await });

    open(&mut adapter, &mut events).await;
    assert_eq!(
        directive(&mut adapter).await,
        Directive::Send("\"sparkwire::id::\"".into())
    );
    adapter.message("\"sparkwire::id::10.0.0.7:51234-1\"");

    let id = id.await.expect("join").expect("id");
    assert_eq!(id, "10.0.0.7:51234-1");
}

#[tokio::test(start_paused = true)]
async fn test_id_request_fails_when_connection_ends() {
    let (connection, mut adapter, mut events) = start(quiet());
    open(&mut adapter, &mut events).await;

    let requester = connection.clone();
    let id = tokio::spawn(async move { requester.id().await });
    directive(&mut adapter).await;

    connection.end();
    let err = id.await.expect("join").unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}
