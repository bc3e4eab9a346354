//! Server registry and sparks driven through in-memory adapters.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::json;
use sparkwire::{
    AdapterEnd, BusEvent, Direction, Directive, Error, Server, ServerEvent, ServerEventKind, Spark,
    SparkEvent, SparkEventKind, SparkInfo, Transform, transport,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_test::assert_ok;

// ============================================================================
// Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn address() -> SocketAddr {
    "192.168.1.20:40110".parse().expect("address")
}

fn accept(server: &Server, info: SparkInfo) -> (Spark, AdapterEnd) {
    let (core, adapter) = transport::link();
    let spark = assert_ok!(server.accept(info, core));
    (spark, adapter)
}

async fn directive(adapter: &mut AdapterEnd) -> Directive {
    timeout(WAIT, adapter.next_directive())
        .await
        .expect("directive in time")
        .expect("spark alive")
}

async fn server_event(events: &mut UnboundedReceiver<ServerEvent>, kind: ServerEventKind) -> ServerEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("bus alive");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind:?} event"))
}

async fn spark_event(events: &mut UnboundedReceiver<SparkEvent>, kind: SparkEventKind) -> SparkEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("bus alive");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind:?} event"))
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_connection_announced_after_accept_returns() {
    let server = Server::new();
    let (spark, _adapter) = accept(&server, SparkInfo::new(address()));

    // Subscribing after accept still sees the announcement.
    let mut events = server.subscribe();
    let ServerEvent::Connection(announced) =
        server_event(&mut events, ServerEventKind::Connection).await
    else {
        panic!("expected connection");
    };
    assert_eq!(announced.id(), spark.id());
}

#[tokio::test]
async fn test_ids_unique_across_departures() {
    let server = Server::new();
    let (first, adapter) = accept(&server, SparkInfo::new(address()));
    let first_id = first.id().clone();

    let mut events = server.subscribe();
    adapter.disconnected();
    server_event(&mut events, ServerEventKind::Disconnection).await;
    assert!(server.spark(first_id.as_str()).is_none());

    let (second, _adapter) = accept(&server, SparkInfo::new(address()));
    assert_ne!(second.id(), &first_id);
}

#[tokio::test]
async fn test_supplied_id_not_reused_after_departure() {
    let server = Server::new();
    let (_spark, adapter) = accept(&server, SparkInfo::new(address()).with_id("alpha"));

    let mut events = server.subscribe();
    adapter.disconnected();
    server_event(&mut events, ServerEventKind::Disconnection).await;
    assert!(server.spark("alpha").is_none());

    let (core, _adapter) = transport::link();
    let err = server
        .accept(SparkInfo::new(address()).with_id("alpha"), core)
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateSpark { .. }));
    assert!(server.is_empty());
}

#[tokio::test]
async fn test_handshake_details_exposed() {
    let server = Server::new();
    let info = SparkInfo::new(address())
        .with_header("User-Agent", "probe/1.0")
        .with_query("room", "lobby");
    let (spark, _adapter) = accept(&server, info);

    assert_eq!(spark.address(), address());
    assert_eq!(spark.headers().get("user-agent").map(String::as_str), Some("probe/1.0"));
    assert_eq!(spark.query().get("room").map(String::as_str), Some("lobby"));
}

// ============================================================================
// Messaging
// ============================================================================

#[tokio::test]
async fn test_incoming_data_uses_shared_pipeline() {
    let server = Server::new();
    server.transform(
        Direction::Incoming,
        Transform::sync(|packet| {
            packet.data["via"] = json!("server");
            true
        }),
    );
    let (spark, adapter) = accept(&server, SparkInfo::new(address()));
    let mut events = spark.subscribe();

    adapter.message(r#"{"n":1}"#);
    let SparkEvent::Data { data, raw } = spark_event(&mut events, SparkEventKind::Data).await else {
        panic!("expected data");
    };
    assert_eq!(data, json!({ "n": 1, "via": "server" }));
    assert_eq!(raw, r#"{"n":1}"#);
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let server = Server::new();
    let (spark, mut adapter) = accept(&server, SparkInfo::new(address()));
    let mut events = spark.subscribe();

    adapter.message("\"sparkwire::ping::1700000000000\"");
    assert_eq!(
        directive(&mut adapter).await,
        Directive::Send("\"sparkwire::pong::1700000000000\"".into())
    );
    let SparkEvent::Heartbeat { timestamp } =
        spark_event(&mut events, SparkEventKind::Heartbeat).await
    else {
        panic!("expected heartbeat");
    };
    assert_eq!(timestamp, 1_700_000_000_000);
}

#[tokio::test]
async fn test_id_request_answered() {
    let server = Server::new();
    let (_spark, mut adapter) = accept(&server, SparkInfo::new(address()).with_id("alpha"));

    adapter.message("\"sparkwire::id::\"");
    assert_eq!(
        directive(&mut adapter).await,
        Directive::Send("\"sparkwire::id::alpha\"".into())
    );
}

#[tokio::test]
async fn test_write_all_reaches_every_spark() {
    let server = Server::new();
    let (_a, mut first) = accept(&server, SparkInfo::new(address()));
    let (_b, mut second) = accept(&server, SparkInfo::new(address()));

    assert_eq!(server.write_all(&"hello").expect("broadcast"), 2);
    for adapter in [&mut first, &mut second] {
        assert_eq!(directive(adapter).await, Directive::Send("\"hello\"".into()));
    }
}

#[tokio::test]
async fn test_outgoing_suppression() {
    let server = Server::new();
    server.transform(
        Direction::Outgoing,
        Transform::sync(|packet| packet.data != json!("secret")),
    );
    let (spark, mut adapter) = accept(&server, SparkInfo::new(address()));

    assert_ok!(spark.write(&"secret"));
    assert_ok!(spark.write(&"public"));
    assert_eq!(directive(&mut adapter).await, Directive::Send("\"public\"".into()));
}

// ============================================================================
// End
// ============================================================================

#[tokio::test]
async fn test_end_sends_close_control_then_disconnects() {
    let server = Server::new();
    let (spark, mut adapter) = accept(&server, SparkInfo::new(address()));
    let mut spark_events = spark.subscribe();
    let mut server_events = server.subscribe();

    assert_ok!(spark.end_with(&"bye"));
    spark.end();

    assert_eq!(directive(&mut adapter).await, Directive::Send("\"bye\"".into()));
    assert_eq!(
        directive(&mut adapter).await,
        Directive::Send("\"sparkwire::server::close\"".into())
    );
    assert_eq!(directive(&mut adapter).await, Directive::Disconnect);

    spark_event(&mut spark_events, SparkEventKind::End).await;
    let ServerEvent::Disconnection(id) =
        server_event(&mut server_events, ServerEventKind::Disconnection).await
    else {
        panic!("expected disconnection");
    };
    assert_eq!(&id, spark.id());
    assert!(server.is_empty());
    assert!(!spark.write(&"late").expect("write"));
    assert_eq!(spark.events().listener_count(SparkEventKind::Data), 0);
}

#[tokio::test]
async fn test_destroy_ends_every_spark() {
    let server = Server::new();
    let (_a, mut first) = accept(&server, SparkInfo::new(address()));
    let (_b, mut second) = accept(&server, SparkInfo::new(address()));
    let mut events = server.subscribe();

    server.destroy();
    for adapter in [&mut first, &mut second] {
        assert_eq!(
            directive(adapter).await,
            Directive::Send("\"sparkwire::server::close\"".into())
        );
        assert_eq!(directive(adapter).await, Directive::Disconnect);
    }
    server_event(&mut events, ServerEventKind::Disconnection).await;
    server_event(&mut events, ServerEventKind::Disconnection).await;
    assert!(server.is_empty());
}
