//! Connection teardown, timeouts, cancellation and the handshake.

mod common;

use common::{client, config, counter, eventually, ping_pong, serving};
use std::time::Duration;
use tether_types::{DynamicValue, EndpointConfig, Error};
use tether_wire::message::{decode_message, encode_message, HandshakeMessage, Identity};
use tether_wire::{ConnectionState, Endpoint, EndpointEventKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn sleep_args(ms: i32) -> Vec<DynamicValue> {
    vec![DynamicValue::Int32(ms)]
}

#[tokio::test]
async fn test_close_rejects_every_pending_call() {
    let (server, url) = serving(config("server")).await;
    server.register_object("counter", &counter()).unwrap();
    let (_client, conn) = client("client", &url).await;
    let proxy = conn.get_object("counter").await.unwrap();

    let calls: Vec<_> = (0..5)
        .map(|_| proxy.call_named("sleep", sleep_args(5_000)))
        .collect();
    assert!(common::eventually(|| conn.pending_count() == 5).await);

    conn.close();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.pending_count(), 0);
    for call in calls {
        assert!(matches!(call.await, Err(Error::ConnectionClosed)));
    }

    // Later calls through the dead proxy fail at once.
    let late = proxy.call_named("sleep", sleep_args(1)).await;
    assert!(matches!(late, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_peer_shutdown_rejects_pending_calls() {
    let (server, url) = serving(config("server")).await;
    server.register_object("counter", &counter()).unwrap();
    let (_client, conn) = client("client", &url).await;
    let proxy = conn.get_object("counter").await.unwrap();

    let call = proxy.call_named("sleep", sleep_args(5_000));
    assert!(eventually(|| server.connections().len() == 1).await);
    server.close();

    let outcome = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("pending call must settle when the peer goes away");
    assert!(matches!(outcome, Err(Error::ConnectionClosed)));
    assert!(eventually(|| !conn.is_connected()).await);
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_dropped() {
    let (server, url) = serving(config("server")).await;
    server.register_object("counter", &counter()).unwrap();
    let client_ep = Endpoint::new(EndpointConfig {
        call_timeout_ms: Some(50),
        ..config("client")
    });
    let conn = client_ep.connect(&url).await.unwrap();
    let proxy = conn.get_object("counter").await.unwrap();

    let slow = proxy.call_named("sleep", sleep_args(300)).await;
    assert!(matches!(slow, Err(Error::TimedOut)));

    // Let the late reply arrive; it must not disturb the connection.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(conn.is_connected());
    let sum: i32 = proxy
        .call_typed("add", vec![DynamicValue::Int32(20), DynamicValue::Int32(22)])
        .await
        .unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn test_reconnect_after_close_settles_fresh_calls() {
    let (server, url) = serving(config("server")).await;
    server.register_object("counter", &counter()).unwrap();
    let client_ep = Endpoint::new(config("client"));

    let first = client_ep.connect(&url).await.unwrap();
    let proxy = first.get_object("counter").await.unwrap();
    let stale: Vec<_> = [200, 210, 220]
        .into_iter()
        .map(|ms| proxy.call_named("sleep", sleep_args(ms)))
        .collect();
    assert!(eventually(|| first.pending_count() == 3).await);
    first.close();
    for call in stale {
        assert!(matches!(call.await, Err(Error::ConnectionClosed)));
    }

    let second = client_ep.connect(&url).await.unwrap();
    assert_ne!(second.id(), first.id());
    let proxy = second.get_object("counter").await.unwrap();
    let calls: Vec<_> = [30, 40, 50]
        .into_iter()
        .map(|ms| proxy.call_named("sleep", sleep_args(ms)))
        .collect();
    let sum = proxy.call_typed::<i32>("add", vec![DynamicValue::Int32(1), DynamicValue::Int32(2)]);
    for (call, ms) in calls.into_iter().zip([30, 40, 50]) {
        assert_eq!(call.await.unwrap(), DynamicValue::Int32(ms));
    }
    assert_eq!(sum.await.unwrap(), 3);

    // Outlive the server's work on the closed connection.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let again: i32 = proxy
        .call_typed("add", vec![DynamicValue::Int32(4), DynamicValue::Int32(5)])
        .await
        .unwrap();
    assert_eq!(again, 9);
    assert_eq!(second.pending_count(), 0);
}

#[tokio::test]
async fn test_late_replies_never_settle_newer_calls() {
    let (server, url) = serving(config("server")).await;
    server.register_object("counter", &counter()).unwrap();
    let client_ep = Endpoint::new(EndpointConfig {
        call_timeout_ms: Some(250),
        ..config("client")
    });
    let conn = client_ep.connect(&url).await.unwrap();
    let proxy = conn.get_object("counter").await.unwrap();

    let timed_out: Vec<_> = (0..3)
        .map(|_| proxy.call_named("sleep", sleep_args(350)))
        .collect();
    for call in timed_out {
        assert!(matches!(call.await, Err(Error::TimedOut)));
    }

    // Still in flight when the timed-out replies come back.
    let fresh: Vec<_> = [150, 160, 170]
        .into_iter()
        .map(|ms| proxy.call_named("sleep", sleep_args(ms)))
        .collect();
    for (call, ms) in fresh.into_iter().zip([150, 160, 170]) {
        assert_eq!(call.await.unwrap(), DynamicValue::Int32(ms));
    }
    assert!(conn.is_connected());
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn test_cancel_aborts_remote_call() {
    let (server, url) = serving(config("server")).await;
    server.register_object("counter", &counter()).unwrap();
    let (_client, conn) = client("client", &url).await;
    let proxy = conn.get_object("counter").await.unwrap();

    let call = proxy.call_named("sleep", sleep_args(10_000));
    tokio::time::sleep(Duration::from_millis(50)).await;
    call.cancel_request();

    let outcome = tokio::time::timeout(Duration::from_secs(5), call.clone())
        .await
        .expect("cancel must settle the call");
    assert!(matches!(outcome, Err(Error::Canceled)));
    assert!(call.is_canceled());
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn test_anonymous_exports_released_on_close() {
    let (server, url) = serving(config("server")).await;
    server.register_object("pingpong", &ping_pong()).unwrap();
    let (client_ep, conn) = client("client", &url).await;
    let remote = conn.get_object("pingpong").await.unwrap();

    remote
        .call_named("give", vec![DynamicValue::from(counter())])
        .await
        .unwrap();
    assert_eq!(client_ep.registry().export_count(), 1);

    conn.close();
    assert_eq!(client_ep.registry().export_count(), 0);
    assert!(client_ep.connections().is_empty());
}

#[tokio::test]
async fn test_duplex_stream_connection() {
    let a = Endpoint::new(config("a"));
    let b = Endpoint::new(config("b"));
    b.register_object("counter", &counter()).unwrap();

    let (left, right) = tokio::io::duplex(64 * 1024);
    let (a_conn, b_conn) = tokio::join!(a.connect_stream(left), b.accept_stream(right));
    let a_conn = a_conn.unwrap();
    let b_conn = b_conn.unwrap();
    assert_eq!(a_conn.peer().unwrap().endpoint_id, b.id());
    assert_eq!(b_conn.peer().unwrap().endpoint_id, a.id());

    let proxy = a_conn.get_object("counter").await.unwrap();
    let sum: i32 = proxy
        .call_typed("add", vec![DynamicValue::Int32(1), DynamicValue::Int32(1)])
        .await
        .unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn test_connection_events_published() {
    let (server, url) = serving(config("server")).await;
    let mut events = server.subscribe_events();
    let (_client, conn) = client("client", &url).await;

    let opened = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        opened.kind,
        EndpointEventKind::ConnectionOpened { ref peer_name, .. } if peer_name == "client"
    ));

    conn.close();
    let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(closed.kind, EndpointEventKind::ConnectionClosed { .. }));
}

#[tokio::test]
async fn test_matching_secrets_connect() {
    let secret = Some("s3cret".to_string());
    let (_server, url) = serving(EndpointConfig {
        shared_secret: secret.clone(),
        ..config("server")
    })
    .await;
    let client_ep = Endpoint::new(EndpointConfig {
        shared_secret: secret,
        ..config("client")
    });
    let conn = client_ep.connect(&url).await;
    tokio_test::assert_ok!(&conn);
}

#[tokio::test]
async fn test_secret_mismatch_refused() {
    let (server, url) = serving(EndpointConfig {
        shared_secret: Some("right".into()),
        ..config("server")
    })
    .await;

    let wrong = Endpoint::new(EndpointConfig {
        shared_secret: Some("wrong".into()),
        ..config("wrong")
    });
    assert!(matches!(wrong.connect(&url).await, Err(Error::HandshakeFailed(_))));

    let anonymous = Endpoint::new(config("anonymous"));
    assert!(matches!(
        anonymous.connect(&url).await,
        Err(Error::HandshakeFailed(_))
    ));
    assert!(server.connections().is_empty());
}

async fn raw_handshake(url: &str, identity: Identity) -> (TcpStream, HandshakeMessage) {
    let addr = url.trim_start_matches("tcp://");
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let hello = encode_message(&HandshakeMessage::Hello(identity)).unwrap();
    stream.write_all(&hello).await.unwrap();
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut body).await.unwrap();
    (stream, decode_message(&body).unwrap())
}

#[tokio::test]
async fn test_version_mismatch_refused() {
    let (server, url) = serving(config("server")).await;
    let mut identity = Identity::local(Default::default(), "future", None);
    identity.protocol_version = 99;

    let (_stream, answer) = raw_handshake(&url, identity).await;
    match answer {
        HandshakeMessage::Refused { code, message } => {
            assert_eq!(code, 426);
            assert!(message.contains("99"));
        }
        other => panic!("expected a refusal, got {other:?}"),
    }
    assert!(server.connections().is_empty());
}

#[tokio::test]
async fn test_malformed_frame_closes_only_that_connection() {
    let (server, url) = serving(config("server")).await;
    server.register_object("counter", &counter()).unwrap();
    let (_client, good) = client("good", &url).await;

    let identity = Identity::local(Default::default(), "raw", None);
    let (mut raw, answer) = raw_handshake(&url, identity).await;
    assert!(matches!(answer, HandshakeMessage::Welcome(_)));
    assert!(eventually(|| server.connections().len() == 2).await);

    // Unknown frame kind.
    raw.write_all(&[0, 0, 0, 9, 0xEE, 1, 0, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), raw.read_to_end(&mut rest)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    assert!(eventually(|| server.connections().len() == 1).await);

    let proxy = good.get_object("counter").await.unwrap();
    let sum: i32 = proxy
        .call_typed("add", vec![DynamicValue::Int32(3), DynamicValue::Int32(4)])
        .await
        .unwrap();
    assert_eq!(sum, 7);
}
