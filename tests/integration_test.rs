//! Loopback tests for the listener, client connection and session actors

mod common;

use bytes::Bytes;
use common::{connect, echo_server, eventually, init_tracing, payload, recv_within};
use rudp_tokio::rudp_core::Counter;
use rudp_tokio::{
    AuthDecision, Authenticator, ChannelDispatcher, Collaborators, Connection, ConnectionError,
    DisconnectReason, Listener, SessionState, TransportConfig, TransportError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const RECV_LIMIT: Duration = Duration::from_secs(5);

/// Admits only one login payload
struct SharedSecret(&'static [u8]);

impl Authenticator for SharedSecret {
    fn authenticate(
        &self,
        _peer: SocketAddr,
        login: Bytes,
    ) -> rudp_tokio::dispatch::AuthFuture<'_> {
        let decision = if login.as_ref() == self.0 {
            AuthDecision::Accept
        } else {
            AuthDecision::Reject
        };
        Box::pin(async move { decision })
    }
}

#[tokio::test]
async fn test_login_and_echo() {
    init_tracing();
    let listener = echo_server(TransportConfig::default(), None).await;
    let mut client = connect(&listener, TransportConfig::default()).await;
    assert_eq!(client.state(), SessionState::Connected);

    client.send(3, 42, "Hello, listener!").await.unwrap();
    let echo = recv_within(&mut client, RECV_LIMIT).await;
    assert_eq!(echo.group, 3);
    assert_eq!(echo.opcode, 42);
    assert_eq!(echo.payload, Bytes::from_static(b"Hello, listener!"));
    assert_eq!(listener.session_count(), 1);
}

#[tokio::test]
async fn test_large_message_echo() {
    init_tracing();
    let listener = echo_server(TransportConfig::default(), None).await;
    let mut client = connect(&listener, TransportConfig::default()).await;

    let data = payload(7, 200_000);
    client.send(0, 1, data.clone()).await.unwrap();

    let echo = recv_within(&mut client, RECV_LIMIT).await;
    assert_eq!(echo.payload.len(), data.len());
    assert_eq!(echo.payload.as_ref(), data.as_slice());
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    init_tracing();
    let listener = echo_server(TransportConfig::default(), None).await;
    let mut client = connect(&listener, TransportConfig::default()).await;

    for opcode in 0..200u16 {
        let len = 10 + (opcode as usize * 37) % 3000;
        client
            .send(1, opcode, payload(opcode as u32, len))
            .await
            .unwrap();
    }

    for opcode in 0..200u16 {
        let echo = recv_within(&mut client, RECV_LIMIT).await;
        assert_eq!(echo.opcode, opcode);
        assert_eq!(echo.payload.len(), 10 + (opcode as usize * 37) % 3000);
    }
}

#[tokio::test]
async fn test_session_stats_and_metrics() {
    init_tracing();
    let listener = echo_server(TransportConfig::default(), None).await;
    let mut client = connect(&listener, TransportConfig::default()).await;

    client.send(0, 5, "ping").await.unwrap();
    let echo = recv_within(&mut client, RECV_LIMIT).await;

    let client_stats = client.stats().await.unwrap();
    assert_eq!(client_stats.messages_sent, 1);
    assert_eq!(client_stats.messages_received, 1);

    assert_eq!(echo.session, client.id());

    // Ids start at 1 on a fresh listener
    let status = listener.session_status(1).expect("Session 1 exists");
    assert_eq!(status.state, SessionState::Connected);
    let server_stats = listener.session_stats(1).await.unwrap();
    assert_eq!(server_stats.messages_received, 1);
    assert_eq!(server_stats.messages_sent, 1);

    let snapshot = listener.metrics().snapshot();
    assert_eq!(snapshot.active_sessions, 1);
    assert_eq!(snapshot.get(Counter::SessionsOpened), 1);
    assert!(snapshot.get(Counter::PacketsReceived) >= 2);
}

#[tokio::test]
async fn test_login_rejected() {
    init_tracing();
    let listener = echo_server(
        TransportConfig::default(),
        Some(Arc::new(SharedSecret(b"open sesame"))),
    )
    .await;

    let err = Connection::connect(listener.local_addr(), "guess", TransportConfig::default())
        .await
        .err()
        .expect("Login should be refused");
    assert!(err.is_connection_error());
    assert!(matches!(
        err,
        TransportError::Connection {
            kind: ConnectionError::Rejected
        }
    ));

    let client = Connection::connect(listener.local_addr(), "open sesame", TransportConfig::default())
        .await
        .unwrap();
    assert_eq!(client.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_login_timeout_without_listener() {
    init_tracing();
    // Bound but never answers
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = TransportConfig::default().connect_timeout(Duration::from_millis(300));

    let err = Connection::connect(silent.local_addr().unwrap(), "hello", config)
        .await
        .err()
        .expect("Nobody answers");
    assert!(matches!(
        err,
        TransportError::Connection {
            kind: ConnectionError::LoginTimeout
        }
    ));
}

#[tokio::test]
async fn test_listener_disconnects_session() {
    init_tracing();
    let listener = echo_server(TransportConfig::default(), None).await;
    let mut client = connect(&listener, TransportConfig::default()).await;

    client.send(0, 1, "hi").await.unwrap();
    let echo = recv_within(&mut client, RECV_LIMIT).await;

    listener.disconnect(echo.session).unwrap();

    // Delivery channel closes once the client session is released
    let end = tokio::time::timeout(RECV_LIMIT, client.recv()).await.unwrap();
    assert!(end.is_none());
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::PeerRequested));

    assert!(eventually(RECV_LIMIT, || listener.session_count() == 0).await);
    assert!(matches!(
        listener.send(echo.session, 0, 1, "late").await,
        Err(TransportError::UnknownSession { .. })
    ));
}

#[tokio::test]
async fn test_client_close_releases_server_session() {
    init_tracing();
    let listener = echo_server(TransportConfig::default(), None).await;
    let client = connect(&listener, TransportConfig::default()).await;
    assert_eq!(listener.session_count(), 1);

    let status = client.close().await;
    assert_eq!(status.state, SessionState::Closed);
    assert_eq!(status.reason, Some(DisconnectReason::Local));

    assert!(eventually(RECV_LIMIT, || listener.session_count() == 0).await);
    assert_eq!(listener.metrics().active_sessions(), 0);
}

#[tokio::test]
async fn test_reconnect_after_close() {
    init_tracing();
    let listener = echo_server(TransportConfig::default(), None).await;
    let first = connect(&listener, TransportConfig::default()).await;
    first.close().await;
    assert!(eventually(RECV_LIMIT, || listener.session_count() == 0).await);

    let mut second = connect(&listener, TransportConfig::default()).await;
    second.send(0, 9, "again").await.unwrap();
    assert_eq!(recv_within(&mut second, RECV_LIMIT).await.opcode, 9);
}

#[tokio::test]
async fn test_unknown_session() {
    let listener = echo_server(TransportConfig::default(), None).await;
    let err = listener.send(999, 0, 0, "nobody").await.unwrap_err();
    assert!(matches!(err, TransportError::UnknownSession { id: 999 }));
    assert!(listener.disconnect(999).is_err());
}

#[tokio::test]
async fn test_invalid_datagrams_are_counted_not_served() {
    init_tracing();
    let listener = echo_server(TransportConfig::default(), None).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    raw.send_to(b"not a packet at all, just noise", listener.local_addr())
        .await
        .unwrap();
    raw.send_to(b"tiny", listener.local_addr()).await.unwrap();

    let metrics = listener.metrics().clone();
    assert!(
        eventually(RECV_LIMIT, || {
            let snapshot = metrics.snapshot();
            snapshot.get(Counter::ChecksumFailures) + snapshot.get(Counter::MalformedPackets) == 2
        })
        .await
    );
    assert_eq!(listener.session_count(), 0);

    // The listener keeps serving
    let mut client = connect(&listener, TransportConfig::default()).await;
    client.send(0, 1, "still here").await.unwrap();
    recv_within(&mut client, RECV_LIMIT).await;
}

#[tokio::test]
async fn test_bind_conflict_is_reported() {
    let (dispatcher, _deliveries) = ChannelDispatcher::new(16);
    let first = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        TransportConfig::default(),
        Collaborators::new(Arc::new(dispatcher.clone())),
    )
    .await
    .unwrap();

    let err = Listener::bind(
        first.local_addr(),
        TransportConfig::default(),
        Collaborators::new(Arc::new(dispatcher)),
    )
    .await
    .err()
    .expect("Address in use");
    assert!(matches!(err, TransportError::Bind { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let (dispatcher, _deliveries) = ChannelDispatcher::new(16);
    let config = TransportConfig::default().max_packet_size(10);
    let err = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        config,
        Collaborators::new(Arc::new(dispatcher)),
    )
    .await
    .err()
    .expect("Packet size below minimum");
    assert!(matches!(err, TransportError::Config { .. }));
}
