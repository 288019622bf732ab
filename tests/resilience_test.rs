//! Resilience over real sockets: simulated packet loss, concurrent clients,
//! large messages and custom transports.

mod common;

use common::{connect, echo_server, init_tracing, payload, recv_within};
use rudp_tokio::rudp_core::Counter;
use rudp_tokio::{
    ChannelDispatcher, Collaborators, Connection, Listener, LossyTransport, TransportConfig,
    UdpTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const LOSSY_LIMIT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_lossy_link_delivers_everything_in_order() {
    init_tracing();
    let listener = echo_server(TransportConfig::testing(0.2), None).await;
    let mut client = connect(&listener, TransportConfig::testing(0.2)).await;

    let sizes: Vec<usize> = (0..50).map(|i| 1 + (i * 997) % 6000).collect();
    for (opcode, len) in sizes.iter().enumerate() {
        client
            .send(0, opcode as u16, payload(opcode as u32, *len))
            .await
            .unwrap();
    }

    for (opcode, len) in sizes.iter().enumerate() {
        let echo = recv_within(&mut client, LOSSY_LIMIT).await;
        assert_eq!(echo.opcode, opcode as u16);
        assert_eq!(echo.payload.as_ref(), payload(opcode as u32, *len).as_slice());
    }

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.messages_received, sizes.len() as u64);
    assert!(stats.retransmit_requests_sent > 0 || stats.retransmits_served > 0);
}

#[tokio::test]
async fn test_large_message_over_lossy_link() {
    init_tracing();
    let listener = echo_server(TransportConfig::testing(0.1), None).await;
    let mut client = connect(&listener, TransportConfig::testing(0.1)).await;

    let data = payload(99, 100_000);
    client.send(2, 77, data.clone()).await.unwrap();

    let echo = recv_within(&mut client, LOSSY_LIMIT).await;
    assert_eq!(echo.group, 2);
    assert_eq!(echo.payload.as_ref(), data.as_slice());

    let server = listener.metrics().snapshot();
    assert!(server.get(Counter::RetransmitRequestsSent) + server.get(Counter::RetransmitsServed) > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients() {
    init_tracing();
    let listener = echo_server(TransportConfig::default(), None).await;

    let mut clients = Vec::new();
    for id in 0..8u32 {
        let addr = listener.local_addr();
        clients.push(tokio::spawn(async move {
            let mut client = Connection::connect(addr, format!("client-{id}"), TransportConfig::default())
                .await
                .expect("Connect failed");
            for opcode in 0..20u16 {
                client
                    .send(1, opcode, payload(id * 100 + opcode as u32, 2500))
                    .await
                    .unwrap();
            }
            for opcode in 0..20u16 {
                let echo = recv_within(&mut client, Duration::from_secs(10)).await;
                assert_eq!(echo.opcode, opcode);
                assert_eq!(
                    echo.payload.as_ref(),
                    payload(id * 100 + opcode as u32, 2500).as_slice()
                );
            }
            client
        }));
    }

    let mut connected = Vec::new();
    for handle in clients {
        connected.push(
            timeout(Duration::from_secs(20), handle)
                .await
                .expect("Client timeout")
                .expect("Client task panicked"),
        );
    }
    assert_eq!(listener.session_count(), 8);
    assert_eq!(listener.metrics().active_sessions(), 8);
}

#[tokio::test]
async fn test_custom_transport() {
    init_tracing();
    let (dispatcher, mut deliveries) = ChannelDispatcher::new(64);
    let server_transport = Arc::new(LossyTransport::new(
        UdpTransport::bind("127.0.0.1:0").await.unwrap(),
        0.0,
    ));
    let listener = Listener::with_transport(
        server_transport,
        TransportConfig::default(),
        Collaborators::new(Arc::new(dispatcher)),
    )
    .unwrap();

    let client_transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await.unwrap());
    let client = Connection::with_transport(
        client_transport,
        listener.local_addr(),
        "custom",
        TransportConfig::default(),
    )
    .await
    .unwrap();

    client.send(4, 4, "over a custom transport").await.unwrap();
    let delivery = timeout(Duration::from_secs(5), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.peer, client.local_addr());
    assert_eq!(delivery.payload.as_ref(), b"over a custom transport");
}

#[tokio::test]
async fn test_low_priority_group_dropped_under_backpressure() {
    init_tracing();
    let (dispatcher, mut deliveries) = ChannelDispatcher::new(1024);
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        TransportConfig::default(),
        Collaborators::new(Arc::new(dispatcher)),
    )
    .await
    .unwrap();

    // Tiny window and queue so messages pile up behind the first one
    let config = TransportConfig::default()
        .send_window(1)
        .outbound_queue_limit(4);
    let client = Connection::connect(listener.local_addr(), "pressure", config)
        .await
        .unwrap();

    // Low priority first, then the urgent tail that must displace it
    let mut refused = 0;
    for opcode in 0..12u16 {
        let group = if opcode < 8 { 9 } else { 0 };
        if client.send(group, opcode, "x").await.is_err() {
            refused += 1;
        }
    }

    let stats = client.stats().await.unwrap();
    assert!(refused + stats.outbound_dropped > 0);

    // Every group-0 message still arrives
    let mut high_priority = Vec::new();
    while let Ok(Some(delivery)) = timeout(Duration::from_secs(2), deliveries.recv()).await {
        if delivery.group == 0 {
            high_priority.push(delivery.opcode);
        }
        if high_priority.len() == 4 {
            break;
        }
    }
    assert_eq!(high_priority, vec![8, 9, 10, 11]);
}
