//! Shared helpers for the loopback integration tests

#![allow(dead_code)]

use rudp_tokio::{
    Authenticator, ChannelDispatcher, Collaborators, Connection, Delivery, Listener,
    TransportConfig,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::timeout;

/// Route test logs through `RUST_LOG`; repeated calls are harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Listener on an ephemeral loopback port that sends every message back to
/// its session with the same group and opcode.
pub async fn echo_server(
    config: TransportConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
) -> Arc<Listener> {
    let (dispatcher, mut deliveries) = ChannelDispatcher::new(4096);
    let mut collaborators = Collaborators::new(Arc::new(dispatcher));
    if let Some(authenticator) = authenticator {
        collaborators = collaborators.authenticator(authenticator);
    }

    let listener = Arc::new(
        Listener::bind("127.0.0.1:0".parse().unwrap(), config, collaborators)
            .await
            .expect("Failed to bind"),
    );

    let weak: Weak<Listener> = Arc::downgrade(&listener);
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let Some(listener) = weak.upgrade() else { break };
            let _ = listener
                .send(delivery.session, delivery.group, delivery.opcode, delivery.payload)
                .await;
        }
    });

    listener
}

pub async fn connect(listener: &Listener, config: TransportConfig) -> Connection {
    timeout(
        Duration::from_secs(10),
        Connection::connect(listener.local_addr(), "test-login", config),
    )
    .await
    .expect("Connect timeout")
    .expect("Connect failed")
}

pub async fn recv_within(client: &mut Connection, limit: Duration) -> Delivery {
    timeout(limit, client.recv())
        .await
        .expect("Receive timeout")
        .expect("Session closed")
}

/// Poll `condition` every 10ms until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Deterministic payload of `len` bytes, distinct per `seed`
pub fn payload(seed: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed) as u8)
        .collect()
}
