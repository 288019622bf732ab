//! Echo server: every logical message is sent back to its session with the
//! same group and opcode.
//!
//! ```text
//! RUST_LOG=info cargo run --example echo_server -- 127.0.0.1:9000
//! ```

use rudp_tokio::{format_metrics, ChannelDispatcher, Collaborators, Listener, TransportConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string())
        .parse()?;

    let (dispatcher, mut deliveries) = ChannelDispatcher::new(4096);
    let listener = Arc::new(
        Listener::bind(
            addr,
            TransportConfig::gaming(),
            Collaborators::new(Arc::new(dispatcher)),
        )
        .await?,
    );
    info!(addr = %listener.local_addr(), "Echo server ready");

    let reporter = listener.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            info!("\n{}", format_metrics(&reporter.metrics().snapshot()));
        }
    });

    while let Some(delivery) = deliveries.recv().await {
        let len = delivery.payload.len();
        if let Err(e) = listener
            .send(delivery.session, delivery.group, delivery.opcode, delivery.payload)
            .await
        {
            warn!(session = delivery.session, error = %e, "Echo failed");
        } else {
            info!(
                session = delivery.session,
                peer = %delivery.peer,
                opcode = delivery.opcode,
                len,
                "Echoed"
            );
        }
    }

    Ok(())
}
