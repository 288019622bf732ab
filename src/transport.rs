//! Datagram I/O beneath listeners and connections.
//!
//! Sessions only ever see a [`Transport`]. [`UdpTransport`] (behind the
//! default `tokio` feature) is the real socket; [`LossyTransport`] wraps any
//! transport to simulate a lossy link.

#[cfg(feature = "tokio")]
use rudp_core::protocol::constants::ABSOLUTE_MAX_PACKET_SIZE;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

/// Result of [`Transport::send_to`]: bytes written.
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

/// Result of [`Transport::recv_from`]: bytes read and the sender.
pub type RecvFuture<'a> =
    Pin<Box<dyn Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a>>;

/// Datagram I/O underneath a [`Listener`](crate::listener::Listener) or a
/// [`Connection`](crate::connection::Connection).
///
/// Each call carries exactly one datagram. Sessions hold the transport as
/// `Arc<dyn Transport>`, so wrappers such as [`LossyTransport`] compose freely.
pub trait Transport: Send + Sync + 'static {
    /// Write one datagram to `target`.
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a>;

    /// Read one datagram into `buf`; returns its length and sender.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// One tokio UDP socket shared by every session of a listener, or owned by
/// a single client connection.
#[cfg(feature = "tokio")]
#[derive(Debug)]
pub struct UdpTransport {
    socket: tokio::net::UdpSocket,
}

#[cfg(feature = "tokio")]
impl UdpTransport {
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Self> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        tracing::debug!(addr = ?socket.local_addr().ok(), "UDP socket bound");
        Ok(Self { socket })
    }
}

#[cfg(feature = "tokio")]
impl Transport for UdpTransport {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a> {
        if buf.len() > ABSOLUTE_MAX_PACKET_SIZE {
            let len = buf.len();
            return Box::pin(async move {
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("datagram of {len} bytes exceeds the UDP payload limit"),
                ))
            });
        }
        Box::pin(self.socket.send_to(buf, target))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a> {
        Box::pin(self.socket.recv_from(buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

// ---------------------------------------------------------------------------
// LossyTransport: drops outgoing datagrams at random
// ---------------------------------------------------------------------------

/// Wraps another transport and silently drops each outgoing datagram with a
/// fixed probability. Dropped sends still report success.
#[derive(Debug)]
pub struct LossyTransport<T> {
    inner: T,
    loss_rate: f32,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, loss_rate: f32) -> Self {
        Self {
            inner,
            loss_rate: loss_rate.clamp(0.0, 1.0),
        }
    }

    pub fn loss_rate(&self) -> f32 {
        self.loss_rate
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a> {
        if rand::random::<f32>() < self.loss_rate {
            tracing::trace!(peer = %target, len = buf.len(), "Simulated loss");
            let len = buf.len();
            return Box::pin(async move { Ok(len) });
        }
        self.inner.send_to(buf, target)
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a> {
        self.inner.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
