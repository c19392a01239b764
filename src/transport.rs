//! # QUIC Endpoint
//!
//! One UDP socket carries both the QUIC endpoint and the hole-punch datagrams,
//! so the NAT binding opened by punching is the one QUIC sessions use.
//!
//! ```text
//!            ┌──────────────┐
//!  punch! ──►│  UdpSocket   │◄── QUIC packets
//!            └──────┬───────┘
//!                   │ (same fd, cloned)
//!           ┌───────┴────────┐
//!           ▼                ▼
//!     quinn::Endpoint   punch sender
//! ```
//!
//! Stray `punch!` datagrams arriving at the endpoint are shorter than any
//! QUIC packet and are discarded by quinn.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, trace};

use crate::crypto::{create_client_config, create_server_config, generate_self_signed_cert, SERVER_NAME};
use crate::message::CONNECTION_TIMEOUT;

/// Payload of a hole-punch datagram.
pub const PUNCH_PAYLOAD: &[u8] = b"punch!";

/// A bound QUIC endpoint plus a handle on its UDP socket for punching.
#[derive(Clone)]
pub struct QuicEndpoint {
    endpoint: quinn::Endpoint,
    punch_socket: Arc<tokio::net::UdpSocket>,
    local_addr: SocketAddr,
}

impl QuicEndpoint {
    /// Binds a UDP socket on `addr`. With `listen` set the endpoint also
    /// accepts inbound sessions; every endpoint can dial.
    pub async fn bind(addr: SocketAddr, listen: bool) -> Result<Self> {
        let socket = UdpSocket::bind(addr).with_context(|| format!("failed to bind udp socket on {}", addr))?;
        let local_addr = socket.local_addr().context("failed to read bound address")?;

        let punch = socket.try_clone().context("failed to clone udp socket")?;
        punch.set_nonblocking(true).context("failed to set udp socket non-blocking")?;
        let punch_socket = Arc::new(tokio::net::UdpSocket::from_std(punch).context("failed to register punch socket")?);

        let server_config = if listen {
            let (certs, key) = generate_self_signed_cert()?;
            Some(create_server_config(certs, key)?)
        } else {
            None
        };

        let runtime = quinn::default_runtime().ok_or_else(|| anyhow!("no async runtime found"))?;
        let mut endpoint = quinn::Endpoint::new(quinn::EndpointConfig::default(), server_config, socket, runtime)
            .context("failed to create quic endpoint")?;
        endpoint.set_default_client_config(create_client_config()?);

        debug!(addr = %local_addr, listen, "quic endpoint bound");
        Ok(Self { endpoint, punch_socket, local_addr })
    }

    /// Binds an ephemeral port on the unspecified address of `remote`'s
    /// family.
    pub async fn bind_for(remote: &SocketAddr, listen: bool) -> Result<Self> {
        Self::bind(SocketAddr::new(unspecified_for(remote), 0), listen).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }

    /// Opens a session to `addr`, bounded by [`CONNECTION_TIMEOUT`].
    pub async fn dial(&self, addr: SocketAddr) -> Result<quinn::Connection> {
        let connecting = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .with_context(|| format!("failed to start connection to {}", addr))?;
        tokio::time::timeout(CONNECTION_TIMEOUT, connecting)
            .await
            .map_err(|_| anyhow!("connection to {} timed out", addr))?
            .with_context(|| format!("failed to connect to {}", addr))
    }

    /// Next inbound handshake, or `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<quinn::Incoming> {
        self.endpoint.accept().await
    }

    /// Sends one punch datagram to each address. Send failures are expected
    /// for unreachable candidates and only traced.
    pub async fn punch(&self, addrs: &[SocketAddr]) {
        for addr in addrs {
            if let Err(e) = self.punch_socket.send_to(PUNCH_PAYLOAD, addr).await {
                trace!(addr = %addr, error = %e, "punch send failed");
            }
        }
    }

    pub fn close(&self, code: u32, reason: &str) {
        self.endpoint.close(quinn::VarInt::from_u32(code), reason.as_bytes());
    }
}

impl std::fmt::Debug for QuicEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicEndpoint").field("local_addr", &self.local_addr).finish()
    }
}

/// Resolves `host:port` to its first socket address.
pub async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("unable to resolve {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("unable to resolve {}", addr))
}

pub fn unspecified_for(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_and_accept_on_loopback() {
        let server = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), true).await.expect("bind failed");
        let client = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), false).await.expect("bind failed");
        let server_addr = server.local_addr();

        let accept = tokio::spawn(async move {
            let incoming = server.accept().await.expect("endpoint closed");
            incoming.await.expect("handshake failed")
        });

        let conn = client.dial(server_addr).await.expect("dial failed");
        let accepted = accept.await.unwrap();
        assert_eq!(conn.remote_address(), server_addr);
        assert_eq!(accepted.remote_address().port(), client.local_addr().port());
    }

    #[tokio::test]
    async fn punch_reaches_plain_socket() {
        let endpoint = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), false).await.expect("bind failed");
        let target = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        endpoint.punch(&[target.local_addr().unwrap()]).await;

        let mut buf = [0u8; 16];
        let (n, from) = target.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], PUNCH_PAYLOAD);
        assert_eq!(from.port(), endpoint.local_addr().port());
    }
}
