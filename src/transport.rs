//! UDP transport: one SIP message per datagram.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::error::{Result, UaError};
use crate::message::SipMessage;

pub const DEFAULT_SIP_PORT: u16 = 5060;
const MAX_DATAGRAM: usize = 4096;

/// Outbound half of the transport, shared by registration and calls
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message; fails with `UaError::Network` if it cannot leave
    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()>;

    /// Address advertised in Via and Contact
    fn local_addr(&self) -> SocketAddr;
}

/// Inbound item: a decoded message and its sender, or why it was not one
pub type Incoming = Result<(SipMessage, SocketAddr)>;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    advertised: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| UaError::network(format!("Failed to create UDP socket: {}", e)))?;
        let bound = socket
            .local_addr()
            .map_err(|e| UaError::network(format!("Failed to get local address: {}", e)))?;

        let ip = if bound.ip().is_unspecified() {
            outbound_ip().unwrap_or(bound.ip())
        } else {
            bound.ip()
        };
        let advertised = SocketAddr::new(ip, bound.port());

        info!(%bound, %advertised, "SIP transport bound");

        Ok(Self {
            socket: Arc::new(socket),
            advertised,
        })
    }

    /// Lazy, endless stream of inbound datagrams.
    ///
    /// Undecodable datagrams come out as `Err` items and the stream keeps
    /// going. Each call starts a fresh stream over the same socket.
    pub fn incoming(&self) -> BoxStream<'static, Incoming> {
        stream::unfold(self.socket.clone(), |socket| async move {
            let item = recv_one(&socket).await;
            Some((item, socket))
        })
        .boxed()
    }
}

async fn recv_one(socket: &UdpSocket) -> Incoming {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (size, from) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| UaError::network(format!("Socket error: {}", e)))?;
        let text = String::from_utf8_lossy(&buf[..size]);
        if text.trim().is_empty() {
            // CRLF keep-alive
            continue;
        }
        debug!(%from, size, "received datagram");
        return SipMessage::parse(&text).map(|message| (message, from));
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        let text = message.render();
        let sent = self
            .socket
            .send_to(text.as_bytes(), destination)
            .await
            .map_err(|e| {
                UaError::network(format!("Failed to send {} to {}: {}", message.summary(), destination, e))
            })?;
        debug!(%destination, sent, "sent {}", message.summary());
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.advertised
    }
}

// The routing table picks the interface a public destination would use;
// nothing is actually sent.
fn outbound_ip() -> Option<IpAddr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("8.8.8.8:80").ok()?;
    probe.local_addr().ok().map(|addr| addr.ip())
}

/// Resolves `host`, `host:port` or a literal socket address
pub async fn resolve(server: &str) -> Result<SocketAddr> {
    let server = server.trim().trim_start_matches("sip:");
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_SIP_PORT));
    }

    let (host, port) = match server.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| UaError::network(format!("Invalid port in {}", server)))?;
            (host, port)
        }
        None => (server, DEFAULT_SIP_PORT),
    };

    debug!(host, port, "performing DNS lookup");
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| UaError::network(format!("DNS lookup failed for {}: {}", host, e)))?;
    addrs
        .next()
        .ok_or_else(|| UaError::network(format!("No addresses found for {}", host)))
}
