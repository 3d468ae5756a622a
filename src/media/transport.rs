//! UDP transport connections.
//!
//! A [`Connection`] is the primary path: every datagram is a framed control
//! message (see [`wire`]). A [`FallbackConnection`] carries raw, unframed
//! payloads. A session owns one [`MediaLink`] holding an optional primary
//! and exactly one fallback.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tokio::time;

use super::wire::{self, MessageType, ProtocolError, BUFFER_CAPACITY};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind local endpoint: {0}")]
    Bind(#[source] std::io::Error),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to generate connection id: {0}")]
    Random(getrandom::Error),
}

/// Outcome of a bounded receive on a framed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message { kind: MessageType, payload: Vec<u8> },
    NoData,
}

/// Resolve `host:port`, falling back to the unspecified address.
///
/// Resolution failure is not fatal: the connection is still created and
/// sends go to `0.0.0.0:port`.
pub async fn resolve_peer(host: &str, port: u16) -> SocketAddr {
    match lookup_host((host, port)).await {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                return addr;
            }
            tracing::warn!("No IPv4 address for {}, using wildcard peer", host);
        }
        Err(e) => {
            tracing::warn!("Could not resolve {}:{} ({}), using wildcard peer", host, port, e);
        }
    }
    SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)
}

/// Bound UDP socket plus the receive buffer shared by both connection kinds.
struct Endpoint {
    socket: UdpSocket,
    peer: SocketAddr,
    connection_id: u32,
    recv_buf: Mutex<Vec<u8>>,
}

impl Endpoint {
    async fn bind(peer: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(TransportError::Bind)?;
        // try_send_to reports WouldBlock until the reactor has seen the
        // socket writable once.
        socket.writable().await.map_err(TransportError::Bind)?;
        let connection_id = super::random_u32().map_err(TransportError::Random)?;

        Ok(Self {
            socket,
            peer,
            connection_id,
            recv_buf: Mutex::new(vec![0u8; BUFFER_CAPACITY]),
        })
    }

    fn send(&self, datagram: &[u8]) -> Result<usize, TransportError> {
        Ok(self.socket.try_send_to(datagram, self.peer)?)
    }

    /// Wait up to `timeout` for one datagram and hand its bytes to `f`.
    async fn recv_with<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&[u8]) -> T,
    ) -> Result<Option<T>, TransportError> {
        let mut buf = self.recv_buf.lock().await;
        match time::timeout(timeout, self.socket.recv_from(&mut buf[..])).await {
            Err(_) => Ok(None),
            Ok(Ok((len, from))) => {
                tracing::trace!(
                    "conn {:08x}: {} bytes from {}",
                    self.connection_id,
                    len,
                    from
                );
                Ok(Some(f(&buf[..len])))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

/// Primary framed connection.
pub struct Connection {
    endpoint: Endpoint,
    connected: AtomicBool,
}

impl Connection {
    /// Bind an ephemeral endpoint for `peer_host:peer_port`.
    ///
    /// No handshake happens here; the connection starts disconnected.
    pub async fn create(peer_host: &str, peer_port: u16) -> Result<Self, TransportError> {
        let peer = resolve_peer(peer_host, peer_port).await;
        Self::bind(peer).await
    }

    pub async fn bind(peer: SocketAddr) -> Result<Self, TransportError> {
        let endpoint = Endpoint::bind(peer).await?;
        tracing::debug!(
            "Primary connection {:08x} bound to {} (peer {})",
            endpoint.connection_id,
            endpoint.local_addr()?,
            peer
        );
        Ok(Self {
            endpoint,
            connected: AtomicBool::new(false),
        })
    }

    /// Frame and send one control message. Non-blocking, never retried.
    pub fn send(&self, kind: MessageType, payload: &[u8]) -> Result<(), TransportError> {
        let datagram = wire::encode_control_message(kind, payload)?;
        self.endpoint.send(&datagram)?;
        Ok(())
    }

    /// Wait up to `timeout` for one framed message.
    pub async fn receive(&self, timeout: Duration) -> Result<Received, TransportError> {
        let decoded = self
            .endpoint
            .recv_with(timeout, |data| {
                wire::decode_control_message(data).map(|m| Received::Message {
                    kind: m.kind,
                    payload: m.payload.to_vec(),
                })
            })
            .await?;
        match decoded {
            None => Ok(Received::NoData),
            Some(result) => Ok(result?),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record the connection state. Returns the previous value.
    pub fn set_connected(&self, connected: bool) -> bool {
        self.connected.swap(connected, Ordering::AcqRel)
    }

    pub fn connection_id(&self) -> u32 {
        self.endpoint.connection_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.endpoint.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.endpoint.local_addr()
    }
}

/// Plain best-effort datagram connection without the control envelope.
pub struct FallbackConnection {
    endpoint: Endpoint,
}

impl FallbackConnection {
    pub async fn create(peer_host: &str, peer_port: u16) -> Result<Self, TransportError> {
        let peer = resolve_peer(peer_host, peer_port).await;
        Self::bind(peer).await
    }

    pub async fn bind(peer: SocketAddr) -> Result<Self, TransportError> {
        let endpoint = Endpoint::bind(peer).await?;
        tracing::debug!(
            "Fallback connection {:08x} bound to {} (peer {})",
            endpoint.connection_id,
            endpoint.local_addr()?,
            peer
        );
        Ok(Self { endpoint })
    }

    pub fn send_raw(&self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > BUFFER_CAPACITY {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                capacity: BUFFER_CAPACITY,
            }
            .into());
        }
        self.endpoint.send(payload)?;
        Ok(())
    }

    /// Wait up to `timeout` for one raw datagram. `None` means no data.
    pub async fn receive_raw(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        self.endpoint.recv_with(timeout, |data| data.to_vec()).await
    }

    pub fn connection_id(&self) -> u32 {
        self.endpoint.connection_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.endpoint.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.endpoint.local_addr()
    }
}

/// What one poll of a [`MediaLink`] produced.
#[derive(Debug)]
pub enum Inbound {
    Primary(Result<Received, TransportError>),
    Fallback(Result<Option<Vec<u8>>, TransportError>),
}

/// The transport pair owned by one session.
pub struct MediaLink {
    pub primary: Option<Connection>,
    pub fallback: FallbackConnection,
}

impl MediaLink {
    /// Open the fallback and try the primary.
    ///
    /// A primary that cannot be created is logged and skipped; a fallback
    /// that cannot be bound fails the whole link.
    pub async fn open(peer_host: &str, peer_port: u16) -> Result<Self, TransportError> {
        let peer = resolve_peer(peer_host, peer_port).await;

        let primary = match Connection::bind(peer).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(
                    "Primary transport to {} unavailable ({}), degrading to raw datagrams",
                    peer,
                    e
                );
                None
            }
        };
        let fallback = FallbackConnection::bind(peer).await?;

        Ok(Self { primary, fallback })
    }

    /// The primary connection, only while it reports connected.
    ///
    /// Evaluated on every call; a primary that never connects leaves the
    /// session on the fallback for its whole lifetime.
    pub fn active(&self) -> Option<&Connection> {
        self.primary.as_ref().filter(|c| c.is_connected())
    }

    /// Wait up to `timeout` for inbound data on either endpoint.
    pub async fn poll(&self, timeout: Duration) -> Inbound {
        match &self.primary {
            Some(primary) => tokio::select! {
                r = primary.receive(timeout) => Inbound::Primary(r),
                r = self.fallback.receive_raw(timeout) => Inbound::Fallback(r),
            },
            None => Inbound::Fallback(self.fallback.receive_raw(timeout).await),
        }
    }
}
