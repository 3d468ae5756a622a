//! Signaling router server
//!
//! Routes call setup between registered WebSocket clients: browser phones
//! and the bridge itself. Users register under an id; `call` is forwarded
//! to the destination as `incoming_call`, answers and hangups are fanned
//! out, and WebRTC negotiation messages are relayed verbatim to `dest`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context as _, Result};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::message::SignalingMessage;
use super::websocket::SignalingSocket;

pub type ConnId = u64;

/// Message types forwarded untouched to their `dest`.
const RELAY_TYPES: &[&str] = &["sdp_offer", "sdp_answer", "ice_candidate"];

/// A text frame for one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: ConnId,
    pub text: String,
}

impl Outgoing {
    fn message(to: ConnId, message: &SignalingMessage) -> Self {
        Self {
            to,
            text: message.to_json(),
        }
    }
}

/// Registration table and routing rules, without any I/O.
#[derive(Debug, Default)]
pub struct Router {
    users: HashMap<String, ConnId>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnId> {
        self.users.get(user_id).copied()
    }

    fn user_of(&self, conn: ConnId) -> Option<&str> {
        self.users
            .iter()
            .find(|(_, c)| **c == conn)
            .map(|(user, _)| user.as_str())
    }

    /// Route one text frame from `from`. Returns the frames to send.
    pub fn route(&mut self, from: ConnId, text: &str) -> Vec<Outgoing> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Invalid JSON received from connection {}: {}", from, e);
                return Vec::new();
            }
        };

        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        if RELAY_TYPES.contains(&kind) {
            return self.relay(kind, &value, text);
        }

        let message = match SignalingMessage::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Dropping message from connection {}: {}", from, e);
                return Vec::new();
            }
        };
        tracing::info!("Received message type '{}' from connection {}", message.kind(), from);

        match message {
            SignalingMessage::Register { user_id } => {
                self.users.insert(user_id.clone(), from);
                tracing::info!("User registered: {}", user_id);
                vec![Outgoing::message(
                    from,
                    &SignalingMessage::Registered {
                        user_id,
                        status: Some("success".to_string()),
                    },
                )]
            }
            SignalingMessage::Call {
                session_id,
                dest,
                from: caller,
            } => {
                let caller = caller
                    .or_else(|| self.user_of(from).map(str::to_string))
                    .unwrap_or_default();
                match self.lookup(&dest) {
                    Some(dest_conn) => {
                        tracing::info!("Call routed: {} -> {}", caller, dest);
                        vec![
                            Outgoing::message(
                                dest_conn,
                                &SignalingMessage::IncomingCall {
                                    session_id: session_id.clone(),
                                    from: caller,
                                },
                            ),
                            Outgoing::message(from, &SignalingMessage::Ringing { session_id }),
                        ]
                    }
                    None => {
                        tracing::warn!("Call failed: destination {} not found", dest);
                        vec![Outgoing::message(
                            from,
                            &SignalingMessage::CallFailed {
                                session_id,
                                reason: Some("user_not_found".to_string()),
                            },
                        )]
                    }
                }
            }
            SignalingMessage::Answer { session_id } => {
                tracing::info!("Call answered: session {}", session_id);
                let answered = SignalingMessage::CallAnswered { session_id };
                self.connections()
                    .into_iter()
                    .filter(|conn| *conn != from)
                    .map(|conn| Outgoing::message(conn, &answered))
                    .collect()
            }
            SignalingMessage::Hangup { session_id } => {
                tracing::info!("Call ended: session {}", session_id);
                let ended = SignalingMessage::CallEnded { session_id };
                self.connections()
                    .into_iter()
                    .map(|conn| Outgoing::message(conn, &ended))
                    .collect()
            }
            other => {
                tracing::warn!("Unexpected message type: {}", other.kind());
                Vec::new()
            }
        }
    }

    fn relay(&self, kind: &str, value: &Value, text: &str) -> Vec<Outgoing> {
        let dest = value.get("dest").and_then(Value::as_str);
        match dest.and_then(|d| self.lookup(d)) {
            Some(conn) => {
                tracing::debug!("Forwarded {} to {}", kind, dest.unwrap_or_default());
                vec![Outgoing {
                    to: conn,
                    text: text.to_string(),
                }]
            }
            None => {
                tracing::debug!("No destination for {}", kind);
                Vec::new()
            }
        }
    }

    /// Registered connections, each once, in stable order.
    fn connections(&self) -> Vec<ConnId> {
        let mut conns: Vec<ConnId> = self.users.values().copied().collect();
        conns.sort_unstable();
        conns.dedup();
        conns
    }

    /// Forget every user registered on `conn`.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<String> {
        let gone: Vec<String> = self
            .users
            .iter()
            .filter(|(_, c)| **c == conn)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &gone {
            self.users.remove(user);
            tracing::info!("User unregistered: {}", user);
        }
        gone
    }
}

#[derive(Default)]
struct Hub {
    router: Router,
    peers: HashMap<ConnId, mpsc::UnboundedSender<String>>,
    next_id: ConnId,
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bind the router on `0.0.0.0:port`.
pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind signaling server on port {}", port))
}

/// Accept clients until `shutdown` fires.
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let hub = Arc::new(Mutex::new(Hub::default()));
    tracing::info!(
        "Signaling server started on ws://{}",
        listener.local_addr().context("Listener has no address")?
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((tcp, addr)) => {
                        tokio::spawn(handle_client(hub.clone(), tcp, addr, shutdown.clone()));
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Signaling server stopped");
                return Ok(());
            }
        }
    }
}

async fn handle_client(
    hub: Arc<Mutex<Hub>>,
    tcp: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let mut ws = match SignalingSocket::accept(tcp).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("Client {}: {:#}", addr, e);
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = {
        let mut hub = lock(&hub);
        hub.next_id += 1;
        let id = hub.next_id;
        hub.peers.insert(id, tx);
        id
    };
    tracing::info!("Client connected: {} (connection {})", addr, conn);

    loop {
        tokio::select! {
            frame = ws.recv_text() => {
                match frame {
                    Ok(Some(text)) => {
                        let mut hub = lock(&hub);
                        for out in hub.router.route(conn, &text) {
                            match hub.peers.get(&out.to) {
                                Some(peer) => {
                                    let _ = peer.send(out.text);
                                }
                                None => tracing::debug!("Connection {} is gone", out.to),
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("Client {}: {:#}", addr, e);
                        break;
                    }
                }
            }
            Some(text) = rx.recv() => {
                if let Err(e) = ws.send_text(&text).await {
                    tracing::debug!("Client {}: {:#}", addr, e);
                    break;
                }
            }
            _ = shutdown.cancelled() => {
                ws.close().await;
                break;
            }
        }
    }

    let mut hub = lock(&hub);
    hub.peers.remove(&conn);
    hub.router.disconnect(conn);
    tracing::info!("Client disconnected: {}", addr);
}
