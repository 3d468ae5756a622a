//! WebSocket signaling client
//!
//! Keeps one connection to the signaling server, registers our user id,
//! feeds inbound JSON to the [`SessionManager`] and forwards messages
//! queued by sessions.

pub mod message;
pub mod server;
pub mod websocket;

pub use message::{SignalingMessage, SignalingParseError};

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time;

use crate::config::Context;
use crate::media::SessionManager;
use websocket::ClientSocket;

/// Outbound half of the session -> signaling queue.
pub type SignalingSender = mpsc::UnboundedSender<SignalingMessage>;
pub type SignalingReceiver = mpsc::UnboundedReceiver<SignalingMessage>;

pub fn channel() -> (SignalingSender, SignalingReceiver) {
    mpsc::unbounded_channel()
}

/// Reconnect delay bounds in seconds.
const MIN_BACKOFF: u64 = 1;
const MAX_BACKOFF: u64 = 64;

/// A connection that lasted this long resets the backoff.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Reason the inner connection loop exited.
enum DisconnectReason {
    /// Context shut down. Do not reconnect.
    Shutdown,
    /// Error or server-initiated close. Should reconnect.
    Error(anyhow::Error),
}

/// Run the signaling client until the context shuts down.
///
/// Reconnects with exponential backoff (1s, 2s, 4s, ... capped at 64s).
/// Messages queued while disconnected are dropped.
pub async fn run(
    ctx: Arc<Context>,
    manager: Arc<SessionManager>,
    mut outbound: SignalingReceiver,
) -> Result<()> {
    let mut backoff = MIN_BACKOFF;

    loop {
        let connected_at = Instant::now();
        match run_once(&ctx, &manager, &mut outbound).await {
            DisconnectReason::Shutdown => return Ok(()),
            DisconnectReason::Error(e) => {
                if connected_at.elapsed() >= STABILITY_THRESHOLD {
                    backoff = MIN_BACKOFF;
                }
                tracing::warn!(
                    "Signaling disconnected: {:#}. Reconnecting in {}s...",
                    e,
                    backoff
                );
            }
        }

        if !wait_reconnect(&ctx, &mut outbound, Duration::from_secs(backoff)).await {
            return Ok(());
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Sleep before reconnecting. Returns `false` on shutdown.
async fn wait_reconnect(ctx: &Context, outbound: &mut SignalingReceiver, delay: Duration) -> bool {
    let sleep = time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            _ = ctx.shutdown_token().cancelled() => return false,
            msg = outbound.recv() => match msg {
                Some(msg) => tracing::warn!(
                    "Signaling offline, dropping {} for {}",
                    msg.kind(),
                    msg.session_id().unwrap_or("-")
                ),
                None => return false,
            },
        }
    }
}

/// One connection: connect, register, event loop.
async fn run_once(
    ctx: &Context,
    manager: &SessionManager,
    outbound: &mut SignalingReceiver,
) -> DisconnectReason {
    let settings = ctx.settings();
    let url = settings.signaling_url();

    let mut ws = tokio::select! {
        res = ClientSocket::connect(&url) => match res {
            Ok(ws) => ws,
            Err(e) => return DisconnectReason::Error(e),
        },
        _ = ctx.shutdown_token().cancelled() => return DisconnectReason::Shutdown,
    };

    match settings.user_id {
        Some(user_id) => {
            if let Err(e) = ws.send_message(&SignalingMessage::Register { user_id }).await {
                return DisconnectReason::Error(e.context("Registration failed"));
            }
        }
        None => tracing::warn!("No user_id configured, inbound calls cannot be routed to us"),
    }

    let reason = loop {
        tokio::select! {
            frame = ws.recv_text() => {
                match frame {
                    Ok(Some(text)) => manager.handle_signaling(&text).await,
                    Ok(None) => {
                        break DisconnectReason::Error(anyhow::anyhow!("WebSocket closed by server"));
                    }
                    Err(e) => {
                        break DisconnectReason::Error(e.context("WebSocket recv error"));
                    }
                }
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    break DisconnectReason::Shutdown;
                };
                if let Err(e) = ws.send_message(&msg).await {
                    break DisconnectReason::Error(e);
                }
            }
            _ = ctx.shutdown_token().cancelled() => {
                break DisconnectReason::Shutdown;
            }
        }
    };

    if matches!(reason, DisconnectReason::Shutdown) {
        // Flush whatever teardown queued before the token fired.
        while let Ok(msg) = outbound.try_recv() {
            if ws.send_message(&msg).await.is_err() {
                break;
            }
        }
        ws.close().await;
    }
    reason
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::websocket::SignalingSocket;
    use super::*;
    use crate::config::Settings;
    use crate::media::host::testing::RecordingHost;
    use crate::media::SessionState;

    #[tokio::test]
    async fn test_client_registers_and_dispatches() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let settings = Settings {
            signaling_port: port,
            user_id: Some("asterisk".to_string()),
            ..Settings::default()
        };
        let ctx = Arc::new(Context::new(settings));
        let host = Arc::new(RecordingHost::default());
        let (tx, rx) = channel();
        let manager = Arc::new(SessionManager::new(ctx.clone(), host.clone(), Some(tx)));
        let client = tokio::spawn(run(ctx.clone(), manager.clone(), rx));

        let (tcp, _) = listener.accept().await.unwrap();
        let mut peer = SignalingSocket::accept(tcp).await.unwrap();

        let register = peer.recv_text().await.unwrap().unwrap();
        assert_eq!(
            SignalingMessage::parse(&register).unwrap(),
            SignalingMessage::Register {
                user_id: "asterisk".into()
            }
        );

        peer.send_text(r#"{"type":"incoming_call","session_id":"moq-1","from":"alice"}"#)
            .await
            .unwrap();
        peer.send_text("garbage").await.unwrap();

        for _ in 0..100 {
            if manager.get("moq-1").is_some() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        let session = manager.get("moq-1").expect("inbound session");
        assert_eq!(session.state(), SessionState::Ringing);

        // A local answer travels back over the socket.
        manager.answer("moq-1").unwrap();
        let answer = time::timeout(Duration::from_secs(2), peer.recv_text())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(answer, r#"{"type":"answer","session_id":"moq-1"}"#);

        manager.shutdown().await;
        ctx.shutdown();
        time::timeout(Duration::from_secs(2), client)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_stops_while_server_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = Settings {
            signaling_port: port,
            ..Settings::default()
        };
        let ctx = Arc::new(Context::new(settings));
        let (tx, rx) = channel();
        let manager = Arc::new(SessionManager::new(
            ctx.clone(),
            Arc::new(RecordingHost::default()),
            Some(tx.clone()),
        ));
        let client = tokio::spawn(run(ctx.clone(), manager, rx));

        time::sleep(Duration::from_millis(50)).await;
        tx.send(SignalingMessage::Hangup {
            session_id: "moq-1".into(),
        })
        .unwrap();
        ctx.shutdown();

        time::timeout(Duration::from_secs(2), client)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
