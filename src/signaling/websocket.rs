//! Signaling WebSocket connection and frame handling

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

use super::message::SignalingMessage;

pub struct SignalingSocket<S> {
    stream: WebSocketStream<S>,
}

/// Client side of the signaling connection.
pub type ClientSocket = SignalingSocket<MaybeTlsStream<TcpStream>>;

impl ClientSocket {
    /// Connect to the signaling server.
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("Connecting WebSocket to {}", url);

        let (stream, response) = connect_async(url)
            .await
            .with_context(|| format!("WebSocket connection to {} failed", url))?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self { stream })
    }
}

impl SignalingSocket<TcpStream> {
    /// Complete the server-side handshake on an accepted TCP stream.
    pub async fn accept(tcp: TcpStream) -> Result<Self> {
        let stream = accept_async(tcp)
            .await
            .context("WebSocket handshake failed")?;
        Ok(Self { stream })
    }
}

impl<S> SignalingSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn send_message(&mut self, message: &SignalingMessage) -> Result<()> {
        self.send_text(&message.to_json()).await
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, msg: &str) -> Result<()> {
        tracing::debug!("WS send: {}", msg);
        self.stream
            .send(Message::Text(msg.to_string()))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Receive the next text frame, answering pings.
    ///
    /// `Ok(None)` means the peer closed the connection.
    pub async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    /// Send a close frame. Errors are ignored, the peer may be gone.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close: {}", e);
        }
    }
}
