//! Call-control interfaces and the console host used by the CLI.
//!
//! The engine talks to the telephony side through two traits:
//! [`Channel`] is the per-call object owning a session (frame ingress and
//! state notifications); [`CallControl`] is the process-wide host that is
//! told about inbound calls and packet loss. Frame egress is
//! [`Session::write`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use super::{MediaFrame, Session, SessionState};

/// Voice frame size: 20ms of 8kHz mu-law.
pub const SAMPLES_PER_FRAME: usize = 160;

/// Frame interval in milliseconds.
pub const FRAME_INTERVAL_MS: u64 = 20;

/// 160 bytes of mu-law silence.
pub fn silence_payload() -> Vec<u8> {
    vec![0xFF; SAMPLES_PER_FRAME]
}

/// The call-control object that owns a session.
pub trait Channel: Send + Sync {
    /// Frame ingress: called by the media pump for every inbound payload,
    /// in wire order.
    fn deliver(&self, session_id: &str, frame: MediaFrame);

    /// Called after every session state change.
    fn state_changed(&self, session_id: &str, state: SessionState) {
        let _ = (session_id, state);
    }
}

/// The host call-control layer.
pub trait CallControl: Send + Sync {
    /// A new inbound call arrived over signaling.
    ///
    /// Returns the channel that will own the session, or `None` to decline
    /// the call.
    fn notify_incoming(
        &self,
        session: &Arc<Session>,
        from: &str,
        context: &str,
    ) -> Option<Arc<dyn Channel>>;

    /// The media pump detected `lost` missing sequence numbers.
    fn packet_loss(&self, session_id: &str, lost: u64) {
        let _ = (session_id, lost);
    }
}

/// A channel that logs received media and optionally echoes it back.
pub struct ConsoleChannel {
    session: Weak<Session>,
    echo: bool,
    frames: AtomicU64,
}

impl ConsoleChannel {
    pub fn new(session: &Arc<Session>, echo: bool) -> Self {
        Self {
            session: Arc::downgrade(session),
            echo,
            frames: AtomicU64::new(0),
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Channel for ConsoleChannel {
    fn deliver(&self, session_id: &str, frame: MediaFrame) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 250 == 1 {
            tracing::info!(
                "[{}] Recv media: seq={:?}, ts={}, payload={} bytes (total: {} frames)",
                session_id,
                frame.sequence,
                frame.timestamp,
                frame.payload.len(),
                n
            );
        }

        if self.echo {
            if let Some(session) = self.session.upgrade() {
                session.write(&frame.payload, None);
            }
        }
    }

    fn state_changed(&self, session_id: &str, state: SessionState) {
        println!("[{}] state: {}", session_id, state);
    }
}

/// Host that accepts every inbound call with a [`ConsoleChannel`].
///
/// Accepted session ids are published on `incoming` so the caller can
/// decide when to answer.
pub struct ConsoleHost {
    echo: bool,
    incoming: Option<mpsc::UnboundedSender<String>>,
}

impl ConsoleHost {
    pub fn new(echo: bool, incoming: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self { echo, incoming }
    }
}

impl CallControl for ConsoleHost {
    fn notify_incoming(
        &self,
        session: &Arc<Session>,
        from: &str,
        context: &str,
    ) -> Option<Arc<dyn Channel>> {
        println!(
            "Incoming call {} from {} (context: {})",
            session.id(),
            from,
            context
        );
        if let Some(ref tx) = self.incoming {
            if tx.send(session.id().to_string()).is_err() {
                tracing::warn!("Nobody is listening for incoming calls, declining");
                return None;
            }
        }
        Some(Arc::new(ConsoleChannel::new(session, self.echo)))
    }

    fn packet_loss(&self, session_id: &str, lost: u64) {
        tracing::info!("[{}] {} packets lost", session_id, lost);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_payload() {
        let silence = silence_payload();
        assert_eq!(silence.len(), SAMPLES_PER_FRAME);
        assert!(silence.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_console_host_publishes_incoming_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = ConsoleHost::new(false, Some(tx));
        let session = Session::detached("moq-7", "alice");

        let channel = host.notify_incoming(&session, "alice", "default");
        assert!(channel.is_some());
        assert_eq!(rx.try_recv().unwrap(), "moq-7");
    }

    #[test]
    fn test_console_host_declines_without_listener() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let host = ConsoleHost::new(false, Some(tx));
        let session = Session::detached("moq-8", "alice");
        assert!(host.notify_incoming(&session, "alice", "default").is_none());
    }

    #[test]
    fn test_console_channel_counts_frames() {
        let session = Session::detached("moq-9", "bob");
        let channel = ConsoleChannel::new(&session, false);
        for i in 0..3 {
            channel.deliver(
                "moq-9",
                MediaFrame {
                    payload: vec![0; 4],
                    timestamp: i,
                    sequence: Some(i),
                },
            );
        }
        assert_eq!(channel.frames_received(), 3);
    }
}
