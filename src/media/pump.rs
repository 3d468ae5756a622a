//! Per-session receive loop.
//!
//! The pump drains the session's [`MediaLink`], answers primary-path
//! handshake messages, tracks sequence gaps and hands payloads to the
//! owning channel. It runs until its cancellation token fires or the
//! session is dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::transport::{Inbound, MediaLink, Received, TransportError};
use super::wire::{self, MessageType, BUFFER_CAPACITY};
use super::{now_micros, MediaFrame, Session};

/// Upper bound on one receive wait.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Fold an observed sequence number into the last one seen.
///
/// Returns the new last-seen value and the number of packets missing
/// between them. Late (lower) sequences report no loss and never move the
/// last-seen value backwards.
pub fn observe_sequence(last: u64, sequence: u64) -> (u64, u64) {
    let lost = if sequence > last.saturating_add(1) {
        sequence - last - 1
    } else {
        0
    };
    (last.max(sequence), lost)
}

pub(crate) struct MediaPump {
    session: Weak<Session>,
    link: Arc<MediaLink>,
    cancel: CancellationToken,
    recv_sequence: u64,
}

impl MediaPump {
    pub(crate) fn new(session: Weak<Session>, link: Arc<MediaLink>, cancel: CancellationToken) -> Self {
        Self {
            session,
            link,
            cancel,
            recv_sequence: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let Some(session_id) = self.session.upgrade().map(|s| s.id().to_string()) else {
            return;
        };
        tracing::info!("Media pump started for session {}", session_id);
        self.announce();

        loop {
            let inbound = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                inbound = self.link.poll(POLL_INTERVAL) => inbound,
            };

            let Some(session) = self.session.upgrade() else {
                break;
            };
            let healthy = match inbound {
                Inbound::Primary(result) => self.on_primary(&session, result),
                Inbound::Fallback(result) => on_fallback(&session, result),
            };
            drop(session);

            if !healthy {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = time::sleep(POLL_INTERVAL) => {}
                }
            }
        }

        tracing::info!("Media pump stopped for session {}", session_id);
    }

    /// Offer our track on the primary path.
    fn announce(&self) {
        let (Some(primary), Some(session)) = (&self.link.primary, self.session.upgrade()) else {
            return;
        };
        if let Err(e) = primary.send(MessageType::Announce, &session.track_id().to_be_bytes()) {
            tracing::debug!("[{}] ANNOUNCE not sent: {}", session.id(), e);
        }
    }

    fn on_primary(&mut self, session: &Session, result: Result<Received, TransportError>) -> bool {
        match result {
            Ok(Received::NoData) => true,
            Ok(Received::Message { kind, payload }) => {
                self.on_message(session, kind, &payload);
                true
            }
            Err(TransportError::Protocol(e)) => {
                tracing::debug!("[{}] Discarding malformed message: {}", session.id(), e);
                session.record_discard();
                true
            }
            Err(e) => {
                tracing::warn!("[{}] Primary receive error: {}", session.id(), e);
                false
            }
        }
    }

    fn on_message(&mut self, session: &Session, kind: MessageType, payload: &[u8]) {
        match kind {
            MessageType::Object => self.on_object(session, payload),
            MessageType::Announce => {
                self.mark_connected(session);
                if let Some(primary) = &self.link.primary {
                    if let Err(e) =
                        primary.send(MessageType::AnnounceOk, &session.track_id().to_be_bytes())
                    {
                        tracing::debug!("[{}] ANNOUNCE_OK not sent: {}", session.id(), e);
                    }
                }
            }
            MessageType::AnnounceOk => self.mark_connected(session),
            MessageType::GoAway => {
                if let Some(primary) = &self.link.primary {
                    if primary.set_connected(false) {
                        tracing::info!(
                            "[{}] Peer sent GOAWAY, media falls back to raw datagrams",
                            session.id()
                        );
                    }
                }
            }
            other => tracing::debug!("[{}] Ignoring {:?} message", session.id(), other),
        }
    }

    pub(crate) fn on_object(&mut self, session: &Session, payload: &[u8]) {
        let decoded = match wire::decode_media_object(payload, BUFFER_CAPACITY) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!("[{}] Discarding media object: {}", session.id(), e);
                session.record_discard();
                return;
            }
        };
        if let Some(mismatch) = decoded.mismatch {
            tracing::debug!("[{}] {}", session.id(), mismatch);
        }

        let object = decoded.object;
        if object.track_id != session.track_id() {
            tracing::trace!(
                "[{}] Dropping object for foreign track {:08x}",
                session.id(),
                object.track_id
            );
            session.record_discard();
            return;
        }
        self.mark_connected(session);

        let (recv_sequence, lost) = observe_sequence(self.recv_sequence, object.sequence);
        if lost > 0 {
            session.report_loss(lost);
        }
        self.recv_sequence = recv_sequence;
        session.set_recv_sequence(recv_sequence);
        session.record_received(object.payload.len());

        let frame = MediaFrame {
            payload: object.payload,
            timestamp: object.timestamp,
            sequence: Some(object.sequence),
        };
        if !session.deliver(frame) {
            tracing::trace!("[{}] No owner, frame dropped", session.id());
        }
    }

    fn mark_connected(&self, session: &Session) {
        if let Some(primary) = &self.link.primary {
            if !primary.set_connected(true) {
                tracing::info!(
                    "[{}] Primary transport connected (conn {:08x})",
                    session.id(),
                    primary.connection_id()
                );
            }
        }
    }
}

fn on_fallback(session: &Session, result: Result<Option<Vec<u8>>, TransportError>) -> bool {
    match result {
        Ok(None) => true,
        Ok(Some(payload)) => {
            session.record_received(payload.len());
            let frame = MediaFrame {
                payload,
                timestamp: now_micros(),
                sequence: None,
            };
            if !session.deliver(frame) {
                tracing::trace!("[{}] No owner, frame dropped", session.id());
            }
            true
        }
        Err(e) => {
            tracing::warn!("[{}] Fallback receive error: {}", session.id(), e);
            false
        }
    }
}
