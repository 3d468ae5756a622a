//! Per-call media session and its state machine.
//!
//! A session owns its [`MediaLink`] exclusively. The owning call-control
//! [`Channel`] is a back-reference that may be rebound ([`Session::fixup`])
//! or cleared ([`Session::hangup`]) while the media pump reads it, so every
//! access goes through the same per-session lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::host::{CallControl, Channel};
use super::pump::MediaPump;
use super::transport::{MediaLink, TransportError};
use super::wire::{self, MessageType, ProtocolError, MAX_OBJECT_PAYLOAD};
use super::{now_micros, random_u32, Direction, MediaFrame, MediaStats, Origin, SessionState};
use crate::signaling::{SignalingMessage, SignalingSender};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to allocate session: {0}")]
    Allocation(String),

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("session {0} already exists")]
    Duplicate(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("call {0} declined by call-control")]
    Declined(String),
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct SendState {
    sequence: u64,
    last_timestamp: u64,
}

enum PumpSlot {
    Idle,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Everything needed to open a session.
pub struct SessionParams<'a> {
    pub id: String,
    pub remote_id: &'a str,
    pub direction: Direction,
    pub initial_state: SessionState,
    pub peer_host: &'a str,
    pub peer_port: u16,
    /// Our signaling identity, sent as `from` on outbound calls.
    pub local_user: Option<String>,
    pub host: Arc<dyn CallControl>,
    pub signaling: Option<SignalingSender>,
}

pub struct Session {
    id: String,
    remote_id: String,
    direction: Direction,
    track_id: u32,
    local_user: Option<String>,
    state: Mutex<SessionState>,
    owner: Mutex<Option<Arc<dyn Channel>>>,
    link: Mutex<Option<Arc<MediaLink>>>,
    send: Mutex<SendState>,
    /// Written only by the media pump.
    recv_sequence: AtomicU64,
    stats: Mutex<MediaStats>,
    pump: Mutex<PumpSlot>,
    host: Arc<dyn CallControl>,
    signaling: Option<SignalingSender>,
}

impl Session {
    /// Allocate the session and its transports.
    ///
    /// Nothing is left behind on failure: a link that was partially opened
    /// is dropped with the error.
    pub async fn open(params: SessionParams<'_>) -> Result<Arc<Self>, SessionError> {
        let track_id = random_u32().map_err(|e| SessionError::Allocation(e.to_string()))?;
        let link = MediaLink::open(params.peer_host, params.peer_port).await?;

        tracing::info!(
            "Created session {} for {} (track {:08x}, primary: {})",
            params.id,
            params.remote_id,
            track_id,
            if link.primary.is_some() { "yes" } else { "no" }
        );

        Ok(Arc::new(Self::from_parts(params, track_id, Some(link))))
    }

    fn from_parts(params: SessionParams<'_>, track_id: u32, link: Option<MediaLink>) -> Self {
        Self {
            id: params.id,
            remote_id: params.remote_id.to_string(),
            direction: params.direction,
            track_id,
            local_user: params.local_user,
            state: Mutex::new(params.initial_state),
            owner: Mutex::new(None),
            link: Mutex::new(link.map(Arc::new)),
            send: Mutex::new(SendState::default()),
            recv_sequence: AtomicU64::new(0),
            stats: Mutex::new(MediaStats::default()),
            pump: Mutex::new(PumpSlot::Idle),
            host: params.host,
            signaling: params.signaling,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn track_id(&self) -> u32 {
        self.track_id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn send_sequence(&self) -> u64 {
        lock(&self.send).sequence
    }

    pub fn last_timestamp(&self) -> u64 {
        lock(&self.send).last_timestamp
    }

    pub fn recv_sequence(&self) -> u64 {
        self.recv_sequence.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MediaStats {
        lock(&self.stats).clone()
    }

    pub fn owner(&self) -> Option<Arc<dyn Channel>> {
        lock(&self.owner).clone()
    }

    pub fn link(&self) -> Option<Arc<MediaLink>> {
        lock(&self.link).clone()
    }

    pub fn is_pump_running(&self) -> bool {
        match &*lock(&self.pump) {
            PumpSlot::Running { handle, .. } => !handle.is_finished(),
            _ => false,
        }
    }

    /// Rebind the owning channel (call transfer).
    ///
    /// Ignored once the session has hung up, so a late rebind cannot
    /// resurrect a cleared owner.
    pub fn fixup(&self, owner: Arc<dyn Channel>) {
        if self.state().is_terminal() {
            tracing::debug!("Ignoring owner rebind on finished session {}", self.id);
            return;
        }
        *lock(&self.owner) = Some(owner);
    }

    /// Down -> Calling: start media and tell the peer.
    pub fn call(self: &Arc<Self>) -> Result<(), SessionError> {
        if !self.advance(SessionState::Calling)? {
            return Ok(());
        }
        tracing::info!("Calling {} (session {})", self.remote_id, self.id);
        self.start_pump();
        self.signal(SignalingMessage::Call {
            session_id: self.id.clone(),
            dest: self.remote_id.clone(),
            from: self.local_user.clone(),
        });
        Ok(())
    }

    /// Calling -> Ringing.
    pub fn ringing(&self) -> Result<(), SessionError> {
        self.advance(SessionState::Ringing).map(|_| ())
    }

    /// -> Up. Starts the media pump if it is not running yet.
    ///
    /// A local answer of an inbound call is announced over signaling.
    pub fn answer(self: &Arc<Self>, origin: Origin) -> Result<(), SessionError> {
        let changed = self.advance(SessionState::Up)?;
        if self.state() != SessionState::Up {
            return Ok(());
        }
        self.start_pump();
        if changed {
            tracing::info!("Session {} answered ({:?})", self.id, origin);
            if origin == Origin::Local && self.direction == Direction::Inbound {
                self.signal(SignalingMessage::Answer {
                    session_id: self.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Tear the session down. Returns `false` if it was already hung up.
    ///
    /// Order: hangup signaling, clear owner, stop pump, wait for pump,
    /// release transports. The manager drops the session afterwards.
    pub async fn hangup(&self) -> bool {
        let previous = {
            let mut state = lock(&self.state);
            if state.is_terminal() {
                return false;
            }
            std::mem::replace(&mut *state, SessionState::Hangup)
        };
        tracing::info!("Hanging up session {} (was {})", self.id, previous);

        if previous != SessionState::Down {
            self.signal(SignalingMessage::Hangup {
                session_id: self.id.clone(),
            });
        }

        let owner = lock(&self.owner).take();
        if let Some(owner) = owner {
            owner.state_changed(&self.id, SessionState::Hangup);
        }

        self.stop_pump().await;
        self.release_link();
        true
    }

    /// Frame egress: send one payload to the peer.
    ///
    /// Uses the primary connection if it is connected, otherwise sends the
    /// raw payload on the fallback. Failures are logged; nothing is retried.
    pub fn write(&self, payload: &[u8], timestamp_hint: Option<u64>) {
        let Some(link) = self.link() else {
            tracing::trace!("Write on released session {}", self.id);
            return;
        };
        let timestamp = timestamp_hint.unwrap_or_else(now_micros);

        let mut send = lock(&self.send);
        let result = match link.active() {
            // The object must also fit the control envelope before it is numbered.
            Some(_) if payload.len() > MAX_OBJECT_PAYLOAD => {
                Err(TransportError::Protocol(ProtocolError::PayloadTooLarge {
                    size: payload.len(),
                    capacity: MAX_OBJECT_PAYLOAD,
                }))
            }
            Some(primary) => {
                let sequence = send.sequence + 1;
                match wire::encode_media_object(self.track_id, sequence, timestamp, payload) {
                    Ok(object) => {
                        send.sequence = sequence;
                        primary.send(MessageType::Object, &object)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            None => link.fallback.send_raw(payload),
        };

        match result {
            Ok(()) => {
                send.last_timestamp = timestamp;
                drop(send);
                let mut stats = lock(&self.stats);
                stats.packets_sent += 1;
                stats.bytes_sent += payload.len() as u64;
            }
            Err(e) => tracing::warn!("[{}] Media send failed: {}", self.id, e),
        }
    }

    /// Hand a frame to the owner. Returns `false` if there is none.
    pub(crate) fn deliver(&self, frame: MediaFrame) -> bool {
        let owner = lock(&self.owner);
        match owner.as_ref() {
            Some(channel) => {
                channel.deliver(&self.id, frame);
                true
            }
            None => false,
        }
    }

    pub(crate) fn report_loss(&self, lost: u64) {
        tracing::debug!("[{}] Sequence gap: {} packets lost", self.id, lost);
        lock(&self.stats).packets_lost += lost;
        self.host.packet_loss(&self.id, lost);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        let mut stats = lock(&self.stats);
        stats.packets_received += 1;
        stats.bytes_received += bytes as u64;
    }

    pub(crate) fn record_discard(&self) {
        lock(&self.stats).discarded += 1;
    }

    pub(crate) fn set_recv_sequence(&self, sequence: u64) {
        self.recv_sequence.store(sequence, Ordering::Release);
    }

    /// Apply a progress transition. `Ok(false)` means nothing changed:
    /// already in `next`, or the session has hung up.
    fn advance(&self, next: SessionState) -> Result<bool, SessionError> {
        {
            let mut state = lock(&self.state);
            if *state == next || state.is_terminal() {
                tracing::debug!("Session {}: {} -> {} is a no-op", self.id, *state, next);
                return Ok(false);
            }
            if !state.can_advance_to(next) {
                return Err(SessionError::InvalidTransition {
                    from: *state,
                    to: next,
                });
            }
            *state = next;
        }

        if let Some(owner) = lock(&self.owner).as_ref() {
            owner.state_changed(&self.id, next);
        }
        Ok(true)
    }

    /// Spawn the media pump once. Later calls are no-ops, including after
    /// the pump has been stopped.
    fn start_pump(self: &Arc<Self>) {
        let mut slot = lock(&self.pump);
        if !matches!(*slot, PumpSlot::Idle) {
            return;
        }
        let Some(link) = self.link() else {
            return;
        };

        let cancel = CancellationToken::new();
        let pump = MediaPump::new(Arc::downgrade(self), link, cancel.clone());
        let handle = tokio::spawn(pump.run());
        *slot = PumpSlot::Running { cancel, handle };
    }

    async fn stop_pump(&self) {
        let slot = std::mem::replace(&mut *lock(&self.pump), PumpSlot::Stopped);
        if let PumpSlot::Running { cancel, handle } = slot {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Media pump for {} ended abnormally: {}", self.id, e);
            }
        }
    }

    fn release_link(&self) {
        let link = lock(&self.link).take();
        if let Some(link) = link {
            if let Some(primary) = link.active() {
                if let Err(e) = primary.send(MessageType::GoAway, &[]) {
                    tracing::debug!("[{}] GOAWAY not sent: {}", self.id, e);
                }
            }
            let stats = self.stats();
            tracing::info!(
                "Session {} released. Sent: {}, Received: {} ({} bytes), Lost: {}",
                self.id,
                stats.packets_sent,
                stats.packets_received,
                stats.bytes_received,
                stats.packets_lost
            );
        }
    }

    fn signal(&self, message: SignalingMessage) {
        if let Some(ref tx) = self.signaling {
            if tx.send(message).is_err() {
                tracing::warn!("Signaling channel closed, message for {} dropped", self.id);
            }
        }
    }

    /// A session without transports, for exercising the state machine.
    #[cfg(test)]
    pub(crate) fn detached(id: &str, remote_id: &str) -> Arc<Self> {
        let params = SessionParams {
            id: id.to_string(),
            remote_id,
            direction: Direction::Outbound,
            initial_state: SessionState::Down,
            peer_host: "127.0.0.1",
            peer_port: 0,
            local_user: None,
            host: Arc::new(super::host::testing::RecordingHost::default()),
            signaling: None,
        };
        Arc::new(Self::from_parts(params, 0x0000_1234, None))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let slot = self.pump.get_mut().unwrap_or_else(|e| e.into_inner());
        if let PumpSlot::Running { cancel, .. } = slot {
            cancel.cancel();
        }
    }
}
