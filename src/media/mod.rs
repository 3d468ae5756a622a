//! Media transport sessions: wire framing, UDP connections, per-call
//! sessions and the receive pump that feeds call-control.

pub mod host;
pub mod manager;
pub mod pump;
pub mod session;
pub mod transport;
pub mod wire;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use host::{CallControl, Channel, ConsoleHost};
pub use manager::SessionManager;
pub use session::{Session, SessionError};

/// Call lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Down,
    Calling,
    Ringing,
    Up,
    Hangup,
}

impl SessionState {
    /// Whether the progress transition `self -> next` is allowed.
    ///
    /// `Hangup` is not listed here: teardown is reachable from every
    /// non-terminal state through [`Session::hangup`].
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Down, Calling) | (Calling, Ringing) | (Calling, Up) | (Ringing, Up)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Hangup
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Down => "down",
            SessionState::Calling => "calling",
            SessionState::Ringing => "ringing",
            SessionState::Up => "up",
            SessionState::Hangup => "hangup",
        };
        f.write_str(s)
    }
}

/// Which side placed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Who initiated a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// A voice payload handed to call-control by the media pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub payload: Vec<u8>,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Wire sequence number; `None` for unframed fallback datagrams.
    pub sequence: Option<u64>,
}

/// Per-session media counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub discarded: u64,
}

/// Current wall clock in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Random 32-bit identifier from the OS CSPRNG.
pub fn random_u32() -> Result<u32, getrandom::Error> {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}
