//! Session registry and signaling dispatch

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use super::host::{CallControl, Channel};
use super::session::{SessionParams, SessionError};
use super::{random_u32, Direction, Origin, Session, SessionState};
use crate::config::Context;
use crate::signaling::{SignalingMessage, SignalingSender};

/// Generate an outbound session id: `moq-<unix secs>-<random>`, both hex.
pub fn generate_session_id() -> Result<String, SessionError> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let nonce = random_u32().map_err(|e| SessionError::Allocation(e.to_string()))?;
    Ok(format!("moq-{:08x}-{:08x}", secs as u32, nonce))
}

/// Where to send media for a dial string.
///
/// `user@host[:port]` (with an optional `scheme:` prefix) names the media
/// peer explicitly. Anything else is a signaling identity and media goes to
/// the defaults.
pub fn parse_media_target<'a>(
    dest: &'a str,
    default_host: &'a str,
    default_port: u16,
) -> (&'a str, u16) {
    let Some((_, hostport)) = dest.rsplit_once('@') else {
        return (default_host, default_port);
    };
    if hostport.is_empty() {
        return (default_host, default_port);
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => {
                tracing::warn!("Bad port in dial string {}, using {}", dest, default_port);
                (host, default_port)
            }
        },
        _ => (hostport, default_port),
    }
}

pub struct SessionManager {
    ctx: Arc<Context>,
    host: Arc<dyn CallControl>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    signaling: Option<SignalingSender>,
}

impl SessionManager {
    pub fn new(
        ctx: Arc<Context>,
        host: Arc<dyn CallControl>,
        signaling: Option<SignalingSender>,
    ) -> Self {
        Self {
            ctx,
            host,
            sessions: Mutex::new(HashMap::new()),
            signaling,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an outbound session for `dest` in state Down.
    pub async fn request(
        &self,
        dest: &str,
        owner: Option<Arc<dyn Channel>>,
    ) -> Result<Arc<Session>, SessionError> {
        let settings = self.ctx.settings();
        let id = generate_session_id()?;
        let (peer_host, peer_port) =
            parse_media_target(dest, &settings.signaling_host, settings.primary_port);

        let session = Session::open(SessionParams {
            id,
            remote_id: dest,
            direction: Direction::Outbound,
            initial_state: SessionState::Down,
            peer_host,
            peer_port,
            local_user: settings.user_id.clone(),
            host: self.host.clone(),
            signaling: self.signaling.clone(),
        })
        .await?;
        if let Some(owner) = owner {
            session.fixup(owner);
        }

        self.register(session.clone())?;
        Ok(session)
    }

    /// Request a session and start calling.
    pub async fn place_call(
        &self,
        dest: &str,
        owner: Option<Arc<dyn Channel>>,
    ) -> Result<Arc<Session>, SessionError> {
        let session = self.request(dest, owner).await?;
        if let Err(e) = session.call() {
            self.hangup(session.id()).await;
            return Err(e);
        }
        Ok(session)
    }

    /// Create the inbound session for an `incoming_call` and hand it to
    /// call-control.
    pub async fn accept_incoming(
        &self,
        session_id: &str,
        from: &str,
    ) -> Result<Arc<Session>, SessionError> {
        if self.sessions().contains_key(session_id) {
            return Err(SessionError::Duplicate(session_id.to_string()));
        }

        let settings = self.ctx.settings();
        let (peer_host, peer_port) =
            parse_media_target(from, &settings.signaling_host, settings.primary_port);
        let session = Session::open(SessionParams {
            id: session_id.to_string(),
            remote_id: from,
            direction: Direction::Inbound,
            initial_state: SessionState::Ringing,
            peer_host,
            peer_port,
            local_user: settings.user_id.clone(),
            host: self.host.clone(),
            signaling: self.signaling.clone(),
        })
        .await?;
        self.register(session.clone())?;

        tracing::info!("Incoming call {} from {}", session_id, from);
        match self.host.notify_incoming(&session, from, &settings.context) {
            Some(owner) => {
                session.fixup(owner);
                Ok(session)
            }
            None => {
                tracing::info!("Call {} declined", session_id);
                self.hangup(session_id).await;
                Err(SessionError::Declined(session_id.to_string()))
            }
        }
    }

    fn register(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = self.sessions();
        if sessions.contains_key(session.id()) {
            return Err(SessionError::Duplicate(session.id().to_string()));
        }
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions().get(session_id).cloned()
    }

    /// Answer a session locally.
    pub fn answer(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.answer(Origin::Local)
    }

    /// Tear a session down and forget it. Returns `false` for unknown ids.
    pub async fn hangup(&self, session_id: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        session.hangup().await;
        self.sessions().remove(session_id);
        true
    }

    /// Handle one text frame from the signaling connection.
    pub async fn handle_signaling(&self, text: &str) {
        match SignalingMessage::parse(text) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => tracing::warn!("Dropping signaling message: {}", e),
        }
    }

    pub async fn dispatch(&self, message: SignalingMessage) {
        tracing::debug!("Signaling: {:?}", message);
        match message {
            SignalingMessage::IncomingCall { session_id, from } => {
                if let Err(e) = self.accept_incoming(&session_id, &from).await {
                    tracing::warn!("Incoming call {} not accepted: {}", session_id, e);
                }
            }
            SignalingMessage::Answer { session_id }
            | SignalingMessage::CallAnswered { session_id } => {
                self.with_session(&session_id, |s| s.answer(Origin::Remote));
            }
            SignalingMessage::Ringing { session_id } => {
                self.with_session(&session_id, |s| s.ringing());
            }
            SignalingMessage::Hangup { session_id }
            | SignalingMessage::CallEnded { session_id } => {
                if !self.hangup(&session_id).await {
                    tracing::debug!("Hangup for unknown session {}", session_id);
                }
            }
            SignalingMessage::CallFailed { session_id, reason } => {
                tracing::info!(
                    "Call {} failed: {}",
                    session_id,
                    reason.as_deref().unwrap_or("unknown")
                );
                self.hangup(&session_id).await;
            }
            SignalingMessage::Registered { user_id, .. } => {
                tracing::info!("Registered with signaling server as {}", user_id);
            }
            other @ (SignalingMessage::Call { .. } | SignalingMessage::Register { .. }) => {
                tracing::warn!("Unexpected signaling message from server: {:?}", other);
            }
        }
    }

    fn with_session<F>(&self, session_id: &str, f: F)
    where
        F: FnOnce(&Arc<Session>) -> Result<(), SessionError>,
    {
        match self.get(session_id) {
            Some(session) => {
                if let Err(e) = f(&session) {
                    tracing::warn!("Session {}: {}", session_id, e);
                }
            }
            None => tracing::debug!("Signaling for unknown session {}", session_id),
        }
    }

    /// Hang up every session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions().keys().cloned().collect();
        if !ids.is_empty() {
            tracing::info!("Hanging up {} sessions", ids.len());
        }
        for id in ids {
            self.hangup(&id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Settings;
    use crate::media::host::testing::{RecordingChannel, RecordingHost};

    fn manager(
        host: Arc<RecordingHost>,
        signaling: Option<SignalingSender>,
    ) -> SessionManager {
        let settings = Settings {
            user_id: Some("asterisk".to_string()),
            context: "from-moq".to_string(),
            ..Settings::default()
        };
        SessionManager::new(Arc::new(Context::new(settings)), host, signaling)
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id().unwrap();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "moq");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_session_id().unwrap());
    }

    #[test]
    fn test_parse_media_target() {
        assert_eq!(parse_media_target("sip:bob", "10.0.0.1", 4433), ("10.0.0.1", 4433));
        assert_eq!(parse_media_target("bob", "10.0.0.1", 4433), ("10.0.0.1", 4433));
        assert_eq!(
            parse_media_target("sip:bob@192.168.1.5", "10.0.0.1", 4433),
            ("192.168.1.5", 4433)
        );
        assert_eq!(
            parse_media_target("bob@media.example:5000", "10.0.0.1", 4433),
            ("media.example", 5000)
        );
        assert_eq!(parse_media_target("bob@", "10.0.0.1", 4433), ("10.0.0.1", 4433));
        assert_eq!(
            parse_media_target("bob@host:nope", "10.0.0.1", 4433),
            ("host", 4433)
        );
    }

    #[tokio::test]
    async fn test_outbound_call_scenario() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = Arc::new(RecordingHost::default());
        let mgr = manager(host, Some(tx));
        let channel = Arc::new(RecordingChannel::default());

        let session = mgr.request("sip:bob", Some(channel.clone())).await.unwrap();
        assert_eq!(session.state(), SessionState::Down);
        assert_eq!(session.remote_id(), "sip:bob");
        assert_eq!(mgr.len(), 1);

        session.call().unwrap();
        mgr.dispatch(SignalingMessage::Answer {
            session_id: session.id().to_string(),
        })
        .await;

        assert_eq!(session.state(), SessionState::Up);
        assert_eq!(channel.states(), vec![SessionState::Calling, SessionState::Up]);
        assert!(session.is_pump_running());
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingMessage::Call {
                session_id: session.id().to_string(),
                dest: "sip:bob".into(),
                from: Some("asterisk".into()),
            }
        );
        // Remote answers are not echoed back.
        assert!(rx.try_recv().is_err());

        assert!(mgr.hangup(session.id()).await);
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_incoming_call_scenario() {
        let host = Arc::new(RecordingHost::default());
        let mgr = manager(host.clone(), None);

        mgr.handle_signaling(r#"{"type":"incoming_call","session_id":"moq-1","from":"alice"}"#)
            .await;

        let session = mgr.get("moq-1").expect("session created");
        assert_eq!(session.id(), "moq-1");
        assert_eq!(session.remote_id(), "alice");
        assert_eq!(session.direction(), Direction::Inbound);
        assert_eq!(session.state(), SessionState::Ringing);
        assert!(session.owner().is_some());
        assert_eq!(
            host.incoming.lock().unwrap().clone(),
            vec![("moq-1".to_string(), "alice".to_string(), "from-moq".to_string())]
        );

        mgr.answer("moq-1").unwrap();
        assert_eq!(session.state(), SessionState::Up);
        mgr.shutdown().await;
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_incoming_is_rejected() {
        let host = Arc::new(RecordingHost::default());
        let mgr = manager(host.clone(), None);

        mgr.accept_incoming("moq-1", "alice").await.unwrap();
        assert!(matches!(
            mgr.accept_incoming("moq-1", "mallory").await,
            Err(SessionError::Duplicate(_))
        ));
        assert_eq!(mgr.len(), 1);
        assert_eq!(host.incoming.lock().unwrap().len(), 1);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_declined_call_is_not_registered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = Arc::new(RecordingHost {
            decline: true,
            ..RecordingHost::default()
        });
        let mgr = manager(host, Some(tx));

        assert!(matches!(
            mgr.accept_incoming("moq-2", "alice").await,
            Err(SessionError::Declined(_))
        ));
        assert!(mgr.get("moq-2").is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingMessage::Hangup {
                session_id: "moq-2".into()
            }
        );
    }

    #[tokio::test]
    async fn test_remote_hangup_removes_session() {
        let host = Arc::new(RecordingHost::default());
        let mgr = manager(host, None);
        let channel = Arc::new(RecordingChannel::default());
        let session = mgr.place_call("bob", Some(channel.clone())).await.unwrap();
        let id = session.id().to_string();

        mgr.handle_signaling(&format!(r#"{{"type":"call_ended","session_id":"{}"}}"#, id))
            .await;
        assert!(mgr.get(&id).is_none());
        assert_eq!(session.state(), SessionState::Hangup);
        assert!(!session.is_pump_running());
        assert_eq!(
            channel.states(),
            vec![SessionState::Calling, SessionState::Hangup]
        );

        // Second hangup for the same id is a no-op.
        assert!(!mgr.hangup(&id).await);
    }

    #[tokio::test]
    async fn test_ringing_then_call_answered() {
        let host = Arc::new(RecordingHost::default());
        let mgr = manager(host, None);
        let session = mgr.place_call("bob", None).await.unwrap();
        let id = session.id().to_string();

        mgr.handle_signaling(&format!(r#"{{"type":"ringing","session_id":"{}"}}"#, id))
            .await;
        assert_eq!(session.state(), SessionState::Ringing);
        mgr.handle_signaling(&format!(r#"{{"type":"call_answered","session_id":"{}"}}"#, id))
            .await;
        assert_eq!(session.state(), SessionState::Up);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_signaling_is_dropped() {
        let host = Arc::new(RecordingHost::default());
        let mgr = manager(host.clone(), None);

        mgr.handle_signaling("not json").await;
        mgr.handle_signaling(r#"{"type":"incoming_call","session_id":"moq-3"}"#)
            .await;
        mgr.handle_signaling(r#"{"type":"answer","session_id":"nope"}"#)
            .await;
        mgr.handle_signaling(r#"{"type":"hangup","session_id":"nope"}"#)
            .await;

        assert!(mgr.is_empty());
        assert!(host.incoming.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_answer_unknown_session() {
        let mgr = manager(Arc::new(RecordingHost::default()), None);
        assert!(matches!(mgr.answer("moq-x"), Err(SessionError::NotFound(_))));
    }
}
