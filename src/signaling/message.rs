//! Signaling JSON messages

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingParseError {
    #[error("malformed JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("invalid `{kind}` message: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One signaling message, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Register {
        user_id: String,
    },
    Registered {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    Call {
        session_id: String,
        dest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Answer {
        session_id: String,
    },
    Hangup {
        session_id: String,
    },
    IncomingCall {
        session_id: String,
        from: String,
    },
    Ringing {
        session_id: String,
    },
    CallAnswered {
        session_id: String,
    },
    CallEnded {
        session_id: String,
    },
    CallFailed {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Required string fields per message type.
fn required_fields(kind: &str) -> Option<&'static [&'static str]> {
    let fields: &'static [&'static str] = match kind {
        "register" | "registered" => &["user_id"],
        "call" => &["session_id", "dest"],
        "incoming_call" => &["session_id", "from"],
        "answer" | "hangup" | "ringing" | "call_answered" | "call_ended" | "call_failed" => {
            &["session_id"]
        }
        _ => return None,
    };
    Some(fields)
}

impl SignalingMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, SignalingParseError> {
        let value: Value = serde_json::from_str(text).map_err(SignalingParseError::Malformed)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, SignalingParseError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(SignalingParseError::MissingField("type"))?
            .to_string();
        let required =
            required_fields(&kind).ok_or_else(|| SignalingParseError::UnknownType(kind.clone()))?;

        for &field in required {
            if !value.get(field).is_some_and(Value::is_string) {
                return Err(SignalingParseError::MissingField(field));
            }
        }

        serde_json::from_value(value).map_err(|source| SignalingParseError::Invalid { kind, source })
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::Call { .. } => "call",
            Self::Answer { .. } => "answer",
            Self::Hangup { .. } => "hangup",
            Self::IncomingCall { .. } => "incoming_call",
            Self::Ringing { .. } => "ringing",
            Self::CallAnswered { .. } => "call_answered",
            Self::CallEnded { .. } => "call_ended",
            Self::CallFailed { .. } => "call_failed",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Register { .. } | Self::Registered { .. } => None,
            Self::Call { session_id, .. }
            | Self::Answer { session_id }
            | Self::Hangup { session_id }
            | Self::IncomingCall { session_id, .. }
            | Self::Ringing { session_id }
            | Self::CallAnswered { session_id }
            | Self::CallEnded { session_id }
            | Self::CallFailed { session_id, .. } => Some(session_id),
        }
    }
}
