//! Wire types: client frames in both directions and the backend envelopes.
//!
//! Every frame is a JSON object tagged by `"type"`. Inbound frames may use
//! `"kind"` instead; it is normalized before decoding.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Inbound frame kinds the router understands.
pub const KNOWN_KINDS: &[&str] = &[
    "offer",
    "answer",
    "ice_candidate",
    "get_users",
    "asr_text",
    "text_message",
    "reset_session",
];

/// A frame received from a client.
///
/// Signaling payloads (`sdp`, `candidate`) are opaque and relayed as-is.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Session description offer, relayed to the rest of the room.
    Offer {
        #[serde(default)]
        sdp: Value,
    },
    /// Session description answer, relayed to one peer.
    Answer {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        sdp: Value,
    },
    /// ICE candidate, relayed to the rest of the room.
    IceCandidate {
        #[serde(default)]
        candidate: Value,
    },
    /// Request for the sender's room roster.
    GetUsers {},
    /// Recognized speech to forward to the backend.
    AsrText {
        #[serde(default)]
        text: Option<String>,
    },
    /// Typed chat text to forward to the backend.
    TextMessage {
        #[serde(default)]
        text: Option<String>,
    },
    /// Clear the room's conversation state on the backend.
    ResetSession {},
}

impl InboundFrame {
    /// The wire name of this frame's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::GetUsers {} => "get_users",
            Self::AsrText { .. } => "asr_text",
            Self::TextMessage { .. } => "text_message",
            Self::ResetSession {} => "reset_session",
        }
    }
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not parseable as JSON.
    #[error("invalid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    /// Valid JSON, but not an object.
    #[error("frame must be a JSON object")]
    NotAnObject,
    /// No string `type`/`kind` field.
    #[error("frame is missing a \"type\" field")]
    MissingKind,
    /// A kind the router does not handle.
    #[error("unknown message type: {0}")]
    UnknownKind(String),
    /// Known kind with fields of the wrong shape.
    #[error("invalid {kind} frame: {source}")]
    InvalidFields {
        /// The frame kind.
        kind: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

impl FrameError {
    /// Short classification used as a metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::NotAnObject => "not_an_object",
            Self::MissingKind => "missing_kind",
            Self::UnknownKind(_) => "unknown_kind",
            Self::InvalidFields { .. } => "invalid_fields",
        }
    }
}

/// Decode one text frame from a client.
pub fn decode_frame(raw: &str) -> Result<InboundFrame, FrameError> {
    let mut value: Value = serde_json::from_str(raw).map_err(FrameError::Malformed)?;
    let Some(object) = value.as_object_mut() else {
        return Err(FrameError::NotAnObject);
    };

    let kind = ["type", "kind"]
        .into_iter()
        .find_map(|key| object.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or(FrameError::MissingKind)?;
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Err(FrameError::UnknownKind(kind));
    }

    let _ = object.remove("kind");
    let _ = object.insert("type".to_string(), Value::String(kind.clone()));
    serde_json::from_value(value).map_err(|source| FrameError::InvalidFields { kind, source })
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// A member joined the room.
    UserJoined {
        /// The new member.
        client_id: String,
    },
    /// A member left the room.
    UserLeft {
        /// The departed member.
        client_id: String,
    },
    /// Relayed offer.
    Offer {
        /// Originating client.
        sender: String,
        /// Opaque session description.
        sdp: Value,
    },
    /// Relayed answer.
    Answer {
        /// Originating client.
        sender: String,
        /// Opaque session description.
        sdp: Value,
    },
    /// Relayed ICE candidate.
    IceCandidate {
        /// Originating client.
        sender: String,
        /// Opaque candidate payload.
        candidate: Value,
    },
    /// Room roster.
    UsersList {
        /// Current members, sorted.
        users: Vec<String>,
    },
    /// The backend's answer, broadcast to the whole room.
    BotResponse {
        /// Reply text.
        text: String,
        /// Synthesized audio, when the backend produced one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_file: Option<String>,
        /// Conversation the reply belongs to (the room id).
        session_id: String,
        /// Client whose message triggered the reply.
        client_id: String,
    },
    /// The backend cleared the room's conversation.
    SessionReset {
        /// Human-readable confirmation from the backend.
        message: String,
        /// Conversation that was reset (the room id).
        session_id: String,
        /// Client that asked for the reset.
        client_id: String,
    },
    /// Something the sender did could not be handled.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl OutboundFrame {
    /// Build an error frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize into a shareable payload.
    pub fn encode(&self) -> Result<Arc<String>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::new)
    }
}

/// Request sent over a backend bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendRequest {
    /// Ask the backend to answer `text`.
    AsrText {
        /// Trimmed, non-empty user text.
        text: String,
        /// Originating client.
        client_id: String,
        /// Conversation id (the room id).
        session_id: String,
    },
    /// Ask the backend to forget the conversation.
    ResetSession {
        /// Originating client.
        client_id: String,
        /// Conversation id (the room id).
        session_id: String,
    },
}

impl BackendRequest {
    /// Wire name of the request, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AsrText { .. } => "asr_text",
            Self::ResetSession { .. } => "reset_session",
        }
    }

    /// The reply `type` a healthy backend answers this request with.
    pub fn expected_reply(&self) -> &'static str {
        match self {
            Self::AsrText { .. } => "bot_response",
            Self::ResetSession { .. } => "session_reset",
        }
    }
}

/// Reply read from a backend bridge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackendReply {
    /// Reply kind (`bot_response`, `session_reset`, `error`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Answer text for `bot_response`.
    #[serde(default)]
    pub text: Option<String>,
    /// Status or error text.
    #[serde(default)]
    pub message: Option<String>,
    /// Path of synthesized audio, if any.
    #[serde(default)]
    pub audio_file: Option<String>,
    /// Echoed conversation id.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Echoed client id.
    #[serde(default)]
    pub client_id: Option<String>,
}
