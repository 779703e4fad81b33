//! Records exchanged through the shared store.

use crate::identity::Identity;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Current wall-clock time in milliseconds, as stored in `timestamp` fields.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Random token tying a call record to the call that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Offer,
    Answer,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// An opaque negotiated-media description produced by the media connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: RecordType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: RecordType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: RecordType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network candidate, carried verbatim between the two media connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// The single offer/answer slot stored at `calls/{pair}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(rename = "type")]
    pub kind: RecordType,
    pub sender: Identity,
    pub receiver: Identity,
    pub sdp: String,
    pub timestamp: i64,
    #[serde(default)]
    pub call_id: CallId,
}

impl CallRecord {
    pub fn offer(sender: Identity, receiver: Identity, sdp: String, call_id: CallId) -> Self {
        Self {
            kind: RecordType::Offer,
            sender,
            receiver,
            sdp,
            timestamp: now_millis(),
            call_id,
        }
    }

    /// Fields merged over an offer by the callee. `call_id` is left untouched.
    pub fn answer_fields(sender: &Identity, receiver: &Identity, sdp: &str) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("type".into(), Value::from(RecordType::Answer.to_string()));
        fields.insert("sender".into(), Value::from(sender.as_str()));
        fields.insert("receiver".into(), Value::from(receiver.as_str()));
        fields.insert("sdp".into(), Value::from(sdp));
        fields.insert("timestamp".into(), Value::from(now_millis()));
        fields
    }

    /// Parses a stored node; nested `candidates` and unknown fields are ignored.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn description(&self) -> SessionDescription {
        SessionDescription {
            kind: self.kind,
            sdp: self.sdp.clone(),
        }
    }
}

/// One entry of `calls/{pair}/candidates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub sender: Identity,
    pub candidate: IceCandidate,
    pub timestamp: i64,
}

impl CandidateRecord {
    pub fn new(sender: Identity, candidate: IceCandidate) -> Self {
        Self {
            sender,
            candidate,
            timestamp: now_millis(),
        }
    }
}

/// One entry of `chats/{pair}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Identity,
    pub receiver: Identity,
    pub message: String,
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn new(sender: Identity, receiver: Identity, message: impl Into<String>) -> Self {
        Self {
            sender,
            receiver,
            message: message.into(),
            timestamp: now_millis(),
        }
    }
}
