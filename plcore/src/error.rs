//! Error taxonomy shared by the store client, the media capability and calls.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no value at {0}")]
    NotFound(String),

    #[error("value already present at {0}")]
    AlreadyExists(String),

    #[error("invalid store path: {0}")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("session description rejected: {0}")]
    Description(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("media connection closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("invalid peer: {0}")]
    InvalidPeer(String),

    #[error("call already in progress")]
    CallAlreadyActive,

    #[error("could not acquire local media: {0}")]
    MediaAcquisitionFailed(#[source] MediaError),

    #[error("signaling write failed: {0}")]
    SignalingWriteFailed(#[from] StoreError),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(#[source] MediaError),

    #[error("connectivity lost")]
    ConnectivityLost,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] crate::state::InvalidTransition),

    #[error("no incoming call is waiting for a decision")]
    NoPendingCall,

    #[error("signed out")]
    SignedOut,

    #[error("cannot sign in without an identity")]
    MissingIdentity,
}
