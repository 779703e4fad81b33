//! Media capability consumed by the call core.
//!
//! Capture devices and the peer-connection/ICE machinery are external; the
//! call session only drives them through these traits. Connection callbacks
//! (local candidate discovered, remote track, connectivity changes) are
//! delivered as [`ConnectionEvent`]s into a channel registered with
//! [`MediaConnection::set_event_sink`].

pub mod loopback;

use async_trait::async_trait;
use plcore::error::MediaError;
use plcore::{IceCandidate, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use loopback::{LoopbackConnection, LoopbackMedia, LoopbackOptions, LoopbackStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
        }
    }
}

/// Aggregate connectivity of a media connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Transient; may recover on its own.
    Disconnected,
    Failed,
    Closed,
}

/// State of the ICE agent alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub stream_id: String,
    pub track: MediaTrack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ConnectionState(ConnectionState),
    IceConnectionState(IceConnectionState),
}

/// A local capture stream.
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<MediaTrack>;

    /// Flips the first track of `kind` and returns its new enabled state, or
    /// `None` if the stream has no such track.
    fn toggle(&self, kind: TrackKind) -> Option<bool>;

    fn is_enabled(&self, kind: TrackKind) -> Option<bool>;

    /// Stops every track. Idempotent.
    fn stop(&self);
}

#[async_trait]
pub trait MediaConnection: Send + Sync {
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<ConnectionEvent>);

    fn add_track(&self, track: &MediaTrack) -> Result<(), MediaError>;

    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), MediaError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    fn connection_state(&self) -> ConnectionState;

    fn restart_ice(&self);

    /// Tears the connection down. Idempotent.
    fn close(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, MediaError>;

    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn MediaConnection>, MediaError>;
}
