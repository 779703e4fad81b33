//! In-process media engine.
//!
//! Produces synthetic descriptions and candidates and reports connectivity
//! once both descriptions are applied and a remote candidate arrived. Every
//! connection and stream it hands out stays reachable through
//! [`LoopbackMedia`] so a driver (a test, the demo binary) can inspect what
//! the call core did and inject connectivity changes.

use super::{
    ConnectionEvent, ConnectionState, IceConnectionState, IceServer, LocalMedia, MediaConnection,
    MediaConstraints, MediaDevices, MediaTrack, RemoteTrack, TrackKind,
};
use async_trait::async_trait;
use log::debug;
use plcore::error::MediaError;
use plcore::{IceCandidate, RecordType, SessionDescription};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Fail capture with a permission error.
    pub deny_media: bool,
    /// Simulated time spent waiting for capture.
    pub acquire_delay: Option<Duration>,
    /// Local candidates announced after each local description.
    pub candidates_per_description: usize,
    /// Report `Connected` automatically once negotiation completes.
    pub auto_connect: bool,
    /// Reject every remote description.
    pub reject_remote_description: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            deny_media: false,
            acquire_delay: None,
            candidates_per_description: 2,
            auto_connect: true,
            reject_remote_description: false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LoopbackMedia {
    label: String,
    options: LoopbackOptions,
    streams: Mutex<Vec<Arc<LoopbackStream>>>,
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
}

impl LoopbackMedia {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Self::with_options(label, LoopbackOptions::default())
    }

    pub fn with_options(label: impl Into<String>, options: LoopbackOptions) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            options,
            streams: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn streams(&self) -> Vec<Arc<LoopbackStream>> {
        lock(&self.streams).clone()
    }

    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        lock(&self.connections).clone()
    }

    pub fn last_connection(&self) -> Option<Arc<LoopbackConnection>> {
        lock(&self.connections).last().cloned()
    }
}

#[async_trait]
impl MediaDevices for LoopbackMedia {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, MediaError> {
        let options = &self.options;
        if let Some(delay) = options.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if options.deny_media {
            return Err(MediaError::PermissionDenied(format!(
                "{}: camera/microphone access denied",
                self.label
            )));
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::DeviceUnavailable(
                "no audio or video requested".into(),
            ));
        }

        let index = lock(&self.streams).len();
        let stream = Arc::new(LoopbackStream::new(
            &format!("{}-stream{index}", self.label),
            constraints,
        ));
        lock(&self.streams).push(stream.clone());
        Ok(stream)
    }

    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn MediaConnection>, MediaError> {
        let options = self.options.clone();
        let index = lock(&self.connections).len();
        let connection = Arc::new(LoopbackConnection::new(
            format!("{}-pc{index}", self.label),
            options,
            ice_servers.len(),
        ));
        lock(&self.connections).push(connection.clone());
        Ok(connection)
    }
}

struct LoopbackTrack {
    track: MediaTrack,
    enabled: AtomicBool,
}

pub struct LoopbackStream {
    tracks: Vec<LoopbackTrack>,
    stopped: AtomicBool,
}

impl LoopbackStream {
    fn new(id: &str, constraints: &MediaConstraints) -> Self {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LoopbackTrack {
                track: MediaTrack {
                    id: format!("{id}-audio"),
                    kind: TrackKind::Audio,
                },
                enabled: AtomicBool::new(true),
            });
        }
        if constraints.video {
            tracks.push(LoopbackTrack {
                track: MediaTrack {
                    id: format!("{id}-video"),
                    kind: TrackKind::Video,
                },
                enabled: AtomicBool::new(true),
            });
        }
        Self {
            tracks,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn first(&self, kind: TrackKind) -> Option<&LoopbackTrack> {
        self.tracks.iter().find(|t| t.track.kind == kind)
    }
}

impl LocalMedia for LoopbackStream {
    fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.iter().map(|t| t.track.clone()).collect()
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let track = self.first(kind)?;
        let enabled = !track.enabled.load(Ordering::SeqCst);
        track.enabled.store(enabled, Ordering::SeqCst);
        Some(enabled)
    }

    fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.first(kind).map(|t| t.enabled.load(Ordering::SeqCst))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ConnectionInner {
    sink: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    tracks: Vec<MediaTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    state: Option<ConnectionState>,
    closed: bool,
}

pub struct LoopbackConnection {
    id: String,
    options: LoopbackOptions,
    ice_servers: usize,
    inner: Mutex<ConnectionInner>,
    ice_restarts: AtomicU32,
    candidates_emitted: AtomicU32,
}

impl LoopbackConnection {
    fn new(id: String, options: LoopbackOptions, ice_servers: usize) -> Self {
        Self {
            id,
            options,
            ice_servers,
            inner: Mutex::new(ConnectionInner::default()),
            ice_restarts: AtomicU32::new(0),
            candidates_emitted: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ice_server_count(&self) -> usize {
        self.ice_servers
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        lock(&self.inner).tracks.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).remote_candidates.clone()
    }

    pub fn ice_restarts(&self) -> u32 {
        self.ice_restarts.load(Ordering::SeqCst)
    }

    /// Delivers `event` as if the underlying engine raised it.
    pub fn emit(&self, event: ConnectionEvent) {
        let mut inner = lock(&self.inner);
        if let ConnectionEvent::ConnectionState(state) = event {
            inner.state = Some(state);
        }
        if let Some(sink) = &inner.sink {
            let _ = sink.send(event);
        }
    }

    /// Changes the aggregate connectivity state and reports it.
    pub fn set_state(&self, state: ConnectionState) {
        self.emit(ConnectionEvent::ConnectionState(state));
    }

    fn synthetic_sdp(&self, kind: RecordType, tracks: &[MediaTrack]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=type:{kind}\r\n",
            self.id
        );
        for track in tracks {
            let media = match track.kind {
                TrackKind::Audio => "audio 9 UDP/TLS/RTP/SAVPF 111",
                TrackKind::Video => "video 9 UDP/TLS/RTP/SAVPF 96",
            };
            sdp.push_str(&format!("m={media}\r\na=msid:{} {}\r\n", self.id, track.id));
        }
        sdp
    }

    fn announce_candidates(&self, inner: &ConnectionInner) {
        let Some(sink) = &inner.sink else {
            return;
        };
        for _ in 0..self.options.candidates_per_description {
            let n = self.candidates_emitted.fetch_add(1, Ordering::SeqCst);
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host ufrag {}",
                    50000 + n,
                    self.id
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            };
            let _ = sink.send(ConnectionEvent::LocalCandidate(candidate));
        }
    }

    fn maybe_connect(&self, inner: &mut ConnectionInner) {
        if !self.options.auto_connect
            || inner.closed
            || inner.state == Some(ConnectionState::Connected)
            || inner.local.is_none()
            || inner.remote.is_none()
            || inner.remote_candidates.is_empty()
        {
            return;
        }
        inner.state = Some(ConnectionState::Connected);
        if let Some(sink) = &inner.sink {
            let _ = sink.send(ConnectionEvent::IceConnectionState(
                IceConnectionState::Connected,
            ));
            let _ = sink.send(ConnectionEvent::ConnectionState(ConnectionState::Connecting));
            let _ = sink.send(ConnectionEvent::ConnectionState(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl MediaConnection for LoopbackConnection {
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<ConnectionEvent>) {
        lock(&self.inner).sink = Some(sink);
    }

    fn add_track(&self, track: &MediaTrack) -> Result<(), MediaError> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(MediaError::Closed);
        }
        inner.tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let inner = lock(&self.inner);
        if inner.closed {
            return Err(MediaError::Closed);
        }
        Ok(SessionDescription::offer(
            self.synthetic_sdp(RecordType::Offer, &inner.tracks),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let inner = lock(&self.inner);
        if inner.closed {
            return Err(MediaError::Closed);
        }
        if inner.remote.is_none() {
            return Err(MediaError::Description(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(SessionDescription::answer(
            self.synthetic_sdp(RecordType::Answer, &inner.tracks),
        ))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(MediaError::Closed);
        }
        inner.local = Some(description);
        self.announce_candidates(&inner);
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(MediaError::Closed);
        }
        if self.options.reject_remote_description {
            return Err(MediaError::Description(format!(
                "{}: remote {} rejected",
                self.id, description.kind
            )));
        }
        let stream_id = format!("{}-remote", self.id);
        let remote_tracks: Vec<RemoteTrack> = description
            .sdp
            .lines()
            .filter_map(|line| line.strip_prefix("m="))
            .enumerate()
            .map(|(i, media)| RemoteTrack {
                stream_id: stream_id.clone(),
                track: MediaTrack {
                    id: format!("{stream_id}-{i}"),
                    kind: if media.starts_with("video") {
                        TrackKind::Video
                    } else {
                        TrackKind::Audio
                    },
                },
            })
            .collect();
        inner.remote = Some(description);
        if let Some(sink) = &inner.sink {
            for track in remote_tracks {
                let _ = sink.send(ConnectionEvent::RemoteTrack(track));
            }
        }
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(MediaError::Closed);
        }
        if inner.remote.is_none() {
            return Err(MediaError::Candidate(
                "remote description not set".into(),
            ));
        }
        debug!(target: "Media/Loopback", "{} <- {}", self.id, candidate.candidate);
        inner.remote_candidates.push(candidate);
        self.maybe_connect(&mut inner);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        let inner = lock(&self.inner);
        if inner.closed {
            return ConnectionState::Closed;
        }
        inner.state.unwrap_or(ConnectionState::New)
    }

    fn restart_ice(&self) {
        self.ice_restarts.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        inner.state = Some(ConnectionState::Closed);
        inner.sink = None;
    }
}
