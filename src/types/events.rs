use crate::media::RemoteTrack;
use plcore::{CallId, CallPhase, Identity, PairId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        /// UI layers subscribe to the channels they care about.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self::with_capacity(CHANNEL_CAPACITY)
            }

            pub fn with_capacity(capacity: usize) -> Self {
                let capacity = capacity.max(1);
                Self {
                    $(
                        $field: broadcast::channel(capacity).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Call lifecycle
    (phase_changed, Arc<PhaseChanged>),
    (call_ended, Arc<CallEnded>),
    (remote_track, Arc<RemoteTrackAvailable>),

    // Inbound offers
    (incoming_call, Arc<IncomingCall>),
    (incoming_cancelled, Arc<IncomingCallCancelled>),

    // User-visible notices
    (notice, Arc<Notice>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseChanged {
    pub peer: Option<Identity>,
    pub previous: CallPhase,
    pub phase: CallPhase,
}

/// Why a call went back to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `end_call` from the UI.
    LocalHangup,
    MediaAcquisitionFailed,
    NegotiationFailed,
    SignalingWriteFailed,
    /// The other side won the record slot.
    Glare,
    /// Connectivity stayed failed past the grace period.
    ConnectivityLost,
    /// The offer went unanswered.
    RingTimeout,
    SignedOut,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LocalHangup => "call ended",
            Self::MediaAcquisitionFailed => "could not access camera or microphone",
            Self::NegotiationFailed => "call setup failed",
            Self::SignalingWriteFailed => "could not reach the signaling store",
            Self::Glare => "call already in progress",
            Self::ConnectivityLost => "call ended: connection lost",
            Self::RingTimeout => "no answer",
            Self::SignedOut => "signed out",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEnded {
    pub peer: Identity,
    pub call_id: CallId,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackAvailable {
    pub peer: Identity,
    pub track: RemoteTrack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub pair: PairId,
    pub from: Identity,
    pub call_id: CallId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallCancelled {
    pub pair: PairId,
    pub from: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The peer deleted the call record (declined or hung up).
    PeerLeft { peer: Identity },
    /// An offer arrived while busy and was turned down automatically.
    AutoRejected { from: Identity },
    CallEnded { peer: Identity, reason: EndReason },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerLeft { peer } => write!(f, "{peer} left the call"),
            Self::AutoRejected { from } => write!(f, "missed call from {from} (busy)"),
            Self::CallEnded { peer, reason } => write!(f, "{reason} ({peer})"),
        }
    }
}
