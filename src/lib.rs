pub use plcore::{
    CallError, CallId, CallPhase, CallRecord, CallRole, CandidateRecord, ChatMessage, IceCandidate,
    Identity, PairId, RecordType, SessionDescription, StorePath, error,
};

pub mod calls;
pub mod chat;
pub mod config;
pub mod media;
pub mod session;
pub mod store;
pub mod types;

pub use calls::{CallOrchestrator, CallSession};
pub use chat::{ChatChannel, ChatError};
pub use config::CallConfig;
pub use session::Session;
