//! Runtime-independent core of peerline.
//!
//! Everything here is plain data and pure logic: participant identities and
//! their pair identifiers, the shared-store path layout, the signaling records
//! exchanged through the store, the call phase state machine and the error
//! taxonomy. The async runtime, the store client and the media capability live
//! in the `peerline` crate.

pub mod error;
pub mod identity;
pub mod paths;
pub mod records;
pub mod state;

pub use error::{CallError, MediaError, StoreError};
pub use identity::{Identity, PairId};
pub use paths::StorePath;
pub use records::{
    CallId, CallRecord, CandidateRecord, ChatMessage, IceCandidate, RecordType,
    SessionDescription,
};
pub use state::{CallPhase, CallRole, CallTransition, InvalidTransition};
