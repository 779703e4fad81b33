//! One-to-one call signaling over the shared store.
//!
//! # Architecture
//!
//! - [`CallSession`]: the per-user state machine for a single call
//!   (`Idle → Requesting → Negotiating → Connected → Terminating → Idle`)
//! - [`IncomingCallWatcher`]: classifies changes under `calls` into offers,
//!   answers and withdrawals addressed to the signed-in identity
//! - [`CallOrchestrator`]: owns the session, holds at most one pending
//!   inbound offer and declines what arrives while busy
//!
//! # Store layout
//!
//! The record for a pair lives at `calls/{pairId}` and is created by the
//! caller, patched once by the callee into an answer, and deleted by whoever
//! ends the call. Candidates are appended under `calls/{pairId}/candidates`
//! and go away with the record.

mod orchestrator;
mod session;
mod watcher;

pub use orchestrator::CallOrchestrator;
pub use plcore::{CallPhase, CallRole, CallTransition, InvalidTransition};
pub use session::{CallSession, SessionSnapshot};
pub use watcher::{IncomingCallWatcher, SignalEvent};
