//! Call phase state machine.

use serde::Serialize;
use std::fmt;

/// Phase of the local call session. `Idle` is both initial and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    /// Outgoing call: acquiring media and producing the offer.
    Requesting,
    /// Offer/answer exchange in flight, candidates flowing.
    Negotiating,
    /// Media connectivity established.
    Connected,
    /// Releasing everything on the way back to `Idle`.
    Terminating,
}

impl CallPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Candidates are exchanged only once the record slot is ours.
    pub fn exchanges_candidates(&self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }

    pub fn apply(self, transition: CallTransition) -> Result<CallPhase, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Idle, CallTransition::Dial) => Self::Requesting,
            (Self::Requesting, CallTransition::OfferPublished) => Self::Negotiating,
            (Self::Idle, CallTransition::OfferAccepted) => Self::Negotiating,
            (Self::Negotiating, CallTransition::AnswerApplied) => Self::Negotiating,
            (Self::Negotiating | Self::Connected, CallTransition::MediaConnected) => {
                Self::Connected
            }
            (
                Self::Requesting | Self::Negotiating | Self::Connected,
                CallTransition::Hangup,
            ) => Self::Terminating,
            (Self::Terminating, CallTransition::Released) => Self::Idle,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{current:?}"),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side of the call the local participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// `start_call` passed its guards.
    Dial,
    /// Our offer was written to the record slot.
    OfferPublished,
    /// An inbound offer was accepted locally.
    OfferAccepted,
    /// The callee's answer was applied as remote description.
    AnswerApplied,
    /// The media connection reported established connectivity.
    MediaConnected,
    /// `end_call` or an unrecoverable failure.
    Hangup,
    /// Every resource has been released.
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flow: Idle → Requesting → Negotiating → Connected → Terminating → Idle
    #[test]
    fn test_outgoing_call_flow() {
        let mut phase = CallPhase::Idle;
        phase = phase.apply(CallTransition::Dial).unwrap();
        assert_eq!(phase, CallPhase::Requesting);
        assert!(!phase.exchanges_candidates());

        phase = phase.apply(CallTransition::OfferPublished).unwrap();
        assert_eq!(phase, CallPhase::Negotiating);
        assert!(phase.exchanges_candidates());

        phase = phase.apply(CallTransition::AnswerApplied).unwrap();
        assert_eq!(phase, CallPhase::Negotiating);

        phase = phase.apply(CallTransition::MediaConnected).unwrap();
        assert_eq!(phase, CallPhase::Connected);

        phase = phase.apply(CallTransition::Hangup).unwrap();
        assert_eq!(phase, CallPhase::Terminating);

        phase = phase.apply(CallTransition::Released).unwrap();
        assert!(phase.is_idle());
    }

    /// Flow: Idle → Negotiating → Connected
    #[test]
    fn test_incoming_call_flow() {
        let phase = CallPhase::Idle
            .apply(CallTransition::OfferAccepted)
            .unwrap()
            .apply(CallTransition::MediaConnected)
            .unwrap();
        assert_eq!(phase, CallPhase::Connected);

        // Connectivity may bounce and recover without leaving Connected.
        assert_eq!(
            phase.apply(CallTransition::MediaConnected).unwrap(),
            CallPhase::Connected
        );
    }

    #[test]
    fn test_hangup_allowed_from_every_active_phase() {
        for phase in [
            CallPhase::Requesting,
            CallPhase::Negotiating,
            CallPhase::Connected,
        ] {
            assert_eq!(
                phase.apply(CallTransition::Hangup).unwrap(),
                CallPhase::Terminating
            );
        }
        assert!(CallPhase::Idle.apply(CallTransition::Hangup).is_err());
        assert!(CallPhase::Terminating.apply(CallTransition::Hangup).is_err());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(CallPhase::Idle.apply(CallTransition::MediaConnected).is_err());
        assert!(CallPhase::Requesting.apply(CallTransition::AnswerApplied).is_err());
        assert!(CallPhase::Connected.apply(CallTransition::AnswerApplied).is_err());
        assert!(CallPhase::Negotiating.apply(CallTransition::Dial).is_err());

        let err = CallPhase::Idle.apply(CallTransition::Released).unwrap_err();
        assert_eq!(err.to_string(), "invalid transition Released in state Idle");
    }
}
