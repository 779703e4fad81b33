use crate::media::{IceServer, MediaConstraints};
use std::time::Duration;

/// Tuning for the call core.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Servers handed to every media connection.
    pub ice_servers: Vec<IceServer>,
    /// What to capture for a call.
    pub constraints: MediaConstraints,
    /// How long a `failed` connection may stay failed before the call ends.
    pub reconnect_grace: Duration,
    /// How long an offer may go unanswered before the caller gives up.
    /// `None` waits until `end_call`.
    pub ring_timeout: Option<Duration>,
    /// Buffer size of each event bus channel.
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun2.l.google.com:19302"),
            ],
            constraints: MediaConstraints::default(),
            reconnect_grace: Duration::from_secs(5),
            ring_timeout: Some(Duration::from_secs(45)),
            event_capacity: 100,
        }
    }
}
