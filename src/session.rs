//! The signed-in context: who we are, the store we talk through, and the call
//! machinery bound to that identity for as long as the sign-in lasts.

use crate::calls::CallOrchestrator;
use crate::chat::{ChatChannel, ChatError};
use crate::config::CallConfig;
use crate::media::MediaDevices;
use crate::store::SignalStore;
use log::info;
use plcore::{CallError, Identity};
use std::sync::Arc;

pub struct Session {
    identity: Identity,
    store: Arc<dyn SignalStore>,
    calls: Arc<CallOrchestrator>,
}

impl Session {
    /// Starts watching for calls addressed to `identity`.
    pub async fn sign_in(
        identity: Identity,
        store: Arc<dyn SignalStore>,
        media: Arc<dyn MediaDevices>,
        config: CallConfig,
    ) -> Result<Self, CallError> {
        if identity.is_empty() {
            return Err(CallError::MissingIdentity);
        }
        let calls = CallOrchestrator::start(identity.clone(), store.clone(), media, config).await?;
        info!("Signed in as {identity}");
        Ok(Self {
            identity,
            store,
            calls,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn calls(&self) -> &Arc<CallOrchestrator> {
        &self.calls
    }

    pub fn chat_with(&self, peer: Identity) -> Result<ChatChannel, ChatError> {
        ChatChannel::open(self.store.clone(), self.identity.clone(), peer)
    }

    /// Ends any call and releases every subscription held for this identity.
    pub async fn sign_out(self) {
        self.calls.shutdown().await;
        info!("Signed out {}", self.identity);
    }
}
