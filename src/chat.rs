//! Pairwise text chat under `chats/{pairId}`.

use crate::store::{EventKind, SignalStore, StoreEvent, Subscription};
use log::{debug, info, warn};
use plcore::error::StoreError;
use plcore::{ChatMessage, Identity, PairId, StorePath};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("invalid chat peer: {0}")]
    InvalidPeer(String),
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The conversation between the signed-in identity and one peer.
#[derive(Clone)]
pub struct ChatChannel {
    me: Identity,
    peer: Identity,
    pair: PairId,
    store: Arc<dyn SignalStore>,
}

impl ChatChannel {
    pub fn open(store: Arc<dyn SignalStore>, me: Identity, peer: Identity) -> Result<Self, ChatError> {
        if peer.is_empty() {
            return Err(ChatError::InvalidPeer("empty identity".into()));
        }
        if peer == me {
            return Err(ChatError::InvalidPeer(format!("{peer} is yourself")));
        }
        if !peer.is_email_like() {
            return Err(ChatError::InvalidPeer(format!("{peer} is not an email address")));
        }
        let pair = PairId::new(&me, &peer);
        debug!(target: "Chat", "Opened chat {pair}");
        Ok(Self {
            me,
            peer,
            pair,
            store,
        })
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn pair(&self) -> &PairId {
        &self.pair
    }

    /// Appends `text`, trimmed, to the conversation.
    pub async fn send(&self, text: &str) -> Result<ChatMessage, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let message = ChatMessage::new(self.me.clone(), self.peer.clone(), text);
        let value = serde_json::to_value(&message).map_err(StoreError::from)?;
        let key = self.store.append(&StorePath::chat(&self.pair), value).await?;
        debug!(target: "Chat", "Sent {key} to {}", self.peer);
        Ok(message)
    }

    /// Every message so far, oldest first.
    pub async fn history(&self) -> Result<Vec<ChatMessage>, ChatError> {
        let Some(value) = self.store.read(&StorePath::chat(&self.pair)).await? else {
            return Ok(Vec::new());
        };
        let mut messages: Vec<ChatMessage> = value
            .as_object()
            .into_iter()
            .flat_map(|children| children.iter())
            .filter_map(|(key, child)| match serde_json::from_value(child.clone()) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(target: "Chat", "Skipping malformed message {key}: {e}");
                    None
                }
            })
            .collect();
        messages.sort_by_key(|message| message.timestamp);
        Ok(messages)
    }

    /// Existing messages in append order, then new ones as they arrive.
    pub async fn subscribe(&self) -> Result<ChatFeed, ChatError> {
        let subscription = self
            .store
            .subscribe(&StorePath::chat(&self.pair), EventKind::ChildAdded)
            .await?;
        info!(target: "Chat", "Listening to {} ({})", self.peer, subscription.id());
        Ok(ChatFeed {
            subscription,
            store: self.store.clone(),
        })
    }
}

pub struct ChatFeed {
    subscription: Subscription,
    store: Arc<dyn SignalStore>,
}

impl ChatFeed {
    /// The next message, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<ChatMessage> {
        while let Some(event) = self.subscription.next().await {
            let StoreEvent::ChildAdded { key, value } = event else {
                continue;
            };
            match serde_json::from_value(value) {
                Ok(message) => return Some(message),
                Err(e) => warn!(target: "Chat", "Skipping malformed message {key}: {e}"),
            }
        }
        None
    }

    pub async fn close(self) {
        self.store.unsubscribe(self.subscription.id()).await;
    }
}
