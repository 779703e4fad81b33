//! Client contract for the shared pub/sub key-value store that carries all
//! signaling between the two participants of a call.
//!
//! Values are JSON trees addressed by [`StorePath`]. Change notifications are
//! delivered through a [`Subscription`], one FIFO channel per registration;
//! there is no ordering guarantee between different subscriptions.

pub mod memory;

use async_trait::async_trait;
use plcore::StorePath;
use plcore::error::StoreError;
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::mpsc;

pub use memory::InMemorySignalStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Predicate evaluated atomically against the current value by
/// [`SignalStore::remove_if`] and [`SignalStore::patch_if`].
pub type ValuePredicate<'a> = &'a (dyn Fn(&Value) -> bool + Send + Sync);

/// Which changes a subscription observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The whole value at the path; the current value is delivered first.
    Value,
    /// A direct child appeared; existing children are replayed in key order.
    ChildAdded,
    /// A direct child, or anything below it, changed.
    ChildChanged,
    /// A direct child was deleted.
    ChildRemoved,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Value { value: Option<Value> },
    ChildAdded { key: String, value: Value },
    ChildChanged { key: String, value: Value },
    /// Carries the last value the child had.
    ChildRemoved { key: String, value: Value },
}

impl StoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Value { .. } => EventKind::Value,
            Self::ChildAdded { .. } => EventKind::ChildAdded,
            Self::ChildChanged { .. } => EventKind::ChildChanged,
            Self::ChildRemoved { .. } => EventKind::ChildRemoved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// A live registration. Events stop once [`SignalStore::unsubscribe`] is
/// called with its id, after which `next` drains what was queued and returns
/// `None`.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    path: StorePath,
    kind: EventKind,
    events: mpsc::UnboundedReceiver<StoreEvent>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        path: StorePath,
        kind: EventKind,
        events: mpsc::UnboundedReceiver<StoreEvent>,
    ) -> Self {
        Self {
            id,
            path,
            kind,
            events,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.events.recv().await
    }

    /// Non-blocking variant of [`Subscription::next`].
    pub fn try_next(&mut self) -> Option<StoreEvent> {
        self.events.try_recv().ok()
    }
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Creates or replaces the value at `path`.
    async fn write(&self, path: &StorePath, value: Value) -> Result<()>;

    /// Writes only if nothing is stored at `path`, failing with
    /// [`StoreError::AlreadyExists`] otherwise.
    async fn create(&self, path: &StorePath, value: Value) -> Result<()>;

    /// Merges `fields` into the existing object at `path`, leaving other
    /// fields and children alone. Fails with [`StoreError::NotFound`] if there
    /// is no object there.
    async fn patch(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()>;

    /// Like [`SignalStore::patch`], but only while `predicate` accepts the
    /// object currently at `path`. A rejected value fails with
    /// [`StoreError::NotFound`], as if it had already been deleted.
    async fn patch_if(
        &self,
        path: &StorePath,
        predicate: ValuePredicate<'_>,
        fields: Map<String, Value>,
    ) -> Result<()>;

    /// Adds `value` under a freshly generated child key of `path` and returns
    /// the key. Keys sort in append order.
    async fn append(&self, path: &StorePath, value: Value) -> Result<String>;

    /// Deletes the subtree rooted at `path`. Removing nothing is not an error.
    async fn remove(&self, path: &StorePath) -> Result<()>;

    /// Deletes the subtree at `path` only if `predicate` accepts the value
    /// currently stored there. Returns whether anything was removed.
    async fn remove_if(&self, path: &StorePath, predicate: ValuePredicate<'_>) -> Result<bool>;

    async fn read(&self, path: &StorePath) -> Result<Option<Value>>;

    async fn subscribe(&self, path: &StorePath, kind: EventKind) -> Result<Subscription>;

    /// Stops delivery to the subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId);
}
