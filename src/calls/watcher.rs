use crate::store::{EventKind, SignalStore, StoreEvent, Subscription, SubscriptionId};
use dashmap::DashSet;
use log::{debug, info, warn};
use plcore::error::StoreError;
use plcore::{CallId, CallRecord, Identity, PairId, RecordType, StorePath};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// What the watcher hands to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// An offer addressed to us.
    Offer { pair: PairId, record: CallRecord },
    /// The callee's answer to a call we placed.
    Answer { pair: PairId, record: CallRecord },
    /// A call record involving us was deleted. `record` is its last value,
    /// if that still parsed as a record.
    Withdrawn {
        pair: PairId,
        record: Option<CallRecord>,
    },
}

/// Watches every call record for the signed-in identity.
///
/// Each `(pair, type, call_id)` is dispatched at most once; a removal clears
/// the keys of the call it removed so a later call on the same pair is seen
/// again.
pub struct IncomingCallWatcher {
    me: Identity,
    store: Arc<dyn SignalStore>,
    dispatched: DashSet<(PairId, RecordType, CallId)>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl IncomingCallWatcher {
    /// Subscribes to `calls` and returns the stream of relevant events.
    pub async fn start(
        me: Identity,
        store: Arc<dyn SignalStore>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalEvent>), StoreError> {
        let root = StorePath::calls();
        let mut subs: Vec<Subscription> = Vec::with_capacity(3);
        for kind in [
            EventKind::ChildAdded,
            EventKind::ChildChanged,
            EventKind::ChildRemoved,
        ] {
            match store.subscribe(&root, kind).await {
                Ok(sub) => subs.push(sub),
                Err(e) => {
                    for sub in &subs {
                        store.unsubscribe(sub.id()).await;
                    }
                    return Err(e);
                }
            }
        }
        let ids = subs.iter().map(Subscription::id).collect();
        let mut subs = subs.into_iter();
        let (Some(added), Some(changed), Some(removed)) = (subs.next(), subs.next(), subs.next())
        else {
            return Err(StoreError::Backend("watcher subscriptions missing".into()));
        };

        let watcher = Arc::new(Self {
            me,
            store,
            dispatched: DashSet::new(),
            subscriptions: Mutex::new(ids),
            pump: Mutex::new(None),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::pump(
            Arc::downgrade(&watcher),
            added,
            changed,
            removed,
            tx,
        ));
        *watcher.pump.lock().await = Some(handle);
        info!(target: "Call/Watcher", "Watching calls for {}", watcher.me);
        Ok((watcher, rx))
    }

    async fn pump(
        watcher: Weak<Self>,
        mut added: Subscription,
        mut changed: Subscription,
        mut removed: Subscription,
        tx: mpsc::UnboundedSender<SignalEvent>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                Some(event) = added.next() => event,
                Some(event) = changed.next() => event,
                Some(event) = removed.next() => event,
                else => break,
            };
            let Some(watcher) = watcher.upgrade() else {
                break;
            };
            if let Some(signal) = watcher.observe(event) {
                if tx.send(signal).is_err() {
                    break;
                }
            }
        }
        debug!(target: "Call/Watcher", "Watcher pump finished");
    }

    /// Classifies one change under `calls`. Irrelevant, malformed and
    /// already-dispatched records yield `None`.
    pub fn observe(&self, event: StoreEvent) -> Option<SignalEvent> {
        match event {
            StoreEvent::ChildAdded { key, value } | StoreEvent::ChildChanged { key, value } => {
                let pair = PairId::from_key(key);
                if !pair.involves(&self.me) {
                    return None;
                }
                let Some(record) = CallRecord::from_value(&value) else {
                    if value.get("type").is_some() {
                        warn!(target: "Call/Watcher", "Malformed call record at {pair}");
                    }
                    return None;
                };
                if record.receiver != self.me || record.sender == self.me {
                    return None;
                }
                let key = (pair.clone(), record.kind, record.call_id.clone());
                if !self.dispatched.insert(key) {
                    return None;
                }
                debug!(
                    target: "Call/Watcher",
                    "{} from {} on {pair}", record.kind, record.sender
                );
                Some(match record.kind {
                    RecordType::Offer => SignalEvent::Offer { pair, record },
                    RecordType::Answer => SignalEvent::Answer { pair, record },
                })
            }
            StoreEvent::ChildRemoved { key, value } => {
                let pair = PairId::from_key(key);
                if !pair.involves(&self.me) {
                    return None;
                }
                let record = CallRecord::from_value(&value);
                match &record {
                    Some(record) => self
                        .dispatched
                        .retain(|(p, _, id)| !(p == &pair && id == &record.call_id)),
                    None => self.dispatched.retain(|(p, _, _)| p != &pair),
                }
                Some(SignalEvent::Withdrawn { pair, record })
            }
            StoreEvent::Value { .. } => None,
        }
    }

    /// Releases every subscription. Idempotent.
    pub async fn stop(&self) {
        let ids = std::mem::take(&mut *self.subscriptions.lock().await);
        for id in ids {
            self.store.unsubscribe(id).await;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.dispatched.clear();
    }

    pub async fn is_running(&self) -> bool {
        !self.subscriptions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySignalStore;
    use serde_json::json;

    fn watcher_for(me: &str) -> IncomingCallWatcher {
        IncomingCallWatcher {
            me: Identity::new(me),
            store: Arc::new(InMemorySignalStore::new()),
            dispatched: DashSet::new(),
            subscriptions: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
        }
    }

    fn offer(from: &str, to: &str, call_id: &str) -> (String, serde_json::Value) {
        let pair = PairId::new(&Identity::new(from), &Identity::new(to));
        let record = CallRecord::offer(
            Identity::new(from),
            Identity::new(to),
            "v=0".into(),
            CallId::new(call_id),
        );
        (pair.as_str().to_string(), serde_json::to_value(record).unwrap())
    }

    #[test]
    fn test_offer_dispatched_once() {
        let watcher = watcher_for("bob");
        let (key, value) = offer("alice", "bob", "C1");

        let first = watcher.observe(StoreEvent::ChildAdded {
            key: key.clone(),
            value: value.clone(),
        });
        assert!(matches!(first, Some(SignalEvent::Offer { .. })));
        assert_eq!(
            watcher.observe(StoreEvent::ChildChanged { key, value }),
            None
        );
    }

    #[test]
    fn test_offers_for_others_ignored() {
        let watcher = watcher_for("carol");
        let (key, value) = offer("alice", "bob", "C1");
        assert_eq!(watcher.observe(StoreEvent::ChildAdded { key, value }), None);

        let watcher = watcher_for("alice");
        let (key, value) = offer("alice", "bob", "C1");
        assert_eq!(watcher.observe(StoreEvent::ChildAdded { key, value }), None);
    }

    #[test]
    fn test_answer_matched_on_receiver() {
        let watcher = watcher_for("alice");
        let (key, mut value) = offer("alice", "bob", "C1");
        let fields = CallRecord::answer_fields(&Identity::new("bob"), &Identity::new("alice"), "v=0 answer");
        for (k, v) in fields {
            value[k] = v;
        }
        let event = watcher.observe(StoreEvent::ChildChanged { key, value });
        let Some(SignalEvent::Answer { record, .. }) = event else {
            panic!("expected an answer, got {event:?}");
        };
        assert_eq!(record.sender, Identity::new("bob"));
        assert_eq!(record.call_id, CallId::new("C1"));
    }

    #[test]
    fn test_removal_clears_keys() {
        let watcher = watcher_for("bob");
        let (key, value) = offer("alice", "bob", "C1");
        assert!(
            watcher
                .observe(StoreEvent::ChildAdded {
                    key: key.clone(),
                    value: value.clone()
                })
                .is_some()
        );

        let removed = watcher.observe(StoreEvent::ChildRemoved {
            key: key.clone(),
            value: value.clone(),
        });
        assert!(matches!(
            removed,
            Some(SignalEvent::Withdrawn { record: Some(_), .. })
        ));
        assert!(
            watcher
                .observe(StoreEvent::ChildAdded { key, value })
                .is_some()
        );
    }

    #[test]
    fn test_malformed_records_ignored() {
        let watcher = watcher_for("bob");
        let key = PairId::new(&Identity::new("alice"), &Identity::new("bob"))
            .as_str()
            .to_string();
        assert_eq!(
            watcher.observe(StoreEvent::ChildAdded {
                key: key.clone(),
                value: json!({ "type": "offer", "sender": 7 }),
            }),
            None
        );
        assert_eq!(
            watcher.observe(StoreEvent::ChildAdded {
                key,
                value: json!({ "candidates": { "-0": { "sender": "alice" } } }),
            }),
            None
        );
    }

    #[tokio::test]
    async fn test_stop_releases_subscriptions() {
        let store = Arc::new(InMemorySignalStore::new());
        let (watcher, _events) = IncomingCallWatcher::start(Identity::new("bob"), store.clone())
            .await
            .unwrap();
        assert_eq!(store.subscription_count(), 3);
        assert!(watcher.is_running().await);

        watcher.stop().await;
        watcher.stop().await;
        assert_eq!(store.subscription_count(), 0);
        assert!(!watcher.is_running().await);
    }
}
