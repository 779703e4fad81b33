use super::{
    EventKind, Result, SignalStore, StoreEvent, Subscription, SubscriptionId, ValuePredicate,
};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use plcore::StorePath;
use plcore::error::StoreError;
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};

struct Listener {
    path: StorePath,
    kind: EventKind,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

/// A process-local store holding one JSON tree, for tests and demos.
///
/// Every mutation runs under the tree's write lock and queues its change
/// events before the lock is released, so each subscription sees changes in
/// write order.
pub struct InMemorySignalStore {
    root: RwLock<Value>,
    listeners: DashMap<u64, Listener>,
    next_subscription: AtomicU64,
    /// (millis, sequence) of the last generated append key.
    last_key: Mutex<(i64, u32)>,
    /// Mutations under any of these prefixes fail with a backend error.
    failing: DashMap<StorePath, String>,
}

impl Default for InMemorySignalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySignalStore {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Value::Object(Map::new())),
            listeners: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            last_key: Mutex::new((0, 0)),
            failing: DashMap::new(),
        }
    }

    /// Makes every mutation at or below `prefix` fail until
    /// [`InMemorySignalStore::clear_failures`] is called.
    pub fn fail_writes_under(&self, prefix: StorePath, reason: impl Into<String>) {
        self.failing.insert(prefix, reason.into());
    }

    pub fn clear_failures(&self) {
        self.failing.clear();
    }

    pub fn subscription_count(&self) -> usize {
        self.listeners.len()
    }

    /// Copy of the whole tree.
    pub async fn snapshot(&self) -> Value {
        self.root.read().await.clone()
    }

    fn check_writable(&self, path: &StorePath) -> Result<()> {
        for entry in self.failing.iter() {
            if path.starts_with(entry.key()) {
                return Err(StoreError::Backend(entry.value().clone()));
            }
        }
        Ok(())
    }

    fn next_push_key(&self) -> String {
        let now = plcore::records::now_millis();
        let mut last = self
            .last_key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if now > last.0 {
            *last = (now, 0);
        } else {
            last.1 += 1;
        }
        format!("-{:012x}{:06x}", last.0, last.1)
    }

    /// Applies `op` to the tree and notifies every listener whose view changed.
    async fn mutate<T>(
        &self,
        path: &StorePath,
        op: impl FnOnce(&mut Value) -> Result<T>,
    ) -> Result<T> {
        self.check_writable(path)?;

        let mut root = self.root.write().await;

        let affected: Vec<(u64, StorePath, EventKind)> = self
            .listeners
            .iter()
            .filter(|l| l.path.starts_with(path) || path.starts_with(&l.path))
            .map(|l| (*l.key(), l.path.clone(), l.kind))
            .collect();
        let before: Vec<Option<Value>> = affected
            .iter()
            .map(|(_, listener_path, _)| get(&root, listener_path).cloned())
            .collect();

        let out = op(&mut root)?;

        let mut closed = Vec::new();
        for ((id, listener_path, kind), old) in affected.into_iter().zip(before) {
            let new = get(&root, &listener_path);
            let events = diff(kind, old.as_ref(), new);
            if events.is_empty() {
                continue;
            }
            let Some(listener) = self.listeners.get(&id) else {
                continue;
            };
            for event in events {
                trace!(target: "Store/Memory", "{listener_path} -> {event:?}");
                if listener.tx.send(event).is_err() {
                    closed.push(id);
                    break;
                }
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
        Ok(out)
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn write(&self, path: &StorePath, value: Value) -> Result<()> {
        self.mutate(path, |root| {
            set(root, path, value);
            Ok(())
        })
        .await
    }

    async fn create(&self, path: &StorePath, value: Value) -> Result<()> {
        self.mutate(path, |root| {
            if get(root, path).is_some() {
                return Err(StoreError::AlreadyExists(path.to_string()));
            }
            set(root, path, value);
            Ok(())
        })
        .await
    }

    async fn patch(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()> {
        self.patch_if(path, &|_| true, fields).await
    }

    async fn patch_if(
        &self,
        path: &StorePath,
        predicate: ValuePredicate<'_>,
        fields: Map<String, Value>,
    ) -> Result<()> {
        self.mutate(path, |root| {
            match get(root, path) {
                Some(current @ Value::Object(_)) if predicate(current) => {}
                _ => return Err(StoreError::NotFound(path.to_string())),
            }
            for (key, value) in fields {
                let field_path = path.child(&key)?;
                set(root, &field_path, value);
            }
            Ok(())
        })
        .await
    }

    async fn append(&self, path: &StorePath, value: Value) -> Result<String> {
        let key = self.next_push_key();
        let child = path.child(&key)?;
        self.mutate(&child, |root| {
            set(root, &child, value);
            Ok(())
        })
        .await?;
        Ok(key)
    }

    async fn remove(&self, path: &StorePath) -> Result<()> {
        self.mutate(path, |root| {
            delete(root, path);
            Ok(())
        })
        .await
    }

    async fn remove_if(&self, path: &StorePath, predicate: ValuePredicate<'_>) -> Result<bool> {
        self.mutate(path, |root| {
            let matches = get(root, path).is_some_and(predicate);
            if matches {
                delete(root, path);
            }
            Ok(matches)
        })
        .await
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>> {
        Ok(get(&*self.root.read().await, path).cloned())
    }

    async fn subscribe(&self, path: &StorePath, kind: EventKind) -> Result<Subscription> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        // Writers need the write lock, so nothing can slip between the replay
        // and the registration.
        let root = self.root.read().await;
        let current = get(&root, path);
        match kind {
            EventKind::Value => {
                let _ = tx.send(StoreEvent::Value {
                    value: current.cloned(),
                });
            }
            EventKind::ChildAdded => {
                if let Some(Value::Object(children)) = current {
                    for (key, value) in children {
                        let _ = tx.send(StoreEvent::ChildAdded {
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                }
            }
            EventKind::ChildChanged | EventKind::ChildRemoved => {}
        }
        self.listeners.insert(
            id,
            Listener {
                path: path.clone(),
                kind,
                tx,
            },
        );
        drop(root);

        debug!(target: "Store/Memory", "subscribed sub#{id} to {kind:?} on {path}");
        Ok(Subscription::new(SubscriptionId(id), path.clone(), kind, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        // Serialize with in-flight mutations so no event lands after this returns.
        let _root = self.root.write().await;
        if self.listeners.remove(&id.0).is_some() {
            debug!(target: "Store/Memory", "unsubscribed {id}");
        }
    }
}

fn get<'a>(root: &'a Value, path: &StorePath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

fn set(root: &mut Value, path: &StorePath, value: Value) {
    if value.is_null() {
        delete(root, path);
        return;
    }
    let Some((last, parents)) = path.segments().split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Some(map) = node.as_object_mut() else {
            return;
        };
        node = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Some(map) = node.as_object_mut() {
        map.insert(last.clone(), value);
    }
}

/// Removes the node at `path` and any ancestors left empty by it.
fn delete(root: &mut Value, path: &StorePath) {
    let segments = path.segments();
    if segments.is_empty() {
        *root = Value::Object(Map::new());
        return;
    }
    delete_in(root, segments);
}

fn delete_in(node: &mut Value, segments: &[String]) -> bool {
    let Some(map) = node.as_object_mut() else {
        return false;
    };
    match segments {
        [] => false,
        [last] => {
            map.remove(last);
            map.is_empty()
        }
        [head, rest @ ..] => {
            let now_empty = match map.get_mut(head) {
                Some(child) => delete_in(child, rest),
                None => false,
            };
            if now_empty {
                map.remove(head);
            }
            map.is_empty()
        }
    }
}

fn children(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value.and_then(Value::as_object)
}

fn diff(kind: EventKind, old: Option<&Value>, new: Option<&Value>) -> Vec<StoreEvent> {
    let empty = Map::new();
    match kind {
        EventKind::Value => {
            if old == new {
                Vec::new()
            } else {
                vec![StoreEvent::Value {
                    value: new.cloned(),
                }]
            }
        }
        EventKind::ChildAdded => {
            let before = children(old).unwrap_or(&empty);
            children(new)
                .unwrap_or(&empty)
                .iter()
                .filter(|(key, _)| !before.contains_key(*key))
                .map(|(key, value)| StoreEvent::ChildAdded {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect()
        }
        EventKind::ChildChanged => {
            let before = children(old).unwrap_or(&empty);
            children(new)
                .unwrap_or(&empty)
                .iter()
                .filter(|(key, value)| before.get(*key).is_some_and(|prev| prev != *value))
                .map(|(key, value)| StoreEvent::ChildChanged {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect()
        }
        EventKind::ChildRemoved => {
            let after = children(new).unwrap_or(&empty);
            children(old)
                .unwrap_or(&empty)
                .iter()
                .filter(|(key, _)| !after.contains_key(*key))
                .map(|(key, value)| StoreEvent::ChildRemoved {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> StorePath {
        StorePath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let store = InMemorySignalStore::new();
        store.write(&path("calls/p"), json!({"a": 1})).await.unwrap();
        assert_eq!(store.read(&path("calls/p/a")).await.unwrap(), Some(json!(1)));

        store.remove(&path("calls/p")).await.unwrap();
        assert_eq!(store.read(&path("calls/p")).await.unwrap(), None);
        // Empty parents are pruned.
        assert_eq!(store.snapshot().await, json!({}));
    }

    #[tokio::test]
    async fn test_create_refuses_to_overwrite() {
        let store = InMemorySignalStore::new();
        store.create(&path("calls/p"), json!({"v": 1})).await.unwrap();
        let err = store.create(&path("calls/p"), json!({"v": 2})).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.read(&path("calls/p/v")).await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_patch_merges_and_keeps_children() {
        let store = InMemorySignalStore::new();
        store
            .write(&path("calls/p"), json!({"type": "offer", "sdp": "o"}))
            .await
            .unwrap();
        store.append(&path("calls/p/candidates"), json!({"c": 1})).await.unwrap();

        let mut fields = Map::new();
        fields.insert("type".into(), json!("answer"));
        store.patch(&path("calls/p"), fields).await.unwrap();

        let node = store.read(&path("calls/p")).await.unwrap().unwrap();
        assert_eq!(node["type"], "answer");
        assert_eq!(node["sdp"], "o");
        assert_eq!(node["candidates"].as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_patch_missing_record_fails() {
        let store = InMemorySignalStore::new();
        let err = store.patch(&path("calls/p"), Map::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.read(&path("calls/p")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_patch_if_leaves_rejected_value_alone() {
        let store = InMemorySignalStore::new();
        store.append(&path("calls/p/candidates"), json!({"c": 1})).await.unwrap();
        let before = store.read(&path("calls/p")).await.unwrap();

        let mut fields = Map::new();
        fields.insert("type".into(), json!("answer"));
        let is_offer = |v: &Value| v["type"] == "offer";
        let err = store
            .patch_if(&path("calls/p"), &is_offer, fields.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.read(&path("calls/p")).await.unwrap(), before);

        store
            .write(&path("calls/p/type"), json!("offer"))
            .await
            .unwrap();
        store.patch_if(&path("calls/p"), &is_offer, fields).await.unwrap();
        assert_eq!(
            store.read(&path("calls/p/type")).await.unwrap(),
            Some(json!("answer"))
        );
    }

    #[tokio::test]
    async fn test_append_keys_sort_in_append_order() {
        let store = InMemorySignalStore::new();
        let mut keys = Vec::new();
        for i in 0..50 {
            keys.push(store.append(&path("chats/p"), json!(i)).await.unwrap());
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_child_added_replays_then_follows() {
        let store = InMemorySignalStore::new();
        store.append(&path("calls/p/candidates"), json!(1)).await.unwrap();
        store.append(&path("calls/p/candidates"), json!(2)).await.unwrap();

        let mut sub = store
            .subscribe(&path("calls/p/candidates"), EventKind::ChildAdded)
            .await
            .unwrap();
        store.append(&path("calls/p/candidates"), json!(3)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match sub.next().await.unwrap() {
                StoreEvent::ChildAdded { value, .. } => seen.push(value),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_child_changed_fires_for_nested_updates() {
        let store = InMemorySignalStore::new();
        store.write(&path("calls/p"), json!({"type": "offer"})).await.unwrap();
        let mut sub = store
            .subscribe(&StorePath::calls(), EventKind::ChildChanged)
            .await
            .unwrap();

        store.append(&path("calls/p/candidates"), json!({"x": 1})).await.unwrap();
        let event = sub.next().await.unwrap();
        assert!(matches!(event, StoreEvent::ChildChanged { ref key, .. } if key == "p"));
    }

    #[tokio::test]
    async fn test_child_removed_carries_last_value() {
        let store = InMemorySignalStore::new();
        store.write(&path("calls/p"), json!({"type": "offer"})).await.unwrap();
        let mut sub = store
            .subscribe(&StorePath::calls(), EventKind::ChildRemoved)
            .await
            .unwrap();
        store.remove(&path("calls/p")).await.unwrap();
        assert_eq!(
            sub.next().await.unwrap(),
            StoreEvent::ChildRemoved {
                key: "p".into(),
                value: json!({"type": "offer"})
            }
        );
    }

    #[tokio::test]
    async fn test_value_subscription_reports_current_then_removal() {
        let store = InMemorySignalStore::new();
        store.write(&path("calls/p"), json!({"v": 1})).await.unwrap();
        let mut sub = store.subscribe(&path("calls/p"), EventKind::Value).await.unwrap();
        assert_eq!(
            sub.next().await.unwrap(),
            StoreEvent::Value {
                value: Some(json!({"v": 1}))
            }
        );
        store.remove(&path("calls")).await.unwrap();
        assert_eq!(sub.next().await.unwrap(), StoreEvent::Value { value: None });
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let store = InMemorySignalStore::new();
        let mut sub = store
            .subscribe(&StorePath::calls(), EventKind::ChildAdded)
            .await
            .unwrap();
        assert_eq!(store.subscription_count(), 1);
        store.unsubscribe(sub.id()).await;
        assert_eq!(store.subscription_count(), 0);

        store.write(&path("calls/p"), json!({"v": 1})).await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_if_checks_current_value() {
        let store = InMemorySignalStore::new();
        store.write(&path("calls/p"), json!({"call_id": "A"})).await.unwrap();

        let is_b = |v: &Value| v["call_id"] == "B";
        assert!(!store.remove_if(&path("calls/p"), &is_b).await.unwrap());
        assert!(store.read(&path("calls/p")).await.unwrap().is_some());

        let is_a = |v: &Value| v["call_id"] == "A";
        assert!(store.remove_if(&path("calls/p"), &is_a).await.unwrap());
        assert!(store.read(&path("calls/p")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = InMemorySignalStore::new();
        store.fail_writes_under(path("calls"), "offline");
        let err = store.write(&path("calls/p"), json!(1)).await.unwrap_err();
        assert_eq!(err, StoreError::Backend("offline".into()));
        store.clear_failures();
        store.write(&path("calls/p"), json!(1)).await.unwrap();
    }
}
