#![allow(dead_code)]

use peerline::calls::CallOrchestrator;
use peerline::media::{LoopbackConnection, LoopbackMedia, LoopbackOptions};
use peerline::store::{InMemorySignalStore, SignalStore};
use peerline::{CallConfig, CallPhase, CallRecord, Identity, PairId, Session, StorePath};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub struct Peer {
    pub identity: Identity,
    pub media: Arc<LoopbackMedia>,
    pub session: Session,
}

impl Peer {
    pub async fn sign_in(store: &Arc<InMemorySignalStore>, name: &str) -> Self {
        Self::sign_in_with(store, name, LoopbackOptions::default(), test_config()).await
    }

    pub async fn sign_in_with(
        store: &Arc<InMemorySignalStore>,
        name: &str,
        options: LoopbackOptions,
        config: CallConfig,
    ) -> Self {
        let identity = Identity::new(format!("{name}@example.com"));
        let media = LoopbackMedia::with_options(name, options);
        let session = Session::sign_in(identity.clone(), store.clone(), media.clone(), config)
            .await
            .expect("sign in");
        Self {
            identity,
            media,
            session,
        }
    }

    pub fn calls(&self) -> &Arc<CallOrchestrator> {
        self.session.calls()
    }

    pub async fn phase(&self) -> CallPhase {
        self.calls().phase().await
    }

    pub fn connection(&self) -> Arc<LoopbackConnection> {
        self.media.last_connection().expect("a media connection")
    }

    pub async fn wait_for_phase(&self, phase: CallPhase) {
        let calls = self.calls();
        eventually(&format!("{} to reach {phase}", self.identity), || async move {
            calls.phase().await == phase
        })
        .await;
    }

    pub async fn wait_for_pending_offer(&self) {
        let calls = self.calls();
        eventually(&format!("an offer for {}", self.identity), || async move {
            calls.pending_offer().await.is_some()
        })
        .await;
    }
}

/// Ring timeout off, short grace so connectivity tests stay quick.
pub fn test_config() -> CallConfig {
    CallConfig {
        ring_timeout: None,
        reconnect_grace: Duration::from_millis(200),
        ..CallConfig::default()
    }
}

pub fn new_store() -> Arc<InMemorySignalStore> {
    Arc::new(InMemorySignalStore::new())
}

pub async fn call_record(store: &InMemorySignalStore, a: &Identity, b: &Identity) -> Option<CallRecord> {
    let value = store
        .read(&StorePath::call(&PairId::new(a, b)))
        .await
        .expect("read call record")?;
    CallRecord::from_value(&value)
}

pub async fn call_node_exists(store: &InMemorySignalStore, a: &Identity, b: &Identity) -> bool {
    store
        .read(&StorePath::call(&PairId::new(a, b)))
        .await
        .expect("read call node")
        .is_some()
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Alice calls Bob and Bob picks up; returns once both are connected.
pub async fn connected_pair(store: &Arc<InMemorySignalStore>) -> (Peer, Peer) {
    let alice = Peer::sign_in(store, "alice").await;
    let bob = Peer::sign_in(store, "bob").await;

    alice
        .calls()
        .start_call(bob.identity.clone())
        .await
        .expect("start call");
    bob.wait_for_pending_offer().await;
    bob.calls().accept_incoming().await.expect("accept call");

    alice.wait_for_phase(CallPhase::Connected).await;
    bob.wait_for_phase(CallPhase::Connected).await;
    (alice, bob)
}
