use super::session::CallSession;
use super::watcher::{IncomingCallWatcher, SignalEvent};
use crate::config::CallConfig;
use crate::media::MediaDevices;
use crate::store::SignalStore;
use crate::types::events::{EndReason, EventBus, IncomingCall, IncomingCallCancelled, Notice};
use log::{debug, info, warn};
use plcore::{CallError, CallId, CallPhase, CallRecord, Identity, PairId, StorePath};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct PendingOffer {
    pair: PairId,
    record: CallRecord,
}

/// Owns the one call session of a signed-in identity and routes what the
/// watcher sees to it. At most one call is active and at most one inbound
/// offer waits for the user; anything else arriving meanwhile is declined.
pub struct CallOrchestrator {
    me: Identity,
    store: Arc<dyn SignalStore>,
    session: Arc<CallSession>,
    watcher: Arc<IncomingCallWatcher>,
    events: Arc<EventBus>,
    pending_offer: Mutex<Option<PendingOffer>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    signed_out: AtomicBool,
}

impl CallOrchestrator {
    pub async fn start(
        me: Identity,
        store: Arc<dyn SignalStore>,
        media: Arc<dyn MediaDevices>,
        config: CallConfig,
    ) -> Result<Arc<Self>, CallError> {
        let events = Arc::new(EventBus::with_capacity(config.event_capacity));
        let session = CallSession::new(me.clone(), store.clone(), media, config, events.clone());
        let (watcher, signals) = IncomingCallWatcher::start(me.clone(), store.clone()).await?;

        let orchestrator = Arc::new(Self {
            me,
            store,
            session,
            watcher,
            events,
            pending_offer: Mutex::new(None),
            dispatcher: Mutex::new(None),
            signed_out: AtomicBool::new(false),
        });
        let handle = tokio::spawn(Self::dispatch(Arc::downgrade(&orchestrator), signals));
        *orchestrator.dispatcher.lock().await = Some(handle);
        Ok(orchestrator)
    }

    pub fn identity(&self) -> &Identity {
        &self.me
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn session(&self) -> &Arc<CallSession> {
        &self.session
    }

    pub async fn phase(&self) -> CallPhase {
        self.session.phase().await
    }

    pub async fn start_call(&self, peer: Identity) -> Result<(), CallError> {
        self.ensure_signed_in()?;
        self.session.start_call(peer).await
    }

    /// Always safe; a no-op when idle.
    pub async fn end_call(&self) {
        self.session.end_call().await;
    }

    pub async fn toggle_local_audio(&self) -> Option<bool> {
        self.session.toggle_local_audio().await
    }

    pub async fn toggle_local_video(&self) -> Option<bool> {
        self.session.toggle_local_video().await
    }

    /// The inbound offer waiting for the user, if any.
    pub async fn pending_offer(&self) -> Option<IncomingCall> {
        self.pending_offer
            .lock()
            .await
            .as_ref()
            .map(incoming)
    }

    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.ensure_signed_in()?;
        let pending = self
            .pending_offer
            .lock()
            .await
            .take()
            .ok_or(CallError::NoPendingCall)?;
        info!(target: "Call/Orchestrator", "Accepting call from {}", pending.record.sender);
        match self
            .session
            .answer(pending.pair.clone(), pending.record.clone())
            .await
        {
            Err(CallError::CallAlreadyActive) => {
                // Still busy; the offer keeps waiting.
                let mut slot = self.pending_offer.lock().await;
                if slot.is_none() {
                    *slot = Some(pending);
                }
                Err(CallError::CallAlreadyActive)
            }
            other => other,
        }
    }

    /// Declines the pending offer by deleting its record.
    pub async fn reject_incoming(&self) -> Result<(), CallError> {
        self.ensure_signed_in()?;
        let pending = self
            .pending_offer
            .lock()
            .await
            .take()
            .ok_or(CallError::NoPendingCall)?;
        info!(target: "Call/Orchestrator", "Rejecting call from {}", pending.record.sender);
        self.decline(&pending.pair, &pending.record.call_id).await?;
        Ok(())
    }

    /// Stops watching, declines a waiting offer and ends any call.
    /// Calls placed or answered through this orchestrator afterwards fail
    /// with [`CallError::SignedOut`].
    pub async fn shutdown(&self) {
        self.signed_out.store(true, Ordering::Release);
        self.watcher.stop().await;
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            dispatcher.abort();
        }
        let pending = self.pending_offer.lock().await.take();
        if let Some(pending) = pending {
            if let Err(e) = self.decline(&pending.pair, &pending.record.call_id).await {
                warn!(target: "Call/Orchestrator", "Could not decline pending call on shutdown: {e}");
            }
        }
        self.session.end_call_with(EndReason::SignedOut).await;
        info!(target: "Call/Orchestrator", "{} signed out of calling", self.me);
    }

    pub async fn is_watching(&self) -> bool {
        self.watcher.is_running().await
    }

    fn ensure_signed_in(&self) -> Result<(), CallError> {
        if self.signed_out.load(Ordering::Acquire) {
            return Err(CallError::SignedOut);
        }
        Ok(())
    }

    async fn decline(&self, pair: &PairId, call_id: &CallId) -> Result<bool, CallError> {
        let expected = call_id.clone();
        let same_call = move |node: &Value| {
            CallRecord::from_value(node).is_some_and(|record| record.call_id == expected)
        };
        Ok(self
            .store
            .remove_if(&StorePath::call(pair), &same_call)
            .await?)
    }

    async fn dispatch(orchestrator: Weak<Self>, mut signals: mpsc::UnboundedReceiver<SignalEvent>) {
        while let Some(signal) = signals.recv().await {
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            match signal {
                SignalEvent::Offer { pair, record } => orchestrator.on_offer(pair, record).await,
                SignalEvent::Answer { record, .. } => {
                    if let Err(e) = orchestrator.session.apply_answer(record).await {
                        warn!(target: "Call/Orchestrator", "Answer could not be applied: {e}");
                    }
                }
                SignalEvent::Withdrawn { pair, record } => {
                    orchestrator.on_withdrawn(pair, record).await
                }
            }
        }
    }

    async fn on_offer(&self, pair: PairId, record: CallRecord) {
        let from = record.sender.clone();
        let phase = self.session.phase().await;
        // An offer from the peer we are dialing means we lost the race for the
        // record; our own dial is failing and this one should reach the user.
        let glare = !phase.is_idle() && self.session.peer().await.as_ref() == Some(&from);

        let mut pending = self.pending_offer.lock().await;
        let busy_elsewhere = pending
            .as_ref()
            .is_some_and(|p| p.record.sender != from);
        if (!phase.is_idle() && !glare) || busy_elsewhere {
            drop(pending);
            info!(target: "Call/Orchestrator", "Busy; declining call from {from}");
            if let Err(e) = self.decline(&pair, &record.call_id).await {
                warn!(target: "Call/Orchestrator", "Could not decline call from {from}: {e}");
            }
            let _ = self
                .events
                .notice
                .send(Arc::new(Notice::AutoRejected { from }));
            return;
        }

        let offer = PendingOffer { pair, record };
        let _ = self.events.incoming_call.send(Arc::new(incoming(&offer)));
        info!(target: "Call/Orchestrator", "Incoming call from {from}");
        *pending = Some(offer);
    }

    async fn on_withdrawn(&self, pair: PairId, record: Option<CallRecord>) {
        let mut pending = self.pending_offer.lock().await;
        let matches = pending.as_ref().is_some_and(|p| {
            p.pair == pair
                && record
                    .as_ref()
                    .is_none_or(|removed| removed.call_id == p.record.call_id)
        });
        if !matches {
            debug!(target: "Call/Orchestrator", "Record at {pair} removed");
            return;
        }
        if let Some(withdrawn) = pending.take() {
            info!(target: "Call/Orchestrator", "{} cancelled the call", withdrawn.record.sender);
            let _ = self
                .events
                .incoming_cancelled
                .send(Arc::new(IncomingCallCancelled {
                    pair,
                    from: withdrawn.record.sender,
                }));
        }
    }
}

fn incoming(pending: &PendingOffer) -> IncomingCall {
    IncomingCall {
        pair: pending.pair.clone(),
        from: pending.record.sender.clone(),
        call_id: pending.record.call_id.clone(),
    }
}
