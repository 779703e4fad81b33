//! One call, driven through `Idle → Requesting → Negotiating → Connected →
//! Terminating → Idle`.
//!
//! Store notifications and media-connection callbacks arrive on background
//! tasks. Each call gets a fresh epoch; every continuation re-checks the epoch
//! and the phase after each suspension point and, when the call it was working
//! for is gone, releases whatever it acquired and returns quietly.
//!
//! Every path back to `Idle` goes through [`CallSession::terminate`].

use crate::config::CallConfig;
use crate::media::{
    ConnectionEvent, ConnectionState, IceConnectionState, LocalMedia, MediaConnection,
    MediaDevices, TrackKind,
};
use crate::store::{EventKind, SignalStore, StoreEvent, Subscription, SubscriptionId};
use crate::types::events::{
    CallEnded, EndReason, EventBus, Notice, PhaseChanged, RemoteTrackAvailable,
};
use log::{debug, info, warn};
use plcore::error::{MediaError, StoreError};
use plcore::{
    CallError, CallId, CallPhase, CallRecord, CallRole, CallTransition, CandidateRecord,
    IceCandidate, Identity, InvalidTransition, PairId, RecordType, SessionDescription, StorePath,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Point-in-time view of the session, mostly for UIs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: CallPhase,
    pub peer: Option<Identity>,
    pub role: Option<CallRole>,
    pub call_id: Option<CallId>,
    pub has_local_media: bool,
    pub has_connection: bool,
    pub has_signal_subscription: bool,
    pub has_candidate_subscription: bool,
}

impl SessionSnapshot {
    fn idle() -> Self {
        Self {
            phase: CallPhase::Idle,
            peer: None,
            role: None,
            call_id: None,
            has_local_media: false,
            has_connection: false,
            has_signal_subscription: false,
            has_candidate_subscription: false,
        }
    }

    /// Nothing is held: no media, no connection, no subscriptions.
    pub fn is_released(&self) -> bool {
        !self.has_local_media
            && !self.has_connection
            && !self.has_signal_subscription
            && !self.has_candidate_subscription
    }
}

struct ActiveCall {
    epoch: u64,
    call_id: CallId,
    peer: Identity,
    pair: PairId,
    role: CallRole,
    phase: CallPhase,
    local_media: Option<Arc<dyn LocalMedia>>,
    connection: Option<Arc<dyn MediaConnection>>,
    signal_subscription: Option<SubscriptionId>,
    candidate_subscription: Option<SubscriptionId>,
    remote_description_set: bool,
    answer_applied: bool,
    /// Our offer or answer is in the record; local candidates go out directly.
    signaled: bool,
    /// Local candidates found before `signaled`.
    pending_local: Vec<IceCandidate>,
    /// Remote candidates that arrived before the remote description.
    pending_remote: Vec<IceCandidate>,
    /// Serializes remote candidate application so arrival order survives the
    /// hand-over from `pending_remote` to direct delivery.
    candidate_gate: Arc<Mutex<()>>,
    pumps: Vec<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,
}

/// Everything a call holds, detached from it for release.
struct Held {
    local_media: Option<Arc<dyn LocalMedia>>,
    connection: Option<Arc<dyn MediaConnection>>,
    subscriptions: Vec<SubscriptionId>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(epoch: u64, call_id: CallId, peer: Identity, pair: PairId, role: CallRole) -> Self {
        Self {
            epoch,
            call_id,
            peer,
            pair,
            role,
            phase: CallPhase::Idle,
            local_media: None,
            connection: None,
            signal_subscription: None,
            candidate_subscription: None,
            remote_description_set: false,
            answer_applied: false,
            signaled: false,
            pending_local: Vec::new(),
            pending_remote: Vec::new(),
            candidate_gate: Arc::new(Mutex::new(())),
            pumps: Vec::new(),
            grace_timer: None,
            ring_timer: None,
        }
    }

    fn transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<Option<PhaseChanged>, InvalidTransition> {
        let previous = self.phase;
        self.phase = previous.apply(transition)?;
        Ok((previous != self.phase).then(|| PhaseChanged {
            peer: Some(self.peer.clone()),
            previous,
            phase: self.phase,
        }))
    }

    fn take_held(&mut self) -> Held {
        let mut tasks = std::mem::take(&mut self.pumps);
        tasks.extend(self.grace_timer.take());
        tasks.extend(self.ring_timer.take());
        Held {
            local_media: self.local_media.take(),
            connection: self.connection.take(),
            subscriptions: self
                .signal_subscription
                .take()
                .into_iter()
                .chain(self.candidate_subscription.take())
                .collect(),
            tasks,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            peer: Some(self.peer.clone()),
            role: Some(self.role),
            call_id: Some(self.call_id.clone()),
            has_local_media: self.local_media.is_some(),
            has_connection: self.connection.is_some(),
            has_signal_subscription: self.signal_subscription.is_some(),
            has_candidate_subscription: self.candidate_subscription.is_some(),
        }
    }
}

pub struct CallSession {
    me: Identity,
    store: Arc<dyn SignalStore>,
    media: Arc<dyn MediaDevices>,
    config: CallConfig,
    events: Arc<EventBus>,
    state: Mutex<Option<ActiveCall>>,
    next_epoch: AtomicU64,
}

impl CallSession {
    pub fn new(
        me: Identity,
        store: Arc<dyn SignalStore>,
        media: Arc<dyn MediaDevices>,
        config: CallConfig,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            me,
            store,
            media,
            config,
            events,
            state: Mutex::new(None),
            next_epoch: AtomicU64::new(1),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.me
    }

    pub async fn phase(&self) -> CallPhase {
        self.state
            .lock()
            .await
            .as_ref()
            .map_or(CallPhase::Idle, |call| call.phase)
    }

    pub async fn peer(&self) -> Option<Identity> {
        self.state.lock().await.as_ref().map(|call| call.peer.clone())
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.state
            .lock()
            .await
            .as_ref()
            .map_or_else(SessionSnapshot::idle, ActiveCall::snapshot)
    }

    /// Dials `peer`: `Idle → Requesting → Negotiating`.
    ///
    /// Returns once the offer is published. `InvalidPeer` and
    /// `CallAlreadyActive` leave the session untouched; any later failure has
    /// already released the call when the error is returned. If the call is
    /// ended while this is in flight, it returns `Ok(())`.
    pub async fn start_call(self: &Arc<Self>, peer: Identity) -> Result<(), CallError> {
        self.validate_peer(&peer)?;
        let pair = PairId::new(&self.me, &peer);
        let path = StorePath::call(&pair);

        let epoch = {
            let mut state = self.state.lock().await;
            if state.is_some() {
                return Err(CallError::CallAlreadyActive);
            }
            // First writer for a pair wins; an in-flight offer is never replaced.
            if let Some(existing) = self.store.read(&path).await? {
                if CallRecord::from_value(&existing).is_some() {
                    info!(target: "Call/Session", "Call to {peer} refused: {path} is taken");
                    return Err(CallError::CallAlreadyActive);
                }
                self.store.remove_if(&path, &is_orphaned).await?;
            }

            let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
            let mut call = ActiveCall::new(
                epoch,
                CallId::generate(),
                peer.clone(),
                pair.clone(),
                CallRole::Caller,
            );
            let change = call.transition(CallTransition::Dial)?;
            *state = Some(call);
            self.emit_phase(change);
            epoch
        };
        info!(target: "Call/Session", "Calling {peer}");

        let Some(connection) = self.prepare_media(epoch).await? else {
            return Ok(());
        };
        let offer = match local_description(connection.as_ref(), RecordType::Offer).await {
            Ok(offer) => offer,
            Err(e) => {
                return self
                    .abort(epoch, EndReason::NegotiationFailed, CallError::NegotiationFailed(e))
                    .await;
            }
        };

        let Some(call_id) = self.with_call(epoch, |call| call.call_id.clone()).await else {
            return Ok(());
        };
        let record = CallRecord::offer(self.me.clone(), peer.clone(), offer.sdp, call_id.clone());
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                let error = CallError::SignalingWriteFailed(StoreError::from(e));
                return self
                    .abort(epoch, EndReason::SignalingWriteFailed, error)
                    .await;
            }
        };
        match self.store.create(&path, value).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                info!(target: "Call/Session", "Lost the race for {path}; {peer} is already calling");
                return self
                    .abort(epoch, EndReason::Glare, CallError::CallAlreadyActive)
                    .await;
            }
            Err(e) => {
                return self
                    .abort(epoch, EndReason::SignalingWriteFailed, e.into())
                    .await;
            }
        }

        let published = self
            .with_call(epoch, |call| {
                let change = call.transition(CallTransition::OfferPublished);
                call.signaled = true;
                (change, std::mem::take(&mut call.pending_local))
            })
            .await;
        let Some((change, pending)) = published else {
            // Ended while the write was in flight; the record is ours to withdraw.
            self.withdraw_record(&pair, &call_id).await;
            return Ok(());
        };
        self.emit_phase(change?);

        if !self.attach_subscriptions(epoch, &pair).await? {
            return Ok(());
        }
        for candidate in pending {
            self.publish_candidate(&pair, candidate).await;
        }
        if let Some(timeout) = self.config.ring_timeout {
            let timer = tokio::spawn(Self::ring_timer(Arc::downgrade(self), epoch, timeout));
            self.with_call(epoch, |call| call.ring_timer = Some(timer))
                .await;
        }
        info!(target: "Call/Session", "Offer to {peer} published at {path}");
        Ok(())
    }

    /// Accepts an inbound offer: `Idle → Negotiating`, then patches the
    /// record into an answer.
    pub async fn answer(self: &Arc<Self>, pair: PairId, offer: CallRecord) -> Result<(), CallError> {
        if offer.kind != RecordType::Offer || offer.receiver != self.me {
            return Err(CallError::InvalidPeer(format!(
                "{} from {} is not an offer addressed to {}",
                offer.kind, offer.sender, self.me
            )));
        }
        self.validate_peer(&offer.sender)?;
        let caller = offer.sender.clone();
        if pair != PairId::new(&self.me, &caller) {
            return Err(CallError::InvalidPeer(format!(
                "offer from {caller} filed under {pair}"
            )));
        }

        let epoch = {
            let mut state = self.state.lock().await;
            if state.is_some() {
                return Err(CallError::CallAlreadyActive);
            }
            let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
            let mut call = ActiveCall::new(
                epoch,
                offer.call_id.clone(),
                caller.clone(),
                pair.clone(),
                CallRole::Callee,
            );
            let change = call.transition(CallTransition::OfferAccepted)?;
            *state = Some(call);
            self.emit_phase(change);
            epoch
        };
        info!(target: "Call/Session", "Answering {caller}");

        let Some(connection) = self.prepare_media(epoch).await? else {
            return Ok(());
        };
        if !self.attach_subscriptions(epoch, &pair).await? {
            return Ok(());
        }
        if let Err(e) = connection.set_remote_description(offer.description()).await {
            return self
                .abort(epoch, EndReason::NegotiationFailed, CallError::NegotiationFailed(e))
                .await;
        }
        if !self.remote_description_applied(epoch).await {
            return Ok(());
        }
        let answer = match local_description(connection.as_ref(), RecordType::Answer).await {
            Ok(answer) => answer,
            Err(e) => {
                return self
                    .abort(epoch, EndReason::NegotiationFailed, CallError::NegotiationFailed(e))
                    .await;
            }
        };

        if self.with_call(epoch, |_| ()).await.is_none() {
            return Ok(());
        }
        let fields = CallRecord::answer_fields(&self.me, &caller, &answer.sdp);
        let offered = offer.call_id.clone();
        let still_offered = move |node: &Value| {
            CallRecord::from_value(node)
                .is_some_and(|record| record.kind == RecordType::Offer && record.call_id == offered)
        };
        if let Err(e) = self
            .store
            .patch_if(&StorePath::call(&pair), &still_offered, fields)
            .await
        {
            // NotFound here means the caller hung up before we answered.
            return self
                .abort(epoch, EndReason::SignalingWriteFailed, e.into())
                .await;
        }

        let Some(pending) = self
            .with_call(epoch, |call| {
                call.signaled = true;
                std::mem::take(&mut call.pending_local)
            })
            .await
        else {
            return Ok(());
        };
        for candidate in pending {
            self.publish_candidate(&pair, candidate).await;
        }
        info!(target: "Call/Session", "Answer to {caller} published");
        Ok(())
    }

    /// Applies the callee's answer to an outgoing call. Answers that do not
    /// belong to the current outgoing call, or arrive twice, are ignored.
    pub async fn apply_answer(&self, answer: CallRecord) -> Result<(), CallError> {
        let (epoch, connection) = {
            let mut state = self.state.lock().await;
            let Some(call) = state.as_mut() else {
                debug!(target: "Call/Session", "Ignoring answer from {}: no call", answer.sender);
                return Ok(());
            };
            let belongs = answer.kind == RecordType::Answer
                && call.role == CallRole::Caller
                && call.peer == answer.sender
                && (answer.call_id.as_str().is_empty() || answer.call_id == call.call_id);
            if !belongs || call.phase != CallPhase::Negotiating || call.answer_applied {
                debug!(
                    target: "Call/Session",
                    "Ignoring answer from {} in {:?}", answer.sender, call.phase
                );
                return Ok(());
            }
            call.answer_applied = true;
            if let Some(timer) = call.ring_timer.take() {
                timer.abort();
            }
            (call.epoch, call.connection.clone())
        };
        let Some(connection) = connection else {
            return Ok(());
        };

        if let Err(e) = connection.set_remote_description(answer.description()).await {
            return self
                .abort(epoch, EndReason::NegotiationFailed, CallError::NegotiationFailed(e))
                .await;
        }
        if !self.remote_description_applied(epoch).await {
            return Ok(());
        }
        if let Some(Err(e)) = self
            .with_call(epoch, |call| call.transition(CallTransition::AnswerApplied))
            .await
        {
            debug!(target: "Call/Session", "Answer applied late: {e}");
        }
        info!(target: "Call/Session", "Answer from {} applied", answer.sender);
        Ok(())
    }

    /// Ends whatever call is in progress. A no-op when idle.
    pub async fn end_call(&self) {
        self.terminate(None, EndReason::LocalHangup).await;
    }

    /// Ends the call for a reason other than a local hang-up.
    pub async fn end_call_with(&self, reason: EndReason) {
        self.terminate(None, reason).await;
    }

    pub async fn toggle_local_audio(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio).await
    }

    pub async fn toggle_local_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video).await
    }

    async fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let state = self.state.lock().await;
        state.as_ref()?.local_media.as_ref()?.toggle(kind)
    }

    fn validate_peer(&self, peer: &Identity) -> Result<(), CallError> {
        if peer.is_empty() {
            return Err(CallError::InvalidPeer("empty identity".into()));
        }
        if peer == &self.me {
            return Err(CallError::InvalidPeer(format!("{peer} cannot call themselves")));
        }
        Ok(())
    }

    /// Runs `f` on the call if it is still the one identified by `epoch` and
    /// is not being torn down.
    async fn with_call<R>(&self, epoch: u64, f: impl FnOnce(&mut ActiveCall) -> R) -> Option<R> {
        let mut state = self.state.lock().await;
        let call = state
            .as_mut()
            .filter(|call| call.epoch == epoch && call.phase != CallPhase::Terminating)?;
        Some(f(call))
    }

    /// Releases the call after a failed step. Stale failures are not errors.
    async fn abort<T: Default>(
        &self,
        epoch: u64,
        reason: EndReason,
        error: CallError,
    ) -> Result<T, CallError> {
        warn!(target: "Call/Session", "Call aborted ({reason}): {error}");
        if self.terminate(Some(epoch), reason).await {
            Err(error)
        } else {
            Ok(T::default())
        }
    }

    /// Acquires local media and a connection with the local tracks attached.
    /// `Ok(None)` means the call went away meanwhile.
    async fn prepare_media(
        self: &Arc<Self>,
        epoch: u64,
    ) -> Result<Option<Arc<dyn MediaConnection>>, CallError> {
        let local = match self.media.acquire_local_media(&self.config.constraints).await {
            Ok(local) => local,
            Err(e) => {
                return self
                    .abort(
                        epoch,
                        EndReason::MediaAcquisitionFailed,
                        CallError::MediaAcquisitionFailed(e),
                    )
                    .await;
            }
        };
        let attached = self
            .with_call(epoch, |call| call.local_media = Some(local.clone()))
            .await;
        if attached.is_none() {
            local.stop();
            return Ok(None);
        }

        let connection = match self.media.create_connection(&self.config.ice_servers).await {
            Ok(connection) => connection,
            Err(e) => {
                return self
                    .abort(epoch, EndReason::NegotiationFailed, CallError::NegotiationFailed(e))
                    .await;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        connection.set_event_sink(tx);
        let pump = self.spawn_connection_pump(epoch, rx);
        let attached = self
            .with_call(epoch, |call| {
                call.connection = Some(connection.clone());
                call.pumps.push(pump);
            })
            .await;
        if attached.is_none() {
            connection.close();
            return Ok(None);
        }

        for track in local.tracks() {
            if let Err(e) = connection.add_track(&track) {
                return self
                    .abort(epoch, EndReason::NegotiationFailed, CallError::NegotiationFailed(e))
                    .await;
            }
        }
        Ok(Some(connection))
    }

    /// Subscribes to the pair's candidates and to its record. Returns `false`
    /// if the call went away meanwhile.
    async fn attach_subscriptions(
        self: &Arc<Self>,
        epoch: u64,
        pair: &PairId,
    ) -> Result<bool, CallError> {
        let candidates = match self
            .store
            .subscribe(&StorePath::candidates(pair), EventKind::ChildAdded)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                return self
                    .abort(epoch, EndReason::SignalingWriteFailed, e.into())
                    .await;
            }
        };
        let signal = match self
            .store
            .subscribe(&StorePath::call(pair), EventKind::Value)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                self.store.unsubscribe(candidates.id()).await;
                return self
                    .abort(epoch, EndReason::SignalingWriteFailed, e.into())
                    .await;
            }
        };

        let (candidate_id, signal_id) = (candidates.id(), signal.id());
        let candidate_pump = self.spawn_candidate_pump(epoch, candidates);
        let signal_pump = self.spawn_signal_pump(epoch, signal);
        let attached = self
            .with_call(epoch, |call| {
                call.candidate_subscription = Some(candidate_id);
                call.signal_subscription = Some(signal_id);
                call.pumps.push(candidate_pump);
                call.pumps.push(signal_pump);
            })
            .await;
        if attached.is_none() {
            self.store.unsubscribe(candidate_id).await;
            self.store.unsubscribe(signal_id).await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Marks the remote description as set and feeds candidates that were
    /// waiting for it, in arrival order.
    async fn remote_description_applied(&self, epoch: u64) -> bool {
        let Some((gate, connection)) = self
            .with_call(epoch, |call| {
                (call.candidate_gate.clone(), call.connection.clone())
            })
            .await
        else {
            return false;
        };
        let _gate = gate.lock().await;
        let Some(pending) = self
            .with_call(epoch, |call| {
                call.remote_description_set = true;
                std::mem::take(&mut call.pending_remote)
            })
            .await
        else {
            return false;
        };
        if let Some(connection) = connection {
            for candidate in pending {
                if let Err(e) = connection.add_remote_candidate(candidate).await {
                    warn!(target: "Call/Session", "Buffered remote candidate rejected: {e}");
                }
            }
        }
        true
    }

    /// The single release routine. Returns whether it tore down a call.
    async fn terminate(&self, epoch: Option<u64>, reason: EndReason) -> bool {
        let (held, change, peer, pair, call_id, ended_epoch) = {
            let mut state = self.state.lock().await;
            let Some(call) = state.as_mut() else {
                return false;
            };
            if epoch.is_some_and(|epoch| epoch != call.epoch)
                || call.phase == CallPhase::Terminating
            {
                return false;
            }
            let change = call.transition(CallTransition::Hangup).ok().flatten();
            (
                call.take_held(),
                change,
                call.peer.clone(),
                call.pair.clone(),
                call.call_id.clone(),
                call.epoch,
            )
        };
        self.emit_phase(change);
        info!(target: "Call/Session", "Ending call with {peer}: {reason}");

        for task in &held.tasks {
            task.abort();
        }
        // A pump caught mid-append must finish before the record is withdrawn.
        for task in held.tasks {
            let _ = task.await;
        }
        if let Some(connection) = held.connection {
            connection.close();
        }
        if let Some(local) = held.local_media {
            local.stop();
        }
        for id in held.subscriptions {
            self.store.unsubscribe(id).await;
        }
        self.withdraw_record(&pair, &call_id).await;

        let released = {
            let mut state = self.state.lock().await;
            match state.as_mut() {
                Some(call) if call.epoch == ended_epoch => {
                    let change = call.transition(CallTransition::Released).ok().flatten();
                    *state = None;
                    change
                }
                _ => None,
            }
        };
        self.emit_phase(released);

        let _ = self.events.call_ended.send(Arc::new(CallEnded {
            peer: peer.clone(),
            call_id,
            reason,
        }));
        if reason != EndReason::LocalHangup {
            let _ = self
                .events
                .notice
                .send(Arc::new(Notice::CallEnded { peer, reason }));
        }
        true
    }

    /// Deletes the pair's record and its candidates if they still belong to
    /// `call_id`. Leftover candidate collections without a record go too.
    async fn withdraw_record(&self, pair: &PairId, call_id: &CallId) {
        let path = StorePath::call(pair);
        let ours = call_id.clone();
        let belongs = move |node: &Value| match CallRecord::from_value(node) {
            Some(record) => record.call_id == ours,
            None => true,
        };
        match self.store.remove_if(&path, &belongs).await {
            Ok(true) => debug!(target: "Call/Session", "Removed {path}"),
            Ok(false) => debug!(target: "Call/Session", "{path} already gone or reused"),
            Err(e) => warn!(target: "Call/Session", "Failed to remove {path}: {e}"),
        }
    }

    async fn publish_candidate(&self, pair: &PairId, candidate: IceCandidate) {
        let record = CandidateRecord::new(self.me.clone(), candidate);
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "Call/Session", "Could not encode candidate: {e}");
                return;
            }
        };
        if let Err(e) = self.store.append(&StorePath::candidates(pair), value).await {
            warn!(target: "Call/Session", "Failed to publish local candidate: {e}");
        }
    }

    fn emit_phase(&self, change: Option<PhaseChanged>) {
        if let Some(change) = change {
            debug!(
                target: "Call/Session",
                "{:?} -> {:?} ({:?})", change.previous, change.phase, change.peer
            );
            let _ = self.events.phase_changed.send(Arc::new(change));
        }
    }

    fn spawn_connection_pump(
        self: &Arc<Self>,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.on_connection_event(epoch, event).await;
            }
        })
    }

    fn spawn_candidate_pump(self: &Arc<Self>, epoch: u64, mut sub: Subscription) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = sub.next().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if let StoreEvent::ChildAdded { key, value } = event {
                    session.on_remote_candidate(epoch, &key, value).await;
                }
            }
        })
    }

    fn spawn_signal_pump(self: &Arc<Self>, epoch: u64, mut sub: Subscription) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut seen_record = false;
            while let Some(event) = sub.next().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match event {
                    StoreEvent::Value { value: Some(_) } => seen_record = true,
                    StoreEvent::Value { value: None } if seen_record => {
                        seen_record = false;
                        session.on_record_removed(epoch).await;
                    }
                    _ => {}
                }
            }
        })
    }

    async fn on_remote_candidate(&self, epoch: u64, key: &str, value: Value) {
        let record: CandidateRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!(target: "Call/Session", "Skipping malformed candidate {key}: {e}");
                return;
            }
        };
        if record.sender == self.me {
            return;
        }
        let Some(gate) = self
            .with_call(epoch, |call| call.candidate_gate.clone())
            .await
        else {
            return;
        };
        let _gate = gate.lock().await;
        let ready = self
            .with_call(epoch, |call| {
                if !call.phase.exchanges_candidates() {
                    return None;
                }
                if call.remote_description_set {
                    call.connection.clone()
                } else {
                    call.pending_remote.push(record.candidate.clone());
                    None
                }
            })
            .await
            .flatten();
        if let Some(connection) = ready {
            debug!(target: "Call/Session", "Remote candidate {key} from {}", record.sender);
            if let Err(e) = connection.add_remote_candidate(record.candidate).await {
                warn!(target: "Call/Session", "Remote candidate {key} rejected: {e}");
            }
        }
    }

    async fn on_record_removed(&self, epoch: u64) {
        if let Some(peer) = self.with_call(epoch, |call| call.peer.clone()).await {
            info!(target: "Call/Session", "{peer} removed the call record");
            let _ = self.events.notice.send(Arc::new(Notice::PeerLeft { peer }));
        }
    }

    async fn on_connection_event(self: &Arc<Self>, epoch: u64, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                let target = self
                    .with_call(epoch, |call| {
                        if call.signaled && call.phase.exchanges_candidates() {
                            Some(call.pair.clone())
                        } else {
                            call.pending_local.push(candidate.clone());
                            None
                        }
                    })
                    .await
                    .flatten();
                if let Some(pair) = target {
                    self.publish_candidate(&pair, candidate).await;
                }
            }
            ConnectionEvent::RemoteTrack(track) => {
                if let Some(peer) = self.with_call(epoch, |call| call.peer.clone()).await {
                    info!(target: "Call/Session", "Remote {:?} track from {peer}", track.track.kind);
                    let _ = self
                        .events
                        .remote_track
                        .send(Arc::new(RemoteTrackAvailable { peer, track }));
                }
            }
            ConnectionEvent::ConnectionState(state) => self.on_connectivity(epoch, state).await,
            ConnectionEvent::IceConnectionState(IceConnectionState::Failed) => {
                let connection = self
                    .with_call(epoch, |call| call.connection.clone())
                    .await
                    .flatten();
                if let Some(connection) = connection {
                    warn!(target: "Call/Session", "ICE failed, restarting");
                    connection.restart_ice();
                }
            }
            ConnectionEvent::IceConnectionState(state) => {
                debug!(target: "Call/Session", "ICE connection state: {state:?}");
            }
        }
    }

    async fn on_connectivity(self: &Arc<Self>, epoch: u64, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                let change = self
                    .with_call(epoch, |call| {
                        if let Some(timer) = call.grace_timer.take() {
                            timer.abort();
                        }
                        call.transition(CallTransition::MediaConnected)
                    })
                    .await;
                match change {
                    Some(Ok(change)) => {
                        if let Some(change) = &change {
                            info!(target: "Call/Session", "Connected to {:?}", change.peer);
                        }
                        self.emit_phase(change);
                    }
                    Some(Err(e)) => debug!(target: "Call/Session", "Connectivity report ignored: {e}"),
                    None => {}
                }
            }
            ConnectionState::Failed => {
                let grace = self.config.reconnect_grace;
                let weak = Arc::downgrade(self);
                let started = self
                    .with_call(epoch, |call| {
                        if call.grace_timer.is_some() {
                            return false;
                        }
                        call.grace_timer = Some(tokio::spawn(Self::grace_timer(weak, epoch, grace)));
                        true
                    })
                    .await;
                if started == Some(true) {
                    warn!(
                        target: "Call/Session",
                        "Connection failed; ending the call unless it recovers within {grace:?}"
                    );
                }
            }
            ConnectionState::Disconnected => {
                info!(target: "Call/Session", "Connection disconnected, waiting for it to recover");
            }
            other => debug!(target: "Call/Session", "Connection state: {other:?}"),
        }
    }

    async fn grace_timer(session: Weak<Self>, epoch: u64, grace: Duration) {
        tokio::time::sleep(grace).await;
        let Some(session) = session.upgrade() else {
            return;
        };
        let still_failed = session
            .with_call(epoch, |call| {
                // Detach ourselves so the release below does not abort this task.
                call.grace_timer = None;
                call.connection
                    .as_ref()
                    .is_some_and(|c| c.connection_state() == ConnectionState::Failed)
            })
            .await
            .unwrap_or(false);
        if still_failed {
            session
                .terminate(Some(epoch), EndReason::ConnectivityLost)
                .await;
        }
    }

    async fn ring_timer(session: Weak<Self>, epoch: u64, timeout: Duration) {
        tokio::time::sleep(timeout).await;
        let Some(session) = session.upgrade() else {
            return;
        };
        let unanswered = session
            .with_call(epoch, |call| {
                call.ring_timer = None;
                call.phase == CallPhase::Negotiating && !call.answer_applied
            })
            .await
            .unwrap_or(false);
        if unanswered {
            info!(target: "Call/Session", "No answer within {timeout:?}");
            session.terminate(Some(epoch), EndReason::RingTimeout).await;
        }
    }
}

/// Creates the local offer or answer and installs it on the connection.
async fn local_description(
    connection: &dyn MediaConnection,
    kind: RecordType,
) -> Result<SessionDescription, MediaError> {
    let description = match kind {
        RecordType::Offer => connection.create_offer().await?,
        RecordType::Answer => connection.create_answer().await?,
    };
    connection.set_local_description(description.clone()).await?;
    Ok(description)
}

/// A node at a call path that holds candidates but no record.
fn is_orphaned(node: &Value) -> bool {
    CallRecord::from_value(node).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LoopbackMedia, LoopbackOptions};
    use crate::store::InMemorySignalStore;

    fn session_with(
        store: Arc<InMemorySignalStore>,
        media: Arc<LoopbackMedia>,
    ) -> Arc<CallSession> {
        let config = CallConfig {
            ring_timeout: None,
            ..CallConfig::default()
        };
        CallSession::new(
            Identity::new("alice@example.com"),
            store,
            media,
            config,
            Arc::new(EventBus::new()),
        )
    }

    #[tokio::test]
    async fn test_idle_snapshot_holds_nothing() {
        let session = session_with(
            Arc::new(InMemorySignalStore::new()),
            LoopbackMedia::new("alice"),
        );
        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.phase, CallPhase::Idle);
        assert!(snapshot.is_released());
        assert_eq!(session.peer().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_during_capture_discards_late_media() {
        let store = Arc::new(InMemorySignalStore::new());
        let media = LoopbackMedia::with_options(
            "alice",
            LoopbackOptions {
                acquire_delay: Some(Duration::from_secs(2)),
                ..Default::default()
            },
        );
        let session = session_with(store.clone(), media.clone());
        let mut phases = session.events.phase_changed.subscribe();

        let dialing = {
            let session = session.clone();
            tokio::spawn(async move { session.start_call(Identity::new("bob@example.com")).await })
        };
        let first = phases.recv().await.unwrap();
        assert_eq!(first.phase, CallPhase::Requesting);

        session.end_call().await;
        assert_eq!(session.phase().await, CallPhase::Idle);

        // The capture finishes after the call is gone: no error, nothing kept.
        assert_eq!(dialing.await.unwrap(), Ok(()));
        assert!(media.streams()[0].is_stopped());
        assert!(media.connections().is_empty());
        assert!(session.snapshot().await.is_released());
        assert_eq!(store.subscription_count(), 0);
        assert_eq!(
            store.read(&StorePath::calls()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_candidates_found_while_requesting_are_flushed() {
        let store = Arc::new(InMemorySignalStore::new());
        let session = session_with(store.clone(), LoopbackMedia::new("alice"));
        let bob = Identity::new("bob@example.com");

        session.start_call(bob.clone()).await.unwrap();
        let path = StorePath::candidates(&PairId::new(&Identity::new("alice@example.com"), &bob));
        let mut published = 0;
        for _ in 0..100 {
            published = store
                .read(&path)
                .await
                .unwrap()
                .and_then(|v| v.as_object().map(|m| m.len()))
                .unwrap_or(0);
            if published == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(published, 2);

        session.end_call().await;
        assert_eq!(store.read(&StorePath::calls()).await.unwrap(), None);
    }
}
