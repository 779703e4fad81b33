mod common;

use common::{Peer, call_node_exists, call_record, connected_pair, eventually, new_store};
use futures_util::future::join;
use peerline::media::ConnectionState;
use peerline::types::events::{EndReason, Notice};
use peerline::{CallError, CallPhase, RecordType};

#[tokio::test]
async fn test_call_connects_and_hangs_up_cleanly() {
    let store = new_store();
    let alice = Peer::sign_in(&store, "alice").await;
    let bob = Peer::sign_in(&store, "bob").await;
    let mut incoming = bob.calls().events().incoming_call.subscribe();
    let mut bob_notices = bob.calls().events().notice.subscribe();
    let mut alice_ended = alice.calls().events().call_ended.subscribe();

    alice
        .calls()
        .start_call(bob.identity.clone())
        .await
        .unwrap();
    assert_eq!(alice.phase().await, CallPhase::Negotiating);
    assert_eq!(alice.connection().ice_server_count(), 3);

    let offer = call_record(&store, &alice.identity, &bob.identity)
        .await
        .expect("offer record");
    assert_eq!(offer.kind, RecordType::Offer);
    assert_eq!(offer.sender, alice.identity);
    assert_eq!(offer.receiver, bob.identity);

    let ring = incoming.recv().await.unwrap();
    assert_eq!(ring.from, alice.identity);
    assert_eq!(ring.call_id, offer.call_id);

    bob.calls().accept_incoming().await.unwrap();
    let answer = call_record(&store, &alice.identity, &bob.identity)
        .await
        .expect("answer record");
    assert_eq!(answer.kind, RecordType::Answer);
    assert_eq!(answer.sender, bob.identity);
    assert_eq!(answer.receiver, alice.identity);
    assert_eq!(answer.call_id, offer.call_id);

    alice.wait_for_phase(CallPhase::Connected).await;
    bob.wait_for_phase(CallPhase::Connected).await;

    alice.calls().end_call().await;
    assert_eq!(alice.phase().await, CallPhase::Idle);
    assert!(alice.calls().session().snapshot().await.is_released());
    assert!(alice.connection().is_closed());
    assert!(alice.media.streams()[0].is_stopped());
    assert!(!call_node_exists(&store, &alice.identity, &bob.identity).await);

    let ended = alice_ended.recv().await.unwrap();
    assert_eq!(ended.reason, EndReason::LocalHangup);
    assert_eq!(ended.peer, bob.identity);

    let notice = bob_notices.recv().await.unwrap();
    assert_eq!(
        *notice,
        Notice::PeerLeft {
            peer: alice.identity.clone()
        }
    );
    // The peer leaving is only a notice; the user still hangs up.
    assert_eq!(bob.phase().await, CallPhase::Connected);
    bob.calls().end_call().await;
    assert_eq!(bob.phase().await, CallPhase::Idle);
    assert!(bob.calls().session().snapshot().await.is_released());
}

#[tokio::test]
async fn test_own_candidates_are_never_applied() {
    let store = new_store();
    let (alice, bob) = connected_pair(&store).await;

    let alice_pc = alice.connection();
    let bob_pc = bob.connection();
    let bob_ufrag = format!("ufrag {}", bob_pc.id());
    let alice_ufrag = format!("ufrag {}", alice_pc.id());
    eventually("bob's candidates to reach alice", || {
        let pc = alice_pc.clone();
        async move { pc.remote_candidates().len() == 2 }
    })
    .await;
    eventually("alice's candidates to reach bob", || {
        let pc = bob_pc.clone();
        async move { pc.remote_candidates().len() == 2 }
    })
    .await;

    assert!(
        alice_pc
            .remote_candidates()
            .iter()
            .all(|c| c.candidate.ends_with(&bob_ufrag))
    );
    assert!(
        bob_pc
            .remote_candidates()
            .iter()
            .all(|c| c.candidate.ends_with(&alice_ufrag))
    );

    alice.calls().end_call().await;
    bob.calls().end_call().await;
}

#[tokio::test]
async fn test_declined_call_leaves_caller_until_hangup() {
    let store = new_store();
    let alice = Peer::sign_in(&store, "alice").await;
    let bob = Peer::sign_in(&store, "bob").await;
    let mut alice_notices = alice.calls().events().notice.subscribe();

    alice
        .calls()
        .start_call(bob.identity.clone())
        .await
        .unwrap();
    bob.wait_for_pending_offer().await;
    bob.calls().reject_incoming().await.unwrap();

    assert!(!call_node_exists(&store, &alice.identity, &bob.identity).await);
    assert_eq!(bob.phase().await, CallPhase::Idle);
    assert!(bob.media.last_connection().is_none());

    let notice = alice_notices.recv().await.unwrap();
    assert_eq!(
        *notice,
        Notice::PeerLeft {
            peer: bob.identity.clone()
        }
    );
    assert_eq!(alice.phase().await, CallPhase::Negotiating);

    alice.calls().end_call().await;
    assert_eq!(alice.phase().await, CallPhase::Idle);
    assert!(matches!(
        bob.calls().reject_incoming().await,
        Err(CallError::NoPendingCall)
    ));
}

#[tokio::test]
async fn test_simultaneous_calls_first_writer_wins() {
    let store = new_store();
    let alice = Peer::sign_in(&store, "alice").await;
    let bob = Peer::sign_in(&store, "bob").await;

    let (from_alice, from_bob) = join(
        alice.calls().start_call(bob.identity.clone()),
        bob.calls().start_call(alice.identity.clone()),
    )
    .await;

    let (winner, loser) = match (&from_alice, &from_bob) {
        (Ok(()), Err(CallError::CallAlreadyActive)) => (&alice, &bob),
        (Err(CallError::CallAlreadyActive), Ok(())) => (&bob, &alice),
        other => panic!("expected exactly one winner, got {other:?}"),
    };

    let record = call_record(&store, &alice.identity, &bob.identity)
        .await
        .expect("winner's offer");
    assert_eq!(record.sender, winner.identity);
    let winner_call = winner.calls().session().snapshot().await;
    assert_eq!(winner_call.call_id, Some(record.call_id.clone()));
    assert_eq!(winner.phase().await, CallPhase::Negotiating);

    loser.wait_for_phase(CallPhase::Idle).await;
    assert!(loser.calls().session().snapshot().await.is_released());
    loser.wait_for_pending_offer().await;
    let pending = loser.calls().pending_offer().await.unwrap();
    assert_eq!(pending.from, winner.identity);
    assert_eq!(pending.call_id, record.call_id);

    loser.calls().accept_incoming().await.unwrap();
    winner.wait_for_phase(CallPhase::Connected).await;
    loser.wait_for_phase(CallPhase::Connected).await;

    winner.calls().end_call().await;
    loser.calls().end_call().await;
    assert!(!call_node_exists(&store, &alice.identity, &bob.identity).await);
}

#[tokio::test]
async fn test_connectivity_loss_ends_call_after_grace() {
    let store = new_store();
    let (alice, bob) = connected_pair(&store).await;
    let mut alice_ended = alice.calls().events().call_ended.subscribe();
    let mut bob_notices = bob.calls().events().notice.subscribe();

    alice.connection().set_state(ConnectionState::Failed);
    alice.wait_for_phase(CallPhase::Idle).await;

    let ended = alice_ended.recv().await.unwrap();
    assert_eq!(ended.reason, EndReason::ConnectivityLost);
    assert!(alice.calls().session().snapshot().await.is_released());
    assert!(!call_node_exists(&store, &alice.identity, &bob.identity).await);

    let notice = bob_notices.recv().await.unwrap();
    assert!(matches!(*notice, Notice::PeerLeft { .. }));
    bob.calls().end_call().await;
}

#[tokio::test]
async fn test_connectivity_recovery_within_grace_keeps_call() {
    let store = new_store();
    let (alice, bob) = connected_pair(&store).await;

    let pc = alice.connection();
    pc.set_state(ConnectionState::Disconnected);
    pc.set_state(ConnectionState::Failed);
    pc.set_state(ConnectionState::Connected);
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;

    assert_eq!(alice.phase().await, CallPhase::Connected);
    assert!(call_node_exists(&store, &alice.identity, &bob.identity).await);

    alice.calls().end_call().await;
    bob.calls().end_call().await;
}

#[tokio::test]
async fn test_ice_failure_restarts_ice() {
    let store = new_store();
    let (alice, bob) = connected_pair(&store).await;

    let pc = alice.connection();
    pc.emit(peerline::media::ConnectionEvent::IceConnectionState(
        peerline::media::IceConnectionState::Failed,
    ));
    eventually("an ICE restart", || {
        let pc = pc.clone();
        async move { pc.ice_restarts() == 1 }
    })
    .await;
    assert_eq!(alice.phase().await, CallPhase::Connected);

    alice.calls().end_call().await;
    bob.calls().end_call().await;
}

#[tokio::test]
async fn test_toggle_local_tracks() {
    let store = new_store();
    let alice = Peer::sign_in(&store, "alice").await;
    assert_eq!(alice.calls().toggle_local_audio().await, None);

    let bob = Peer::sign_in(&store, "bob").await;
    alice
        .calls()
        .start_call(bob.identity.clone())
        .await
        .unwrap();
    assert_eq!(alice.calls().toggle_local_audio().await, Some(false));
    assert_eq!(alice.calls().toggle_local_video().await, Some(false));
    assert_eq!(alice.calls().toggle_local_audio().await, Some(true));

    alice.calls().end_call().await;
    assert_eq!(alice.calls().toggle_local_video().await, None);
}

#[tokio::test]
async fn test_remote_tracks_are_announced() {
    let store = new_store();
    let alice = Peer::sign_in(&store, "alice").await;
    let bob = Peer::sign_in(&store, "bob").await;
    let mut tracks = alice.calls().events().remote_track.subscribe();

    alice
        .calls()
        .start_call(bob.identity.clone())
        .await
        .unwrap();
    bob.wait_for_pending_offer().await;
    bob.calls().accept_incoming().await.unwrap();

    let first = tracks.recv().await.unwrap();
    assert_eq!(first.peer, bob.identity);

    alice.calls().end_call().await;
    bob.calls().end_call().await;
}
