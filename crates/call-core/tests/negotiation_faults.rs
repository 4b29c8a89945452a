//! Integration tests for reordering, failures and partial outages.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use call_core::actors::{
    NegotiatorKey, NegotiatorState, SessionPhase, SessionSnapshot, SessionWarning, StreamClass,
};
use call_core::errors::{CallError, DeviceError, TransportError};
use call_core::media::TrackKind;
use call_core::peer::{IceCandidate, TransportState};
use call_core::signaling::{EventType, SignalingEvent};
use call_test_utils::{test_config, wait_until, TestCall};
use common::types::UserId;
use serde_json::json;

fn dropped(state: &SessionSnapshot, remote: &str, why: &str) -> bool {
    state.warnings.iter().any(|warning| {
        matches!(
            warning,
            SessionWarning::PeerDropped { remote_id, reason }
                if remote_id == &UserId::from(remote) && reason == why
        )
    })
}

// ============================================================================
// Reordering
// ============================================================================

#[tokio::test]
async fn test_candidates_overtaking_answer_are_applied_later() {
    let call = TestCall::new();
    let alice = call.client("alice");
    alice.handle.join(true).await.unwrap();

    call.bus.hold(EventType::Answer);
    let bob = call.client("bob");
    bob.handle.join(true).await.unwrap();

    let key = NegotiatorKey::media(bob.user_id.clone());
    let queued = alice
        .wait_for_negotiator(key.clone(), "candidate queued", |n| {
            n.pending_candidates > 0
        })
        .await;
    assert!(!queued.has_remote_description);
    assert_eq!(queued.applied_candidates, 0);
    assert_eq!(call.network.applied_candidates(&alice.user_id, &key), 0);

    call.bus.release_held();

    let applied = alice
        .wait_for_negotiator(key.clone(), "candidates applied", |n| {
            n.has_remote_description && n.pending_candidates == 0
        })
        .await;
    assert!(applied.applied_candidates > 0);
    assert!(call.network.applied_candidates(&alice.user_id, &key) > 0);

    alice
        .wait_for_negotiator(key, "connected", |n| n.state == NegotiatorState::Connected)
        .await;
}

#[tokio::test]
async fn test_candidate_before_offer_is_stashed() {
    let call = TestCall::new();
    let bob = call.client("bob");
    bob.handle.join(true).await.unwrap();

    // A candidate from alice arrives before her offer.
    call.bus.inject(
        &call.conversation_id,
        SignalingEvent::candidate(
            StreamClass::Media,
            UserId::from("alice"),
            bob.user_id.clone(),
            call.conversation_id.clone(),
            IceCandidate {
                candidate: "candidate:7 1 udp 2122260223 10.0.0.7 7000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        ),
    );

    let alice = call.client("alice");
    alice.handle.join(true).await.unwrap();

    // Bob's negotiator got the stashed candidate plus every live one.
    bob.wait_for("alice connected", |s| {
        s.participants.iter().any(|p| p.main_stream.is_some())
    })
    .await;
    let snapshot = bob
        .negotiator_state(NegotiatorKey::media(alice.user_id.clone()))
        .await
        .unwrap();
    assert!(snapshot.applied_candidates >= 2);
}

// ============================================================================
// Failure Isolation
// ============================================================================

#[tokio::test]
async fn test_failed_peer_does_not_disturb_others() {
    let call = TestCall::new();
    let [alice, bob, carol] = call.joined_mesh(["alice", "bob", "carol"]).await;

    let carol_key = NegotiatorKey::media(carol.user_id.clone());
    let carol_generation = alice
        .negotiator_state(carol_key.clone())
        .await
        .unwrap()
        .generation;

    assert!(call.network.force_state(
        &alice.user_id,
        &NegotiatorKey::media(bob.user_id.clone()),
        TransportState::Failed,
    ));

    let state = alice
        .wait_for("bob dropped", |s| s.media_peers == vec![UserId::from("carol")])
        .await;
    assert_eq!(state.phase, SessionPhase::Active);
    assert_eq!(state.participants.len(), 1);
    assert!(state
        .participants
        .iter()
        .all(|p| p.user_id == carol.user_id && p.main_stream.is_some()));
    assert!(dropped(&state, "bob", "failed"));

    let carol_side = alice.negotiator_state(carol_key).await.unwrap();
    assert_eq!(carol_side.state, NegotiatorState::Connected);
    assert_eq!(carol_side.generation, carol_generation);

    assert_eq!(carol.state().media_peers.len(), 2);
}

#[tokio::test]
async fn test_disconnected_peer_is_removed() {
    let call = TestCall::new();
    let [alice, bob] = call.joined_mesh(["alice", "bob"]).await;

    call.network.force_state(
        &bob.user_id,
        &NegotiatorKey::media(alice.user_id.clone()),
        TransportState::Disconnected,
    );

    let state = bob
        .wait_for("alice dropped", |s| s.participants.is_empty())
        .await;
    assert!(state.media_peers.is_empty());
    assert!(dropped(&state, "alice", "disconnected"));
    wait_until("bob's endpoint closed", || {
        call.network.live_endpoints(&bob.user_id).is_empty()
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_negotiation_times_out_without_connectivity() {
    let call = TestCall::new();
    call.network.set_auto_connect(false);

    let config = || {
        let mut config = test_config();
        config.negotiation_timeout = Duration::from_millis(300);
        config
    };
    let alice = call.client_with_config("alice", config());
    alice.handle.join(true).await.unwrap();
    let bob = call.client_with_config("bob", config());
    bob.handle.join(true).await.unwrap();

    let state = alice
        .wait_for("bob timed out", |s| dropped(s, "bob", "timeout"))
        .await;
    assert!(state.media_peers.is_empty());
    assert!(state.participants.is_empty());
    assert_eq!(state.phase, SessionPhase::Active);

    let state = bob
        .wait_for("alice timed out", |s| {
            dropped(s, "alice", "timeout")
        })
        .await;
    assert!(state.media_peers.is_empty());
}

#[tokio::test]
async fn test_malformed_payload_drops_only_that_peer() {
    let call = TestCall::new();
    let alice = call.client("alice");
    alice.handle.join(true).await.unwrap();

    call.bus.inject(
        &call.conversation_id,
        SignalingEvent::join(UserId::from("mallory"), call.conversation_id.clone(), true),
    );
    alice
        .wait_for("mallory offered", |s| {
            s.media_peers == vec![UserId::from("mallory")]
        })
        .await;

    let mut bad_answer = SignalingEvent::join(
        UserId::from("mallory"),
        call.conversation_id.clone(),
        false,
    );
    bad_answer.event_type = EventType::Answer;
    bad_answer.target_id = Some(alice.user_id.clone());
    bad_answer.payload = json!({ "sdp": 42 });
    call.bus.inject(&call.conversation_id, bad_answer);

    let state = alice
        .wait_for("mallory dropped", |s| s.media_peers.is_empty())
        .await;
    assert!(state.participants.is_empty());
    assert!(dropped(&state, "mallory", "malformed payload"));
    assert_eq!(state.phase, SessionPhase::Active);
}

#[tokio::test]
async fn test_events_for_other_targets_are_ignored() {
    let call = TestCall::new();
    let [alice, bob] = call.joined_mesh(["alice", "bob"]).await;
    let before = alice.state();

    let mut stray = SignalingEvent::join(
        UserId::from("carol"),
        call.conversation_id.clone(),
        false,
    );
    stray.event_type = EventType::Offer;
    stray.target_id = Some(UserId::from("dave"));
    stray.payload = json!({ "sdp": { "type": "offer", "sdp": "mock-sdp endpoint=999" } });
    call.bus.inject(&call.conversation_id, stray);

    tokio::time::sleep(Duration::from_millis(100)).await;
    for client in [&alice, &bob] {
        let state = client.state();
        assert_eq!(state.media_peers.len(), 1);
        assert_eq!(state.participants.len(), 1);
        assert!(state.warnings.is_empty());
    }
    assert_eq!(alice.state().media_peers, before.media_peers);
}

// ============================================================================
// Transport Faults
// ============================================================================

#[tokio::test]
async fn test_publish_failure_becomes_warning() {
    let call = TestCall::new();
    let [_alice, bob] = call.joined_mesh(["alice", "bob"]).await;

    call.bus.fail_publish_from(&bob.user_id);
    let carol = call.client("carol");
    carol.handle.join(true).await.unwrap();

    // Bob's offer to carol and the candidates after it all fail.
    let state = bob
        .wait_for("publish warning", |s| {
            s.warnings
                .iter()
                .any(|w| matches!(w, SessionWarning::PublishFailed { .. }))
        })
        .await;
    assert_eq!(state.phase, SessionPhase::Active);
    assert!(state.participants.iter().any(|p| p.user_id == UserId::from("alice")));
}

#[tokio::test]
async fn test_subscription_loss_is_surfaced() {
    let call = TestCall::new();
    let [alice, _bob] = call.joined_mesh(["alice", "bob"]).await;

    call.bus.disconnect_all();

    let state = alice
        .wait_for("signaling lost", |s| {
            s.warnings.contains(&SessionWarning::SignalingLost)
        })
        .await;
    assert_eq!(state.phase, SessionPhase::Active);
    assert_eq!(state.media_peers.len(), 1);
}

// ============================================================================
// Join Failures
// ============================================================================

#[tokio::test]
async fn test_device_failure_rolls_back_join() {
    let call = TestCall::new();
    let alice = call.client("alice");
    alice.capture.fail_camera(DeviceError::Busy(TrackKind::Video));

    let result = alice.handle.join(true).await;

    assert!(matches!(
        result,
        Err(CallError::Device(DeviceError::Busy(TrackKind::Video)))
    ));
    assert_eq!(alice.state().phase, SessionPhase::Ended);
    assert!(alice.capture.all_released());
    assert_eq!(call.bus.subscribe_count(), 0);
    assert_eq!(call.bus.count_of(EventType::Join), 0);
}

#[tokio::test]
async fn test_subscribe_failure_rolls_back_join() {
    let call = TestCall::new();
    call.bus.fail_subscribe(true);
    let alice = call.client("alice");

    let result = alice.handle.join(true).await;

    assert!(matches!(
        result,
        Err(CallError::Transport(TransportError::Subscribe(_)))
    ));
    assert_eq!(alice.state().phase, SessionPhase::Ended);
    assert!(alice.capture.all_released());
}

#[tokio::test]
async fn test_join_announce_failure_rolls_back_join() {
    let call = TestCall::new();
    let alice = call.client("alice");
    call.bus.fail_publish_from(&alice.user_id);

    let result = alice.handle.join(true).await;

    assert!(matches!(
        result,
        Err(CallError::Transport(TransportError::Publish(_)))
    ));
    assert_eq!(alice.state().phase, SessionPhase::Ended);
    assert!(alice.capture.all_released());
    assert_eq!(call.bus.subscribe_count(), 1);
}

#[tokio::test]
async fn test_leave_while_acquiring_aborts_join() {
    let call = TestCall::new();
    let alice = call.client("alice");
    alice.capture.hold_permission();

    let joining = {
        let handle = alice.handle.clone();
        tokio::spawn(async move { handle.join(false).await })
    };
    alice
        .wait_for("connecting", |s| s.phase == SessionPhase::Connecting)
        .await;

    alice.handle.leave().await.unwrap();
    assert!(matches!(
        joining.await.unwrap(),
        Err(CallError::JoinAborted)
    ));

    // The late grant must not leave a live microphone behind.
    alice.capture.grant_permission();
    wait_until("late microphone released", || {
        !alice.capture.opened_tracks().is_empty() && alice.capture.all_released()
    })
    .await
    .unwrap();

    assert_eq!(alice.state().phase, SessionPhase::Ended);
    assert_eq!(call.bus.count_of(EventType::Join), 0);
}
