//! Integration tests for mesh calls.
//!
//! Several session actors run against one in-memory signaling bus and one
//! loopback peer network.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use call_core::actors::{NegotiatorKey, Role, SessionPhase};
use call_core::errors::CallError;
use call_core::signaling::EventType;
use call_test_utils::{wait_until, TestCall};
use common::types::UserId;

// ============================================================================
// Mesh Formation
// ============================================================================

#[tokio::test]
async fn test_three_way_mesh_is_symmetric() {
    let call = TestCall::new();
    let [alice, bob, carol] = call.joined_mesh(["alice", "bob", "carol"]).await;

    for (client, expected) in [
        (&alice, ["bob", "carol"]),
        (&bob, ["alice", "carol"]),
        (&carol, ["alice", "bob"]),
    ] {
        let state = client.state();
        let expected: Vec<UserId> = expected.into_iter().map(UserId::from).collect();
        let participants: Vec<UserId> = state
            .participants
            .iter()
            .map(|p| p.user_id.clone())
            .collect();

        assert_eq!(state.phase, SessionPhase::Active);
        assert_eq!(participants, expected);
        assert_eq!(state.media_peers, expected);
        assert!(state.screen_peers.is_empty());
        assert!(!participants.contains(&client.user_id));
    }

    // Each pair negotiates exactly once: one join per client, one offer and
    // one answer per pair.
    assert_eq!(call.bus.count_of(EventType::Join), 3);
    assert_eq!(call.bus.count_of(EventType::Offer), 3);
    assert_eq!(call.bus.count_of(EventType::Answer), 3);
    assert_eq!(call.bus.count_of(EventType::ScreenOffer), 0);

    wait_until("every media endpoint connected", || {
        ["alice", "bob", "carol"]
            .into_iter()
            .all(|name| call.network.connected_endpoints(&UserId::from(name)).len() == 2)
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_existing_member_offers_to_newcomer() {
    let call = TestCall::new();
    let [alice, bob] = call.joined_mesh(["alice", "bob"]).await;

    let alice_side = alice
        .negotiator_state(NegotiatorKey::media(bob.user_id.clone()))
        .await
        .expect("alice holds a negotiator for bob");
    let bob_side = bob
        .negotiator_state(NegotiatorKey::media(alice.user_id.clone()))
        .await
        .expect("bob holds a negotiator for alice");

    assert_eq!(alice_side.role, Some(Role::Caller));
    assert_eq!(bob_side.role, Some(Role::Callee));
    assert!(alice_side.has_remote_description);
    assert!(bob_side.has_local_description);

    let offers = call.bus.published_by(&alice.user_id, EventType::Offer);
    assert_eq!(offers.len(), 1);
    assert_eq!(
        offers.first().and_then(|e| e.target_id.clone()),
        Some(bob.user_id.clone())
    );
}

#[tokio::test]
async fn test_remote_tracks_fill_participant_streams() {
    let call = TestCall::new();
    let [alice, _bob] = call.joined_mesh(["alice", "bob"]).await;

    let state = alice.state();
    let bob = state.participants.first().expect("bob is visible");
    let main = bob.main_stream.as_ref().expect("bob's main stream arrived");

    assert_eq!(main.tracks.len(), 2);
    assert!(bob.is_video_enabled);
    assert!(!bob.is_screen_sharing);
    assert!(bob.screen_stream.is_none());
}

// ============================================================================
// Self Filtering
// ============================================================================

#[tokio::test]
async fn test_own_events_never_create_negotiators() {
    let call = TestCall::new();
    let alice = call.client("alice");
    alice.handle.join(true).await.unwrap();

    // The bus echoes alice's own join back to her.
    assert_eq!(call.bus.count_of(EventType::Join), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = alice.state();
    assert!(state.participants.is_empty());
    assert!(state.media_peers.is_empty());
    assert_eq!(call.network.created_count(), 0);
}

// ============================================================================
// Leave
// ============================================================================

#[tokio::test]
async fn test_leave_releases_everything_and_is_idempotent() {
    let call = TestCall::new();
    let [alice, bob] = call.joined_mesh(["alice", "bob"]).await;

    alice.handle.leave().await.unwrap();
    alice.handle.leave().await.unwrap();

    let state = alice.state();
    assert_eq!(state.phase, SessionPhase::Ended);
    assert!(state.participants.is_empty());
    assert!(state.media_peers.is_empty());
    assert_eq!(state.duration_seconds, 0);
    assert!(alice.capture.all_released());
    assert!(call.network.live_endpoints(&alice.user_id).is_empty());
    assert_eq!(call.bus.count_of(EventType::Leave), 1);

    bob.wait_for("alice removed", |s| {
        s.participants.is_empty() && s.media_peers.is_empty()
    })
    .await;
    assert_eq!(bob.state().phase, SessionPhase::Active);
}

#[tokio::test]
async fn test_join_after_end_is_rejected() {
    let call = TestCall::new();
    let alice = call.client("alice");
    alice.handle.join(false).await.unwrap();
    alice.handle.leave().await.unwrap();

    let result = alice.handle.join(false).await;
    assert!(matches!(
        result,
        Err(CallError::InvalidPhase(SessionPhase::Ended))
    ));
}

#[tokio::test]
async fn test_join_twice_is_rejected() {
    let call = TestCall::new();
    let alice = call.client("alice");
    alice.handle.join(false).await.unwrap();

    assert!(matches!(
        alice.handle.join(false).await,
        Err(CallError::AlreadyJoined)
    ));
    assert_eq!(call.bus.count_of(EventType::Join), 1);
}

#[tokio::test]
async fn test_cancelled_client_leaves_the_call() {
    let call = TestCall::new();
    let [alice, bob] = call.joined_mesh(["alice", "bob"]).await;

    let capture = alice.capture.clone();
    alice.shutdown().await;

    assert!(capture.all_released());
    assert_eq!(call.bus.count_of(EventType::Leave), 1);
    bob.wait_for("alice removed", |s| s.participants.is_empty())
        .await;
}

#[tokio::test]
async fn test_rejoining_peer_gets_fresh_negotiation() {
    let call = TestCall::new();
    let [alice, bob] = call.joined_mesh(["alice", "bob"]).await;

    bob.handle.leave().await.unwrap();
    alice
        .wait_for("bob removed", |s| s.participants.is_empty())
        .await;

    // A new session for the same user id joins the same call.
    let bob_again = call.client("bob");
    bob_again.handle.join(true).await.unwrap();

    alice
        .wait_for("bob back", |s| {
            s.media_peers.len() == 1
                && s.participants.len() == 1
                && s.participants.iter().all(|p| p.main_stream.is_some())
        })
        .await;
    assert_eq!(call.bus.published_by(&alice.user_id, EventType::Offer).len(), 2);
}

// ============================================================================
// Local Controls
// ============================================================================

#[tokio::test]
async fn test_toggles_flip_local_tracks() {
    let call = TestCall::new();
    let alice = call.client("alice");
    alice.handle.join(true).await.unwrap();

    assert!(alice.handle.toggle_mute().await.unwrap());
    assert!(!alice.handle.toggle_video().await.unwrap());

    let state = alice.state();
    assert!(state.flags.is_muted);
    assert!(!state.flags.is_video_enabled);
    assert!(alice
        .capture
        .opened_tracks()
        .iter()
        .all(|t| !t.is_enabled()));

    assert!(!alice.handle.toggle_mute().await.unwrap());
    assert!(!alice.state().flags.is_muted);
}

#[tokio::test]
async fn test_toggles_before_join_fail() {
    let call = TestCall::new();
    let alice = call.client("alice");

    assert!(matches!(
        alice.handle.toggle_mute().await,
        Err(CallError::NotInCall)
    ));
    assert!(matches!(
        alice.handle.toggle_screen_share(true).await,
        Err(CallError::NotInCall)
    ));
}

#[tokio::test]
async fn test_audio_only_join_has_no_video_track() {
    let call = TestCall::new();
    let alice = call.client("alice");
    alice.handle.join(false).await.unwrap();

    assert!(!alice.state().flags.is_video_enabled);
    assert_eq!(alice.capture.opened_tracks().len(), 1);
    assert!(alice.handle.toggle_video().await.is_err());
}
