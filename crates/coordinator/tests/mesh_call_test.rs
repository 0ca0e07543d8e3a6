//! Mesh call end-to-end tests
//!
//! Two or three coordinators share an in-process signaling hub; peer
//! connections negotiate over real loopback ICE. The hub's sent-message
//! log is the observation point for signal-flow assertions.

mod harness;

use harness::{init_test_tracing, join_call, join_call_with_media, wait_until};
use meshcall::media::SampleMediaSource;
use meshcall::signaling::MemorySignalingHub;
use meshcall::{ConnectionState, SignalKind};
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const GOSSIP_TIMEOUT: Duration = Duration::from_secs(20);

async fn connection_state(call: &meshcall::GroupCall, user: &str) -> Option<ConnectionState> {
    call.participants()
        .await
        .into_iter()
        .find(|p| p.user_id == user)
        .map(|p| p.connection_state)
}

// =============================================================================
// Negotiation flow
// =============================================================================

/// The lexicographically smaller id sends exactly one offer; the other side
/// answers. Pure signal-flow assertions, independent of ICE completing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn smaller_id_sends_the_single_offer() {
    init_test_tracing();
    let hub = MemorySignalingHub::new();

    let u1 = join_call(&hub, "s1", "u1").await;
    let u2 = join_call(&hub, "s1", "u2").await;

    // both sides observe each other and negotiation signals flow
    assert!(
        wait_until(GOSSIP_TIMEOUT, || async {
            !hub.sent_of_kind(SignalKind::Answer).await.is_empty()
        })
        .await,
        "no answer was ever sent"
    );

    let offers = hub.sent_of_kind(SignalKind::Offer).await;
    assert_eq!(offers.len(), 1, "expected exactly one offer, got {offers:?}");
    assert_eq!(offers[0].sender, "u1");
    assert_eq!(offers[0].target.as_deref(), Some("u2"));

    let answers = hub.sent_of_kind(SignalKind::Answer).await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].sender, "u2");
    assert_eq!(answers[0].target.as_deref(), Some("u1"));

    u1.leave().await.unwrap();
    u2.leave().await.unwrap();
}

/// Full two-party scenario: directories converge, candidates trickle both
/// ways, and both links reach `connected`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_party_call_reaches_connected() {
    init_test_tracing();
    let hub = MemorySignalingHub::new();

    let u1 = join_call(&hub, "s1", "u1").await;
    let u2 = join_call(&hub, "s1", "u2").await;

    assert!(
        wait_until(GOSSIP_TIMEOUT, || async {
            u1.participants().await.len() == 2 && u2.participants().await.len() == 2
        })
        .await,
        "directories never converged"
    );

    assert!(
        wait_until(CONNECT_TIMEOUT, || async {
            connection_state(&u1, "u2").await == Some(ConnectionState::Connected)
                && connection_state(&u2, "u1").await == Some(ConnectionState::Connected)
        })
        .await,
        "links never reached connected"
    );

    // each side applied at least one candidate from the other
    let candidates = hub.sent_of_kind(SignalKind::IceCandidate).await;
    assert!(candidates.iter().any(|c| c.sender == "u1"));
    assert!(candidates.iter().any(|c| c.sender == "u2"));

    u1.leave().await.unwrap();
    u2.leave().await.unwrap();
}

// =============================================================================
// Gossip
// =============================================================================

/// Mute state travels over the control channel in both directions of the
/// toggle.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mute_toggle_gossips_to_the_peer() {
    init_test_tracing();
    let hub = MemorySignalingHub::new();

    let u1 = join_call(&hub, "s1", "u1").await;
    let u2 = join_call(&hub, "s1", "u2").await;

    assert!(
        wait_until(CONNECT_TIMEOUT, || async {
            connection_state(&u2, "u1").await == Some(ConnectionState::Connected)
        })
        .await,
        "links never connected"
    );

    assert!(u1.toggle_mute().await.unwrap());
    assert!(
        wait_until(GOSSIP_TIMEOUT, || async {
            u2.participants()
                .await
                .iter()
                .any(|p| p.user_id == "u1" && p.is_muted)
        })
        .await,
        "u2 never observed u1 muted"
    );

    assert!(!u1.toggle_mute().await.unwrap());
    assert!(u1.local_stream().is_audio_enabled());
    assert!(
        wait_until(GOSSIP_TIMEOUT, || async {
            u2.participants()
                .await
                .iter()
                .any(|p| p.user_id == "u1" && !p.is_muted)
        })
        .await,
        "u2 never observed u1 unmuted"
    );

    u1.leave().await.unwrap();
    u2.leave().await.unwrap();
}

/// A new joiner inherits the roster through catch-up gossip and the
/// persisted snapshot.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_party_directories_converge() {
    init_test_tracing();
    let hub = MemorySignalingHub::new();

    let u1 = join_call(&hub, "s1", "u1").await;
    let u2 = join_call(&hub, "s1", "u2").await;
    let u3 = join_call(&hub, "s1", "u3").await;

    for call in [&u1, &u2, &u3] {
        assert!(
            wait_until(CONNECT_TIMEOUT, || async {
                call.participants().await.len() == 3
            })
            .await,
            "a directory never reached 3 participants"
        );
    }

    u1.leave().await.unwrap();
    u2.leave().await.unwrap();
    u3.leave().await.unwrap();
}

// =============================================================================
// Moderation
// =============================================================================

/// Kicking removes the participant locally, sends a directed kick leave,
/// and disposes the kicked session.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kick_removes_and_disposes_the_target() {
    init_test_tracing();
    let hub = MemorySignalingHub::new();

    let u1 = join_call(&hub, "s1", "u1").await;
    let u3 = join_call(&hub, "s1", "u3").await;

    assert!(
        wait_until(CONNECT_TIMEOUT, || async {
            connection_state(&u1, "u3").await == Some(ConnectionState::Connected)
        })
        .await,
        "links never connected"
    );

    u1.kick_participant("u3").await.unwrap();

    // removed from the kicker's next roster
    assert!(u1.participants().await.iter().all(|p| p.user_id != "u3"));

    // the directed leave carries reason "kick"
    let leaves = hub.sent_of_kind(SignalKind::Leave).await;
    let kick = leaves
        .iter()
        .find(|m| m.sender == "u1" && m.target.as_deref() == Some("u3"))
        .expect("no directed leave was sent to u3");
    match &kick.body {
        meshcall::SignalBody::Leave { reason } => {
            assert_eq!(reason.as_deref(), Some("kick"));
        }
        other => panic!("unexpected body: {other:?}"),
    }

    // the kicked session tears itself down
    assert!(
        wait_until(GOSSIP_TIMEOUT, || async { u3.is_disposed() }).await,
        "u3 never disposed after the kick"
    );

    u1.leave().await.unwrap();
}

// =============================================================================
// Screenshare
// =============================================================================

/// An audio-only sender has no outbound video sender, so enabling
/// screenshare takes the add-track path and renegotiates; the flag still
/// reaches the peer.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn screenshare_without_camera_renegotiates_and_gossips() {
    init_test_tracing();
    let hub = MemorySignalingHub::new();

    let u1 =
        join_call_with_media(&hub, "s1", "u1", Arc::new(SampleMediaSource::audio_only())).await;
    let u2 = join_call(&hub, "s1", "u2").await;

    assert!(
        wait_until(CONNECT_TIMEOUT, || async {
            connection_state(&u2, "u1").await == Some(ConnectionState::Connected)
        })
        .await,
        "links never connected"
    );
    let offers_before = hub.sent_of_kind(SignalKind::Offer).await.len();

    assert!(u1.toggle_screenshare().await.unwrap());

    // the added track forces a renegotiation offer from u1
    assert!(
        wait_until(GOSSIP_TIMEOUT, || async {
            hub.sent_of_kind(SignalKind::Offer).await.len() > offers_before
        })
        .await,
        "no renegotiation offer was sent"
    );

    assert!(
        wait_until(GOSSIP_TIMEOUT, || async {
            u2.participants()
                .await
                .iter()
                .any(|p| p.user_id == "u1" && p.is_screensharing)
        })
        .await,
        "u2 never observed the screenshare flag"
    );

    assert!(!u1.toggle_screenshare().await.unwrap());
    u1.leave().await.unwrap();
    u2.leave().await.unwrap();
}

// =============================================================================
// Reconciliation
// =============================================================================

/// A burst of local mutations produces exactly one persisted snapshot
/// write.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutation_burst_writes_one_snapshot() {
    init_test_tracing();
    let hub = MemorySignalingHub::new();

    // solo session: nobody else writes the snapshot
    let u1 = join_call(&hub, "s1", "u1").await;

    // let any bootstrap-scheduled write drain first
    tokio::time::sleep(Duration::from_millis(600)).await;
    let before = hub.state_write_count("s1").await;

    u1.toggle_mute().await.unwrap();
    u1.toggle_video().await.unwrap();
    u1.toggle_mute().await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(hub.state_write_count("s1").await, before + 1);

    // the write carries the final state of the burst
    let state = hub.state("s1").await.unwrap();
    let me = state.participant("u1").unwrap();
    assert!(!me.is_muted);
    assert!(me.is_video_muted);

    u1.leave().await.unwrap();
}
