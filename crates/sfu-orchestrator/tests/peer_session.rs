//! Peer membership, the join protocol and liveness.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sfu_orchestrator::session::SpawnOutcome;
use sfu_orchestrator::signaling::messages::{PeerListUpdate, ServerPush};
use sfu_orchestrator::tasks::run_liveness_sweep;
use sfu_orchestrator::types::UserId;
use sfu_orchestrator::world::Inviter;
use sfu_test_utils::{ScriptedPeer, TestSession};
use tokio_util::sync::CancellationToken;

async fn last_peer_list(peer: &ScriptedPeer) -> PeerListUpdate {
    peer.pushes()
        .await
        .into_iter()
        .filter_map(|p| match p {
            ServerPush::PeerList(update) => Some(update),
            _ => None,
        })
        .last()
        .expect("a peer list was pushed")
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_user_index_is_reused_on_reconnect() {
    let test = TestSession::start().await;

    let alice = test.connect("alice").await;
    let bob = test.connect("bob").await;
    assert_eq!(alice.user_index, 1);
    assert_eq!(bob.user_index, 2);

    assert!(alice.disconnect().await);
    let alice_again = test.connect("alice").await;
    let carol = test.connect("carol").await;

    assert_eq!(alice_again.user_index, 1);
    assert_eq!(carol.user_index, 3);

    let (index, _) = test.world.profile(&UserId::from("alice")).await.unwrap();
    assert_eq!(index, 1);
}

#[tokio::test]
async fn test_overlapping_connections_share_user_index_but_not_peer_index() {
    let test = TestSession::start().await;

    let first = test.connect("alice").await;
    let second = test.connect("alice").await;

    assert_eq!(first.user_index, second.user_index);
    let first_peer = first.snapshot().await.unwrap();
    let second_peer = second.snapshot().await.unwrap();
    assert!(second_peer.peer_index > first_peer.peer_index);
    assert_eq!(
        test.session
            .peers()
            .find_by_user(&UserId::from("alice"))
            .await
            .unwrap()
            .peer_id,
        second.peer_id
    );
}

#[tokio::test]
async fn test_join_and_leave_are_announced() {
    let test = TestSession::start().await;

    let alice = test.connect("alice").await;
    assert!(alice.disconnect().await);
    assert!(!alice.disconnect().await);

    assert_eq!(
        test.directory.notifications().await,
        vec!["alice joined".to_string(), "alice left".to_string()]
    );
}

#[tokio::test]
async fn test_peer_list_revisions_increase() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;
    let bob = test.connect("bob").await;

    alice.join().await;
    let after_alice = last_peer_list(&alice).await;
    bob.join().await;
    let after_bob = last_peer_list(&alice).await;

    assert!(after_bob.revision > after_alice.revision);
    assert_eq!(after_bob.peers.len(), 2);
    assert_eq!(after_bob.peers[0].peer_id, alice.peer_id);
    assert_eq!(after_bob.peers[1].user_id, UserId::from("bob"));

    assert!(bob.disconnect().await);
    let after_leave = last_peer_list(&alice).await;
    assert!(after_leave.revision > after_bob.revision);
    assert_eq!(after_leave.peers.len(), 1);
}

// ============================================================================
// Join protocol
// ============================================================================

#[tokio::test]
async fn test_join_returns_capabilities_and_cached_actions() {
    let test = TestSession::builder()
        .world_start_time(1_234)
        .build()
        .await;
    test.world
        .cache_event(&UserId::from("alice"), json!({ "action": "wave" }))
        .await;
    let alice = test.connect("alice").await;

    let data = alice.join().await;

    assert_eq!(data["peerId"], json!(alice.peer_id));
    assert_eq!(data["worldStartTime"], 1_234);
    assert_eq!(data["cachedActions"], json!([{ "action": "wave" }]));
    assert!(data["routerRtpCapabilities"]["codecs"].is_array());
    assert!(data["highResTimeOrigin"].as_f64().unwrap() > 0.0);

    // Cached actions are delivered once
    let again = alice.join().await;
    assert_eq!(again["cachedActions"], json!([]));
}

#[tokio::test(start_paused = true)]
async fn test_invite_spawns_near_inviter_once_avatars_exist() {
    let test = TestSession::builder()
        .instance_id("instance-a")
        .spawn_retry(10, Duration::from_millis(100))
        .build()
        .await;
    let host = UserId::from("host");
    let guest = UserId::from("guest");
    test.directory
        .add_invite(
            "code-1",
            Inviter {
                user_id: host.clone(),
                instance_id: Some("instance-a".to_string()),
            },
        )
        .await;
    let _host_peer = test.connect("host").await;
    let guest_peer = test.connect("guest").await;
    test.world.mark_spawned(&host).await;

    guest_peer.join_with_invite("code-1").await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(test.world.spawns().await.is_empty());

    test.world.mark_spawned(&guest).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(test.world.spawns().await, vec![(guest, host)]);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_near_inviter_outcomes() {
    let test = TestSession::builder()
        .instance_id("instance-a")
        .spawn_retry(3, Duration::from_millis(100))
        .build()
        .await;
    let guest = UserId::from("guest");
    test.directory
        .add_invite(
            "elsewhere",
            Inviter {
                user_id: UserId::from("host"),
                instance_id: Some("instance-b".to_string()),
            },
        )
        .await;
    test.directory
        .add_invite(
            "absent",
            Inviter {
                user_id: UserId::from("host"),
                instance_id: None,
            },
        )
        .await;

    let outcome = test
        .session
        .spawn_near_inviter(guest.clone(), "unknown".to_string(), CancellationToken::new())
        .await;
    assert_eq!(outcome, SpawnOutcome::InviterNotFound);

    let outcome = test
        .session
        .spawn_near_inviter(guest.clone(), "elsewhere".to_string(), CancellationToken::new())
        .await;
    assert_eq!(outcome, SpawnOutcome::InviterElsewhere);

    // Inviter never connects: bounded retries, then give up
    let outcome = test
        .session
        .spawn_near_inviter(guest.clone(), "absent".to_string(), CancellationToken::new())
        .await;
    assert_eq!(outcome, SpawnOutcome::GaveUp);

    let token = CancellationToken::new();
    token.cancel();
    let outcome = test
        .session
        .spawn_near_inviter(guest, "absent".to_string(), token)
        .await;
    assert_eq!(outcome, SpawnOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_channel_instance_ignores_invites() {
    let test = TestSession::builder().channel_instance().build().await;
    let host = UserId::from("host");
    let guest = UserId::from("guest");
    test.directory
        .add_invite(
            "code-1",
            Inviter {
                user_id: host.clone(),
                instance_id: None,
            },
        )
        .await;
    test.world.mark_spawned(&host).await;
    test.world.mark_spawned(&guest).await;
    let _host_peer = test.connect("host").await;
    let guest_peer = test.connect("guest").await;

    guest_peer.join_with_invite("code-1").await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(test.world.spawns().await.is_empty());
}

// ============================================================================
// Leaving and liveness
// ============================================================================

#[tokio::test]
async fn test_leave_world_keeps_connection_open() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;
    alice.create_transport("send", "instance", None).await;

    let data = alice.request_ok("LeaveWorld", json!(null)).await;

    assert_eq!(data["left"], true);
    assert!(alice.snapshot().await.is_none());
    assert_eq!(test.session.transports().len().await, 0);
    assert!(!alice.is_closed().await);
}

#[tokio::test]
async fn test_requests_from_departed_peer_fail() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;
    alice.request_ok("LeaveWorld", json!(null)).await;

    let response = alice
        .request(
            "TransportCreate",
            json!({ "direction": "send", "channelType": "instance" }),
        )
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, 4);
    assert_eq!(error.message, "Client no longer exists");
}

#[tokio::test(start_paused = true)]
async fn test_liveness_sweep_expires_silent_peers() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;
    let bob = test.connect("bob").await;
    let token = CancellationToken::new();
    tokio::spawn(run_liveness_sweep(
        Arc::clone(&test.session),
        Duration::from_secs(1),
        Duration::from_secs(5),
        token.clone(),
    ));

    // Only bob keeps sending heartbeats
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        bob.send("Heartbeat", json!(null)).await;
    }

    assert!(alice.snapshot().await.is_none());
    assert!(bob.snapshot().await.is_some());
    assert!(alice.is_closed().await);
    assert!(!bob.is_closed().await);

    token.cancel();
}

#[tokio::test]
async fn test_shutdown_disconnects_everyone() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;
    let bob = test.connect("bob").await;
    alice.create_transport("send", "instance", None).await;
    bob.create_transport("recv", "instance", None).await;

    test.session.shutdown().await;

    assert!(test.session.peers().is_empty().await);
    assert!(test.session.transports().is_empty().await);
    assert!(test.session.cancel_token().is_cancelled());
}
