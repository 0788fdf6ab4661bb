//! Media production and consumption through the signaling handler.
//!
//! Covers the publish/subscribe round trip between two peers, slot
//! replacement, consumer pause state, cascades on disconnect and the
//! ordering of queued pause/resume requests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use serde_json::json;
use sfu_orchestrator::engine::EngineOp;
use sfu_orchestrator::signaling::messages::ServerPush;
use sfu_orchestrator::types::{ChannelKey, ProducerId};
use sfu_test_utils::{ScriptedPeer, TestSession};

/// Two joined peers: `alice` with a connected send transport, `bob` with a
/// connected receive transport, both on the instance channel.
async fn publisher_and_subscriber(
    test: &TestSession,
) -> (ScriptedPeer, ScriptedPeer, sfu_orchestrator::types::TransportId) {
    let alice = test.connect("alice").await;
    let bob = test.connect("bob").await;
    alice.join().await;
    bob.join().await;

    let send = alice.create_transport("send", "instance", None).await;
    assert!(alice.connect_transport(send).await);
    let recv = bob.create_transport("recv", "instance", None).await;
    assert!(bob.connect_transport(recv).await);

    (alice, bob, send)
}

fn is_available(producer_id: ProducerId) -> impl Fn(&ServerPush) -> bool {
    move |push| matches!(push, ServerPush::ProducerAvailable(p) if p.producer_id == producer_id)
}

// ============================================================================
// Publish / subscribe
// ============================================================================

#[tokio::test]
async fn test_subscriber_sees_announced_producer_and_resumes_it() {
    let test = TestSession::builder().workers(2).build().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;

    let producer_id = alice.send_track(send, "cam", "instance", None).await;

    let announced = bob.wait_for_push(is_available(producer_id)).await;
    let ServerPush::ProducerAvailable(announced) = announced else {
        unreachable!()
    };
    assert_eq!(announced.peer_id, alice.peer_id);
    assert_eq!(announced.media_tag, "cam");
    assert_eq!(announced.channel_type, "instance");

    let consumer = bob
        .receive_track(alice.peer_id, "cam", "instance", None)
        .await;
    assert_eq!(consumer.producer_id, producer_id);
    assert!(!consumer.producer_paused);
    assert_eq!(consumer.consumer_type, "simulcast");

    // Consumers start paused until the client resumes them
    assert_eq!(test.engine.consumer_paused(consumer.id).await, Some(true));
    let state = test.session.consumer_state(consumer.id).await.unwrap();
    assert!(state.paused);

    let response = bob.resume_consumer(consumer.id).await;
    assert!(response.error.is_none());
    assert_eq!(response.data.unwrap()["resumed"], true);

    bob.wait_for_push(|p| matches!(p, ServerPush::ConsumerResumed(c) if c.consumer_id == consumer.id))
        .await;
    assert_eq!(test.engine.consumer_paused(consumer.id).await, Some(false));
    assert!(!test.session.consumer_state(consumer.id).await.unwrap().paused);
}

#[tokio::test]
async fn test_producer_is_piped_to_every_router_of_its_pool() {
    let test = TestSession::builder().workers(3).build().await;
    let (alice, _bob, send) = publisher_and_subscriber(&test).await;

    let producer_id = alice.send_track(send, "cam", "instance", None).await;

    let routers = test.engine.producer_routers(producer_id).await;
    let pool: Vec<_> = test.session.routers().instance_pool().router_ids();
    assert_eq!(routers.len(), pool.len());
    assert!(pool.iter().all(|r| routers.contains(r)));
}

#[tokio::test]
async fn test_producer_announcement_respects_channel_membership() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;
    let bob = test.connect("bob").await;
    let carol = test.connect("carol").await;

    let send = alice.create_transport("send", "channel", Some("room-1")).await;
    bob.create_transport("recv", "channel", Some("room-1")).await;
    carol.create_transport("recv", "channel", Some("room-2")).await;

    let producer_id = alice.send_track(send, "cam", "channel", Some("room-1")).await;

    bob.wait_for_push(is_available(producer_id)).await;
    assert!(!carol
        .pushes()
        .await
        .iter()
        .any(|p| matches!(p, ServerPush::ProducerAvailable(_))));
}

#[tokio::test]
async fn test_resending_a_slot_replaces_the_producer() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;

    let first = alice.send_track(send, "cam", "instance", None).await;
    let second = alice.send_track(send, "cam", "instance", None).await;
    assert_ne!(first, second);

    bob.wait_for_push(|p| matches!(p, ServerPush::ProducerClosed(c) if c.producer_id == first))
        .await;
    assert!(test.session.media().producer(first).await.is_none());
    assert!(test.engine.producer_routers(first).await.is_empty());

    let slot = alice
        .snapshot()
        .await
        .unwrap()
        .media_slot("cam", &ChannelKey::instance())
        .cloned()
        .unwrap();
    assert_eq!(slot.producer_id, second);
    assert_eq!(test.session.media().counts().await.producers, 1);
}

#[tokio::test]
async fn test_same_tag_in_two_channels_keeps_both_producers() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    let room = ChannelKey::new("channel", Some("room-1".to_string()));
    let room_send = alice.create_transport("send", "channel", Some("room-1")).await;
    bob.create_transport("recv", "channel", Some("room-1")).await;

    let instance_cam = alice.send_track(send, "cam", "instance", None).await;
    let room_cam = alice
        .send_track(room_send, "cam", "channel", Some("room-1"))
        .await;

    assert_ne!(instance_cam, room_cam);
    assert!(test.session.media().producer(instance_cam).await.is_some());
    assert!(test.session.media().producer(room_cam).await.is_some());
    let peer = alice.snapshot().await.unwrap();
    assert_eq!(
        peer.media_slot("cam", &ChannelKey::instance()).unwrap().producer_id,
        instance_cam
    );
    assert_eq!(peer.media_slot("cam", &room).unwrap().producer_id, room_cam);

    let from_instance = bob.receive_track(alice.peer_id, "cam", "instance", None).await;
    let from_room = bob
        .receive_track(alice.peer_id, "cam", "channel", Some("room-1"))
        .await;
    assert_eq!(from_instance.producer_id, instance_cam);
    assert_eq!(from_room.producer_id, room_cam);

    // Closing one channel's producer leaves the other slot alone
    alice
        .request_ok("CloseProducer", json!({ "producerId": room_cam }))
        .await;
    let peer = alice.snapshot().await.unwrap();
    assert!(peer.media_slot("cam", &room).is_none());
    assert!(peer.media_slot("cam", &ChannelKey::instance()).is_some());
    assert!(test.engine.has_consumer(from_instance.id).await);
    assert!(!test.engine.has_consumer(from_room.id).await);
}

#[tokio::test]
async fn test_consumer_reports_paused_producer() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;

    let producer_id = alice.send_track(send, "mic", "instance", None).await;
    let response = alice.pause_producer(producer_id, false).await;
    assert!(response.error.is_none());

    let consumer = bob.receive_track(alice.peer_id, "mic", "instance", None).await;
    assert!(consumer.producer_paused);
    assert_eq!(test.engine.consumer_paused(consumer.id).await, Some(true));
}

#[tokio::test]
async fn test_consume_without_receive_transport_fails() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;
    let bob = test.connect("bob").await;
    let send = alice.create_transport("send", "instance", None).await;
    alice.send_track(send, "cam", "instance", None).await;

    let response = bob
        .request(
            "ReceiveTrack",
            json!({
                "mediaPeerId": alice.peer_id,
                "mediaTag": "cam",
                "rtpCapabilities": sfu_test_utils::rtp_capabilities(),
                "channelType": "instance",
            }),
        )
        .await;

    assert_eq!(response.error.unwrap().code, 4);
}

#[tokio::test]
async fn test_incompatible_capabilities_cannot_consume() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    alice.send_track(send, "cam", "instance", None).await;
    test.engine.set_reject_consume(true).await;

    let response = bob
        .request(
            "ReceiveTrack",
            json!({
                "mediaPeerId": alice.peer_id,
                "mediaTag": "cam",
                "rtpCapabilities": sfu_test_utils::rtp_capabilities(),
                "channelType": "instance",
            }),
        )
        .await;

    assert_eq!(response.error.unwrap().code, 5);
    assert_eq!(test.engine.call_count(EngineOp::Consume).await, 0);
}

#[tokio::test]
async fn test_unknown_media_tag_is_producer_not_found() {
    let test = TestSession::start().await;
    let (alice, bob, _send) = publisher_and_subscriber(&test).await;

    let response = bob
        .request(
            "ReceiveTrack",
            json!({
                "mediaPeerId": alice.peer_id,
                "mediaTag": "screen",
                "rtpCapabilities": sfu_test_utils::rtp_capabilities(),
                "channelType": "instance",
            }),
        )
        .await;

    assert_eq!(response.error.unwrap().code, 4);
}

// ============================================================================
// Cascades
// ============================================================================

#[tokio::test]
async fn test_producer_disconnect_leaves_no_orphan_consumers() {
    let test = TestSession::builder().workers(2).build().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    let producer_id = alice.send_track(send, "cam", "instance", None).await;
    let consumer = bob.receive_track(alice.peer_id, "cam", "instance", None).await;

    assert!(alice.disconnect().await);

    bob.wait_for_push(|p| matches!(p, ServerPush::ConsumerClosed(c) if c.consumer_id == consumer.id))
        .await;
    bob.wait_for_push(|p| matches!(p, ServerPush::ProducerClosed(c) if c.producer_id == producer_id))
        .await;

    assert!(test.session.media().consumer(consumer.id).await.is_none());
    assert!(!test.engine.has_consumer(consumer.id).await);
    assert!(test.engine.producer_routers(producer_id).await.is_empty());
    assert!(!test.engine.has_transport(send).await);

    let bob_state = bob.snapshot().await.unwrap();
    assert!(bob_state.consumer_layers.is_empty());
    let counts = test.session.media().counts().await;
    assert_eq!(counts.producers, 0);
    assert_eq!(counts.consumers, 0);
}

#[tokio::test]
async fn test_subscriber_disconnect_closes_its_consumers_only() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    let producer_id = alice.send_track(send, "cam", "instance", None).await;
    let consumer = bob.receive_track(alice.peer_id, "cam", "instance", None).await;

    assert!(bob.disconnect().await);

    assert!(!test.engine.has_consumer(consumer.id).await);
    assert!(test.session.media().producer(producer_id).await.is_some());
    assert!(alice
        .snapshot()
        .await
        .unwrap()
        .media_slot("cam", &ChannelKey::instance())
        .is_some());
}

#[tokio::test]
async fn test_close_producer_requires_ownership() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    let producer_id = alice.send_track(send, "cam", "instance", None).await;

    let response = bob
        .request("CloseProducer", json!({ "producerId": producer_id }))
        .await;
    assert_eq!(response.error.unwrap().code, 4);
    assert!(test.session.media().producer(producer_id).await.is_some());

    let data = alice
        .request_ok("CloseProducer", json!({ "producerId": producer_id }))
        .await;
    assert_eq!(data["closed"], true);
    assert!(test.session.media().producer(producer_id).await.is_none());
}

#[tokio::test]
async fn test_close_consumer_does_not_notify_owner() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    alice.send_track(send, "cam", "instance", None).await;
    let consumer = bob.receive_track(alice.peer_id, "cam", "instance", None).await;

    bob.request_ok("CloseConsumer", json!({ "consumerId": consumer.id }))
        .await;

    assert!(!test.engine.has_consumer(consumer.id).await);
    assert!(!bob
        .pushes()
        .await
        .iter()
        .any(|p| matches!(p, ServerPush::ConsumerClosed(_))));
}

// ============================================================================
// Pause / resume
// ============================================================================

#[tokio::test]
async fn test_global_mute_is_broadcast_and_recorded_on_slot() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    let producer_id = alice.send_track(send, "mic", "instance", None).await;

    alice.pause_producer(producer_id, true).await;

    let paused = bob
        .wait_for_push(|p| matches!(p, ServerPush::ProducerPaused(p) if p.producer_id == producer_id))
        .await;
    let ServerPush::ProducerPaused(paused) = paused else {
        unreachable!()
    };
    assert!(paused.global_mute);
    // The owner is told as well
    alice
        .wait_for_push(|p| matches!(p, ServerPush::ProducerPaused(_)))
        .await;

    let slot = alice
        .snapshot()
        .await
        .unwrap()
        .media_slot("mic", &ChannelKey::instance())
        .cloned()
        .unwrap();
    assert!(slot.paused);
    assert!(slot.global_mute);

    alice
        .request_ok("ResumeProducer", json!({ "producerId": producer_id }))
        .await;
    bob.wait_for_push(|p| matches!(p, ServerPush::ProducerResumed(r) if r.producer_id == producer_id))
        .await;

    let slot = alice
        .snapshot()
        .await
        .unwrap()
        .media_slot("mic", &ChannelKey::instance())
        .cloned()
        .unwrap();
    assert!(!slot.paused);
    assert!(!slot.global_mute);
    assert_eq!(test.engine.producer_paused(producer_id).await, Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_rapid_pause_resume_applies_in_arrival_order() {
    let test = TestSession::start().await;
    let (alice, _bob, send) = publisher_and_subscriber(&test).await;
    let producer_id = alice.send_track(send, "cam", "instance", None).await;

    // Pauses are slow, resumes are instant: without ordering the last
    // pause would land after the last resume.
    test.engine
        .set_latency(EngineOp::PauseProducer, Duration::from_millis(50))
        .await;

    let mut ids = Vec::new();
    for request_type in ["PauseProducer", "ResumeProducer", "PauseProducer", "ResumeProducer"] {
        ids.push(
            alice
                .send(request_type, json!({ "producerId": producer_id }))
                .await,
        );
    }
    for id in &ids {
        assert!(alice.response(id).await.error.is_none());
    }

    let target = producer_id.to_string();
    let applied: Vec<EngineOp> = test
        .engine
        .applied_ops()
        .await
        .into_iter()
        .filter(|op| op.target == target)
        .map(|op| op.op)
        .collect();
    assert_eq!(
        applied,
        vec![
            EngineOp::PauseProducer,
            EngineOp::ResumeProducer,
            EngineOp::PauseProducer,
            EngineOp::ResumeProducer,
        ]
    );
    assert_eq!(test.engine.producer_paused(producer_id).await, Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_consumer_pause_resume_applies_in_arrival_order() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    alice.send_track(send, "cam", "instance", None).await;
    let consumer = bob.receive_track(alice.peer_id, "cam", "instance", None).await;

    test.engine
        .set_latency(EngineOp::ResumeConsumer, Duration::from_millis(40))
        .await;

    let resume = bob
        .send("ResumeConsumer", json!({ "consumerId": consumer.id }))
        .await;
    let pause = bob
        .send("PauseConsumer", json!({ "consumerId": consumer.id }))
        .await;
    assert!(bob.response(&resume).await.error.is_none());
    assert!(bob.response(&pause).await.error.is_none());

    assert_eq!(test.engine.consumer_paused(consumer.id).await, Some(true));
    assert!(test.session.consumer_state(consumer.id).await.unwrap().paused);
}

#[tokio::test]
async fn test_pause_unknown_producer_is_rejected() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;

    let response = alice.pause_producer(ProducerId::new(), false).await;

    assert_eq!(response.error.unwrap().code, 4);
}

// ============================================================================
// Layers and re-announcement
// ============================================================================

#[tokio::test]
async fn test_consumer_layers_track_client_and_engine() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    alice.send_track(send, "cam", "instance", None).await;
    let consumer = bob.receive_track(alice.peer_id, "cam", "instance", None).await;

    let data = bob
        .request_ok(
            "ConsumerSetLayers",
            json!({ "consumerId": consumer.id, "spatialLayer": 1 }),
        )
        .await;
    assert_eq!(data["layersSet"], true);
    assert_eq!(test.engine.consumer_preferred_layer(consumer.id).await, Some(1));

    test.session.record_layers_change(consumer.id, Some(2)).await;

    let state = test.session.consumer_state(consumer.id).await.unwrap();
    assert_eq!(state.layers.client_selected_layer, Some(1));
    assert_eq!(state.layers.current_layer, Some(2));
}

#[tokio::test]
async fn test_request_current_producers_reannounces_unpaused_media() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    let cam = alice.send_track(send, "cam", "instance", None).await;
    let mic = alice.send_track(send, "mic", "instance", None).await;
    alice.pause_producer(mic, false).await;
    bob.take_pushes().await;

    let data = bob
        .request_ok("RequestCurrentProducers", json!({ "channelType": "instance" }))
        .await;
    assert_eq!(data["requested"], true);

    let announced: Vec<ProducerId> = bob
        .pushes()
        .await
        .into_iter()
        .filter_map(|p| match p {
            ServerPush::ProducerAvailable(a) => Some(a.producer_id),
            _ => None,
        })
        .collect();
    assert_eq!(announced, vec![cam]);
}

#[tokio::test]
async fn test_request_current_producers_filters_by_user() {
    let test = TestSession::start().await;
    let (alice, bob, send) = publisher_and_subscriber(&test).await;
    let carol = test.connect("carol").await;
    let carol_send = carol.create_transport("send", "instance", None).await;
    alice.send_track(send, "cam", "instance", None).await;
    let carol_cam = carol.send_track(carol_send, "cam", "instance", None).await;
    bob.take_pushes().await;

    bob.request_ok(
        "RequestCurrentProducers",
        json!({ "channelType": "instance", "userIds": ["carol"] }),
    )
    .await;

    let announced: Vec<ProducerId> = bob
        .pushes()
        .await
        .into_iter()
        .filter_map(|p| match p {
            ServerPush::ProducerAvailable(a) => Some(a.producer_id),
            _ => None,
        })
        .collect();
    assert_eq!(announced, vec![carol_cam]);
}
