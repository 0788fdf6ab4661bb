//! Frame handling at the signaling boundary.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use sfu_orchestrator::signaling::messages::ServerPush;
use sfu_test_utils::TestSession;

#[tokio::test]
async fn test_malformed_frame_is_reported_as_error_push() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;

    alice.send_frame("{not json").await;

    let push = alice
        .wait_for_push(|p| matches!(p, ServerPush::Error(_)))
        .await;
    let ServerPush::Error(error) = push else {
        unreachable!()
    };
    assert_eq!(error.code, 1);
}

#[tokio::test]
async fn test_frame_without_id_is_reported_as_error_push() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;

    alice
        .send_frame(&json!({ "type": "LeaveWorld" }).to_string())
        .await;

    alice
        .wait_for_push(|p| matches!(p, ServerPush::Error(e) if e.code == 1))
        .await;
    // The request was not executed
    assert!(alice.snapshot().await.is_some());
}

#[tokio::test]
async fn test_unknown_request_type_is_answered_with_error() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;

    let response = alice.request("Teleport", json!({})).await;

    assert_eq!(response.request_type, "Teleport");
    assert_eq!(response.error.unwrap().code, 1);
    assert!(response.data.is_none());
}

#[tokio::test]
async fn test_invalid_payload_is_answered_with_error() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;

    let response = alice
        .request("TransportCreate", json!({ "direction": "sideways" }))
        .await;

    assert_eq!(response.request_type, "TransportCreate");
    assert_eq!(response.error.unwrap().code, 1);
    assert!(test.session.transports().is_empty().await);
}

#[tokio::test]
async fn test_numeric_ids_are_echoed_as_strings() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;

    alice
        .send_frame(&json!({ "id": 42, "type": "JoinWorld", "data": {} }).to_string())
        .await;

    let response = alice.response("42").await;
    assert_eq!(response.request_type, "JoinWorld");
    assert!(response.error.is_none());
}

#[tokio::test]
async fn test_heartbeat_is_not_answered() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;

    alice.send("Heartbeat", json!(null)).await;
    // A later request's response is the only one that arrives
    let data = alice.request_ok("InitializeRouter", json!({ "channelType": "instance" })).await;

    assert_eq!(data["initialized"], true);
    assert!(alice.snapshot().await.is_some());
}

#[tokio::test]
async fn test_error_messages_do_not_leak_internal_ids() {
    let test = TestSession::start().await;
    let alice = test.connect("alice").await;
    let bogus = sfu_orchestrator::types::TransportId::new();

    let response = alice
        .request(
            "TransportConnect",
            json!({
                "transportId": bogus,
                "dtlsParameters": sfu_test_utils::dtls_parameters(),
            }),
        )
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, 4);
    assert!(!error.message.contains(&bogus.to_string()));
}
