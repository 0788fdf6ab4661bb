//! Canned payloads for SFU tests.
//!
//! The in-memory engine never inspects negotiation payloads, so these only
//! need the right shape.

use serde_json::{json, Value};
use sfu_orchestrator::types::UserId;
use sfu_orchestrator::world::{AvatarDetail, UserProfile};
use uuid::Uuid;

/// Profile for a test user. The user id is the given name.
#[must_use]
pub fn profile(user: &str) -> UserProfile {
    UserProfile {
        user_id: UserId::from(user),
        name: user.to_string(),
        avatar: Some(AvatarDetail {
            avatar_url: format!("https://assets.test/{user}.glb"),
            thumbnail_url: format!("https://assets.test/{user}.png"),
        }),
    }
}

/// User name that does not collide with any other test's.
#[must_use]
pub fn random_user() -> String {
    format!("user-{}", Uuid::new_v4())
}

#[must_use]
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF" }]
    })
}

#[must_use]
pub fn sctp_capabilities() -> Value {
    json!({ "numStreams": { "OS": 1024, "MIS": 1024 } })
}

/// Simulcast video RTP parameters with three encodings.
#[must_use]
pub fn video_rtp_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }],
        "encodings": [
            { "rid": "r0", "maxBitrate": 100_000 },
            { "rid": "r1", "maxBitrate": 300_000 },
            { "rid": "r2", "maxBitrate": 900_000 }
        ]
    })
}

#[must_use]
pub fn audio_rtp_parameters() -> Value {
    json!({
        "mid": "1",
        "codecs": [{ "mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000, "channels": 2 }],
        "encodings": [{ "ssrc": 1111 }]
    })
}

#[must_use]
pub fn rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "mimeType": "audio/opus", "kind": "audio", "clockRate": 48000, "channels": 2 },
            { "mimeType": "video/VP8", "kind": "video", "clockRate": 90000 }
        ]
    })
}

#[must_use]
pub fn sctp_stream_parameters() -> Value {
    json!({ "streamId": 0, "ordered": false, "maxRetransmits": 0 })
}
