//! Signaling wire messages.
//!
//! JSON text frames, camelCase fields:
//!
//! ```text
//! client -> server   {"id": "17", "type": "TransportConnect", "data": {...}}
//! server -> client   {"id": "17", "type": "TransportConnect", "data": {...}}
//!                    {"id": "17", "type": "TransportConnect", "error": {"code": 4, "message": "..."}}
//! server push        {"type": "WebRTCCreateProducer", "data": {...}}
//! ```

use crate::engine::{
    DtlsParameters, RtpCapabilities, RtpParameters, SctpCapabilities, SctpStreamParameters,
};
use crate::errors::SfuError;
use crate::types::{
    ConsumerId, DataConsumerId, DataProducerId, Direction, MediaKind, PeerId, ProducerId,
    TransportId, UserId,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default data channel protocol.
pub const DEFAULT_DATA_PROTOCOL: &str = "raw";

fn default_protocol() -> String {
    DEFAULT_DATA_PROTOCOL.to_string()
}

// ============================================================================
// Requests
// ============================================================================

/// Client request, tagged by `type` with its payload under `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientRequest {
    JoinWorld(JoinWorldRequest),
    LeaveWorld,
    Heartbeat,
    TransportCreate(TransportCreateRequest),
    TransportConnect(TransportConnectRequest),
    TransportClose(TransportCloseRequest),
    SendTrack(SendTrackRequest),
    ReceiveTrack(ReceiveTrackRequest),
    ProduceData(ProduceDataRequest),
    CloseDataProducer(DataProducerRequest),
    PauseConsumer(ConsumerRequest),
    ResumeConsumer(ConsumerRequest),
    CloseConsumer(ConsumerRequest),
    PauseProducer(ProducerMuteRequest),
    ResumeProducer(ProducerMuteRequest),
    CloseProducer(ProducerRequest),
    ConsumerSetLayers(ConsumerSetLayersRequest),
    RequestCurrentProducers(RequestCurrentProducersRequest),
    InitializeRouter(InitializeRouterRequest),
}

impl ClientRequest {
    /// Request type name as it appears on the wire (bounded metrics label).
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientRequest::JoinWorld(_) => "JoinWorld",
            ClientRequest::LeaveWorld => "LeaveWorld",
            ClientRequest::Heartbeat => "Heartbeat",
            ClientRequest::TransportCreate(_) => "TransportCreate",
            ClientRequest::TransportConnect(_) => "TransportConnect",
            ClientRequest::TransportClose(_) => "TransportClose",
            ClientRequest::SendTrack(_) => "SendTrack",
            ClientRequest::ReceiveTrack(_) => "ReceiveTrack",
            ClientRequest::ProduceData(_) => "ProduceData",
            ClientRequest::CloseDataProducer(_) => "CloseDataProducer",
            ClientRequest::PauseConsumer(_) => "PauseConsumer",
            ClientRequest::ResumeConsumer(_) => "ResumeConsumer",
            ClientRequest::CloseConsumer(_) => "CloseConsumer",
            ClientRequest::PauseProducer(_) => "PauseProducer",
            ClientRequest::ResumeProducer(_) => "ResumeProducer",
            ClientRequest::CloseProducer(_) => "CloseProducer",
            ClientRequest::ConsumerSetLayers(_) => "ConsumerSetLayers",
            ClientRequest::RequestCurrentProducers(_) => "RequestCurrentProducers",
            ClientRequest::InitializeRouter(_) => "InitializeRouter",
        }
    }

    /// Pause/resume requests must reach the operation queue in arrival order.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            ClientRequest::PauseConsumer(_)
                | ClientRequest::ResumeConsumer(_)
                | ClientRequest::PauseProducer(_)
                | ClientRequest::ResumeProducer(_)
        )
    }
}

/// A frame that could not be decoded into a request.
///
/// Carries whatever routing information could be recovered, so the error
/// can be returned as a response rather than a bare push.
#[derive(Debug)]
pub struct RejectedFrame {
    pub id: Option<String>,
    pub request_type: Option<String>,
    pub error: SfuError,
}

/// Decode a request frame into its correlation id and request.
pub fn decode_request(text: &str) -> Result<(String, ClientRequest), RejectedFrame> {
    let mut value: Value = serde_json::from_str(text).map_err(|e| RejectedFrame {
        id: None,
        request_type: None,
        error: SfuError::InvalidRequest(format!("malformed frame: {e}")),
    })?;
    let request_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);
    let id = value
        .as_object_mut()
        .and_then(|frame| frame.remove("id"))
        .and_then(|id| match id {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
    let Some(id) = id else {
        return Err(RejectedFrame {
            id: None,
            request_type,
            error: SfuError::InvalidRequest("missing request id".to_string()),
        });
    };
    match serde_json::from_value(value) {
        Ok(request) => Ok((id, request)),
        Err(e) => Err(RejectedFrame {
            id: Some(id),
            request_type,
            error: SfuError::InvalidRequest(format!("invalid request: {e}")),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinWorldRequest {
    pub invite_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreateRequest {
    pub direction: Direction,
    pub channel_type: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub sctp_capabilities: Option<SctpCapabilities>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCloseRequest {
    pub transport_id: TransportId,
}

/// Media slot a track is produced into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAppData {
    pub media_tag: String,
    pub channel_type: String,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTrackRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub paused: bool,
    pub app_data: MediaAppData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveTrackRequest {
    pub media_peer_id: PeerId,
    pub media_tag: String,
    pub rtp_capabilities: RtpCapabilities,
    pub channel_type: String,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceDataRequest {
    pub transport_id: TransportId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProducerRequest {
    pub data_producer_id: DataProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRequest {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerMuteRequest {
    pub producer_id: ProducerId,
    #[serde(default)]
    pub global_mute: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRequest {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSetLayersRequest {
    pub consumer_id: ConsumerId,
    pub spatial_layer: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCurrentProducersRequest {
    #[serde(default)]
    pub user_ids: Option<Vec<UserId>>,
    pub channel_type: String,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRouterRequest {
    pub channel_type: String,
    #[serde(default)]
    pub channel_id: Option<String>,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinWorldResponse {
    pub peer_index: u64,
    pub peer_id: PeerId,
    pub router_rtp_capabilities: RtpCapabilities,
    /// Server clock origin, epoch milliseconds with sub-millisecond precision.
    pub high_res_time_origin: f64,
    /// Logical session start, epoch milliseconds.
    pub world_start_time: i64,
    pub cached_actions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeftResponse {
    pub left: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedResponse {
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedResponse {
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedResponse {
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumedResponse {
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayersSetResponse {
    pub layers_set: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedResponse {
    pub requested: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializedResponse {
    pub initialized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

impl From<&SfuError> for ErrorBody {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.error_code(),
            message: err.client_message(),
        }
    }
}

/// Reply to one request, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn ok(id: String, request_type: &str, data: Value) -> Self {
        Self {
            id,
            request_type: request_type.to_string(),
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn err(id: String, request_type: &str, err: &SfuError) -> Self {
        Self {
            id,
            request_type: request_type.to_string(),
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }
}

// ============================================================================
// Server pushes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAvailable {
    pub peer_id: PeerId,
    pub media_tag: String,
    pub producer_id: ProducerId,
    pub channel_type: String,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub media_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerPaused {
    pub producer_id: ProducerId,
    pub global_mute: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConsumerAvailable {
    pub id: DataConsumerId,
    pub data_producer_id: DataProducerId,
    pub label: String,
    pub protocol: String,
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub user_index: u64,
    pub peer_index: u64,
}

/// Full membership snapshot. Revisions increase with every broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListUpdate {
    pub revision: u64,
    pub peers: Vec<PeerSummary>,
}

/// Server-initiated message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerPush {
    #[serde(rename = "WebRTCCreateProducer")]
    ProducerAvailable(ProducerAvailable),
    #[serde(rename = "WebRTCCloseProducer")]
    ProducerClosed(ProducerClosed),
    #[serde(rename = "WebRTCCloseConsumer")]
    ConsumerClosed(ConsumerRef),
    #[serde(rename = "WebRTCPauseProducer")]
    ProducerPaused(ProducerPaused),
    #[serde(rename = "WebRTCResumeProducer")]
    ProducerResumed(ProducerRef),
    #[serde(rename = "WebRTCPauseConsumer")]
    ConsumerPaused(ConsumerRef),
    #[serde(rename = "WebRTCResumeConsumer")]
    ConsumerResumed(ConsumerRef),
    #[serde(rename = "WebRTCConsumeData")]
    ConsumeData(DataConsumerAvailable),
    PeerList(PeerListUpdate),
    Error(ErrorBody),
}

/// Anything the server writes to a peer's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(ResponseEnvelope),
    Push(ServerPush),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_transport_create() {
        let frame = json!({
            "id": "7",
            "type": "TransportCreate",
            "data": {
                "direction": "send",
                "channelType": "instance",
                "sctpCapabilities": { "numStreams": { "OS": 16, "MIS": 32 } }
            }
        })
        .to_string();

        let (id, request) = decode_request(&frame).unwrap();
        assert_eq!(id, "7");
        match request {
            ClientRequest::TransportCreate(req) => {
                assert_eq!(req.direction, Direction::Send);
                assert_eq!(req.channel_type, "instance");
                assert_eq!(req.channel_id, None);
                let caps = req.sctp_capabilities.unwrap();
                assert_eq!(caps.num_streams.os, 16);
                assert_eq!(caps.num_streams.mis, 32);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unit_request_without_data() {
        let (id, request) = decode_request(r#"{"id": 3, "type": "LeaveWorld"}"#).unwrap();
        assert_eq!(id, "3");
        assert_eq!(request, ClientRequest::LeaveWorld);
    }

    #[test]
    fn test_decode_defaults() {
        let frame = json!({
            "id": "1",
            "type": "PauseProducer",
            "data": { "producerId": ProducerId::new() }
        })
        .to_string();
        let (_, request) = decode_request(&frame).unwrap();
        match request {
            ClientRequest::PauseProducer(req) => assert!(!req.global_mute),
            other => panic!("unexpected request: {other:?}"),
        }

        let frame = json!({
            "id": "2",
            "type": "ProduceData",
            "data": { "transportId": TransportId::new(), "label": "actions" }
        })
        .to_string();
        let (_, request) = decode_request(&frame).unwrap();
        match request {
            ClientRequest::ProduceData(req) => assert_eq!(req.protocol, "raw"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_decode_errors_keep_correlation_id() {
        let rejected = decode_request(r#"{"id": "9", "type": "NoSuchThing"}"#).unwrap_err();
        assert_eq!(rejected.id.as_deref(), Some("9"));
        assert_eq!(rejected.request_type.as_deref(), Some("NoSuchThing"));
        assert_eq!(rejected.error.error_code(), 1);

        let rejected = decode_request("not json").unwrap_err();
        assert!(rejected.id.is_none());

        let rejected = decode_request(r#"{"type": "LeaveWorld"}"#).unwrap_err();
        assert!(rejected.id.is_none());
        assert_eq!(rejected.request_type.as_deref(), Some("LeaveWorld"));
    }

    #[test]
    fn test_push_wire_names() {
        let push = ServerPush::ProducerPaused(ProducerPaused {
            producer_id: ProducerId::new(),
            global_mute: true,
        });
        let value = serde_json::to_value(ServerMessage::Push(push.clone())).unwrap();
        assert_eq!(value["type"], "WebRTCPauseProducer");
        assert_eq!(value["data"]["globalMute"], true);

        let back: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, ServerMessage::Push(push));
    }

    #[test]
    fn test_error_response_shape() {
        let err = SfuError::InvalidTransport("t".to_string());
        let response = ResponseEnvelope::err("5".to_string(), "TransportConnect", &err);
        let value = serde_json::to_value(ServerMessage::Response(response)).unwrap();

        assert_eq!(value["id"], "5");
        assert_eq!(value["type"], "TransportConnect");
        assert_eq!(value["error"]["code"], 4);
        assert_eq!(value["error"]["message"], "Invalid transport");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_ordered_requests() {
        let pause = ClientRequest::PauseConsumer(ConsumerRequest {
            consumer_id: ConsumerId::new(),
        });
        assert!(pause.is_ordered());
        assert!(!ClientRequest::Heartbeat.is_ordered());
    }
}
