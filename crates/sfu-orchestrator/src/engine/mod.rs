//! Media engine seam.
//!
//! The orchestrator never touches RTP, ICE or DTLS. Every media primitive
//! (workers, routers, transports, producers, consumers, data channels) is
//! requested from a [`MediaEngine`] implementation and referenced afterwards
//! by its engine-assigned id.
//!
//! Negotiation payloads (RTP parameters and capabilities, ICE/DTLS/SCTP
//! parameters) are opaque JSON passed through untouched between the client
//! and the engine.
//!
//! # Events
//!
//! Engine-originated state changes (worker death, a transport's DTLS state
//! reaching `closed`, a consumer's active layers changing) are published on a
//! broadcast channel obtained from [`MediaEngine::subscribe`].

pub mod memory;

pub use memory::{EngineOp, InMemoryEngine};

use crate::types::{
    ConsumerId, DataConsumerId, DataProducerId, MediaKind, ProducerId, RouterId, TransportId,
    WorkerId,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Error returned by media engine calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The referenced engine object does not exist (or was closed).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The operation was rejected or failed inside the engine.
    #[error("operation failed: {0}")]
    Failed(String),

    /// The worker hosting the object is gone.
    #[error("worker closed: {0}")]
    WorkerClosed(String),
}

macro_rules! opaque_payload {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Value);
    };
}

opaque_payload!(
    /// Producer/consumer RTP parameters.
    RtpParameters
);
opaque_payload!(
    /// Router or client RTP capabilities.
    RtpCapabilities
);
opaque_payload!(
    /// DTLS fingerprints and role.
    DtlsParameters
);
opaque_payload!(
    /// ICE username fragment and password.
    IceParameters
);
opaque_payload!(
    /// ICE candidates list.
    IceCandidates
);
opaque_payload!(
    /// SCTP association parameters of a transport.
    SctpParameters
);
opaque_payload!(
    /// SCTP stream parameters of a data producer or consumer.
    SctpStreamParameters
);

/// SCTP stream counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumSctpStreams {
    #[serde(rename = "OS")]
    pub os: u16,
    #[serde(rename = "MIS")]
    pub mis: u16,
}

impl Default for NumSctpStreams {
    fn default() -> Self {
        Self {
            os: 1024,
            mis: 1024,
        }
    }
}

/// SCTP capabilities advertised by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpCapabilities {
    pub num_streams: NumSctpStreams,
}

/// A router created on a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterInfo {
    pub id: RouterId,
    pub worker_id: WorkerId,
    pub rtp_capabilities: RtpCapabilities,
}

/// Options for a client-facing WebRTC transport.
#[derive(Debug, Clone, PartialEq)]
pub struct WebRtcTransportOptions {
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_incoming_bitrate: Option<u32>,
    pub initial_available_outgoing_bitrate: u32,
}

/// Connection parameters returned to the client for a new transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<SctpParameters>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProduceOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

/// A created consumer, as reported back to the consuming client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    /// `simple`, `simulcast` or `svc`.
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataProduceOptions {
    pub label: String,
    pub protocol: String,
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
}

/// A data consumer on a client-facing transport.
#[derive(Debug, Clone, PartialEq)]
pub struct DataConsumerInfo {
    pub id: DataConsumerId,
    pub data_producer_id: DataProducerId,
    pub label: String,
    pub protocol: String,
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
}

/// A data consumer on a direct (server-side) transport. Messages produced by
/// the consumed data producer arrive on `messages`.
#[derive(Debug)]
pub struct DirectDataConsumer {
    pub id: DataConsumerId,
    pub messages: mpsc::Receiver<Bytes>,
}

/// Engine-originated state change.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    WorkerDied {
        worker_id: WorkerId,
        reason: String,
    },
    TransportClosed {
        transport_id: TransportId,
    },
    ConsumerLayersChanged {
        consumer_id: ConsumerId,
        spatial_layer: Option<u8>,
    },
}

/// Media engine primitives.
///
/// Closing calls are idempotent from the caller's point of view: closing an
/// object that is already gone returns `NotFound`, which cascade code logs
/// and ignores.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Subscribe to engine-originated events.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    async fn create_worker(&self) -> Result<WorkerId, EngineError>;

    async fn create_router(&self, worker_id: WorkerId) -> Result<RouterInfo, EngineError>;

    /// Number of live transports on the router (taken from a router dump).
    async fn router_load(&self, router_id: RouterId) -> Result<usize, EngineError>;

    /// Whether the worker process is still running.
    async fn worker_alive(&self, worker_id: WorkerId) -> Result<bool, EngineError>;

    /// Whether the engine still holds the transport.
    async fn transport_alive(&self, transport_id: TransportId) -> Result<bool, EngineError>;

    /// Whether a consumer with `rtp_capabilities` can consume the producer on this router.
    async fn can_consume(
        &self,
        router_id: RouterId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    async fn create_webrtc_transport(
        &self,
        router_id: RouterId,
        options: WebRtcTransportOptions,
    ) -> Result<TransportParameters, EngineError>;

    /// Server-side transport used for internal data producers and consumers.
    async fn create_direct_transport(&self, router_id: RouterId)
        -> Result<TransportId, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn close_transport(&self, transport_id: TransportId) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: TransportId,
        options: ProduceOptions,
    ) -> Result<ProducerId, EngineError>;

    /// Replicate a producer onto another router. The replica keeps the producer id.
    async fn pipe_producer(
        &self,
        producer_id: ProducerId,
        target: RouterId,
    ) -> Result<(), EngineError>;

    async fn pause_producer(&self, producer_id: ProducerId) -> Result<(), EngineError>;

    async fn resume_producer(&self, producer_id: ProducerId) -> Result<(), EngineError>;

    /// Close the producer's presence on one router (origin or replica).
    async fn close_producer(
        &self,
        producer_id: ProducerId,
        router_id: RouterId,
    ) -> Result<(), EngineError>;

    async fn consume(
        &self,
        transport_id: TransportId,
        options: ConsumeOptions,
    ) -> Result<ConsumerInfo, EngineError>;

    async fn pause_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError>;

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError>;

    async fn set_preferred_layers(
        &self,
        consumer_id: ConsumerId,
        spatial_layer: u8,
    ) -> Result<(), EngineError>;

    async fn produce_data(
        &self,
        transport_id: TransportId,
        options: DataProduceOptions,
    ) -> Result<DataProducerId, EngineError>;

    /// Replicate a data producer onto another router. The replica keeps the id.
    async fn pipe_data_producer(
        &self,
        data_producer_id: DataProducerId,
        target: RouterId,
    ) -> Result<(), EngineError>;

    /// Close the data producer's presence on one router (origin or replica).
    async fn close_data_producer(
        &self,
        data_producer_id: DataProducerId,
        router_id: RouterId,
    ) -> Result<(), EngineError>;

    /// Consume a data producer on a client-facing transport.
    async fn consume_data(
        &self,
        transport_id: TransportId,
        data_producer_id: DataProducerId,
    ) -> Result<DataConsumerInfo, EngineError>;

    /// Consume a data producer on a direct transport.
    async fn consume_data_direct(
        &self,
        transport_id: TransportId,
        data_producer_id: DataProducerId,
    ) -> Result<DirectDataConsumer, EngineError>;

    /// Send a message through a data producer created on a direct transport.
    async fn send_data(
        &self,
        data_producer_id: DataProducerId,
        payload: Bytes,
    ) -> Result<(), EngineError>;

    async fn close_data_consumer(&self, data_consumer_id: DataConsumerId)
        -> Result<(), EngineError>;
}
