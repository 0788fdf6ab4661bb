//! In-process media engine.
//!
//! Keeps the object graph a real engine would keep (workers, routers,
//! transports, producers and their piped replicas, consumers, data channels)
//! and enforces the same placement rules: a consumer can only be created on a
//! router the producer is present on. No packets are forwarded.
//!
//! The development binary runs on this engine, and tests drive it through the
//! behavior knobs: per-operation latency, injected failures, capability
//! rejection, call counters and a log of applied pause/resume calls.

use super::{
    ConsumeOptions, ConsumerInfo, DataConsumerInfo, DataProduceOptions, DirectDataConsumer,
    DtlsParameters, EngineError, EngineEvent, IceCandidates, IceParameters, MediaEngine,
    ProduceOptions, RouterInfo, RtpCapabilities, RtpParameters, SctpParameters,
    SctpStreamParameters, TransportParameters, WebRtcTransportOptions,
};
use crate::types::{
    ConsumerId, DataConsumerId, DataProducerId, MediaKind, ProducerId, RouterId, TransportId,
    WorkerId,
};

use bytes::Bytes;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

/// Capacity of the engine event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Buffer of each direct data consumer's message channel.
const DIRECT_CONSUMER_BUFFER: usize = 256;

/// Engine operations, used to address latency, failure injection and call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateWorker,
    CreateRouter,
    RouterLoad,
    WorkerAlive,
    TransportAlive,
    CanConsume,
    CreateTransport,
    ConnectTransport,
    CloseTransport,
    Produce,
    PipeProducer,
    PauseProducer,
    ResumeProducer,
    CloseProducer,
    Consume,
    PauseConsumer,
    ResumeConsumer,
    CloseConsumer,
    SetPreferredLayers,
    ProduceData,
    PipeDataProducer,
    CloseDataProducer,
    ConsumeData,
    SendData,
    CloseDataConsumer,
}

/// A pause or resume call as applied by the engine, in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOp {
    pub op: EngineOp,
    pub target: String,
}

/// Live object counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub data_producers: usize,
    pub data_consumers: usize,
}

#[derive(Default)]
struct Behavior {
    latency: HashMap<EngineOp, Duration>,
    failing: HashSet<EngineOp>,
    reject_consume: bool,
    calls: HashMap<EngineOp, usize>,
}

struct RouterEntry {
    worker_id: WorkerId,
}

struct TransportEntry {
    router_id: RouterId,
    direct: bool,
    connected: bool,
}

struct ProducerEntry {
    transport_id: TransportId,
    origin: RouterId,
    routers: HashSet<RouterId>,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: bool,
}

struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
    preferred_layer: Option<u8>,
}

struct DataProducerEntry {
    transport_id: TransportId,
    origin: RouterId,
    routers: HashSet<RouterId>,
    label: String,
    protocol: String,
}

struct DataConsumerEntry {
    transport_id: TransportId,
    data_producer_id: DataProducerId,
    sink: Option<mpsc::Sender<Bytes>>,
}

#[derive(Default)]
struct EngineState {
    workers: HashMap<WorkerId, bool>,
    routers: HashMap<RouterId, RouterEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    data_producers: HashMap<DataProducerId, DataProducerEntry>,
    data_consumers: HashMap<DataConsumerId, DataConsumerEntry>,
    next_stream_id: u16,
    applied: Vec<AppliedOp>,
    sent: Vec<(DataProducerId, Bytes)>,
}

impl EngineState {
    fn router_of(&self, transport_id: TransportId) -> Result<RouterId, EngineError> {
        self.transports
            .get(&transport_id)
            .map(|t| t.router_id)
            .ok_or_else(|| not_found("transport", transport_id))
    }

    fn remove_consumers_where(&mut self, predicate: impl Fn(&ConsumerEntry) -> bool) {
        self.consumers.retain(|_, c| !predicate(c));
    }

    fn remove_data_consumers_where(&mut self, predicate: impl Fn(&DataConsumerEntry) -> bool) {
        self.data_consumers.retain(|_, c| !predicate(c));
    }

    fn transports_on(&self, router_id: RouterId) -> HashSet<TransportId> {
        self.transports
            .iter()
            .filter(|(_, t)| t.router_id == router_id)
            .map(|(id, _)| *id)
            .collect()
    }
}

fn not_found(kind: &'static str, id: impl ToString) -> EngineError {
    EngineError::NotFound {
        kind,
        id: id.to_string(),
    }
}

/// In-process engine. See the module docs.
pub struct InMemoryEngine {
    state: Mutex<EngineState>,
    behavior: Mutex<Behavior>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(EngineState::default()),
            behavior: Mutex::new(Behavior::default()),
            events,
        }
    }

    /// Count the call, apply configured latency, then fail if injected.
    async fn enter(&self, op: EngineOp) -> Result<(), EngineError> {
        let (delay, fail) = {
            let mut behavior = self.behavior.lock().await;
            *behavior.calls.entry(op).or_insert(0) += 1;
            (
                behavior.latency.get(&op).copied(),
                behavior.failing.contains(&op),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(EngineError::Failed(format!("{op:?} failed")));
        }
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; the event is simply dropped.
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // Behavior knobs
    // ------------------------------------------------------------------

    /// Delay every future call of `op` by `latency`.
    pub async fn set_latency(&self, op: EngineOp, latency: Duration) {
        self.behavior.lock().await.latency.insert(op, latency);
    }

    /// Make every future call of `op` fail (or succeed again).
    pub async fn set_failing(&self, op: EngineOp, failing: bool) {
        let mut behavior = self.behavior.lock().await;
        if failing {
            behavior.failing.insert(op);
        } else {
            behavior.failing.remove(&op);
        }
    }

    /// Make `can_consume` report every capability set as incompatible.
    pub async fn set_reject_consume(&self, reject: bool) {
        self.behavior.lock().await.reject_consume = reject;
    }

    pub async fn call_count(&self, op: EngineOp) -> usize {
        self.behavior
            .lock()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Simulated engine-side events
    // ------------------------------------------------------------------

    /// Terminate a worker and announce it.
    pub async fn kill_worker(&self, worker_id: WorkerId, reason: &str) {
        self.state.lock().await.workers.insert(worker_id, false);
        self.emit(EngineEvent::WorkerDied {
            worker_id,
            reason: reason.to_string(),
        });
    }

    /// Drop a transport as if its DTLS state reached `closed`, and announce it.
    pub async fn fail_transport(&self, transport_id: TransportId) {
        self.state.lock().await.transports.remove(&transport_id);
        self.emit(EngineEvent::TransportClosed { transport_id });
    }

    /// Announce a change of a consumer's active spatial layer.
    pub fn report_layers(&self, consumer_id: ConsumerId, spatial_layer: Option<u8>) {
        self.emit(EngineEvent::ConsumerLayersChanged {
            consumer_id,
            spatial_layer,
        });
    }

    /// Deliver a message as if a client sent it on the data producer.
    /// Returns the number of direct consumers reached.
    pub async fn deliver_data(&self, data_producer_id: DataProducerId, payload: Bytes) -> usize {
        let state = self.state.lock().await;
        state
            .data_consumers
            .values()
            .filter(|c| c.data_producer_id == data_producer_id)
            .filter_map(|c| c.sink.as_ref())
            .filter(|sink| sink.try_send(payload.clone()).is_ok())
            .count()
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn applied_ops(&self) -> Vec<AppliedOp> {
        self.state.lock().await.applied.clone()
    }

    pub async fn sent_data(&self) -> Vec<(DataProducerId, Bytes)> {
        self.state.lock().await.sent.clone()
    }

    pub async fn producer_paused(&self, producer_id: ProducerId) -> Option<bool> {
        self.state
            .lock()
            .await
            .producers
            .get(&producer_id)
            .map(|p| p.paused)
    }

    pub async fn consumer_paused(&self, consumer_id: ConsumerId) -> Option<bool> {
        self.state
            .lock()
            .await
            .consumers
            .get(&consumer_id)
            .map(|c| c.paused)
    }

    pub async fn consumer_preferred_layer(&self, consumer_id: ConsumerId) -> Option<u8> {
        self.state
            .lock()
            .await
            .consumers
            .get(&consumer_id)
            .and_then(|c| c.preferred_layer)
    }

    /// Routers the producer is present on (origin and replicas).
    pub async fn producer_routers(&self, producer_id: ProducerId) -> HashSet<RouterId> {
        self.state
            .lock()
            .await
            .producers
            .get(&producer_id)
            .map(|p| p.routers.clone())
            .unwrap_or_default()
    }

    /// Routers the data producer is present on (origin and replicas).
    pub async fn data_producer_routers(&self, data_producer_id: DataProducerId) -> HashSet<RouterId> {
        self.state
            .lock()
            .await
            .data_producers
            .get(&data_producer_id)
            .map(|p| p.routers.clone())
            .unwrap_or_default()
    }

    pub async fn has_transport(&self, transport_id: TransportId) -> bool {
        self.state.lock().await.transports.contains_key(&transport_id)
    }

    pub async fn transport_connected(&self, transport_id: TransportId) -> Option<bool> {
        self.state
            .lock()
            .await
            .transports
            .get(&transport_id)
            .map(|t| t.connected)
    }

    pub async fn has_consumer(&self, consumer_id: ConsumerId) -> bool {
        self.state.lock().await.consumers.contains_key(&consumer_id)
    }

    pub async fn has_data_consumer(&self, data_consumer_id: DataConsumerId) -> bool {
        self.state
            .lock()
            .await
            .data_consumers
            .contains_key(&data_consumer_id)
    }

    pub async fn counts(&self) -> EngineCounts {
        let state = self.state.lock().await;
        EngineCounts {
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
            data_producers: state.data_producers.len(),
            data_consumers: state.data_consumers.len(),
        }
    }

    pub async fn worker_ids(&self) -> Vec<WorkerId> {
        self.state.lock().await.workers.keys().copied().collect()
    }

    /// Worker hosting the router.
    pub async fn router_worker(&self, router_id: RouterId) -> Option<WorkerId> {
        self.state
            .lock()
            .await
            .routers
            .get(&router_id)
            .map(|r| r.worker_id)
    }
}

fn default_router_capabilities() -> RtpCapabilities {
    RtpCapabilities(json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "clockRate": 48000,
                "channels": 2
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "clockRate": 90000
            }
        ],
        "headerExtensions": []
    }))
}

/// A client can consume when it advertises at least one codec.
fn advertises_codecs(rtp_capabilities: &RtpCapabilities) -> bool {
    rtp_capabilities
        .0
        .get("codecs")
        .and_then(|c| c.as_array())
        .is_some_and(|codecs| !codecs.is_empty())
}

fn consumer_type_for(rtp_parameters: &RtpParameters) -> &'static str {
    let encodings = rtp_parameters
        .0
        .get("encodings")
        .and_then(|e| e.as_array())
        .map_or(0, Vec::len);
    if encodings > 1 {
        "simulcast"
    } else {
        "simple"
    }
}

#[async_trait::async_trait]
impl MediaEngine for InMemoryEngine {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn create_worker(&self) -> Result<WorkerId, EngineError> {
        self.enter(EngineOp::CreateWorker).await?;
        let worker_id = WorkerId::new();
        self.state.lock().await.workers.insert(worker_id, true);
        debug!(target: "sfu.engine", worker_id = %worker_id, "Worker created");
        Ok(worker_id)
    }

    async fn create_router(&self, worker_id: WorkerId) -> Result<RouterInfo, EngineError> {
        self.enter(EngineOp::CreateRouter).await?;
        let mut state = self.state.lock().await;
        match state.workers.get(&worker_id) {
            Some(true) => {}
            Some(false) => return Err(EngineError::WorkerClosed(worker_id.to_string())),
            None => return Err(not_found("worker", worker_id)),
        }
        let id = RouterId::new();
        state.routers.insert(id, RouterEntry { worker_id });
        Ok(RouterInfo {
            id,
            worker_id,
            rtp_capabilities: default_router_capabilities(),
        })
    }

    async fn router_load(&self, router_id: RouterId) -> Result<usize, EngineError> {
        self.enter(EngineOp::RouterLoad).await?;
        let state = self.state.lock().await;
        if !state.routers.contains_key(&router_id) {
            return Err(not_found("router", router_id));
        }
        Ok(state
            .transports
            .values()
            .filter(|t| t.router_id == router_id && !t.direct)
            .count())
    }

    async fn worker_alive(&self, worker_id: WorkerId) -> Result<bool, EngineError> {
        self.enter(EngineOp::WorkerAlive).await?;
        Ok(self
            .state
            .lock()
            .await
            .workers
            .get(&worker_id)
            .copied()
            .unwrap_or(false))
    }

    async fn transport_alive(&self, transport_id: TransportId) -> Result<bool, EngineError> {
        self.enter(EngineOp::TransportAlive).await?;
        Ok(self.state.lock().await.transports.contains_key(&transport_id))
    }

    async fn can_consume(
        &self,
        router_id: RouterId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        self.enter(EngineOp::CanConsume).await?;
        if self.behavior.lock().await.reject_consume {
            return Ok(false);
        }
        let state = self.state.lock().await;
        let on_router = state
            .producers
            .get(&producer_id)
            .is_some_and(|p| p.routers.contains(&router_id));
        Ok(on_router && advertises_codecs(rtp_capabilities))
    }

    async fn create_webrtc_transport(
        &self,
        router_id: RouterId,
        options: WebRtcTransportOptions,
    ) -> Result<TransportParameters, EngineError> {
        self.enter(EngineOp::CreateTransport).await?;
        let mut state = self.state.lock().await;
        if !state.routers.contains_key(&router_id) {
            return Err(not_found("router", router_id));
        }
        let id = TransportId::new();
        state.transports.insert(
            id,
            TransportEntry {
                router_id,
                direct: false,
                connected: false,
            },
        );
        let sctp_parameters = options.enable_sctp.then(|| {
            SctpParameters(json!({
                "port": 5000,
                "OS": options.num_sctp_streams.os,
                "MIS": options.num_sctp_streams.mis,
                "maxMessageSize": 262_144
            }))
        });
        Ok(TransportParameters {
            id,
            ice_parameters: IceParameters(json!({
                "usernameFragment": id.to_string(),
                "password": id.to_string(),
                "iceLite": true
            })),
            ice_candidates: IceCandidates(json!([{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079u32,
                "ip": "127.0.0.1",
                "protocol": "udp",
                "port": 40000,
                "type": "host"
            }])),
            dtls_parameters: DtlsParameters(json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": "00:11:22" }]
            })),
            sctp_parameters,
        })
    }

    async fn create_direct_transport(
        &self,
        router_id: RouterId,
    ) -> Result<TransportId, EngineError> {
        self.enter(EngineOp::CreateTransport).await?;
        let mut state = self.state.lock().await;
        if !state.routers.contains_key(&router_id) {
            return Err(not_found("router", router_id));
        }
        let id = TransportId::new();
        state.transports.insert(
            id,
            TransportEntry {
                router_id,
                direct: true,
                connected: true,
            },
        );
        Ok(id)
    }

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        _dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::ConnectTransport).await?;
        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| not_found("transport", transport_id))?;
        if transport.connected {
            return Err(EngineError::Failed(format!(
                "connect() already called on transport {transport_id}"
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: TransportId) -> Result<(), EngineError> {
        self.enter(EngineOp::CloseTransport).await?;
        let mut state = self.state.lock().await;
        if state.transports.remove(&transport_id).is_none() {
            return Err(not_found("transport", transport_id));
        }
        let producers: HashSet<ProducerId> = state
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect();
        state.producers.retain(|id, _| !producers.contains(id));
        state.remove_consumers_where(|c| {
            c.transport_id == transport_id || producers.contains(&c.producer_id)
        });
        let data_producers: HashSet<DataProducerId> = state
            .data_producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect();
        state.data_producers.retain(|id, _| !data_producers.contains(id));
        state.remove_data_consumers_where(|c| {
            c.transport_id == transport_id || data_producers.contains(&c.data_producer_id)
        });
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        options: ProduceOptions,
    ) -> Result<ProducerId, EngineError> {
        self.enter(EngineOp::Produce).await?;
        let mut state = self.state.lock().await;
        let origin = state.router_of(transport_id)?;
        let id = ProducerId::new();
        state.producers.insert(
            id,
            ProducerEntry {
                transport_id,
                origin,
                routers: HashSet::from([origin]),
                kind: options.kind,
                rtp_parameters: options.rtp_parameters,
                paused: options.paused,
            },
        );
        Ok(id)
    }

    async fn pipe_producer(
        &self,
        producer_id: ProducerId,
        target: RouterId,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::PipeProducer).await?;
        let mut state = self.state.lock().await;
        if !state.routers.contains_key(&target) {
            return Err(not_found("router", target));
        }
        let producer = state
            .producers
            .get_mut(&producer_id)
            .ok_or_else(|| not_found("producer", producer_id))?;
        producer.routers.insert(target);
        Ok(())
    }

    async fn pause_producer(&self, producer_id: ProducerId) -> Result<(), EngineError> {
        self.enter(EngineOp::PauseProducer).await?;
        let mut state = self.state.lock().await;
        let producer = state
            .producers
            .get_mut(&producer_id)
            .ok_or_else(|| not_found("producer", producer_id))?;
        producer.paused = true;
        state.applied.push(AppliedOp {
            op: EngineOp::PauseProducer,
            target: producer_id.to_string(),
        });
        Ok(())
    }

    async fn resume_producer(&self, producer_id: ProducerId) -> Result<(), EngineError> {
        self.enter(EngineOp::ResumeProducer).await?;
        let mut state = self.state.lock().await;
        let producer = state
            .producers
            .get_mut(&producer_id)
            .ok_or_else(|| not_found("producer", producer_id))?;
        producer.paused = false;
        state.applied.push(AppliedOp {
            op: EngineOp::ResumeProducer,
            target: producer_id.to_string(),
        });
        Ok(())
    }

    async fn close_producer(
        &self,
        producer_id: ProducerId,
        router_id: RouterId,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::CloseProducer).await?;
        let mut state = self.state.lock().await;
        let producer = state
            .producers
            .get_mut(&producer_id)
            .ok_or_else(|| not_found("producer", producer_id))?;
        if !producer.routers.remove(&router_id) {
            return Err(not_found("producer replica", producer_id));
        }
        let closing_origin = producer.origin == router_id;
        let affected_transports = if closing_origin {
            state.producers.remove(&producer_id);
            None
        } else {
            Some(state.transports_on(router_id))
        };
        state.remove_consumers_where(|c| {
            c.producer_id == producer_id
                && affected_transports
                    .as_ref()
                    .map_or(true, |transports| transports.contains(&c.transport_id))
        });
        Ok(())
    }

    async fn consume(
        &self,
        transport_id: TransportId,
        options: ConsumeOptions,
    ) -> Result<ConsumerInfo, EngineError> {
        self.enter(EngineOp::Consume).await?;
        let mut state = self.state.lock().await;
        let router_id = state.router_of(transport_id)?;
        let producer = state
            .producers
            .get(&options.producer_id)
            .ok_or_else(|| not_found("producer", options.producer_id))?;
        if !producer.routers.contains(&router_id) {
            return Err(EngineError::Failed(format!(
                "producer {} is not available on router {router_id}",
                options.producer_id
            )));
        }
        let info = ConsumerInfo {
            id: ConsumerId::new(),
            producer_id: options.producer_id,
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            consumer_type: consumer_type_for(&producer.rtp_parameters).to_string(),
            producer_paused: producer.paused,
        };
        state.consumers.insert(
            info.id,
            ConsumerEntry {
                transport_id,
                producer_id: options.producer_id,
                paused: options.paused,
                preferred_layer: None,
            },
        );
        Ok(info)
    }

    async fn pause_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        self.enter(EngineOp::PauseConsumer).await?;
        let mut state = self.state.lock().await;
        let consumer = state
            .consumers
            .get_mut(&consumer_id)
            .ok_or_else(|| not_found("consumer", consumer_id))?;
        consumer.paused = true;
        state.applied.push(AppliedOp {
            op: EngineOp::PauseConsumer,
            target: consumer_id.to_string(),
        });
        Ok(())
    }

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        self.enter(EngineOp::ResumeConsumer).await?;
        let mut state = self.state.lock().await;
        let consumer = state
            .consumers
            .get_mut(&consumer_id)
            .ok_or_else(|| not_found("consumer", consumer_id))?;
        consumer.paused = false;
        state.applied.push(AppliedOp {
            op: EngineOp::ResumeConsumer,
            target: consumer_id.to_string(),
        });
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        self.enter(EngineOp::CloseConsumer).await?;
        self.state
            .lock()
            .await
            .consumers
            .remove(&consumer_id)
            .map(|_| ())
            .ok_or_else(|| not_found("consumer", consumer_id))
    }

    async fn set_preferred_layers(
        &self,
        consumer_id: ConsumerId,
        spatial_layer: u8,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::SetPreferredLayers).await?;
        let active = {
            let mut state = self.state.lock().await;
            let consumer = state
                .consumers
                .get_mut(&consumer_id)
                .ok_or_else(|| not_found("consumer", consumer_id))?;
            consumer.preferred_layer = Some(spatial_layer);
            !consumer.paused
        };
        if active {
            self.report_layers(consumer_id, Some(spatial_layer));
        }
        Ok(())
    }

    async fn produce_data(
        &self,
        transport_id: TransportId,
        options: DataProduceOptions,
    ) -> Result<DataProducerId, EngineError> {
        self.enter(EngineOp::ProduceData).await?;
        let mut state = self.state.lock().await;
        let origin = state.router_of(transport_id)?;
        let id = DataProducerId::new();
        state.data_producers.insert(
            id,
            DataProducerEntry {
                transport_id,
                origin,
                routers: HashSet::from([origin]),
                label: options.label,
                protocol: options.protocol,
            },
        );
        Ok(id)
    }

    async fn pipe_data_producer(
        &self,
        data_producer_id: DataProducerId,
        target: RouterId,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::PipeDataProducer).await?;
        let mut state = self.state.lock().await;
        if !state.routers.contains_key(&target) {
            return Err(not_found("router", target));
        }
        let data_producer = state
            .data_producers
            .get_mut(&data_producer_id)
            .ok_or_else(|| not_found("data producer", data_producer_id))?;
        data_producer.routers.insert(target);
        Ok(())
    }

    async fn close_data_producer(
        &self,
        data_producer_id: DataProducerId,
        router_id: RouterId,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::CloseDataProducer).await?;
        let mut state = self.state.lock().await;
        let data_producer = state
            .data_producers
            .get_mut(&data_producer_id)
            .ok_or_else(|| not_found("data producer", data_producer_id))?;
        if !data_producer.routers.remove(&router_id) {
            return Err(not_found("data producer replica", data_producer_id));
        }
        let closing_origin = data_producer.origin == router_id;
        let affected_transports = if closing_origin {
            state.data_producers.remove(&data_producer_id);
            None
        } else {
            Some(state.transports_on(router_id))
        };
        state.remove_data_consumers_where(|c| {
            c.data_producer_id == data_producer_id
                && affected_transports
                    .as_ref()
                    .map_or(true, |transports| transports.contains(&c.transport_id))
        });
        Ok(())
    }

    async fn consume_data(
        &self,
        transport_id: TransportId,
        data_producer_id: DataProducerId,
    ) -> Result<DataConsumerInfo, EngineError> {
        self.enter(EngineOp::ConsumeData).await?;
        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get(&transport_id)
            .ok_or_else(|| not_found("transport", transport_id))?;
        if transport.direct {
            return Err(EngineError::Failed(
                "consume_data requires a WebRTC transport".to_string(),
            ));
        }
        let router_id = transport.router_id;
        let data_producer = state
            .data_producers
            .get(&data_producer_id)
            .ok_or_else(|| not_found("data producer", data_producer_id))?;
        if !data_producer.routers.contains(&router_id) {
            return Err(EngineError::Failed(format!(
                "data producer {data_producer_id} is not available on router {router_id}"
            )));
        }
        let label = data_producer.label.clone();
        let protocol = data_producer.protocol.clone();
        let stream_id = state.next_stream_id;
        state.next_stream_id = state.next_stream_id.wrapping_add(1);
        let id = DataConsumerId::new();
        state.data_consumers.insert(
            id,
            DataConsumerEntry {
                transport_id,
                data_producer_id,
                sink: None,
            },
        );
        Ok(DataConsumerInfo {
            id,
            data_producer_id,
            label,
            protocol,
            sctp_stream_parameters: Some(SctpStreamParameters(json!({
                "streamId": stream_id,
                "ordered": true
            }))),
        })
    }

    async fn consume_data_direct(
        &self,
        transport_id: TransportId,
        data_producer_id: DataProducerId,
    ) -> Result<DirectDataConsumer, EngineError> {
        self.enter(EngineOp::ConsumeData).await?;
        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get(&transport_id)
            .ok_or_else(|| not_found("transport", transport_id))?;
        if !transport.direct {
            return Err(EngineError::Failed(
                "consume_data_direct requires a direct transport".to_string(),
            ));
        }
        let router_id = transport.router_id;
        let available = state
            .data_producers
            .get(&data_producer_id)
            .is_some_and(|p| p.routers.contains(&router_id));
        if !available {
            return Err(not_found("data producer", data_producer_id));
        }
        let (sink, messages) = mpsc::channel(DIRECT_CONSUMER_BUFFER);
        let id = DataConsumerId::new();
        state.data_consumers.insert(
            id,
            DataConsumerEntry {
                transport_id,
                data_producer_id,
                sink: Some(sink),
            },
        );
        Ok(DirectDataConsumer { id, messages })
    }

    async fn send_data(
        &self,
        data_producer_id: DataProducerId,
        payload: Bytes,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::SendData).await?;
        let mut state = self.state.lock().await;
        if !state.data_producers.contains_key(&data_producer_id) {
            return Err(not_found("data producer", data_producer_id));
        }
        state.sent.push((data_producer_id, payload));
        Ok(())
    }

    async fn close_data_consumer(
        &self,
        data_consumer_id: DataConsumerId,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::CloseDataConsumer).await?;
        self.state
            .lock()
            .await
            .data_consumers
            .remove(&data_consumer_id)
            .map(|_| ())
            .ok_or_else(|| not_found("data consumer", data_consumer_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::NumSctpStreams;

    fn transport_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            enable_sctp: true,
            num_sctp_streams: NumSctpStreams::default(),
            max_incoming_bitrate: None,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }

    fn client_capabilities() -> RtpCapabilities {
        RtpCapabilities(json!({ "codecs": [{ "mimeType": "video/VP8" }] }))
    }

    async fn two_routers(engine: &InMemoryEngine) -> (RouterInfo, RouterInfo) {
        let w1 = engine.create_worker().await.unwrap();
        let w2 = engine.create_worker().await.unwrap();
        (
            engine.create_router(w1).await.unwrap(),
            engine.create_router(w2).await.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_consume_requires_producer_on_router() {
        let engine = InMemoryEngine::new();
        let (r1, r2) = two_routers(&engine).await;

        let send = engine
            .create_webrtc_transport(r1.id, transport_options())
            .await
            .unwrap();
        let recv = engine
            .create_webrtc_transport(r2.id, transport_options())
            .await
            .unwrap();
        let producer = engine
            .produce(
                send.id,
                ProduceOptions {
                    kind: MediaKind::Video,
                    rtp_parameters: RtpParameters(json!({})),
                    paused: false,
                },
            )
            .await
            .unwrap();

        let options = ConsumeOptions {
            producer_id: producer,
            rtp_capabilities: client_capabilities(),
            paused: true,
        };
        assert!(!engine
            .can_consume(r2.id, producer, &client_capabilities())
            .await
            .unwrap());
        assert!(engine.consume(recv.id, options.clone()).await.is_err());

        engine.pipe_producer(producer, r2.id).await.unwrap();
        assert!(engine
            .can_consume(r2.id, producer, &client_capabilities())
            .await
            .unwrap());
        let consumer = engine.consume(recv.id, options).await.unwrap();
        assert!(engine.consumer_paused(consumer.id).await.unwrap());
        assert!(!consumer.producer_paused);
    }

    #[tokio::test]
    async fn test_closing_replica_removes_only_its_consumers() {
        let engine = InMemoryEngine::new();
        let (r1, r2) = two_routers(&engine).await;
        let send = engine
            .create_webrtc_transport(r1.id, transport_options())
            .await
            .unwrap();
        let recv1 = engine
            .create_webrtc_transport(r1.id, transport_options())
            .await
            .unwrap();
        let recv2 = engine
            .create_webrtc_transport(r2.id, transport_options())
            .await
            .unwrap();
        let producer = engine
            .produce(
                send.id,
                ProduceOptions {
                    kind: MediaKind::Audio,
                    rtp_parameters: RtpParameters(json!({})),
                    paused: false,
                },
            )
            .await
            .unwrap();
        engine.pipe_producer(producer, r2.id).await.unwrap();
        let options = ConsumeOptions {
            producer_id: producer,
            rtp_capabilities: client_capabilities(),
            paused: true,
        };
        let c1 = engine.consume(recv1.id, options.clone()).await.unwrap();
        let c2 = engine.consume(recv2.id, options).await.unwrap();

        engine.close_producer(producer, r2.id).await.unwrap();
        assert!(engine.has_consumer(c1.id).await);
        assert!(!engine.has_consumer(c2.id).await);

        engine.close_producer(producer, r1.id).await.unwrap();
        assert!(!engine.has_consumer(c1.id).await);
        assert_eq!(engine.counts().await.producers, 0);
    }

    #[tokio::test]
    async fn test_router_load_counts_webrtc_transports() {
        let engine = InMemoryEngine::new();
        let (r1, _) = two_routers(&engine).await;
        assert_eq!(engine.router_load(r1.id).await.unwrap(), 0);

        engine
            .create_webrtc_transport(r1.id, transport_options())
            .await
            .unwrap();
        engine.create_direct_transport(r1.id).await.unwrap();
        assert_eq!(engine.router_load(r1.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_and_call_count() {
        let engine = InMemoryEngine::new();
        engine.set_failing(EngineOp::CreateWorker, true).await;
        assert!(engine.create_worker().await.is_err());
        engine.set_failing(EngineOp::CreateWorker, false).await;
        assert!(engine.create_worker().await.is_ok());
        assert_eq!(engine.call_count(EngineOp::CreateWorker).await, 2);
    }

    #[tokio::test]
    async fn test_direct_consumer_receives_delivered_data() {
        let engine = InMemoryEngine::new();
        let (r1, _) = two_routers(&engine).await;
        let send = engine
            .create_webrtc_transport(r1.id, transport_options())
            .await
            .unwrap();
        let direct = engine.create_direct_transport(r1.id).await.unwrap();
        let data_producer = engine
            .produce_data(
                send.id,
                DataProduceOptions {
                    label: "actions".to_string(),
                    protocol: "raw".to_string(),
                    sctp_stream_parameters: None,
                },
            )
            .await
            .unwrap();
        let mut consumer = engine
            .consume_data_direct(direct, data_producer)
            .await
            .unwrap();

        let reached = engine
            .deliver_data(data_producer, Bytes::from_static(b"hello"))
            .await;
        assert_eq!(reached, 1);
        assert_eq!(
            consumer.messages.recv().await.unwrap(),
            Bytes::from_static(b"hello")
        );
    }

    #[tokio::test]
    async fn test_kill_worker_emits_event() {
        let engine = InMemoryEngine::new();
        let mut events = engine.subscribe();
        let worker = engine.create_worker().await.unwrap();

        engine.kill_worker(worker, "segfault").await;

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            EngineEvent::WorkerDied {
                worker_id: worker,
                reason: "segfault".to_string()
            }
        );
        assert!(engine.create_router(worker).await.is_err());
    }
}
