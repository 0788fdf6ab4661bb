//! Internal reliable-data bridge.
//!
//! The server owns a direct transport on the first instance router with one
//! outgoing data producer, piped to every other instance router. Each peer's
//! instance receive transport consumes that producer, so a single `send`
//! reaches every peer.
//!
//! Every client data producer is also consumed on the direct transport. A
//! pump task per data producer appends what it receives to a bounded inbound
//! queue for the simulation layer and relays it through the outgoing
//! producer.

use super::media::{DataConsumerRecord, DataProducerRecord};
use super::routers::RouterPool;
use super::Session;

use crate::engine::{DataProduceOptions, MediaEngine, SctpStreamParameters};
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::signaling::messages::{
    DataConsumerAvailable, ErrorBody, ServerPush, DEFAULT_DATA_PROTOCOL,
};
use crate::types::{
    ChannelKey, DataChannelDescriptor, DataConsumerId, DataProducerId, Direction, PeerId,
    RouterId, TransportId,
};

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Label of the server's outgoing data producer.
pub const SERVER_DATA_LABEL: &str = "server";

/// A message received from a peer's data producer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub peer_id: PeerId,
    pub payload: Bytes,
    pub received_at: Instant,
}

/// Server-side end of the data channels.
pub struct DataBridge {
    transport_id: TransportId,
    router_id: RouterId,
    outgoing: DataProducerId,
    inbound: Mutex<VecDeque<InboundMessage>>,
    capacity: usize,
}

impl DataBridge {
    /// Create the direct transport and the outgoing data producer.
    pub async fn start(
        engine: &dyn MediaEngine,
        instance_pool: &RouterPool,
        capacity: usize,
    ) -> Result<Self, SfuError> {
        let router_id = instance_pool
            .first()
            .map(|router| router.id)
            .ok_or_else(|| SfuError::NoAvailableRouter("instance pool is empty".to_string()))?;

        let transport_id = engine.create_direct_transport(router_id).await?;
        let outgoing = engine
            .produce_data(
                transport_id,
                DataProduceOptions {
                    label: SERVER_DATA_LABEL.to_string(),
                    protocol: DEFAULT_DATA_PROTOCOL.to_string(),
                    sctp_stream_parameters: None,
                },
            )
            .await?;
        for target in instance_pool.router_ids() {
            if target != router_id {
                engine.pipe_data_producer(outgoing, target).await?;
            }
        }

        info!(
            target: "sfu.data",
            transport_id = %transport_id,
            data_producer_id = %outgoing,
            "Server data producer created"
        );

        Ok(Self {
            transport_id,
            router_id,
            outgoing,
            inbound: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    #[must_use]
    pub fn transport_id(&self) -> TransportId {
        self.transport_id
    }

    #[must_use]
    pub fn router_id(&self) -> RouterId {
        self.router_id
    }

    /// The server's outgoing data producer.
    #[must_use]
    pub fn outgoing(&self) -> DataProducerId {
        self.outgoing
    }

    /// Append to the inbound queue, dropping the oldest message when full.
    async fn enqueue_inbound(&self, message: InboundMessage) {
        let mut inbound = self.inbound.lock().await;
        if self.capacity == 0 {
            metrics::record_inbound_dropped();
            return;
        }
        if inbound.len() >= self.capacity {
            if let Some(dropped) = inbound.pop_front() {
                warn!(
                    target: "sfu.data",
                    peer_id = %dropped.peer_id,
                    capacity = self.capacity,
                    "Inbound data queue full, dropping oldest message"
                );
                metrics::record_inbound_dropped();
            }
        }
        inbound.push_back(message);
    }

    /// Take every queued inbound message, oldest first.
    pub async fn drain_inbound(&self) -> Vec<InboundMessage> {
        self.inbound.lock().await.drain(..).collect()
    }

    pub async fn inbound_len(&self) -> usize {
        self.inbound.lock().await.len()
    }
}

/// Inputs of `produce_data`.
#[derive(Debug, Clone)]
pub struct ProduceData {
    pub transport_id: TransportId,
    pub label: Option<String>,
    pub protocol: String,
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
}

impl Session {
    /// Register a client data producer and wire it into the bridge.
    #[instrument(skip_all, name = "sfu.data.produce", fields(peer_id = %peer_id))]
    pub async fn produce_data(
        self: &Arc<Self>,
        peer_id: PeerId,
        request: ProduceData,
    ) -> Result<DataProducerId, SfuError> {
        let label = request
            .label
            .filter(|label| !label.is_empty())
            .ok_or_else(|| SfuError::InvalidRequest("No data producer label".to_string()))?;
        let transport = self
            .transports
            .get(request.transport_id)
            .await
            .filter(|t| t.peer_id == peer_id && t.direction == Direction::Send)
            .ok_or_else(|| SfuError::InvalidTransport(request.transport_id.to_string()))?;
        let peer = self.require_peer(peer_id).await?;

        if let Some(previous) = peer.data_producers.get(&label).copied() {
            debug!(
                target: "sfu.data",
                peer_id = %peer_id,
                data_producer_id = %previous,
                label = %label,
                "Replacing data producer"
            );
            self.close_data_producer_cascade(previous).await;
        }

        let data_producer_id = self
            .engine
            .produce_data(
                request.transport_id,
                DataProduceOptions {
                    label: label.clone(),
                    protocol: request.protocol,
                    sctp_stream_parameters: request.sctp_stream_parameters,
                },
            )
            .await?;

        let pump = peer.cancel_token.child_token();
        let mut record = DataProducerRecord {
            id: data_producer_id,
            descriptor: DataChannelDescriptor {
                peer_id,
                channel: transport.channel.clone(),
                label: label.clone(),
            },
            transport_id: request.transport_id,
            origin_router: transport.router_id,
            replicas: Vec::new(),
            internal_consumer: None,
            pump: pump.clone(),
        };
        // Registered before any further engine call so a concurrent transport
        // close finds it and cleans up.
        self.media.insert_data_producer(record.clone()).await;

        for router_id in self.routers.instance_pool().router_ids() {
            if router_id == transport.router_id {
                continue;
            }
            match self.engine.pipe_data_producer(data_producer_id, router_id).await {
                Ok(()) => record.replicas.push(router_id),
                Err(e) => warn!(
                    target: "sfu.data",
                    data_producer_id = %data_producer_id,
                    router_id = %router_id,
                    error = %e,
                    "Failed to pipe data producer"
                ),
            }
        }

        match self
            .engine
            .consume_data_direct(self.data.transport_id(), data_producer_id)
            .await
        {
            Ok(direct) => {
                record.internal_consumer = Some(direct.id);
                tokio::spawn(run_data_pump(
                    Arc::downgrade(self),
                    peer_id,
                    data_producer_id,
                    direct.messages,
                    pump,
                ));
            }
            Err(e) => warn!(
                target: "sfu.data",
                data_producer_id = %data_producer_id,
                error = %e,
                "Server could not consume data producer"
            ),
        }

        self.media.insert_data_producer(record).await;
        let attached = self
            .peers
            .update(peer_id, |peer| peer.data_producers.insert(label.clone(), data_producer_id))
            .await;
        if attached.is_none() || !self.transports.contains(request.transport_id).await {
            self.close_data_producer_cascade(data_producer_id).await;
            return Err(match attached {
                None => SfuError::PeerNotFound(peer_id.to_string()),
                Some(_) => SfuError::InvalidTransport(request.transport_id.to_string()),
            });
        }

        info!(
            target: "sfu.data",
            peer_id = %peer_id,
            data_producer_id = %data_producer_id,
            label = %label,
            "Data producer created"
        );
        self.refresh_gauges().await;

        self.wire_broadcast_consumer(peer_id).await;
        Ok(data_producer_id)
    }

    /// Consume the server's outgoing data producer on the peer's instance
    /// receive transport, once per peer.
    ///
    /// Failures are reported to the peer as an `Error` push.
    pub(crate) async fn wire_broadcast_consumer(&self, peer_id: PeerId) {
        let Some(peer) = self.peers.find(peer_id).await else {
            debug!(target: "sfu.data", peer_id = %peer_id, "Peer gone before broadcast wiring");
            return;
        };
        if peer.broadcast_consumer.is_some() {
            return;
        }
        let Some(transport_id) = peer.transport_for(Direction::Recv, &ChannelKey::instance()) else {
            peer.connection.push(ServerPush::Error(ErrorBody {
                code: SfuError::InvalidTransport(String::new()).error_code(),
                message: "transport did not exist".to_string(),
            }));
            return;
        };

        let info = match self
            .engine
            .consume_data(transport_id, self.data.outgoing())
            .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    target: "sfu.data",
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    error = %e,
                    "Broadcast data consumer creation failed"
                );
                peer.connection
                    .push(ServerPush::Error(ErrorBody::from(&SfuError::Engine(e))));
                return;
            }
        };

        self.media
            .insert_data_consumer(DataConsumerRecord {
                id: info.id,
                peer_id,
                data_producer_id: info.data_producer_id,
                transport_id,
            })
            .await;
        let wired = self
            .peers
            .update(peer_id, |peer| {
                if peer.broadcast_consumer.is_some() {
                    return false;
                }
                peer.broadcast_consumer = Some(info.id);
                peer.data_consumers.insert(info.label.clone(), info.id);
                true
            })
            .await;
        if wired != Some(true) || !self.transports.contains(transport_id).await {
            self.close_data_consumer_cascade(info.id).await;
            return;
        }

        peer.connection
            .push(ServerPush::ConsumeData(DataConsumerAvailable {
                id: info.id,
                data_producer_id: info.data_producer_id,
                label: info.label,
                protocol: info.protocol,
                sctp_stream_parameters: info.sctp_stream_parameters,
            }));
        debug!(target: "sfu.data", peer_id = %peer_id, data_consumer_id = %info.id, "Broadcast consumer wired");
        self.refresh_gauges().await;
    }

    /// Close a data producer at its owner's request.
    pub async fn close_data_producer(
        &self,
        peer_id: PeerId,
        data_producer_id: DataProducerId,
    ) -> Result<(), SfuError> {
        match self.media.data_producer(data_producer_id).await {
            Some(record) if record.descriptor.peer_id == peer_id => {
                self.close_data_producer_cascade(data_producer_id).await;
                Ok(())
            }
            _ => Err(SfuError::DataProducerNotFound(data_producer_id.to_string())),
        }
    }

    pub(crate) async fn close_data_producer_cascade(&self, data_producer_id: DataProducerId) -> bool {
        let Some(record) = self.media.remove_data_producer(data_producer_id).await else {
            return false;
        };
        record.pump.cancel();

        if let Some(internal) = record.internal_consumer {
            if let Err(e) = self.engine.close_data_consumer(internal).await {
                debug!(target: "sfu.data", data_consumer_id = %internal, error = %e, "Internal consumer already gone");
            }
        }
        for router_id in record.replicas.iter().chain(std::iter::once(&record.origin_router)) {
            if let Err(e) = self
                .engine
                .close_data_producer(data_producer_id, *router_id)
                .await
            {
                debug!(
                    target: "sfu.data",
                    data_producer_id = %data_producer_id,
                    router_id = %router_id,
                    error = %e,
                    "Data producer already gone on router"
                );
            }
        }

        let label = record.descriptor.label;
        self.peers
            .update(record.descriptor.peer_id, |peer| {
                if peer.data_producers.get(&label) == Some(&data_producer_id) {
                    peer.data_producers.remove(&label);
                }
            })
            .await;

        debug!(target: "sfu.data", data_producer_id = %data_producer_id, "Data producer closed");
        self.refresh_gauges().await;
        true
    }

    pub(crate) async fn close_data_consumer_cascade(&self, data_consumer_id: DataConsumerId) -> bool {
        let Some(record) = self.media.remove_data_consumer(data_consumer_id).await else {
            return false;
        };
        if let Err(e) = self.engine.close_data_consumer(data_consumer_id).await {
            debug!(target: "sfu.data", data_consumer_id = %data_consumer_id, error = %e, "Data consumer already gone");
        }
        self.peers
            .update(record.peer_id, |peer| {
                if peer.broadcast_consumer == Some(data_consumer_id) {
                    peer.broadcast_consumer = None;
                }
                peer.data_consumers.retain(|_, id| *id != data_consumer_id);
            })
            .await;
        self.refresh_gauges().await;
        true
    }

    /// Send a message to every peer through the server's data producer.
    pub async fn broadcast_data(&self, payload: Bytes) -> Result<(), SfuError> {
        self.engine
            .send_data(self.data.outgoing(), payload)
            .await
            .map_err(SfuError::from)
    }

    /// Queue a peer's message for the simulation layer and relay it to every peer.
    async fn relay_inbound(&self, peer_id: PeerId, payload: Bytes) {
        self.data
            .enqueue_inbound(InboundMessage {
                peer_id,
                payload: payload.clone(),
                received_at: Instant::now(),
            })
            .await;
        if let Err(e) = self.broadcast_data(payload).await {
            debug!(target: "sfu.data", peer_id = %peer_id, error = %e, "Relay of inbound message failed");
        }
    }

    /// Take every message received from peers since the last drain.
    pub async fn drain_inbound(&self) -> Vec<InboundMessage> {
        self.data.drain_inbound().await
    }
}

#[instrument(skip_all, name = "sfu.data.pump", fields(peer_id = %peer_id, data_producer_id = %data_producer_id))]
async fn run_data_pump(
    session: Weak<Session>,
    peer_id: PeerId,
    data_producer_id: DataProducerId,
    mut messages: mpsc::Receiver<Bytes>,
    cancel_token: CancellationToken,
) {
    debug!(target: "sfu.data", "Data pump started");
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            message = messages.recv() => {
                let Some(payload) = message else { break };
                let Some(session) = session.upgrade() else { break };
                session.relay_inbound(peer_id, payload).await;
            }
        }
    }
    debug!(target: "sfu.data", "Data pump stopped");
}
