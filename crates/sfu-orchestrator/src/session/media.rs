//! Production/consumption registry.
//!
//! Tracks every producer (with the routers it was piped to), every consumer,
//! and the data producers and consumers of each peer. Closing follows the
//! ownership graph explicitly:
//!
//! ```text
//! peer -> transports -> producers -> replicas + attached consumers
//!                    -> consumers
//!                    -> data producers -> internal consumer + replicas
//!                    -> data consumers
//! ```

use super::op_queue::{PendingOperation, QueuedResource};
use super::peers::{ConsumerLayers, MediaSlot};
use super::Session;

use crate::engine::{ConsumeOptions, ConsumerInfo, ProduceOptions, RtpCapabilities, RtpParameters};
use crate::errors::SfuError;
use crate::signaling::messages::{
    ConsumerRef, ProducerAvailable, ProducerClosed, ProducerPaused, ProducerRef, ServerPush,
};
use crate::types::{
    ChannelKey, ConsumerId, DataChannelDescriptor, DataConsumerId, DataProducerId, Direction,
    MediaKind, MediaSlotDescriptor, PeerId, ProducerId, RouterId, TransportId, UserId,
};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A media producer and its replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub descriptor: MediaSlotDescriptor,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub origin_router: RouterId,
    pub replicas: Vec<RouterId>,
    pub paused: bool,
    pub global_mute: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub router_id: RouterId,
    pub paused: bool,
}

/// A client data producer, piped to the instance routers and absorbed by an
/// internal consumer on the server's direct transport.
#[derive(Debug, Clone)]
pub struct DataProducerRecord {
    pub id: DataProducerId,
    pub descriptor: DataChannelDescriptor,
    pub transport_id: TransportId,
    pub origin_router: RouterId,
    pub replicas: Vec<RouterId>,
    pub internal_consumer: Option<DataConsumerId>,
    /// Stops the task relaying the internal consumer's messages.
    pub pump: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataConsumerRecord {
    pub id: DataConsumerId,
    pub peer_id: PeerId,
    pub data_producer_id: DataProducerId,
    pub transport_id: TransportId,
}

/// Live counts, for gauges and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaCounts {
    pub producers: usize,
    pub consumers: usize,
    pub data_producers: usize,
    pub data_consumers: usize,
}

#[derive(Default)]
struct MediaTables {
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    data_producers: HashMap<DataProducerId, DataProducerRecord>,
    data_consumers: HashMap<DataConsumerId, DataConsumerRecord>,
}

/// Registry of producers and consumers.
#[derive(Default)]
pub struct MediaRegistry {
    tables: RwLock<MediaTables>,
}

impl MediaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_producer(&self, record: ProducerRecord) {
        self.tables.write().await.producers.insert(record.id, record);
    }

    pub async fn producer(&self, producer_id: ProducerId) -> Option<ProducerRecord> {
        self.tables.read().await.producers.get(&producer_id).cloned()
    }

    async fn remove_producer(&self, producer_id: ProducerId) -> Option<ProducerRecord> {
        self.tables.write().await.producers.remove(&producer_id)
    }

    /// Producer currently occupying a peer's media slot in a channel.
    pub async fn slot_producer(
        &self,
        peer_id: PeerId,
        media_tag: &str,
        channel: &ChannelKey,
    ) -> Option<ProducerId> {
        self.tables
            .read()
            .await
            .producers
            .values()
            .find(|p| {
                p.descriptor.peer_id == peer_id
                    && p.descriptor.media_tag == media_tag
                    && &p.descriptor.channel == channel
            })
            .map(|p| p.id)
    }

    async fn set_producer_paused(&self, producer_id: ProducerId, paused: bool, global_mute: bool) {
        if let Some(p) = self.tables.write().await.producers.get_mut(&producer_id) {
            p.paused = paused;
            p.global_mute = global_mute;
        }
    }

    pub async fn producers_on_transport(&self, transport_id: TransportId) -> Vec<ProducerId> {
        self.tables
            .read()
            .await
            .producers
            .values()
            .filter(|p| p.transport_id == transport_id)
            .map(|p| p.id)
            .collect()
    }

    pub async fn insert_consumer(&self, record: ConsumerRecord) {
        self.tables.write().await.consumers.insert(record.id, record);
    }

    pub async fn consumer(&self, consumer_id: ConsumerId) -> Option<ConsumerRecord> {
        self.tables.read().await.consumers.get(&consumer_id).cloned()
    }

    async fn remove_consumer(&self, consumer_id: ConsumerId) -> Option<ConsumerRecord> {
        self.tables.write().await.consumers.remove(&consumer_id)
    }

    async fn set_consumer_paused(&self, consumer_id: ConsumerId, paused: bool) {
        if let Some(c) = self.tables.write().await.consumers.get_mut(&consumer_id) {
            c.paused = paused;
        }
    }

    pub async fn consumers_of_producer(&self, producer_id: ProducerId) -> Vec<ConsumerId> {
        self.tables
            .read()
            .await
            .consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.id)
            .collect()
    }

    pub async fn consumers_on_transport(&self, transport_id: TransportId) -> Vec<ConsumerId> {
        self.tables
            .read()
            .await
            .consumers
            .values()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id)
            .collect()
    }

    pub async fn insert_data_producer(&self, record: DataProducerRecord) {
        self.tables
            .write()
            .await
            .data_producers
            .insert(record.id, record);
    }

    pub async fn data_producer(&self, data_producer_id: DataProducerId) -> Option<DataProducerRecord> {
        self.tables
            .read()
            .await
            .data_producers
            .get(&data_producer_id)
            .cloned()
    }

    pub(crate) async fn remove_data_producer(
        &self,
        data_producer_id: DataProducerId,
    ) -> Option<DataProducerRecord> {
        self.tables
            .write()
            .await
            .data_producers
            .remove(&data_producer_id)
    }

    pub async fn data_producers_on_transport(&self, transport_id: TransportId) -> Vec<DataProducerId> {
        self.tables
            .read()
            .await
            .data_producers
            .values()
            .filter(|p| p.transport_id == transport_id)
            .map(|p| p.id)
            .collect()
    }

    pub async fn insert_data_consumer(&self, record: DataConsumerRecord) {
        self.tables
            .write()
            .await
            .data_consumers
            .insert(record.id, record);
    }

    pub(crate) async fn remove_data_consumer(
        &self,
        data_consumer_id: DataConsumerId,
    ) -> Option<DataConsumerRecord> {
        self.tables
            .write()
            .await
            .data_consumers
            .remove(&data_consumer_id)
    }

    pub async fn data_consumers_on_transport(&self, transport_id: TransportId) -> Vec<DataConsumerId> {
        self.tables
            .read()
            .await
            .data_consumers
            .values()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id)
            .collect()
    }

    pub async fn counts(&self) -> MediaCounts {
        let tables = self.tables.read().await;
        MediaCounts {
            producers: tables.producers.len(),
            consumers: tables.consumers.len(),
            data_producers: tables.data_producers.len(),
            data_consumers: tables.data_consumers.len(),
        }
    }
}

/// Inputs of `produce_media`.
#[derive(Debug, Clone)]
pub struct ProduceMedia {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub media_tag: String,
    pub channel: ChannelKey,
}

/// Pause and layer state of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerState {
    pub paused: bool,
    pub layers: ConsumerLayers,
}

impl Session {
    /// Produce a media track into the peer's slot `(media_tag, channel)`.
    ///
    /// A producer already in the slot is closed before the new one is
    /// created. The new producer is piped to every other router of its pool
    /// and announced to the other peers of the channel.
    #[instrument(skip_all, name = "sfu.media.produce", fields(peer_id = %peer_id, media_tag = %request.media_tag))]
    pub async fn produce_media(
        &self,
        peer_id: PeerId,
        request: ProduceMedia,
    ) -> Result<ProducerId, SfuError> {
        let transport = self
            .transports
            .get(request.transport_id)
            .await
            .filter(|t| t.peer_id == peer_id && t.direction == Direction::Send)
            .ok_or_else(|| SfuError::InvalidTransport(request.transport_id.to_string()))?;
        self.require_peer(peer_id).await?;

        if let Some(previous) = self
            .media
            .slot_producer(peer_id, &request.media_tag, &request.channel)
            .await
        {
            debug!(
                target: "sfu.media",
                peer_id = %peer_id,
                producer_id = %previous,
                media_tag = %request.media_tag,
                "Replacing producer in media slot"
            );
            self.close_producer_cascade(previous).await;
        }

        let encodings = request.rtp_parameters.0.get("encodings").cloned();
        let producer_id = self
            .engine
            .produce(
                request.transport_id,
                ProduceOptions {
                    kind: request.kind,
                    rtp_parameters: request.rtp_parameters,
                    paused: request.paused,
                },
            )
            .await?;

        let mut replicas = Vec::new();
        if let Some(pool) = self.routers.pool_of_router(transport.router_id).await {
            for router_id in pool.router_ids() {
                if router_id == transport.router_id {
                    continue;
                }
                match self.engine.pipe_producer(producer_id, router_id).await {
                    Ok(()) => replicas.push(router_id),
                    Err(e) => warn!(
                        target: "sfu.media",
                        producer_id = %producer_id,
                        router_id = %router_id,
                        error = %e,
                        "Failed to pipe producer"
                    ),
                }
            }
        }

        let descriptor = MediaSlotDescriptor {
            peer_id,
            channel: request.channel.clone(),
            media_tag: request.media_tag.clone(),
        };
        self.media
            .insert_producer(ProducerRecord {
                id: producer_id,
                descriptor,
                kind: request.kind,
                transport_id: request.transport_id,
                origin_router: transport.router_id,
                replicas,
                paused: request.paused,
                global_mute: false,
            })
            .await;

        let slot = MediaSlot {
            producer_id,
            paused: request.paused,
            global_mute: false,
            encodings,
        };
        let slot_key = (request.media_tag.clone(), request.channel.clone());
        let previous_slot = self
            .peers
            .update(peer_id, |peer| peer.media.insert(slot_key, slot))
            .await;
        match previous_slot {
            None => {
                self.close_producer_cascade(producer_id).await;
                return Err(SfuError::PeerNotFound(peer_id.to_string()));
            }
            Some(Some(raced)) if raced.producer_id != producer_id => {
                // A concurrent produce for the same slot; the latest one wins.
                self.close_producer_cascade(raced.producer_id).await;
            }
            Some(_) => {}
        }
        if !self.transports.contains(request.transport_id).await {
            // The transport closed while the producer was being piped.
            self.close_producer_cascade(producer_id).await;
            return Err(SfuError::InvalidTransport(request.transport_id.to_string()));
        }

        let announcement = ServerPush::ProducerAvailable(ProducerAvailable {
            peer_id,
            media_tag: request.media_tag.clone(),
            producer_id,
            channel_type: request.channel.channel_type().to_string(),
            channel_id: request.channel.channel_id().map(str::to_string),
        });
        for peer in self.peers.all().await {
            if peer.peer_id == peer_id {
                continue;
            }
            let in_channel = request.channel.is_instance()
                || peer.transports.keys().any(|(_, c)| c == &request.channel);
            if in_channel {
                peer.connection.push(announcement.clone());
            }
        }

        info!(
            target: "sfu.media",
            peer_id = %peer_id,
            producer_id = %producer_id,
            media_tag = %request.media_tag,
            channel = %request.channel,
            "Producer created"
        );
        self.refresh_gauges().await;
        Ok(producer_id)
    }

    /// Consume another peer's media slot on the requester's receive transport
    /// for the channel. Consumers always start paused.
    #[instrument(skip_all, name = "sfu.media.consume", fields(peer_id = %peer_id, media_peer_id = %media_peer_id, media_tag = %media_tag))]
    pub async fn consume_media(
        &self,
        peer_id: PeerId,
        media_peer_id: PeerId,
        media_tag: &str,
        rtp_capabilities: RtpCapabilities,
        channel: &ChannelKey,
    ) -> Result<ConsumerInfo, SfuError> {
        let peer = self.require_peer(peer_id).await?;
        let producer_id = self
            .peers
            .find(media_peer_id)
            .await
            .and_then(|p| p.media_slot(media_tag, channel).map(|slot| slot.producer_id))
            .ok_or_else(|| SfuError::ProducerNotFound(format!("{media_peer_id}/{media_tag}")))?;

        let transport_id = peer
            .transport_for(Direction::Recv, channel)
            .ok_or_else(|| SfuError::InvalidTransport(format!("no receive transport for {channel}")))?;
        let transport = self
            .transports
            .get(transport_id)
            .await
            .ok_or_else(|| SfuError::InvalidTransport(transport_id.to_string()))?;

        if !self
            .engine
            .can_consume(transport.router_id, producer_id, &rtp_capabilities)
            .await?
        {
            return Err(SfuError::CannotConsume(format!(
                "router {} cannot deliver producer {producer_id}",
                transport.router_id
            )));
        }

        let info = self
            .engine
            .consume(
                transport_id,
                ConsumeOptions {
                    producer_id,
                    rtp_capabilities,
                    paused: true,
                },
            )
            .await?;

        self.media
            .insert_consumer(ConsumerRecord {
                id: info.id,
                peer_id,
                producer_id,
                transport_id,
                router_id: transport.router_id,
                paused: true,
            })
            .await;

        let attached = self
            .peers
            .update(peer_id, |p| {
                p.consumer_layers.insert(info.id, ConsumerLayers::default());
            })
            .await
            .is_some();
        let still_live = self.transports.contains(transport_id).await
            && self.media.producer(producer_id).await.is_some();
        if !attached || !still_live {
            self.close_consumer_cascade(info.id, false).await;
            return Err(if attached {
                SfuError::ProducerNotFound(producer_id.to_string())
            } else {
                SfuError::PeerNotFound(peer_id.to_string())
            });
        }

        debug!(
            target: "sfu.media",
            peer_id = %peer_id,
            consumer_id = %info.id,
            producer_id = %producer_id,
            producer_paused = info.producer_paused,
            "Consumer created"
        );
        self.refresh_gauges().await;
        Ok(info)
    }

    /// Close a producer at its owner's request.
    pub async fn close_producer(&self, peer_id: PeerId, producer_id: ProducerId) -> Result<(), SfuError> {
        match self.media.producer(producer_id).await {
            Some(record) if record.descriptor.peer_id == peer_id => {
                self.close_producer_cascade(producer_id).await;
                Ok(())
            }
            _ => Err(SfuError::ProducerNotFound(producer_id.to_string())),
        }
    }

    /// Close a producer, its attached consumers and every replica.
    pub(crate) async fn close_producer_cascade(&self, producer_id: ProducerId) -> bool {
        let Some(record) = self.media.remove_producer(producer_id).await else {
            return false;
        };

        for consumer_id in self.media.consumers_of_producer(producer_id).await {
            self.close_consumer_cascade(consumer_id, true).await;
        }
        for router_id in record.replicas.iter().chain(std::iter::once(&record.origin_router)) {
            if let Err(e) = self.engine.close_producer(producer_id, *router_id).await {
                debug!(
                    target: "sfu.media",
                    producer_id = %producer_id,
                    router_id = %router_id,
                    error = %e,
                    "Producer already gone on router"
                );
            }
        }

        let owner = record.descriptor.peer_id;
        let slot_key = (
            record.descriptor.media_tag.clone(),
            record.descriptor.channel.clone(),
        );
        self.peers
            .update(owner, |peer| {
                if peer
                    .media
                    .get(&slot_key)
                    .is_some_and(|slot| slot.producer_id == producer_id)
                {
                    peer.media.remove(&slot_key);
                }
            })
            .await;

        let notice = ServerPush::ProducerClosed(ProducerClosed {
            producer_id,
            peer_id: owner,
            media_tag: record.descriptor.media_tag,
        });
        for connection in self.peers.connections_except(Some(owner)).await {
            connection.push(notice.clone());
        }

        info!(target: "sfu.media", producer_id = %producer_id, peer_id = %owner, "Producer closed");
        self.refresh_gauges().await;
        true
    }

    /// Close a consumer at its owner's request.
    pub async fn close_consumer(&self, peer_id: PeerId, consumer_id: ConsumerId) -> Result<(), SfuError> {
        self.owned_consumer(peer_id, consumer_id).await?;
        self.close_consumer_cascade(consumer_id, false).await;
        Ok(())
    }

    /// Close a consumer. With `notify`, its owner receives `WebRTCCloseConsumer`.
    pub(crate) async fn close_consumer_cascade(&self, consumer_id: ConsumerId, notify: bool) -> bool {
        let Some(record) = self.media.remove_consumer(consumer_id).await else {
            return false;
        };
        if let Err(e) = self.engine.close_consumer(consumer_id).await {
            debug!(
                target: "sfu.media",
                consumer_id = %consumer_id,
                error = %e,
                "Consumer already gone"
            );
        }
        let connection = self
            .peers
            .update(record.peer_id, |peer| {
                peer.consumer_layers.remove(&consumer_id);
                peer.connection.clone()
            })
            .await;
        if notify {
            if let Some(connection) = connection {
                connection.push(ServerPush::ConsumerClosed(ConsumerRef { consumer_id }));
            }
        }
        debug!(target: "sfu.media", consumer_id = %consumer_id, peer_id = %record.peer_id, "Consumer closed");
        self.refresh_gauges().await;
        true
    }

    async fn owned_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<ConsumerRecord, SfuError> {
        self.media
            .consumer(consumer_id)
            .await
            .filter(|c| c.peer_id == peer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.to_string()))
    }

    /// Queue a producer pause. Every peer is told once the engine applied it.
    pub async fn pause_producer(
        self: &Arc<Self>,
        peer_id: PeerId,
        producer_id: ProducerId,
        global_mute: bool,
    ) -> Result<PendingOperation, SfuError> {
        self.require_peer(peer_id).await?;
        if self.media.producer(producer_id).await.is_none() {
            return Err(SfuError::ProducerNotFound(producer_id.to_string()));
        }
        let session = Arc::clone(self);
        Ok(self
            .queue
            .enqueue(QueuedResource::Producer(producer_id), async move {
                session.apply_producer_pause(producer_id, true, global_mute).await
            })
            .await)
    }

    /// Queue a producer resume. Resuming clears global mute.
    pub async fn resume_producer(
        self: &Arc<Self>,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<PendingOperation, SfuError> {
        self.require_peer(peer_id).await?;
        if self.media.producer(producer_id).await.is_none() {
            return Err(SfuError::ProducerNotFound(producer_id.to_string()));
        }
        let session = Arc::clone(self);
        Ok(self
            .queue
            .enqueue(QueuedResource::Producer(producer_id), async move {
                session.apply_producer_pause(producer_id, false, false).await
            })
            .await)
    }

    async fn apply_producer_pause(
        &self,
        producer_id: ProducerId,
        paused: bool,
        global_mute: bool,
    ) -> Result<(), SfuError> {
        let result = if paused {
            self.engine.pause_producer(producer_id).await
        } else {
            self.engine.resume_producer(producer_id).await
        };
        result.map_err(|e| match e {
            crate::engine::EngineError::NotFound { .. } => {
                SfuError::ProducerNotFound(producer_id.to_string())
            }
            other => SfuError::Engine(other),
        })?;

        let Some(record) = self.media.producer(producer_id).await else {
            return Err(SfuError::ProducerNotFound(producer_id.to_string()));
        };
        self.media
            .set_producer_paused(producer_id, paused, global_mute)
            .await;
        let slot_key = (
            record.descriptor.media_tag.clone(),
            record.descriptor.channel.clone(),
        );
        self.peers
            .update(record.descriptor.peer_id, |peer| {
                if let Some(slot) = peer.media.get_mut(&slot_key) {
                    if slot.producer_id == producer_id {
                        slot.paused = paused;
                        slot.global_mute = global_mute;
                    }
                }
            })
            .await;

        let notice = if paused {
            ServerPush::ProducerPaused(ProducerPaused {
                producer_id,
                global_mute,
            })
        } else {
            ServerPush::ProducerResumed(ProducerRef { producer_id })
        };
        for connection in self.peers.connections_except(None).await {
            connection.push(notice.clone());
        }

        debug!(
            target: "sfu.media",
            producer_id = %producer_id,
            paused = paused,
            global_mute = global_mute,
            "Producer pause state applied"
        );
        Ok(())
    }

    /// Queue a consumer pause. The owner is told once the engine applied it.
    pub async fn pause_consumer(
        self: &Arc<Self>,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<PendingOperation, SfuError> {
        self.enqueue_consumer_state(peer_id, consumer_id, true).await
    }

    /// Queue a consumer resume. The owner is told once the engine applied it.
    pub async fn resume_consumer(
        self: &Arc<Self>,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<PendingOperation, SfuError> {
        self.enqueue_consumer_state(peer_id, consumer_id, false).await
    }

    async fn enqueue_consumer_state(
        self: &Arc<Self>,
        peer_id: PeerId,
        consumer_id: ConsumerId,
        paused: bool,
    ) -> Result<PendingOperation, SfuError> {
        self.owned_consumer(peer_id, consumer_id).await?;
        let session = Arc::clone(self);
        Ok(self
            .queue
            .enqueue(QueuedResource::Consumer(consumer_id), async move {
                session.apply_consumer_pause(consumer_id, paused).await
            })
            .await)
    }

    async fn apply_consumer_pause(&self, consumer_id: ConsumerId, paused: bool) -> Result<(), SfuError> {
        let result = if paused {
            self.engine.pause_consumer(consumer_id).await
        } else {
            self.engine.resume_consumer(consumer_id).await
        };
        result.map_err(|e| match e {
            crate::engine::EngineError::NotFound { .. } => {
                SfuError::ConsumerNotFound(consumer_id.to_string())
            }
            other => SfuError::Engine(other),
        })?;

        let Some(record) = self.media.consumer(consumer_id).await else {
            return Err(SfuError::ConsumerNotFound(consumer_id.to_string()));
        };
        self.media.set_consumer_paused(consumer_id, paused).await;
        if let Some(peer) = self.peers.find(record.peer_id).await {
            let notice = ConsumerRef { consumer_id };
            peer.connection.push(if paused {
                ServerPush::ConsumerPaused(notice)
            } else {
                ServerPush::ConsumerResumed(notice)
            });
        }
        Ok(())
    }

    /// Record the client's preferred spatial layer and forward it to the engine.
    pub async fn set_consumer_layers(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
        spatial_layer: u8,
    ) -> Result<(), SfuError> {
        self.owned_consumer(peer_id, consumer_id).await?;
        self.engine
            .set_preferred_layers(consumer_id, spatial_layer)
            .await?;
        self.peers
            .update(peer_id, |peer| {
                peer.consumer_layers
                    .entry(consumer_id)
                    .or_default()
                    .client_selected_layer = Some(spatial_layer);
            })
            .await
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))
    }

    /// Record the engine-reported active layer of a consumer.
    pub async fn record_layers_change(&self, consumer_id: ConsumerId, spatial_layer: Option<u8>) {
        let Some(record) = self.media.consumer(consumer_id).await else {
            return;
        };
        self.peers
            .update(record.peer_id, |peer| {
                if let Some(layers) = peer.consumer_layers.get_mut(&consumer_id) {
                    layers.current_layer = spatial_layer;
                }
            })
            .await;
    }

    pub async fn consumer_state(&self, consumer_id: ConsumerId) -> Option<ConsumerState> {
        let record = self.media.consumer(consumer_id).await?;
        let layers = self
            .peers
            .find(record.peer_id)
            .await
            .and_then(|peer| peer.consumer_layers.get(&consumer_id).copied())
            .unwrap_or_default();
        Some(ConsumerState {
            paused: record.paused,
            layers,
        })
    }

    /// Re-announce the unpaused media of other users in `channel` to the requester.
    ///
    /// Returns the number of announcements queued.
    pub async fn request_current_producers(
        &self,
        peer_id: PeerId,
        user_ids: Option<&[UserId]>,
        channel: &ChannelKey,
    ) -> Result<usize, SfuError> {
        let requester = self.require_peer(peer_id).await?;
        let mut announced = 0;
        for peer in self.peers.all().await {
            if peer.user_id == requester.user_id {
                continue;
            }
            if user_ids.is_some_and(|ids| !ids.contains(&peer.user_id)) {
                continue;
            }
            for ((media_tag, slot_channel), slot) in &peer.media {
                if slot.paused || slot_channel != channel {
                    continue;
                }
                let push = ServerPush::ProducerAvailable(ProducerAvailable {
                    peer_id: peer.peer_id,
                    media_tag: media_tag.clone(),
                    producer_id: slot.producer_id,
                    channel_type: channel.channel_type().to_string(),
                    channel_id: channel.channel_id().map(str::to_string),
                });
                if requester.connection.push(push) {
                    announced += 1;
                }
            }
        }
        Ok(announced)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn producer(peer_id: PeerId, tag: &str, channel: ChannelKey, transport_id: TransportId) -> ProducerRecord {
        ProducerRecord {
            id: ProducerId::new(),
            descriptor: MediaSlotDescriptor {
                peer_id,
                channel,
                media_tag: tag.to_string(),
            },
            kind: MediaKind::Video,
            transport_id,
            origin_router: RouterId::new(),
            replicas: Vec::new(),
            paused: false,
            global_mute: false,
        }
    }

    #[tokio::test]
    async fn test_slot_lookup_matches_tag_and_channel() {
        let registry = MediaRegistry::new();
        let peer_id = PeerId::new();
        let transport_id = TransportId::new();
        let room = ChannelKey::new("channel", Some("room-1".to_string()));
        let cam = producer(peer_id, "cam", ChannelKey::instance(), transport_id);
        let room_cam = producer(peer_id, "cam", room.clone(), transport_id);
        registry.insert_producer(cam.clone()).await;
        registry.insert_producer(room_cam.clone()).await;

        assert_eq!(
            registry.slot_producer(peer_id, "cam", &ChannelKey::instance()).await,
            Some(cam.id)
        );
        assert_eq!(registry.slot_producer(peer_id, "cam", &room).await, Some(room_cam.id));
        assert_eq!(registry.slot_producer(peer_id, "mic", &room).await, None);
        assert_eq!(
            registry.slot_producer(PeerId::new(), "cam", &room).await,
            None
        );
    }

    #[tokio::test]
    async fn test_consumers_are_indexed_by_producer_and_transport() {
        let registry = MediaRegistry::new();
        let send = TransportId::new();
        let recv = TransportId::new();
        let record = producer(PeerId::new(), "cam", ChannelKey::instance(), send);
        registry.insert_producer(record.clone()).await;
        let consumer = ConsumerRecord {
            id: ConsumerId::new(),
            peer_id: PeerId::new(),
            producer_id: record.id,
            transport_id: recv,
            router_id: record.origin_router,
            paused: true,
        };
        registry.insert_consumer(consumer.clone()).await;

        assert_eq!(registry.producers_on_transport(send).await, vec![record.id]);
        assert_eq!(registry.consumers_of_producer(record.id).await, vec![consumer.id]);
        assert_eq!(registry.consumers_on_transport(recv).await, vec![consumer.id]);
        assert!(registry.consumers_on_transport(send).await.is_empty());
        assert_eq!(
            registry.counts().await,
            MediaCounts {
                producers: 1,
                consumers: 1,
                data_producers: 0,
                data_consumers: 0,
            }
        );

        registry.remove_consumer(consumer.id).await;
        assert!(registry.consumers_of_producer(record.id).await.is_empty());
    }
}
