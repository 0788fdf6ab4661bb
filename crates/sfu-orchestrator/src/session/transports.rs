//! Transport lifecycle.
//!
//! `Created -> Connecting -> Connected`, then removed on close. Closing a
//! transport removes it from the ledger first, then runs the cascade over
//! every producer, consumer and data channel bound to it, and only then
//! closes it in the engine.
//!
//! Connects are deduplicated through the pending-connect ledger: while a
//! connect for a transport is in flight, further connects for the same id
//! wait on the same outcome instead of negotiating again.

use super::Session;

use crate::engine::{
    DtlsParameters, EngineError, SctpCapabilities, TransportParameters, WebRtcTransportOptions,
};
use crate::errors::SfuError;
use crate::types::{ChannelKey, Direction, PeerId, RouterId, TransportId};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// A client-facing transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRecord {
    pub id: TransportId,
    pub peer_id: PeerId,
    pub direction: Direction,
    pub channel: ChannelKey,
    pub router_id: RouterId,
    pub state: TransportState,
}

type ConnectOutcome = Arc<OnceCell<Result<(), EngineError>>>;

/// Live transports plus the in-flight connect ledger.
#[derive(Default)]
pub struct TransportLedger {
    records: RwLock<HashMap<TransportId, TransportRecord>>,
    pending_connects: Mutex<HashMap<TransportId, ConnectOutcome>>,
}

impl TransportLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: TransportRecord) {
        self.records.write().await.insert(record.id, record);
    }

    pub async fn get(&self, transport_id: TransportId) -> Option<TransportRecord> {
        self.records.read().await.get(&transport_id).cloned()
    }

    pub async fn contains(&self, transport_id: TransportId) -> bool {
        self.records.read().await.contains_key(&transport_id)
    }

    async fn remove(&self, transport_id: TransportId) -> Option<TransportRecord> {
        self.pending_connects.lock().await.remove(&transport_id);
        self.records.write().await.remove(&transport_id)
    }

    async fn set_state(&self, transport_id: TransportId, state: TransportState) {
        if let Some(record) = self.records.write().await.get_mut(&transport_id) {
            record.state = state;
        }
    }

    /// Transports owned by a peer.
    pub async fn for_peer(&self, peer_id: PeerId) -> Vec<TransportId> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.peer_id == peer_id)
            .map(|r| r.id)
            .collect()
    }

    pub async fn ids(&self) -> Vec<TransportId> {
        self.records.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Connects currently in flight.
    pub async fn pending_connects(&self) -> usize {
        self.pending_connects.lock().await.len()
    }
}

impl Session {
    /// Create a WebRTC transport for `(peer, direction, channel)`.
    ///
    /// Any transport the peer already owns for the same direction and
    /// channel is closed first.
    #[instrument(skip_all, name = "sfu.transports.create", fields(peer_id = %peer_id, direction = %direction, channel = %channel))]
    pub async fn create_transport(
        &self,
        peer_id: PeerId,
        direction: Direction,
        channel: ChannelKey,
        sctp_capabilities: Option<SctpCapabilities>,
    ) -> Result<TransportParameters, SfuError> {
        let peer = self.require_peer(peer_id).await?;
        if let Some(existing) = peer.transport_for(direction, &channel) {
            debug!(
                target: "sfu.transports",
                peer_id = %peer_id,
                transport_id = %existing,
                "Closing previous transport for direction and channel"
            );
            self.close_transport(existing).await;
        }

        let reservation = self.routers.select_router(&channel).await?;
        let options = WebRtcTransportOptions {
            enable_sctp: true,
            num_sctp_streams: sctp_capabilities
                .map(|caps| caps.num_streams)
                .unwrap_or_default(),
            max_incoming_bitrate: Some(self.settings.max_incoming_bitrate),
            initial_available_outgoing_bitrate: self.settings.initial_available_outgoing_bitrate,
        };
        let router_id = reservation.router_id();
        let parameters = self
            .engine
            .create_webrtc_transport(router_id, options)
            .await?;
        drop(reservation);

        let transport_id = parameters.id;
        self.transports
            .insert(TransportRecord {
                id: transport_id,
                peer_id,
                direction,
                channel: channel.clone(),
                router_id,
                state: TransportState::Created,
            })
            .await;

        let attached = self
            .peers
            .update(peer_id, |peer| {
                peer.transports.insert((direction, channel.clone()), transport_id)
            })
            .await;
        match attached {
            None => {
                // Peer disconnected while the engine call was in flight.
                self.close_transport(transport_id).await;
                return Err(SfuError::PeerNotFound(peer_id.to_string()));
            }
            Some(Some(raced)) if raced != transport_id => {
                // A concurrent create for the same slot finished first.
                self.close_transport(raced).await;
            }
            Some(_) => {}
        }

        info!(
            target: "sfu.transports",
            peer_id = %peer_id,
            transport_id = %transport_id,
            router_id = %router_id,
            direction = %direction,
            channel = %channel,
            "Transport created"
        );
        self.refresh_gauges().await;
        Ok(parameters)
    }

    /// Connect a transport.
    ///
    /// Already connected transports succeed without another negotiation, and
    /// concurrent calls share one engine connect.
    #[instrument(skip_all, name = "sfu.transports.connect", fields(transport_id = %transport_id))]
    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        let record = self
            .transports
            .get(transport_id)
            .await
            .filter(|r| r.peer_id == peer_id)
            .ok_or_else(|| SfuError::InvalidTransport(transport_id.to_string()))?;
        if record.state == TransportState::Connected {
            return Ok(());
        }

        let cell = Arc::clone(
            self.transports
                .pending_connects
                .lock()
                .await
                .entry(transport_id)
                .or_insert_with(|| Arc::new(OnceCell::new())),
        );

        // The state is settled inside the shared future, so a caller arriving
        // after the ledger entry is removed sees `Connected` and returns early.
        let outcome = cell
            .get_or_init(|| async {
                self.transports
                    .set_state(transport_id, TransportState::Connecting)
                    .await;
                let result = self
                    .engine
                    .connect_transport(transport_id, dtls_parameters)
                    .await;
                let settled = if result.is_ok() {
                    TransportState::Connected
                } else {
                    TransportState::Created
                };
                self.transports.set_state(transport_id, settled).await;
                result
            })
            .await
            .clone();

        {
            let mut pending = self.transports.pending_connects.lock().await;
            if pending
                .get(&transport_id)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                pending.remove(&transport_id);
            }
        }

        match outcome {
            Ok(()) => {
                debug!(target: "sfu.transports", transport_id = %transport_id, "Transport connected");
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "sfu.transports",
                    transport_id = %transport_id,
                    error = %e,
                    "Transport connect failed"
                );
                Err(SfuError::Engine(e))
            }
        }
    }

    /// Close a transport requested by its owner. Unknown ids are not an error.
    pub async fn close_peer_transport(&self, peer_id: PeerId, transport_id: TransportId) -> bool {
        match self.transports.get(transport_id).await {
            Some(record) if record.peer_id == peer_id => self.close_transport(transport_id).await,
            _ => false,
        }
    }

    /// Close a transport and everything bound to it. Returns false if it was
    /// already gone.
    pub async fn close_transport(&self, transport_id: TransportId) -> bool {
        let Some(mut record) = self.transports.remove(transport_id).await else {
            return false;
        };

        for producer_id in self.media.producers_on_transport(transport_id).await {
            self.close_producer_cascade(producer_id).await;
        }
        for consumer_id in self.media.consumers_on_transport(transport_id).await {
            self.close_consumer_cascade(consumer_id, false).await;
        }
        for data_producer_id in self.media.data_producers_on_transport(transport_id).await {
            self.close_data_producer_cascade(data_producer_id).await;
        }
        for data_consumer_id in self.media.data_consumers_on_transport(transport_id).await {
            self.close_data_consumer_cascade(data_consumer_id).await;
        }

        if let Err(e) = self.engine.close_transport(transport_id).await {
            debug!(
                target: "sfu.transports",
                transport_id = %transport_id,
                error = %e,
                "Engine transport already gone"
            );
        }

        self.peers
            .update(record.peer_id, |peer| {
                peer.transports.retain(|_, id| *id != transport_id);
            })
            .await;

        record.state = TransportState::Closed;
        info!(
            target: "sfu.transports",
            transport_id = %transport_id,
            peer_id = %record.peer_id,
            direction = %record.direction,
            channel = %record.channel,
            state = ?record.state,
            "Transport closed"
        );
        self.refresh_gauges().await;
        true
    }

    pub async fn transport(&self, transport_id: TransportId) -> Option<TransportRecord> {
        self.transports.get(transport_id).await
    }
}
