//! Session context.
//!
//! A [`Session`] owns every registry of one service instance: peers, router
//! pools, transports, producers and consumers, the operation queue and the
//! data bridge. Signaling handlers and background tasks receive an
//! `Arc<Session>` and only mutate state through its operations.
//!
//! The operations live next to the registry they mutate:
//!
//! - [`transports`]: create/connect/close and the close cascade
//! - [`media`]: produce/consume, pause/resume, layers
//! - [`data_bridge`]: data producers and the server broadcast channel
//! - [`join`]: `JoinWorld` and spawn-near-inviter

pub mod data_bridge;
pub mod join;
pub mod media;
pub mod op_queue;
pub mod peers;
pub mod routers;
pub mod transports;

pub use data_bridge::{DataBridge, InboundMessage, ProduceData};
pub use join::SpawnOutcome;
pub use media::{ConsumerState, MediaCounts, MediaRegistry, ProduceMedia};
pub use op_queue::{OperationQueue, PendingOperation, QueuedResource};
pub use peers::{Peer, PeerRegistry};
pub use routers::RouterPoolManager;
pub use transports::{TransportLedger, TransportRecord, TransportState};

use crate::config::{
    Config, DEFAULT_HEARTBEAT_TIMEOUT_SECONDS, DEFAULT_INBOUND_QUEUE_CAPACITY,
    DEFAULT_INITIAL_OUTGOING_BITRATE, DEFAULT_MAX_INCOMING_BITRATE, DEFAULT_SPAWN_RETRY_ATTEMPTS,
    DEFAULT_SPAWN_RETRY_INTERVAL_MS,
};
use crate::engine::MediaEngine;
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::signaling::connection::ConnectionActor;
use crate::signaling::messages::{PeerListUpdate, PeerSummary, ServerMessage, ServerPush};
use crate::types::{ChannelKey, PeerId, TransportId};
use crate::world::{SessionDirectory, UserProfile, WorldState};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Tunables of a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub instance_id: String,
    /// Channel instances ignore invite codes.
    pub is_channel_instance: bool,
    pub worker_count: usize,
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
    pub inbound_queue_capacity: usize,
    pub spawn_retry_attempts: u32,
    pub spawn_retry_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            instance_id: "sfu-local".to_string(),
            is_channel_instance: false,
            worker_count: 1,
            max_incoming_bitrate: DEFAULT_MAX_INCOMING_BITRATE,
            initial_available_outgoing_bitrate: DEFAULT_INITIAL_OUTGOING_BITRATE,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            spawn_retry_attempts: DEFAULT_SPAWN_RETRY_ATTEMPTS,
            spawn_retry_interval: Duration::from_millis(DEFAULT_SPAWN_RETRY_INTERVAL_MS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECONDS),
        }
    }
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            is_channel_instance: config.is_channel_instance,
            worker_count: config.worker_count,
            max_incoming_bitrate: config.max_incoming_bitrate,
            initial_available_outgoing_bitrate: config.initial_available_outgoing_bitrate,
            inbound_queue_capacity: config.inbound_queue_capacity,
            spawn_retry_attempts: config.spawn_retry_attempts,
            spawn_retry_interval: config.spawn_retry_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }
}

/// Why a peer left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The signaling connection closed.
    Closed,
    /// The client sent `LeaveWorld`. The connection stays open.
    Left,
    /// No heartbeat within the timeout.
    Expired,
}

impl DisconnectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::Left => "left",
            DisconnectReason::Expired => "expired",
        }
    }
}

/// Every registry of one service instance.
pub struct Session {
    settings: SessionSettings,
    engine: Arc<dyn MediaEngine>,
    world: Arc<dyn WorldState>,
    directory: Arc<dyn SessionDirectory>,
    peers: PeerRegistry,
    routers: RouterPoolManager,
    transports: TransportLedger,
    media: MediaRegistry,
    queue: OperationQueue,
    data: DataBridge,
    started_at: DateTime<Utc>,
    cancel_token: CancellationToken,
    /// Revision of the last peer list broadcast. Held while broadcasting.
    peer_list_revision: Mutex<u64>,
}

impl Session {
    /// Create the workers, the instance pool and the data bridge.
    pub async fn start(
        settings: SessionSettings,
        engine: Arc<dyn MediaEngine>,
        world: Arc<dyn WorldState>,
        directory: Arc<dyn SessionDirectory>,
    ) -> Result<Arc<Self>, SfuError> {
        let routers = RouterPoolManager::start(Arc::clone(&engine), settings.worker_count).await?;
        let data = DataBridge::start(
            engine.as_ref(),
            &routers.instance_pool(),
            settings.inbound_queue_capacity,
        )
        .await?;

        info!(
            target: "sfu.session",
            instance_id = %settings.instance_id,
            workers = routers.workers().len(),
            channel_instance = settings.is_channel_instance,
            "Session started"
        );

        Ok(Arc::new(Self {
            settings,
            engine,
            world,
            directory,
            peers: PeerRegistry::new(),
            routers,
            transports: TransportLedger::new(),
            media: MediaRegistry::new(),
            queue: OperationQueue::new(),
            data,
            started_at: Utc::now(),
            cancel_token: CancellationToken::new(),
            peer_list_revision: Mutex::new(0),
        }))
    }

    /// Register an authenticated connection as a new peer.
    ///
    /// Spawns the peer's connection actor writing to `outbound`.
    pub async fn connect_peer(
        &self,
        profile: UserProfile,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Peer {
        let peer_id = PeerId::new();
        let (connection, _task) =
            ConnectionActor::spawn(peer_id, outbound, self.cancel_token.child_token());
        let peer = self
            .peers
            .register(
                peer_id,
                profile.clone(),
                connection,
                self.cancel_token.child_token(),
            )
            .await;

        self.world.publish_profile(peer.user_index, &profile).await;
        self.directory
            .post_notification(&format!("{} joined", profile.name))
            .await;

        info!(
            target: "sfu.session",
            peer_id = %peer_id,
            user_id = %peer.user_id,
            user_index = peer.user_index,
            "Peer connected"
        );
        self.refresh_gauges().await;
        peer
    }

    /// Remove a peer and close everything it owns.
    ///
    /// Returns false if the peer was already gone.
    pub async fn disconnect_peer(&self, peer_id: PeerId, reason: DisconnectReason) -> bool {
        let Some(peer) = self.peers.remove(peer_id).await else {
            return false;
        };
        // In-flight work for the peer observes this and stops.
        peer.cancel_token.cancel();

        let mut owned: Vec<TransportId> = peer.transports.values().copied().collect();
        for transport_id in self.transports.for_peer(peer_id).await {
            if !owned.contains(&transport_id) {
                owned.push(transport_id);
            }
        }
        for transport_id in owned {
            self.close_transport(transport_id).await;
        }

        if reason == DisconnectReason::Expired {
            if let Err(e) = peer.connection.close("heartbeat timeout".to_string()).await {
                debug!(target: "sfu.session", peer_id = %peer_id, error = %e, "Connection already closed");
            }
        }

        self.directory
            .post_notification(&format!("{} left", peer.profile.name))
            .await;
        self.broadcast_peer_list().await;

        info!(
            target: "sfu.session",
            peer_id = %peer_id,
            user_id = %peer.user_id,
            reason = reason.as_str(),
            "Peer disconnected"
        );
        self.refresh_gauges().await;
        true
    }

    /// Record a heartbeat. Returns false for unknown peers.
    pub async fn heartbeat(&self, peer_id: PeerId) -> bool {
        self.peers.touch(peer_id).await
    }

    /// Send the full peer list to every peer.
    ///
    /// Broadcasts are serialized, so every peer sees revisions in order.
    pub async fn broadcast_peer_list(&self) {
        let mut revision = self.peer_list_revision.lock().await;
        *revision += 1;

        let peers = self.peers.all().await;
        let update = PeerListUpdate {
            revision: *revision,
            peers: peers
                .iter()
                .map(|p| PeerSummary {
                    peer_id: p.peer_id,
                    user_id: p.user_id.clone(),
                    user_index: p.user_index,
                    peer_index: p.peer_index,
                })
                .collect(),
        };
        for peer in &peers {
            peer.connection.push(ServerPush::PeerList(update.clone()));
        }
        debug!(target: "sfu.session", revision = *revision, peers = peers.len(), "Peer list broadcast");
    }

    pub(crate) async fn require_peer(&self, peer_id: PeerId) -> Result<Peer, SfuError> {
        self.peers
            .find(peer_id)
            .await
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))
    }

    async fn refresh_gauges(&self) {
        let counts = self.media.counts().await;
        metrics::set_peers_active(self.peers.len().await);
        metrics::set_transports_active(self.transports.len().await);
        metrics::set_producers_active(counts.producers);
        metrics::set_consumers_active(counts.consumers);
    }

    /// Re-check engine state that events would have reported.
    ///
    /// Fails with `WorkerDied` if any worker is gone. Transports the engine
    /// no longer holds are closed with the full cascade; returns how many.
    pub async fn reconcile_with_engine(&self) -> Result<usize, SfuError> {
        for worker_id in self.routers.workers() {
            if !self.engine.worker_alive(*worker_id).await? {
                return Err(SfuError::WorkerDied(format!(
                    "{worker_id}: found dead while reconciling"
                )));
            }
        }

        let mut closed = 0;
        for transport_id in self.transports.ids().await {
            if !self.engine.transport_alive(transport_id).await?
                && self.close_transport(transport_id).await
            {
                closed += 1;
            }
        }
        info!(target: "sfu.session", closed_transports = closed, "Reconciled with engine");
        Ok(closed)
    }

    /// Create the router pool of a channel ahead of its first transport.
    pub async fn initialize_router(&self, channel: &ChannelKey) -> Result<bool, SfuError> {
        self.routers.pool_for(channel).await?;
        Ok(true)
    }

    /// Disconnect every peer and stop background work.
    pub async fn shutdown(&self) {
        for peer in self.peers.all().await {
            self.disconnect_peer(peer.peer_id, DisconnectReason::Closed)
                .await;
        }
        self.cancel_token.cancel();
        info!(target: "sfu.session", "Session shut down");
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    #[must_use]
    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    #[must_use]
    pub fn routers(&self) -> &RouterPoolManager {
        &self.routers
    }

    #[must_use]
    pub fn transports(&self) -> &TransportLedger {
        &self.transports
    }

    #[must_use]
    pub fn media(&self) -> &MediaRegistry {
        &self.media
    }

    #[must_use]
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    #[must_use]
    pub fn data_bridge(&self) -> &DataBridge {
        &self.data
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Parent of every peer and connection token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}
