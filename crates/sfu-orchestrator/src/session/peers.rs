//! Peer registry.
//!
//! Authoritative map of connected peers. Also keeps the user -> `userIndex`
//! table, which outlives individual peers so a reconnecting user is given the
//! index they had before.

use crate::signaling::connection::ConnectionHandle;
use crate::types::{
    ChannelKey, ConsumerId, DataConsumerId, DataProducerId, Direction, PeerId, ProducerId,
    TransportId, UserId,
};
use crate::world::UserProfile;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Index of the first user and the first peer.
const FIRST_INDEX: u64 = 1;

/// State of one produced media track on the owning peer.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSlot {
    pub producer_id: ProducerId,
    pub paused: bool,
    pub global_mute: bool,
    pub encodings: Option<Value>,
}

/// Layer selection for one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerLayers {
    /// Last layer reported active by the engine.
    pub current_layer: Option<u8>,
    /// Last layer requested by the client.
    pub client_selected_layer: Option<u8>,
}

/// One connected peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub user_index: u64,
    pub peer_index: u64,
    pub profile: UserProfile,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: Instant,
    /// At most one transport per (direction, channel).
    pub transports: HashMap<(Direction, ChannelKey), TransportId>,
    /// At most one producer per (media tag, channel).
    pub media: HashMap<(String, ChannelKey), MediaSlot>,
    pub consumer_layers: HashMap<ConsumerId, ConsumerLayers>,
    /// Keyed by data channel label.
    pub data_producers: HashMap<String, DataProducerId>,
    /// Keyed by data channel label.
    pub data_consumers: HashMap<String, DataConsumerId>,
    /// Consumer of the server's broadcast data producer.
    pub broadcast_consumer: Option<DataConsumerId>,
    pub connection: ConnectionHandle,
    /// Cancelled when the peer is removed. Work tied to the peer derives child tokens.
    pub cancel_token: CancellationToken,
}

impl Peer {
    #[must_use]
    pub fn transport_for(&self, direction: Direction, channel: &ChannelKey) -> Option<TransportId> {
        self.transports.get(&(direction, channel.clone())).copied()
    }

    #[must_use]
    pub fn media_slot(&self, media_tag: &str, channel: &ChannelKey) -> Option<&MediaSlot> {
        self.media.get(&(media_tag.to_string(), channel.clone()))
    }
}

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<PeerId, Peer>,
    user_indexes: HashMap<UserId, u64>,
    next_user_index: u64,
    next_peer_index: u64,
}

/// Registry of connected peers.
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                next_user_index: FIRST_INDEX,
                next_peer_index: FIRST_INDEX,
                ..RegistryInner::default()
            }),
        }
    }

    /// Register a new peer.
    ///
    /// The user index is taken from a live peer of the same user if one
    /// exists (old and new connections can briefly overlap), then from the
    /// user index table, and only then freshly allocated.
    pub async fn register(
        &self,
        peer_id: PeerId,
        profile: UserProfile,
        connection: ConnectionHandle,
        cancel_token: CancellationToken,
    ) -> Peer {
        let mut inner = self.inner.write().await;

        let user_id = profile.user_id.clone();
        let existing = inner
            .peers
            .values()
            .find(|p| p.user_id == user_id)
            .map(|p| p.user_index);
        let user_index = match existing.or_else(|| inner.user_indexes.get(&user_id).copied()) {
            Some(index) => index,
            None => {
                let index = inner.next_user_index;
                inner.next_user_index += 1;
                index
            }
        };
        let peer_index = inner.next_peer_index;
        inner.next_peer_index += 1;
        inner.user_indexes.insert(user_id.clone(), user_index);

        let peer = Peer {
            peer_id,
            user_id,
            user_index,
            peer_index,
            profile,
            joined_at: Utc::now(),
            last_seen_at: Instant::now(),
            transports: HashMap::new(),
            media: HashMap::new(),
            consumer_layers: HashMap::new(),
            data_producers: HashMap::new(),
            data_consumers: HashMap::new(),
            broadcast_consumer: None,
            connection,
            cancel_token,
        };
        inner.peers.insert(peer_id, peer.clone());

        debug!(
            target: "sfu.peers",
            peer_id = %peer_id,
            user_index = user_index,
            peer_index = peer_index,
            "Peer registered"
        );
        peer
    }

    pub async fn find(&self, peer_id: PeerId) -> Option<Peer> {
        self.inner.read().await.peers.get(&peer_id).cloned()
    }

    pub async fn contains(&self, peer_id: PeerId) -> bool {
        self.inner.read().await.peers.contains_key(&peer_id)
    }

    /// Most recently registered live peer of a user.
    pub async fn find_by_user(&self, user_id: &UserId) -> Option<Peer> {
        self.inner
            .read()
            .await
            .peers
            .values()
            .filter(|p| &p.user_id == user_id)
            .max_by_key(|p| p.peer_index)
            .cloned()
    }

    /// Index previously assigned to a user, whether or not they are connected.
    pub async fn user_index(&self, user_id: &UserId) -> Option<u64> {
        self.inner.read().await.user_indexes.get(user_id).copied()
    }

    /// Record liveness. Returns false if the peer is unknown.
    pub async fn touch(&self, peer_id: PeerId) -> bool {
        match self.inner.write().await.peers.get_mut(&peer_id) {
            Some(peer) => {
                peer.last_seen_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a peer. Its user index stays reserved for the user.
    pub async fn remove(&self, peer_id: PeerId) -> Option<Peer> {
        let removed = self.inner.write().await.peers.remove(&peer_id);
        if removed.is_some() {
            debug!(target: "sfu.peers", peer_id = %peer_id, "Peer removed");
        }
        removed
    }

    /// Mutate a peer in place. Returns `None` if the peer no longer exists.
    pub async fn update<R>(&self, peer_id: PeerId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        self.inner.write().await.peers.get_mut(&peer_id).map(f)
    }

    /// Snapshot of all peers, ordered by peer index.
    pub async fn all(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.inner.read().await.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.peer_index);
        peers
    }

    /// Connection handles of all peers except `except`.
    pub async fn connections_except(&self, except: Option<PeerId>) -> Vec<ConnectionHandle> {
        self.inner
            .read()
            .await
            .peers
            .values()
            .filter(|p| Some(p.peer_id) != except)
            .map(|p| p.connection.clone())
            .collect()
    }

    /// Peers not seen within `timeout`.
    pub async fn stale_peers(&self, timeout: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen_at) > timeout)
            .map(|p| p.peer_id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.peers.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::connection::ConnectionActor;
    use tokio::sync::mpsc;

    fn profile(user: &str) -> UserProfile {
        UserProfile {
            user_id: UserId::from(user),
            name: user.to_string(),
            avatar: None,
        }
    }

    async fn register(registry: &PeerRegistry, user: &str) -> Peer {
        let peer_id = PeerId::new();
        let (tx, _rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let (handle, _task) = ConnectionActor::spawn(peer_id, tx, token.clone());
        registry.register(peer_id, profile(user), handle, token).await
    }

    #[tokio::test]
    async fn test_indexes_are_monotonic() {
        let registry = PeerRegistry::new();
        let a = register(&registry, "alice").await;
        let b = register(&registry, "bob").await;

        assert_eq!(a.user_index, 1);
        assert_eq!(b.user_index, 2);
        assert_eq!(a.peer_index, 1);
        assert_eq!(b.peer_index, 2);
    }

    #[tokio::test]
    async fn test_reconnect_reuses_user_index() {
        let registry = PeerRegistry::new();
        let first = register(&registry, "alice").await;
        register(&registry, "bob").await;
        registry.remove(first.peer_id).await.unwrap();

        let again = register(&registry, "alice").await;
        assert_eq!(again.user_index, first.user_index);
        assert_ne!(again.peer_index, first.peer_index);
        assert_eq!(
            registry.user_index(&UserId::from("alice")).await,
            Some(first.user_index)
        );
    }

    #[tokio::test]
    async fn test_overlapping_connections_share_user_index() {
        let registry = PeerRegistry::new();
        let old = register(&registry, "alice").await;
        let new = register(&registry, "alice").await;

        assert_eq!(old.user_index, new.user_index);
        let found = registry.find_by_user(&UserId::from("alice")).await.unwrap();
        assert_eq!(found.peer_id, new.peer_id);
    }

    #[tokio::test]
    async fn test_update_missing_peer_returns_none() {
        let registry = PeerRegistry::new();
        assert!(registry.update(PeerId::new(), |_| ()).await.is_none());
        assert!(!registry.touch(PeerId::new()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_peers_after_timeout() {
        let registry = PeerRegistry::new();
        let quiet = register(&registry, "quiet").await;
        let chatty = register(&registry, "chatty").await;

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(registry.touch(chatty.peer_id).await);
        tokio::time::advance(Duration::from_secs(15)).await;

        let stale = registry.stale_peers(Duration::from_secs(30)).await;
        assert_eq!(stale, vec![quiet.peer_id]);
    }
}
