//! Session join protocol.
//!
//! `JoinWorld` answers with the peer's index, the instance router
//! capabilities, the server clock origin, the session start time and the
//! events the user missed. An invite code additionally starts a best-effort
//! spawn-near-inviter task that never delays the reply.

use super::Session;

use crate::errors::SfuError;
use crate::observability::metrics;
use crate::signaling::messages::JoinWorldResponse;
use crate::types::{PeerId, UserId};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How a spawn-near-inviter attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned,
    InviterNotFound,
    InviterElsewhere,
    GaveUp,
    Cancelled,
}

impl SpawnOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SpawnOutcome::Spawned => "spawned",
            SpawnOutcome::InviterNotFound => "inviter_not_found",
            SpawnOutcome::InviterElsewhere => "inviter_elsewhere",
            SpawnOutcome::GaveUp => "gave_up",
            SpawnOutcome::Cancelled => "cancelled",
        }
    }
}

impl Session {
    #[instrument(skip_all, name = "sfu.join", fields(peer_id = %peer_id))]
    pub async fn join_world(
        self: &Arc<Self>,
        peer_id: PeerId,
        invite_code: Option<String>,
    ) -> Result<JoinWorldResponse, SfuError> {
        let peer = self.require_peer(peer_id).await?;
        self.peers.touch(peer_id).await;

        let cached_actions = self.world.cached_events(&peer.user_id).await;
        let router_rtp_capabilities = self
            .routers
            .instance_pool()
            .first()
            .map(|router| router.rtp_capabilities.clone())
            .ok_or_else(|| SfuError::NoAvailableRouter("instance pool is empty".to_string()))?;
        #[allow(clippy::cast_precision_loss)]
        let high_res_time_origin = self.started_at.timestamp_micros() as f64 / 1000.0;
        let world_start_time = self.world.start_time().await;

        info!(
            target: "sfu.join",
            peer_id = %peer_id,
            user_index = peer.user_index,
            cached = cached_actions.len(),
            "Peer joined world"
        );
        self.broadcast_peer_list().await;

        if let Some(code) = invite_code.filter(|code| !code.is_empty()) {
            if self.settings.is_channel_instance {
                debug!(target: "sfu.join", "Invite codes are ignored on channel instances");
            } else {
                let session = Arc::clone(self);
                let cancel_token = peer.cancel_token.child_token();
                let user_id = peer.user_id.clone();
                tokio::spawn(async move {
                    session.spawn_near_inviter(user_id, code, cancel_token).await;
                });
            }
        }

        Ok(JoinWorldResponse {
            peer_index: peer.peer_index,
            peer_id,
            router_rtp_capabilities,
            high_res_time_origin,
            world_start_time,
            cached_actions,
        })
    }

    /// Move the user's avatar next to the inviter once both avatars exist.
    ///
    /// Retries on a fixed interval for a bounded number of attempts and
    /// stops early when `cancel_token` fires (the peer disconnected).
    #[instrument(skip_all, name = "sfu.join.spawn_near_inviter", fields(user_id = %user_id))]
    pub async fn spawn_near_inviter(
        &self,
        user_id: UserId,
        invite_code: String,
        cancel_token: CancellationToken,
    ) -> SpawnOutcome {
        let outcome = self
            .try_spawn_near_inviter(&user_id, &invite_code, &cancel_token)
            .await;
        metrics::record_spawn_outcome(outcome.as_str());
        match outcome {
            SpawnOutcome::GaveUp => warn!(
                target: "sfu.join",
                user_id = %user_id,
                attempts = self.settings.spawn_retry_attempts,
                "Gave up spawning near inviter"
            ),
            other => debug!(target: "sfu.join", user_id = %user_id, outcome = other.as_str(), "Spawn near inviter finished"),
        }
        outcome
    }

    async fn try_spawn_near_inviter(
        &self,
        user_id: &UserId,
        invite_code: &str,
        cancel_token: &CancellationToken,
    ) -> SpawnOutcome {
        let Some(inviter) = self.directory.find_inviter(invite_code).await else {
            return SpawnOutcome::InviterNotFound;
        };
        if inviter
            .instance_id
            .as_deref()
            .is_some_and(|instance| instance != self.settings.instance_id)
        {
            return SpawnOutcome::InviterElsewhere;
        }
        if &inviter.user_id == user_id {
            return SpawnOutcome::InviterNotFound;
        }

        for _ in 0..self.settings.spawn_retry_attempts {
            if cancel_token.is_cancelled() {
                return SpawnOutcome::Cancelled;
            }
            let ready = self.peers.find_by_user(&inviter.user_id).await.is_some()
                && self.world.avatar_spawned(user_id).await
                && self.world.avatar_spawned(&inviter.user_id).await;
            if ready && self.world.spawn_near(user_id, &inviter.user_id).await {
                info!(
                    target: "sfu.join",
                    user_id = %user_id,
                    inviter = %inviter.user_id,
                    "Spawned near inviter"
                );
                return SpawnOutcome::Spawned;
            }
            tokio::select! {
                () = cancel_token.cancelled() => return SpawnOutcome::Cancelled,
                () = tokio::time::sleep(self.settings.spawn_retry_interval) => {}
            }
        }
        SpawnOutcome::GaveUp
    }
}
