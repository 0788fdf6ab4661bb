//! Background tasks of a session.
//!
//! - [`run_engine_event_pump`]: applies engine-originated events. Returns an
//!   error when a media worker dies, which the binary treats as fatal. After
//!   missing events it reconciles the session with the engine instead.
//! - [`run_liveness_sweep`]: disconnects peers that stopped sending heartbeats.

use crate::engine::EngineEvent;
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::session::{DisconnectReason, Session};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Apply engine events until cancelled or a worker dies.
#[instrument(skip_all, name = "sfu.tasks.engine_events")]
pub async fn run_engine_event_pump(
    session: Arc<Session>,
    mut events: broadcast::Receiver<EngineEvent>,
    cancel_token: CancellationToken,
) -> Result<(), SfuError> {
    info!(target: "sfu.tasks", "Engine event pump started");
    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(EngineEvent::WorkerDied { worker_id, reason }) => {
                error!(
                    target: "sfu.tasks",
                    worker_id = %worker_id,
                    reason = %reason,
                    "Media worker died"
                );
                return Err(SfuError::WorkerDied(format!("{worker_id}: {reason}")));
            }
            Ok(EngineEvent::TransportClosed { transport_id }) => {
                if session.close_transport(transport_id).await {
                    info!(
                        target: "sfu.tasks",
                        transport_id = %transport_id,
                        "Transport closed by engine"
                    );
                }
            }
            Ok(EngineEvent::ConsumerLayersChanged {
                consumer_id,
                spatial_layer,
            }) => {
                session.record_layers_change(consumer_id, spatial_layer).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: "sfu.tasks", skipped = skipped, "Engine event pump lagged");
                metrics::record_engine_events_skipped(skipped);
                if let Err(e) = session.reconcile_with_engine().await {
                    error!(target: "sfu.tasks", error = %e, "Reconciliation after lag failed");
                    return Err(e);
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(target: "sfu.tasks", "Engine event channel closed");
                break;
            }
        }
    }
    info!(target: "sfu.tasks", "Engine event pump stopped");
    Ok(())
}

/// Periodically disconnect peers not seen within `timeout`.
#[instrument(skip_all, name = "sfu.tasks.liveness_sweep")]
pub async fn run_liveness_sweep(
    session: Arc<Session>,
    interval: Duration,
    timeout: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        target: "sfu.tasks",
        interval_ms = interval.as_millis(),
        timeout_ms = timeout.as_millis(),
        "Liveness sweep started"
    );

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                for peer_id in session.peers().stale_peers(timeout).await {
                    if session.disconnect_peer(peer_id, DisconnectReason::Expired).await {
                        metrics::record_peer_expired();
                        warn!(target: "sfu.tasks", peer_id = %peer_id, "Peer expired without heartbeat");
                    }
                }
            }
        }
    }

    info!(target: "sfu.tasks", "Liveness sweep stopped");
}
