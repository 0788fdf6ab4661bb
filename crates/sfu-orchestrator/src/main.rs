//! SFU Orchestrator
//!
//! Session orchestration service for a selective forwarding media relay.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3030, `/signaling`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Create the media engine and subscribe to its events
//! 4. Start the session (workers, instance routers, data bridge)
//! 5. Start health HTTP server and mark ready
//! 6. Start signaling server, liveness sweep and engine event pump
//! 7. Wait for shutdown signal or a media worker death
//!
//! A media worker death is fatal: readiness and liveness are cleared and the
//! process exits with an error so outer orchestration restarts it.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sfu_orchestrator::config::Config;
use sfu_orchestrator::engine::{InMemoryEngine, MediaEngine};
use sfu_orchestrator::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_orchestrator::session::{Session, SessionSettings};
use sfu_orchestrator::signaling::{signaling_router, SignalingHandler};
use sfu_orchestrator::tasks::{run_engine_event_pump, run_liveness_sweep};
use sfu_orchestrator::world::memory::{InMemoryDirectory, InMemoryWorld};
use sfu_orchestrator::world::SessionDirectory;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for in-flight requests after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU Orchestrator");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        worker_count = config.worker_count,
        channel_instance = config.is_channel_instance,
        heartbeat_timeout_seconds = config.heartbeat_timeout_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let engine = Arc::new(InMemoryEngine::new());
    // Subscribed before any worker exists so no worker event is missed.
    let engine_events = engine.subscribe();

    let directory: Arc<dyn SessionDirectory> = if config.allow_anonymous {
        Arc::new(InMemoryDirectory::anonymous())
    } else {
        Arc::new(InMemoryDirectory::new())
    };
    let world = Arc::new(InMemoryWorld::new(chrono::Utc::now().timestamp_millis()));

    let session = Session::start(
        SessionSettings::from_config(&config),
        engine,
        world,
        Arc::clone(&directory),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start session");
        e
    })?;
    let shutdown_token = session.cancel_token().child_token();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    let signaling_app = signaling_router(
        SignalingHandler::new(Arc::clone(&session)),
        Arc::clone(&directory),
    )
    .layer(tower_http::trace::TraceLayer::new_for_http());

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    tokio::spawn(run_liveness_sweep(
        Arc::clone(&session),
        config.liveness_sweep_interval(),
        config.heartbeat_timeout(),
        shutdown_token.child_token(),
    ));

    let mut event_pump = tokio::spawn(run_engine_event_pump(
        Arc::clone(&session),
        engine_events,
        shutdown_token.child_token(),
    ));

    health_state.set_ready();
    info!("SFU Orchestrator running - press Ctrl+C to shutdown");

    let outcome = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            Ok(())
        }
        result = &mut event_pump => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "Media worker lost, exiting");
                health_state.set_worker_lost();
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Engine event pump task failed");
                health_state.set_worker_lost();
                Err(sfu_orchestrator::errors::SfuError::Internal(format!(
                    "engine event pump failed: {e}"
                )))
            }
        },
    };

    // Mark as not ready immediately so no new traffic is routed here
    health_state.set_not_ready();
    session.shutdown().await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("SFU Orchestrator shutdown complete");
    outcome.map_err(Into::into)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
