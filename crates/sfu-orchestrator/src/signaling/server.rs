//! WebSocket signaling endpoint.
//!
//! `GET /signaling?token=...` authenticates the token through the session
//! directory, upgrades to a WebSocket and registers the connection as a peer.
//! Text frames are requests; the peer's connection actor feeds the outbound
//! half. When the socket ends the peer is disconnected.

use super::handler::SignalingHandler;
use super::messages::ServerMessage;

use crate::session::DisconnectReason;
use crate::world::{SessionDirectory, UserProfile};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Buffer between a connection actor and the socket writer.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Clone)]
struct SignalingState {
    handler: SignalingHandler,
    directory: Arc<dyn SessionDirectory>,
}

#[derive(Debug, Deserialize)]
struct SignalingQuery {
    token: Option<String>,
}

/// Router serving the signaling WebSocket.
pub fn signaling_router(handler: SignalingHandler, directory: Arc<dyn SessionDirectory>) -> Router {
    Router::new()
        .route("/signaling", get(signaling_upgrade))
        .with_state(SignalingState { handler, directory })
}

async fn signaling_upgrade(
    State(state): State<SignalingState>,
    Query(query): Query<SignalingQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = query.token.unwrap_or_default();
    let Some(profile) = state.directory.authenticate(&token).await else {
        warn!(target: "sfu.signaling", "Rejected signaling connection with invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    upgrade.on_upgrade(move |socket| serve_socket(socket, state.handler, profile))
}

#[instrument(skip_all, name = "sfu.signaling.socket", fields(user_id = %profile.user_id))]
async fn serve_socket(mut socket: WebSocket, handler: SignalingHandler, profile: UserProfile) {
    let session = Arc::clone(handler.session());
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);
    let peer = session.connect_peer(profile, outbound_tx).await;
    let peer_id = peer.peer_id;
    let connection = peer.connection;

    info!(target: "sfu.signaling", peer_id = %peer_id, "Signaling socket opened");

    loop {
        tokio::select! {
            () = session.cancel_token().cancelled() => break,
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    debug!(target: "sfu.signaling", peer_id = %peer_id, "Connection actor stopped");
                    break;
                };
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(target: "sfu.signaling", peer_id = %peer_id, error = %e, "Failed to encode message"),
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handler.handle_frame(peer_id, &connection, &text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(target: "sfu.signaling", peer_id = %peer_id, error = %e, "Socket error");
                        break;
                    }
                }
            }
        }
    }

    session
        .disconnect_peer(peer_id, DisconnectReason::Closed)
        .await;
    connection.cancel();
    info!(target: "sfu.signaling", peer_id = %peer_id, "Signaling socket closed");
}
