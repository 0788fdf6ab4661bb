//! `ConnectionActor`: owns the outbound half of one peer's signaling channel.
//!
//! Every response and push for a peer goes through its actor, so messages
//! reach the client in the order they were submitted. The actor forwards to
//! an `mpsc::Sender<ServerMessage>` supplied by the transport layer (the
//! WebSocket writer in production, a recorder in tests).
//!
//! # Lifecycle
//!
//! 1. Spawned when the peer is registered
//! 2. Runs until closed, cancelled, or the outbound channel is dropped
//! 3. Cancellation is a child of the session's token, so shutdown stops it

use crate::errors::SfuError;
use crate::observability::metrics;
use crate::types::PeerId;

use super::messages::{ResponseEnvelope, ServerMessage, ServerPush};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 256;

#[derive(Debug)]
enum ConnectionMessage {
    Send { message: ServerMessage },
    Close { reason: String },
    Ping { respond_to: oneshot::Sender<()> },
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
}

impl ConnectionHandle {
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Queue a request response, waiting for mailbox space.
    pub async fn respond(&self, response: ResponseEnvelope) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Send {
                message: ServerMessage::Response(response),
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// Queue a server push without waiting.
    ///
    /// Pushes are best-effort: if the mailbox is full or the actor is gone the
    /// push is dropped and `false` is returned.
    pub fn push(&self, push: ServerPush) -> bool {
        match self.sender.try_send(ConnectionMessage::Send {
            message: ServerMessage::Push(push),
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    target: "sfu.connection",
                    peer_id = %self.peer_id,
                    "Outbound mailbox full, dropping push"
                );
                metrics::record_push_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    target: "sfu.connection",
                    peer_id = %self.peer_id,
                    "Connection closed, dropping push"
                );
                false
            }
        }
    }

    /// Close the connection after flushing queued messages.
    pub async fn close(&self, reason: String) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// Round trip through the mailbox. Resolves once every earlier message was forwarded.
    pub async fn ping(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::Ping { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Per-peer outbound actor.
pub struct ConnectionActor {
    peer_id: PeerId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    outbound: mpsc::Sender<ServerMessage>,
    cancel_token: CancellationToken,
    messages_forwarded: u64,
}

impl ConnectionActor {
    /// Spawn a new connection actor writing to `outbound`.
    pub fn spawn(
        peer_id: PeerId,
        outbound: mpsc::Sender<ServerMessage>,
        cancel_token: CancellationToken,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        let actor = Self {
            peer_id,
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
            messages_forwarded: 0,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionHandle {
            sender,
            cancel_token,
            peer_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.connection", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(target: "sfu.connection", peer_id = %self.peer_id, "ConnectionActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.connection",
                        peer_id = %self.peer_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    if self.handle_message(message).await {
                        break;
                    }
                }
            }
        }

        info!(
            target: "sfu.connection",
            peer_id = %self.peer_id,
            messages_forwarded = self.messages_forwarded,
            "ConnectionActor stopped"
        );
    }

    /// Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { message } => {
                if self.outbound.send(message).await.is_err() {
                    debug!(
                        target: "sfu.connection",
                        peer_id = %self.peer_id,
                        "Outbound channel dropped"
                    );
                    return true;
                }
                self.messages_forwarded += 1;
                false
            }
            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "sfu.connection",
                    peer_id = %self.peer_id,
                    reason = %reason,
                    "Closing connection"
                );
                true
            }
            ConnectionMessage::Ping { respond_to } => {
                let _ = respond_to.send(());
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::messages::{ConsumerRef, ErrorBody};
    use crate::types::ConsumerId;
    use std::time::Duration;

    fn spawn_actor(
        capacity: usize,
    ) -> (
        ConnectionHandle,
        JoinHandle<()>,
        mpsc::Receiver<ServerMessage>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        let (handle, task) = ConnectionActor::spawn(PeerId::new(), tx, token.child_token());
        (handle, task, rx, token)
    }

    #[tokio::test]
    async fn test_messages_forwarded_in_order() {
        let (handle, _task, mut rx, _token) = spawn_actor(16);
        let first = ConsumerId::new();
        let second = ConsumerId::new();

        assert!(handle.push(ServerPush::ConsumerPaused(ConsumerRef { consumer_id: first })));
        handle
            .respond(ResponseEnvelope::ok(
                "1".to_string(),
                "PauseConsumer",
                serde_json::json!({"paused": true}),
            ))
            .await
            .unwrap();
        assert!(handle.push(ServerPush::ConsumerResumed(ConsumerRef { consumer_id: second })));
        handle.ping().await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Push(ServerPush::ConsumerPaused(c))) if c.consumer_id == first
        ));
        assert!(matches!(rx.recv().await, Some(ServerMessage::Response(r)) if r.id == "1"));
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Push(ServerPush::ConsumerResumed(c))) if c.consumer_id == second
        ));
    }

    #[tokio::test]
    async fn test_close_stops_actor() {
        let (handle, task, _rx, _token) = spawn_actor(4);
        handle.close("test close".to_string()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(!handle.push(ServerPush::Error(ErrorBody {
            code: 6,
            message: "late".to_string(),
        })));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_actor() {
        let (handle, task, _rx, parent) = spawn_actor(4);
        parent.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_outbound_stops_actor() {
        let (handle, task, rx, _token) = spawn_actor(4);
        drop(rx);
        handle
            .respond(ResponseEnvelope::ok(
                "1".to_string(),
                "Heartbeat",
                serde_json::Value::Null,
            ))
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
    }
}
