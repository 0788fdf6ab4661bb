//! Request dispatch.
//!
//! Each request runs on its own task so a slow engine call never blocks the
//! peer's other requests. Pause/resume requests are the exception: they are
//! enqueued on the operation queue before the next frame is read, so their
//! application order matches arrival order.
//!
//! Every `SfuError` is converted into an error response here and logged with
//! the request type.

use super::connection::ConnectionHandle;
use super::messages::{
    decode_request, ClientRequest, ClosedResponse, ConnectedResponse, ErrorBody, IdResponse,
    InitializedResponse, LayersSetResponse, LeftResponse, PausedResponse, RejectedFrame,
    RequestedResponse, ResponseEnvelope, ResumedResponse, ServerPush,
};

use crate::errors::SfuError;
use crate::observability::metrics;
use crate::session::{DisconnectReason, PendingOperation, ProduceData, ProduceMedia, Session};
use crate::types::{ChannelKey, PeerId};

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Wire type used when a rejected frame carried none.
const UNKNOWN_REQUEST_TYPE: &str = "Unknown";

fn body<T: Serialize>(value: &T) -> Result<Value, SfuError> {
    serde_json::to_value(value)
        .map_err(|e| SfuError::Internal(format!("response serialization failed: {e}")))
}

/// Turns signaling frames into session operations.
#[derive(Clone)]
pub struct SignalingHandler {
    session: Arc<Session>,
}

impl SignalingHandler {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Handle one inbound text frame from `peer_id`.
    ///
    /// Returns once the request is dispatched, not once it is answered.
    pub async fn handle_frame(&self, peer_id: PeerId, connection: &ConnectionHandle, text: &str) {
        let started = Instant::now();
        let (id, request) = match decode_request(text) {
            Ok(decoded) => decoded,
            Err(rejected) => {
                self.reject(connection, rejected).await;
                return;
            }
        };
        let request_type = request.type_name();

        if matches!(request, ClientRequest::Heartbeat) {
            if !self.session.heartbeat(peer_id).await {
                debug!(target: "sfu.signaling", peer_id = %peer_id, "Heartbeat from unknown peer");
            }
            metrics::record_signaling_request(request_type, "success", started.elapsed());
            return;
        }

        if request.is_ordered() {
            let enqueued = self.enqueue(peer_id, request).await;
            let connection = connection.clone();
            tokio::spawn(async move {
                let result = match enqueued {
                    Ok((pending, data)) => pending.applied().await.map(|()| data),
                    Err(e) => Err(e),
                };
                finish(&connection, id, request_type, started, result).await;
            });
            return;
        }

        let handler = self.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            let result = handler.dispatch(peer_id, request).await;
            finish(&connection, id, request_type, started, result).await;
        });
    }

    /// Run a request to completion and return its response body.
    pub async fn dispatch(&self, peer_id: PeerId, request: ClientRequest) -> Result<Value, SfuError> {
        let session = &self.session;
        match request {
            ClientRequest::JoinWorld(req) => body(&session.join_world(peer_id, req.invite_code).await?),
            ClientRequest::LeaveWorld => {
                session.disconnect_peer(peer_id, DisconnectReason::Left).await;
                body(&LeftResponse { left: true })
            }
            ClientRequest::Heartbeat => {
                session.heartbeat(peer_id).await;
                Ok(Value::Null)
            }
            ClientRequest::TransportCreate(req) => {
                let channel = ChannelKey::new(req.channel_type, req.channel_id);
                let parameters = session
                    .create_transport(peer_id, req.direction, channel, req.sctp_capabilities)
                    .await?;
                body(&parameters)
            }
            ClientRequest::TransportConnect(req) => {
                let connected = match session
                    .connect_transport(peer_id, req.transport_id, req.dtls_parameters)
                    .await
                {
                    Ok(()) => true,
                    Err(SfuError::Engine(e)) => {
                        warn!(
                            target: "sfu.signaling",
                            peer_id = %peer_id,
                            transport_id = %req.transport_id,
                            error = %e,
                            "Transport connect rejected by engine"
                        );
                        false
                    }
                    Err(e) => return Err(e),
                };
                body(&ConnectedResponse { connected })
            }
            ClientRequest::TransportClose(req) => {
                session.close_peer_transport(peer_id, req.transport_id).await;
                body(&ClosedResponse { closed: true })
            }
            ClientRequest::SendTrack(req) => {
                let producer_id = session
                    .produce_media(
                        peer_id,
                        ProduceMedia {
                            transport_id: req.transport_id,
                            kind: req.kind,
                            rtp_parameters: req.rtp_parameters,
                            paused: req.paused,
                            media_tag: req.app_data.media_tag,
                            channel: ChannelKey::new(req.app_data.channel_type, req.app_data.channel_id),
                        },
                    )
                    .await?;
                body(&IdResponse { id: producer_id.to_string() })
            }
            ClientRequest::ReceiveTrack(req) => {
                let channel = ChannelKey::new(req.channel_type, req.channel_id);
                let consumer = session
                    .consume_media(
                        peer_id,
                        req.media_peer_id,
                        &req.media_tag,
                        req.rtp_capabilities,
                        &channel,
                    )
                    .await?;
                body(&consumer)
            }
            ClientRequest::ProduceData(req) => {
                let data_producer_id = session
                    .produce_data(
                        peer_id,
                        ProduceData {
                            transport_id: req.transport_id,
                            label: req.label,
                            protocol: req.protocol,
                            sctp_stream_parameters: req.sctp_stream_parameters,
                        },
                    )
                    .await?;
                body(&IdResponse { id: data_producer_id.to_string() })
            }
            ClientRequest::CloseDataProducer(req) => {
                session.close_data_producer(peer_id, req.data_producer_id).await?;
                body(&ClosedResponse { closed: true })
            }
            ClientRequest::CloseConsumer(req) => {
                session.close_consumer(peer_id, req.consumer_id).await?;
                body(&ClosedResponse { closed: true })
            }
            ClientRequest::CloseProducer(req) => {
                session.close_producer(peer_id, req.producer_id).await?;
                body(&ClosedResponse { closed: true })
            }
            ClientRequest::ConsumerSetLayers(req) => {
                session
                    .set_consumer_layers(peer_id, req.consumer_id, req.spatial_layer)
                    .await?;
                body(&LayersSetResponse { layers_set: true })
            }
            ClientRequest::RequestCurrentProducers(req) => {
                let channel = ChannelKey::new(req.channel_type, req.channel_id);
                let announced = session
                    .request_current_producers(peer_id, req.user_ids.as_deref(), &channel)
                    .await?;
                debug!(target: "sfu.signaling", peer_id = %peer_id, announced = announced, "Current producers announced");
                body(&RequestedResponse { requested: true })
            }
            ClientRequest::InitializeRouter(req) => {
                let channel = ChannelKey::new(req.channel_type, req.channel_id);
                let initialized = session.initialize_router(&channel).await?;
                body(&InitializedResponse { initialized })
            }
            request @ (ClientRequest::PauseConsumer(_)
            | ClientRequest::ResumeConsumer(_)
            | ClientRequest::PauseProducer(_)
            | ClientRequest::ResumeProducer(_)) => {
                let (pending, data) = self.enqueue(peer_id, request).await?;
                pending.applied().await?;
                Ok(data)
            }
        }
    }

    /// Put a pause/resume request on the operation queue.
    ///
    /// Returns the pending operation and the response body to send once it is applied.
    async fn enqueue(
        &self,
        peer_id: PeerId,
        request: ClientRequest,
    ) -> Result<(PendingOperation, Value), SfuError> {
        let session = &self.session;
        match request {
            ClientRequest::PauseConsumer(req) => Ok((
                session.pause_consumer(peer_id, req.consumer_id).await?,
                body(&PausedResponse { paused: true })?,
            )),
            ClientRequest::ResumeConsumer(req) => Ok((
                session.resume_consumer(peer_id, req.consumer_id).await?,
                body(&ResumedResponse { resumed: true })?,
            )),
            ClientRequest::PauseProducer(req) => Ok((
                session
                    .pause_producer(peer_id, req.producer_id, req.global_mute)
                    .await?,
                body(&PausedResponse { paused: true })?,
            )),
            ClientRequest::ResumeProducer(req) => Ok((
                session.resume_producer(peer_id, req.producer_id).await?,
                body(&ResumedResponse { resumed: true })?,
            )),
            other => Err(SfuError::Internal(format!(
                "{} is not a queued request",
                other.type_name()
            ))),
        }
    }

    async fn reject(&self, connection: &ConnectionHandle, rejected: RejectedFrame) {
        let request_type = rejected
            .request_type
            .as_deref()
            .unwrap_or(UNKNOWN_REQUEST_TYPE);
        warn!(
            target: "sfu.signaling",
            peer_id = %connection.peer_id(),
            request_type = %request_type,
            error = %rejected.error,
            "Rejected signaling frame"
        );
        metrics::record_error(UNKNOWN_REQUEST_TYPE, rejected.error.kind());

        match rejected.id {
            Some(id) => {
                let response = ResponseEnvelope::err(id, request_type, &rejected.error);
                if let Err(e) = connection.respond(response).await {
                    debug!(target: "sfu.signaling", error = %e, "Could not deliver rejection");
                }
            }
            None => {
                connection.push(ServerPush::Error(ErrorBody::from(&rejected.error)));
            }
        }
    }
}

async fn finish(
    connection: &ConnectionHandle,
    id: String,
    request_type: &'static str,
    started: Instant,
    result: Result<Value, SfuError>,
) {
    let duration = started.elapsed();
    let response = match result {
        Ok(data) => {
            metrics::record_signaling_request(request_type, "success", duration);
            ResponseEnvelope::ok(id, request_type, data)
        }
        Err(e) => {
            warn!(
                target: "sfu.signaling",
                peer_id = %connection.peer_id(),
                request_type = request_type,
                error = %e,
                "Signaling request failed"
            );
            metrics::record_signaling_request(request_type, "error", duration);
            metrics::record_error(request_type, e.kind());
            ResponseEnvelope::err(id, request_type, &e)
        }
    };
    if let Err(e) = connection.respond(response).await {
        debug!(
            target: "sfu.signaling",
            peer_id = %connection.peer_id(),
            error = %e,
            "Response dropped, connection gone"
        );
    }
}
