//! Session harness for integration tests.
//!
//! `TestSession` starts a full session on the in-memory engine and world.
//! `ScriptedPeer` connects through `Session::connect_peer` and sends requests
//! as JSON frames through the `SignalingHandler`, exactly as the WebSocket
//! layer would, so decoding and dispatch are exercised too.

use crate::fixtures;

use serde_json::{json, Value};
use sfu_orchestrator::engine::{ConsumerInfo, InMemoryEngine, TransportParameters};
use sfu_orchestrator::session::{DisconnectReason, Peer, Session, SessionSettings};
use sfu_orchestrator::signaling::messages::{ResponseEnvelope, ServerMessage, ServerPush};
use sfu_orchestrator::signaling::{ConnectionHandle, SignalingHandler};
use sfu_orchestrator::types::{
    ConsumerId, DataProducerId, PeerId, ProducerId, TransportId, UserId,
};
use sfu_orchestrator::world::memory::{InMemoryDirectory, InMemoryWorld};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// How long a scripted peer waits for an expected message.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Outbound buffer of a scripted peer.
const OUTBOUND_BUFFER: usize = 256;

/// Builder for [`TestSession`].
///
/// # Example
///
/// ```rust,ignore
/// let test = TestSession::builder()
///     .workers(3)
///     .channel_instance()
///     .build()
///     .await;
/// ```
pub struct TestSessionBuilder {
    settings: SessionSettings,
    directory: InMemoryDirectory,
    start_time: i64,
}

impl Default for TestSessionBuilder {
    fn default() -> Self {
        Self {
            settings: SessionSettings {
                instance_id: "test-instance".to_string(),
                spawn_retry_interval: Duration::from_millis(100),
                ..SessionSettings::default()
            },
            directory: InMemoryDirectory::anonymous(),
            start_time: 1_700_000_000_000,
        }
    }
}

impl TestSessionBuilder {
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.settings.worker_count = count;
        self
    }

    /// Run as a channel instance (invite codes ignored).
    #[must_use]
    pub fn channel_instance(mut self) -> Self {
        self.settings.is_channel_instance = true;
        self
    }

    #[must_use]
    pub fn instance_id(mut self, instance_id: &str) -> Self {
        self.settings.instance_id = instance_id.to_string();
        self
    }

    #[must_use]
    pub fn spawn_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.settings.spawn_retry_attempts = attempts;
        self.settings.spawn_retry_interval = interval;
        self
    }

    #[must_use]
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.settings.inbound_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.settings.heartbeat_timeout = timeout;
        self
    }

    #[must_use]
    pub fn world_start_time(mut self, start_time: i64) -> Self {
        self.start_time = start_time;
        self
    }

    /// Use a directory that only accepts registered tokens.
    #[must_use]
    pub fn with_directory(mut self, directory: InMemoryDirectory) -> Self {
        self.directory = directory;
        self
    }

    /// Start the session.
    ///
    /// # Panics
    ///
    /// Panics if the session fails to start.
    pub async fn build(self) -> TestSession {
        let engine = Arc::new(InMemoryEngine::new());
        let world = Arc::new(InMemoryWorld::new(self.start_time));
        let directory = Arc::new(self.directory);
        let session = Session::start(
            self.settings,
            engine.clone(),
            world.clone(),
            directory.clone(),
        )
        .await
        .expect("session should start");
        TestSession {
            handler: SignalingHandler::new(Arc::clone(&session)),
            session,
            engine,
            world,
            directory,
        }
    }
}

/// A running session plus direct access to its in-memory collaborators.
pub struct TestSession {
    pub session: Arc<Session>,
    pub engine: Arc<InMemoryEngine>,
    pub world: Arc<InMemoryWorld>,
    pub directory: Arc<InMemoryDirectory>,
    pub handler: SignalingHandler,
}

impl TestSession {
    #[must_use]
    pub fn builder() -> TestSessionBuilder {
        TestSessionBuilder::default()
    }

    /// Session with default settings.
    pub async fn start() -> Self {
        Self::builder().build().await
    }

    /// Connect a peer for `user` (profile from [`fixtures::profile`]).
    pub async fn connect(&self, user: &str) -> ScriptedPeer {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let peer = self.session.connect_peer(fixtures::profile(user), tx).await;
        ScriptedPeer {
            peer_id: peer.peer_id,
            user_id: peer.user_id.clone(),
            user_index: peer.user_index,
            connection: peer.connection.clone(),
            handler: self.handler.clone(),
            session: Arc::clone(&self.session),
            next_id: AtomicU64::new(1),
            inbox: Mutex::new(Inbox {
                rx,
                responses: Vec::new(),
                pushes: Vec::new(),
                closed: false,
            }),
        }
    }
}

struct Inbox {
    rx: mpsc::Receiver<ServerMessage>,
    responses: Vec<ResponseEnvelope>,
    pushes: Vec<ServerPush>,
    closed: bool,
}

impl Inbox {
    fn store(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Response(response) => self.responses.push(response),
            ServerMessage::Push(push) => self.pushes.push(push),
        }
    }

    fn drain_ready(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.store(message);
        }
    }

    /// Receive one message, or `false` if the wait expired or the channel closed.
    async fn receive(&mut self, deadline: tokio::time::Instant) -> bool {
        if self.closed {
            return false;
        }
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(message)) => {
                self.store(message);
                true
            }
            Ok(None) => {
                self.closed = true;
                false
            }
            Err(_) => false,
        }
    }
}

/// A connected peer driven by the test.
///
/// Every response and push the peer receives is recorded. Pushes stay
/// recorded until [`ScriptedPeer::take_pushes`] is called.
pub struct ScriptedPeer {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub user_index: u64,
    pub connection: ConnectionHandle,
    handler: SignalingHandler,
    session: Arc<Session>,
    next_id: AtomicU64,
    inbox: Mutex<Inbox>,
}

impl ScriptedPeer {
    /// Send a raw text frame.
    pub async fn send_frame(&self, frame: &str) {
        self.handler
            .handle_frame(self.peer_id, &self.connection, frame)
            .await;
    }

    /// Send a request without waiting for its response. Returns the request id.
    pub async fn send(&self, request_type: &str, data: Value) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = json!({ "id": id, "type": request_type, "data": data }).to_string();
        self.send_frame(&frame).await;
        id
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, request_type: &str, data: Value) -> ResponseEnvelope {
        let id = self.send(request_type, data).await;
        self.response(&id).await
    }

    /// Send a request and return its response data.
    ///
    /// # Panics
    ///
    /// Panics if the response carries an error.
    pub async fn request_ok(&self, request_type: &str, data: Value) -> Value {
        let response = self.request(request_type, data).await;
        if let Some(error) = response.error {
            panic!("{request_type} failed: {} ({})", error.message, error.code);
        }
        response.data.unwrap_or(Value::Null)
    }

    /// Wait for the response to request `id`.
    ///
    /// # Panics
    ///
    /// Panics if no response arrives within [`DEFAULT_WAIT`].
    pub async fn response(&self, id: &str) -> ResponseEnvelope {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        let mut inbox = self.inbox.lock().await;
        loop {
            if let Some(position) = inbox.responses.iter().position(|r| r.id == id) {
                return inbox.responses.remove(position);
            }
            if !inbox.receive(deadline).await {
                panic!("no response to request {id} for peer {}", self.peer_id);
            }
        }
    }

    /// Wait for the first recorded push matching `predicate` and remove it.
    ///
    /// # Panics
    ///
    /// Panics if no matching push arrives within [`DEFAULT_WAIT`].
    pub async fn wait_for_push(&self, predicate: impl Fn(&ServerPush) -> bool) -> ServerPush {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        let mut inbox = self.inbox.lock().await;
        loop {
            if let Some(position) = inbox.pushes.iter().position(&predicate) {
                return inbox.pushes.remove(position);
            }
            if !inbox.receive(deadline).await {
                panic!("expected push never arrived for peer {}", self.peer_id);
            }
        }
    }

    /// Every push delivered so far, without removing them.
    pub async fn pushes(&self) -> Vec<ServerPush> {
        self.flush().await;
        let mut inbox = self.inbox.lock().await;
        inbox.drain_ready();
        inbox.pushes.clone()
    }

    /// Every push delivered so far, clearing the record.
    pub async fn take_pushes(&self) -> Vec<ServerPush> {
        self.flush().await;
        let mut inbox = self.inbox.lock().await;
        inbox.drain_ready();
        std::mem::take(&mut inbox.pushes)
    }

    /// Whether the connection actor closed the outbound channel.
    pub async fn is_closed(&self) -> bool {
        let mut inbox = self.inbox.lock().await;
        inbox.drain_ready();
        if !inbox.closed {
            inbox.closed = matches!(
                inbox.rx.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            );
        }
        inbox.closed
    }

    /// Wait until everything queued on the connection actor has been forwarded.
    pub async fn flush(&self) {
        // A closed actor has nothing left to forward.
        let _ = self.connection.ping().await;
    }

    /// Current registry entry of this peer.
    pub async fn snapshot(&self) -> Option<Peer> {
        self.session.peers().find(self.peer_id).await
    }

    /// Drop the peer as if its socket closed.
    pub async fn disconnect(&self) -> bool {
        self.session
            .disconnect_peer(self.peer_id, DisconnectReason::Closed)
            .await
    }

    // ------------------------------------------------------------------
    // Protocol shortcuts
    // ------------------------------------------------------------------

    pub async fn join(&self) -> Value {
        self.request_ok("JoinWorld", json!({})).await
    }

    pub async fn join_with_invite(&self, invite_code: &str) -> Value {
        self.request_ok("JoinWorld", json!({ "inviteCode": invite_code }))
            .await
    }

    /// Create a transport. `direction` is `send` or `recv`.
    ///
    /// # Panics
    ///
    /// Panics if creation fails.
    pub async fn create_transport(
        &self,
        direction: &str,
        channel_type: &str,
        channel_id: Option<&str>,
    ) -> TransportId {
        let data = self
            .request_ok(
                "TransportCreate",
                json!({
                    "direction": direction,
                    "channelType": channel_type,
                    "channelId": channel_id,
                    "sctpCapabilities": fixtures::sctp_capabilities(),
                }),
            )
            .await;
        let parameters: TransportParameters =
            serde_json::from_value(data).expect("transport parameters");
        parameters.id
    }

    /// Returns the `connected` flag of the response.
    pub async fn connect_transport(&self, transport_id: TransportId) -> bool {
        let data = self
            .request_ok(
                "TransportConnect",
                json!({
                    "transportId": transport_id,
                    "dtlsParameters": fixtures::dtls_parameters(),
                }),
            )
            .await;
        data["connected"].as_bool().unwrap_or(false)
    }

    /// Produce a simulcast video track into `media_tag`.
    ///
    /// # Panics
    ///
    /// Panics if the request fails.
    pub async fn send_track(
        &self,
        transport_id: TransportId,
        media_tag: &str,
        channel_type: &str,
        channel_id: Option<&str>,
    ) -> ProducerId {
        let response = self
            .request("SendTrack", send_track_data(transport_id, media_tag, channel_type, channel_id))
            .await;
        parse_id(&response)
    }

    /// Consume `media_tag` of `producer_peer`.
    ///
    /// # Panics
    ///
    /// Panics if the request fails.
    pub async fn receive_track(
        &self,
        producer_peer: PeerId,
        media_tag: &str,
        channel_type: &str,
        channel_id: Option<&str>,
    ) -> ConsumerInfo {
        let data = self
            .request_ok(
                "ReceiveTrack",
                json!({
                    "mediaPeerId": producer_peer,
                    "mediaTag": media_tag,
                    "rtpCapabilities": fixtures::rtp_capabilities(),
                    "channelType": channel_type,
                    "channelId": channel_id,
                }),
            )
            .await;
        serde_json::from_value(data).expect("consumer info")
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> ResponseEnvelope {
        self.request("ResumeConsumer", json!({ "consumerId": consumer_id }))
            .await
    }

    pub async fn pause_producer(&self, producer_id: ProducerId, global_mute: bool) -> ResponseEnvelope {
        self.request(
            "PauseProducer",
            json!({ "producerId": producer_id, "globalMute": global_mute }),
        )
        .await
    }

    /// Create a data producer labelled `label`.
    ///
    /// # Panics
    ///
    /// Panics if the request fails.
    pub async fn produce_data(&self, transport_id: TransportId, label: &str) -> DataProducerId {
        let response = self
            .request(
                "ProduceData",
                json!({
                    "transportId": transport_id,
                    "label": label,
                    "sctpStreamParameters": fixtures::sctp_stream_parameters(),
                }),
            )
            .await;
        parse_id(&response)
    }
}

/// `SendTrack` payload for a simulcast video track.
#[must_use]
pub fn send_track_data(
    transport_id: TransportId,
    media_tag: &str,
    channel_type: &str,
    channel_id: Option<&str>,
) -> Value {
    json!({
        "transportId": transport_id,
        "kind": "video",
        "rtpParameters": fixtures::video_rtp_parameters(),
        "appData": {
            "mediaTag": media_tag,
            "channelType": channel_type,
            "channelId": channel_id,
        }
    })
}

/// Parse the `id` of an `IdResponse`.
///
/// # Panics
///
/// Panics if the response is an error or carries no id.
pub fn parse_id<T>(response: &ResponseEnvelope) -> T
where
    T: serde::de::DeserializeOwned,
{
    if let Some(error) = &response.error {
        panic!("{} failed: {} ({})", response.request_type, error.message, error.code);
    }
    let id = response
        .data
        .as_ref()
        .and_then(|data| data.get("id"))
        .cloned()
        .expect("response carries an id");
    serde_json::from_value(id).expect("id parses")
}
