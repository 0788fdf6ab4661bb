//! SFU Orchestrator error types.
//!
//! Error types map to signaling error codes for client responses.
//! Engine and internal details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use thiserror::Error;

/// SFU Orchestrator error type.
///
/// Maps to signaling error codes:
/// - `InvalidRequest`: `INVALID_REQUEST` (1)
/// - Not-found family: `NOT_FOUND` (4)
/// - `CannotConsume`: `CAPABILITY_MISMATCH` (5)
/// - Engine, worker and internal failures: `INTERNAL_ERROR` (6)
/// - `NoAvailableRouter`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum SfuError {
    /// No registered peer for the id (disconnected or never joined).
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Transport id is unknown or already closed.
    #[error("Invalid transport: {0}")]
    InvalidTransport(String),

    /// Producer id (or peer/tag/channel triple) is unknown.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Consumer id is unknown.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Data producer id is unknown.
    #[error("Data producer not found: {0}")]
    DataProducerNotFound(String),

    /// Router reported the receive capabilities incompatible with the producer.
    #[error("Cannot consume producer {0}")]
    CannotConsume(String),

    /// No router in the channel pool could be selected.
    #[error("No available router for channel {0}")]
    NoAvailableRouter(String),

    /// Malformed or incomplete request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Media engine call failed.
    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    /// A media worker terminated. Unrecoverable for the process.
    #[error("Media worker died: {0}")]
    WorkerDied(String),

    /// Internal error (channel failures, serialization).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::InvalidRequest(_) => 1, // INVALID_REQUEST
            SfuError::PeerNotFound(_)
            | SfuError::InvalidTransport(_)
            | SfuError::ProducerNotFound(_)
            | SfuError::ConsumerNotFound(_)
            | SfuError::DataProducerNotFound(_) => 4, // NOT_FOUND
            SfuError::CannotConsume(_) => 5,           // CAPABILITY_MISMATCH
            SfuError::Engine(_) | SfuError::WorkerDied(_) | SfuError::Internal(_) => 6, // INTERNAL_ERROR
            SfuError::NoAvailableRouter(_) => 7, // CAPACITY_EXCEEDED
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SfuError::PeerNotFound(_) => "Client no longer exists".to_string(),
            SfuError::InvalidTransport(_) => "Invalid transport".to_string(),
            SfuError::ProducerNotFound(_) => "Producer not found".to_string(),
            SfuError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            SfuError::DataProducerNotFound(_) => "Data producer not found".to_string(),
            SfuError::CannotConsume(_) => "Client cannot consume".to_string(),
            SfuError::NoAvailableRouter(_) => "Failed to find a router".to_string(),
            SfuError::InvalidRequest(msg) => msg.clone(),
            SfuError::Engine(_) | SfuError::WorkerDied(_) | SfuError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Short stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SfuError::PeerNotFound(_) => "peer_not_found",
            SfuError::InvalidTransport(_) => "invalid_transport",
            SfuError::ProducerNotFound(_) => "producer_not_found",
            SfuError::ConsumerNotFound(_) => "consumer_not_found",
            SfuError::DataProducerNotFound(_) => "data_producer_not_found",
            SfuError::CannotConsume(_) => "cannot_consume",
            SfuError::NoAvailableRouter(_) => "no_available_router",
            SfuError::InvalidRequest(_) => "invalid_request",
            SfuError::Engine(_) => "engine",
            SfuError::WorkerDied(_) => "worker_died",
            SfuError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            SfuError::InvalidRequest("no label".to_string()).error_code(),
            1
        );

        assert_eq!(SfuError::PeerNotFound("p".to_string()).error_code(), 4);
        assert_eq!(SfuError::InvalidTransport("t".to_string()).error_code(), 4);
        assert_eq!(SfuError::ProducerNotFound("p".to_string()).error_code(), 4);
        assert_eq!(SfuError::ConsumerNotFound("c".to_string()).error_code(), 4);
        assert_eq!(
            SfuError::DataProducerNotFound("d".to_string()).error_code(),
            4
        );

        assert_eq!(SfuError::CannotConsume("p".to_string()).error_code(), 5);

        assert_eq!(
            SfuError::Engine(EngineError::Failed("boom".to_string())).error_code(),
            6
        );
        assert_eq!(SfuError::WorkerDied("w".to_string()).error_code(), 6);
        assert_eq!(SfuError::Internal("x".to_string()).error_code(), 6);

        assert_eq!(
            SfuError::NoAvailableRouter("instance".to_string()).error_code(),
            7
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = SfuError::Engine(EngineError::Failed("dtls handshake on fd 17".to_string()));
        assert_eq!(err.client_message(), "An internal error occurred");
        assert!(!err.client_message().contains("fd 17"));

        let err = SfuError::Internal("channel send failed: closed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_client_messages_for_caller_errors() {
        assert_eq!(
            SfuError::PeerNotFound("peer-1".to_string()).client_message(),
            "Client no longer exists"
        );
        assert_eq!(
            SfuError::CannotConsume("producer-1".to_string()).client_message(),
            "Client cannot consume"
        );
        assert_eq!(
            SfuError::NoAvailableRouter("instance".to_string()).client_message(),
            "Failed to find a router"
        );
        assert_eq!(
            SfuError::InvalidRequest("No data producer label".to_string()).client_message(),
            "No data producer label"
        );
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: SfuError = EngineError::NotFound {
            kind: "transport",
            id: "abc".to_string(),
        }
        .into();
        assert!(matches!(err, SfuError::Engine(_)));
        assert_eq!(err.kind(), "engine");
    }

    #[test]
    fn test_error_display() {
        let err = SfuError::InvalidTransport("t-1".to_string());
        assert_eq!(format!("{err}"), "Invalid transport: t-1");

        let err = SfuError::NoAvailableRouter("chat:42".to_string());
        assert_eq!(format!("{err}"), "No available router for channel chat:42");
    }
}
