//! SFU Orchestrator Library
//!
//! Session orchestration for a selective forwarding media relay. The media
//! engine moves the packets; this crate decides which peer gets which
//! transport on which router, which producer is piped where, and who consumes
//! what:
//!
//! - Peer registry with stable per-user indexes across reconnects
//! - Per-channel router pools with least-loaded router selection
//! - Transport lifecycle with deduplicated connects and explicit close cascades
//! - Producer/consumer registry with piping across every router of a pool
//! - Per-resource FIFO queue for pause/resume
//! - Server data bridge for broadcast and inbound data
//! - `JoinWorld` protocol with spawn-near-inviter
//!
//! # Architecture
//!
//! ```text
//! signaling::server (WebSocket, one per peer)
//! └── signaling::handler (one task per request)
//!     └── Session (Arc, owns every registry)
//!         ├── PeerRegistry
//!         ├── RouterPoolManager ── MediaEngine
//!         ├── TransportLedger
//!         ├── MediaRegistry
//!         ├── OperationQueue
//!         └── DataBridge
//! tasks (engine event pump, liveness sweep)
//! ```
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine seam and the in-process engine
//! - [`errors`] - Error types with signaling error codes
//! - [`session`] - Session context and its registries
//! - [`signaling`] - Wire messages, connection actors, dispatch, WebSocket endpoint
//! - [`world`] - Simulation-layer and directory collaborators

pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod session;
pub mod signaling;
pub mod tasks;
pub mod types;
pub mod world;
