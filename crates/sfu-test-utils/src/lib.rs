//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU orchestrator.
//!
//! ## Modules
//!
//! - `fixtures` - Canned negotiation payloads and user profiles
//! - `harness` - `TestSession` (session on the in-memory engine) and
//!   `ScriptedPeer` (a peer driven through the signaling handler that records
//!   every response and push it receives)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let test = TestSession::builder().workers(2).build().await;
//!     let alice = test.connect("alice").await;
//!     let bob = test.connect("bob").await;
//!
//!     alice.join().await;
//!     let send = alice.create_transport("send", "instance", None).await;
//!     let producer_id = alice.send_track(&send, "cam", "instance", None).await;
//!
//!     let push = bob.wait_for_push(|p| matches!(p, ServerPush::ProducerAvailable(_))).await;
//! }
//! ```

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;
pub use sfu_orchestrator::signaling::messages::{ResponseEnvelope, ServerMessage, ServerPush};
