//! Signaling surface.
//!
//! - [`messages`]: wire format of requests, responses and pushes
//! - [`connection`]: per-peer outbound actor
//! - [`handler`]: request dispatch into the session
//! - [`server`]: the `/signaling` WebSocket endpoint

pub mod connection;
pub mod handler;
pub mod messages;
pub mod server;

pub use connection::{ConnectionActor, ConnectionHandle};
pub use handler::SignalingHandler;
pub use server::signaling_router;
