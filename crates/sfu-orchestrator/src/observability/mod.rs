//! Observability for the SFU orchestrator.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Negotiation payloads (SDP-derived parameters) are never logged.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sfu_peers_active` | Gauge | none |
//! | `sfu_transports_active` | Gauge | none |
//! | `sfu_producers_active` | Gauge | none |
//! | `sfu_consumers_active` | Gauge | none |
//! | `sfu_signaling_request_duration_seconds` | Histogram | `request_type`, `status` |
//! | `sfu_signaling_requests_total` | Counter | `request_type`, `status` |
//! | `sfu_errors_total` | Counter | `request_type`, `error_type` |
//! | `sfu_pushes_dropped_total` | Counter | none |
//! | `sfu_router_selections_total` | Counter | `channel` |
//! | `sfu_queue_operation_duration_seconds` | Histogram | `resource` |
//! | `sfu_inbound_data_dropped_total` | Counter | none |
//! | `sfu_spawn_near_inviter_total` | Counter | `outcome` |
//! | `sfu_peers_expired_total` | Counter | none |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
