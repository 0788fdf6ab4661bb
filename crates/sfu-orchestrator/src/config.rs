//! SFU Orchestrator configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default; values that are present but unparsable are rejected.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3030";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default maximum incoming bitrate per transport (bits per second).
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;

/// Default initial available outgoing bitrate per transport (bits per second).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default capacity of the inbound data queue read by the simulation layer.
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Default time without a heartbeat before a peer is disconnected.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 30;

/// Default interval of the liveness sweep.
pub const DEFAULT_LIVENESS_SWEEP_INTERVAL_SECONDS: u64 = 5;

/// Default spawn-near-inviter attempts.
pub const DEFAULT_SPAWN_RETRY_ATTEMPTS: u32 = 100;

/// Default spawn-near-inviter retry interval.
pub const DEFAULT_SPAWN_RETRY_INTERVAL_MS: u64 = 50;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sfu";

/// SFU Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Signaling WebSocket bind address (default: "0.0.0.0:3030").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Identifier of this session instance, compared against inviter locations.
    pub instance_id: String,

    /// Whether this process hosts a side channel rather than a world instance.
    /// Channel instances skip the spawn-near-inviter step.
    pub is_channel_instance: bool,

    /// Number of media workers (default: available parallelism).
    pub worker_count: usize,

    /// Maximum incoming bitrate applied to every WebRTC transport.
    pub max_incoming_bitrate: u32,

    /// Initial available outgoing bitrate for every WebRTC transport.
    pub initial_available_outgoing_bitrate: u32,

    /// Capacity of the inbound data queue; oldest entries are dropped when full.
    pub inbound_queue_capacity: usize,

    /// Seconds without a heartbeat before a peer is disconnected.
    pub heartbeat_timeout_seconds: u64,

    /// Seconds between liveness sweeps.
    pub liveness_sweep_interval_seconds: u64,

    /// Spawn-near-inviter attempts before giving up.
    pub spawn_retry_attempts: u32,

    /// Milliseconds between spawn-near-inviter attempts.
    pub spawn_retry_interval_ms: u64,

    /// Accept signaling connections whose token is unknown to the directory,
    /// treating the token as the user id.
    pub allow_anonymous: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let default_workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let worker_count = parse_var(vars, "SFU_WORKER_COUNT", default_workers)?;
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SFU_WORKER_COUNT".to_string(),
                value: "0".to_string(),
            });
        }

        let inbound_queue_capacity = parse_var(
            vars,
            "SFU_INBOUND_QUEUE_CAPACITY",
            DEFAULT_INBOUND_QUEUE_CAPACITY,
        )?;
        if inbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SFU_INBOUND_QUEUE_CAPACITY".to_string(),
                value: "0".to_string(),
            });
        }

        let instance_id = vars.get("SFU_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            instance_id,
            is_channel_instance: parse_var(vars, "SFU_CHANNEL_INSTANCE", false)?,
            worker_count,
            max_incoming_bitrate: parse_var(
                vars,
                "SFU_MAX_INCOMING_BITRATE",
                DEFAULT_MAX_INCOMING_BITRATE,
            )?,
            initial_available_outgoing_bitrate: parse_var(
                vars,
                "SFU_INITIAL_OUTGOING_BITRATE",
                DEFAULT_INITIAL_OUTGOING_BITRATE,
            )?,
            inbound_queue_capacity,
            heartbeat_timeout_seconds: parse_var(
                vars,
                "SFU_HEARTBEAT_TIMEOUT_SECONDS",
                DEFAULT_HEARTBEAT_TIMEOUT_SECONDS,
            )?,
            liveness_sweep_interval_seconds: parse_var(
                vars,
                "SFU_LIVENESS_SWEEP_INTERVAL_SECONDS",
                DEFAULT_LIVENESS_SWEEP_INTERVAL_SECONDS,
            )?,
            spawn_retry_attempts: parse_var(
                vars,
                "SFU_SPAWN_RETRY_ATTEMPTS",
                DEFAULT_SPAWN_RETRY_ATTEMPTS,
            )?,
            spawn_retry_interval_ms: parse_var(
                vars,
                "SFU_SPAWN_RETRY_INTERVAL_MS",
                DEFAULT_SPAWN_RETRY_INTERVAL_MS,
            )?,
            allow_anonymous: parse_var(vars, "SFU_ALLOW_ANONYMOUS", true)?,
        })
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    #[must_use]
    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_sweep_interval_seconds)
    }

    #[must_use]
    pub fn spawn_retry_interval(&self) -> Duration {
        Duration::from_millis(self.spawn_retry_interval_ms)
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!(!config.is_channel_instance);
        assert!(config.worker_count >= 1);
        assert_eq!(config.max_incoming_bitrate, DEFAULT_MAX_INCOMING_BITRATE);
        assert_eq!(config.inbound_queue_capacity, DEFAULT_INBOUND_QUEUE_CAPACITY);
        assert_eq!(config.spawn_retry_attempts, DEFAULT_SPAWN_RETRY_ATTEMPTS);
        assert_eq!(config.spawn_retry_interval(), Duration::from_millis(50));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(30));
        assert!(config.allow_anonymous);
        // Instance ID should be auto-generated
        assert!(config.instance_id.starts_with("sfu-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            (
                "SFU_SIGNALING_BIND_ADDRESS".to_string(),
                "127.0.0.1:4000".to_string(),
            ),
            (
                "SFU_HEALTH_BIND_ADDRESS".to_string(),
                "127.0.0.1:8082".to_string(),
            ),
            ("SFU_INSTANCE_ID".to_string(), "instance-7".to_string()),
            ("SFU_CHANNEL_INSTANCE".to_string(), "true".to_string()),
            ("SFU_WORKER_COUNT".to_string(), "3".to_string()),
            ("SFU_MAX_INCOMING_BITRATE".to_string(), "900000".to_string()),
            ("SFU_INBOUND_QUEUE_CAPACITY".to_string(), "16".to_string()),
            ("SFU_SPAWN_RETRY_ATTEMPTS".to_string(), "10".to_string()),
            ("SFU_SPAWN_RETRY_INTERVAL_MS".to_string(), "20".to_string()),
            ("SFU_ALLOW_ANONYMOUS".to_string(), "false".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:4000");
        assert_eq!(config.health_bind_address, "127.0.0.1:8082");
        assert_eq!(config.instance_id, "instance-7");
        assert!(config.is_channel_instance);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.max_incoming_bitrate, 900_000);
        assert_eq!(config.inbound_queue_capacity, 16);
        assert_eq!(config.spawn_retry_attempts, 10);
        assert_eq!(config.spawn_retry_interval(), Duration::from_millis(20));
        assert!(!config.allow_anonymous);
    }

    #[test]
    fn test_invalid_numeric_value_is_rejected() {
        let vars = HashMap::from([("SFU_WORKER_COUNT".to_string(), "many".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "SFU_WORKER_COUNT")
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        let vars = HashMap::from([("SFU_WORKER_COUNT".to_string(), "0".to_string())]);
        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let vars = HashMap::from([("SFU_INBOUND_QUEUE_CAPACITY".to_string(), "0".to_string())]);
        assert!(Config::from_vars(&vars).is_err());
    }
}
