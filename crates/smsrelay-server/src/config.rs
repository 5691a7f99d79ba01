//! Relay configuration.
//!
//! The one externally documented knob is `port` (default 8060); the status
//! page is always served on `port + 1`. The remaining fields are internal
//! tunables with defaults matching the service's historical constants, kept
//! configurable so tests can shrink the timing windows.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the server pair and its supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interface both listeners bind on.
    #[serde(default = "default_host")]
    pub host: String,

    /// Event channel port. The status responder always uses `port + 1`.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Period of the supervisor's health check.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Minimum gap between accepted connectivity-restored triggers.
    #[serde(default = "default_connectivity_throttle_ms")]
    pub connectivity_throttle_ms: u64,

    /// Upper bound on a single wait in the status accept loop, so a stop
    /// request is noticed promptly.
    #[serde(default = "default_status_accept_wait_ms")]
    pub status_accept_wait_ms: u64,

    /// Overall budget for reading one status request and writing its
    /// response.
    #[serde(default = "default_status_request_timeout_ms")]
    pub status_request_timeout_ms: u64,

    /// How long to wait for the status accept loop to exit on shutdown
    /// before abandoning it.
    #[serde(default = "default_status_join_timeout_ms")]
    pub status_join_timeout_ms: u64,

    /// How long to wait for the event server task to drain on shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Outbound queue capacity per subscriber; a subscriber that falls this
    /// far behind is treated as dead.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8060
}

fn default_heartbeat_interval_ms() -> u64 {
    60_000
}

fn default_connectivity_throttle_ms() -> u64 {
    5_000
}

fn default_status_accept_wait_ms() -> u64 {
    5_000
}

fn default_status_request_timeout_ms() -> u64 {
    10_000
}

fn default_status_join_timeout_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_send_queue_capacity() -> usize {
    256
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connectivity_throttle_ms: default_connectivity_throttle_ms(),
            status_accept_wait_ms: default_status_accept_wait_ms(),
            status_request_timeout_ms: default_status_request_timeout_ms(),
            status_join_timeout_ms: default_status_join_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

impl RelayConfig {
    /// Status responder port, always adjacent to the event port.
    pub fn status_port(&self) -> u16 {
        self.port.saturating_add(1)
    }

    /// Health check period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Connectivity trigger throttle window.
    pub fn connectivity_throttle(&self) -> Duration {
        Duration::from_millis(self.connectivity_throttle_ms)
    }

    /// Bound on one status accept wait.
    pub fn status_accept_wait(&self) -> Duration {
        Duration::from_millis(self.status_accept_wait_ms)
    }

    /// Per-request budget on the status port.
    pub fn status_request_timeout(&self) -> Duration {
        Duration::from_millis(self.status_request_timeout_ms)
    }

    /// Bound on joining the status accept loop at shutdown.
    pub fn status_join_timeout(&self) -> Duration {
        Duration::from_millis(self.status_join_timeout_ms)
    }

    /// Bound on draining the event server at shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = RelayConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8060);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.connectivity_throttle(), Duration::from_secs(5));
        assert_eq!(config.status_accept_wait(), Duration::from_secs(5));
        assert_eq!(config.status_request_timeout(), Duration::from_secs(10));
        assert_eq!(config.status_join_timeout(), Duration::from_secs(1));
        assert_eq!(config.send_queue_capacity, 256);
    }

    #[test]
    fn status_port_is_adjacent() {
        let config = RelayConfig::default();
        assert_eq!(config.status_port(), 8061);

        let config = RelayConfig {
            port: 9000,
            ..RelayConfig::default()
        };
        assert_eq!(config.status_port(), 9001);
    }

    #[test]
    fn deserializes_with_all_defaults() {
        let config: RelayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port, 8060);
        assert_eq!(config.heartbeat_interval_ms, 60_000);
    }

    #[test]
    fn deserializes_partial_override() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"port": 9100, "connectivity_throttle_ms": 250}"#).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.status_port(), 9101);
        assert_eq!(config.connectivity_throttle(), Duration::from_millis(250));
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn serde_round_trip() {
        let config = RelayConfig {
            port: 8070,
            send_queue_capacity: 32,
            ..RelayConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RelayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.port, 8070);
        assert_eq!(parsed.send_queue_capacity, 32);
    }
}
