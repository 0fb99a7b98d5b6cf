//! Hub configuration
//!
//! Every tunable of the hub with its default. Durations are stored as
//! whole seconds and exposed through `Duration` accessors.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Hub and connection settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Connections allowed per origin IP within one rate window
    pub max_connections_per_origin: u32,
    /// Rate window length in seconds
    pub rate_window_secs: u64,
    /// Outbound frames buffered per client before it is dropped
    pub client_queue_size: usize,
    /// Depth of the command queue feeding the hub loop
    pub command_queue_size: usize,
    /// Idle time after which a client is evicted, in seconds
    pub inactivity_timeout_secs: u64,
    /// How often the hub scans for idle clients, in seconds
    pub cleanup_interval_secs: u64,
    /// Ping interval, in seconds
    pub heartbeat_interval_secs: u64,
    /// Time allowed between inbound frames (pongs included), in seconds
    pub read_deadline_secs: u64,
    /// Time allowed for a single outbound frame to be written, in seconds
    pub write_wait_secs: u64,
    /// Largest inbound frame accepted, in bytes
    pub max_frame_size: usize,
    /// How long `offline` presence records are kept, in seconds
    pub presence_retention_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections_per_origin: 50,
            rate_window_secs: 5 * 60,
            client_queue_size: 256,
            command_queue_size: 1024,
            inactivity_timeout_secs: 10 * 60,
            cleanup_interval_secs: 2 * 60,
            heartbeat_interval_secs: 30,
            read_deadline_secs: 60,
            write_wait_secs: 10,
            max_frame_size: 512 * 1024,
            presence_retention_secs: 24 * 60 * 60,
        }
    }
}

impl HubConfig {
    /// Reject values that would stall or disable the hub
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_connections_per_origin", self.max_connections_per_origin as u64),
            ("rate_window_secs", self.rate_window_secs),
            ("client_queue_size", self.client_queue_size as u64),
            ("command_queue_size", self.command_queue_size as u64),
            ("inactivity_timeout_secs", self.inactivity_timeout_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("read_deadline_secs", self.read_deadline_secs),
            ("write_wait_secs", self.write_wait_secs),
            ("max_frame_size", self.max_frame_size as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.read_deadline_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::DeadlineTooShort {
                deadline: self.read_deadline_secs,
                heartbeat: self.heartbeat_interval_secs,
            });
        }
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn presence_retention(&self) -> Duration {
        Duration::from_secs(self.presence_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.max_connections_per_origin, 50);
        assert_eq!(config.rate_window(), Duration::from_secs(300));
        assert_eq!(config.client_queue_size, 256);
        assert_eq!(config.inactivity_timeout(), Duration::from_secs(600));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(120));
        assert_eq!(config.write_wait(), Duration::from_secs(10));
        assert_eq!(config.max_frame_size, 524_288);
        assert_eq!(config.presence_retention(), Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HubConfig = serde_json::from_str(r#"{"client_queue_size": 8}"#).unwrap();
        assert_eq!(config.client_queue_size, 8);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = HubConfig {
            client_queue_size: 0,
            ..HubConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("client_queue_size"))
        ));
    }

    #[test]
    fn test_validate_rejects_short_deadline() {
        let config = HubConfig {
            heartbeat_interval_secs: 30,
            read_deadline_secs: 30,
            ..HubConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DeadlineTooShort { .. })
        ));
    }
}
