use crate::error::BusError;
use serde::{Deserialize, Serialize};

/// Endpoint for one subsystem side-channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelEndpoint {
    /// `host:port` of the subsystem's bus listener.
    pub address: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

impl ChannelEndpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

/// The two side-channel endpoints. Both must be configured when the
/// controller builds its own TCP channels; tests wire channels in directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ChannelEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamics: Option<ChannelEndpoint>,
}

impl ChannelsConfig {
    pub fn any_configured(&self) -> bool {
        self.reasoning.is_some() || self.dynamics.is_some()
    }
}

/// Bus configuration. Validated synchronously before anything starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    /// Capacity of each of the four per-priority queues.
    #[serde(default = "default_message_queue_size")]
    pub message_queue_size: usize,
    /// Messages removed per priority class per processing tick.
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,
    /// Connection attempts before `connect()` raises a terminal error.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for linear backoff: attempt N waits `retry_delay_ms * N`.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Bound for one handler invocation and for context request/response.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_process_interval_ms")]
    pub process_interval_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

fn default_message_queue_size() -> usize {
    1000
}
fn default_drain_batch_size() -> usize {
    10
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_process_interval_ms() -> u64 {
    100
}
fn default_sync_interval_ms() -> u64 {
    30_000
}
fn default_health_check_interval_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_io_timeout_ms() -> u64 {
    5000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            message_queue_size: default_message_queue_size(),
            drain_batch_size: default_drain_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            process_interval_ms: default_process_interval_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            channels: ChannelsConfig::default(),
        }
    }
}

impl BusConfig {
    /// Validate numeric bounds. Endpoint presence is checked separately by
    /// `Controller::new`, since tests wire channels in directly.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.message_queue_size == 0 {
            return Err(BusError::Config(
                "message_queue_size must be greater than 0".into(),
            ));
        }
        if self.drain_batch_size == 0 {
            return Err(BusError::Config(
                "drain_batch_size must be greater than 0".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(BusError::Config("timeout_ms must be greater than 0".into()));
        }
        if self.process_interval_ms == 0 {
            return Err(BusError::Config(
                "process_interval_ms must be greater than 0".into(),
            ));
        }
        if self.sync_interval_ms == 0 {
            return Err(BusError::Config(
                "sync_interval_ms must be greater than 0".into(),
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(BusError::Config(
                "health_check_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(BusConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_queue_size_is_rejected() {
        let config = BusConfig {
            message_queue_size: 0,
            ..BusConfig::default()
        };
        let error = config.validate().expect_err("zero queue size must fail");
        assert!(matches!(error, BusError::Config(_)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = BusConfig {
            timeout_ms: 0,
            ..BusConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults_filled_in() {
        let config: BusConfig =
            serde_json::from_str(r#"{"channels":{"reasoning":{"address":"127.0.0.1:7401"}}}"#)
                .expect("parse config");
        assert_eq!(config.message_queue_size, 1000);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.sync_interval_ms, 30_000);
        let reasoning = config.channels.reasoning.expect("reasoning endpoint");
        assert_eq!(reasoning.address, "127.0.0.1:7401");
        assert_eq!(reasoning.connect_timeout_ms, 5000);
    }

    #[test]
    fn no_channels_means_none_configured() {
        assert!(!BusConfig::default().channels.any_configured());
    }
}
