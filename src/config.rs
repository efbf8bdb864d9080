//! Client configuration, loadable from a YAML file.
//!
//! Every field is optional in the file; durations use the humantime syntax
//! (`500ms`, `5s`, `5m`).
//!
//! ```yaml
//! host: 192.168.1.50
//! unit_id: 1
//! timeout: 2s
//! backoff_max: 10m
//! timers: [filtration1, light]
//! ```

use crate::connection::ConnectionSettings;
use crate::protocol as proto;
use crate::timer::TimerName;
use crate::tokio_async::Timing;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Protocol(#[from] proto::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub connect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    pub error_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub health_check_after: Duration,
    #[serde(with = "humantime_serde")]
    pub inter_request_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub command_delay: Duration,
    /// Quiet period before a debounced write is sent.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
    /// Timer blocks read by every cycle.
    pub timers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let connection = ConnectionSettings::default();
        let timing = Timing::default();
        Self {
            host: connection.host,
            port: connection.port,
            unit_id: connection.unit_id,
            timeout: connection.timeout,
            connect_attempts: connection.connect_attempts,
            retry_delay: connection.retry_delay,
            backoff_base: connection.backoff_base,
            backoff_max: connection.backoff_max,
            error_threshold: connection.error_threshold,
            health_check_after: connection.health_check_after,
            inter_request_delay: timing.inter_request_delay,
            command_delay: timing.command_delay,
            debounce: Duration::from_secs(1),
            timers: TimerName::ALL
                .iter()
                .map(|timer| timer.as_str().to_string())
                .collect(),
        }
    }
}

impl ClientConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "neopool.yaml";

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.timer_names()?;
        Ok(config)
    }

    pub fn timer_names(&self) -> Result<Vec<TimerName>, proto::Error> {
        self.timers.iter().map(|name| name.parse()).collect()
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            host: self.host.clone(),
            port: self.port,
            unit_id: self.unit_id,
            timeout: self.timeout,
            connect_attempts: self.connect_attempts,
            retry_delay: self.retry_delay,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
            error_threshold: self.error_threshold,
            health_check_after: self.health_check_after,
        }
    }

    pub fn timing(&self) -> Timing {
        Timing {
            inter_request_delay: self.inter_request_delay,
            command_delay: self.command_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 502);
        assert_eq!(config.unit_id, 1);
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.backoff_max, Duration::from_secs(300));
        assert_eq!(config.timer_names().unwrap(), TimerName::ALL.to_vec());
        assert_eq!(config.timing(), Timing::default());
    }

    #[test]
    fn partial_yaml() {
        let config = ClientConfig::from_yaml_str(
            "host: pool.local\ntimeout: 2s\nretry_delay: 250ms\nbackoff_max: 10m\ndebounce: 1500ms\ntimers: [Light, aux1]\n",
        )
        .unwrap();
        assert_eq!(config.host, "pool.local");
        assert_eq!(config.port, 502);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.backoff_max, Duration::from_secs(600));
        assert_eq!(config.debounce, Duration::from_millis(1500));
        assert_eq!(
            config.timer_names().unwrap(),
            [TimerName::Light, TimerName::Aux1]
        );

        let settings = config.connection_settings();
        assert_eq!(settings.host, "pool.local");
        assert_eq!(settings.timeout, Duration::from_secs(2));
        assert_eq!(settings.backoff_base, Duration::from_secs(5));
    }

    #[test]
    fn empty_document_is_default() {
        let config = ClientConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn rejects_bad_input() {
        assert_matches!(
            ClientConfig::from_yaml_str("timers: [pump9]"),
            Err(ConfigError::Protocol(proto::Error::UnknownTimer(_)))
        );
        assert_matches!(
            ClientConfig::from_yaml_str("timeout: soon"),
            Err(ConfigError::Yaml(_))
        );
        assert_matches!(
            ClientConfig::from_yaml_str("hostname: pool.local"),
            Err(ConfigError::Yaml(_))
        );
        assert_matches!(
            ClientConfig::from_file("/nonexistent/neopool.yaml"),
            Err(ConfigError::Io(_))
        );
    }
}
