//! Configuration for the Ingestion Service

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IngestionError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Storage
    #[serde(default = "default_base_folder")]
    pub base_folder: PathBuf,
    #[serde(default = "default_roster_path")]
    pub roster_path: PathBuf,

    // Deduplication (pull mode)
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    #[serde(default = "default_directory_limit")]
    pub directory_limit: u32,

    // Pacing (milliseconds / seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,

    // Supervisor restart backoff
    #[serde(default = "default_restart_initial_backoff")]
    pub restart_initial_backoff_ms: u64,
    #[serde(default = "default_restart_max_backoff")]
    pub restart_max_backoff_secs: u64,

    // Rotation
    #[serde(default = "default_true")]
    pub archive_enabled: bool,
    #[serde(default = "default_true")]
    pub hourly_tally: bool,

    // HTTP
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // Metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub metrics_enabled: bool,
}

fn default_base_folder() -> PathBuf {
    PathBuf::from("./data")
}

fn default_roster_path() -> PathBuf {
    PathBuf::from("./servers.json")
}

fn default_dedup_window() -> usize {
    160 // two directory pages of 80
}

fn default_directory_limit() -> u32 {
    80 // directory endpoint maximum
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_reconnect_backoff() -> u64 {
    10
}

fn default_stream_idle_timeout() -> u64 {
    90 // servers send a heartbeat comment well within this
}

fn default_restart_initial_backoff() -> u64 {
    500
}

fn default_restart_max_backoff() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_requests() -> usize {
    64
}

fn default_request_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    "curl/7.68.0".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_folder: default_base_folder(),
            roster_path: default_roster_path(),
            dedup_window: default_dedup_window(),
            directory_limit: default_directory_limit(),
            poll_interval_ms: default_poll_interval(),
            reconnect_backoff_secs: default_reconnect_backoff(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            restart_initial_backoff_ms: default_restart_initial_backoff(),
            restart_max_backoff_secs: default_restart_max_backoff(),
            archive_enabled: true,
            hourly_tally: true,
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
            metrics_port: default_metrics_port(),
            metrics_enabled: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Rejects settings that would make a worker spin or never dedup
    pub fn validate(&self) -> Result<()> {
        if self.dedup_window == 0 {
            return Err(IngestionError::ConfigError("DEDUP_WINDOW must be at least 1".into()));
        }
        if self.directory_limit == 0 {
            return Err(IngestionError::ConfigError("DIRECTORY_LIMIT must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(IngestionError::ConfigError("POLL_INTERVAL_MS must be at least 1".into()));
        }
        if self.stream_idle_timeout_secs == 0 {
            return Err(IngestionError::ConfigError(
                "STREAM_IDLE_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(IngestionError::ConfigError(
                "MAX_CONCURRENT_REQUESTS must be at least 1".into(),
            ));
        }
        if self.restart_initial_backoff_ms > self.restart_max_backoff_secs.saturating_mul(1000) {
            return Err(IngestionError::ConfigError(
                "RESTART_INITIAL_BACKOFF_MS exceeds RESTART_MAX_BACKOFF_SECS".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn restart_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_initial_backoff_ms)
    }

    pub fn restart_max_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_max_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();

        assert_eq!(config.base_folder, PathBuf::from("./data"));
        assert_eq!(config.dedup_window, 160);
        assert_eq!(config.directory_limit, 80);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(10));
        assert!(config.archive_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = Config {
            dedup_window: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = Config {
            restart_initial_backoff_ms: 120_000,
            restart_max_backoff_secs: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
