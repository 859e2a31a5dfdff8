//! Session configuration.

use std::time::Duration;

use url::Url;

use crate::buffer::MAX_CACHED_BUFFERS;
use crate::connection::ConnectionSettings;
use crate::error::ConfigError;

pub const ENV_WS_URL: &str = "FOLIO_WS_URL";
pub const ENV_API_URL: &str = "FOLIO_API_URL";
pub const ENV_MAX_BUFFERS: &str = "FOLIO_MAX_BUFFERS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "FOLIO_SWEEP_INTERVAL_SECS";
pub const ENV_JOIN_FALLBACK_MS: &str = "FOLIO_JOIN_FALLBACK_MS";
pub const ENV_HEARTBEAT_SECS: &str = "FOLIO_HEARTBEAT_SECS";

/// Collaboration session configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Realtime endpoint (`ws://` or `wss://`)
    pub ws_url: String,
    /// REST base URL
    pub api_url: String,
    /// Buffer cap enforced by each sweep
    pub max_buffers: usize,
    /// Eviction sweep period
    pub sweep_interval: Duration,
    /// How long a join waits for an ack or broadcast before assuming success
    pub join_fallback: Duration,
    /// Ping period while connected (zero disables)
    pub heartbeat_interval: Duration,
    /// Capacity of the offline update queue
    pub offline_queue_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8080/ws".to_string(),
            api_url: "http://127.0.0.1:8080/api/".to_string(),
            max_buffers: MAX_CACHED_BUFFERS,
            sweep_interval: Duration::from_secs(30),
            join_fallback: Duration::from_millis(600),
            heartbeat_interval: Duration::from_secs(25),
            offline_queue_capacity: 10_000,
        }
    }
}

impl CollabConfig {
    /// Defaults overridden by `FOLIO_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_WS_URL) {
            config.ws_url = url;
        }
        if let Some(url) = lookup(ENV_API_URL) {
            config.api_url = url;
        }
        if let Some(value) = lookup(ENV_MAX_BUFFERS) {
            config.max_buffers = parse_number(ENV_MAX_BUFFERS, &value)?;
        }
        if let Some(value) = lookup(ENV_SWEEP_INTERVAL_SECS) {
            config.sweep_interval = Duration::from_secs(parse_number(ENV_SWEEP_INTERVAL_SECS, &value)?);
        }
        if let Some(value) = lookup(ENV_JOIN_FALLBACK_MS) {
            config.join_fallback = Duration::from_millis(parse_number(ENV_JOIN_FALLBACK_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_HEARTBEAT_SECS) {
            config.heartbeat_interval = Duration::from_secs(parse_number(ENV_HEARTBEAT_SECS, &value)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check URL schemes and non-zero periods.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url(ENV_WS_URL, &self.ws_url, &["ws", "wss"])?;
        check_url(ENV_API_URL, &self.api_url, &["http", "https"])?;
        if self.max_buffers == 0 {
            return Err(ConfigError::InvalidNumber {
                var: ENV_MAX_BUFFERS,
                value: "0".into(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidNumber {
                var: ENV_SWEEP_INTERVAL_SECS,
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            endpoint: self.ws_url.clone(),
            join_fallback: self.join_fallback,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: value.to_string(),
    })
}

fn check_url(var: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        var,
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            var,
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}
