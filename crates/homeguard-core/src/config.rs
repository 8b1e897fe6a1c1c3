//! Client configuration.
//!
//! Loaded from `~/.homeguard/config.json` when present, otherwise defaults,
//! then overridden by `HOMEGUARD_*` environment variables.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_API_BASE_URL: &str = "https://api.simplisafe.com/v1";
pub const DEFAULT_REALTIME_URL: &str = "wss://api.simplisafe.com/v1/realtime";
pub const DEFAULT_APP_VERSION: &str = "1.62.0";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_6) \
    AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.1.2 Safari/605.1.15";

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    pub transport: TransportConfig,
    pub auth: AuthConfig,
    pub realtime: RealtimeConfig,
}

/// HTTP settings shared by the token endpoint and REST calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

/// Login and token lifetime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Stable client identifier. A fresh UUID is generated per process when
    /// unset, which means MFA must be approved again on every run.
    pub client_id: Option<String>,
    pub app_version: String,
    /// Subtracted from the declared `expires_in` of every issued token.
    pub expiry_skew_secs: u64,
    /// Interval between MFA completion polls in interactive flows.
    pub mfa_poll_interval_secs: u64,
}

/// Push-event connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub url: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each reconnect delay.
    pub reconnect_jitter_ms: u64,
    /// Credentials expiring within this margin are refreshed before a
    /// handshake, and the live socket re-authenticates this long before expiry.
    pub refresh_margin_secs: u64,
    pub handshake_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            app_version: DEFAULT_APP_VERSION.to_string(),
            expiry_skew_secs: 60,
            mfa_poll_interval_secs: 5,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_jitter_ms: 500,
            refresh_margin_secs: 120,
            handshake_timeout_secs: 10,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn api_base_url(&self) -> CoreResult<Url> {
        Url::parse(&self.api_base_url).map_err(CoreError::from)
    }
}

impl AuthConfig {
    pub fn expiry_skew(&self) -> Duration {
        Duration::from_secs(self.expiry_skew_secs)
    }

    pub fn mfa_poll_interval(&self) -> Duration {
        Duration::from_secs(self.mfa_poll_interval_secs)
    }
}

impl RealtimeConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn reconnect_jitter(&self) -> Duration {
        Duration::from_millis(self.reconnect_jitter_ms)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Config {
    /// Load from the config file if it exists, then apply environment
    /// overrides and validate.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `HOMEGUARD_*` overrides from an arbitrary lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(level) = lookup("HOMEGUARD_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(url) = lookup("HOMEGUARD_API_URL") {
            self.transport.api_base_url = url;
        }
        if let Some(secs) = lookup("HOMEGUARD_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.transport.request_timeout_secs = secs;
        }
        if let Some(client_id) = lookup("HOMEGUARD_CLIENT_ID") {
            self.auth.client_id = Some(client_id);
        }
        if let Some(url) = lookup("HOMEGUARD_REALTIME_URL") {
            self.realtime.url = url;
        }
    }

    /// Reject settings that would break the client at runtime.
    pub fn validate(&self) -> CoreResult<()> {
        self.transport.api_base_url()?;
        Url::parse(&self.realtime.url)?;

        if self.transport.request_timeout_secs == 0 {
            return Err(CoreError::Config(
                "transport.request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.realtime.reconnect_base_delay_ms == 0 {
            return Err(CoreError::Config(
                "realtime.reconnect_base_delay_ms must be positive".to_string(),
            ));
        }
        if self.realtime.reconnect_base_delay_ms > self.realtime.reconnect_max_delay_ms {
            return Err(CoreError::Config(format!(
                "realtime.reconnect_base_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                self.realtime.reconnect_base_delay_ms, self.realtime.reconnect_max_delay_ms
            )));
        }
        Ok(())
    }
}
