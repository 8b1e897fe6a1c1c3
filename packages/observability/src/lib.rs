//! # Observability
//!
//! Structured logging for the homeguard client crates.
//!
//! Library crates only ever call `tracing` macros. The binary calls
//! [`init_with_config`] once at startup, which installs:
//!
//! - a JSONL layer appending one object per event to
//!   `~/.homeguard/logs/homeguard.jsonl` (override with [`LogConfig::log_path`])
//! - an optional compact stderr layer for interactive use
//!
//! Fields whose names look like credentials (`access_token`, `password`,
//! `authorization`, ...) and values that look like bearer tokens are
//! replaced with `[REDACTED]` before they reach the file.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "homeguard".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! });
//! tracing::info!(system_id = 123, "watching");
//! ```

mod json_layer;
mod redact;
mod writer;

use std::io;
use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use json_layer::{JsonLayer, LogEntry};
pub use redact::{is_sensitive_key, redact_value, REDACTED};
pub use writer::{CentralLogWriter, WriterFactory};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, written into every log line.
    pub service_name: String,

    /// Default filter (e.g. "debug", "info,realtime_relay=trace").
    /// `RUST_LOG` takes precedence when set.
    pub default_level: String,

    /// Custom log file path. Defaults to `~/.homeguard/logs/homeguard.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Also emit logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "homeguard".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Default central log file location.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".homeguard").join("logs").join("homeguard.jsonl"))
}

/// Initialize with default settings for the named service.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize the global subscriber.
///
/// If the log file cannot be opened the JSON layer is skipped and a stderr
/// layer is installed instead, so startup never fails on logging. Calling
/// this twice is a no-op for the second call.
pub fn init_with_config(config: LogConfig) {
    let log_path = config.log_path.clone().or_else(default_log_path);

    let (json_layer, open_error) = match log_path.as_deref().map(CentralLogWriter::new) {
        Some(Ok(writer)) => (
            Some(JsonLayer::new(
                config.service_name.clone(),
                WriterFactory::new(writer),
            )),
            None,
        ),
        Some(Err(err)) => (None, Some(err)),
        None => (
            None,
            Some(io::Error::new(
                io::ErrorKind::NotFound,
                "home directory not found",
            )),
        ),
    };

    let stderr_layer = if config.also_stderr || json_layer.is_none() {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_writer(io::stderr)
                .with_filter(env_filter(&config.default_level)),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(json_layer.map(|l| l.with_filter(env_filter(&config.default_level))))
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if !installed {
        return;
    }

    match (open_error, log_path) {
        (Some(err), path) => tracing::warn!(
            log_path = ?path,
            error = %err,
            "log file unavailable, logging to stderr only"
        ),
        (None, Some(path)) => tracing::info!(
            log_path = %path.display(),
            service = %config.service_name,
            "observability initialized"
        ),
        (None, None) => {}
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

pub use tracing::{debug, error, info, instrument, trace, warn};
pub use tracing::Level;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "homeguard");
        assert_eq!(config.default_level, "info");
        assert!(config.log_path.is_none());
        assert!(!config.also_stderr);
    }

    #[test]
    fn test_default_log_path_is_under_homeguard_dir() {
        if let Some(path) = default_log_path() {
            assert!(path.ends_with(".homeguard/logs/homeguard.jsonl"));
        }
    }
}
