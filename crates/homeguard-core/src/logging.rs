//! Logging initialization.
//!
//! Thin wrapper over `observability`: every binary writes JSONL to
//! `~/.homeguard/logs/homeguard.jsonl`, mirrored to stderr when
//! `HOMEGUARD_LOG_STDERR` is set.

pub use observability::{init_with_config, LogConfig};

/// Initialize logging for the `homeguard` service.
pub fn init_logging(level: &str) {
    init_logging_for_service("homeguard", level);
}

pub fn init_logging_for_service(service_name: &str, level: &str) {
    observability::init_with_config(LogConfig {
        service_name: service_name.into(),
        default_level: level.into(),
        also_stderr: std::env::var("HOMEGUARD_LOG_STDERR")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false),
        ..Default::default()
    });
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_all_variants() {
        assert_eq!(parse_level("trace"), tracing::Level::TRACE);
        assert_eq!(parse_level("Debug"), tracing::Level::DEBUG);
        assert_eq!(parse_level("INFO"), tracing::Level::INFO);
        assert_eq!(parse_level("warning"), tracing::Level::WARN);
        assert_eq!(parse_level("error"), tracing::Level::ERROR);
    }

    #[test]
    fn parse_level_unknown_defaults_to_info() {
        assert_eq!(parse_level(""), tracing::Level::INFO);
        assert_eq!(parse_level("verbose"), tracing::Level::INFO);
    }
}
