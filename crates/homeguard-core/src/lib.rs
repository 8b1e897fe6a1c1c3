//! Shared configuration, paths, logging and error types for the homeguard
//! client crates.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    AuthConfig, Config, RealtimeConfig, TransportConfig, DEFAULT_API_BASE_URL, DEFAULT_APP_VERSION,
    DEFAULT_LOG_LEVEL, DEFAULT_REALTIME_URL, DEFAULT_USER_AGENT,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_for_service, parse_level};
pub use paths::Paths;
