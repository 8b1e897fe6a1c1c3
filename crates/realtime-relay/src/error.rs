//! Realtime error types.
//!
//! These never reach subscribers. The supervisor logs them and reports them
//! through the status channel.

use auth_engine::AuthError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    /// The server answered the auth frame with `auth.error`.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection closed by server")]
    Closed,

    #[error("Realtime client already started")]
    AlreadyStarted,

    #[error("No async runtime available: {0}")]
    Runtime(String),
}

pub type RelayResult<T> = Result<T, RelayError>;
