//! REST transport error types.

use auth_engine::{AuthError, HttpError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Still unauthorized after one refresh and retry. Fatal for this call.
    #[error("Authentication expired for {path}")]
    AuthenticationExpired { path: String },

    /// The platform answered 403.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The account's plan does not allow this endpoint.
    #[error("Endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("Request to {path} failed with status {status}: {message}")]
    Request {
        path: String,
        status: u16,
        message: String,
    },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Network error: {0}")]
    Network(#[from] HttpError),

    #[error("Failed to decode response from {path}: {message}")]
    Decode { path: String, message: String },
}

impl TransportError {
    /// Returns true if the same call may succeed when retried with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Request { status, .. } => *status >= 500,
            TransportError::Auth(err) => err.is_transient(),
            _ => false,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Network(HttpError::Timeout).is_transient());
        assert!(TransportError::Request {
            path: "x".into(),
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(!TransportError::Request {
            path: "x".into(),
            status: 404,
            message: "missing".into()
        }
        .is_transient());
        assert!(!TransportError::AuthenticationExpired { path: "x".into() }.is_transient());
        assert!(TransportError::Auth(AuthError::TransientNetwork("reset".into())).is_transient());
    }
}
