//! Authentication error types.

use thiserror::Error;

/// Authentication error type.
///
/// `Clone` so that one refresh outcome can be handed to every caller that
/// waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Email/password or MFA challenge rejected outright. The user must
    /// re-enter credentials.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The out-of-band MFA factor has not been approved yet.
    #[error("Authorization pending: {0}")]
    AuthorizationPending(String),

    /// The refresh token was rejected. A full login is required.
    #[error("Refresh token expired: {0}")]
    RefreshTokenExpired(String),

    /// No response, a timeout or a 5xx.
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// No credential has been issued yet.
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid auth state transition: {0}")]
    InvalidStateTransition(String),

    /// The platform answered with something we could not interpret.
    #[error("Unexpected response: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Returns true if the same call may succeed when retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::TransientNetwork(_))
    }

    /// Returns true if the caller must collect credentials again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials(_)
                | AuthError::RefreshTokenExpired(_)
                | AuthError::NotAuthenticated
        )
    }
}

impl From<crate::http::HttpError> for AuthError {
    fn from(err: crate::http::HttpError) -> Self {
        AuthError::TransientNetwork(err.to_string())
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
