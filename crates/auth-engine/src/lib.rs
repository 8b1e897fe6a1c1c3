//! Authentication for the homeguard client.
//!
//! - [`AuthClient`]: credential login, MFA pending-authorization flow and
//!   single-flight refresh, driven by an explicit state machine
//! - [`Session`]: caller-owned holder of the current [`CredentialStore`],
//!   shared by handle with the REST transport and the realtime client
//! - [`HttpBackend`]: the network seam, with a reqwest implementation

mod auth_fsm;
mod client;
mod credential;
mod device;
mod error;
mod http;
mod source;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use auth_fsm::{
    AuthMachine, AuthMachineInput, AuthMachineState, AuthState, AuthStateChangedPayload,
};
pub use client::{
    AuthClient, AuthStateCallback, LoginOutcome, PendingAuthorization, AUTH_CHECK_PATH,
    GRANT_MFA_OOB, GRANT_PASSWORD, GRANT_REFRESH, MFA_CHALLENGE_PATH, TOKEN_PATH,
};
pub use credential::{CredentialStore, Session};
pub use device::ClientIdentity;
pub use error::{AuthError, AuthResult};
pub use http::{normalize_body, ApiRequest, ApiResponse, HttpBackend, HttpError, ReqwestBackend};
pub use reqwest::Method;
pub use source::CredentialSource;
