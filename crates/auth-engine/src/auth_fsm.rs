//! Authentication state machine using rust-fsm.
//!
//! Inputs are outcomes of completed exchanges, never attempts. A failed
//! network call or a malformed response feeds no input, so the machine stays
//! where it was and no partial credential is ever published.
//!
//! ```text
//!                    MfaRequired
//! ┌─────────────────┐ ──────────────────► ┌─────────────────┐
//! │ Unauthenticated │                     │   PendingMfa    │◄─┐ MfaRequired
//! └────────┬────────┘ ◄────────────────── └────────┬────────┘──┘
//!          │  ▲   ChallengeAbandoned /             │
//!          │  │   CredentialsRejected / SignedOut  │ TokensIssued
//!          │  │                                    ▼
//!          │  │ RefreshRejected / SignedOut ┌─────────────────┐
//!          │  └──────────────────────────── │  Authenticated  │◄─┐ TokensIssued
//!          └──────────────────────────────► └─────────────────┘──┘ (refresh)
//!                    TokensIssued
//! ```

use rust_fsm::*;
use serde::{Deserialize, Serialize};

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub auth_machine(Unauthenticated)

    Unauthenticated => {
        TokensIssued => Authenticated,
        MfaRequired => PendingMfa,
        RefreshRejected => Unauthenticated,
        SignedOut => Unauthenticated
    },
    PendingMfa => {
        TokensIssued => Authenticated,
        // A second login attempt starts a fresh challenge.
        MfaRequired => PendingMfa,
        ChallengeAbandoned => Unauthenticated,
        CredentialsRejected => Unauthenticated,
        RefreshRejected => Unauthenticated,
        SignedOut => Unauthenticated
    },
    Authenticated => {
        // Refresh, or a new login replacing the session.
        TokensIssued => Authenticated,
        MfaRequired => PendingMfa,
        RefreshRejected => Unauthenticated,
        SignedOut => Unauthenticated
    }
}

pub use auth_machine::Input as AuthMachineInput;
pub use auth_machine::State as AuthMachineState;
pub use auth_machine::StateMachine as AuthMachine;

/// Public view of the authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    /// An MFA challenge was issued and awaits out-of-band approval.
    PendingMfa,
    Authenticated,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated)
    }
}

impl From<&AuthMachineState> for AuthState {
    fn from(state: &AuthMachineState) -> Self {
        match state {
            AuthMachineState::Unauthenticated => AuthState::Unauthenticated,
            AuthMachineState::PendingMfa => AuthState::PendingMfa,
            AuthMachineState::Authenticated => AuthState::Authenticated,
        }
    }
}

/// Payload for auth state change callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStateChangedPayload {
    pub state: AuthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
}
