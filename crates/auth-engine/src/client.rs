//! Login, MFA completion and refresh against the platform token endpoint.
//!
//! `AuthClient` owns the auth state machine and publishes every issued
//! credential into a shared [`Session`]. Refresh exchanges are single-flight:
//! callers that arrive while one is running wait for it and receive its
//! outcome instead of starting their own.

use crate::auth_fsm::{AuthMachine, AuthMachineInput, AuthState, AuthStateChangedPayload};
use crate::credential::{CredentialStore, Session, TokenGrant};
use crate::device::ClientIdentity;
use crate::http::{ApiRequest, ApiResponse, HttpBackend};
use crate::source::CredentialSource;
use crate::{AuthError, AuthResult};
use async_trait::async_trait;
use chrono::Utc;
use homeguard_core::AuthConfig;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TOKEN_PATH: &str = "api/token";
pub const MFA_CHALLENGE_PATH: &str = "api/mfa/challenge";
pub const AUTH_CHECK_PATH: &str = "api/authCheck";

pub const GRANT_PASSWORD: &str = "password";
pub const GRANT_REFRESH: &str = "refresh_token";
pub const GRANT_MFA_OOB: &str = "http://simplisafe.com/oauth/grant-type/mfa-oob";

const SCOPE: &str = "offline_access";
const AUTHORIZATION_PENDING: &str = "authorization_pending";

/// Callback type for auth state change notifications.
pub type AuthStateCallback = Box<dyn Fn(AuthStateChangedPayload) + Send + Sync>;

/// An MFA challenge waiting for the user to approve the emailed link.
///
/// Created by [`AuthClient::login_with_credentials`]; consumed by
/// [`AuthClient::abandon_authorization`] or dropped after completion.
#[derive(Clone)]
pub struct PendingAuthorization {
    mfa_token: String,
    oob_code: String,
    message: String,
}

impl PendingAuthorization {
    /// Opaque challenge identifier.
    pub fn challenge_id(&self) -> &str {
        &self.oob_code
    }

    /// Instructions to show the user verbatim.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("mfa_token", &"[REDACTED]")
            .field("oob_code", &"[REDACTED]")
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for PendingAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result of a credential login.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Authenticated(Arc<CredentialStore>),
    PendingAuthorization(PendingAuthorization),
}

#[derive(Debug, Deserialize)]
struct AuthCheckResponse {
    #[serde(rename = "userId")]
    user_id: u64,
}

#[derive(Debug, Deserialize)]
struct MfaChallengeResponse {
    oob_code: String,
}

/// Last completed refresh, shared with callers that queued behind it.
#[derive(Default)]
struct RefreshFlight {
    generation: u64,
    outcome: Option<AuthResult<Arc<CredentialStore>>>,
}

/// Client for the platform's OAuth-like token endpoint.
pub struct AuthClient {
    backend: Arc<dyn HttpBackend>,
    identity: ClientIdentity,
    config: AuthConfig,
    session: Arc<Session>,
    fsm: Mutex<AuthMachine>,
    /// The only mutual-exclusion point for refresh exchanges.
    refresh_gate: tokio::sync::Mutex<RefreshFlight>,
    completed_flights: AtomicU64,
    state_callback: Mutex<Option<AuthStateCallback>>,
}

impl AuthClient {
    pub fn new(backend: Arc<dyn HttpBackend>, config: AuthConfig) -> Self {
        Self::with_session(backend, config, Arc::new(Session::new()))
    }

    /// Build a client that publishes into a caller-provided session.
    pub fn with_session(
        backend: Arc<dyn HttpBackend>,
        config: AuthConfig,
        session: Arc<Session>,
    ) -> Self {
        let identity = ClientIdentity::new(config.client_id.as_deref());
        Self {
            backend,
            identity,
            config,
            session,
            fsm: Mutex::new(AuthMachine::new()),
            refresh_gate: tokio::sync::Mutex::new(RefreshFlight::default()),
            completed_flights: AtomicU64::new(0),
            state_callback: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn client_id(&self) -> &str {
        self.identity.client_id()
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Set a callback to be notified of auth state changes.
    pub fn set_state_callback(&self, callback: AuthStateCallback) {
        *self.state_callback.lock() = Some(callback);
    }

    pub fn state(&self) -> AuthState {
        AuthState::from(self.fsm.lock().state())
    }

    /// Exchange email and password for a credential.
    ///
    /// If the platform demands MFA, a challenge is issued and the outcome is
    /// [`LoginOutcome::PendingAuthorization`]; finish with
    /// [`complete_authorization`](Self::complete_authorization).
    pub async fn login_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> AuthResult<LoginOutcome> {
        debug!(email = %email, client_id = %self.identity.client_id(), "Attempting credential login");

        let body = json!({
            "grant_type": GRANT_PASSWORD,
            "username": email,
            "password": password,
            "client_id": self.identity.client_id_string(),
            "device_id": self.identity.device_descriptor(),
            "app_version": self.config.app_version,
            "scope": SCOPE,
        });
        let response = self.backend.send(ApiRequest::post(TOKEN_PATH, body)).await?;

        if let Some(mfa_token) = response.body.get("mfa_token").and_then(Value::as_str) {
            let pending = self.start_challenge(mfa_token).await?;
            return Ok(LoginOutcome::PendingAuthorization(pending));
        }

        if !response.is_success() {
            let err = classify_failure(&response);
            warn!(status = response.status, error = %err, "Credential login failed");
            return Err(err);
        }

        let credential = self.finish_login(&response).await?;
        info!(user_id = ?self.session.user_id(), "Credential login successful");
        Ok(LoginOutcome::Authenticated(credential))
    }

    /// Poll the platform once for the outcome of an MFA challenge.
    ///
    /// Fails with [`AuthError::AuthorizationPending`] until the user approves,
    /// which leaves the challenge usable. Rejection ends the challenge.
    pub async fn complete_authorization(
        &self,
        pending: &PendingAuthorization,
    ) -> AuthResult<Arc<CredentialStore>> {
        if self.state() != AuthState::PendingMfa {
            return Err(AuthError::InvalidStateTransition(
                "no MFA challenge is pending".to_string(),
            ));
        }

        let body = json!({
            "client_id": self.identity.client_id_string(),
            "grant_type": GRANT_MFA_OOB,
            "mfa_token": pending.mfa_token,
            "oob_code": pending.oob_code,
            "scope": SCOPE,
        });
        let response = self.backend.send(ApiRequest::post(TOKEN_PATH, body)).await?;

        if response.is_success() && response.error_code().is_none() {
            let credential = self.finish_login(&response).await?;
            info!(user_id = ?self.session.user_id(), "MFA authorization completed");
            return Ok(credential);
        }

        if response.error_code() == Some(AUTHORIZATION_PENDING) {
            debug!("MFA approval still pending");
            return Err(AuthError::AuthorizationPending(pending.message.clone()));
        }

        let err = classify_failure(&response);
        if matches!(err, AuthError::InvalidCredentials(_)) {
            warn!(status = response.status, "MFA challenge rejected");
            self.transition(&AuthMachineInput::CredentialsRejected)?;
        }
        Err(err)
    }

    /// Discard a pending challenge without completing it.
    pub fn abandon_authorization(&self, pending: PendingAuthorization) -> AuthResult<()> {
        drop(pending);
        self.transition(&AuthMachineInput::ChallengeAbandoned)?;
        info!("MFA challenge abandoned");
        Ok(())
    }

    /// Restore a session from a refresh token held by the caller.
    pub async fn login_with_refresh_token(
        &self,
        refresh_token: &str,
    ) -> AuthResult<Arc<CredentialStore>> {
        let credential = Arc::new(self.exchange_refresh(refresh_token).await?);
        let user_id = self.auth_check(credential.access_token()).await?;
        self.session.set_user_id(user_id);
        self.publish(credential.clone())?;
        info!(user_id = user_id, "Session restored from refresh token");
        Ok(credential)
    }

    /// Exchange a refresh token for a new credential.
    ///
    /// Concurrent calls share one network exchange and receive the same
    /// `Arc<CredentialStore>`.
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<Arc<CredentialStore>> {
        self.single_flight(|| self.refresh_and_publish(refresh_token))
            .await
    }

    /// Refresh the session's current credential.
    pub async fn refresh_current(&self) -> AuthResult<Arc<CredentialStore>> {
        let current = self.session.current().ok_or(AuthError::NotAuthenticated)?;
        self.renew_stale(&current).await
    }

    /// Replace a credential the server rejected. If the session already holds
    /// a different credential, that one is returned without an exchange.
    pub async fn renew_stale(
        &self,
        stale: &Arc<CredentialStore>,
    ) -> AuthResult<Arc<CredentialStore>> {
        match self.session.current() {
            Some(current) if !Arc::ptr_eq(&current, stale) => {
                debug!("Credential already replaced by another caller");
                Ok(current)
            }
            Some(_) => {
                let refresh_token = stale.refresh_token().to_string();
                self.single_flight(|| self.refresh_and_publish(&refresh_token))
                    .await
            }
            None => Err(AuthError::NotAuthenticated),
        }
    }

    /// Current credential, refreshed first if it expires within `min_validity`.
    pub async fn credentials(&self, min_validity: Duration) -> AuthResult<Arc<CredentialStore>> {
        let current = self.session.current().ok_or(AuthError::NotAuthenticated)?;
        if !current.expires_within(min_validity) {
            return Ok(current);
        }

        debug!(
            expires_at = %current.expires_at(),
            min_validity_secs = min_validity.as_secs(),
            "Credential near expiry, refreshing"
        );
        self.renew_stale(&current).await
    }

    pub fn logout(&self) -> AuthResult<()> {
        self.session.clear();
        self.transition(&AuthMachineInput::SignedOut)?;
        info!("Logged out");
        Ok(())
    }

    async fn start_challenge(&self, mfa_token: &str) -> AuthResult<PendingAuthorization> {
        let body = json!({
            "challenge_type": "oob",
            "client_id": self.identity.client_id_string(),
            "mfa_token": mfa_token,
        });
        let response = self
            .backend
            .send(ApiRequest::post(MFA_CHALLENGE_PATH, body))
            .await?;

        if !response.is_success() {
            return Err(classify_failure(&response));
        }

        let challenge: MfaChallengeResponse = serde_json::from_value(response.body)
            .map_err(|e| AuthError::Protocol(format!("malformed MFA challenge response: {}", e)))?;

        self.transition(&AuthMachineInput::MfaRequired)?;
        info!(client_id = %self.identity.client_id(), "MFA challenge issued");

        Ok(PendingAuthorization {
            mfa_token: mfa_token.to_string(),
            oob_code: challenge.oob_code,
            message: format!(
                "Check your email for an MFA link, then use {} as the client_id parameter in future API calls",
                self.identity.client_id()
            ),
        })
    }

    /// Verify a freshly issued token and publish it with the account id.
    async fn finish_login(&self, response: &ApiResponse) -> AuthResult<Arc<CredentialStore>> {
        let credential = Arc::new(self.credential_from(response)?);
        let user_id = self.auth_check(credential.access_token()).await?;
        self.session.set_user_id(user_id);
        self.publish(credential.clone())?;
        Ok(credential)
    }

    async fn auth_check(&self, access_token: &str) -> AuthResult<u64> {
        let response = self
            .backend
            .send(ApiRequest::get(AUTH_CHECK_PATH).with_bearer(access_token))
            .await?;

        if !response.is_success() {
            let err = classify_failure(&response);
            warn!(status = response.status, error = %err, "Auth check failed");
            return Err(err);
        }

        let check: AuthCheckResponse = serde_json::from_value(response.body)
            .map_err(|e| AuthError::Protocol(format!("malformed auth check response: {}", e)))?;
        Ok(check.user_id)
    }

    async fn refresh_and_publish(&self, refresh_token: &str) -> AuthResult<Arc<CredentialStore>> {
        let credential = Arc::new(self.exchange_refresh(refresh_token).await?);
        self.publish(credential.clone())?;
        info!(expires_at = %credential.expires_at(), "Token refreshed");
        Ok(credential)
    }

    /// One refresh grant. A rejected refresh token clears the session if the
    /// session still holds it.
    async fn exchange_refresh(&self, refresh_token: &str) -> AuthResult<CredentialStore> {
        let body = json!({
            "grant_type": GRANT_REFRESH,
            "client_id": self.identity.client_id(),
            "refresh_token": refresh_token,
        });
        let response = self.backend.send(ApiRequest::post(TOKEN_PATH, body)).await?;

        if response.is_success() {
            return self.credential_from(&response);
        }

        match classify_failure(&response) {
            AuthError::InvalidCredentials(message) => {
                if self.session.clear_if_holding(refresh_token) {
                    warn!(status = response.status, "Refresh token rejected, session cleared");
                    self.transition(&AuthMachineInput::RefreshRejected)?;
                } else {
                    warn!(status = response.status, "Refresh token rejected");
                }
                Err(AuthError::RefreshTokenExpired(message))
            }
            other => {
                warn!(status = response.status, error = %other, "Token refresh failed");
                Err(other)
            }
        }
    }

    fn credential_from(&self, response: &ApiResponse) -> AuthResult<CredentialStore> {
        let grant: TokenGrant = serde_json::from_value(response.body.clone())
            .map_err(|e| AuthError::Protocol(format!("malformed token response: {}", e)))?;
        CredentialStore::from_grant(grant, Utc::now(), self.config.expiry_skew())
    }

    fn publish(&self, credential: Arc<CredentialStore>) -> AuthResult<()> {
        self.session.replace(credential);
        self.transition(&AuthMachineInput::TokensIssued)?;
        Ok(())
    }

    /// Run `exchange` unless a flight completed while this caller waited for
    /// the gate, in which case that flight's outcome is returned.
    async fn single_flight<F, Fut>(&self, exchange: F) -> AuthResult<Arc<CredentialStore>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<Arc<CredentialStore>>>,
    {
        let observed = self.completed_flights.load(Ordering::Acquire);
        let mut flight = self.refresh_gate.lock().await;

        if flight.generation != observed {
            if let Some(outcome) = &flight.outcome {
                debug!("Sharing result of concurrent refresh");
                return outcome.clone();
            }
        }

        let outcome = exchange().await;
        flight.generation = flight.generation.wrapping_add(1);
        flight.outcome = Some(outcome.clone());
        self.completed_flights
            .store(flight.generation, Ordering::Release);
        outcome
    }

    /// Transition the FSM and notify callback if state changed.
    fn transition(&self, input: &AuthMachineInput) -> AuthResult<AuthState> {
        let mut fsm = self.fsm.lock();
        let old_state = AuthState::from(fsm.state());

        fsm.consume(input).map_err(|_| {
            AuthError::InvalidStateTransition(format!(
                "Cannot apply {:?} in state {:?}",
                input,
                fsm.state()
            ))
        })?;

        let new_state = AuthState::from(fsm.state());
        drop(fsm);

        if old_state != new_state {
            debug!(old_state = ?old_state, new_state = ?new_state, "Auth state transition");
            self.notify_state_change(new_state);
        }

        Ok(new_state)
    }

    fn notify_state_change(&self, state: AuthState) {
        let callback = self.state_callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(AuthStateChangedPayload {
                state,
                user_id: self.session.user_id(),
            });
        }
    }
}

#[async_trait]
impl CredentialSource for AuthClient {
    async fn credentials(&self, min_validity: Duration) -> AuthResult<Arc<CredentialStore>> {
        AuthClient::credentials(self, min_validity).await
    }

    async fn renew(&self, stale: &Arc<CredentialStore>) -> AuthResult<Arc<CredentialStore>> {
        self.renew_stale(stale).await
    }

    fn user_id(&self) -> Option<u64> {
        self.session.user_id()
    }
}

/// Map a non-success token/auth response onto the error taxonomy.
fn classify_failure(response: &ApiResponse) -> AuthError {
    if response.is_server_error() {
        return AuthError::TransientNetwork(response.error_message());
    }
    match response.status {
        400 | 401 | 403 => AuthError::InvalidCredentials(response.error_message()),
        _ => AuthError::Protocol(format!(
            "unexpected status {}: {}",
            response.status,
            response.error_message()
        )),
    }
}
