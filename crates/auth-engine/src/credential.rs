//! Issued credentials and the session that holds the current one.
//!
//! A [`CredentialStore`] is immutable. Every successful exchange builds a new
//! one and swaps it into the [`Session`] in a single step, so a reader holding
//! an `Arc<CredentialStore>` always sees a complete access/refresh/expiry
//! triple.

use crate::{AuthError, AuthResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Token endpoint success body.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Access token, refresh token and expiry from one exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialStore {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
}

impl CredentialStore {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            issued_at,
        }
    }

    /// Build from a token response received at `issued_at`. The expiry is
    /// `issued_at + expires_in - skew`.
    pub(crate) fn from_grant(
        grant: TokenGrant,
        issued_at: DateTime<Utc>,
        skew: Duration,
    ) -> AuthResult<Self> {
        if grant.access_token.is_empty() {
            return Err(AuthError::Protocol(
                "token response has an empty access_token".to_string(),
            ));
        }
        if grant.expires_in <= 0 {
            return Err(AuthError::Protocol(format!(
                "token response has non-positive expires_in ({})",
                grant.expires_in
            )));
        }

        let skew_secs = i64::try_from(skew.as_secs()).unwrap_or(i64::MAX);
        let lifetime = grant.expires_in.saturating_sub(skew_secs).max(0);
        let expires_at = ChronoDuration::try_seconds(lifetime)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::Protocol(format!(
                    "token response expires_in out of range ({})",
                    grant.expires_in
                ))
            })?;

        Ok(Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at,
            issued_at,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True if the credential is expired or will be within `margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_within_at(margin, Utc::now())
    }

    pub fn expires_within_at(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        match self.remaining_at(now) {
            Some(remaining) => remaining <= margin,
            None => true,
        }
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Caller-owned session holding the current credential and account id.
///
/// Shared by handle between the auth client, the REST transport and the
/// realtime client. Nothing is written to disk. Callers that want to persist
/// the refresh token observe [`Session::subscribe`].
pub struct Session {
    credential: watch::Sender<Option<Arc<CredentialStore>>>,
    user_id: RwLock<Option<u64>>,
}

impl Session {
    pub fn new() -> Self {
        let (credential, _) = watch::channel(None);
        Self {
            credential,
            user_id: RwLock::new(None),
        }
    }

    /// Snapshot of the current credential.
    pub fn current(&self) -> Option<Arc<CredentialStore>> {
        self.credential.borrow().clone()
    }

    /// Account id reported by the platform after login.
    pub fn user_id(&self) -> Option<u64> {
        *self.user_id.read()
    }

    /// Receiver notified whenever the credential is replaced or cleared.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CredentialStore>>> {
        self.credential.subscribe()
    }

    pub(crate) fn replace(&self, credential: Arc<CredentialStore>) {
        self.credential.send_replace(Some(credential));
    }

    pub(crate) fn set_user_id(&self, user_id: u64) {
        *self.user_id.write() = Some(user_id);
    }

    pub(crate) fn clear(&self) {
        self.credential.send_replace(None);
        *self.user_id.write() = None;
    }

    /// Clear only if the current credential carries `refresh_token`. Returns
    /// whether it did.
    pub(crate) fn clear_if_holding(&self, refresh_token: &str) -> bool {
        let cleared = self.credential.send_if_modified(|current| {
            let held = current
                .as_ref()
                .is_some_and(|c| c.refresh_token() == refresh_token);
            if held {
                *current = None;
            }
            held
        });
        if cleared {
            *self.user_id.write() = None;
        }
        cleared
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("credential", &self.current())
            .field("user_id", &self.user_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn issued() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
    }

    fn grant(expires_in: i64) -> TokenGrant {
        TokenGrant {
            access_token: "access-1".into(),
            refresh_token: "refresh-1".into(),
            expires_in,
        }
    }

    #[test]
    fn test_expiry_derived_from_lifetime_minus_skew() {
        let store =
            CredentialStore::from_grant(grant(3600), issued(), Duration::from_secs(60)).unwrap();
        assert_eq!(store.expires_at(), issued() + ChronoDuration::seconds(3540));
        assert_eq!(store.issued_at(), issued());
        assert_eq!(store.access_token(), "access-1");
        assert_eq!(store.refresh_token(), "refresh-1");
    }

    #[test]
    fn test_skew_larger_than_lifetime_is_immediately_expired() {
        let store =
            CredentialStore::from_grant(grant(30), issued(), Duration::from_secs(60)).unwrap();
        assert!(store.is_expired_at(issued()));
    }

    #[test]
    fn test_rejects_empty_access_token() {
        let mut bad = grant(3600);
        bad.access_token.clear();
        let err = CredentialStore::from_grant(bad, issued(), Duration::ZERO).unwrap_err();
        assert!(matches!(err, AuthError::Protocol(_)));
    }

    #[test]
    fn test_rejects_non_positive_lifetime() {
        let err = CredentialStore::from_grant(grant(0), issued(), Duration::ZERO).unwrap_err();
        assert!(matches!(err, AuthError::Protocol(_)));
    }

    #[test]
    fn test_rejects_out_of_range_lifetime() {
        for expires_in in [10_i64.pow(16), i64::MAX / 2, i64::MAX] {
            let err =
                CredentialStore::from_grant(grant(expires_in), issued(), Duration::from_secs(60))
                    .unwrap_err();
            assert!(
                matches!(err, AuthError::Protocol(_)),
                "expires_in {}",
                expires_in
            );
        }
    }

    #[test]
    fn test_expires_within_margin() {
        let store =
            CredentialStore::from_grant(grant(600), issued(), Duration::ZERO).unwrap();
        let now = issued() + ChronoDuration::seconds(500);

        assert!(!store.is_expired_at(now));
        assert!(store.expires_within_at(Duration::from_secs(120), now));
        assert!(!store.expires_within_at(Duration::from_secs(60), now));
        assert_eq!(store.remaining_at(now), Some(Duration::from_secs(100)));

        let later = issued() + ChronoDuration::seconds(601);
        assert!(store.is_expired_at(later));
        assert!(store.expires_within_at(Duration::ZERO, later));
        assert_eq!(store.remaining_at(later), None);
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let store =
            CredentialStore::from_grant(grant(600), issued(), Duration::ZERO).unwrap();
        let rendered = format!("{:?}", store);
        assert!(!rendered.contains("access-1"));
        assert!(!rendered.contains("refresh-1"));
    }

    #[test]
    fn test_session_replaces_whole_credential() {
        let session = Session::new();
        assert!(session.current().is_none());

        let mut rx = session.subscribe();
        let first = Arc::new(CredentialStore::new("a1", "r1", issued(), issued()));
        session.replace(first.clone());
        let held = session.current().unwrap();
        assert!(Arc::ptr_eq(&held, &first));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        let second = Arc::new(CredentialStore::new("a2", "r2", issued(), issued()));
        session.replace(second);

        // The earlier snapshot is untouched by the replacement.
        assert_eq!(held.access_token(), "a1");
        assert_eq!(session.current().unwrap().access_token(), "a2");
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_session_clear_if_holding_checks_refresh_token() {
        let session = Session::new();
        session.set_user_id(42);
        session.replace(Arc::new(CredentialStore::new("a2", "r2", issued(), issued())));

        assert!(!session.clear_if_holding("r1"));
        assert_eq!(session.current().unwrap().refresh_token(), "r2");
        assert_eq!(session.user_id(), Some(42));

        assert!(session.clear_if_holding("r2"));
        assert!(session.current().is_none());
        assert!(session.user_id().is_none());
    }

    #[test]
    fn test_session_clear_drops_user_id() {
        let session = Session::new();
        session.set_user_id(42);
        session.replace(Arc::new(CredentialStore::new("a", "r", issued(), issued())));
        session.clear();
        assert!(session.current().is_none());
        assert!(session.user_id().is_none());
    }
}
