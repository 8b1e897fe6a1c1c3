//! Credential access for long-lived consumers.

use crate::{AuthResult, CredentialStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// What the realtime client needs from authentication: a credential valid
/// for at least some margin, and a way to replace one the server rejected.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current credential, refreshed first if it expires within `min_validity`.
    async fn credentials(&self, min_validity: Duration) -> AuthResult<Arc<CredentialStore>>;

    /// Replace `stale`, unless another caller already has.
    async fn renew(&self, stale: &Arc<CredentialStore>) -> AuthResult<Arc<CredentialStore>>;

    /// Account id bound to the current session.
    fn user_id(&self) -> Option<u64>;
}
