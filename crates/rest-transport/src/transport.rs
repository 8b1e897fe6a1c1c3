//! Bearer-authenticated requests with one refresh-and-retry on 401.

use crate::{TransportError, TransportResult};
use auth_engine::{ApiRequest, ApiResponse, AuthClient, CredentialStore, HttpBackend, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const NO_REMOTE_MANAGEMENT: &str = "NoRemoteManagement";

/// Issues API calls with the session's current access token.
///
/// Shares the [`AuthClient`] (and therefore the session) with the realtime
/// client, so a refresh triggered here is picked up there without any direct
/// signalling.
pub struct RestTransport {
    auth: Arc<AuthClient>,
    backend: Arc<dyn HttpBackend>,
}

impl RestTransport {
    pub fn new(auth: Arc<AuthClient>, backend: Arc<dyn HttpBackend>) -> Self {
        Self { auth, backend }
    }

    pub fn auth(&self) -> &Arc<AuthClient> {
        &self.auth
    }

    /// Send one request. An expired credential is refreshed first. A 401
    /// triggers exactly one refresh and one retry; a second 401 fails with
    /// [`TransportError::AuthenticationExpired`].
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> TransportResult<Value> {
        let credential = self.auth.credentials(Duration::ZERO).await?;
        let response = self.send(&credential, &method, path, &body).await?;

        if response.status != 401 {
            return into_result(path, response);
        }

        info!(path = %path, "Request unauthorized, refreshing credential and retrying once");
        let renewed = self.auth.renew_stale(&credential).await?;
        let retry = self.send(&renewed, &method, path, &body).await?;

        if retry.status == 401 {
            warn!(path = %path, "Request unauthorized again after refresh");
            return Err(TransportError::AuthenticationExpired {
                path: path.to_string(),
            });
        }
        into_result(path, retry)
    }

    /// [`request`](Self::request) with the body decoded into `T`.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> TransportResult<T> {
        let value = self.request(method, path, body).await?;
        serde_json::from_value(value).map_err(|e| TransportError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    pub async fn get(&self, path: &str) -> TransportResult<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> TransportResult<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn send(
        &self,
        credential: &CredentialStore,
        method: &Method,
        path: &str,
        body: &Option<Value>,
    ) -> TransportResult<ApiResponse> {
        let mut request =
            ApiRequest::new(method.clone(), path).with_bearer(credential.access_token());
        if let Some(body) = body {
            request = request.with_body(body.clone());
        }

        let response = self.backend.send(request).await?;
        debug!(method = %method, path = %path, status = response.status, "REST call completed");
        Ok(response)
    }
}

fn into_result(path: &str, response: ApiResponse) -> TransportResult<Value> {
    if response.body.get("type").and_then(Value::as_str) == Some(NO_REMOTE_MANAGEMENT) {
        return Err(TransportError::EndpointUnavailable(response.error_message()));
    }

    if response.is_success() {
        return Ok(response.body);
    }

    if response.status == 403 {
        return Err(TransportError::InvalidCredentials(response.error_message()));
    }

    warn!(path = %path, status = response.status, "REST call failed");
    Err(TransportError::Request {
        path: path.to_string(),
        status: response.status,
        message: response.error_message(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth_engine::testing::{token_body, ScriptedBackend};
    use auth_engine::{AuthError, GRANT_PASSWORD, GRANT_REFRESH, AUTH_CHECK_PATH};
    use futures_util::future::join;
    use homeguard_core::AuthConfig;
    use serde::Deserialize;
    use serde_json::json;

    const SUBSCRIPTIONS: &str = "users/1234/subscriptions";

    async fn transport_with(backend: &Arc<ScriptedBackend>, expires_in: i64) -> RestTransport {
        backend.respond_grant(GRANT_PASSWORD, 200, token_body("access-0", "refresh-0", expires_in));
        backend.respond(AUTH_CHECK_PATH, 200, json!({"userId": 1234}));
        backend.respond_grant(GRANT_REFRESH, 200, token_body("access-1", "refresh-1", 3600));

        let auth = Arc::new(AuthClient::new(
            backend.clone(),
            AuthConfig {
                client_id: Some("test-client".into()),
                ..AuthConfig::default()
            },
        ));
        auth.login_with_credentials("a@b.com", "pw").await.unwrap();
        RestTransport::new(auth, backend.clone())
    }

    fn bearers_for(backend: &ScriptedBackend, path: &str) -> Vec<String> {
        backend
            .calls()
            .into_iter()
            .filter(|c| c.path == path)
            .filter_map(|c| c.bearer)
            .collect()
    }

    #[tokio::test]
    async fn test_request_attaches_bearer() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = transport_with(&backend, 3600).await;
        backend.respond(SUBSCRIPTIONS, 200, json!({"subscriptions": []}));

        let body = transport.get(SUBSCRIPTIONS).await.unwrap();
        assert_eq!(body, json!({"subscriptions": []}));
        assert_eq!(bearers_for(&backend, SUBSCRIPTIONS), vec!["access-0"]);
        assert_eq!(backend.grant_calls(GRANT_REFRESH), 0);
    }

    #[tokio::test]
    async fn test_single_401_refreshes_and_retries_once() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = transport_with(&backend, 3600).await;
        backend.respond(SUBSCRIPTIONS, 401, json!({"error": "unauthorized"}));
        backend.respond(SUBSCRIPTIONS, 200, json!({"ok": true}));

        let body = transport.get(SUBSCRIPTIONS).await.unwrap();
        assert_eq!(body, json!({"ok": true}));
        assert_eq!(backend.grant_calls(GRANT_REFRESH), 1);
        assert_eq!(
            bearers_for(&backend, SUBSCRIPTIONS),
            vec!["access-0", "access-1"]
        );
    }

    #[tokio::test]
    async fn test_repeated_401_does_not_loop() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = transport_with(&backend, 3600).await;
        backend.respond(SUBSCRIPTIONS, 401, json!({"error": "unauthorized"}));

        let err = transport.get(SUBSCRIPTIONS).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::AuthenticationExpired {
                path: SUBSCRIPTIONS.to_string()
            }
        );
        assert_eq!(backend.calls_to(SUBSCRIPTIONS), 2);
        assert_eq!(backend.grant_calls(GRANT_REFRESH), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_during_retry_surfaces_auth_error() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = transport_with(&backend, 3600).await;
        backend.respond(SUBSCRIPTIONS, 401, json!({"error": "unauthorized"}));
        // Drain the scripted success so the rejection is served next.
        backend.respond_grant(GRANT_REFRESH, 400, json!({"error": "invalid_grant"}));
        transport.auth().refresh_current().await.unwrap();

        let err = transport.get(SUBSCRIPTIONS).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Auth(AuthError::RefreshTokenExpired(_))
        ));
        assert_eq!(backend.calls_to(SUBSCRIPTIONS), 1);
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = transport_with(&backend, 3600).await;
        backend.respond(SUBSCRIPTIONS, 401, json!({"error": "unauthorized"}));
        backend.respond(SUBSCRIPTIONS, 401, json!({"error": "unauthorized"}));
        backend.respond(SUBSCRIPTIONS, 200, json!({"ok": true}));
        backend.set_latency(Duration::from_millis(20));

        let (a, b) = join(transport.get(SUBSCRIPTIONS), transport.get(SUBSCRIPTIONS)).await;
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(backend.grant_calls(GRANT_REFRESH), 1);
        assert_eq!(backend.calls_to(SUBSCRIPTIONS), 4);
    }

    #[tokio::test]
    async fn test_expired_credential_refreshed_before_call() {
        let backend = Arc::new(ScriptedBackend::new());
        // Lifetime shorter than the expiry skew: expired on arrival.
        let transport = transport_with(&backend, 30).await;
        backend.respond(SUBSCRIPTIONS, 200, json!({}));

        transport.get(SUBSCRIPTIONS).await.unwrap();
        assert_eq!(backend.grant_calls(GRANT_REFRESH), 1);
        assert_eq!(bearers_for(&backend, SUBSCRIPTIONS), vec!["access-1"]);
    }

    #[tokio::test]
    async fn test_403_is_invalid_credentials_without_refresh() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = transport_with(&backend, 3600).await;
        backend.respond(SUBSCRIPTIONS, 403, json!({"error": "forbidden"}));

        let err = transport.get(SUBSCRIPTIONS).await.unwrap_err();
        assert_eq!(err, TransportError::InvalidCredentials("forbidden".into()));
        assert_eq!(backend.grant_calls(GRANT_REFRESH), 0);
    }

    #[tokio::test]
    async fn test_no_remote_management_is_endpoint_unavailable() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = transport_with(&backend, 3600).await;
        backend.respond(
            "ss3/subscriptions/1/state/away",
            200,
            json!({"type": "NoRemoteManagement", "message": "Upgrade your plan"}),
        );

        let err = transport
            .post("ss3/subscriptions/1/state/away", json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::EndpointUnavailable("Upgrade your plan".into())
        );
    }

    #[tokio::test]
    async fn test_other_failures_carry_status() {
        let backend = Arc::new(ScriptedBackend::new());
        let transport = transport_with(&backend, 3600).await;
        backend.respond(SUBSCRIPTIONS, 502, json!({"error": "Bad Gateway"}));

        let err = transport.get(SUBSCRIPTIONS).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, TransportError::Request { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_request_json_decodes() {
        #[derive(Debug, Deserialize)]
        struct Subscriptions {
            subscriptions: Vec<u64>,
        }

        let backend = Arc::new(ScriptedBackend::new());
        let transport = transport_with(&backend, 3600).await;
        backend.respond(SUBSCRIPTIONS, 200, json!({"subscriptions": [1, 2]}));

        let subs: Subscriptions = transport
            .request_json(Method::GET, SUBSCRIPTIONS, None)
            .await
            .unwrap();
        assert_eq!(subs.subscriptions, vec![1, 2]);

        let err = transport
            .request_json::<Vec<String>>(Method::GET, SUBSCRIPTIONS, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_requires_login() {
        let backend = Arc::new(ScriptedBackend::new());
        let auth = Arc::new(AuthClient::new(backend.clone(), AuthConfig::default()));
        let transport = RestTransport::new(auth, backend.clone());

        let err = transport.get(SUBSCRIPTIONS).await.unwrap_err();
        assert_eq!(err, TransportError::Auth(AuthError::NotAuthenticated));
        assert_eq!(backend.calls_to(SUBSCRIPTIONS), 0);
    }
}
