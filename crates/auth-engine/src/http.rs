//! HTTP seam shared by the auth client and the REST transport.
//!
//! Everything above this module speaks [`ApiRequest`]/[`ApiResponse`]; only
//! [`ReqwestBackend`] knows about sockets, headers and timeouts.

use crate::{AuthError, AuthResult};
use async_trait::async_trait;
use homeguard_core::TransportConfig;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::debug;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// One call against the platform API. `path` is relative to the API base.
#[derive(Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            bearer: None,
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Status plus JSON body. Non-JSON bodies arrive as `{"error": "<text>"}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    /// OAuth-style `error` code, if any.
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error").and_then(Value::as_str)
    }

    /// Best human-readable description the body offers.
    pub fn error_message(&self) -> String {
        ["error_description", "message", "error"]
            .iter()
            .find_map(|key| self.body.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status))
    }
}

/// Failure before any HTTP status was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout
        } else if err.is_connect() {
            HttpError::Connect(err.to_string())
        } else {
            HttpError::Request(err.to_string())
        }
    }
}

/// Sends [`ApiRequest`]s. Implemented over reqwest in production and by an
/// in-memory script in tests.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, HttpError>;
}

/// reqwest-backed [`HttpBackend`].
pub struct ReqwestBackend {
    client: Client,
    base_url: String,
}

impl ReqwestBackend {
    pub fn new(config: &TransportConfig) -> AuthResult<Self> {
        let base_url = config
            .api_base_url()
            .map_err(|e| AuthError::Config(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| AuthError::Config(format!("invalid user agent: {}", e)))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AuthError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, HttpError> {
        let url = self.url_for(&request.path);
        debug!(method = %request.method, url = %url, "Sending API request");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE);

        if let Some(token) = &request.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(body) = &request.body {
            let bytes = serde_json::to_vec(body).map_err(|e| HttpError::Request(e.to_string()))?;
            builder = builder.body(bytes);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        debug!(status = status, path = %request.path, "API response received");
        Ok(ApiResponse::new(status, normalize_body(&text)))
    }
}

/// Parse a response body, wrapping non-JSON text as `{"error": text}`.
pub fn normalize_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "error": text }))
}
