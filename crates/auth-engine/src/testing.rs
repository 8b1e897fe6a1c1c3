//! In-memory [`HttpBackend`] driven by scripted responses.

use crate::http::{ApiRequest, ApiResponse, HttpBackend, HttpError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

type Scripted = Result<ApiResponse, HttpError>;

/// Responses are queued per route. The last queued response for a route is
/// repeated once the queue is drained to it. Token requests are routed by
/// grant type (`api/token#refresh_token`), everything else by path.
#[derive(Default)]
pub struct ScriptedBackend {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<ApiRequest>>,
    latency: Mutex<Option<Duration>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, route: &str, status: u16, body: Value) {
        self.push(route, Ok(ApiResponse::new(status, body)));
    }

    pub fn respond_grant(&self, grant_type: &str, status: u16, body: Value) {
        self.respond(&format!("api/token#{}", grant_type), status, body);
    }

    pub fn fail(&self, route: &str, err: HttpError) {
        self.push(route, Err(err));
    }

    /// Delay every response, to hold requests in flight.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, route: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|req| route_key(req) == route || req.path == route)
            .count()
    }

    pub fn grant_calls(&self, grant_type: &str) -> usize {
        self.calls_to(&format!("api/token#{}", grant_type))
    }

    fn push(&self, route: &str, response: Scripted) {
        self.routes
            .lock()
            .entry(route.to_string())
            .or_default()
            .push_back(response);
    }

    fn next_for(&self, request: &ApiRequest) -> Scripted {
        let key = route_key(request);
        let mut routes = self.routes.lock();
        let Some(queue) = routes.get_mut(&key) else {
            return Ok(not_scripted(&key));
        };

        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        next.unwrap_or_else(|| Ok(not_scripted(&key)))
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, HttpError> {
        self.calls.lock().push(request.clone());
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.next_for(&request)
    }
}

fn route_key(request: &ApiRequest) -> String {
    let grant = request
        .body
        .as_ref()
        .and_then(|b| b.get("grant_type"))
        .and_then(Value::as_str);
    match grant {
        Some(grant) => format!("{}#{}", request.path, grant),
        None => request.path.clone(),
    }
}

fn not_scripted(route: &str) -> ApiResponse {
    ApiResponse::new(404, json!({ "error": format!("no scripted response for {}", route) }))
}

/// Token endpoint success body.
pub fn token_body(access: &str, refresh: &str, expires_in: i64) -> Value {
    json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": expires_in,
        "token_type": "Bearer",
    })
}
