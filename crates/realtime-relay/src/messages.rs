//! Realtime protocol frames.
//!
//! Client to server: `{"type":"auth","accessToken":"...","userId":123}`.
//! Server to client: `auth.ok`, `auth.error`, or an event frame carrying
//! `type`, `systemId`, `sourceId`, `timestamp` and `payload`.

use crate::{RelayError, RelayResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;

const AUTH_OK: &str = "auth.ok";
const AUTH_ERROR: &str = "auth.error";

/// Event type name, e.g. `sensor.opened` or `lock.unlocked`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for EventType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One push notification. Immutable once decoded; the payload is kept
/// exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    system_id: u64,
    #[serde(deserialize_with = "string_or_number")]
    source_id: String,
    #[serde(deserialize_with = "flexible_timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
}

impl Event {
    pub fn new(
        event_type: impl Into<EventType>,
        system_id: u64,
        source_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            system_id,
            source_id: source_id.into(),
            timestamp,
            payload,
        }
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn system_id(&self) -> u64 {
        self.system_id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "auth", rename_all = "camelCase")]
    Auth {
        access_token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<u64>,
    },
}

impl ClientFrame {
    pub fn auth(access_token: &str, user_id: Option<u64>) -> Self {
        ClientFrame::Auth {
            access_token: access_token.to_string(),
            user_id,
        }
    }

    pub fn to_json(&self) -> RelayResult<String> {
        serde_json::to_string(self).map_err(RelayError::from)
    }
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    AuthOk,
    AuthRejected { message: String },
    Event(Event),
}

impl ServerFrame {
    pub fn parse(text: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Protocol("frame has no type".to_string()))?;

        match frame_type {
            AUTH_OK => Ok(ServerFrame::AuthOk),
            AUTH_ERROR => Ok(ServerFrame::AuthRejected {
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("authentication rejected")
                    .to_string(),
            }),
            _ => Ok(ServerFrame::Event(serde_json::from_value(value)?)),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// RFC 3339 string or Unix seconds.
fn flexible_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(de::Error::custom),
        Value::Number(n) => {
            let secs = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| de::Error::custom("timestamp out of range"))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| de::Error::custom("timestamp out of range"))
        }
        other => Err(de::Error::custom(format!(
            "expected timestamp, got {}",
            other
        ))),
    }
}
