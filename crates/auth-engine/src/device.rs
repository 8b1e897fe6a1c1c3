//! Client identity sent with every token request.
//!
//! The platform ties MFA approval to the client id, so reusing the same id
//! across runs avoids a new email challenge each time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use uuid::Uuid;

const CLIENT_ID_SUFFIX: &str = ".WebApp.simplisafe.com";

/// Raw client id plus the derived identifiers the token endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    client_id: String,
    client_id_string: String,
    device_id: String,
}

impl ClientIdentity {
    /// Use the given client id, or a fresh random UUID when `None` or blank.
    pub fn new(client_id: Option<&str>) -> Self {
        let client_id = match client_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        Self {
            client_id_string: format!("{}{}", client_id, CLIENT_ID_SUFFIX),
            device_id: generate_device_id(&client_id),
            client_id,
        }
    }

    /// The raw id; also the value used in refresh grants.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `<client_id>.WebApp.simplisafe.com`, used in password and MFA grants.
    pub fn client_id_string(&self) -> &str {
        &self.client_id_string
    }

    /// Short `xxxxx-xxxxx` device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Device descriptor for the password grant's `device_id` field.
    pub fn device_descriptor(&self) -> String {
        format!(
            "WebApp; useragent=\"Safari 13.1 (SS-ID: {dev}) / macOS 10.15.6\"; uuid=\"{uuid}\"; id=\"{dev}\"",
            dev = self.device_id,
            uuid = self.client_id,
        )
    }
}

/// First ten characters of base64(client_id), split 5-5 with a dash.
fn generate_device_id(client_id: &str) -> String {
    let seed: String = STANDARD.encode(client_id.as_bytes()).chars().take(10).collect();
    let split = seed.char_indices().nth(5).map(|(i, _)| i).unwrap_or(seed.len());
    format!("{}-{}", &seed[..split], &seed[split..])
}
