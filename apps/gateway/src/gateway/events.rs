//! Control-channel wire envelopes and observer updates.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Inner message type the LFS.X emits once it finished booting.
pub const LFS_STARTUP_KEY: &str = "LfsStartup";
pub const LOGIN_REQUEST_KEY: &str = "LoginRequest";

/// JSON envelope carried over the control WebSocket in both directions.
/// Wraps a list of messages and provides a basic request/response mechanism
/// through `id` / `responseTo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketData {
    /// 20-bit random id identifying this envelope.
    #[serde(default)]
    pub id: i64,
    /// Id of the envelope this one responds to, 0 when unsolicited.
    #[serde(rename = "responseTo", default)]
    pub response_to: i64,
    #[serde(default)]
    pub messages: Vec<WebSocketMessage>,
}

impl WebSocketData {
    pub fn new(response_to: i64, messages: Vec<WebSocketMessage>) -> Self {
        Self {
            id: rand::thread_rng().gen_range(0..1 << 20),
            response_to,
            messages,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!(?e, "failed to marshal control envelope");
            "{}".to_string()
        })
    }
}

/// A single message inside an envelope. `kind` names the payload variant;
/// unknown variants are carried opaquely (only the envelope is re-sent, never
/// a re-serialized message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "loginRequest", skip_serializing_if = "Option::is_none")]
    pub login_request: Option<LoginRequest>,
}

impl WebSocketMessage {
    pub fn login(username: &str, password: &str, db: &str) -> Self {
        Self {
            kind: LOGIN_REQUEST_KEY.to_string(),
            login_request: Some(LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
                db: db.to_string(),
            }),
        }
    }
}

/// Sent in-band to log the user into the LFS with the credentials provided
/// to the web interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub db: String,
}

/// Observer notification, one per inner message of a received envelope.
#[derive(Debug, Clone)]
pub struct Update {
    pub message: WebSocketMessage,
    /// Id of the enclosing envelope.
    pub id: i64,
    pub response_to: i64,
    /// Whether the envelope came from the LFS.X side.
    pub from_backend: bool,
}
