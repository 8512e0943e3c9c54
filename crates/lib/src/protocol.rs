//! WebSocket wire protocol shared by the client transport and the dev relay.
//!
//! Three frame kinds, all JSON text frames distinguished by `type`:
//! requests (`req`), responses (`res`) correlated by `id`, and server-pushed events (`event`).

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Event name carrying a realtime notification.
pub const NOTIFICATION_EVENT: &str = "notification";

/// Event name broadcast when the relay is shutting down.
pub const SHUTDOWN_EVENT: &str = "shutdown";

/// Wire request: `{ "type": "req", "id", "controller", "action", "jwt"?, "params" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub controller: String,
    pub action: String,
    /// Token authenticating this request; absent for anonymous calls (login, checkToken, search).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Wire response: `{ "type": "res", "id", "ok", "payload" or "error" + "status" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// HTTP-like status for errors (400 bad request, 401 unauthorized, 404 not found).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// Server-pushed event: `{ "type": "event", "event", "payload" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub typ: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A frame received by the client, classified by its `type` field.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    Response(WsResponse),
    Event(WsEvent),
}

impl WsRequest {
    pub fn new(
        id: impl Into<String>,
        controller: impl Into<String>,
        action: impl Into<String>,
        jwt: Option<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            typ: "req".to_string(),
            id: id.into(),
            controller: controller.into(),
            action: action.into(),
            jwt,
            params,
        }
    }

    /// `controller:action`, used for dispatch and logging.
    pub fn route(&self) -> String {
        format!("{}:{}", self.controller, self.action)
    }
}

impl WsResponse {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
            status: None,
        }
    }

    pub fn err(id: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
            status: Some(status),
        }
    }
}

impl WsEvent {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            typ: "event".to_string(),
            event: event.into(),
            payload,
        }
    }
}

/// Parse a text frame from the server. Returns None for frames that are neither `res` nor `event`.
pub fn parse_server_frame(text: &str) -> Result<Option<ServerFrame>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value.get("type").and_then(|v| v.as_str()) {
        Some("res") => Ok(Some(ServerFrame::Response(serde_json::from_value(value)?))),
        Some("event") => Ok(Some(ServerFrame::Event(serde_json::from_value(value)?))),
        _ => Ok(None),
    }
}
