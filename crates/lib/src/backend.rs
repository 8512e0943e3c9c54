//! Backend boundary: the calls the chat core makes against the remote service.
//!
//! `Backend` is the seam between the session core and a concrete transport. `WsTransport`
//! implements it over the relay wire protocol; tests implement it in memory.

use crate::transport::{ConnectionError, ConnectionState};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Failure of a backend call: either the transport failed or the server rejected the request.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// True when the server answered 401 (bad credentials, missing or expired token).
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BackendError::Rejected { status: 401, .. })
    }
}

/// Username/password pair for the "local" login strategy.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Result of auth:checkToken.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCheck {
    pub valid: bool,
    /// Unix ms expiry, absent for tokens that never expire (API keys).
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// A durable API key: `id` revokes it, `token` authenticates with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub token: String,
}

/// A stored document as returned by search/create and carried in notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub body: serde_json::Value,
    /// Unix ms, assigned by the backend.
    pub created_at: i64,
}

impl Document {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at).single()
    }
}

/// Sort direction on `createdAt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// document:search parameters (the subset the chat core needs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    #[serde(default)]
    pub sort: SortOrder,
    pub size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub hits: Vec<Document>,
    #[serde(default)]
    pub total: usize,
}

/// Realtime notification pushed for a subscribed room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub room_id: String,
    /// Notification kind, e.g. "document" or "user".
    #[serde(rename = "type")]
    pub kind: String,
    /// e.g. "create", "update", "delete".
    pub action: String,
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Calls against the remote service. Connection lifecycle lives here too because the
/// transport is the only component allowed to mutate `ConnectionState`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Bring the link up. An error means the first attempt failed; retries may continue in the background.
    async fn connect(&self) -> Result<(), ConnectionError>;
    /// Tear the link down and stop reconnecting.
    async fn disconnect(&self);
    /// Observe the connection state (never mutate it).
    fn state(&self) -> watch::Receiver<ConnectionState>;
    /// Install (or clear) the token sent with authenticated requests.
    fn set_token(&self, token: Option<String>);

    async fn login(&self, strategy: &str, credentials: &Credentials) -> Result<String, BackendError>;
    async fn check_token(&self, token: &str) -> Result<TokenCheck, BackendError>;
    async fn create_api_key(&self, label: &str) -> Result<ApiKey, BackendError>;
    async fn delete_api_key(&self, id: &str) -> Result<(), BackendError>;
    async fn search(
        &self,
        index: &str,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<SearchResult, BackendError>;
    async fn create_document(
        &self,
        index: &str,
        collection: &str,
        body: serde_json::Value,
    ) -> Result<Document, BackendError>;
    /// Open a realtime room; returns its room id. Notifications arrive on the transport event channel.
    async fn subscribe(
        &self,
        index: &str,
        collection: &str,
        filter: serde_json::Value,
    ) -> Result<String, BackendError>;
    async fn unsubscribe(&self, room_id: &str) -> Result<(), BackendError>;
}
