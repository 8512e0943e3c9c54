//! Relay data: accounts, issued tokens, API keys, documents, and realtime rooms.
//!
//! Everything is in memory and lost on restart. Passwords are held only as SHA-256 digests.

use crate::backend::{ApiKey, Document, Notification, SearchQuery, SearchResult, SortOrder, TokenCheck};
use crate::config::RelayConfig;
use crate::protocol::{WsEvent, NOTIFICATION_EVENT};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// Request failure, reported to the client with an HTTP-like status.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(#[from] serde_json::Error),
}

impl RelayError {
    pub fn status(&self) -> u16 {
        match self {
            RelayError::BadRequest(_) => 400,
            RelayError::Unauthorized(_) => 401,
            RelayError::NotFound(_) => 404,
            RelayError::Internal(_) => 500,
        }
    }
}

/// Base64 SHA-256 of a password.
pub fn password_digest(password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(password.as_bytes()))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Realtime filter: `{}` matches every document, `{"equals": {field: value}}` matches on one body field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Equals {
        field: String,
        value: serde_json::Value,
    },
}

impl Filter {
    pub fn parse(raw: &serde_json::Value) -> Result<Self, RelayError> {
        let invalid = || RelayError::BadRequest(format!("unsupported filter: {}", raw));
        if raw.is_null() {
            return Ok(Filter::All);
        }
        let obj = raw.as_object().ok_or_else(invalid)?;
        if obj.is_empty() {
            return Ok(Filter::All);
        }
        if obj.len() != 1 {
            return Err(invalid());
        }
        let equals = obj
            .get("equals")
            .and_then(|v| v.as_object())
            .filter(|e| e.len() == 1)
            .ok_or_else(invalid)?;
        let (field, value) = equals.iter().next().ok_or_else(invalid)?;
        Ok(Filter::Equals {
            field: field.clone(),
            value: value.clone(),
        })
    }

    pub fn matches(&self, body: &serde_json::Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Equals { field, value } => body.get(field) == Some(value),
        }
    }
}

struct IssuedToken {
    username: String,
    /// Unix ms; None for API keys.
    expires_at: Option<i64>,
}

struct StoredKey {
    owner: String,
    token: String,
}

struct Room {
    conn_id: String,
    index: String,
    collection: String,
    filter: Filter,
}

#[derive(Default)]
struct Inner {
    tokens: HashMap<String, IssuedToken>,
    api_keys: HashMap<String, StoredKey>,
    collections: HashMap<(String, String), Vec<Document>>,
    rooms: HashMap<String, Room>,
    connections: HashMap<String, mpsc::UnboundedSender<String>>,
    last_created_at: i64,
}

pub struct RelayStore {
    users: HashMap<String, String>,
    token_ttl_ms: i64,
    inner: RwLock<Inner>,
}

impl RelayStore {
    pub fn new(config: &RelayConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| (u.username.clone(), password_digest(&u.password)))
            .collect();
        Self {
            users,
            token_ttl_ms: i64::try_from(config.token_ttl_secs.saturating_mul(1000))
                .unwrap_or(i64::MAX),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register a socket so notifications can reach it.
    pub async fn register(&self, conn_id: &str, tx: mpsc::UnboundedSender<String>) {
        self.inner
            .write()
            .await
            .connections
            .insert(conn_id.to_string(), tx);
    }

    /// Forget a socket and every room it held.
    pub async fn unregister(&self, conn_id: &str) {
        let mut inner = self.inner.write().await;
        inner.connections.remove(conn_id);
        inner.rooms.retain(|_, r| r.conn_id != conn_id);
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String, RelayError> {
        match self.users.get(username) {
            Some(digest) if *digest == password_digest(password) => {}
            _ => {
                return Err(RelayError::Unauthorized(
                    "wrong username or password".to_string(),
                ))
            }
        }
        let token = uuid::Uuid::new_v4().to_string();
        let expires_at = now_ms().saturating_add(self.token_ttl_ms);
        self.inner.write().await.tokens.insert(
            token.clone(),
            IssuedToken {
                username: username.to_string(),
                expires_at: Some(expires_at),
            },
        );
        log::info!("relay: {} logged in", username);
        Ok(token)
    }

    pub async fn check_token(&self, token: &str) -> TokenCheck {
        let inner = self.inner.read().await;
        match inner.tokens.get(token) {
            Some(t) if t.expires_at.map_or(true, |exp| exp > now_ms()) => TokenCheck {
                valid: true,
                expires_at: t.expires_at,
            },
            _ => TokenCheck {
                valid: false,
                expires_at: None,
            },
        }
    }

    /// Username for a request token; missing, unknown or expired tokens are 401.
    pub async fn authenticate(&self, jwt: Option<&str>) -> Result<String, RelayError> {
        let jwt = jwt.ok_or_else(|| RelayError::Unauthorized("authentication required".into()))?;
        let inner = self.inner.read().await;
        match inner.tokens.get(jwt) {
            Some(t) if t.expires_at.map_or(true, |exp| exp > now_ms()) => Ok(t.username.clone()),
            Some(_) => Err(RelayError::Unauthorized("token expired".into())),
            None => Err(RelayError::Unauthorized("invalid token".into())),
        }
    }

    pub async fn create_api_key(&self, owner: &str, description: &str) -> ApiKey {
        let key = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            token: uuid::Uuid::new_v4().to_string(),
        };
        let mut inner = self.inner.write().await;
        inner.tokens.insert(
            key.token.clone(),
            IssuedToken {
                username: owner.to_string(),
                expires_at: None,
            },
        );
        inner.api_keys.insert(
            key.id.clone(),
            StoredKey {
                owner: owner.to_string(),
                token: key.token.clone(),
            },
        );
        log::info!("relay: api key {} created for {} ({})", key.id, owner, description);
        key
    }

    pub async fn delete_api_key(&self, owner: &str, id: &str) -> Result<(), RelayError> {
        let mut inner = self.inner.write().await;
        match inner.api_keys.get(id) {
            Some(k) if k.owner == owner => {}
            _ => return Err(RelayError::NotFound(format!("api key {} not found", id))),
        }
        if let Some(key) = inner.api_keys.remove(id) {
            inner.tokens.remove(&key.token);
        }
        log::info!("relay: api key {} deleted", id);
        Ok(())
    }

    /// The most recent `size` documents, in the requested order.
    pub async fn search(&self, index: &str, collection: &str, query: &SearchQuery) -> SearchResult {
        let inner = self.inner.read().await;
        let docs = inner
            .collections
            .get(&(index.to_string(), collection.to_string()))
            .map(|d| d.as_slice())
            .unwrap_or_default();
        let mut hits = docs[docs.len().saturating_sub(query.size)..].to_vec();
        if query.sort == SortOrder::Desc {
            hits.reverse();
        }
        SearchResult {
            hits,
            total: docs.len(),
        }
    }

    /// Store a document and fan its creation out to every matching room.
    pub async fn create(
        &self,
        index: &str,
        collection: &str,
        body: serde_json::Value,
    ) -> Result<Document, RelayError> {
        if !body.is_object() {
            return Err(RelayError::BadRequest("document body must be an object".into()));
        }
        let mut inner = self.inner.write().await;
        let created_at = now_ms().max(inner.last_created_at + 1);
        inner.last_created_at = created_at;
        let doc = Document {
            id: uuid::Uuid::new_v4().to_string(),
            body,
            created_at,
        };
        inner
            .collections
            .entry((index.to_string(), collection.to_string()))
            .or_default()
            .push(doc.clone());

        let result = serde_json::to_value(&doc)?;
        for (room_id, room) in &inner.rooms {
            if room.index != index || room.collection != collection || !room.filter.matches(&doc.body) {
                continue;
            }
            let notification = Notification {
                room_id: room_id.clone(),
                kind: "document".to_string(),
                action: "create".to_string(),
                index: index.to_string(),
                collection: collection.to_string(),
                result: result.clone(),
            };
            let frame = serde_json::to_string(&WsEvent::new(
                NOTIFICATION_EVENT,
                serde_json::to_value(&notification)?,
            ))?;
            if let Some(tx) = inner.connections.get(&room.conn_id) {
                let _ = tx.send(frame);
            }
        }
        Ok(doc)
    }

    pub async fn subscribe(
        &self,
        conn_id: &str,
        index: &str,
        collection: &str,
        filter: &serde_json::Value,
    ) -> Result<String, RelayError> {
        let filter = Filter::parse(filter)?;
        let room_id = uuid::Uuid::new_v4().to_string();
        self.inner.write().await.rooms.insert(
            room_id.clone(),
            Room {
                conn_id: conn_id.to_string(),
                index: index.to_string(),
                collection: collection.to_string(),
                filter,
            },
        );
        log::debug!("relay: {} subscribed to {}/{} as {}", conn_id, index, collection, room_id);
        Ok(room_id)
    }

    pub async fn unsubscribe(&self, conn_id: &str, room_id: &str) -> Result<(), RelayError> {
        let mut inner = self.inner.write().await;
        match inner.rooms.get(room_id) {
            Some(r) if r.conn_id == conn_id => {
                inner.rooms.remove(room_id);
                Ok(())
            }
            _ => Err(RelayError::NotFound(format!("room {} not found", room_id))),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }
}
