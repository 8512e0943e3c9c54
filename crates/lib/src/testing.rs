//! In-memory backend and credential store doubles for unit tests.

use crate::backend::{
    ApiKey, Backend, BackendError, Credentials, Document, Notification, SearchQuery, SearchResult,
    SortOrder, TokenCheck,
};
use crate::credentials::{CredentialStore, PersistedUser, StorageError, PERSISTED_USER_KEY};
use crate::transport::{
    ConnectionError, ConnectionState, ConnectionTracker, LinkSignal, TransportEvent,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

const CLOCK_START_MS: i64 = 1_700_000_000_000;

struct Room {
    index: String,
    collection: String,
}

struct Inner {
    users: HashMap<String, String>,
    valid_tokens: HashSet<String>,
    api_keys: HashMap<String, String>,
    token: Option<String>,
    docs: Vec<Document>,
    clock: i64,
    rooms: HashMap<String, Room>,
    failing: HashMap<String, u16>,
    echo: bool,
    next_id: u64,
    calls: Vec<String>,
}

impl Inner {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn authorized(&self) -> Result<(), BackendError> {
        match &self.token {
            Some(t) if self.valid_tokens.contains(t) => Ok(()),
            _ => Err(BackendError::Rejected {
                status: 401,
                message: "unauthorized".into(),
            }),
        }
    }
}

pub(crate) struct FakeBackend {
    tracker: ConnectionTracker,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<Inner>,
}

impl FakeBackend {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backend = Self {
            tracker: ConnectionTracker::new(),
            events_tx,
            inner: Mutex::new(Inner {
                users: HashMap::new(),
                valid_tokens: HashSet::new(),
                api_keys: HashMap::new(),
                token: None,
                docs: Vec::new(),
                clock: CLOCK_START_MS,
                rooms: HashMap::new(),
                failing: HashMap::new(),
                echo: true,
                next_id: 0,
                calls: Vec::new(),
            }),
        };
        (Arc::new(backend), events_rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn signal(&self, signal: LinkSignal) {
        if let Some(ev) = self.tracker.apply(signal) {
            let _ = self.events_tx.send(TransportEvent::Connection(ev));
        }
    }

    /// Record the call and apply connection and injected-failure checks.
    fn enter(&self, op: &str) -> Result<MutexGuard<'_, Inner>, BackendError> {
        let mut inner = self.lock();
        inner.calls.push(op.to_string());
        if !self.tracker.state().is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        if let Some(&status) = inner.failing.get(op) {
            return Err(BackendError::Rejected {
                status,
                message: format!("{} failed", op),
            });
        }
        Ok(inner)
    }

    pub(crate) fn add_user(&self, username: &str, password: &str) {
        self.lock()
            .users
            .insert(username.to_string(), password.to_string());
    }

    /// Bring the link up (first connect or recovery).
    pub(crate) fn link_up(&self) {
        if self.tracker.state() == ConnectionState::Disconnected {
            self.signal(LinkSignal::Opening);
        }
        self.signal(LinkSignal::Up);
    }

    /// Drop the link; rooms die with it and a retry is implied.
    pub(crate) fn link_down(&self) {
        self.lock().rooms.clear();
        self.signal(LinkSignal::Down);
    }

    /// Push a raw notification as if it came off the wire.
    pub(crate) fn push(&self, notification: Notification) {
        let _ = self
            .events_tx
            .send(TransportEvent::Notification(notification));
    }

    /// Store `n` messages authored by "bob", one millisecond apart.
    pub(crate) fn seed_messages(&self, n: usize) {
        let mut inner = self.lock();
        for i in 0..n {
            let id = inner.id("seed");
            inner.clock += 1;
            let created_at = inner.clock;
            inner.docs.push(Document {
                id,
                body: serde_json::json!({ "author": "bob", "content": format!("message {}", i) }),
                created_at,
            });
        }
    }

    pub(crate) fn fail(&self, op: &str) {
        self.fail_with(op, 500);
    }

    /// Make `op` answer with a rejection carrying `status`.
    pub(crate) fn fail_with(&self, op: &str, status: u16) {
        self.lock().failing.insert(op.to_string(), status);
    }

    pub(crate) fn heal(&self, op: &str) {
        self.lock().failing.remove(op);
    }

    /// Whether created documents are pushed back to matching rooms.
    pub(crate) fn set_echo(&self, echo: bool) {
        self.lock().echo = echo;
    }

    pub(crate) fn current_token(&self) -> Option<String> {
        self.lock().token.clone()
    }

    pub(crate) fn is_token_valid(&self, token: &str) -> bool {
        self.lock().valid_tokens.contains(token)
    }

    /// Invalidate a token server side (expiry, revocation from elsewhere).
    pub(crate) fn revoke(&self, token: &str) {
        self.lock().valid_tokens.remove(token);
    }

    pub(crate) fn open_rooms(&self) -> usize {
        self.lock().rooms.len()
    }

    pub(crate) fn room_ids(&self) -> Vec<String> {
        self.lock().rooms.keys().cloned().collect()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub(crate) fn documents(&self) -> Vec<Document> {
        self.lock().docs.clone()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn connect(&self) -> Result<(), ConnectionError> {
        let failing = {
            let mut inner = self.lock();
            inner.calls.push("connect".into());
            inner.failing.contains_key("connect")
        };
        if failing {
            if self.tracker.state() == ConnectionState::Disconnected {
                self.signal(LinkSignal::Opening);
            }
            return Err(ConnectionError::Unreachable("refused".into()));
        }
        self.link_up();
        Ok(())
    }

    async fn disconnect(&self) {
        self.lock().rooms.clear();
        self.signal(LinkSignal::Closed);
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.tracker.subscribe()
    }

    fn set_token(&self, token: Option<String>) {
        self.lock().token = token;
    }

    async fn login(&self, strategy: &str, credentials: &Credentials) -> Result<String, BackendError> {
        let mut inner = self.enter("login")?;
        if strategy != "local" {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("unknown strategy {}", strategy),
            });
        }
        if inner.users.get(&credentials.username) != Some(&credentials.password) {
            return Err(BackendError::Rejected {
                status: 401,
                message: "wrong username or password".into(),
            });
        }
        let jwt = inner.id("jwt");
        inner.valid_tokens.insert(jwt.clone());
        Ok(jwt)
    }

    async fn check_token(&self, token: &str) -> Result<TokenCheck, BackendError> {
        let inner = self.enter("check_token")?;
        Ok(TokenCheck {
            valid: inner.valid_tokens.contains(token),
            expires_at: None,
        })
    }

    async fn create_api_key(&self, _label: &str) -> Result<ApiKey, BackendError> {
        let mut inner = self.enter("create_api_key")?;
        inner.authorized()?;
        let id = inner.id("key");
        let token = inner.id("apikey");
        inner.api_keys.insert(id.clone(), token.clone());
        inner.valid_tokens.insert(token.clone());
        Ok(ApiKey { id, token })
    }

    async fn delete_api_key(&self, id: &str) -> Result<(), BackendError> {
        let mut inner = self.enter("delete_api_key")?;
        inner.authorized()?;
        let token = inner.api_keys.remove(id).ok_or_else(|| BackendError::Rejected {
            status: 404,
            message: format!("no api key {}", id),
        })?;
        inner.valid_tokens.remove(&token);
        Ok(())
    }

    async fn search(
        &self,
        _index: &str,
        _collection: &str,
        query: &SearchQuery,
    ) -> Result<SearchResult, BackendError> {
        let inner = self.enter("search")?;
        let total = inner.docs.len();
        let mut hits: Vec<Document> = inner
            .docs
            .iter()
            .skip(total.saturating_sub(query.size))
            .cloned()
            .collect();
        if query.sort == SortOrder::Desc {
            hits.reverse();
        }
        Ok(SearchResult { hits, total })
    }

    async fn create_document(
        &self,
        index: &str,
        collection: &str,
        body: serde_json::Value,
    ) -> Result<Document, BackendError> {
        let mut inner = self.enter("create_document")?;
        inner.authorized()?;
        let id = inner.id("doc");
        inner.clock += 1;
        let doc = Document {
            id,
            body,
            created_at: inner.clock,
        };
        inner.docs.push(doc.clone());
        if inner.echo {
            for (room_id, room) in &inner.rooms {
                if room.index == index && room.collection == collection {
                    self.push(Notification {
                        room_id: room_id.clone(),
                        kind: "document".into(),
                        action: "create".into(),
                        index: index.into(),
                        collection: collection.into(),
                        result: serde_json::to_value(&doc).unwrap(),
                    });
                }
            }
        }
        Ok(doc)
    }

    async fn subscribe(
        &self,
        index: &str,
        collection: &str,
        _filter: serde_json::Value,
    ) -> Result<String, BackendError> {
        let mut inner = self.enter("subscribe")?;
        let room_id = inner.id("room");
        inner.rooms.insert(
            room_id.clone(),
            Room {
                index: index.to_string(),
                collection: collection.to_string(),
            },
        );
        Ok(room_id)
    }

    async fn unsubscribe(&self, room_id: &str) -> Result<(), BackendError> {
        let mut inner = self.enter("unsubscribe")?;
        inner.rooms.remove(room_id);
        Ok(())
    }
}

/// Credential store that serves reads from memory and refuses every write.
#[derive(Default)]
pub(crate) struct ReadOnlyCredentials {
    entries: HashMap<String, String>,
}

impl ReadOnlyCredentials {
    pub(crate) fn with_user(user: &PersistedUser) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            PERSISTED_USER_KEY.to_string(),
            serde_json::to_string(user).unwrap(),
        );
        Self { entries }
    }

    fn refuse() -> StorageError {
        std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only store").into()
    }
}

#[async_trait]
impl CredentialStore for ReadOnlyCredentials {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    async fn set(&self, _key: &str, _value: String) -> Result<(), StorageError> {
        Err(Self::refuse())
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Err(Self::refuse())
    }
}
