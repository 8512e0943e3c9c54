//! Persisted credential store: key `persistedUser` → `{username, jwt, tokenId}`.
//!
//! The file store keeps a small JSON object of keys at e.g. ~/.chatline/credentials.json.
//! Missing or corrupt entries read as absent so the caller falls back to the login flow.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Key under which the logged-in user is persisted.
pub const PERSISTED_USER_KEY: &str = "persistedUser";

/// What survives a relaunch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUser {
    pub username: String,
    pub jwt: String,
    pub token_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("credential storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential storage encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key/value credential storage.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Read the persisted user; absent, unreadable or corrupt entries are `None`.
pub async fn load_persisted_user(store: &dyn CredentialStore) -> Option<PersistedUser> {
    let raw = store.get(PERSISTED_USER_KEY).await?;
    match serde_json::from_str::<PersistedUser>(&raw) {
        Ok(user) if !user.jwt.trim().is_empty() => Some(user),
        Ok(_) => {
            log::warn!("credentials: persisted user has an empty token, ignoring");
            None
        }
        Err(e) => {
            log::warn!("credentials: persisted user is corrupt, ignoring: {}", e);
            None
        }
    }
}

pub async fn save_persisted_user(
    store: &dyn CredentialStore,
    user: &PersistedUser,
) -> Result<(), StorageError> {
    store
        .set(PERSISTED_USER_KEY, serde_json::to_string(user)?)
        .await
}

/// JSON-file backed store; loads once, writes through on every change.
pub struct FileCredentialStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileCredentialStore {
    /// Load store from path; if file missing or invalid, starts empty.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                log::warn!("credentials: {} is corrupt, starting empty: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(entries)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value);
        self.save(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.save(&entries).await
    }
}

/// In-memory store (tests, ephemeral sessions).
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
