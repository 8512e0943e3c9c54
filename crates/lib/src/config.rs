//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.chatline/config.json`) and environment.
//! The `client` section drives the chat session core; the `relay` section drives the
//! in-process development backend.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Chat client settings (backend URL, room, timeouts).
    #[serde(default)]
    pub client: ClientConfig,

    /// Dev relay server settings.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Chat client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket URL of the backend (default "ws://127.0.0.1:17171/ws"). Overridden by CHATLINE_URL env.
    #[serde(default = "default_client_url")]
    pub url: String,

    /// Index holding the chat collection (default "messaging-app").
    #[serde(default = "default_index")]
    pub index: String,

    /// Collection of chat messages (default "messages").
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Number of messages loaded by the history fetch (default 100).
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// How long a sent message may wait for its live echo before it is reported unconfirmed.
    #[serde(default = "default_echo_timeout_ms")]
    pub echo_timeout_ms: u64,

    /// Upper bound on a single request/response round-trip.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Override for the persisted credential file (default ~/.chatline/credentials.json).
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

/// Reconnect backoff: delay starts at `floorMs`, doubles per failed attempt, never exceeds `capMs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_floor_ms")]
    pub floor_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub cap_ms: u64,
}

/// Dev relay bind, port, and accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Port for HTTP and WebSocket (default 17171).
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_relay_bind")]
    pub bind: String,

    /// Accounts accepted by the "local" login strategy.
    #[serde(default)]
    pub users: Vec<RelayUser>,

    /// Lifetime of tokens issued by auth:login (API keys never expire).
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

/// One relay account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayUser {
    pub username: String,
    pub password: String,
}

fn default_client_url() -> String {
    format!("ws://{}:{}/ws", default_relay_bind(), default_relay_port())
}

fn default_index() -> String {
    "messaging-app".to_string()
}

fn default_collection() -> String {
    "messages".to_string()
}

fn default_history_size() -> usize {
    100
}

fn default_echo_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_floor_ms() -> u64 {
    500
}

fn default_reconnect_cap_ms() -> u64 {
    30_000
}

fn default_relay_port() -> u16 {
    17171
}

fn default_relay_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_token_ttl_secs() -> u64 {
    3600
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_client_url(),
            index: default_index(),
            collection: default_collection(),
            history_size: default_history_size(),
            echo_timeout_ms: default_echo_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reconnect: ReconnectConfig::default(),
            credentials_path: None,
        }
    }
}

impl ClientConfig {
    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            floor_ms: default_reconnect_floor_ms(),
            cap_ms: default_reconnect_cap_ms(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            bind: default_relay_bind(),
            users: Vec::new(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

/// Resolve the backend URL: env CHATLINE_URL overrides config.
pub fn resolve_client_url(config: &Config) -> String {
    std::env::var("CHATLINE_URL")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .unwrap_or_else(|| config.client.url.trim().to_string())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CHATLINE_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".chatline").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Resolve the credential file: `client.credentialsPath` if set (relative paths resolved against the
/// config file's parent), otherwise `credentials.json` next to the config file.
pub fn resolve_credentials_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.client.credentials_path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("credentials.json"),
    }
}

/// Load config from the given path (or the default path). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
