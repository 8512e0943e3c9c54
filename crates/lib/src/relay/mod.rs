//! Dev relay: an in-memory chat backend speaking the client wire protocol.
//!
//! Single port serves HTTP (health at `/`) and WebSocket (`/ws`). Every socket may issue
//! requests and receives notifications for the rooms it opened. Data lives only as long as
//! the process.

mod state;

pub use state::{password_digest, Filter, RelayError, RelayStore};

use crate::backend::{Credentials, SearchQuery};
use crate::config::{Config, RelayConfig};
use crate::protocol::{WsEvent, WsRequest, WsResponse, PROTOCOL_VERSION, SHUTDOWN_EVENT};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

/// Control events fanned out to every open socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEvent {
    /// Send the shutdown event frame, then close.
    Shutdown,
    /// Close without notice; clients see a dropped link and reconnect.
    DropConnections,
}

/// A relay instance. Its data outlives individual `serve` calls.
pub struct Relay {
    store: Arc<RelayStore>,
    events: broadcast::Sender<RelayEvent>,
}

#[derive(Clone)]
struct AppState {
    port: u16,
    store: Arc<RelayStore>,
    events: broadcast::Sender<RelayEvent>,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            store: Arc::new(RelayStore::new(config)),
            events,
        }
    }

    pub fn store(&self) -> &RelayStore {
        &self.store
    }

    /// Close every open socket. Clients reconnect on their own.
    pub fn drop_connections(&self) {
        let _ = self.events.send(RelayEvent::DropConnections);
    }

    /// Serve on `listener` until `shutdown` completes; sockets get a shutdown event before closing.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().context("reading relay listen address")?;
        let state = AppState {
            port: addr.port(),
            store: self.store.clone(),
            events: self.events.clone(),
        };
        let app = Router::new()
            .route("/", get(health_http))
            .route("/ws", get(ws_handler))
            .with_state(state);
        log::info!("relay listening on {}", addr);

        let events = self.events.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                log::info!("relay shutting down, closing connections");
                let _ = events.send(RelayEvent::Shutdown);
            })
            .await
            .context("relay server exited")?;
        log::info!("relay stopped");
        Ok(())
    }
}

/// Run the relay on relay.bind:relay.port. Blocks until SIGINT/SIGTERM.
pub async fn run_relay(config: Config) -> Result<()> {
    if config.relay.users.is_empty() {
        log::warn!("relay has no users configured; every login will fail (run `chatline init`)");
    }
    let bind_addr = format!("{}:{}", config.relay.bind.trim(), config.relay.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    Relay::new(&config.relay).serve(listener, shutdown_signal()).await
}

/// Completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("could not install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("could not install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.port,
    }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let mut event_rx = state.events.subscribe();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
    state.store.register(&conn_id, push_tx).await;
    log::debug!("relay: connection {} opened", conn_id);

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(RelayEvent::Shutdown) => {
                        let frame = serde_json::to_string(&WsEvent::new(SHUTDOWN_EVENT, json!({})))
                            .unwrap_or_default();
                        let _ = socket.send(Message::Text(frame)).await;
                        break;
                    }
                    Ok(RelayEvent::DropConnections) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("relay: connection {} lagged {} control events", conn_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            frame = push_rx.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let req: WsRequest = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        log::debug!("relay: unreadable frame on {}: {}", conn_id, e);
                        continue;
                    }
                };
                if req.typ != "req" {
                    continue;
                }
                let res = match dispatch(&state.store, &conn_id, &req).await {
                    Ok(payload) => WsResponse::ok(&req.id, payload),
                    Err(e) => {
                        log::debug!("relay: {} failed ({}): {}", req.route(), e.status(), e);
                        WsResponse::err(&req.id, e.status(), e.to_string())
                    }
                };
                let text = serde_json::to_string(&res).unwrap_or_default();
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    state.store.unregister(&conn_id).await;
    log::debug!("relay: connection {} closed", conn_id);
}

#[derive(Deserialize)]
struct LoginParams {
    strategy: String,
    credentials: Credentials,
}

#[derive(Deserialize)]
struct TokenParams {
    token: String,
}

#[derive(Deserialize)]
struct CreateApiKeyParams {
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct DeleteApiKeyParams {
    id: String,
}

#[derive(Deserialize)]
struct SearchParams {
    index: String,
    collection: String,
    #[serde(flatten)]
    query: SearchQuery,
}

#[derive(Deserialize)]
struct CreateParams {
    index: String,
    collection: String,
    body: serde_json::Value,
}

#[derive(Deserialize)]
struct SubscribeParams {
    index: String,
    collection: String,
    #[serde(default)]
    filter: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnsubscribeParams {
    room_id: String,
}

fn params<T: DeserializeOwned>(req: &WsRequest) -> Result<T, RelayError> {
    serde_json::from_value(req.params.clone())
        .map_err(|e| RelayError::BadRequest(format!("invalid {} params: {}", req.route(), e)))
}

async fn dispatch(
    store: &RelayStore,
    conn_id: &str,
    req: &WsRequest,
) -> Result<serde_json::Value, RelayError> {
    match (req.controller.as_str(), req.action.as_str()) {
        ("auth", "login") => {
            let p: LoginParams = params(req)?;
            if p.strategy != "local" {
                return Err(RelayError::BadRequest(format!(
                    "unknown login strategy {}",
                    p.strategy
                )));
            }
            let jwt = store
                .login(&p.credentials.username, &p.credentials.password)
                .await?;
            Ok(json!({ "jwt": jwt }))
        }
        ("auth", "checkToken") => {
            let p: TokenParams = params(req)?;
            Ok(serde_json::to_value(store.check_token(&p.token).await)?)
        }
        ("auth", "createApiKey") => {
            let user = store.authenticate(req.jwt.as_deref()).await?;
            let p: CreateApiKeyParams = params(req)?;
            Ok(serde_json::to_value(
                store.create_api_key(&user, &p.description).await,
            )?)
        }
        ("auth", "deleteApiKey") => {
            let user = store.authenticate(req.jwt.as_deref()).await?;
            let p: DeleteApiKeyParams = params(req)?;
            store.delete_api_key(&user, &p.id).await?;
            Ok(json!({ "id": p.id }))
        }
        ("document", "search") => {
            let p: SearchParams = params(req)?;
            Ok(serde_json::to_value(
                store.search(&p.index, &p.collection, &p.query).await,
            )?)
        }
        ("document", "create") => {
            store.authenticate(req.jwt.as_deref()).await?;
            let p: CreateParams = params(req)?;
            Ok(serde_json::to_value(
                store.create(&p.index, &p.collection, p.body).await?,
            )?)
        }
        ("realtime", "subscribe") => {
            let p: SubscribeParams = params(req)?;
            let room_id = store
                .subscribe(conn_id, &p.index, &p.collection, &p.filter)
                .await?;
            Ok(json!({ "roomId": room_id }))
        }
        ("realtime", "unsubscribe") => {
            let p: UnsubscribeParams = params(req)?;
            store.unsubscribe(conn_id, &p.room_id).await?;
            Ok(json!({ "roomId": p.room_id }))
        }
        _ => Err(RelayError::BadRequest(format!(
            "unknown action {}",
            req.route()
        ))),
    }
}
