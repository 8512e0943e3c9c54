//! WebSocket transport: request/response correlation, notification forwarding, and a
//! supervisor loop that reconnects with backoff until `disconnect` is called.

use super::{Backoff, ConnectionError, ConnectionTracker, LinkSignal, TransportEvent};
use crate::backend::{
    ApiKey, Backend, BackendError, Credentials, Document, Notification, SearchQuery, SearchResult,
    TokenCheck,
};
use crate::config::{ClientConfig, ReconnectConfig};
use crate::protocol::{
    parse_server_frame, ServerFrame, WsRequest, WsResponse, NOTIFICATION_EVENT, SHUTDOWN_EVENT,
};
use crate::transport::ConnectionState;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type FirstAttempt = oneshot::Sender<Result<(), ConnectionError>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the transport handle and its link task.
struct Shared {
    url: String,
    request_timeout: Duration,
    reconnect: ReconnectConfig,
    tracker: ConnectionTracker,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Writer for the current socket; None while the link is down.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<WsResponse>>>,
}

impl Shared {
    fn signal(&self, signal: LinkSignal) {
        if let Some(event) = self.tracker.apply(signal) {
            log::info!("transport: {:?}", event);
            let _ = self.events_tx.send(TransportEvent::Connection(event));
        }
    }

    /// Drop every in-flight request; their callers observe `ConnectionError::Lost`.
    fn fail_pending(&self) {
        let dropped = std::mem::take(&mut *lock(&self.pending));
        if !dropped.is_empty() {
            log::debug!("transport: invalidated {} in-flight request(s)", dropped.len());
        }
    }

    fn handle_frame(&self, text: &str) {
        match parse_server_frame(text) {
            Ok(Some(ServerFrame::Response(res))) => {
                let waiter = lock(&self.pending).remove(&res.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(res);
                    }
                    None => log::debug!("transport: response for unknown request {}", res.id),
                }
            }
            Ok(Some(ServerFrame::Event(ev))) if ev.event == NOTIFICATION_EVENT => {
                match serde_json::from_value::<Notification>(ev.payload) {
                    Ok(n) => {
                        let _ = self.events_tx.send(TransportEvent::Notification(n));
                    }
                    Err(e) => log::debug!("transport: malformed notification: {}", e),
                }
            }
            Ok(Some(ServerFrame::Event(ev))) if ev.event == SHUTDOWN_EVENT => {
                log::info!("transport: backend is shutting down");
            }
            Ok(Some(ServerFrame::Event(ev))) => log::debug!("transport: ignoring event {}", ev.event),
            Ok(None) => {}
            Err(e) => log::debug!("transport: unparseable frame: {}", e),
        }
    }
}

/// Why a link session ended.
enum LinkEnd {
    Stopped,
    Dropped(String),
}

/// Running supervisor: its stop switch and task handle.
struct Supervisor {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// WebSocket implementation of [`Backend`].
pub struct WsTransport {
    shared: Arc<Shared>,
    token: RwLock<Option<String>>,
    next_id: AtomicU64,
    supervisor: Mutex<Option<Supervisor>>,
}

impl WsTransport {
    /// Create a transport for `url`. The receiver yields connection events and notifications.
    pub fn new(
        url: impl Into<String>,
        config: &ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            url: url.into(),
            request_timeout: config.request_timeout(),
            reconnect: config.reconnect,
            tracker: ConnectionTracker::new(),
            events_tx,
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        });
        let transport = Self {
            shared,
            token: RwLock::new(None),
            next_id: AtomicU64::new(1),
            supervisor: Mutex::new(None),
        };
        (transport, events_rx)
    }

    /// Send one request and wait for its response (bounded by the request timeout).
    async fn request(
        &self,
        controller: &str,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let jwt = self.token.read().unwrap_or_else(|e| e.into_inner()).clone();
        let req = WsRequest::new(&id, controller, action, jwt, params);
        let text = serde_json::to_string(&req).map_err(|e| BackendError::Malformed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let outbound = lock(&self.shared.outbound);
            let Some(out) = outbound.as_ref() else {
                return Err(ConnectionError::NotConnected.into());
            };
            lock(&self.shared.pending).insert(id.clone(), tx);
            if out.send(text).is_err() {
                lock(&self.shared.pending).remove(&id);
                return Err(ConnectionError::NotConnected.into());
            }
        }
        log::debug!("transport: -> {} #{}", req.route(), id);

        let res = match tokio::time::timeout(self.shared.request_timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => return Err(ConnectionError::Lost.into()),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                return Err(ConnectionError::Timeout(self.shared.request_timeout).into());
            }
        };
        if res.ok {
            Ok(res.payload.unwrap_or(serde_json::Value::Null))
        } else {
            Err(BackendError::Rejected {
                status: res.status.unwrap_or(500),
                message: res.error.unwrap_or_else(|| "request failed".to_string()),
            })
        }
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, BackendError> {
    serde_json::from_value(value).map_err(|e| BackendError::Malformed(e.to_string()))
}

/// Supervisor: connect, run the link until it drops, back off, repeat. Reports the outcome
/// of the very first attempt through `first`.
async fn run_link_loop(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>, mut first: Option<FirstAttempt>) {
    let mut backoff = Backoff::from_config(&shared.reconnect);
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let attempt = tokio::select! {
            res = tokio_tungstenite::connect_async(shared.url.as_str()) => res,
            _ = stop_rx.changed() => break,
        };
        match attempt {
            Ok((socket, _)) => {
                backoff.reset();
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }
                let end = run_link(&shared, socket, &mut stop_rx).await;
                shared.fail_pending();
                match end {
                    LinkEnd::Stopped => break,
                    LinkEnd::Dropped(reason) => {
                        log::warn!("transport: link to {} lost: {}", shared.url, reason);
                        shared.signal(LinkSignal::Down);
                    }
                }
            }
            Err(e) => {
                log::debug!("transport: connect to {} failed: {}", shared.url, e);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(ConnectionError::Unreachable(e.to_string())));
                }
            }
        }
        let delay = backoff.next_delay();
        log::info!(
            "transport: reconnecting in {:?} (attempt {})",
            delay,
            backoff.attempt()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => break,
        }
    }
    shared.fail_pending();
    shared.signal(LinkSignal::Closed);
    log::info!("transport: link loop stopped");
}

/// One socket session: pump outbound frames and dispatch inbound ones until either side ends.
async fn run_link(shared: &Shared, socket: Socket, stop_rx: &mut watch::Receiver<bool>) -> LinkEnd {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    *lock(&shared.outbound) = Some(out_tx);
    shared.signal(LinkSignal::Up);

    let end = loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break LinkEnd::Stopped;
            }
            Some(text) = out_rx.recv() => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    break LinkEnd::Dropped(e.to_string());
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.handle_frame(&text),
                Some(Ok(Message::Close(_))) | None => break LinkEnd::Dropped("closed by peer".to_string()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break LinkEnd::Dropped(e.to_string()),
            }
        }
    };
    *lock(&shared.outbound) = None;
    end
}

#[async_trait]
impl Backend for WsTransport {
    async fn connect(&self) -> Result<(), ConnectionError> {
        let first_rx = {
            let mut sup = lock(&self.supervisor);
            if sup.as_ref().is_some_and(|s| !s.task.is_finished()) {
                return if self.shared.tracker.state().is_connected() {
                    Ok(())
                } else {
                    Err(ConnectionError::NotConnected)
                };
            }
            self.shared.signal(LinkSignal::Opening);
            let (first_tx, first_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = watch::channel(false);
            log::info!("transport: connecting to {}", self.shared.url);
            let task = tokio::spawn(run_link_loop(self.shared.clone(), stop_rx, Some(first_tx)));
            *sup = Some(Supervisor { stop_tx, task });
            first_rx
        };
        match first_rx.await {
            Ok(res) => res,
            Err(_) => Err(ConnectionError::Closed),
        }
    }

    async fn disconnect(&self) {
        let sup = lock(&self.supervisor).take();
        match sup {
            Some(sup) => {
                let _ = sup.stop_tx.send(true);
                let _ = sup.task.await;
            }
            None => self.shared.signal(LinkSignal::Closed),
        }
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.tracker.subscribe()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    async fn login(&self, strategy: &str, credentials: &Credentials) -> Result<String, BackendError> {
        let payload = self
            .request(
                "auth",
                "login",
                json!({ "strategy": strategy, "credentials": credentials }),
            )
            .await?;
        payload
            .get("jwt")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BackendError::Malformed("login response without jwt".to_string()))
    }

    async fn check_token(&self, token: &str) -> Result<TokenCheck, BackendError> {
        decode(self.request("auth", "checkToken", json!({ "token": token })).await?)
    }

    async fn create_api_key(&self, label: &str) -> Result<ApiKey, BackendError> {
        decode(
            self.request("auth", "createApiKey", json!({ "description": label }))
                .await?,
        )
    }

    async fn delete_api_key(&self, id: &str) -> Result<(), BackendError> {
        self.request("auth", "deleteApiKey", json!({ "id": id })).await?;
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<SearchResult, BackendError> {
        decode(
            self.request(
                "document",
                "search",
                json!({
                    "index": index,
                    "collection": collection,
                    "sort": query.sort,
                    "size": query.size,
                }),
            )
            .await?,
        )
    }

    async fn create_document(
        &self,
        index: &str,
        collection: &str,
        body: serde_json::Value,
    ) -> Result<Document, BackendError> {
        decode(
            self.request(
                "document",
                "create",
                json!({ "index": index, "collection": collection, "body": body }),
            )
            .await?,
        )
    }

    async fn subscribe(
        &self,
        index: &str,
        collection: &str,
        filter: serde_json::Value,
    ) -> Result<String, BackendError> {
        let payload = self
            .request(
                "realtime",
                "subscribe",
                json!({ "index": index, "collection": collection, "filter": filter }),
            )
            .await?;
        payload
            .get("roomId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BackendError::Malformed("subscribe response without roomId".to_string()))
    }

    async fn unsubscribe(&self, room_id: &str) -> Result<(), BackendError> {
        self.request("realtime", "unsubscribe", json!({ "roomId": room_id }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionEvent;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
        listener.local_addr().expect("local_addr").port()
    }

    #[tokio::test]
    async fn request_without_link_is_not_connected() {
        let (t, _rx) = WsTransport::new("ws://127.0.0.1:1/ws", &ClientConfig::default());
        let err = t.check_token("x").await.unwrap_err();
        assert!(matches!(err, BackendError::Connection(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn unreachable_first_attempt_reports_error_and_keeps_retrying() {
        let mut config = ClientConfig::default();
        config.reconnect.floor_ms = 10;
        config.reconnect.cap_ms = 20;
        let url = format!("ws://127.0.0.1:{}/ws", free_port());
        let (t, mut rx) = WsTransport::new(url, &config);
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Unreachable(_)));
        assert_eq!(*t.state().borrow(), ConnectionState::Connecting);

        t.disconnect().await;
        assert_eq!(*t.state().borrow(), ConnectionState::Disconnected);
        // Never connected, so nothing to announce.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn frames_route_to_waiters_and_event_channel() {
        let (t, mut rx) = WsTransport::new("ws://unused", &ClientConfig::default());
        let (tx, mut waiter) = oneshot::channel();
        lock(&t.shared.pending).insert("9".to_string(), tx);

        t.shared
            .handle_frame(r#"{"type":"res","id":"9","ok":true,"payload":{"valid":true}}"#);
        let res = waiter.try_recv().unwrap();
        assert!(res.ok);

        t.shared.handle_frame(
            r#"{"type":"event","event":"notification","payload":{"roomId":"r1","type":"document","action":"create","result":{}}}"#,
        );
        match rx.try_recv().unwrap() {
            TransportEvent::Notification(n) => assert_eq!(n.room_id, "r1"),
            other => panic!("unexpected {:?}", other),
        }

        t.shared.handle_frame("garbage");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn link_signals_emit_connection_events() {
        let (t, mut rx) = WsTransport::new("ws://unused", &ClientConfig::default());
        t.shared.signal(LinkSignal::Opening);
        t.shared.signal(LinkSignal::Up);
        t.shared.signal(LinkSignal::Up);
        t.shared.signal(LinkSignal::Down);
        let mut events = Vec::new();
        while let Ok(TransportEvent::Connection(e)) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events, vec![ConnectionEvent::Connected, ConnectionEvent::Disconnected]);
    }
}
