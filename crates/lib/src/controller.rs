//! Session controller: the single actor that drives transport, auth, subscription and store.
//!
//! All state lives in one task. Transport events and UI actions are processed one at a time
//! in arrival order; a network round-trip suspends the loop and anything that arrives
//! meanwhile waits in its channel. Every failure is turned into a [`Notice`] here.

use crate::auth::{AuthError, AuthSession, LoggedIn, RestoreOutcome};
use crate::backend::{Backend, Credentials};
use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::outbox::{self, Outbox, SendError};
use crate::store::{fetch_history, Message, MessageStore};
use crate::subscription::{RealtimeSubscription, RoomSpec};
use crate::transport::{ConnectionEvent, ConnectionState, TransportEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How often pending sends are checked against their deadline.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LoadingResources,
    Connecting,
    RestoringSession,
    LoginRequired,
    Ready,
    Reconnecting,
    LoggedOut,
}

/// What happened, as far as the phase machine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseInput {
    ResourcesLoaded,
    LinkUp,
    LinkDown,
    Restored,
    RestoreFailed,
    LoggedIn,
    LoggedOut,
}

impl Phase {
    /// Pure transition function. Inputs that do not apply to the current phase leave it unchanged.
    pub fn next(self, input: PhaseInput) -> Phase {
        use Phase::*;
        match (self, input) {
            (LoadingResources, PhaseInput::ResourcesLoaded) => Connecting,
            (Connecting, PhaseInput::LinkUp) | (Reconnecting, PhaseInput::LinkUp) => {
                RestoringSession
            }
            (RestoringSession, PhaseInput::Restored) => Ready,
            (RestoringSession, PhaseInput::RestoreFailed) => LoginRequired,
            (LoginRequired, PhaseInput::LoggedIn) | (LoggedOut, PhaseInput::LoggedIn) => Ready,
            (Ready, PhaseInput::LoggedOut) => LoggedOut,
            (RestoringSession, PhaseInput::LinkDown)
            | (LoginRequired, PhaseInput::LinkDown)
            | (Ready, PhaseInput::LinkDown)
            | (LoggedOut, PhaseInput::LinkDown) => Reconnecting,
            (p, _) => p,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Danger,
}

/// User-facing message about something that happened or went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

/// What the UI renders.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Phase(Phase),
    Connection(ConnectionState),
    Notice(Notice),
    MessageAdded(Message),
    /// Store contents after a history merge, and how many of them were new.
    HistoryLoaded { messages: Vec<Message>, added: usize },
    SendConfirmed(String),
    SendUnconfirmed(Message),
    /// Display name of the logged-in user, None after logout or session loss.
    SessionChanged(Option<String>),
}

/// What the UI submits.
#[derive(Debug, Clone)]
pub enum Action {
    Login(Credentials),
    Send(String),
    Logout,
    Shutdown,
}

pub struct SessionController {
    backend: Arc<dyn Backend>,
    auth: AuthSession,
    store: MessageStore,
    subscription: RealtimeSubscription,
    outbox: Outbox,
    history_size: usize,
    phase: Phase,
    /// Set once the controller tears the link down itself.
    closing: bool,
    updates: mpsc::UnboundedSender<Update>,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn Backend>,
        credentials: Arc<dyn CredentialStore>,
        config: &ClientConfig,
        updates: mpsc::UnboundedSender<Update>,
    ) -> Self {
        Self {
            auth: AuthSession::new(backend.clone(), credentials),
            backend,
            store: MessageStore::new(),
            subscription: RealtimeSubscription::new(RoomSpec::from_config(config)),
            outbox: Outbox::new(config.echo_timeout()),
            history_size: config.history_size,
            phase: Phase::LoadingResources,
            closing: false,
            updates,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn pending_sends(&self) -> usize {
        self.outbox.len()
    }

    fn emit(&self, update: Update) {
        // UI gone: nothing left to render to.
        let _ = self.updates.send(update);
    }

    fn notice(&self, level: NoticeLevel, text: impl Into<String>) {
        let text = text.into();
        match level {
            NoticeLevel::Info => log::info!("session: {}", text),
            NoticeLevel::Danger => log::warn!("session: {}", text),
        }
        self.emit(Update::Notice(Notice { level, text }));
    }

    fn advance(&mut self, input: PhaseInput) {
        let next = self.phase.next(input);
        if next != self.phase {
            log::info!("session: {:?} -> {:?} on {:?}", self.phase, next, input);
            self.phase = next;
            self.emit(Update::Phase(next));
        }
    }

    /// Wait for UI resources, then open the link. The phase moves on even if loading failed.
    pub async fn start<E: std::fmt::Display>(
        &mut self,
        resources: impl Future<Output = Result<(), E>>,
    ) {
        if let Err(e) = resources.await {
            self.notice(NoticeLevel::Danger, format!("could not load resources: {}", e));
        }
        self.advance(PhaseInput::ResourcesLoaded);
        if let Err(e) = self.backend.connect().await {
            self.notice(
                NoticeLevel::Danger,
                format!("could not reach the chat server ({}), retrying", e),
            );
        }
    }

    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connection(ConnectionEvent::Connected) => self.link_up().await,
            TransportEvent::Connection(ConnectionEvent::Reconnected) => {
                self.notice(NoticeLevel::Info, "reconnected");
                self.link_up().await;
            }
            TransportEvent::Connection(ConnectionEvent::Disconnected) => {
                // The event describes the drop itself; the link may already be back by now.
                let state = if self.closing {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Reconnecting
                };
                self.emit(Update::Connection(state));
                if self.subscription.invalidate() {
                    log::debug!("session: subscription dropped with the link");
                }
                self.advance(PhaseInput::LinkDown);
                if !self.closing {
                    self.notice(NoticeLevel::Danger, "connection lost, reconnecting");
                }
            }
            TransportEvent::Notification(n) => {
                if let Some(message) = self.subscription.route(&n) {
                    self.commit(message);
                }
            }
        }
    }

    async fn link_up(&mut self) {
        self.emit(Update::Connection(ConnectionState::Connected));
        self.advance(PhaseInput::LinkUp);
        if self.phase == Phase::RestoringSession {
            self.restore_session().await;
        }
    }

    fn commit(&mut self, message: Message) {
        let id = message.id.clone();
        if self.store.append(message.clone()) {
            self.emit(Update::MessageAdded(message));
        }
        if self.outbox.confirm(&id) {
            self.emit(Update::SendConfirmed(id));
        }
    }

    async fn restore_session(&mut self) {
        match self.auth.restore().await {
            RestoreOutcome::Restored(session) => {
                self.emit(Update::SessionChanged(Some(session.display_name)));
                self.advance(PhaseInput::Restored);
                self.enter_ready().await;
            }
            RestoreOutcome::Absent => {
                self.advance(PhaseInput::RestoreFailed);
            }
            RestoreOutcome::Rejected(stale) => {
                self.emit(Update::SessionChanged(None));
                self.notice(NoticeLevel::Info, "session expired, please log in again");
                if let Some(e) = stale {
                    self.notice(
                        NoticeLevel::Danger,
                        format!("the expired session could not be removed from storage: {}", e),
                    );
                }
                self.advance(PhaseInput::RestoreFailed);
            }
            RestoreOutcome::Unverified(e) => {
                self.emit(Update::SessionChanged(None));
                self.notice(
                    NoticeLevel::Danger,
                    format!("could not verify the saved session: {}", e),
                );
                self.advance(PhaseInput::RestoreFailed);
            }
        }
    }

    /// Subscribe first, then fetch, so nothing pushed during the fetch is missed.
    async fn enter_ready(&mut self) {
        if let Err(e) = self.subscription.subscribe(self.backend.as_ref()).await {
            self.notice(NoticeLevel::Danger, format!("live updates unavailable: {}", e));
        }
        match fetch_history(
            self.backend.as_ref(),
            self.subscription.spec(),
            self.history_size,
        )
        .await
        {
            Ok(history) => {
                let added = self.store.replace(history);
                for m in &added {
                    if self.outbox.confirm(&m.id) {
                        self.emit(Update::SendConfirmed(m.id.clone()));
                    }
                }
                self.emit(Update::HistoryLoaded {
                    messages: self.store.messages().to_vec(),
                    added: added.len(),
                });
            }
            Err(e) => self.notice(NoticeLevel::Danger, e.to_string()),
        }
    }

    pub async fn login(&mut self, credentials: Credentials) {
        match self.phase {
            Phase::LoginRequired | Phase::LoggedOut => {}
            Phase::Ready => {
                self.notice(NoticeLevel::Info, "already logged in");
                return;
            }
            _ => {
                self.notice(NoticeLevel::Danger, "cannot log in while not connected");
                return;
            }
        }
        match self.auth.login(&credentials).await {
            Ok(LoggedIn { session, unsaved }) => {
                self.emit(Update::SessionChanged(Some(session.display_name)));
                if let Some(e) = unsaved {
                    self.notice(
                        NoticeLevel::Danger,
                        format!("logged in, but the session will not be remembered: {}", e),
                    );
                }
                self.advance(PhaseInput::LoggedIn);
                self.enter_ready().await;
            }
            Err(e) => self.notice(NoticeLevel::Danger, format!("login failed: {}", e)),
        }
    }

    pub async fn send(&mut self, content: String) {
        let author = match (self.phase, self.auth.active()) {
            (Phase::Ready, Some(session)) => session.display_name.clone(),
            (phase, _) => {
                let reason = match phase {
                    Phase::LoginRequired | Phase::LoggedOut | Phase::Ready => SendError::NotLoggedIn,
                    _ => SendError::NotConnected,
                };
                self.notice(NoticeLevel::Danger, format!("message not sent: {}", reason));
                return;
            }
        };
        match outbox::send(
            self.backend.as_ref(),
            self.subscription.spec(),
            &author,
            &content,
        )
        .await
        {
            Ok(message) if self.store.contains(&message.id) => {
                self.emit(Update::SendConfirmed(message.id));
            }
            Ok(message) => {
                log::debug!("session: sent {}, awaiting echo", message.id);
                self.outbox.track(message, Instant::now());
            }
            Err(e) => self.notice(NoticeLevel::Danger, format!("message not sent: {}", e)),
        }
    }

    /// Clear local state and leave the room. Failures along the way only produce notices.
    pub async fn logout(&mut self) {
        if self.phase != Phase::Ready {
            self.notice(NoticeLevel::Info, "not logged in");
            return;
        }
        if let Err(e) = self.subscription.unsubscribe(self.backend.as_ref()).await {
            self.notice(
                NoticeLevel::Danger,
                format!("could not leave the chat room cleanly: {}", e),
            );
        }
        self.outbox.clear();
        self.store.clear();
        if let Err(e) = self.auth.logout().await {
            let text = match &e {
                AuthError::Storage(storage) => {
                    format!("logged out, but the saved session could not be removed: {}", storage)
                }
                AuthError::LogoutIncomplete { .. } => format!("logged out, but {}", e),
                _ => format!("logged out, but the API key could not be revoked: {}", e),
            };
            self.notice(NoticeLevel::Danger, text);
        }
        self.emit(Update::SessionChanged(None));
        self.advance(PhaseInput::LoggedOut);
    }

    /// Report sends whose echo is overdue.
    pub fn expire_pending(&mut self, now: Instant) {
        for message in self.outbox.expire(now) {
            self.notice(
                NoticeLevel::Danger,
                format!("message \"{}\" has not been confirmed yet", message.content),
            );
            self.emit(Update::SendUnconfirmed(message));
        }
    }

    /// Returns false when the controller should stop.
    pub async fn handle_action(&mut self, action: Action) -> bool {
        match action {
            Action::Login(credentials) => self.login(credentials).await,
            Action::Send(content) => self.send(content).await,
            Action::Logout => self.logout().await,
            Action::Shutdown => return false,
        }
        true
    }

    /// Dispatch loop. Ends on `Action::Shutdown` or when either channel closes, then leaves the
    /// room and tears the link down.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut actions: mpsc::UnboundedReceiver<Action>,
    ) {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.handle_event(ev).await,
                    None => break,
                },
                action = actions.recv() => match action {
                    Some(action) => {
                        if !self.handle_action(action).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = housekeeping.tick() => self.expire_pending(Instant::now()),
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.closing = true;
        if let Err(e) = self.subscription.unsubscribe(self.backend.as_ref()).await {
            log::debug!("session: unsubscribe on shutdown failed: {}", e);
        }
        self.backend.disconnect().await;
        log::info!("session: stopped");
    }
}
