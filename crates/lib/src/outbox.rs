//! Compose/send with echo confirmation.
//!
//! A send writes the document through the backend and does not touch the store. The message
//! is committed when its creation comes back through the subscription; until then its id sits
//! in the `Outbox` with a deadline.

use crate::backend::{Backend, BackendError};
use crate::store::Message;
use crate::subscription::RoomSpec;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("message is empty")]
    Empty,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Backend(#[from] BackendError),
    #[error("backend returned an unreadable document: {0}")]
    Malformed(String),
}

/// Create a message document. The returned message has the backend-assigned id and timestamp.
pub async fn send(
    backend: &dyn Backend,
    room: &RoomSpec,
    author: &str,
    content: &str,
) -> Result<Message, SendError> {
    if content.trim().is_empty() {
        return Err(SendError::Empty);
    }
    let doc = backend
        .create_document(&room.index, &room.collection, Message::body(author, content))
        .await?;
    Message::from_document(&doc).ok_or_else(|| SendError::Malformed(doc.id.clone()))
}

/// A reported send is forgotten once this many timeouts have passed since it was sent.
const FORGET_AFTER_TIMEOUTS: u32 = 10;

struct Pending {
    message: Message,
    deadline: Instant,
    overdue: bool,
}

/// Sends awaiting their echo.
pub struct Outbox {
    timeout: Duration,
    pending: HashMap<String, Pending>,
}

impl Outbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    pub fn track(&mut self, message: Message, now: Instant) {
        self.pending.insert(
            message.id.clone(),
            Pending {
                message,
                deadline: now + self.timeout,
                overdue: false,
            },
        );
    }

    /// The echo (or a history fetch) delivered `id`. Returns whether it was pending.
    pub fn confirm(&mut self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Messages whose deadline passed since the last call. They stay tracked so a late echo
    /// still confirms them, until `FORGET_AFTER_TIMEOUTS` timeouts have gone by.
    pub fn expire(&mut self, now: Instant) -> Vec<Message> {
        let grace = self.timeout * (FORGET_AFTER_TIMEOUTS - 1);
        self.pending.retain(|id, p| {
            let forget = p.overdue && now >= p.deadline + grace;
            if forget {
                log::debug!("outbox: no echo for {}, no longer tracked", id);
            }
            !forget
        });
        let mut expired: Vec<Message> = self
            .pending
            .values_mut()
            .filter(|p| !p.overdue && p.deadline <= now)
            .map(|p| {
                p.overdue = true;
                p.message.clone()
            })
            .collect();
        expired.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        expired
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Credentials;
    use crate::config::ClientConfig;
    use crate::testing::FakeBackend;
    use chrono::TimeZone;

    fn msg(id: &str) -> Message {
        Message {
            id: id.into(),
            author: "alice".into(),
            content: "hi".into(),
            created_at: chrono::Utc.timestamp_millis_opt(1).unwrap(),
        }
    }

    #[test]
    fn expiry_reports_once_and_late_confirm_still_works() {
        let mut outbox = Outbox::new(Duration::from_secs(10));
        let t0 = Instant::now();
        outbox.track(msg("a"), t0);
        assert!(outbox.expire(t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(outbox.expire(t0 + Duration::from_secs(10)).len(), 1);
        assert!(outbox.expire(t0 + Duration::from_secs(20)).is_empty());
        assert!(outbox.is_pending("a"));
        assert!(outbox.confirm("a"));
        assert!(!outbox.confirm("a"));
        assert!(outbox.is_empty());
    }

    #[test]
    fn lost_echoes_are_forgotten_after_ten_timeouts() {
        let mut outbox = Outbox::new(Duration::from_secs(10));
        let t0 = Instant::now();
        outbox.track(msg("a"), t0);
        outbox.track(msg("b"), t0 + Duration::from_secs(50));
        assert_eq!(outbox.expire(t0 + Duration::from_secs(60)).len(), 2);
        assert!(outbox.expire(t0 + Duration::from_secs(99)).is_empty());
        assert_eq!(outbox.len(), 2);

        assert!(outbox.expire(t0 + Duration::from_secs(100)).is_empty());
        assert!(!outbox.is_pending("a"));
        assert!(outbox.is_pending("b"));
        outbox.expire(t0 + Duration::from_secs(150));
        assert!(outbox.is_empty());
    }

    #[test]
    fn unreported_sends_are_reported_before_being_forgotten() {
        let mut outbox = Outbox::new(Duration::from_secs(10));
        let t0 = Instant::now();
        outbox.track(msg("a"), t0);
        let reported = outbox.expire(t0 + Duration::from_secs(500));
        assert_eq!(reported.len(), 1);
        assert!(outbox.is_pending("a"));
        assert!(outbox.expire(t0 + Duration::from_secs(501)).is_empty());
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn send_rejects_blank_content() {
        let (backend, _events) = FakeBackend::new();
        backend.link_up();
        let room = RoomSpec::from_config(&ClientConfig::default());
        let err = send(backend.as_ref(), &room, "alice", "  \n").await.unwrap_err();
        assert!(matches!(err, SendError::Empty));
        assert!(backend.documents().is_empty());
    }

    #[tokio::test]
    async fn send_returns_backend_assigned_message() {
        let (backend, _events) = FakeBackend::new();
        backend.add_user("alice", "pw");
        backend.link_up();
        let jwt = backend
            .login(
                "local",
                &Credentials {
                    username: "alice".into(),
                    password: "pw".into(),
                },
            )
            .await
            .unwrap();
        backend.set_token(Some(jwt));
        let room = RoomSpec::from_config(&ClientConfig::default());
        let m = send(backend.as_ref(), &room, "alice", "hi").await.unwrap();
        assert_eq!(m.content, "hi");
        assert_eq!(backend.documents()[0].id, m.id);
    }

    #[tokio::test]
    async fn send_while_offline_is_a_backend_error() {
        let (backend, _events) = FakeBackend::new();
        let room = RoomSpec::from_config(&ClientConfig::default());
        let err = send(backend.as_ref(), &room, "alice", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::Backend(_)));
    }
}
