//! Realtime subscription for one chat room.
//!
//! Subscriptions do not survive a transport drop: `invalidate` on disconnect, `subscribe`
//! again after reconnect. Only `document`/`create` notifications for the active room are
//! turned into messages.

use crate::backend::{Backend, BackendError, Document, Notification};
use crate::config::ClientConfig;
use crate::store::Message;

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSpec {
    pub index: String,
    pub collection: String,
    pub filter: serde_json::Value,
}

impl RoomSpec {
    /// The whole message collection from config (empty filter).
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            index: config.index.clone(),
            collection: config.collection.clone(),
            filter: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionHandle {
    pub room_id: String,
    pub spec: RoomSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("realtime subscription failed: {0}")]
    Backend(#[from] BackendError),
    #[error("link dropped while subscribing")]
    Invalidated,
}

pub struct RealtimeSubscription {
    spec: RoomSpec,
    state: SubscriptionState,
    handle: Option<SubscriptionHandle>,
}

impl RealtimeSubscription {
    pub fn new(spec: RoomSpec) -> Self {
        Self {
            spec,
            state: SubscriptionState::Unsubscribed,
            handle: None,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn handle(&self) -> Option<&SubscriptionHandle> {
        self.handle.as_ref()
    }

    pub fn spec(&self) -> &RoomSpec {
        &self.spec
    }

    /// Open the room. Already active → the existing handle.
    pub async fn subscribe(
        &mut self,
        backend: &dyn Backend,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        if let (SubscriptionState::Active, Some(h)) = (self.state, &self.handle) {
            return Ok(h.clone());
        }
        self.state = SubscriptionState::Subscribing;
        let res = backend
            .subscribe(
                &self.spec.index,
                &self.spec.collection,
                self.spec.filter.clone(),
            )
            .await;
        let room_id = match res {
            Ok(id) => id,
            Err(e) => {
                self.state = SubscriptionState::Unsubscribed;
                return Err(e.into());
            }
        };
        // The room died with the link if it dropped during the round-trip.
        if !backend.state().borrow().is_connected() {
            self.state = SubscriptionState::Unsubscribed;
            return Err(SubscriptionError::Invalidated);
        }
        let handle = SubscriptionHandle {
            room_id,
            spec: self.spec.clone(),
        };
        log::info!(
            "subscription: room {} active on {}/{}",
            handle.room_id,
            handle.spec.index,
            handle.spec.collection
        );
        self.handle = Some(handle.clone());
        self.state = SubscriptionState::Active;
        Ok(handle)
    }

    /// Message carried by a notification, if it belongs to the active room and is a document creation.
    pub fn route(&self, notification: &Notification) -> Option<Message> {
        let handle = self.handle.as_ref()?;
        if self.state != SubscriptionState::Active || notification.room_id != handle.room_id {
            log::debug!(
                "subscription: dropping notification for inactive room {}",
                notification.room_id
            );
            return None;
        }
        if notification.kind != "document" || notification.action != "create" {
            return None;
        }
        let doc: Document = match serde_json::from_value(notification.result.clone()) {
            Ok(d) => d,
            Err(e) => {
                log::debug!("subscription: unreadable document in notification: {}", e);
                return None;
            }
        };
        let message = Message::from_document(&doc);
        if message.is_none() {
            log::debug!("subscription: document {} is not a chat message", doc.id);
        }
        message
    }

    /// Forget the room after a transport drop. Returns true if a handle was dropped.
    pub fn invalidate(&mut self) -> bool {
        self.state = SubscriptionState::Unsubscribed;
        self.handle.take().is_some()
    }

    /// Close the room. Idempotent; local state is cleared even if the backend call fails.
    pub async fn unsubscribe(&mut self, backend: &dyn Backend) -> Result<(), SubscriptionError> {
        let was_active = self.state == SubscriptionState::Active;
        self.state = SubscriptionState::Unsubscribed;
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if was_active {
            backend.unsubscribe(&handle.room_id).await?;
            log::info!("subscription: room {} closed", handle.room_id);
        }
        Ok(())
    }
}
