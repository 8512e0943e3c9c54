//! Message store: ordered, deduplicated log of chat messages.
//!
//! Messages are keyed by backend id and kept sorted by `created_at` (equal timestamps keep
//! insertion order). The first copy of an id wins; later copies are ignored.

use crate::backend::{Backend, BackendError, Document, SearchQuery, SortOrder};
use crate::subscription::RoomSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build from a stored document; None when author/content are missing or the timestamp is out of range.
    pub fn from_document(doc: &Document) -> Option<Self> {
        let author = doc.body.get("author")?.as_str()?;
        let content = doc.body.get("content")?.as_str()?;
        Some(Self {
            id: doc.id.clone(),
            author: author.to_string(),
            content: content.to_string(),
            created_at: doc.created_at_utc()?,
        })
    }

    /// Document body for a new message.
    pub fn body(author: &str, content: &str) -> serde_json::Value {
        serde_json::json!({ "author": author, "content": content })
    }
}

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if the id is not present. Returns true when the message was added.
    pub fn append(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.ids.insert(message.id.clone());
        self.messages.insert(at, message);
        true
    }

    /// Merge a full history snapshot. Messages already held are kept as they are, and messages
    /// missing from the snapshot are retained (they may have arrived after the query was issued).
    /// Returns the messages that were new.
    pub fn replace(&mut self, snapshot: impl IntoIterator<Item = Message>) -> Vec<Message> {
        let mut added = Vec::new();
        for m in snapshot {
            if self.append(m.clone()) {
                added.push(m);
            }
        }
        added
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        if !self.contains(id) {
            return None;
        }
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("history fetch failed: {0}")]
    Backend(#[from] BackendError),
}

/// The most recent `size` messages of a room, oldest first. Documents that are not chat
/// messages are skipped.
pub async fn fetch_history(
    backend: &dyn Backend,
    room: &RoomSpec,
    size: usize,
) -> Result<Vec<Message>, FetchError> {
    let query = SearchQuery {
        sort: SortOrder::Asc,
        size,
    };
    let result = backend
        .search(&room.index, &room.collection, &query)
        .await?;
    let messages: Vec<Message> = result
        .hits
        .iter()
        .filter_map(|doc| {
            let m = Message::from_document(doc);
            if m.is_none() {
                log::debug!("store: skipping non-message document {}", doc.id);
            }
            m
        })
        .collect();
    log::debug!(
        "store: fetched {} of {} messages from {}/{}",
        messages.len(),
        result.total,
        room.index,
        room.collection
    );
    Ok(messages)
}
