//! Collaborator seams and shared data types.
//!
//! The engine never depends on concrete backends. Durable storage, the
//! secondary (volatile) cache, feed sources and media platforms are narrow
//! capability traits; production wires them to Postgres, Redis and the
//! platform SDKs, tests wire them to in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

#[cfg(feature = "postgres")]
pub mod pg;

/// Media attachment kinds carried in message metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentKind {
    Photo,
    Video,
    Audio,
    Document,
    Iframe,
}

/// A resolved attachment reference on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
}

/// Origin platform of a canonical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Tg,
    Vk,
}

/// The canonical message shape persisted to storage and pushed to
/// subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsMessage {
    pub group_name: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub source_type: SourceType,
}

/// An external feed source tracked by the adaptive poller.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    /// Stable identifier (e.g. the wall domain) used as the registry key.
    pub id: String,
    /// Human-readable name used for message labels.
    pub name: String,
    /// Platform-side numeric id.
    pub feed_id: i64,
    /// Largest item id already processed. Only ever moves forward.
    pub high_water_mark: i64,
}

/// One item fetched from an external feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: i64,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

/// A raw change notification raised by durable storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Channel tag the notification arrived on.
    pub channel: String,
    /// JSON payload as emitted by the storage trigger.
    pub payload: String,
}

/// Durable storage operations the engine consumes.
#[async_trait]
pub trait Storage: Send + Sync {
    /// All feed sources the poller should track.
    async fn get_sources_list(&self) -> Result<Vec<Source>>;

    /// Persist freshly polled feed items.
    async fn insert_items(&self, source: &Source, items: &[FeedItem]) -> Result<()>;

    /// Persist a source's advanced high-water mark.
    async fn update_source_mark(&self, source_id: &str, high_water_mark: i64) -> Result<()>;

    /// Subscribe to a named change-event channel. Events are delivered on a
    /// bounded channel of `buffer` slots.
    async fn change_listener(
        &self,
        channel: &str,
        buffer: usize,
    ) -> Result<mpsc::Receiver<ChangeEvent>>;

    /// Read a page of historical messages, newest first.
    async fn fetch_messages_page(&self, limit: u32, offset: u32) -> Result<Vec<NewsMessage>>;

    /// Persist one canonical message.
    async fn insert_message(&self, message: &NewsMessage) -> Result<()>;

    /// The full user-id -> role-name mapping, used to repopulate the
    /// secondary cache after an outage.
    async fn fetch_role_assignments(&self) -> Result<Vec<(String, String)>>;
}

/// The secondary (volatile) cache. "Key not found" is a distinguished,
/// non-failure outcome; every other error is a health signal.
#[async_trait]
pub trait SecondaryCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<String>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn bulk_set(&self, pairs: &[(String, String)]) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

/// Media platform client. Opaque, possibly slow, possibly failing; used only
/// by the aggregator's fragment-resolution step.
#[async_trait]
pub trait MediaClient: Send + Sync {
    /// Resolve a platform file id into a public URL.
    async fn fetch_attachment_url(&self, file_id: &str) -> Result<String>;
}

/// External feed client used by the adaptive poller.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetch the newest `count` items for a source, newest first.
    async fn fetch_latest(&self, source: &Source, count: usize) -> Result<Vec<FeedItem>>;
}
