//! Live subscriber bookkeeping: registration, read offsets, transport seam.
//!
//! Handles live in a dedicated namespace of the TTL cache manager as
//! permanent entries; a subscriber exists from connect until explicit
//! disconnect or a missed heartbeat, never because a single send failed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::error::Result;
use crate::fanout::payload::PushMessage;

/// Namespace holding live subscriber handles.
pub const SUBSCRIBERS_NAMESPACE: &str = "web_subscribers";

/// Transport seam for one live connection. Implementations own the socket;
/// the engine only sends, pings and closes.
#[async_trait]
pub trait SubscriberConnection: Send + Sync {
    /// Push one live message.
    async fn send(&self, message: &PushMessage) -> Result<()>;

    /// Deliver a catch-up page as one batch.
    async fn send_batch(&self, messages: &[PushMessage]) -> Result<()>;

    /// Heartbeat probe. Resolves once the peer answered.
    async fn ping(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A registered live subscriber.
#[derive(Clone)]
pub struct SubscriberHandle {
    pub id: Uuid,
    pub connection: Arc<dyn SubscriberConnection>,
    /// Non-decreasing count of messages delivered (live or catch-up); doubles
    /// as the catch-up paging offset.
    offset: Arc<AtomicUsize>,
}

impl SubscriberHandle {
    fn new(connection: Arc<dyn SubscriberConnection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            offset: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    pub fn advance_offset(&self, by: usize) {
        self.offset.fetch_add(by, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("id", &self.id)
            .field("offset", &self.offset())
            .finish()
    }
}

/// Registry of live subscribers, backed by the TTL cache manager.
pub struct SubscriberRegistry {
    cache: Arc<CacheManager<SubscriberHandle>>,
}

impl SubscriberRegistry {
    pub fn new(cache: Arc<CacheManager<SubscriberHandle>>) -> Self {
        cache.create_namespace(SUBSCRIBERS_NAMESPACE);
        Self { cache }
    }

    /// Register a freshly connected subscriber.
    pub async fn add(&self, connection: Arc<dyn SubscriberConnection>) -> SubscriberHandle {
        let handle = SubscriberHandle::new(connection);
        self.cache
            .set(
                SUBSCRIBERS_NAMESPACE,
                &handle.id.to_string(),
                handle.clone(),
                None,
            )
            .await;
        info!(subscriber_id = %handle.id, "subscriber connected");
        handle
    }

    pub async fn get(&self, id: Uuid) -> Option<SubscriberHandle> {
        self.cache.get(SUBSCRIBERS_NAMESPACE, &id.to_string()).await
    }

    pub async fn remove(&self, id: Uuid) {
        self.cache.delete(SUBSCRIBERS_NAMESPACE, &id.to_string()).await;
        info!(subscriber_id = %id, "subscriber removed");
    }

    /// Snapshot of everyone registered right now.
    pub async fn all(&self) -> Vec<SubscriberHandle> {
        self.cache.values(SUBSCRIBERS_NAMESPACE).await
    }
}
