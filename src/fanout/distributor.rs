//! Distribution stage: one consumer on the merged stream, persistence,
//! concurrent live pushes, catch-up paging and heartbeats.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::FanoutConfig;
use crate::error::{EngineError, Result};
use crate::fanout::merge::merge_change_streams;
use crate::fanout::payload::{to_news_message, PushMessage, CHANNEL_TAGS};
use crate::fanout::subscribers::{SubscriberConnection, SubscriberHandle, SubscriberRegistry};
use crate::storage::{ChangeEvent, Storage};

/// The fan-out engine: owns the subscriber registry and drives the
/// persist-and-push loop.
pub struct NewsFanout {
    storage: Arc<dyn Storage>,
    registry: Arc<SubscriberRegistry>,
    config: FanoutConfig,
}

impl NewsFanout {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<SubscriberRegistry>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Merge the well-known change channels and spawn the distribution loop.
    pub async fn spawn(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let merged =
            merge_change_streams(&*self.storage, &CHANNEL_TAGS, self.config.channel_buffer).await?;
        Ok(tokio::spawn(async move { self.run(merged).await }))
    }

    /// Consume the merged stream until it closes. Each event is mapped,
    /// persisted exactly once, and pushed concurrently to the subscribers
    /// registered at that instant. The sends for one message are joined
    /// before the next event is read, so each subscriber sees messages in
    /// merged-stream order; returning implies every send has completed.
    pub async fn run(&self, mut events: mpsc::Receiver<ChangeEvent>) {
        info!("news distribution loop started");

        while let Some(event) = events.recv().await {
            let message = match to_news_message(&event) {
                Ok(message) => message,
                Err(err) => {
                    warn!(channel = %event.channel, error = %err, "dropping notification");
                    continue;
                }
            };

            let push = PushMessage::live(message.clone());
            let mut sends = JoinSet::new();
            for subscriber in self.registry.all().await {
                let push = push.clone();
                sends.spawn(async move {
                    subscriber.advance_offset(1);
                    if let Err(err) = subscriber.connection.send(&push).await {
                        // failed sends never evict: only disconnect or a
                        // missed heartbeat does
                        warn!(subscriber_id = %subscriber.id, error = %err, "live push failed");
                    }
                });
            }

            if let Err(err) = self.storage.insert_message(&message).await {
                error!(error = %err, "failed to persist distributed message");
            }

            while sends.join_next().await.is_some() {}
        }

        info!("news distribution loop finished");
    }

    /// Register a connection, deliver the newest catch-up page, and start
    /// its heartbeat.
    pub async fn connect(
        &self,
        connection: Arc<dyn SubscriberConnection>,
    ) -> Result<SubscriberHandle> {
        let handle = self.registry.add(connection).await;

        if let Err(err) = self.deliver_page(&handle, 0).await {
            // a dead connection straight out of the gate
            self.registry.remove(handle.id).await;
            return Err(err);
        }

        self.spawn_heartbeat(handle.clone());
        Ok(handle)
    }

    /// Deliver the next page of history at the subscriber's current offset.
    /// Returns the number of messages delivered; an exhausted history is a
    /// plain zero, not an error.
    pub async fn fetch_more(&self, id: Uuid) -> Result<usize> {
        let handle = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("subscriber {id}")))?;
        self.deliver_page(&handle, handle.offset()).await
    }

    /// Explicit disconnect: close the socket and drop the registration.
    pub async fn disconnect(&self, id: Uuid) {
        if let Some(handle) = self.registry.get(id).await {
            if let Err(err) = handle.connection.close().await {
                debug!(subscriber_id = %id, error = %err, "close on disconnect failed");
            }
        }
        self.registry.remove(id).await;
    }

    async fn deliver_page(&self, handle: &SubscriberHandle, offset: usize) -> Result<usize> {
        let page = match self
            .storage
            .fetch_messages_page(self.config.page_size, offset as u32)
            .await
        {
            Ok(page) => page,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };

        if page.is_empty() {
            return Ok(0);
        }

        let batch: Vec<PushMessage> = page.into_iter().map(PushMessage::catch_up).collect();
        handle.advance_offset(batch.len());
        handle.connection.send_batch(&batch).await?;
        Ok(batch.len())
    }

    fn spawn_heartbeat(&self, handle: SubscriberHandle) {
        let registry = Arc::clone(&self.registry);
        let interval = self.config.heartbeat_interval();
        let deadline = self.config.heartbeat_timeout();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                // disconnected in the meantime
                if registry.get(handle.id).await.is_none() {
                    return;
                }

                let pong = tokio::time::timeout(deadline, handle.connection.ping()).await;
                match pong {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => {
                        warn!(subscriber_id = %handle.id, error = %err, "heartbeat failed");
                    }
                    Err(_) => {
                        warn!(subscriber_id = %handle.id, "heartbeat timed out");
                    }
                }

                if let Err(err) = handle.connection.close().await {
                    debug!(subscriber_id = %handle.id, error = %err, "close after missed heartbeat failed");
                }
                registry.remove(handle.id).await;
                return;
            }
        });
    }
}
