//! Fan-out pipeline end to end: storage triggers through the merged stream
//! to live subscribers, plus catch-up paging.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use common::InMemoryStorage;
use newsgather_core::cache::CacheManager;
use newsgather_core::config::FanoutConfig;
use newsgather_core::error::Result;
use newsgather_core::fanout::{
    NewsFanout, PushMessage, SubscriberConnection, SubscriberRegistry, TG_CHANNEL_MESSAGES,
    VK_MESSAGES,
};
use newsgather_core::storage::{NewsMessage, SourceType};

#[derive(Default)]
struct RecordingConnection {
    sent: Mutex<Vec<PushMessage>>,
    batches: Mutex<Vec<Vec<PushMessage>>>,
}

#[async_trait]
impl SubscriberConnection for RecordingConnection {
    async fn send(&self, message: &PushMessage) -> Result<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
    async fn send_batch(&self, messages: &[PushMessage]) -> Result<()> {
        self.batches.lock().push(messages.to_vec());
        Ok(())
    }
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn fanout_over(storage: Arc<InMemoryStorage>) -> Arc<NewsFanout> {
    let registry = Arc::new(SubscriberRegistry::new(Arc::new(CacheManager::new())));
    Arc::new(NewsFanout::new(storage, registry, FanoutConfig::default()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trigger_to_subscriber_end_to_end() {
    let storage = Arc::new(InMemoryStorage::new());
    let fanout = fanout_over(Arc::clone(&storage));
    let loop_task = Arc::clone(&fanout).spawn().await.unwrap();

    let alice = Arc::new(RecordingConnection::default());
    let bob = Arc::new(RecordingConnection::default());
    fanout
        .connect(Arc::clone(&alice) as Arc<dyn SubscriberConnection>)
        .await
        .unwrap();
    fanout
        .connect(Arc::clone(&bob) as Arc<dyn SubscriberConnection>)
        .await
        .unwrap();

    storage
        .notify(
            VK_MESSAGES,
            r#"{"group_name":"Wall","text":"vk post","created_at":"2026-08-27T10:00:00Z"}"#,
        )
        .await;
    storage
        .notify(
            TG_CHANNEL_MESSAGES,
            r#"{"channel_name":"News","text":"tg post","created_at":"2026-08-27T10:00:01Z"}"#,
        )
        .await;

    storage.close_listeners();
    // the loop joins every send before exiting
    loop_task.await.unwrap();

    // both events persisted exactly once
    let persisted = storage.messages.lock();
    assert_eq!(persisted.len(), 2);

    // and delivered to both subscribers as live pushes
    for connection in [&alice, &bob] {
        let sent = connection.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.is_new));
        let mut texts: Vec<&str> = sent.iter().map(|m| m.message.text.as_str()).collect();
        texts.sort_unstable();
        assert_eq!(texts, vec!["tg post", "vk post"]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_during_distribution_is_clean() {
    let storage = Arc::new(InMemoryStorage::new());
    let fanout = fanout_over(Arc::clone(&storage));
    let loop_task = Arc::clone(&fanout).spawn().await.unwrap();

    let connection = Arc::new(RecordingConnection::default());
    let handle = fanout
        .connect(Arc::clone(&connection) as Arc<dyn SubscriberConnection>)
        .await
        .unwrap();
    fanout.disconnect(handle.id).await;

    storage
        .notify(
            VK_MESSAGES,
            r#"{"group_name":"Wall","text":"after disconnect","created_at":"2026-08-27T10:00:00Z"}"#,
        )
        .await;

    storage.close_listeners();
    loop_task.await.unwrap();

    // persisted regardless of who is listening, nothing pushed to the
    // departed subscriber
    assert_eq!(storage.messages.lock().len(), 1);
    assert!(connection.sent.lock().is_empty());
    assert!(fanout.registry().get(handle.id).await.is_none());
}

#[tokio::test]
async fn catch_up_walks_history_in_pages() {
    let storage = Arc::new(InMemoryStorage::new());
    {
        let mut history = storage.history.lock();
        for n in 0..12 {
            history.push(NewsMessage {
                group_name: "Wall".to_string(),
                text: format!("old {n}"),
                attachments: Vec::new(),
                created_at: Utc::now(),
                source_type: SourceType::Vk,
            });
        }
    }
    let fanout = fanout_over(storage);

    let connection = Arc::new(RecordingConnection::default());
    let handle = fanout
        .connect(Arc::clone(&connection) as Arc<dyn SubscriberConnection>)
        .await
        .unwrap();

    // connect delivered the first page, fetch_more the rest
    assert_eq!(handle.offset(), 10);
    assert_eq!(fanout.fetch_more(handle.id).await.unwrap(), 2);
    assert_eq!(fanout.fetch_more(handle.id).await.unwrap(), 0);

    let batches = connection.batches.lock();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 10);
    assert_eq!(batches[1].len(), 2);
    assert_eq!(batches[1][0].message.text, "old 10");
    assert!(batches.iter().flatten().all(|m| !m.is_new));
}
