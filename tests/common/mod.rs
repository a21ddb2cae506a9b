//! Shared in-memory fakes for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use newsgather_core::error::{EngineError, Result};
use newsgather_core::storage::{
    ChangeEvent, FeedItem, NewsMessage, SecondaryCache, Source, Storage,
};

/// Storage fake with the same trigger behavior as the Postgres backend:
/// listeners subscribe to named channels and `notify` pushes to them.
#[derive(Default)]
pub struct InMemoryStorage {
    pub messages: Mutex<Vec<NewsMessage>>,
    pub history: Mutex<Vec<NewsMessage>>,
    pub sources: Mutex<Vec<Source>>,
    pub roles: Mutex<Vec<(String, String)>>,
    listeners: Mutex<HashMap<String, Vec<mpsc::Sender<ChangeEvent>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage-level trigger firing on `channel`.
    pub async fn notify(&self, channel: &str, payload: &str) {
        let senders = {
            let listeners = self.listeners.lock();
            listeners.get(channel).cloned().unwrap_or_default()
        };
        for sender in senders {
            let _ = sender
                .send(ChangeEvent {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .await;
        }
    }

    /// Drop every listener sender, closing the merged stream downstream.
    pub fn close_listeners(&self) {
        self.listeners.lock().clear();
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_sources_list(&self) -> Result<Vec<Source>> {
        Ok(self.sources.lock().clone())
    }

    async fn insert_items(&self, _source: &Source, _items: &[FeedItem]) -> Result<()> {
        Ok(())
    }

    async fn update_source_mark(&self, source_id: &str, high_water_mark: i64) -> Result<()> {
        let mut sources = self.sources.lock();
        if let Some(source) = sources.iter_mut().find(|s| s.id == source_id) {
            source.high_water_mark = high_water_mark;
        }
        Ok(())
    }

    async fn change_listener(
        &self,
        channel: &str,
        buffer: usize,
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(buffer);
        self.listeners
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn fetch_messages_page(&self, limit: u32, offset: u32) -> Result<Vec<NewsMessage>> {
        Ok(self
            .history
            .lock()
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn insert_message(&self, message: &NewsMessage) -> Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }

    async fn fetch_role_assignments(&self) -> Result<Vec<(String, String)>> {
        Ok(self.roles.lock().clone())
    }
}

/// Secondary-cache fake with a toggleable outage.
#[derive(Default)]
pub struct InMemoryCache {
    store: Mutex<HashMap<String, String>>,
    down: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn entry_count(&self) -> usize {
        self.store.lock().len()
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(EngineError::Cache("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SecondaryCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<String> {
        self.check()?;
        self.store
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("key {key}")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.store.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.store.lock().remove(key);
        Ok(())
    }

    async fn bulk_set(&self, pairs: &[(String, String)]) -> Result<()> {
        self.check()?;
        let mut store = self.store.lock();
        for (k, v) in pairs {
            store.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}
