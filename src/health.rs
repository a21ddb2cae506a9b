//! Secondary-cache health supervision.
//!
//! Any component that hits a secondary-cache error reports it here. Reports
//! are non-blocking and coalesce: while a recovery cycle is pending or
//! running, further reports are absorbed. The recovery task flips the engine
//! into degraded mode, probes the cache until it answers, repopulates it
//! from durable storage, and only then clears the flag. While degraded,
//! reads bypass the cache entirely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::storage::{SecondaryCache, Storage};

/// Shared health state plus the coalescing recovery trigger.
pub struct HealthSupervisor {
    degraded: Arc<AtomicBool>,
    trigger: mpsc::Sender<()>,
    // taken once by spawn_recovery
    pending: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
}

impl HealthSupervisor {
    pub fn new() -> Arc<Self> {
        // capacity 1: one queued recovery is all that ever matters
        let (trigger, receiver) = mpsc::channel(1);
        Arc::new(Self {
            degraded: Arc::new(AtomicBool::new(false)),
            trigger,
            pending: parking_lot::Mutex::new(Some(receiver)),
        })
    }

    /// Whether reads should currently bypass the secondary cache.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Report a secondary-cache failure. Never blocks; a full trigger slot
    /// means a recovery is already pending and this report coalesces into it.
    pub fn report_failure(&self) {
        if self.trigger.try_send(()).is_ok() {
            warn!("secondary cache failure reported, recovery scheduled");
        }
    }

    /// Start the recovery loop. Call once; later calls are a no-op.
    pub fn spawn_recovery(
        &self,
        cache: Arc<dyn SecondaryCache>,
        storage: Arc<dyn Storage>,
        retry_interval: std::time::Duration,
    ) -> Option<JoinHandle<()>> {
        let mut receiver = self.pending.lock().take()?;
        let degraded = Arc::clone(&self.degraded);

        Some(tokio::spawn(async move {
            while receiver.recv().await.is_some() {
                degraded.store(true, Ordering::Release);
                warn!("secondary cache degraded, waiting for it to come back");

                while let Err(err) = cache.ping().await {
                    warn!(error = %err, "secondary cache still unreachable");
                    tokio::time::sleep(retry_interval).await;
                }

                // reachable again: repopulate before serving reads from it
                loop {
                    match Self::repopulate(&*cache, &*storage).await {
                        Ok(count) => {
                            info!(entries = count, "secondary cache repopulated");
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, "secondary cache repopulation failed, retrying");
                            tokio::time::sleep(retry_interval).await;
                        }
                    }
                }

                degraded.store(false, Ordering::Release);
                info!("secondary cache healthy again");
            }
        }))
    }

    async fn repopulate(
        cache: &dyn SecondaryCache,
        storage: &dyn Storage,
    ) -> crate::error::Result<usize> {
        let assignments = storage.fetch_role_assignments().await?;
        cache.bulk_set(&assignments).await?;
        Ok(assignments.len())
    }

    /// Read-through helper: serve from the secondary cache when healthy,
    /// fall back to `fetch` otherwise.
    ///
    /// A cache miss is not a failure; any other cache error reports the
    /// outage and falls back. The fallback value is written back only when
    /// the cache is still considered healthy.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        cache: &dyn SecondaryCache,
        key: &str,
        fetch: F,
    ) -> crate::error::Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<String>>,
    {
        if self.is_degraded() {
            return fetch().await;
        }

        match cache.get(key).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(key = %key, error = %err, "secondary cache read failed");
                self.report_failure();
                return fetch().await;
            }
        }

        let value = fetch().await?;
        if !self.is_degraded() {
            if let Err(err) = cache.set(key, &value).await {
                warn!(key = %key, error = %err, "secondary cache write-back failed");
                self.report_failure();
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use crate::storage::{ChangeEvent, FeedItem, NewsMessage, Source};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::advance;

    struct FlakyCache {
        store: Mutex<HashMap<String, String>>,
        healthy: AtomicBool,
        failing_pings_before_recovery: AtomicUsize,
        bulk_sets: AtomicUsize,
    }

    impl FlakyCache {
        fn new() -> Self {
            Self {
                store: Mutex::new(HashMap::new()),
                healthy: AtomicBool::new(true),
                failing_pings_before_recovery: AtomicUsize::new(0),
                bulk_sets: AtomicUsize::new(0),
            }
        }

        fn go_down(&self, pings_until_up: usize) {
            self.healthy.store(false, Ordering::SeqCst);
            self.failing_pings_before_recovery
                .store(pings_until_up, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(EngineError::Cache("connection refused".to_string()))
            }
        }
    }

    #[async_trait]
    impl SecondaryCache for FlakyCache {
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
            self.bulk_sets.fetch_add(1, Ordering::SeqCst);
            let mut store = self.store.lock();
            for (k, v) in pairs {
                store.insert(k.clone(), v.clone());
            }
            Ok(())
        }
        async fn ping(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                return Ok(());
            }
            let left = self.failing_pings_before_recovery.load(Ordering::SeqCst);
            if left <= 1 {
                self.healthy.store(true, Ordering::SeqCst);
                return Ok(());
            }
            self.failing_pings_before_recovery
                .store(left - 1, Ordering::SeqCst);
            Err(EngineError::Cache("no pong".to_string()))
        }
    }

    struct RoleStorage {
        roles: Vec<(String, String)>,
    }

    #[async_trait]
    impl Storage for RoleStorage {
        async fn get_sources_list(&self) -> Result<Vec<Source>> {
            Ok(Vec::new())
        }
        async fn insert_items(&self, _source: &Source, _items: &[FeedItem]) -> Result<()> {
            Ok(())
        }
        async fn update_source_mark(&self, _source_id: &str, _mark: i64) -> Result<()> {
            Ok(())
        }
        async fn change_listener(
            &self,
            _channel: &str,
            _buffer: usize,
        ) -> Result<mpsc::Receiver<ChangeEvent>> {
            Err(EngineError::NotFound("listener".into()))
        }
        async fn fetch_messages_page(&self, _limit: u32, _offset: u32) -> Result<Vec<NewsMessage>> {
            Ok(Vec::new())
        }
        async fn insert_message(&self, _message: &NewsMessage) -> Result<()> {
            Ok(())
        }
        async fn fetch_role_assignments(&self) -> Result<Vec<(String, String)>> {
            Ok(self.roles.clone())
        }
    }

    fn role_storage() -> Arc<RoleStorage> {
        Arc::new(RoleStorage {
            roles: vec![
                ("1".to_string(), "admin".to_string()),
                ("2".to_string(), "reader".to_string()),
            ],
        })
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_cycle_repopulates_and_clears_flag() {
        let cache = Arc::new(FlakyCache::new());
        let supervisor = HealthSupervisor::new();
        supervisor.spawn_recovery(
            Arc::clone(&cache) as Arc<dyn SecondaryCache>,
            role_storage(),
            Duration::from_secs(10),
        );

        cache.go_down(3);
        supervisor.report_failure();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(supervisor.is_degraded());

        // two failed probes, then the third succeeds
        advance(Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(supervisor.is_degraded());

        advance(Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(!supervisor.is_degraded());
        assert_eq!(cache.bulk_sets.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("1").await.unwrap(), "admin");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reports_coalesce_into_one_cycle() {
        let cache = Arc::new(FlakyCache::new());
        let supervisor = HealthSupervisor::new();
        supervisor.spawn_recovery(
            Arc::clone(&cache) as Arc<dyn SecondaryCache>,
            role_storage(),
            Duration::from_secs(10),
        );

        cache.go_down(1);
        for _ in 0..50 {
            supervisor.report_failure();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        // cache answered the first probe; at most the one coalesced queued
        // trigger can run a second cycle against a now-healthy cache
        advance(Duration::from_secs(30)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(!supervisor.is_degraded());
        assert!(cache.bulk_sets.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn spawn_recovery_is_single_shot() {
        let cache = Arc::new(FlakyCache::new());
        let supervisor = HealthSupervisor::new();

        let first = supervisor.spawn_recovery(
            Arc::clone(&cache) as Arc<dyn SecondaryCache>,
            role_storage(),
            Duration::from_secs(1),
        );
        let second = supervisor.spawn_recovery(
            Arc::clone(&cache) as Arc<dyn SecondaryCache>,
            role_storage(),
            Duration::from_secs(1),
        );

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn get_or_fetch_serves_cache_hit() {
        let cache = FlakyCache::new();
        cache.set("k", "cached").await.unwrap();
        let supervisor = HealthSupervisor::new();

        let value = supervisor
            .get_or_fetch(&cache, "k", || async { Ok("fetched".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "cached");
    }

    #[tokio::test]
    async fn get_or_fetch_writes_back_on_miss() {
        let cache = FlakyCache::new();
        let supervisor = HealthSupervisor::new();

        let value = supervisor
            .get_or_fetch(&cache, "k", || async { Ok("fetched".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fetched");
        assert_eq!(cache.get("k").await.unwrap(), "fetched");
    }

    #[tokio::test]
    async fn get_or_fetch_bypasses_cache_while_degraded() {
        let cache = FlakyCache::new();
        cache.set("k", "stale").await.unwrap();
        let supervisor = HealthSupervisor::new();
        supervisor.degraded.store(true, Ordering::Release);

        let value = supervisor
            .get_or_fetch(&cache, "k", || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
    }

    #[tokio::test]
    async fn cache_error_reports_failure_and_falls_back() {
        let cache = FlakyCache::new();
        cache.go_down(usize::MAX);
        let supervisor = HealthSupervisor::new();

        let value = supervisor
            .get_or_fetch(&cache, "k", || async { Ok("fallback".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fallback");

        // a recovery trigger was queued
        let mut receiver = supervisor.pending.lock().take().unwrap();
        assert!(receiver.try_recv().is_ok());
    }
}
