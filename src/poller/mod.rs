//! # Adaptive Poller
//!
//! One polling loop per external feed source. Each loop waits on its timer
//! or a stop signal, fetches the newest items, filters out everything at or
//! below the source's high-water mark, persists the rest, and recomputes
//! the interval through a pluggable [`BackoffPolicy`]: the floor while the
//! source is active, decaying back toward it while quiet, plus jitter so
//! sources never fire in lockstep.
//!
//! The high-water mark only ever moves forward, which makes re-polling
//! idempotent: stale items are always discarded. Fetch and persist errors
//! are logged and retried on the next tick; they never terminate the loop.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::error::{EngineError, Result};
use crate::storage::{FeedClient, Source, Storage};

pub use backoff::{policy_for, with_jitter, BackoffPolicy, DecayTowardFloor, ExponentialGrowth, PollBounds};

/// Running poller for one source. Stopping is cooperative and idempotent:
/// the signal is checked in the same wait as the timer, an in-flight fetch
/// completes before the loop exits, and a second stop is a no-op.
pub struct PollerHandle {
    source_id: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Signal the loop to exit after any in-flight poll completes. Never
    /// blocks; safe to call more than once.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the polling loop for one source.
pub fn spawn_poller(
    source: Source,
    client: Arc<dyn FeedClient>,
    storage: Arc<dyn Storage>,
    config: &PollerConfig,
) -> PollerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let bounds = PollBounds {
        min: config.min_interval(),
        max: config.max_interval(),
    };
    let policy = policy_for(config.strategy);
    let fetch_count = config.fetch_count;
    let source_id = source.id.clone();

    let task = tokio::spawn(poll_loop(
        source, client, storage, bounds, policy, fetch_count, stop_rx,
    ));

    PollerHandle {
        source_id,
        stop: stop_tx,
        task,
    }
}

async fn poll_loop(
    mut source: Source,
    client: Arc<dyn FeedClient>,
    storage: Arc<dyn Storage>,
    bounds: PollBounds,
    policy: Box<dyn BackoffPolicy>,
    fetch_count: usize,
    mut stop: watch::Receiver<bool>,
) {
    info!(source = %source.id, "feed poller started");

    let mut interval = bounds.min;
    // first poll fires immediately
    let mut wait = Duration::ZERO;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!(source = %source.id, "feed poller shutting down");
                    return;
                }
                continue;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let got_items = match client.fetch_latest(&source, fetch_count).await {
            Ok(items) => ingest_batch(&mut source, &*storage, items).await,
            Err(err) => {
                warn!(source = %source.id, error = %err, "feed fetch failed, retrying next tick");
                false
            }
        };

        interval = policy.next_interval(interval, bounds, got_items);
        wait = with_jitter(interval);

        debug!(
            source = %source.id,
            interval_ms = interval.as_millis() as u64,
            wait_ms = wait.as_millis() as u64,
            "next poll scheduled"
        );
    }
}

/// Filter a fetched batch against the high-water mark, persist what is new
/// (oldest first), and advance the mark. Returns whether anything new
/// arrived.
async fn ingest_batch(
    source: &mut Source,
    storage: &dyn Storage,
    items: Vec<crate::storage::FeedItem>,
) -> bool {
    let newest_id = items.iter().map(|i| i.id).max();

    let mut fresh: Vec<_> = items
        .into_iter()
        .filter(|item| item.id > source.high_water_mark)
        .collect();
    fresh.sort_by_key(|item| item.id);

    let Some(newest_id) = newest_id else {
        return false;
    };

    if fresh.is_empty() {
        return false;
    }

    info!(
        source = %source.id,
        quantity = fresh.len(),
        "new feed items received"
    );

    if let Err(err) = storage.insert_items(source, &fresh).await {
        warn!(source = %source.id, error = %err, "failed to persist feed items");
    }

    // mark moves forward regardless of persist outcome: re-delivery is worse
    // than a dropped batch for this feed
    source.high_water_mark = source.high_water_mark.max(newest_id);
    if let Err(err) = storage
        .update_source_mark(&source.id, source.high_water_mark)
        .await
    {
        warn!(source = %source.id, error = %err, "failed to persist high-water mark");
    }

    true
}

/// Owns every live poller, keyed by source id.
pub struct PollerRegistry {
    pollers: DashMap<String, PollerHandle>,
    client: Arc<dyn FeedClient>,
    storage: Arc<dyn Storage>,
    config: PollerConfig,
}

impl PollerRegistry {
    pub fn new(client: Arc<dyn FeedClient>, storage: Arc<dyn Storage>, config: PollerConfig) -> Self {
        Self {
            pollers: DashMap::new(),
            client,
            storage,
            config,
        }
    }

    /// Spawn pollers for every source on record.
    pub async fn start_all(&self) -> Result<usize> {
        let sources = self.storage.get_sources_list().await?;
        let mut started = 0;
        for source in sources {
            match self.start(source) {
                Ok(()) => started += 1,
                Err(err) => warn!(error = %err, "skipping source"),
            }
        }
        Ok(started)
    }

    /// Start polling a source. Duplicate registration is an error.
    pub fn start(&self, source: Source) -> Result<()> {
        if self.pollers.contains_key(&source.id) {
            return Err(EngineError::AlreadyExists(format!("source {}", source.id)));
        }
        let handle = spawn_poller(
            source,
            Arc::clone(&self.client),
            Arc::clone(&self.storage),
            &self.config,
        );
        self.pollers.insert(handle.source_id().to_string(), handle);
        Ok(())
    }

    /// Stop and forget a source's poller.
    pub fn stop(&self, source_id: &str) -> Result<()> {
        let (_, handle) = self
            .pollers
            .remove(source_id)
            .ok_or_else(|| EngineError::NotFound(format!("source {source_id}")))?;
        handle.stop();
        Ok(())
    }

    /// Stop every poller (process shutdown).
    pub fn stop_all(&self) {
        self.pollers.retain(|_, handle| {
            handle.stop();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }
}
