//! # Debounce Aggregator
//!
//! Platforms deliver one logical multi-part message (an album with a
//! caption, say) as a burst of separate events that share a group id. There
//! is no "last part" marker: completion is inferred from silence. The
//! aggregator parks an accumulator in the TTL cache with a finalizer, and
//! every new fragment re-arms the same window, so the finalizer only runs
//! after a quiet period with no further fragments.
//!
//! Finalization resolves every collected part concurrently through the
//! media client, assembles the canonical record, and persists it exactly
//! once. Failed part resolutions and failed persistence are logged and
//! dropped — this path is deliberately at-most-once, best effort.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::{CacheManager, Finalizer};
use crate::storage::{Attachment, AttachmentKind, MediaClient, NewsMessage, SourceType, Storage};

/// Namespace holding in-flight aggregates, keyed by group id.
pub const MEDIA_GROUP_NAMESPACE: &str = "media_group_pending";

/// An unresolved part reference: the platform file id plus its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRef {
    pub file_id: String,
    pub kind: AttachmentKind,
}

/// One fragment of a multi-part message as delivered by the platform.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Shared group id tying the fragments of one logical message together.
    pub group_id: String,
    /// Label of the originating group/channel.
    pub group_label: String,
    /// Present on the fragment that carries the caption.
    pub text: Option<String>,
    pub author: Option<String>,
    pub part: Option<PartRef>,
    pub created_at: DateTime<Utc>,
}

/// Mutable accumulator for one group id. Owned by the cache entry until the
/// finalizer consumes it.
#[derive(Debug, Clone)]
pub struct PendingAggregate {
    pub group_label: String,
    pub text: String,
    pub author: Option<String>,
    pub parts: Vec<PartRef>,
    pub created_at: DateTime<Utc>,
}

impl PendingAggregate {
    fn from_fragment(fragment: &Fragment) -> Self {
        let mut aggregate = Self {
            group_label: fragment.group_label.clone(),
            text: String::new(),
            author: None,
            parts: Vec::new(),
            created_at: fragment.created_at,
        };
        aggregate.absorb(fragment);
        aggregate
    }

    /// Fold one more fragment into the accumulator.
    fn absorb(&mut self, fragment: &Fragment) {
        if let Some(text) = &fragment.text {
            self.text = text.clone();
        }
        if let Some(author) = &fragment.author {
            self.author = Some(author.clone());
        }
        if let Some(part) = &fragment.part {
            self.parts.push(part.clone());
        }
        self.group_label = fragment.group_label.clone();
        self.created_at = fragment.created_at;
    }
}

/// Coalesces fragment bursts into single persisted records.
pub struct Aggregator {
    cache: Arc<CacheManager<PendingAggregate>>,
    window: Duration,
    finalizer: Finalizer<PendingAggregate>,
}

impl Aggregator {
    pub fn new(
        cache: Arc<CacheManager<PendingAggregate>>,
        media: Arc<dyn MediaClient>,
        storage: Arc<dyn Storage>,
        window: Duration,
    ) -> Self {
        cache.create_namespace(MEDIA_GROUP_NAMESPACE);

        let finalizer: Finalizer<PendingAggregate> = Arc::new(move |group_id, aggregate| {
            let media = Arc::clone(&media);
            let storage = Arc::clone(&storage);
            Box::pin(async move {
                finalize(media, storage, group_id, aggregate).await;
            })
        });

        Self {
            cache,
            window,
            finalizer,
        }
    }

    /// Feed one fragment in. The first fragment for a group opens the
    /// debounce window; every subsequent one mutates the accumulator under
    /// the namespace lock and re-arms the same window with the same
    /// finalizer.
    pub async fn ingest(&self, fragment: Fragment) {
        let group_id = fragment.group_id.clone();

        if self.cache.get(MEDIA_GROUP_NAMESPACE, &group_id).await.is_none() {
            let aggregate = PendingAggregate::from_fragment(&fragment);
            self.cache
                .set_with_finalizer(
                    MEDIA_GROUP_NAMESPACE,
                    &group_id,
                    aggregate,
                    Some(self.window),
                    Arc::clone(&self.finalizer),
                )
                .await;
            return;
        }

        let absorbed = self
            .cache
            .with_exclusive_lock(MEDIA_GROUP_NAMESPACE, |section| {
                section.update(&group_id, |aggregate| aggregate.absorb(&fragment))
            })
            .await
            .ok()
            .flatten();

        if absorbed.is_none() {
            // The window elapsed between the lookup and the locked section;
            // this fragment opens a fresh aggregate.
            self.cache
                .set_with_finalizer(
                    MEDIA_GROUP_NAMESPACE,
                    &group_id,
                    PendingAggregate::from_fragment(&fragment),
                    Some(self.window),
                    Arc::clone(&self.finalizer),
                )
                .await;
            return;
        }

        // Re-arm the window only; the entry's value is re-read under the
        // gate, so a fragment absorbed by a concurrent caller is never lost
        // to this caller's re-arm. A false return means the aggregate was
        // finalized after the absorb above, fragment included.
        self.cache
            .refresh_with_finalizer(
                MEDIA_GROUP_NAMESPACE,
                &group_id,
                Some(self.window),
                Arc::clone(&self.finalizer),
            )
            .await;
    }
}

/// Runs once per aggregate, after the quiet window. Resolves all parts
/// concurrently, then persists the assembled record.
async fn finalize(
    media: Arc<dyn MediaClient>,
    storage: Arc<dyn Storage>,
    group_id: String,
    aggregate: PendingAggregate,
) {
    let mut resolutions: JoinSet<Option<Attachment>> = JoinSet::new();

    for part in aggregate.parts.iter().cloned() {
        let media = Arc::clone(&media);
        resolutions.spawn(async move {
            match media.fetch_attachment_url(&part.file_id).await {
                Ok(url) => Some(Attachment {
                    url,
                    kind: part.kind,
                }),
                Err(err) => {
                    warn!(file_id = %part.file_id, error = %err, "dropping unresolvable part");
                    None
                }
            }
        });
    }

    let mut attachments = Vec::with_capacity(aggregate.parts.len());
    while let Some(joined) = resolutions.join_next().await {
        if let Ok(Some(attachment)) = joined {
            attachments.push(attachment);
        }
    }

    let message = NewsMessage {
        group_name: aggregate.group_label,
        text: aggregate.text,
        attachments,
        created_at: aggregate.created_at,
        source_type: SourceType::Tg,
    };

    debug!(
        group_id = %group_id,
        attachments = message.attachments.len(),
        "media group finalized"
    );

    if let Err(err) = storage.insert_message(&message).await {
        warn!(group_id = %group_id, error = %err, "failed to persist aggregated message");
    }
}
