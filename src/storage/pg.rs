//! Postgres-backed durable storage.
//!
//! Runtime-checked sqlx queries against the news schema, plus LISTEN/NOTIFY
//! change listeners that forward notifications into bounded channels.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::storage::{
    Attachment, ChangeEvent, FeedItem, NewsMessage, SecondaryCache, Source, SourceType, Storage,
};

/// Durable storage over a Postgres pool.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn source_type_tag(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Tg => "tg",
        SourceType::Vk => "vk",
    }
}

fn parse_source_type(tag: &str) -> Result<SourceType> {
    match tag {
        "tg" => Ok(SourceType::Tg),
        "vk" => Ok(SourceType::Vk),
        other => Err(EngineError::Storage(format!(
            "unknown source type tag: {other}"
        ))),
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn get_sources_list(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            "SELECT source_id, name, feed_id, high_water_mark FROM feed_sources ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Source {
                    id: row.try_get("source_id")?,
                    name: row.try_get("name")?,
                    feed_id: row.try_get("feed_id")?,
                    high_water_mark: row.try_get("high_water_mark")?,
                })
            })
            .collect()
    }

    async fn insert_items(&self, source: &Source, items: &[FeedItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            let metadata = serde_json::to_value(&item.attachments)?;
            sqlx::query(
                "INSERT INTO feed_items (source_id, item_id, text, metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (source_id, item_id) DO NOTHING",
            )
            .bind(&source.id)
            .bind(item.id)
            .bind(&item.text)
            .bind(metadata)
            .bind(item.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(source_id = %source.id, count = items.len(), "feed items persisted");
        Ok(())
    }

    async fn update_source_mark(&self, source_id: &str, high_water_mark: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE feed_sources SET high_water_mark = $2 \
             WHERE source_id = $1 AND high_water_mark < $2",
        )
        .bind(source_id)
        .bind(high_water_mark)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(source_id = %source_id, mark = high_water_mark, "high-water mark unchanged");
        }
        Ok(())
    }

    async fn change_listener(
        &self,
        channel: &str,
        buffer: usize,
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        info!(channel = %channel, "postgres change listener attached");

        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let event = ChangeEvent {
                            channel: notification.channel().to_string(),
                            payload: notification.payload().to_string(),
                        };
                        if tx.send(event).await.is_err() {
                            debug!(channel = %channel, "change-event consumer gone");
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "postgres listener failed");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn fetch_messages_page(&self, limit: u32, offset: u32) -> Result<Vec<NewsMessage>> {
        let rows = sqlx::query(
            "SELECT group_name, text, metadata, created_at, type FROM web_messages \
             ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let metadata: Option<serde_json::Value> = row.try_get("metadata")?;
                let attachments: Vec<Attachment> = match metadata {
                    Some(value) => serde_json::from_value(value)?,
                    None => Vec::new(),
                };
                let created_at: DateTime<Utc> = row.try_get("created_at")?;
                let tag: String = row.try_get("type")?;
                Ok(NewsMessage {
                    group_name: row.try_get("group_name")?,
                    text: row.try_get("text")?,
                    attachments,
                    created_at,
                    source_type: parse_source_type(&tag)?,
                })
            })
            .collect()
    }

    async fn insert_message(&self, message: &NewsMessage) -> Result<()> {
        let metadata = if message.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&message.attachments)?)
        };

        sqlx::query(
            "INSERT INTO web_messages (group_name, text, metadata, created_at, type) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&message.group_name)
        .bind(&message.text)
        .bind(metadata)
        .bind(message.created_at)
        .bind(source_type_tag(message.source_type))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_role_assignments(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT user_id::text, role_name FROM user_roles")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| Ok((row.try_get("user_id")?, row.try_get("role_name")?)))
            .collect()
    }
}

/// Secondary cache backed by a plain key/value table. Stands in for an
/// external volatile store when none is deployed; the health supervisor
/// treats it exactly the same.
#[derive(Clone)]
pub struct PgSecondaryCache {
    pool: PgPool,
}

impl PgSecondaryCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecondaryCache for PgSecondaryCache {
    async fn get(&self, key: &str) -> Result<String> {
        let row = sqlx::query("SELECT value FROM kv_cache WHERE key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("value")?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_cache (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_cache WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bulk_set(&self, pairs: &[(String, String)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in pairs {
            sqlx::query(
                "INSERT INTO kv_cache (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_tags_round_trip() {
        assert_eq!(source_type_tag(SourceType::Tg), "tg");
        assert_eq!(source_type_tag(SourceType::Vk), "vk");
        assert_eq!(parse_source_type("tg").unwrap(), SourceType::Tg);
        assert_eq!(parse_source_type("vk").unwrap(), SourceType::Vk);
    }

    #[test]
    fn unknown_tag_is_storage_error() {
        let err = parse_source_type("rss").unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
