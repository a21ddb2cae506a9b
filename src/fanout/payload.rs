//! Per-channel notification payload schemas and the mapping onto the
//! canonical message shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::storage::{Attachment, ChangeEvent, NewsMessage, SourceType};

/// Change-event channel raised for new Telegram channel messages.
pub const TG_CHANNEL_MESSAGES: &str = "insert_tg_channel_message";
/// Change-event channel raised for new Telegram group messages.
pub const TG_GROUP_MESSAGES: &str = "insert_tg_group_message";
/// Change-event channel raised for new VK wall messages.
pub const VK_MESSAGES: &str = "insert_vk_message";

/// Every channel the fan-out stage subscribes to.
pub const CHANNEL_TAGS: [&str; 3] = [TG_CHANNEL_MESSAGES, TG_GROUP_MESSAGES, VK_MESSAGES];

#[derive(Debug, Deserialize)]
struct TgChannelPayload {
    channel_name: String,
    text: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TgGroupPayload {
    group_name: String,
    username: String,
    text: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct VkPayload {
    group_name: String,
    text: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    created_at: DateTime<Utc>,
}

impl TgChannelPayload {
    fn into_news_message(self) -> NewsMessage {
        NewsMessage {
            group_name: format!("Канал: {}", self.channel_name),
            text: self.text,
            attachments: self.attachments,
            created_at: self.created_at,
            source_type: SourceType::Tg,
        }
    }
}

impl TgGroupPayload {
    fn into_news_message(self) -> NewsMessage {
        NewsMessage {
            group_name: format!("Группа: {}", self.group_name),
            text: format!("От: {}\n\n{}", self.username, self.text),
            attachments: self.attachments,
            created_at: self.created_at,
            source_type: SourceType::Tg,
        }
    }
}

impl VkPayload {
    fn into_news_message(self) -> NewsMessage {
        NewsMessage {
            group_name: self.group_name,
            text: self.text,
            attachments: self.attachments,
            created_at: self.created_at,
            source_type: SourceType::Vk,
        }
    }
}

/// Map a raw change event onto the canonical message shape.
///
/// Unknown channel tags are a hard error; malformed payloads surface the
/// parse failure. Callers drop the offending notification in either case.
pub fn to_news_message(event: &ChangeEvent) -> Result<NewsMessage> {
    match event.channel.as_str() {
        TG_CHANNEL_MESSAGES => {
            let payload: TgChannelPayload = serde_json::from_str(&event.payload)?;
            Ok(payload.into_news_message())
        }
        TG_GROUP_MESSAGES => {
            let payload: TgGroupPayload = serde_json::from_str(&event.payload)?;
            Ok(payload.into_news_message())
        }
        VK_MESSAGES => {
            let payload: VkPayload = serde_json::from_str(&event.payload)?;
            Ok(payload.into_news_message())
        }
        other => Err(EngineError::UnrecognizedChannel(other.to_string())),
    }
}

/// What a live subscriber receives: the canonical shape plus a flag
/// distinguishing live push from catch-up delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(flatten)]
    pub message: NewsMessage,
    #[serde(rename = "new")]
    pub is_new: bool,
}

impl PushMessage {
    pub fn live(message: NewsMessage) -> Self {
        Self {
            message,
            is_new: true,
        }
    }

    pub fn catch_up(message: NewsMessage) -> Self {
        Self {
            message,
            is_new: false,
        }
    }
}
