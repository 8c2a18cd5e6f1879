use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, GuildId, MessageId, MessageSnapshot, RoleId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformEventKind {
    MessageCreated,
    MessageUpdated,
    MessageDeleted,
}

/// Gateway event as delivered to the relay by the ingest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PlatformEvent {
    MessageCreated {
        message: MessageSnapshot,
    },
    MessageUpdated {
        message: MessageSnapshot,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
}

impl PlatformEvent {
    pub fn kind(&self) -> PlatformEventKind {
        match self {
            PlatformEvent::MessageCreated { .. } => PlatformEventKind::MessageCreated,
            PlatformEvent::MessageUpdated { .. } => PlatformEventKind::MessageUpdated,
            PlatformEvent::MessageDeleted { .. } => PlatformEventKind::MessageDeleted,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        match self {
            PlatformEvent::MessageCreated { message } | PlatformEvent::MessageUpdated { message } => {
                message.channel_id
            }
            PlatformEvent::MessageDeleted { channel_id, .. } => *channel_id,
        }
    }

    pub fn message(&self) -> Option<&MessageSnapshot> {
        match self {
            PlatformEvent::MessageCreated { message } | PlatformEvent::MessageUpdated { message } => {
                Some(message)
            }
            PlatformEvent::MessageDeleted { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCommandRequest {
    pub actor_id: UserId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteCommandRequest {
    pub actor_id: UserId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelInteractionRequest {
    pub actor_id: UserId,
    pub custom_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddLinkRequest {
    pub actor_id: UserId,
    pub source_channel_id: ChannelId,
    pub destination_channel_id: ChannelId,
    pub destination_server_id: GuildId,
    #[serde(default)]
    pub role_mention_id: Option<RoleId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoAutoDisableRequest {
    pub actor_id: UserId,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub message: String,
}

impl CommandResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSourcesResponse {
    pub destination_channel_id: ChannelId,
    pub legacy_sources: Vec<ChannelId>,
    pub non_legacy_sources: Vec<ChannelId>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
