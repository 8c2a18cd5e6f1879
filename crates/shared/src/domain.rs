use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GuildId);
id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(RoleId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    /// Announcement channel; messages must be crossposted to reach followers.
    News,
    Voice,
    Other,
}

impl ChannelKind {
    pub fn is_textable(self) -> bool {
        matches!(self, ChannelKind::Text | ChannelKind::News)
    }

    pub fn is_announcement(self) -> bool {
        matches!(self, ChannelKind::News)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub kind: ChannelKind,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub color: Option<u32>,
    #[serde(default)]
    pub fields: Vec<EmbedField>,
    #[serde(default)]
    pub footer: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

impl Embed {
    /// True when the embed carries content of its own rather than only a link preview.
    pub fn has_rich_content(&self) -> bool {
        self.title.is_some()
            || self.description.is_some()
            || !self.fields.is_empty()
            || self.footer.is_some()
            || self.author.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|mime| mime.starts_with("image"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    /// The message was published from an announcement channel to its followers.
    #[serde(default)]
    pub crossposted: bool,
    /// The message is itself a copy delivered through channel following.
    #[serde(default)]
    pub is_crosspost: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReference {
    pub guild_id: Option<GuildId>,
    pub channel_id: ChannelId,
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub author_id: Option<UserId>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub flags: MessageFlags,
    #[serde(default)]
    pub reference: Option<MessageReference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub custom_id: String,
    pub label: String,
    #[serde(default)]
    pub danger: bool,
}

/// Content posted or edited through the platform client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    pub embeds: Vec<Embed>,
    pub attachments: Vec<Attachment>,
    pub buttons: Vec<ActionButton>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorOperationKind {
    Send,
    Update,
    Delete,
}

impl fmt::Display for MirrorOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MirrorOperationKind::Send => "send",
            MirrorOperationKind::Update => "update",
            MirrorOperationKind::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorLink {
    pub source_channel_id: ChannelId,
    pub destination_channel_id: ChannelId,
    pub destination_server_id: Option<GuildId>,
    pub is_legacy: bool,
    pub enabled: bool,
    pub role_mention_id: Option<RoleId>,
    pub consecutive_error_count: i64,
    pub disabled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMirrorLink {
    pub source_channel_id: ChannelId,
    pub destination_channel_id: ChannelId,
    pub destination_server_id: Option<GuildId>,
    pub is_legacy: bool,
    pub enabled: bool,
    pub role_mention_id: Option<RoleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkPair {
    pub source_channel_id: ChannelId,
    pub destination_channel_id: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorDestination {
    pub channel_id: ChannelId,
    pub role_mention_id: Option<RoleId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredMessagePair {
    pub destination_channel_id: ChannelId,
    pub destination_message_id: MessageId,
    pub source_channel_id: ChannelId,
    pub source_message_id: MessageId,
    pub created_at: DateTime<Utc>,
}
