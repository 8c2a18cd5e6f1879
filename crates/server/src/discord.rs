//! Discord REST adapter for the mirror engine.
//!
//! Writes go straight to the HTTP API; gateway events arrive through the ingest
//! route and are handed to waiters by the [`EventHub`].

use std::time::Duration;

use async_trait::async_trait;
use mirror::{ChatPlatform, EventPredicate, PlatformError};
use reqwest::{
    header::AUTHORIZATION,
    multipart::{Form, Part},
    Client, RequestBuilder, Response, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use shared::{
    domain::{
        ActionButton, Attachment, ChannelId, ChannelInfo, ChannelKind, Embed, EmbedField, GuildId,
        MessageFlags, MessageId, MessageReference, MessageSnapshot, OutboundMessage, UserId,
    },
    protocol::{PlatformEvent, PlatformEventKind},
};
use tracing::debug;

use crate::events::EventHub;

const ALREADY_CROSSPOSTED: u32 = 40033;
const FLAG_CROSSPOSTED: u64 = 1 << 0;
const FLAG_IS_CROSSPOST: u64 = 1 << 1;
const BUTTON_STYLE_SECONDARY: u8 = 2;
const BUTTON_STYLE_DANGER: u8 = 4;

pub struct DiscordPlatform {
    http: Client,
    api_base: String,
    token: String,
    events: EventHub,
}

impl DiscordPlatform {
    pub fn new(api_base: &str, token: &str, events: EventHub) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("DiscordBot (relay, ", env!("CARGO_PKG_VERSION"), ")"))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            events,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, PlatformError> {
        let response = request
            .header(AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_from_response(status, &body))
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, PlatformError> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .map_err(transport_error)
    }

    /// Downloads each attachment so it can be re-uploaded with the mirrored message.
    async fn attachment_form(
        &self,
        payload: Value,
        attachments: &[Attachment],
    ) -> Result<Form, PlatformError> {
        let mut form = Form::new().text("payload_json", payload.to_string());
        for (index, attachment) in attachments.iter().enumerate() {
            let bytes = self
                .http
                .get(&attachment.url)
                .send()
                .await
                .map_err(transport_error)?
                .error_for_status()
                .map_err(transport_error)?
                .bytes()
                .await
                .map_err(transport_error)?;
            let mut part = Part::bytes(bytes.to_vec()).file_name(attachment.filename.clone());
            if let Some(mime) = &attachment.content_type {
                part = part.mime_str(mime).map_err(transport_error)?;
            }
            form = form.part(format!("files[{index}]"), part);
        }
        Ok(form)
    }
}

fn transport_error(error: reqwest::Error) -> PlatformError {
    PlatformError::Transient(error.to_string())
}

#[derive(Debug, Default, Deserialize)]
struct WireError {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retry_after: Option<f64>,
}

pub(crate) fn error_from_response(status: StatusCode, body: &str) -> PlatformError {
    let wire: WireError = serde_json::from_str(body).unwrap_or_default();
    let message = wire.message.unwrap_or_else(|| status.to_string());

    if wire.code == Some(ALREADY_CROSSPOSTED) {
        return PlatformError::AlreadyCrossposted;
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited {
            retry_after: Duration::from_secs_f64(wire.retry_after.unwrap_or(1.0).max(0.0)),
        },
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => PlatformError::Forbidden(message),
        StatusCode::NOT_FOUND => PlatformError::NotFound(message),
        status if status.is_client_error() => PlatformError::BadRequest {
            code: wire.code,
            message,
        },
        status => PlatformError::Transient(format!("{status}: {message}")),
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(try_from = "RawSnowflake")]
struct Snowflake(i64);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSnowflake {
    Text(String),
    Number(i64),
}

impl TryFrom<RawSnowflake> for Snowflake {
    type Error = std::num::ParseIntError;

    fn try_from(raw: RawSnowflake) -> Result<Self, Self::Error> {
        match raw {
            RawSnowflake::Text(text) => text.parse().map(Snowflake),
            RawSnowflake::Number(number) => Ok(Snowflake(number)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: Snowflake,
}

#[derive(Debug, Default, Deserialize)]
struct WireText {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMedia {
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireField {
    name: String,
    value: String,
    #[serde(default)]
    inline: bool,
}

#[derive(Debug, Deserialize)]
struct WireEmbed {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    color: Option<u32>,
    #[serde(default)]
    fields: Vec<WireField>,
    #[serde(default)]
    footer: Option<WireText>,
    #[serde(default)]
    author: Option<WireText>,
    #[serde(default)]
    image: Option<WireMedia>,
    #[serde(default)]
    thumbnail: Option<WireMedia>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    url: String,
    filename: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireReference {
    #[serde(default)]
    guild_id: Option<Snowflake>,
    channel_id: Snowflake,
    #[serde(default)]
    message_id: Option<Snowflake>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: Snowflake,
    channel_id: Snowflake,
    #[serde(default)]
    guild_id: Option<Snowflake>,
    #[serde(default)]
    author: Option<WireUser>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    embeds: Vec<WireEmbed>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
    #[serde(default)]
    flags: u64,
    #[serde(default)]
    message_reference: Option<WireReference>,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: Snowflake,
    #[serde(default)]
    guild_id: Option<Snowflake>,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
}

impl From<WireEmbed> for Embed {
    fn from(wire: WireEmbed) -> Self {
        Embed {
            title: wire.title,
            description: wire.description,
            url: wire.url,
            color: wire.color,
            fields: wire
                .fields
                .into_iter()
                .map(|field| EmbedField {
                    name: field.name,
                    value: field.value,
                    inline: field.inline,
                })
                .collect(),
            footer: wire.footer.and_then(|footer| footer.text),
            author: wire.author.and_then(|author| author.name),
            image_url: wire.image.map(|image| image.url),
            thumbnail_url: wire.thumbnail.map(|thumbnail| thumbnail.url),
        }
    }
}

impl From<WireMessage> for MessageSnapshot {
    fn from(wire: WireMessage) -> Self {
        MessageSnapshot {
            message_id: MessageId(wire.id.0),
            channel_id: ChannelId(wire.channel_id.0),
            guild_id: wire.guild_id.map(|id| GuildId(id.0)),
            author_id: wire.author.map(|author| UserId(author.id.0)),
            content: wire.content,
            embeds: wire.embeds.into_iter().map(Embed::from).collect(),
            attachments: wire
                .attachments
                .into_iter()
                .map(|attachment| Attachment {
                    url: attachment.url,
                    filename: attachment.filename,
                    content_type: attachment.content_type,
                })
                .collect(),
            flags: MessageFlags {
                crossposted: wire.flags & FLAG_CROSSPOSTED != 0,
                is_crosspost: wire.flags & FLAG_IS_CROSSPOST != 0,
            },
            reference: wire.message_reference.map(|reference| MessageReference {
                guild_id: reference.guild_id.map(|id| GuildId(id.0)),
                channel_id: ChannelId(reference.channel_id.0),
                message_id: reference.message_id.map(|id| MessageId(id.0)),
            }),
        }
    }
}

impl From<WireChannel> for ChannelInfo {
    fn from(wire: WireChannel) -> Self {
        let kind = match wire.kind {
            0 | 10 | 11 | 12 => ChannelKind::Text,
            5 => ChannelKind::News,
            2 | 13 => ChannelKind::Voice,
            _ => ChannelKind::Other,
        };
        ChannelInfo {
            channel_id: ChannelId(wire.id.0),
            guild_id: wire.guild_id.map(|id| GuildId(id.0)),
            kind,
            name: wire.name.unwrap_or_default(),
        }
    }
}

fn embed_json(embed: &Embed) -> Value {
    let mut map = Map::new();
    if let Some(title) = &embed.title {
        map.insert("title".into(), json!(title));
    }
    if let Some(description) = &embed.description {
        map.insert("description".into(), json!(description));
    }
    if let Some(url) = &embed.url {
        map.insert("url".into(), json!(url));
    }
    if let Some(color) = embed.color {
        map.insert("color".into(), json!(color));
    }
    if !embed.fields.is_empty() {
        let fields: Vec<Value> = embed
            .fields
            .iter()
            .map(|field| json!({ "name": field.name, "value": field.value, "inline": field.inline }))
            .collect();
        map.insert("fields".into(), Value::Array(fields));
    }
    if let Some(footer) = &embed.footer {
        map.insert("footer".into(), json!({ "text": footer }));
    }
    if let Some(author) = &embed.author {
        map.insert("author".into(), json!({ "name": author }));
    }
    if let Some(image) = &embed.image_url {
        map.insert("image".into(), json!({ "url": image }));
    }
    if let Some(thumbnail) = &embed.thumbnail_url {
        map.insert("thumbnail".into(), json!({ "url": thumbnail }));
    }
    Value::Object(map)
}

fn button_json(button: &ActionButton) -> Value {
    let style = if button.danger {
        BUTTON_STYLE_DANGER
    } else {
        BUTTON_STYLE_SECONDARY
    };
    json!({ "type": 2, "style": style, "label": button.label, "custom_id": button.custom_id })
}

/// Request body for a create or edit. An empty button list clears any components.
pub(crate) fn message_body(message: &OutboundMessage) -> Value {
    let components: Vec<Value> = if message.buttons.is_empty() {
        Vec::new()
    } else {
        vec![json!({
            "type": 1,
            "components": message.buttons.iter().map(button_json).collect::<Vec<_>>(),
        })]
    };
    let mut body = json!({
        "content": message.content,
        "embeds": message.embeds.iter().map(embed_json).collect::<Vec<_>>(),
        "components": components,
    });
    if !message.attachments.is_empty() {
        body["attachments"] = Value::Array(
            message
                .attachments
                .iter()
                .enumerate()
                .map(|(index, attachment)| json!({ "id": index, "filename": attachment.filename }))
                .collect(),
        );
    }
    body
}

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: Snowflake,
}

#[async_trait]
impl ChatPlatform for DiscordPlatform {
    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: &OutboundMessage,
    ) -> Result<MessageId, PlatformError> {
        let request = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/messages")));
        let body = message_body(message);
        let request = if message.attachments.is_empty() {
            request.json(&body)
        } else {
            request.multipart(self.attachment_form(body, &message.attachments).await?)
        };
        let created: CreatedMessage = self.execute_json(request).await?;
        debug!(%channel_id, message_id = created.id.0, "message sent");
        Ok(MessageId(created.id.0))
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError> {
        let mut body = message_body(message);
        // Edits keep whatever files the message already carries.
        if let Some(map) = body.as_object_mut() {
            map.remove("attachments");
        }
        let request = self
            .http
            .patch(self.url(&format!("/channels/{channel_id}/messages/{message_id}")))
            .json(&body);
        self.execute(request).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), PlatformError> {
        let request = self
            .http
            .delete(self.url(&format!("/channels/{channel_id}/messages/{message_id}")));
        self.execute(request).await?;
        Ok(())
    }

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<MessageSnapshot, PlatformError> {
        let request = self
            .http
            .get(self.url(&format!("/channels/{channel_id}/messages/{message_id}")));
        let wire: WireMessage = self.execute_json(request).await?;
        Ok(wire.into())
    }

    async fn fetch_channel(&self, channel_id: ChannelId) -> Result<ChannelInfo, PlatformError> {
        let request = self.http.get(self.url(&format!("/channels/{channel_id}")));
        let wire: WireChannel = self.execute_json(request).await?;
        Ok(wire.into())
    }

    async fn crosspost_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), PlatformError> {
        let request = self.http.post(self.url(&format!(
            "/channels/{channel_id}/messages/{message_id}/crosspost"
        )));
        self.execute(request).await?;
        Ok(())
    }

    async fn wait_for_event(
        &self,
        kind: PlatformEventKind,
        predicate: EventPredicate,
        timeout: Duration,
    ) -> Result<Option<PlatformEvent>, PlatformError> {
        Ok(self.events.wait_for(kind, predicate, timeout).await)
    }
}

#[cfg(test)]
#[path = "tests/discord_tests.rs"]
mod tests;
