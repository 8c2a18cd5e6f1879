//! Message shaping shared by the kernels and the progress reporter.

use std::{sync::OnceLock, time::Duration};

use regex::Regex;
use shared::domain::{ChannelId, Embed, GuildId, MessageId, MessageSnapshot, OutboundMessage, RoleId};

/// Appends a spoilered role mention for destinations that asked for one.
pub fn add_role_mention(content: &str, role: Option<RoleId>) -> String {
    let Some(role) = role.filter(|role| role.0 != 0) else {
        return content.to_string();
    };
    let mut content = if content.is_empty() {
        String::new()
    } else {
        format!("{}\n\n", content.trim_matches('\n'))
    };
    content.push_str(&format!("||<@&{role}>||"));
    content
}

/// Drops link previews the platform generated from URLs in the content.
///
/// Embeds without a URL survive when they carry rich data of their own.
pub fn filter_auto_embeds(message: &MessageSnapshot) -> Vec<Embed> {
    if message.content.is_empty() {
        return message.embeds.clone();
    }
    message
        .embeds
        .iter()
        .filter(|embed| {
            let linked_from_content = embed
                .url
                .as_deref()
                .is_some_and(|url| !url.is_empty() && message.content.contains(url));
            !linked_from_content && embed.has_rich_content()
        })
        .cloned()
        .collect()
}

/// What a destination receives for `source`. Components are never mirrored.
pub fn mirrored_payload(source: &MessageSnapshot, role: Option<RoleId>) -> OutboundMessage {
    OutboundMessage {
        content: add_role_mention(&source.content, role),
        embeds: source.embeds.clone(),
        attachments: source.attachments.clone(),
        buttons: Vec::new(),
    }
}

fn markdown_link() -> Option<&'static Regex> {
    static LINK: OnceLock<Option<Regex>> = OnceLock::new();
    LINK.get_or_init(|| Regex::new(r"\[(.*?)\]\(.*?\)").ok()).as_ref()
}

/// One-line human summary of a message, used as link text in status messages.
pub fn message_summary(message: &MessageSnapshot, default: &str) -> String {
    let mut summary = message.content.lines().next().unwrap_or_default().to_string();
    for embed in &message.embeds {
        if let Some(title) = embed.title.as_deref().filter(|title| !title.is_empty()) {
            summary = title.to_string();
        }
        if let Some(description) = embed.description.as_deref().filter(|d| !d.is_empty()) {
            summary = description.lines().next().unwrap_or_default().to_string();
        }
    }

    let cleaned: String = summary
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '#'))
        .collect();
    let cleaned = cleaned
        .trim_matches(|c| c == '{' || c == '}')
        .trim_matches(|c| c == '<' || c == '>')
        .trim();
    let cleaned = capitalize(cleaned);
    // A link with empty text keeps its markdown rather than vanishing.
    let cleaned = match markdown_link() {
        Some(link) => match link.replace_all(&cleaned, "$1") {
            replaced if replaced.is_empty() => cleaned,
            replaced => replaced.into_owned(),
        },
        None => cleaned,
    };

    if cleaned.is_empty() {
        default.to_string()
    } else {
        cleaned
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

pub fn channel_link(guild_id: GuildId, channel_id: ChannelId) -> String {
    format!("https://discord.com/channels/{guild_id}/{channel_id}")
}

pub fn message_link(guild_id: GuildId, channel_id: ChannelId, message_id: MessageId) -> String {
    format!("https://discord.com/channels/{guild_id}/{channel_id}/{message_id}")
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64();
    if seconds < 60.0 {
        format!("{:.2} seconds", seconds)
    } else {
        let minutes = (seconds / 60.0).floor();
        format!("{} minutes {:.2} seconds", minutes as u64, seconds - minutes * 60.0)
    }
}

#[cfg(test)]
#[path = "tests/content_tests.rs"]
mod tests;
