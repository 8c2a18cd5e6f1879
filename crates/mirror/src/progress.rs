//! Status message that follows a running operation in the progress channel.
//!
//! Reporting runs on its own task and never blocks or fails the operation it
//! observes: posting and editing are retried with backoff and then given up.

use std::{future::Future, sync::Arc, time::Duration};

use shared::domain::{
    ActionButton, ChannelId, ChannelInfo, Embed, EmbedField, MessageId, MessageSnapshot,
    OutboundMessage,
};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{debug, error, warn};

use crate::{
    config::ProgressSettings,
    content::{channel_link, format_elapsed, message_link, message_summary},
    platform::{ChatPlatform, PlatformError},
    tracker::{OperationKey, ProgressCounts, SharedTracker},
};

const CANCEL_PREFIX: &str = "mirror-cancel";

pub fn cancel_button_id(key: OperationKey) -> String {
    format!(
        "{CANCEL_PREFIX}:{}:{}",
        key.source_channel_id, key.source_message_id
    )
}

pub fn parse_cancel_button_id(custom_id: &str) -> Option<OperationKey> {
    let mut parts = custom_id.split(':');
    if parts.next()? != CANCEL_PREFIX {
        return None;
    }
    let channel = parts.next()?.parse().ok()?;
    let message = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(OperationKey::new(ChannelId(channel), MessageId(message)))
}

/// What the status message describes.
#[derive(Debug, Clone)]
pub struct ProgressContext {
    pub title: String,
    pub source_message: Option<MessageSnapshot>,
    pub source_channel: Option<ChannelInfo>,
    /// Set for operations that can be cancelled from the status message.
    pub cancel_key: Option<OperationKey>,
    pub started_at: Instant,
}

/// Tracker state at one render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub counts: ProgressCounts,
    pub elapsed: Duration,
    /// Time at which every destination had been attempted once.
    pub tried_all_in: Option<Duration>,
    pub finished: bool,
}

pub fn render(
    context: &ProgressContext,
    snapshot: &ProgressSnapshot,
    settings: &ProgressSettings,
) -> OutboundMessage {
    let counts = snapshot.counts;
    let summary = context
        .source_message
        .as_ref()
        .map(|message| message_summary(message, "Link"));
    let source_message = match (&context.source_message, summary) {
        (Some(message), Some(summary)) => match message.guild_id {
            Some(guild_id) => format!(
                "[{summary}]({})",
                message_link(guild_id, message.channel_id, message.message_id)
            ),
            None => summary,
        },
        _ => "Unknown".to_string(),
    };
    let source_channel = match &context.source_channel {
        Some(ChannelInfo {
            channel_id,
            guild_id: Some(guild_id),
            name,
            ..
        }) => format!("[{name}]({})", channel_link(*guild_id, *channel_id)),
        Some(channel) => channel.name.clone(),
        None => "Unknown".to_string(),
    };

    let footer = if !snapshot.finished {
        "⏳ In progress".to_string()
    } else {
        let mut footer = if counts.cancelled > 0 {
            "❌ Cancelled".to_string()
        } else {
            "✅ Completed".to_string()
        };
        if counts.failed > 0 {
            footer.push_str(" with errors");
        }
        footer
    };

    let field = |name: &str, value: String, inline: bool| EmbedField {
        name: name.to_string(),
        value,
        inline,
    };
    let embed = Embed {
        title: Some(context.title.clone()),
        color: Some(if counts.failed > 0 {
            settings.error_color
        } else {
            settings.default_color
        }),
        fields: vec![
            field("Source message", source_message, true),
            field("Source channel", source_channel, true),
            field("Completed", counts.completed.to_string(), true),
            field("Retrying", counts.retrying.to_string(), true),
            field("Failed", counts.failed.to_string(), true),
            field("Remaining", counts.remaining.to_string(), true),
            field("Time taken", format_elapsed(snapshot.elapsed), false),
            field(
                "Time to try all channels once",
                snapshot
                    .tried_all_in
                    .map(format_elapsed)
                    .unwrap_or_else(|| "TBC".to_string()),
                false,
            ),
        ],
        footer: Some(footer),
        thumbnail_url: context.source_message.as_ref().and_then(thumbnail),
        ..Embed::default()
    };

    let buttons = match context.cancel_key {
        Some(key) if !snapshot.finished => vec![ActionButton {
            custom_id: cancel_button_id(key),
            label: "Cancel Mirror".to_string(),
            danger: true,
        }],
        _ => Vec::new(),
    };

    OutboundMessage {
        content: String::new(),
        embeds: vec![embed],
        attachments: Vec::new(),
        buttons,
    }
}

fn thumbnail(message: &MessageSnapshot) -> Option<String> {
    if let Some(image) = message.embeds.first().and_then(|embed| embed.image_url.clone()) {
        return Some(image);
    }
    message
        .attachments
        .first()
        .filter(|attachment| attachment.is_image())
        .map(|attachment| attachment.url.clone())
}

#[derive(Clone)]
pub struct ProgressReporter {
    platform: Arc<dyn ChatPlatform>,
    settings: ProgressSettings,
}

impl ProgressReporter {
    pub fn new(platform: Arc<dyn ChatPlatform>, settings: ProgressSettings) -> Self {
        Self { platform, settings }
    }

    /// Starts following `tracker`; a no-op handle when no progress channel is set.
    pub fn start(&self, tracker: SharedTracker, context: ProgressContext) -> ProgressHandle {
        let Some(channel_id) = self.settings.channel_id else {
            return ProgressHandle::disabled();
        };
        let (done_tx, done_rx) = oneshot::channel();
        let task = ReportTask {
            platform: Arc::clone(&self.platform),
            settings: self.settings.clone(),
            channel_id,
            tracker,
            context,
            tried_all_in: None,
        };
        ProgressHandle {
            done: Some(done_tx),
            task: Some(tokio::spawn(task.run(done_rx))),
            finish_timeout: self.settings.finish_timeout,
        }
    }
}

/// Owned by the driver for the lifetime of one operation.
pub struct ProgressHandle {
    done: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    finish_timeout: Duration,
}

impl ProgressHandle {
    pub fn disabled() -> Self {
        Self {
            done: None,
            task: None,
            finish_timeout: Duration::ZERO,
        }
    }

    /// Requests the final render and waits a bounded time for it.
    pub async fn finish(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        let Some(task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(self.finish_timeout, task).await.is_err() {
            warn!("final progress render is still pending");
        }
    }
}

struct ReportTask {
    platform: Arc<dyn ChatPlatform>,
    settings: ProgressSettings,
    channel_id: ChannelId,
    tracker: SharedTracker,
    context: ProgressContext,
    tried_all_in: Option<Duration>,
}

impl ReportTask {
    async fn run(mut self, mut done: oneshot::Receiver<()>) {
        let mut finished = false;
        let Some(message_id) = self.post().await else {
            return;
        };

        loop {
            if !finished {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.refresh_interval) => {}
                    _ = &mut done => finished = true,
                }
            }
            let finishing = finished || !self.tracker.counts().work_left;
            let attempts = if finishing { self.settings.post_attempts } else { 1 };
            let rendered = self.render(finishing);
            let edited = self
                .retry(attempts, || self.platform.edit_message(self.channel_id, message_id, &rendered))
                .await;
            if edited.is_none() {
                debug!(%message_id, "progress edit skipped");
            }
            if finishing {
                return;
            }
        }
    }

    async fn post(&mut self) -> Option<MessageId> {
        let finished = !self.tracker.counts().work_left;
        let rendered = self.render(finished);
        let posted = self
            .retry(self.settings.post_attempts, || {
                self.platform.send_message(self.channel_id, &rendered)
            })
            .await;
        if posted.is_none() {
            error!(channel_id = %self.channel_id, "could not post mirror progress");
        }
        posted
    }

    fn render(&mut self, finished: bool) -> OutboundMessage {
        let counts = self.tracker.counts();
        let elapsed = self.context.started_at.elapsed();
        if counts.every_target_tried && self.tried_all_in.is_none() {
            self.tried_all_in = Some(elapsed);
        }
        render(
            &self.context,
            &ProgressSnapshot {
                counts,
                elapsed,
                tried_all_in: self.tried_all_in,
                finished,
            },
            &self.settings,
        )
    }

    /// Backs off `5^n` seconds (capped) between attempts.
    async fn retry<T, F, Fut>(&self, attempts: u32, mut call: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        for attempt in 1..=attempts.max(1) {
            match call().await {
                Ok(value) => return Some(value),
                Err(error) => {
                    warn!(channel_id = %self.channel_id, attempt, %error, "progress update failed");
                    if attempt < attempts {
                        let backoff = Duration::from_secs(5u64.saturating_pow(attempt))
                            .min(self.settings.max_backoff);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
#[path = "tests/progress_tests.rs"]
mod tests;
