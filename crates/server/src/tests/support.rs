//! Stub platform and context wiring for the relay's route tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use mirror::{ChatPlatform, EventPredicate, MirrorEngine, MirrorSettings, PlatformError, RetryPolicy};
use shared::{
    domain::{
        ChannelId, ChannelInfo, ChannelKind, GuildId, MessageFlags, MessageId, MessageSnapshot,
        NewMirrorLink, OutboundMessage, UserId,
    },
    protocol::{PlatformEvent, PlatformEventKind},
};
use storage::Storage;
use tokio::sync::Semaphore;

use crate::{api::ApiContext, events::EventHub};

pub(crate) const OWNER: UserId = UserId(1);
pub(crate) const SOURCE: ChannelId = ChannelId(100);
pub(crate) const DESTINATION: ChannelId = ChannelId(200);

#[derive(Default)]
struct StubState {
    sources: HashMap<MessageId, String>,
    sent: Vec<(ChannelId, OutboundMessage)>,
    edits: Vec<(ChannelId, MessageId)>,
    deleted: Vec<(ChannelId, MessageId)>,
    next_id: i64,
}

/// Text channels everywhere; edits wait for a permit from `edit_gate`.
pub(crate) struct StubPlatform {
    state: Mutex<StubState>,
    pub(crate) edit_gate: Semaphore,
    events: EventHub,
}

impl StubPlatform {
    pub(crate) fn new(events: EventHub) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StubState::default()),
            edit_gate: Semaphore::new(Semaphore::MAX_PERMITS),
            events,
        })
    }

    pub(crate) fn add_source_message(&self, message_id: i64, content: &str) {
        self.state
            .lock()
            .expect("stub state")
            .sources
            .insert(MessageId(message_id), content.to_string());
    }

    pub(crate) fn sent(&self) -> Vec<(ChannelId, OutboundMessage)> {
        self.state.lock().expect("stub state").sent.clone()
    }

    pub(crate) fn deleted(&self) -> Vec<(ChannelId, MessageId)> {
        self.state.lock().expect("stub state").deleted.clone()
    }

    pub(crate) fn edit_count(&self) -> usize {
        self.state.lock().expect("stub state").edits.len()
    }
}

pub(crate) fn source_snapshot(message_id: i64, content: &str, author: i64) -> MessageSnapshot {
    MessageSnapshot {
        message_id: MessageId(message_id),
        channel_id: SOURCE,
        guild_id: Some(GuildId(1)),
        author_id: Some(UserId(author)),
        content: content.to_string(),
        embeds: Vec::new(),
        attachments: Vec::new(),
        flags: MessageFlags::default(),
        reference: None,
    }
}

#[async_trait]
impl ChatPlatform for StubPlatform {
    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: &OutboundMessage,
    ) -> Result<MessageId, PlatformError> {
        let mut state = self.state.lock().expect("stub state");
        state.next_id += 1;
        state.sent.push((channel_id, message.clone()));
        Ok(MessageId(10_000 + state.next_id))
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        _message: &OutboundMessage,
    ) -> Result<(), PlatformError> {
        let _permit = self
            .edit_gate
            .acquire()
            .await
            .map_err(|_| PlatformError::Transient("gate closed".into()))?;
        self.state
            .lock()
            .expect("stub state")
            .edits
            .push((channel_id, message_id));
        Ok(())
    }

    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), PlatformError> {
        self.state
            .lock()
            .expect("stub state")
            .deleted
            .push((channel_id, message_id));
        Ok(())
    }

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<MessageSnapshot, PlatformError> {
        if channel_id != SOURCE {
            return Ok(MessageSnapshot {
                channel_id,
                ..source_snapshot(message_id.0, "", 2)
            });
        }
        let content = self
            .state
            .lock()
            .expect("stub state")
            .sources
            .get(&message_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound("Unknown Message".into()))?;
        Ok(source_snapshot(message_id.0, &content, 2))
    }

    async fn fetch_channel(&self, channel_id: ChannelId) -> Result<ChannelInfo, PlatformError> {
        Ok(ChannelInfo {
            channel_id,
            guild_id: Some(GuildId(1)),
            kind: ChannelKind::Text,
            name: format!("channel-{channel_id}"),
        })
    }

    async fn crosspost_message(
        &self,
        _channel_id: ChannelId,
        _message_id: MessageId,
    ) -> Result<(), PlatformError> {
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

pub(crate) fn quick_settings() -> MirrorSettings {
    let quick = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
    let mut settings = MirrorSettings::default();
    settings.send = quick;
    settings.update = quick;
    settings.delete = quick;
    settings
}

/// Storage with one `SOURCE -> DESTINATION` link and an engine that knows about it.
pub(crate) async fn test_context() -> (ApiContext, Arc<StubPlatform>, EventHub) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let events = EventHub::new(32);
    let platform = StubPlatform::new(events.clone());
    let engine = MirrorEngine::new(platform.clone(), Arc::new(storage.clone()), quick_settings())
        .with_bot_user(UserId(999));
    engine
        .add_link(NewMirrorLink {
            source_channel_id: SOURCE,
            destination_channel_id: DESTINATION,
            destination_server_id: Some(GuildId(2)),
            is_legacy: true,
            enabled: true,
            role_mention_id: None,
        })
        .await
        .expect("link");
    let ctx = ApiContext {
        storage,
        engine,
        platform: platform.clone(),
        owners: Arc::new(HashSet::from([OWNER])),
    };
    (ctx, platform, events)
}
