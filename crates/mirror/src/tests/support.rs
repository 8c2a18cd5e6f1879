//! In-memory collaborators shared by the engine's unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ChannelId, ChannelInfo, ChannelKind, GuildId, LinkPair, MessageFlags, MessageId,
        MessageSnapshot, MirrorDestination, MirrorLink, MirroredMessagePair, NewMirrorLink,
        OutboundMessage, RoleId, UserId,
    },
    protocol::{PlatformEvent, PlatformEventKind},
};
use tokio::sync::broadcast;

use crate::{
    platform::{ChatPlatform, EventPredicate, PlatformError},
    topology::MirrorTopology,
};

pub(crate) fn snapshot(channel_id: i64, message_id: i64, content: &str) -> MessageSnapshot {
    MessageSnapshot {
        message_id: MessageId(message_id),
        channel_id: ChannelId(channel_id),
        guild_id: Some(GuildId(1)),
        author_id: Some(UserId(500)),
        content: content.to_string(),
        embeds: Vec::new(),
        attachments: Vec::new(),
        flags: MessageFlags::default(),
        reference: None,
    }
}

struct Failure {
    error: PlatformError,
    /// `None` fails every call.
    remaining: Option<usize>,
}

#[derive(Default)]
struct PlatformState {
    channels: HashMap<ChannelId, ChannelInfo>,
    messages: HashMap<(ChannelId, MessageId), MessageSnapshot>,
    next_message_id: i64,
    failures: HashMap<ChannelId, Failure>,
    crosspost_failures: Vec<PlatformError>,
    fetch_message_failures: usize,
    sent: Vec<(ChannelId, OutboundMessage)>,
    edits: Vec<(ChannelId, MessageId, OutboundMessage)>,
    deleted: Vec<(ChannelId, MessageId)>,
    crossposts: Vec<(ChannelId, MessageId)>,
    write_delay: Duration,
}

pub(crate) struct FakePlatform {
    state: Mutex<PlatformState>,
    events: broadcast::Sender<PlatformEvent>,
}

impl FakePlatform {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            state: Mutex::new(PlatformState {
                next_message_id: 9_000,
                ..PlatformState::default()
            }),
            events,
        })
    }

    pub(crate) fn add_channel(&self, channel_id: i64, kind: ChannelKind) {
        let channel_id = ChannelId(channel_id);
        self.lock().channels.insert(
            channel_id,
            ChannelInfo {
                channel_id,
                guild_id: Some(GuildId(1)),
                kind,
                name: format!("channel-{channel_id}"),
            },
        );
    }

    pub(crate) fn insert_message(&self, message: MessageSnapshot) {
        self.lock()
            .messages
            .insert((message.channel_id, message.message_id), message);
    }

    pub(crate) fn fail_writes(&self, channel_id: i64, error: PlatformError, times: Option<usize>) {
        self.lock().failures.insert(
            ChannelId(channel_id),
            Failure {
                error,
                remaining: times,
            },
        );
    }

    pub(crate) fn fail_crossposts(&self, errors: Vec<PlatformError>) {
        self.lock().crosspost_failures = errors;
    }

    pub(crate) fn fail_message_fetches(&self, times: usize) {
        self.lock().fetch_message_failures = times;
    }

    pub(crate) fn set_write_delay(&self, delay: Duration) {
        self.lock().write_delay = delay;
    }

    pub(crate) fn publish(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn sent_to(&self, channel_id: i64) -> Vec<OutboundMessage> {
        self.lock()
            .sent
            .iter()
            .filter(|(channel, _)| *channel == ChannelId(channel_id))
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    pub(crate) fn edits(&self) -> Vec<(ChannelId, MessageId, OutboundMessage)> {
        self.lock().edits.clone()
    }

    pub(crate) fn deleted(&self) -> Vec<(ChannelId, MessageId)> {
        self.lock().deleted.clone()
    }

    pub(crate) fn crossposts(&self) -> Vec<(ChannelId, MessageId)> {
        self.lock().crossposts.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().expect("platform state lock")
    }

    async fn write(&self, channel_id: ChannelId) -> Result<(), PlatformError> {
        let delay = self.lock().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        let Some(failure) = state.failures.get_mut(&channel_id) else {
            return Ok(());
        };
        let error = failure.error.clone();
        match failure.remaining.as_mut() {
            None => Err(error),
            Some(0) => Ok(()),
            Some(remaining) => {
                *remaining -= 1;
                Err(error)
            }
        }
    }
}

#[async_trait]
impl ChatPlatform for FakePlatform {
    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: &OutboundMessage,
    ) -> Result<MessageId, PlatformError> {
        self.write(channel_id).await?;
        let mut state = self.lock();
        state.next_message_id += 1;
        let message_id = MessageId(state.next_message_id);
        state.sent.push((channel_id, message.clone()));
        let mut stored = snapshot(channel_id.0, message_id.0, &message.content);
        stored.embeds = message.embeds.clone();
        state.messages.insert((channel_id, message_id), stored);
        Ok(message_id)
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError> {
        self.write(channel_id).await?;
        let mut state = self.lock();
        let stored = state
            .messages
            .get_mut(&(channel_id, message_id))
            .ok_or_else(|| PlatformError::NotFound(format!("message {message_id}")))?;
        stored.content = message.content.clone();
        state.edits.push((channel_id, message_id, message.clone()));
        Ok(())
    }

    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), PlatformError> {
        self.write(channel_id).await?;
        let mut state = self.lock();
        state
            .messages
            .remove(&(channel_id, message_id))
            .ok_or_else(|| PlatformError::NotFound(format!("message {message_id}")))?;
        state.deleted.push((channel_id, message_id));
        Ok(())
    }

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<MessageSnapshot, PlatformError> {
        let mut state = self.lock();
        if state.fetch_message_failures > 0 {
            state.fetch_message_failures -= 1;
            return Err(PlatformError::Transient("gateway timeout".to_string()));
        }
        state
            .messages
            .get(&(channel_id, message_id))
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("message {message_id}")))
    }

    async fn fetch_channel(&self, channel_id: ChannelId) -> Result<ChannelInfo, PlatformError> {
        self.lock()
            .channels
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("channel {channel_id}")))
    }

    async fn crosspost_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        state.crossposts.push((channel_id, message_id));
        if state.crosspost_failures.is_empty() {
            Ok(())
        } else {
            Err(state.crosspost_failures.remove(0))
        }
    }

    async fn wait_for_event(
        &self,
        kind: PlatformEventKind,
        predicate: EventPredicate,
        timeout: Duration,
    ) -> Result<Option<PlatformEvent>, PlatformError> {
        let mut events = self.events.subscribe();
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind() == kind && predicate(&event) => return Some(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        Ok(tokio::time::timeout(timeout, wait).await.ok().flatten())
    }
}

#[derive(Default)]
struct TopologyState {
    links: Vec<MirrorLink>,
    pairs: Vec<MirroredMessagePair>,
    lookup_failures: usize,
    flush_calls: usize,
}

#[derive(Default)]
pub(crate) struct FakeTopology {
    state: Mutex<TopologyState>,
}

impl FakeTopology {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn link(&self, source: i64, destination: i64, role: Option<i64>) {
        self.lock().links.push(MirrorLink {
            source_channel_id: ChannelId(source),
            destination_channel_id: ChannelId(destination),
            destination_server_id: Some(GuildId(1)),
            is_legacy: true,
            enabled: true,
            role_mention_id: role.map(RoleId),
            consecutive_error_count: 0,
            disabled_at: None,
        });
    }

    pub(crate) fn pair(&self, source_channel: i64, source_message: i64, destination: i64, message: i64) {
        self.pair_created_at(source_channel, source_message, destination, message, Utc::now());
    }

    pub(crate) fn pair_created_at(
        &self,
        source_channel: i64,
        source_message: i64,
        destination: i64,
        message: i64,
        created_at: DateTime<Utc>,
    ) {
        self.lock().pairs.push(MirroredMessagePair {
            destination_channel_id: ChannelId(destination),
            destination_message_id: MessageId(message),
            source_channel_id: ChannelId(source_channel),
            source_message_id: MessageId(source_message),
            created_at,
        });
    }

    pub(crate) fn fail_lookups(&self, times: usize) {
        self.lock().lookup_failures = times;
    }

    pub(crate) fn pairs_for(&self, source_message: i64) -> Vec<(ChannelId, MessageId)> {
        let mut pairs: Vec<_> = self
            .lock()
            .pairs
            .iter()
            .filter(|pair| pair.source_message_id == MessageId(source_message))
            .map(|pair| (pair.destination_channel_id, pair.destination_message_id))
            .collect();
        pairs.sort();
        pairs
    }

    pub(crate) fn link_state(&self, source: i64, destination: i64) -> Option<MirrorLink> {
        self.lock()
            .links
            .iter()
            .find(|link| {
                link.source_channel_id == ChannelId(source)
                    && link.destination_channel_id == ChannelId(destination)
            })
            .cloned()
    }

    pub(crate) fn flush_calls(&self) -> usize {
        self.lock().flush_calls
    }

    fn lock(&self) -> MutexGuard<'_, TopologyState> {
        self.state.lock().expect("topology state lock")
    }

    fn take_lookup_failure(&self) -> Result<()> {
        let mut state = self.lock();
        if state.lookup_failures > 0 {
            state.lookup_failures -= 1;
            return Err(anyhow!("database is locked"));
        }
        Ok(())
    }

    fn update_counters(&self, source: ChannelId, destinations: &[ChannelId], success: bool) {
        let mut state = self.lock();
        state.flush_calls += 1;
        for link in state.links.iter_mut().filter(|link| {
            link.source_channel_id == source
                && link.is_legacy
                && link.enabled
                && destinations.contains(&link.destination_channel_id)
        }) {
            if success {
                link.consecutive_error_count = 0;
            } else {
                link.consecutive_error_count += 1;
            }
        }
    }
}

#[async_trait]
impl MirrorTopology for FakeTopology {
    async fn list_destinations(&self, source: ChannelId) -> Result<Vec<MirrorDestination>> {
        self.take_lookup_failure()?;
        Ok(self
            .lock()
            .links
            .iter()
            .filter(|link| link.source_channel_id == source && link.is_legacy && link.enabled)
            .map(|link| MirrorDestination {
                channel_id: link.destination_channel_id,
                role_mention_id: link.role_mention_id,
            })
            .collect())
    }

    async fn record_success_batch(&self, source: ChannelId, destinations: &[ChannelId]) -> Result<()> {
        self.update_counters(source, destinations, true);
        Ok(())
    }

    async fn record_failure_batch(&self, source: ChannelId, destinations: &[ChannelId]) -> Result<()> {
        self.update_counters(source, destinations, false);
        Ok(())
    }

    async fn get_destination_mappings(
        &self,
        source_message: MessageId,
    ) -> Result<Vec<MirroredMessagePair>> {
        self.take_lookup_failure()?;
        Ok(self
            .lock()
            .pairs
            .iter()
            .filter(|pair| pair.source_message_id == source_message)
            .cloned()
            .collect())
    }

    async fn record_mapping_batch(
        &self,
        source_message: MessageId,
        source_channel: ChannelId,
        pairs: &[(MessageId, ChannelId)],
    ) -> Result<()> {
        let mut state = self.lock();
        for (message_id, channel_id) in pairs {
            state.pairs.push(MirroredMessagePair {
                destination_channel_id: *channel_id,
                destination_message_id: *message_id,
                source_channel_id: source_channel,
                source_message_id: source_message,
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn links_over_error_threshold(&self, threshold: i64) -> Result<Vec<MirrorLink>> {
        Ok(self
            .lock()
            .links
            .iter()
            .filter(|link| link.is_legacy && link.enabled && link.consecutive_error_count >= threshold)
            .cloned()
            .collect())
    }

    async fn disable_links_over_error_threshold(&self, threshold: i64) -> Result<Vec<MirrorLink>> {
        let mut state = self.lock();
        let mut disabled = Vec::new();
        for link in state.links.iter_mut().filter(|link| {
            link.is_legacy && link.enabled && link.consecutive_error_count >= threshold
        }) {
            link.enabled = false;
            link.disabled_at = Some(Utc::now());
            disabled.push(link.clone());
        }
        Ok(disabled)
    }

    async fn list_source_channels(&self, legacy: bool) -> Result<HashSet<ChannelId>> {
        Ok(self
            .lock()
            .links
            .iter()
            .filter(|link| link.is_legacy == legacy && link.enabled)
            .map(|link| link.source_channel_id)
            .collect())
    }

    async fn list_sources(&self, destination: ChannelId, legacy: bool) -> Result<Vec<ChannelId>> {
        Ok(self
            .lock()
            .links
            .iter()
            .filter(|link| {
                link.destination_channel_id == destination && link.is_legacy == legacy && link.enabled
            })
            .map(|link| link.source_channel_id)
            .collect())
    }

    async fn list_destination_ids(&self, source: ChannelId, legacy: bool) -> Result<Vec<ChannelId>> {
        Ok(self
            .lock()
            .links
            .iter()
            .filter(|link| link.source_channel_id == source && link.is_legacy == legacy && link.enabled)
            .map(|link| link.destination_channel_id)
            .collect())
    }

    async fn add_link(&self, link: &NewMirrorLink) -> Result<()> {
        let mut state = self.lock();
        state.links.retain(|existing| {
            existing.source_channel_id != link.source_channel_id
                || existing.destination_channel_id != link.destination_channel_id
        });
        state.links.push(MirrorLink {
            source_channel_id: link.source_channel_id,
            destination_channel_id: link.destination_channel_id,
            destination_server_id: link.destination_server_id,
            is_legacy: link.is_legacy,
            enabled: link.enabled,
            role_mention_id: link.role_mention_id,
            consecutive_error_count: 0,
            disabled_at: None,
        });
        Ok(())
    }

    async fn record_traced_link(
        &self,
        source: ChannelId,
        destination: ChannelId,
        destination_server: Option<GuildId>,
    ) -> Result<bool> {
        let mut state = self.lock();
        let known = state.links.iter().any(|link| {
            link.source_channel_id == source && link.destination_channel_id == destination
        });
        if known {
            return Ok(false);
        }
        state.links.push(MirrorLink {
            source_channel_id: source,
            destination_channel_id: destination,
            destination_server_id: destination_server,
            is_legacy: false,
            enabled: true,
            role_mention_id: None,
            consecutive_error_count: 0,
            disabled_at: None,
        });
        Ok(true)
    }

    async fn disable_link(&self, source: ChannelId, destination: ChannelId) -> Result<()> {
        for link in self.lock().links.iter_mut().filter(|link| {
            link.source_channel_id == source && link.destination_channel_id == destination
        }) {
            link.enabled = false;
        }
        Ok(())
    }

    async fn undo_auto_disable(&self, since: DateTime<Utc>) -> Result<Vec<LinkPair>> {
        let mut restored = Vec::new();
        for link in self
            .lock()
            .links
            .iter_mut()
            .filter(|link| !link.enabled && link.disabled_at.is_some_and(|at| at >= since))
        {
            link.enabled = true;
            link.disabled_at = None;
            link.consecutive_error_count = 0;
            restored.push(LinkPair {
                source_channel_id: link.source_channel_id,
                destination_channel_id: link.destination_channel_id,
            });
        }
        Ok(restored)
    }

    async fn prune_mappings(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let before = state.pairs.len();
        state.pairs.retain(|pair| pair.created_at >= older_than);
        Ok((before - state.pairs.len()) as u64)
    }
}
