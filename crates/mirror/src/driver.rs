//! Fan-out drivers: turn one source event into one supervised operation.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ChannelId, ChannelInfo, LinkPair, MessageId, MessageSnapshot, MirrorOperationKind,
        NewMirrorLink, RoleId, UserId,
    },
    protocol::{MirrorSourcesResponse, PlatformEvent, PlatformEventKind},
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    config::MirrorSettings,
    content::filter_auto_embeds,
    controller::WorkController,
    kernel::MirrorKernel,
    platform::{ChatPlatform, EventPredicate, FailureClass, PlatformError},
    progress::{ProgressContext, ProgressHandle, ProgressReporter},
    rate_limit::RateLimiter,
    sources::SourceChannels,
    supervisor::{OperationSupervisor, SupervisorError},
    topology::MirrorTopology,
    tracker::{OperationKey, WorkTracker},
};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("{context}: {message}")]
    Infrastructure {
        context: &'static str,
        message: String,
    },
}

/// Outcome of one operation, by destination channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorReport {
    pub key: OperationKey,
    pub kind: MirrorOperationKind,
    pub succeeded: Vec<ChannelId>,
    pub failed: Vec<ChannelId>,
    pub cancelled: Vec<ChannelId>,
}

impl MirrorReport {
    fn nothing_to_do(key: OperationKey, kind: MirrorOperationKind) -> Self {
        Self {
            key,
            kind,
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
        }
    }

    fn from_tracker(tracker: &WorkTracker) -> Self {
        Self {
            key: tracker.key(),
            kind: tracker.kind(),
            succeeded: tracker.successful_targets().into_keys().collect(),
            failed: tracker.failed_targets().into_keys().collect(),
            cancelled: tracker.cancelled_targets().into_keys().collect(),
        }
    }

    /// True when the operation had no destinations at all.
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.cancelled.is_empty()
    }
}

/// Errors seen by whole-operation steps, retried by the driver.
trait InfraFailure: fmt::Display {
    fn is_permanent(&self) -> bool;
}

impl InfraFailure for PlatformError {
    fn is_permanent(&self) -> bool {
        self.class() == FailureClass::Terminal
    }
}

impl InfraFailure for anyhow::Error {
    fn is_permanent(&self) -> bool {
        false
    }
}

/// Entry point of the relay: one method per source event plus link administration.
#[derive(Clone)]
pub struct MirrorEngine {
    platform: Arc<dyn ChatPlatform>,
    topology: Arc<dyn MirrorTopology>,
    settings: Arc<MirrorSettings>,
    limiter: RateLimiter,
    supervisor: OperationSupervisor,
    progress: ProgressReporter,
    sources: Arc<SourceChannels>,
    bot_user_id: Option<UserId>,
}

impl MirrorEngine {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        topology: Arc<dyn MirrorTopology>,
        settings: MirrorSettings,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(settings.rate_limit_permits, settings.rate_limit_period),
            progress: ProgressReporter::new(Arc::clone(&platform), settings.progress.clone()),
            sources: Arc::new(SourceChannels::new(Arc::clone(&topology))),
            supervisor: OperationSupervisor::new(),
            settings: Arc::new(settings),
            platform,
            topology,
            bot_user_id: None,
        }
    }

    /// Messages authored by `bot_user_id` are never mirrored again.
    pub fn with_bot_user(mut self, bot_user_id: UserId) -> Self {
        self.bot_user_id = Some(bot_user_id);
        self
    }

    pub fn settings(&self) -> &MirrorSettings {
        &self.settings
    }

    pub fn supervisor(&self) -> &OperationSupervisor {
        &self.supervisor
    }

    pub fn sources(&self) -> &SourceChannels {
        &self.sources
    }

    pub fn topology(&self) -> &Arc<dyn MirrorTopology> {
        &self.topology
    }

    /// Routes one gateway event. Returns `None` when the event is not mirrored.
    pub async fn handle_event(
        &self,
        event: PlatformEvent,
    ) -> Result<Option<MirrorReport>, MirrorError> {
        match event {
            PlatformEvent::MessageCreated { message } => {
                self.sources.trace_crosspost(&message).await;
                if !self.should_mirror(&message) {
                    return Ok(None);
                }
                self.on_message_created(message, true).await.map(Some)
            }
            PlatformEvent::MessageUpdated { message } => {
                if !self.should_mirror(&message) {
                    return Ok(None);
                }
                self.on_message_updated(message.channel_id, message.message_id)
                    .await
                    .map(Some)
            }
            PlatformEvent::MessageDeleted {
                channel_id,
                message_id,
            } => {
                if !self.sources.is_source(channel_id) {
                    return Ok(None);
                }
                self.on_message_deleted(Some(channel_id), message_id)
                    .await
                    .map(Some)
            }
        }
    }

    fn should_mirror(&self, message: &MessageSnapshot) -> bool {
        let from_self = self.bot_user_id.is_some() && message.author_id == self.bot_user_id;
        self.sources.is_source(message.channel_id) && !from_self
    }

    /// Mirrors a new source message to every enabled destination of its channel.
    pub async fn on_message_created(
        &self,
        message: MessageSnapshot,
        wait_for_crosspost: bool,
    ) -> Result<MirrorReport, MirrorError> {
        let source_channel = message.channel_id;
        let key = OperationKey::new(source_channel, message.message_id);
        info!(%key, "message create received");

        let channel = self
            .retry_infra("fetch source channel", || {
                self.platform.fetch_channel(source_channel)
            })
            .await?;
        if wait_for_crosspost && channel.kind.is_announcement() {
            self.wait_for_publish(&message).await?;
        }

        // Edits can land between the event and the publish; act on the latest copy.
        let mut message = self
            .retry_infra("re-fetch source message", || {
                self.platform.fetch_message(source_channel, key.source_message_id)
            })
            .await?;
        message.embeds = filter_auto_embeds(&message);

        let destinations = self
            .retry_infra("resolve destinations", || {
                self.topology.list_destinations(source_channel)
            })
            .await?;
        let role_mentions: HashMap<ChannelId, Option<RoleId>> = destinations
            .iter()
            .filter(|destination| destination.channel_id != source_channel)
            .map(|destination| (destination.channel_id, destination.role_mention_id))
            .collect();
        if role_mentions.is_empty() {
            debug!(%key, "no destinations to mirror to");
            return Ok(MirrorReport::nothing_to_do(key, MirrorOperationKind::Send));
        }

        let policy = self.settings.policy_for(MirrorOperationKind::Send);
        let tracker = WorkTracker::new(
            key,
            MirrorOperationKind::Send,
            role_mentions.keys().map(|channel_id| (*channel_id, None)),
            policy.retry_threshold,
        );
        let kernel = MirrorKernel::send(
            Arc::clone(&self.platform),
            self.limiter.clone(),
            self.settings.crosspost,
            message.clone(),
            role_mentions,
        );
        let context = ProgressContext {
            title: "Mirror send progress".to_string(),
            source_message: Some(message),
            source_channel: Some(channel),
            cancel_key: None,
            started_at: Instant::now(),
        };
        let (tracker, progress) = self
            .run_operation(WorkController::new(tracker, kernel, policy), context)
            .await?;

        self.flush_send(key, &tracker).await;
        progress.finish().await;
        Ok(MirrorReport::from_tracker(&tracker))
    }

    /// Propagates an edit of a source message to its mirrored copies.
    pub async fn on_message_updated(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<MirrorReport, MirrorError> {
        let key = OperationKey::new(channel_id, message_id);
        let mappings = self
            .retry_infra("look up mirrored messages", || {
                self.topology.get_destination_mappings(message_id)
            })
            .await?;
        let targets: Vec<_> = mappings
            .iter()
            .filter(|pair| pair.destination_channel_id != channel_id)
            .map(|pair| (pair.destination_channel_id, Some(pair.destination_message_id)))
            .collect();
        if targets.is_empty() {
            debug!(%key, "message was never mirrored");
            return Ok(MirrorReport::nothing_to_do(key, MirrorOperationKind::Update));
        }

        // Update events do not always carry unchanged fields.
        let mut message = self
            .retry_infra("re-fetch source message", || {
                self.platform.fetch_message(channel_id, message_id)
            })
            .await?;
        message.embeds = filter_auto_embeds(&message);

        let role_mentions = match self.topology.list_destinations(channel_id).await {
            Ok(destinations) => destinations
                .into_iter()
                .map(|destination| (destination.channel_id, destination.role_mention_id))
                .collect(),
            Err(err) => {
                warn!(%key, error = %format!("{err:#}"), "updating without role mentions");
                HashMap::new()
            }
        };

        let policy = self.settings.policy_for(MirrorOperationKind::Update);
        let tracker = WorkTracker::new(key, MirrorOperationKind::Update, targets, policy.retry_threshold);
        let kernel = MirrorKernel::update(
            Arc::clone(&self.platform),
            self.limiter.clone(),
            message.clone(),
            role_mentions,
        );
        let context = ProgressContext {
            title: "Mirror update progress".to_string(),
            source_message: Some(message),
            source_channel: self.source_channel_info(channel_id).await,
            cancel_key: Some(key),
            started_at: Instant::now(),
        };
        let (tracker, progress) = self
            .run_operation(WorkController::new(tracker, kernel, policy), context)
            .await?;
        progress.finish().await;
        Ok(MirrorReport::from_tracker(&tracker))
    }

    /// Deletes every mirrored copy of a source message.
    ///
    /// The source channel is optional since delete events may not carry it.
    pub async fn on_message_deleted(
        &self,
        channel_id: Option<ChannelId>,
        message_id: MessageId,
    ) -> Result<MirrorReport, MirrorError> {
        let mappings = self
            .retry_infra("look up mirrored messages", || {
                self.topology.get_destination_mappings(message_id)
            })
            .await?;
        let source_channel = channel_id
            .or_else(|| mappings.first().map(|pair| pair.source_channel_id))
            .unwrap_or(ChannelId(0));
        let key = OperationKey::new(source_channel, message_id);
        let targets: Vec<_> = mappings
            .iter()
            .filter(|pair| pair.destination_channel_id != source_channel)
            .map(|pair| (pair.destination_channel_id, Some(pair.destination_message_id)))
            .collect();
        if targets.is_empty() {
            debug!(%key, "message was never mirrored");
            return Ok(MirrorReport::nothing_to_do(key, MirrorOperationKind::Delete));
        }

        let policy = self.settings.policy_for(MirrorOperationKind::Delete);
        let tracker = WorkTracker::new(key, MirrorOperationKind::Delete, targets, policy.retry_threshold);
        let kernel = MirrorKernel::delete(Arc::clone(&self.platform), self.limiter.clone());
        let context = ProgressContext {
            title: "Mirror delete progress".to_string(),
            source_message: None,
            source_channel: self.source_channel_info(source_channel).await,
            cancel_key: None,
            started_at: Instant::now(),
        };
        let (tracker, progress) = self
            .run_operation(WorkController::new(tracker, kernel, policy), context)
            .await?;
        progress.finish().await;
        Ok(MirrorReport::from_tracker(&tracker))
    }

    /// Cancels the running update of a source message.
    pub fn cancel_update(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<usize, SupervisorError> {
        self.supervisor
            .cancel(OperationKey::new(channel_id, message_id))
    }

    pub async fn sources_for_destination(
        &self,
        destination: ChannelId,
    ) -> anyhow::Result<MirrorSourcesResponse> {
        let (legacy_sources, non_legacy_sources) = futures::try_join!(
            self.topology.list_sources(destination, true),
            self.topology.list_sources(destination, false),
        )?;
        Ok(MirrorSourcesResponse {
            destination_channel_id: destination,
            legacy_sources,
            non_legacy_sources,
        })
    }

    pub async fn add_link(&self, link: NewMirrorLink) -> anyhow::Result<()> {
        self.topology.add_link(&link).await?;
        if link.is_legacy && link.enabled {
            self.sources.insert(link.source_channel_id);
        }
        info!(
            source_channel_id = %link.source_channel_id,
            destination_channel_id = %link.destination_channel_id,
            "mirror link added"
        );
        Ok(())
    }

    /// Re-enables links auto-disabled at or after `since`.
    pub async fn undo_auto_disable(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<LinkPair>> {
        let restored = self.topology.undo_auto_disable(since).await?;
        if !restored.is_empty() {
            if let Err(err) = self.sources.refresh().await {
                warn!(error = %format!("{err:#}"), "source channel refresh failed");
            }
        }
        info!(restored = restored.len(), %since, "undid auto disable");
        Ok(restored)
    }

    /// Registers and runs one operation; deregisters when done.
    ///
    /// The final progress render is left to the caller so that results can be
    /// persisted before it.
    async fn run_operation(
        &self,
        controller: WorkController,
        context: ProgressContext,
    ) -> Result<(WorkTracker, ProgressHandle), MirrorError> {
        let controller = Arc::new(controller);
        let registration = self.supervisor.register(Arc::clone(&controller))?;
        let progress = self.progress.start(controller.tracker().clone(), context);
        let started = Instant::now();

        controller.run_till_completion().await;
        drop(registration);

        info!(
            key = %controller.key(),
            kind = %controller.kind(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "completed all mirrors"
        );
        Ok((controller.tracker().snapshot(), progress))
    }

    async fn flush_send(&self, key: OperationKey, tracker: &WorkTracker) {
        let source = key.source_channel_id;
        let successes = tracker.successful_targets();
        let succeeded: Vec<ChannelId> = successes.keys().copied().collect();
        let failed: Vec<ChannelId> = tracker.failed_targets().into_keys().collect();
        let pairs: Vec<(MessageId, ChannelId)> = successes
            .iter()
            .filter_map(|(channel_id, message_id)| message_id.map(|id| (id, *channel_id)))
            .collect();

        let (recorded_successes, recorded_failures, recorded_pairs) = futures::join!(
            self.topology.record_success_batch(source, &succeeded),
            self.topology.record_failure_batch(source, &failed),
            self.topology
                .record_mapping_batch(key.source_message_id, source, &pairs),
        );
        for (what, result) in [
            ("success counters", recorded_successes),
            ("failure counters", recorded_failures),
            ("message pairs", recorded_pairs),
        ] {
            if let Err(err) = result {
                error!(%key, error = %format!("{err:#}"), "could not record mirror {what}");
            }
        }

        self.disable_failing_links().await;
    }

    async fn disable_failing_links(&self) {
        let threshold = self.settings.link_error_threshold;
        let disable = self.settings.disable_failing_links;
        let links = if disable {
            self.topology.disable_links_over_error_threshold(threshold).await
        } else {
            self.topology.links_over_error_threshold(threshold).await
        };
        let links = match links {
            Ok(links) => links,
            Err(err) => {
                error!(error = %format!("{err:#}"), "could not check failing mirrors");
                return;
            }
        };
        if links.is_empty() {
            return;
        }

        let listed = links
            .iter()
            .map(|link| format!("{}: {}", link.source_channel_id, link.destination_channel_id))
            .collect::<Vec<_>>()
            .join(", ");
        if disable {
            warn!(count = links.len(), links = %listed, "disabled failing mirrors");
            if let Err(err) = self.sources.refresh().await {
                warn!(error = %format!("{err:#}"), "source channel refresh failed");
            }
        } else {
            warn!(count = links.len(), links = %listed, "would disable failing mirrors");
        }
    }

    /// Waits, bounded, for an announcement to be published before mirroring it.
    async fn wait_for_publish(&self, message: &MessageSnapshot) -> Result<(), MirrorError> {
        let current = self
            .retry_infra("fetch source message", || {
                self.platform.fetch_message(message.channel_id, message.message_id)
            })
            .await?;
        if current.flags.crossposted {
            return Ok(());
        }

        let message_id = message.message_id;
        info!(channel_id = %message.channel_id, %message_id, "waiting for message to be published");
        let predicate: EventPredicate = Box::new(move |event| {
            event
                .message()
                .is_some_and(|update| update.message_id == message_id && update.flags.crossposted)
        });
        match self
            .platform
            .wait_for_event(
                PlatformEventKind::MessageUpdated,
                predicate,
                self.settings.publish_wait_timeout,
            )
            .await
        {
            Ok(Some(_)) => info!(%message_id, "message published, continuing"),
            Ok(None) => warn!(%message_id, "message not published in time, mirroring anyway"),
            Err(error) => warn!(%message_id, %error, "could not wait for publish, mirroring anyway"),
        }
        Ok(())
    }

    async fn source_channel_info(&self, channel_id: ChannelId) -> Option<ChannelInfo> {
        match self.platform.fetch_channel(channel_id).await {
            Ok(channel) => Some(channel),
            Err(error) => {
                debug!(%channel_id, %error, "source channel unavailable for progress");
                None
            }
        }
    }

    /// Retries a whole-operation step with capped exponential backoff.
    async fn retry_infra<T, E, F, Fut>(
        &self,
        context: &'static str,
        mut call: F,
    ) -> Result<T, MirrorError>
    where
        E: InfraFailure,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.settings.infrastructure;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_permanent() || attempt >= policy.max_attempts => {
                    error!(context, attempt, error = %err, "giving up on mirror operation");
                    return Err(MirrorError::Infrastructure {
                        context,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(context, attempt, error = %err, ?delay, "retrying mirror step");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/driver_tests.rs"]
mod tests;
