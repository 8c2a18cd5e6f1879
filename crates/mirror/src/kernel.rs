use std::{collections::HashMap, sync::Arc};

use shared::domain::{ChannelId, MessageId, MessageSnapshot, MirrorOperationKind, RoleId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::CrosspostPolicy,
    content::mirrored_payload,
    platform::{ChatPlatform, FailureClass, PlatformError},
    rate_limit::RateLimiter,
    schedule::PlannedKernel,
    tracker::{SharedTracker, TargetState},
};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("channel {0} cannot hold messages")]
    NotTextable(ChannelId),
    #[error("no mirrored message is known in channel {0}")]
    MissingDestinationMessage(ChannelId),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl KernelError {
    /// Permanent errors fail the target at once instead of using up retries.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            KernelError::NotTextable(_) | KernelError::MissingDestinationMessage(_)
        )
    }
}

/// Result of one successful kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: Option<MessageId>,
    /// The destination is an announcement channel and the new message should be published.
    pub publish: bool,
}

enum Work {
    Send {
        source: MessageSnapshot,
        role_mentions: HashMap<ChannelId, Option<RoleId>>,
        crosspost: CrosspostPolicy,
    },
    Update {
        source: MessageSnapshot,
        role_mentions: HashMap<ChannelId, Option<RoleId>>,
    },
    Delete,
}

/// Per-operation unit of work, run once per destination and round.
///
/// Holds the immutable inputs of one operation: the source snapshot (already
/// stripped of auto-embeds) and the per-destination role mentions.
pub struct MirrorKernel {
    platform: Arc<dyn ChatPlatform>,
    limiter: RateLimiter,
    work: Work,
}

impl MirrorKernel {
    pub fn send(
        platform: Arc<dyn ChatPlatform>,
        limiter: RateLimiter,
        crosspost: CrosspostPolicy,
        source: MessageSnapshot,
        role_mentions: HashMap<ChannelId, Option<RoleId>>,
    ) -> Self {
        Self {
            platform,
            limiter,
            work: Work::Send {
                source,
                role_mentions,
                crosspost,
            },
        }
    }

    pub fn update(
        platform: Arc<dyn ChatPlatform>,
        limiter: RateLimiter,
        source: MessageSnapshot,
        role_mentions: HashMap<ChannelId, Option<RoleId>>,
    ) -> Self {
        Self {
            platform,
            limiter,
            work: Work::Update {
                source,
                role_mentions,
            },
        }
    }

    pub fn delete(platform: Arc<dyn ChatPlatform>, limiter: RateLimiter) -> Self {
        Self {
            platform,
            limiter,
            work: Work::Delete,
        }
    }

    pub fn kind(&self) -> MirrorOperationKind {
        match self.work {
            Work::Send { .. } => MirrorOperationKind::Send,
            Work::Update { .. } => MirrorOperationKind::Update,
            Work::Delete => MirrorOperationKind::Delete,
        }
    }

    pub async fn execute(
        &self,
        destination: ChannelId,
        message_id: Option<MessageId>,
    ) -> Result<Delivery, KernelError> {
        match &self.work {
            Work::Send {
                source,
                role_mentions,
                ..
            } => self.send_to(destination, source, role_for(role_mentions, destination)).await,
            Work::Update {
                source,
                role_mentions,
            } => {
                let role = role_for(role_mentions, destination);
                self.update_in(destination, message_id, source, role).await
            }
            Work::Delete => self.delete_from(destination, message_id).await,
        }
    }

    async fn send_to(
        &self,
        destination: ChannelId,
        source: &MessageSnapshot,
        role: Option<RoleId>,
    ) -> Result<Delivery, KernelError> {
        let channel = {
            let _permit = self.limiter.acquire().await;
            self.platform.fetch_channel(destination).await?
        };
        if !channel.kind.is_textable() {
            return Err(KernelError::NotTextable(destination));
        }

        let payload = mirrored_payload(source, role);
        let _permit = self.limiter.acquire().await;
        let message_id = self.platform.send_message(destination, &payload).await?;
        Ok(Delivery {
            message_id: Some(message_id),
            publish: channel.kind.is_announcement(),
        })
    }

    async fn update_in(
        &self,
        destination: ChannelId,
        message_id: Option<MessageId>,
        source: &MessageSnapshot,
        role: Option<RoleId>,
    ) -> Result<Delivery, KernelError> {
        let message_id = message_id.ok_or(KernelError::MissingDestinationMessage(destination))?;
        {
            let _permit = self.limiter.acquire().await;
            self.platform.fetch_message(destination, message_id).await?;
        }

        let payload = mirrored_payload(source, role);
        let _permit = self.limiter.acquire().await;
        self.platform
            .edit_message(destination, message_id, &payload)
            .await?;
        Ok(Delivery {
            message_id: Some(message_id),
            publish: false,
        })
    }

    async fn delete_from(
        &self,
        destination: ChannelId,
        message_id: Option<MessageId>,
    ) -> Result<Delivery, KernelError> {
        let message_id = message_id.ok_or(KernelError::MissingDestinationMessage(destination))?;
        let fetched = {
            let _permit = self.limiter.acquire().await;
            self.platform.fetch_message(destination, message_id).await
        };
        let deleted = match fetched {
            Ok(_) => {
                let _permit = self.limiter.acquire().await;
                self.platform.delete_message(destination, message_id).await
            }
            Err(error) => Err(error),
        };
        match deleted {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                debug!(%destination, %message_id, "mirrored message already gone");
            }
            Err(error) => return Err(error.into()),
        }
        Ok(Delivery {
            message_id: Some(message_id),
            publish: false,
        })
    }

    /// Publishes a mirrored message to the followers of an announcement channel.
    ///
    /// Bounded by its own retry loop; never affects the target's tracker state.
    pub async fn crosspost(&self, destination: ChannelId, message_id: MessageId) {
        let Work::Send { crosspost, .. } = &self.work else {
            return;
        };
        let mut backoff = crosspost.initial_backoff;
        for attempt in 1..=crosspost.attempts {
            let result = {
                let _permit = self.limiter.acquire().await;
                self.platform.crosspost_message(destination, message_id).await
            };
            match result {
                Ok(()) => return,
                Err(error) if error.class() == FailureClass::AlreadyDone => return,
                Err(error) => {
                    warn!(%destination, %message_id, attempt, %error, "crosspost failed");
                    if attempt < crosspost.attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
    }

    /// Runs one planned invocation and reports its outcome to `tracker`.
    ///
    /// Every error ends up as a tracker report; nothing escapes to the controller.
    pub async fn run(self: Arc<Self>, tracker: SharedTracker, planned: PlannedKernel) {
        let destination = planned.destination;
        let key = tracker.read(|tracker| tracker.key());
        if let Err(error) = tracker.with(|tracker| tracker.report_scheduled(destination)) {
            debug!(%key, %destination, %error, "skipping target");
            return;
        }
        if !planned.delay.is_zero() {
            tokio::time::sleep(planned.delay).await;
        }

        match self.execute(destination, planned.message_id).await {
            Ok(delivery) => {
                let reported =
                    tracker.with(|tracker| tracker.report_completed(destination, delivery.message_id));
                if let Err(error) = reported {
                    debug!(%key, %destination, %error, "completion not recorded");
                }
                if let (true, Some(message_id)) = (delivery.publish, delivery.message_id) {
                    self.crosspost(destination, message_id).await;
                }
            }
            Err(error) if error.is_permanent() => {
                warn!(
                    source_channel_id = %key.source_channel_id,
                    source_message_id = %key.source_message_id,
                    destination_channel_id = %destination,
                    kind = %self.kind(),
                    %error,
                    "mirror target failed permanently"
                );
                if let Err(error) =
                    tracker.with(|tracker| tracker.report_permanent_failure(destination))
                {
                    debug!(%key, %destination, %error, "failure not recorded");
                }
            }
            Err(error) => {
                let attempt = tracker.read(|tracker| tracker.attempts(destination)).unwrap_or(0) + 1;
                warn!(
                    source_channel_id = %key.source_channel_id,
                    source_message_id = %key.source_message_id,
                    destination_channel_id = %destination,
                    kind = %self.kind(),
                    attempt,
                    %error,
                    "mirror attempt failed"
                );
                match tracker.with(|tracker| tracker.report_failure(destination)) {
                    Ok(TargetState::PermanentlyFailed) => {
                        info!(%key, %destination, kind = %self.kind(), "giving up on target");
                    }
                    Ok(_) => {}
                    Err(error) => debug!(%key, %destination, %error, "failure not recorded"),
                }
            }
        }
    }
}

fn role_for(
    role_mentions: &HashMap<ChannelId, Option<RoleId>>,
    destination: ChannelId,
) -> Option<RoleId> {
    role_mentions.get(&destination).copied().flatten()
}

#[cfg(test)]
#[path = "tests/kernel_tests.rs"]
mod tests;
