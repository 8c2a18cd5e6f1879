use std::time::Duration;

use shared::domain::{ChannelId, MirrorOperationKind};

use crate::schedule::RetryPolicy;

/// Crosspost retries after a successful send to an announcement channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrosspostPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

/// Driver-level retries for whole-operation steps (resolving destinations,
/// re-fetching the source message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfraRetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl InfraRetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSettings {
    /// Where status messages go; `None` disables progress reporting.
    pub channel_id: Option<ChannelId>,
    pub refresh_interval: Duration,
    pub post_attempts: u32,
    pub max_backoff: Duration,
    /// How long a finished operation waits for its final status render.
    pub finish_timeout: Duration,
    pub default_color: u32,
    /// Used once any destination has failed.
    pub error_color: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSettings {
    pub send: RetryPolicy,
    pub update: RetryPolicy,
    pub delete: RetryPolicy,
    pub rate_limit_permits: usize,
    pub rate_limit_period: Duration,
    pub crosspost: CrosspostPolicy,
    pub publish_wait_timeout: Duration,
    pub progress: ProgressSettings,
    pub infrastructure: InfraRetryPolicy,
    pub link_error_threshold: i64,
    pub disable_failing_links: bool,
    pub mapping_retention: Duration,
    pub prune_interval: Duration,
}

impl MirrorSettings {
    pub fn policy_for(&self, kind: MirrorOperationKind) -> RetryPolicy {
        match kind {
            MirrorOperationKind::Send => self.send,
            MirrorOperationKind::Update => self.update,
            MirrorOperationKind::Delete => self.delete,
        }
    }
}

impl Default for MirrorSettings {
    fn default() -> Self {
        let jitter_min = Duration::from_secs(180);
        let jitter_max = Duration::from_secs(300);
        Self {
            send: RetryPolicy::new(3, jitter_min, jitter_max),
            update: RetryPolicy::new(2, jitter_min, jitter_max),
            delete: RetryPolicy::new(2, jitter_min, jitter_max),
            rate_limit_permits: 45,
            rate_limit_period: Duration::from_secs(1),
            crosspost: CrosspostPolicy {
                attempts: 3,
                initial_backoff: Duration::from_secs(30),
            },
            publish_wait_timeout: Duration::from_secs(12 * 60 * 60),
            progress: ProgressSettings {
                channel_id: None,
                refresh_interval: Duration::from_secs(5),
                post_attempts: 4,
                max_backoff: Duration::from_secs(125),
                finish_timeout: Duration::from_secs(30),
                default_color: 0x5865F2,
                error_color: 0xED4245,
            },
            infrastructure: InfraRetryPolicy {
                initial_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(600),
                max_attempts: 6,
            },
            link_error_threshold: 3,
            disable_failing_links: true,
            mapping_retention: Duration::from_secs(21 * 24 * 60 * 60),
            prune_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}
