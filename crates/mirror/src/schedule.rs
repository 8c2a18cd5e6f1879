use std::time::Duration;

use shared::domain::{ChannelId, MessageId};

use crate::tracker::WorkTracker;

/// Retry behaviour of one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a failing target is given up on.
    pub retry_threshold: u32,
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(retry_threshold: u32, min_retry_delay: Duration, max_retry_delay: Duration) -> Self {
        Self {
            retry_threshold,
            min_retry_delay,
            max_retry_delay,
        }
    }

    /// Uniformly jittered delay in `[min_retry_delay, max_retry_delay]`.
    pub fn retry_delay(&self, rng: &mut fastrand::Rng) -> Duration {
        let low = self.min_retry_delay.as_millis() as u64;
        let high = (self.max_retry_delay.as_millis() as u64).max(low);
        Duration::from_millis(rng.u64(low..=high))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedKernel {
    pub destination: ChannelId,
    pub message_id: Option<MessageId>,
    pub delay: Duration,
}

/// Kernel invocations for one scheduling round.
///
/// Round 0 starts immediately; later rounds wait a jittered delay so that a
/// platform outage has time to pass before targets are retried.
pub fn plan_round(
    tracker: &WorkTracker,
    round: u32,
    policy: &RetryPolicy,
    rng: &mut fastrand::Rng,
) -> Vec<PlannedKernel> {
    tracker
        .targets_to_schedule()
        .into_iter()
        .map(|(destination, message_id)| PlannedKernel {
            destination,
            message_id,
            delay: if round == 0 {
                Duration::ZERO
            } else {
                policy.retry_delay(rng)
            },
        })
        .collect()
}
