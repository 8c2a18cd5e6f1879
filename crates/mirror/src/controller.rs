use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use shared::domain::MirrorOperationKind;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    kernel::MirrorKernel,
    schedule::{plan_round, RetryPolicy},
    tracker::{OperationKey, SharedTracker, WorkTracker},
};

/// Drives one [`WorkTracker`] to completion in rounds of concurrent kernel tasks.
///
/// A round launches one task per schedulable target and waits for all of them
/// before the next round is planned, so retries of a round share one jittered
/// delay window.
pub struct WorkController {
    key: OperationKey,
    kind: MirrorOperationKind,
    tracker: SharedTracker,
    kernel: Arc<MirrorKernel>,
    policy: RetryPolicy,
    running: Mutex<Vec<AbortHandle>>,
    cancelled: AtomicBool,
}

impl WorkController {
    pub fn new(tracker: WorkTracker, kernel: MirrorKernel, policy: RetryPolicy) -> Self {
        Self {
            key: tracker.key(),
            kind: tracker.kind(),
            tracker: SharedTracker::new(tracker),
            kernel: Arc::new(kernel),
            policy,
            running: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> OperationKey {
        self.key
    }

    pub fn kind(&self) -> MirrorOperationKind {
        self.kind
    }

    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn run_till_completion(&self) {
        let mut rng = fastrand::Rng::new();
        let mut round = 0u32;

        while !self.is_cancelled() && self.tracker.read(WorkTracker::is_work_left_to_do) {
            let plan = self
                .tracker
                .read(|tracker| plan_round(tracker, round, &self.policy, &mut rng));
            if plan.is_empty() {
                break;
            }
            debug!(key = %self.key, kind = %self.kind, round, targets = plan.len(), "starting round");

            let mut tasks = JoinSet::new();
            {
                let mut running = self.lock_running();
                for planned in plan {
                    let kernel = Arc::clone(&self.kernel);
                    running.push(tasks.spawn(kernel.run(self.tracker.clone(), planned)));
                }
            }
            // A cancel that raced the spawns above must still reach the new tasks.
            if self.is_cancelled() {
                self.abort_running();
            }

            while let Some(joined) = tasks.join_next().await {
                if let Err(join_error) = joined {
                    if join_error.is_panic() {
                        error!(key = %self.key, kind = %self.kind, "mirror kernel panicked");
                    }
                }
            }
            self.lock_running().clear();
            self.fail_abandoned_targets();
            round += 1;
        }

        let counts = self.tracker.counts();
        info!(
            key = %self.key,
            kind = %self.kind,
            completed = counts.completed,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "mirror operation finished"
        );
    }

    /// Stops outstanding kernel tasks and moves every open target to cancelled.
    ///
    /// Effects already applied on the platform stay in place.
    pub fn cancel(&self) -> usize {
        self.cancelled.store(true, Ordering::SeqCst);
        // Targets are cancelled before their tasks die, so a drained round
        // never sees them as abandoned.
        let cancelled = self.tracker.with(|tracker| tracker.cancel());
        self.abort_running();
        cancelled
    }

    fn abort_running(&self) {
        for handle in self.lock_running().iter() {
            handle.abort();
        }
    }

    /// Targets still marked scheduled after their task ended belong to a task that panicked.
    fn fail_abandoned_targets(&self) {
        if self.is_cancelled() {
            return;
        }
        self.tracker.with(|tracker| {
            for destination in tracker.scheduled_targets().into_keys() {
                error!(key = %self.key, %destination, "kernel ended without reporting");
                if let Err(err) = tracker.report_permanent_failure(destination) {
                    warn!(key = %self.key, %destination, error = %err, "could not mark abandoned target");
                }
            }
        });
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Vec<AbortHandle>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
