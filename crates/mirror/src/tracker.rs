use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::domain::{ChannelId, MessageId, MirrorOperationKind};
use thiserror::Error;

/// Identifies one fan-out operation by its source message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationKey {
    pub source_channel_id: ChannelId,
    pub source_message_id: MessageId,
}

impl OperationKey {
    pub fn new(source_channel_id: ChannelId, source_message_id: MessageId) -> Self {
        Self {
            source_channel_id,
            source_message_id,
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_channel_id, self.source_message_id)
    }
}

/// Observable state of one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    NotTried,
    Scheduled,
    /// Failed at least once and still eligible for another round.
    AwaitingRetry,
    Succeeded,
    PermanentlyFailed,
    Cancelled,
}

impl TargetState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TargetState::Succeeded | TargetState::PermanentlyFailed | TargetState::Cancelled
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("channel {0} is not a target of this operation")]
    UnknownTarget(ChannelId),
    #[error("target {0} is already scheduled")]
    AlreadyScheduled(ChannelId),
    #[error("target {0} is not scheduled")]
    NotScheduled(ChannelId),
    #[error("target {0} is already finished")]
    AlreadyFinished(ChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Scheduled,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
struct TargetRecord {
    known_message_id: Option<MessageId>,
    attempts: u32,
    status: Status,
    result_message_id: Option<MessageId>,
}

impl TargetRecord {
    fn state(&self) -> TargetState {
        match self.status {
            Status::Idle if self.attempts == 0 => TargetState::NotTried,
            Status::Idle => TargetState::AwaitingRetry,
            Status::Scheduled => TargetState::Scheduled,
            Status::Succeeded => TargetState::Succeeded,
            Status::Failed => TargetState::PermanentlyFailed,
            Status::Cancelled => TargetState::Cancelled,
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.status, Status::Idle | Status::Scheduled)
    }
}

/// Counters rendered by the progress reporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub total: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    pub remaining: usize,
    pub cancelled: usize,
    pub every_target_tried: bool,
    pub work_left: bool,
}

/// Per-destination bookkeeping for one fan-out operation. Pure, no I/O.
#[derive(Debug, Clone)]
pub struct WorkTracker {
    key: OperationKey,
    kind: MirrorOperationKind,
    retry_threshold: u32,
    targets: BTreeMap<ChannelId, TargetRecord>,
}

impl WorkTracker {
    pub fn new(
        key: OperationKey,
        kind: MirrorOperationKind,
        targets: impl IntoIterator<Item = (ChannelId, Option<MessageId>)>,
        retry_threshold: u32,
    ) -> Self {
        let targets = targets
            .into_iter()
            .map(|(channel_id, known_message_id)| {
                (
                    channel_id,
                    TargetRecord {
                        known_message_id,
                        attempts: 0,
                        status: Status::Idle,
                        result_message_id: None,
                    },
                )
            })
            .collect();
        Self {
            key,
            kind,
            retry_threshold: retry_threshold.max(1),
            targets,
        }
    }

    pub fn key(&self) -> OperationKey {
        self.key
    }

    pub fn kind(&self) -> MirrorOperationKind {
        self.kind
    }

    pub fn retry_threshold(&self) -> u32 {
        self.retry_threshold
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn state(&self, target: ChannelId) -> Option<TargetState> {
        self.targets.get(&target).map(TargetRecord::state)
    }

    pub fn attempts(&self, target: ChannelId) -> Option<u32> {
        self.targets.get(&target).map(|record| record.attempts)
    }

    pub fn report_scheduled(&mut self, target: ChannelId) -> Result<(), TrackerError> {
        let record = self.record_mut(target)?;
        match record.status {
            Status::Idle => {
                record.status = Status::Scheduled;
                Ok(())
            }
            Status::Scheduled => Err(TrackerError::AlreadyScheduled(target)),
            Status::Succeeded | Status::Failed | Status::Cancelled => {
                Err(TrackerError::AlreadyFinished(target))
            }
        }
    }

    pub fn report_completed(
        &mut self,
        target: ChannelId,
        resulting_message_id: Option<MessageId>,
    ) -> Result<(), TrackerError> {
        let record = self.scheduled_record_mut(target)?;
        record.attempts += 1;
        record.status = Status::Succeeded;
        record.result_message_id = resulting_message_id;
        Ok(())
    }

    pub fn report_failure(&mut self, target: ChannelId) -> Result<TargetState, TrackerError> {
        let threshold = self.retry_threshold;
        let record = self.scheduled_record_mut(target)?;
        record.attempts += 1;
        record.status = if record.attempts >= threshold {
            Status::Failed
        } else {
            Status::Idle
        };
        Ok(record.state())
    }

    /// Failure that no later attempt can fix, e.g. a channel that cannot hold messages.
    pub fn report_permanent_failure(&mut self, target: ChannelId) -> Result<(), TrackerError> {
        let record = self.scheduled_record_mut(target)?;
        record.attempts += 1;
        record.status = Status::Failed;
        Ok(())
    }

    /// Moves every open target to `Cancelled`. Returns how many were moved.
    pub fn cancel(&mut self) -> usize {
        let mut moved = 0;
        for record in self.targets.values_mut().filter(|record| record.is_open()) {
            record.status = Status::Cancelled;
            moved += 1;
        }
        moved
    }

    pub fn targets_to_schedule(&self) -> BTreeMap<ChannelId, Option<MessageId>> {
        self.collect(|record| record.status == Status::Idle, |r| r.known_message_id)
    }

    pub fn scheduled_targets(&self) -> BTreeMap<ChannelId, Option<MessageId>> {
        self.collect(|record| record.status == Status::Scheduled, |r| r.known_message_id)
    }

    pub fn targets_being_retried(&self) -> BTreeMap<ChannelId, Option<MessageId>> {
        self.collect(
            |record| record.is_open() && record.attempts > 0,
            |r| r.known_message_id,
        )
    }

    pub fn targets_not_yet_tried(&self) -> BTreeMap<ChannelId, Option<MessageId>> {
        self.collect(
            |record| record.is_open() && record.attempts == 0,
            |r| r.known_message_id,
        )
    }

    pub fn failed_targets(&self) -> BTreeMap<ChannelId, Option<MessageId>> {
        self.collect(|record| record.status == Status::Failed, |r| r.known_message_id)
    }

    /// Destination id mapped to the message produced there (sends and updates).
    pub fn successful_targets(&self) -> BTreeMap<ChannelId, Option<MessageId>> {
        self.collect(
            |record| record.status == Status::Succeeded,
            |r| r.result_message_id,
        )
    }

    pub fn cancelled_targets(&self) -> BTreeMap<ChannelId, Option<MessageId>> {
        self.collect(|record| record.status == Status::Cancelled, |r| r.known_message_id)
    }

    pub fn is_every_target_tried(&self) -> bool {
        self.targets.values().all(|record| record.attempts > 0)
    }

    pub fn is_work_left_to_do(&self) -> bool {
        self.targets.values().any(TargetRecord::is_open)
    }

    pub fn is_cancelled(&self) -> bool {
        self.targets
            .values()
            .any(|record| record.status == Status::Cancelled)
    }

    pub fn counts(&self) -> ProgressCounts {
        let mut counts = ProgressCounts {
            total: self.targets.len(),
            every_target_tried: self.is_every_target_tried(),
            ..ProgressCounts::default()
        };
        for record in self.targets.values() {
            match record.status {
                Status::Succeeded => counts.completed += 1,
                Status::Failed => counts.failed += 1,
                Status::Cancelled => counts.cancelled += 1,
                Status::Idle | Status::Scheduled if record.attempts > 0 => counts.retrying += 1,
                Status::Idle | Status::Scheduled => counts.remaining += 1,
            }
        }
        counts.work_left = counts.retrying + counts.remaining > 0;
        counts
    }

    fn record_mut(&mut self, target: ChannelId) -> Result<&mut TargetRecord, TrackerError> {
        self.targets
            .get_mut(&target)
            .ok_or(TrackerError::UnknownTarget(target))
    }

    fn scheduled_record_mut(
        &mut self,
        target: ChannelId,
    ) -> Result<&mut TargetRecord, TrackerError> {
        let record = self.record_mut(target)?;
        if record.status != Status::Scheduled {
            return Err(TrackerError::NotScheduled(target));
        }
        Ok(record)
    }

    fn collect(
        &self,
        keep: impl Fn(&TargetRecord) -> bool,
        value: impl Fn(&TargetRecord) -> Option<MessageId>,
    ) -> BTreeMap<ChannelId, Option<MessageId>> {
        self.targets
            .iter()
            .filter(|(_, record)| keep(record))
            .map(|(channel_id, record)| (*channel_id, value(record)))
            .collect()
    }
}

/// A tracker shared between the controller, its kernel tasks and the progress reporter.
///
/// The lock is never held across an await point.
#[derive(Debug, Clone)]
pub struct SharedTracker(Arc<Mutex<WorkTracker>>);

impl SharedTracker {
    pub fn new(tracker: WorkTracker) -> Self {
        Self(Arc::new(Mutex::new(tracker)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut WorkTracker) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn read<R>(&self, f: impl FnOnce(&WorkTracker) -> R) -> R {
        f(&self.lock())
    }

    pub fn counts(&self) -> ProgressCounts {
        self.lock().counts()
    }

    pub fn snapshot(&self) -> WorkTracker {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, WorkTracker> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/tracker_tests.rs"]
mod tests;
