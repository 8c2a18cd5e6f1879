use std::time::Duration;

use shared::domain::{ChannelKind, MessageId, MirrorOperationKind};

use super::*;
use crate::{
    test_support::{snapshot, FakePlatform},
    tracker::{OperationKey, WorkTracker},
};

fn limiter() -> RateLimiter {
    RateLimiter::new(45, Duration::ZERO)
}

fn crosspost() -> CrosspostPolicy {
    CrosspostPolicy {
        attempts: 3,
        initial_backoff: Duration::from_secs(30),
    }
}

fn tracker(kind: MirrorOperationKind, targets: &[(i64, Option<i64>)], threshold: u32) -> SharedTracker {
    SharedTracker::new(WorkTracker::new(
        OperationKey::new(ChannelId(1), MessageId(2)),
        kind,
        targets
            .iter()
            .map(|(channel, message)| (ChannelId(*channel), message.map(MessageId))),
        threshold,
    ))
}

fn planned(destination: i64, message_id: Option<i64>) -> PlannedKernel {
    PlannedKernel {
        destination: ChannelId(destination),
        message_id: message_id.map(MessageId),
        delay: Duration::ZERO,
    }
}

fn send_kernel(platform: Arc<FakePlatform>, roles: HashMap<ChannelId, Option<RoleId>>) -> Arc<MirrorKernel> {
    Arc::new(MirrorKernel::send(
        platform,
        limiter(),
        crosspost(),
        snapshot(1, 2, "hello"),
        roles,
    ))
}

#[tokio::test]
async fn send_delivers_content_with_role_mention() {
    let platform = FakePlatform::new();
    platform.add_channel(10, ChannelKind::Text);
    let roles = HashMap::from([(ChannelId(10), Some(RoleId(77)))]);
    let kernel = send_kernel(platform.clone(), roles);
    let tracker = tracker(MirrorOperationKind::Send, &[(10, None)], 3);

    kernel.run(tracker.clone(), planned(10, None)).await;

    let sent = platform.sent_to(10);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "hello\n\n||<@&77>||");
    let successes = tracker.read(|tracker| tracker.successful_targets());
    assert!(successes[&ChannelId(10)].is_some());
    assert!(platform.crossposts().is_empty());
}

#[tokio::test]
async fn send_to_voice_channel_fails_permanently() {
    let platform = FakePlatform::new();
    platform.add_channel(10, ChannelKind::Voice);
    let kernel = send_kernel(platform.clone(), HashMap::new());
    let tracker = tracker(MirrorOperationKind::Send, &[(10, None)], 3);

    kernel.run(tracker.clone(), planned(10, None)).await;

    assert_eq!(tracker.read(|t| t.state(ChannelId(10))), Some(TargetState::PermanentlyFailed));
    assert_eq!(platform.sent_count(), 0);
}

#[tokio::test]
async fn failed_send_is_left_for_retry() {
    let platform = FakePlatform::new();
    platform.add_channel(10, ChannelKind::Text);
    platform.fail_writes(10, PlatformError::Transient("502".to_string()), Some(1));
    let kernel = send_kernel(platform.clone(), HashMap::new());
    let tracker = tracker(MirrorOperationKind::Send, &[(10, None)], 3);

    kernel.run(tracker.clone(), planned(10, None)).await;

    assert_eq!(tracker.read(|t| t.state(ChannelId(10))), Some(TargetState::AwaitingRetry));
    assert_eq!(tracker.read(|t| t.attempts(ChannelId(10))), Some(1));
}

#[tokio::test]
async fn announcement_destination_is_crossposted_once() {
    let platform = FakePlatform::new();
    platform.add_channel(10, ChannelKind::News);
    let kernel = send_kernel(platform.clone(), HashMap::new());
    let tracker = tracker(MirrorOperationKind::Send, &[(10, None)], 3);

    kernel.run(tracker.clone(), planned(10, None)).await;

    assert_eq!(platform.crossposts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn already_crossposted_counts_as_success() {
    let platform = FakePlatform::new();
    platform.add_channel(10, ChannelKind::News);
    platform.fail_crossposts(vec![
        PlatformError::Transient("503".to_string()),
        PlatformError::AlreadyCrossposted,
    ]);
    let kernel = send_kernel(platform.clone(), HashMap::new());

    kernel.crosspost(ChannelId(10), MessageId(5)).await;

    assert_eq!(platform.crossposts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn crosspost_gives_up_after_bounded_attempts() {
    let platform = FakePlatform::new();
    platform.fail_crossposts(vec![PlatformError::Transient("503".to_string()); 5]);
    let kernel = send_kernel(platform.clone(), HashMap::new());
    let started = tokio::time::Instant::now();

    kernel.crosspost(ChannelId(10), MessageId(5)).await;

    assert_eq!(platform.crossposts().len(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(90));
}

#[tokio::test]
async fn update_edits_the_known_destination_message() {
    let platform = FakePlatform::new();
    platform.insert_message(snapshot(10, 100, "old"));
    let kernel = Arc::new(MirrorKernel::update(
        platform.clone(),
        limiter(),
        snapshot(1, 2, "new"),
        HashMap::new(),
    ));
    let tracker = tracker(MirrorOperationKind::Update, &[(10, Some(100))], 2);

    kernel.run(tracker.clone(), planned(10, Some(100))).await;

    let edits = platform.edits();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].2.content, "new");
    assert_eq!(tracker.read(|t| t.state(ChannelId(10))), Some(TargetState::Succeeded));
}

#[tokio::test]
async fn update_of_vanished_message_uses_up_retries() {
    let platform = FakePlatform::new();
    let kernel = Arc::new(MirrorKernel::update(
        platform.clone(),
        limiter(),
        snapshot(1, 2, "new"),
        HashMap::new(),
    ));
    let tracker = tracker(MirrorOperationKind::Update, &[(10, Some(100))], 2);

    kernel.clone().run(tracker.clone(), planned(10, Some(100))).await;
    assert_eq!(tracker.read(|t| t.state(ChannelId(10))), Some(TargetState::AwaitingRetry));
    kernel.run(tracker.clone(), planned(10, Some(100))).await;
    assert_eq!(tracker.read(|t| t.state(ChannelId(10))), Some(TargetState::PermanentlyFailed));
}

#[tokio::test]
async fn delete_of_missing_message_succeeds() {
    let platform = FakePlatform::new();
    platform.insert_message(snapshot(20, 200, "still here"));
    let kernel = Arc::new(MirrorKernel::delete(platform.clone(), limiter()));
    let tracker = tracker(MirrorOperationKind::Delete, &[(10, Some(100)), (20, Some(200))], 2);

    kernel.clone().run(tracker.clone(), planned(10, Some(100))).await;
    kernel.run(tracker.clone(), planned(20, Some(200))).await;

    assert_eq!(platform.deleted(), vec![(ChannelId(20), MessageId(200))]);
    let counts = tracker.counts();
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.failed, 0);
}

#[tokio::test]
async fn already_finished_target_is_not_run_again() {
    let platform = FakePlatform::new();
    platform.add_channel(10, ChannelKind::Text);
    let kernel = send_kernel(platform.clone(), HashMap::new());
    let tracker = tracker(MirrorOperationKind::Send, &[(10, None)], 3);

    kernel.clone().run(tracker.clone(), planned(10, None)).await;
    kernel.run(tracker.clone(), planned(10, None)).await;

    assert_eq!(platform.sent_count(), 1);
}
