use super::*;
use chrono::Duration;

fn new_link(source: i64, destination: i64, legacy: bool) -> NewMirrorLink {
    NewMirrorLink {
        source_channel_id: ChannelId(source),
        destination_channel_id: ChannelId(destination),
        destination_server_id: Some(GuildId(77)),
        is_legacy: legacy,
        enabled: true,
        role_mention_id: None,
    }
}

async fn storage_with_links(links: &[(i64, i64, bool)]) -> Storage {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for (source, destination, legacy) in links {
        storage
            .add_link(&new_link(*source, *destination, *legacy))
            .await
            .expect("add link");
    }
    storage
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("relay.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[test]
fn sqlite_path_ignores_memory_and_foreign_urls() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(sqlite_path("postgres://localhost/db"), None);
    assert_eq!(
        sqlite_path("sqlite://data/relay.db?mode=rwc"),
        Some(PathBuf::from("data/relay.db"))
    );
}

#[tokio::test]
async fn lists_only_enabled_legacy_destinations() {
    let storage = storage_with_links(&[(1, 10, true), (1, 11, true), (1, 12, false)]).await;
    storage
        .disable_link(ChannelId(1), ChannelId(11))
        .await
        .expect("disable");

    let destinations = storage
        .list_destinations(ChannelId(1))
        .await
        .expect("destinations");
    assert_eq!(
        destinations,
        vec![MirrorDestination {
            channel_id: ChannelId(10),
            role_mention_id: None,
        }]
    );
}

#[tokio::test]
async fn zero_role_id_means_no_mention() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut link = new_link(1, 10, true);
    link.role_mention_id = Some(RoleId(0));
    storage.add_link(&link).await.expect("add");
    let mut link = new_link(1, 11, true);
    link.role_mention_id = Some(RoleId(55));
    storage.add_link(&link).await.expect("add");

    let destinations = storage
        .list_destinations(ChannelId(1))
        .await
        .expect("destinations");
    assert_eq!(destinations[0].role_mention_id, None);
    assert_eq!(destinations[1].role_mention_id, Some(RoleId(55)));
}

#[tokio::test]
async fn add_link_merges_existing_pair() {
    let storage = storage_with_links(&[(1, 10, true)]).await;
    storage
        .record_failure_batch(ChannelId(1), &[ChannelId(10)])
        .await
        .expect("failure");
    storage
        .disable_link(ChannelId(1), ChannelId(10))
        .await
        .expect("disable");

    let mut replacement = new_link(1, 10, true);
    replacement.role_mention_id = Some(RoleId(9));
    storage.add_link(&replacement).await.expect("merge");

    let link = storage
        .get_link(ChannelId(1), ChannelId(10))
        .await
        .expect("get")
        .expect("link exists");
    assert!(link.enabled);
    assert_eq!(link.role_mention_id, Some(RoleId(9)));
    assert_eq!(link.consecutive_error_count, 0);
    assert_eq!(storage.count_links(None).await.expect("count"), 1);
}

#[tokio::test]
async fn counters_only_touch_enabled_legacy_links() {
    let storage = storage_with_links(&[(1, 10, true), (1, 11, false), (1, 12, true)]).await;
    storage
        .disable_link(ChannelId(1), ChannelId(12))
        .await
        .expect("disable");
    let all = [ChannelId(10), ChannelId(11), ChannelId(12)];

    storage
        .record_failure_batch(ChannelId(1), &all)
        .await
        .expect("first failure");
    storage
        .record_failure_batch(ChannelId(1), &all)
        .await
        .expect("second failure");

    let count = |link: Option<MirrorLink>| link.expect("link").consecutive_error_count;
    assert_eq!(count(storage.get_link(ChannelId(1), ChannelId(10)).await.expect("get")), 2);
    assert_eq!(count(storage.get_link(ChannelId(1), ChannelId(11)).await.expect("get")), 0);
    assert_eq!(count(storage.get_link(ChannelId(1), ChannelId(12)).await.expect("get")), 0);

    storage
        .record_success_batch(ChannelId(1), &[ChannelId(10)])
        .await
        .expect("success");
    assert_eq!(count(storage.get_link(ChannelId(1), ChannelId(10)).await.expect("get")), 0);
}

#[tokio::test]
async fn disables_links_at_threshold_and_undoes_it() {
    let storage = storage_with_links(&[(1, 10, true), (1, 11, true)]).await;
    let before = Utc::now() - Duration::seconds(1);
    for _ in 0..3 {
        storage
            .record_failure_batch(ChannelId(1), &[ChannelId(10)])
            .await
            .expect("failure");
    }
    storage
        .record_failure_batch(ChannelId(1), &[ChannelId(11)])
        .await
        .expect("failure");

    let over = storage.links_over_error_threshold(3).await.expect("over");
    assert_eq!(over.len(), 1);
    assert!(over[0].enabled);

    let disabled = storage
        .disable_links_over_error_threshold(3)
        .await
        .expect("disable");
    assert_eq!(disabled.len(), 1);
    assert_eq!(disabled[0].destination_channel_id, ChannelId(10));
    assert!(!disabled[0].enabled);
    assert!(disabled[0].disabled_at.is_some());
    assert!(storage
        .links_over_error_threshold(3)
        .await
        .expect("over")
        .is_empty());

    let recent = storage.links_disabled_since(before).await.expect("since");
    assert_eq!(recent.len(), 1);

    let restored = storage.undo_auto_disable(before).await.expect("undo");
    assert_eq!(
        restored,
        vec![LinkPair {
            source_channel_id: ChannelId(1),
            destination_channel_id: ChannelId(10),
        }]
    );
    let link = storage
        .get_link(ChannelId(1), ChannelId(10))
        .await
        .expect("get")
        .expect("link");
    assert!(link.enabled);
    assert_eq!(link.consecutive_error_count, 0);
    assert_eq!(link.disabled_at, None);
}

#[tokio::test]
async fn undo_ignores_manual_disables_and_older_stamps() {
    let storage = storage_with_links(&[(1, 10, true), (1, 11, true)]).await;
    storage
        .disable_link(ChannelId(1), ChannelId(11))
        .await
        .expect("manual disable");
    for _ in 0..3 {
        storage
            .record_failure_batch(ChannelId(1), &[ChannelId(10)])
            .await
            .expect("failure");
    }
    storage
        .disable_links_over_error_threshold(3)
        .await
        .expect("disable");

    let future = Utc::now() + Duration::hours(1);
    assert!(storage.undo_auto_disable(future).await.expect("undo").is_empty());

    let restored = storage
        .undo_auto_disable(Utc::now() - Duration::hours(1))
        .await
        .expect("undo");
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].destination_channel_id, ChannelId(10));
}

#[tokio::test]
async fn lists_sources_split_by_legacy_flag() {
    let storage = storage_with_links(&[(1, 10, true), (2, 10, false), (3, 10, true)]).await;

    let legacy = storage.list_sources(ChannelId(10), true).await.expect("legacy");
    let traced = storage
        .list_sources(ChannelId(10), false)
        .await
        .expect("non-legacy");
    assert_eq!(legacy, vec![ChannelId(1), ChannelId(3)]);
    assert_eq!(traced, vec![ChannelId(2)]);

    let sources = storage.list_source_channels(true).await.expect("sources");
    assert_eq!(sources, HashSet::from([ChannelId(1), ChannelId(3)]));
}

#[tokio::test]
async fn set_legacy_moves_link_between_groups() {
    let storage = storage_with_links(&[(1, 10, true)]).await;
    assert!(storage
        .set_legacy(ChannelId(1), ChannelId(10), false)
        .await
        .expect("set legacy"));
    assert!(!storage
        .set_legacy(ChannelId(5), ChannelId(10), false)
        .await
        .expect("missing pair"));

    assert!(storage
        .list_destinations(ChannelId(1))
        .await
        .expect("destinations")
        .is_empty());
    assert_eq!(
        storage
            .list_destination_ids(ChannelId(1), false)
            .await
            .expect("ids"),
        vec![ChannelId(10)]
    );
}

#[tokio::test]
async fn disable_all_links_to_destination() {
    let storage = storage_with_links(&[(1, 10, true), (2, 10, false), (1, 11, true)]).await;
    let disabled = storage
        .disable_all_links_to(ChannelId(10))
        .await
        .expect("disable all");
    assert_eq!(disabled, 2);
    assert_eq!(
        storage
            .count_destinations(ChannelId(1), None)
            .await
            .expect("count"),
        1
    );
    assert_eq!(
        storage
            .count_destinations(ChannelId(1), Some(true))
            .await
            .expect("count"),
        1
    );
    assert_eq!(
        storage
            .count_destinations(ChannelId(2), Some(false))
            .await
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn traced_links_are_recorded_once() {
    let storage = storage_with_links(&[(1, 10, true)]).await;

    let first = storage
        .record_traced_link(ChannelId(2), ChannelId(20), Some(GuildId(5)))
        .await
        .expect("trace");
    let again = storage
        .record_traced_link(ChannelId(2), ChannelId(20), Some(GuildId(5)))
        .await
        .expect("trace again");
    let legacy_pair = storage
        .record_traced_link(ChannelId(1), ChannelId(10), None)
        .await
        .expect("known legacy pair");

    assert!(first);
    assert!(!again);
    assert!(!legacy_pair);
    let link = storage
        .get_link(ChannelId(1), ChannelId(10))
        .await
        .expect("get")
        .expect("link");
    assert!(link.is_legacy);
    assert_eq!(
        storage.list_sources(ChannelId(20), false).await.expect("sources"),
        vec![ChannelId(2)]
    );
}

#[tokio::test]
async fn stores_and_prunes_message_mappings() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let old = Utc::now() - Duration::days(30);
    storage
        .record_mapping_batch_at(
            MessageId(100),
            ChannelId(1),
            &[(MessageId(900), ChannelId(10))],
            old,
        )
        .await
        .expect("old mapping");
    storage
        .record_mapping_batch(
            MessageId(101),
            ChannelId(1),
            &[
                (MessageId(901), ChannelId(10)),
                (MessageId(902), ChannelId(11)),
            ],
        )
        .await
        .expect("fresh mapping");

    let pairs = storage
        .get_destination_mappings(MessageId(101))
        .await
        .expect("mappings");
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].destination_message_id, MessageId(901));
    assert_eq!(pairs[1].destination_channel_id, ChannelId(11));
    assert_eq!(pairs[0].source_channel_id, ChannelId(1));

    let pruned = storage
        .prune_mappings(Utc::now() - Duration::days(21))
        .await
        .expect("prune");
    assert_eq!(pruned, 1);
    assert!(storage
        .get_destination_mappings(MessageId(100))
        .await
        .expect("mappings")
        .is_empty());
    assert_eq!(
        storage
            .get_destination_mappings(MessageId(101))
            .await
            .expect("mappings")
            .len(),
        2
    );
}

#[tokio::test]
async fn empty_batches_are_no_ops() {
    let storage = storage_with_links(&[(1, 10, true)]).await;
    storage
        .record_success_batch(ChannelId(1), &[])
        .await
        .expect("success");
    storage
        .record_mapping_batch(MessageId(1), ChannelId(1), &[])
        .await
        .expect("mapping");
    assert!(storage
        .get_destination_mappings(MessageId(1))
        .await
        .expect("mappings")
        .is_empty());
}
