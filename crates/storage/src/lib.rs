use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror::MirrorTopology;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    ChannelId, GuildId, LinkPair, MessageId, MirrorDestination, MirrorLink, MirroredMessagePair,
    NewMirrorLink, RoleId,
};

const LINK_COLUMNS: &str = "source_channel_id, destination_channel_id, destination_server_id, \
     is_legacy, enabled, role_mention_id, consecutive_error_count, disabled_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn get_link(
        &self,
        source: ChannelId,
        destination: ChannelId,
    ) -> Result<Option<MirrorLink>> {
        let row = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM mirror_links
             WHERE source_channel_id = ? AND destination_channel_id = ?"
        ))
        .bind(source.0)
        .bind(destination.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| link_from_row(&r)))
    }

    /// Soft-disables every enabled link pointing at `destination`.
    pub async fn disable_all_links_to(&self, destination: ChannelId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE mirror_links SET enabled = 0
             WHERE destination_channel_id = ? AND enabled = 1",
        )
        .bind(destination.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_legacy(
        &self,
        source: ChannelId,
        destination: ChannelId,
        legacy: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE mirror_links SET is_legacy = ?
             WHERE source_channel_id = ? AND destination_channel_id = ?",
        )
        .bind(legacy)
        .bind(source.0)
        .bind(destination.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Counts enabled destinations of `source`; `legacy = None` counts both kinds.
    pub async fn count_destinations(&self, source: ChannelId, legacy: Option<bool>) -> Result<i64> {
        let count = match legacy {
            Some(legacy) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM mirror_links
                     WHERE source_channel_id = ? AND enabled = 1 AND is_legacy = ?",
                )
                .bind(source.0)
                .bind(legacy)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM mirror_links
                     WHERE source_channel_id = ? AND enabled = 1",
                )
                .bind(source.0)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count)
    }

    pub async fn count_links(&self, legacy: Option<bool>) -> Result<i64> {
        let count = match legacy {
            Some(legacy) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM mirror_links WHERE is_legacy = ?")
                    .bind(legacy)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM mirror_links")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    /// Links switched off by the error threshold at or after `since`.
    pub async fn links_disabled_since(&self, since: DateTime<Utc>) -> Result<Vec<MirrorLink>> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM mirror_links
             WHERE enabled = 0 AND disabled_at IS NOT NULL AND disabled_at >= ?
             ORDER BY disabled_at ASC"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(link_from_row).collect())
    }

    pub async fn record_mapping_batch_at(
        &self,
        source_message: MessageId,
        source_channel: ChannelId,
        pairs: &[(MessageId, ChannelId)],
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (destination_message, destination_channel) in pairs {
            sqlx::query(
                "INSERT INTO mirrored_messages
                    (destination_channel_id, destination_message_id, source_channel_id, source_message_id, created_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(destination_channel_id, destination_message_id) DO UPDATE SET
                    source_channel_id = excluded.source_channel_id,
                    source_message_id = excluded.source_message_id,
                    created_at = excluded.created_at",
            )
            .bind(destination_channel.0)
            .bind(destination_message.0)
            .bind(source_channel.0)
            .bind(source_message.0)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_error_counters(
        &self,
        source: ChannelId,
        destinations: &[ChannelId],
        statement: &str,
    ) -> Result<()> {
        if destinations.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for destination in destinations {
            sqlx::query(statement)
                .bind(source.0)
                .bind(destination.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn link_from_row(r: &SqliteRow) -> MirrorLink {
    MirrorLink {
        source_channel_id: ChannelId(r.get::<i64, _>(0)),
        destination_channel_id: ChannelId(r.get::<i64, _>(1)),
        destination_server_id: r.get::<Option<i64>, _>(2).map(GuildId),
        is_legacy: r.get::<bool, _>(3),
        enabled: r.get::<bool, _>(4),
        role_mention_id: role_from_column(r.get::<Option<i64>, _>(5)),
        consecutive_error_count: r.get::<i64, _>(6),
        disabled_at: r.get::<Option<DateTime<Utc>>, _>(7),
    }
}

/// Role id 0 is stored by older rows to mean "no mention".
fn role_from_column(value: Option<i64>) -> Option<RoleId> {
    value.filter(|id| *id != 0).map(RoleId)
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[async_trait]
impl MirrorTopology for Storage {
    async fn list_destinations(&self, source: ChannelId) -> Result<Vec<MirrorDestination>> {
        let rows = sqlx::query(
            "SELECT destination_channel_id, role_mention_id FROM mirror_links
             WHERE source_channel_id = ? AND is_legacy = 1 AND enabled = 1
             ORDER BY destination_channel_id ASC",
        )
        .bind(source.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list mirror destinations")?;
        Ok(rows
            .into_iter()
            .map(|r| MirrorDestination {
                channel_id: ChannelId(r.get::<i64, _>(0)),
                role_mention_id: role_from_column(r.get::<Option<i64>, _>(1)),
            })
            .collect())
    }

    async fn record_success_batch(
        &self,
        source: ChannelId,
        destinations: &[ChannelId],
    ) -> Result<()> {
        self.update_error_counters(
            source,
            destinations,
            "UPDATE mirror_links SET consecutive_error_count = 0
             WHERE source_channel_id = ? AND destination_channel_id = ?
               AND is_legacy = 1 AND enabled = 1",
        )
        .await
        .context("failed to record mirror successes")
    }

    async fn record_failure_batch(
        &self,
        source: ChannelId,
        destinations: &[ChannelId],
    ) -> Result<()> {
        self.update_error_counters(
            source,
            destinations,
            "UPDATE mirror_links SET consecutive_error_count = consecutive_error_count + 1
             WHERE source_channel_id = ? AND destination_channel_id = ?
               AND is_legacy = 1 AND enabled = 1",
        )
        .await
        .context("failed to record mirror failures")
    }

    async fn get_destination_mappings(
        &self,
        source_message: MessageId,
    ) -> Result<Vec<MirroredMessagePair>> {
        let rows = sqlx::query(
            "SELECT destination_channel_id, destination_message_id, source_channel_id, source_message_id, created_at
             FROM mirrored_messages WHERE source_message_id = ?
             ORDER BY destination_channel_id ASC",
        )
        .bind(source_message.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to load message mappings")?;
        Ok(rows
            .into_iter()
            .map(|r| MirroredMessagePair {
                destination_channel_id: ChannelId(r.get::<i64, _>(0)),
                destination_message_id: MessageId(r.get::<i64, _>(1)),
                source_channel_id: ChannelId(r.get::<i64, _>(2)),
                source_message_id: MessageId(r.get::<i64, _>(3)),
                created_at: r.get::<DateTime<Utc>, _>(4),
            })
            .collect())
    }

    async fn record_mapping_batch(
        &self,
        source_message: MessageId,
        source_channel: ChannelId,
        pairs: &[(MessageId, ChannelId)],
    ) -> Result<()> {
        self.record_mapping_batch_at(source_message, source_channel, pairs, Utc::now())
            .await
            .context("failed to record message mappings")
    }

    async fn links_over_error_threshold(&self, threshold: i64) -> Result<Vec<MirrorLink>> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM mirror_links
             WHERE is_legacy = 1 AND enabled = 1 AND consecutive_error_count >= ?
             ORDER BY source_channel_id, destination_channel_id"
        ))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(link_from_row).collect())
    }

    async fn disable_links_over_error_threshold(&self, threshold: i64) -> Result<Vec<MirrorLink>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM mirror_links
             WHERE is_legacy = 1 AND enabled = 1 AND consecutive_error_count >= ?
             ORDER BY source_channel_id, destination_channel_id"
        ))
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await?;
        let mut disabled: Vec<MirrorLink> = rows.iter().map(link_from_row).collect();
        for link in &mut disabled {
            sqlx::query(
                "UPDATE mirror_links SET enabled = 0, disabled_at = ?
                 WHERE source_channel_id = ? AND destination_channel_id = ?",
            )
            .bind(now)
            .bind(link.source_channel_id.0)
            .bind(link.destination_channel_id.0)
            .execute(&mut *tx)
            .await?;
            link.enabled = false;
            link.disabled_at = Some(now);
        }
        tx.commit().await?;
        Ok(disabled)
    }

    async fn list_source_channels(&self, legacy: bool) -> Result<HashSet<ChannelId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT source_channel_id FROM mirror_links
             WHERE is_legacy = ? AND enabled = 1",
        )
        .bind(legacy)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ChannelId(r.get::<i64, _>(0)))
            .collect())
    }

    async fn list_sources(&self, destination: ChannelId, legacy: bool) -> Result<Vec<ChannelId>> {
        let rows = sqlx::query(
            "SELECT source_channel_id FROM mirror_links
             WHERE destination_channel_id = ? AND is_legacy = ? AND enabled = 1
             ORDER BY source_channel_id ASC",
        )
        .bind(destination.0)
        .bind(legacy)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ChannelId(r.get::<i64, _>(0)))
            .collect())
    }

    async fn list_destination_ids(
        &self,
        source: ChannelId,
        legacy: bool,
    ) -> Result<Vec<ChannelId>> {
        let rows = sqlx::query(
            "SELECT destination_channel_id FROM mirror_links
             WHERE source_channel_id = ? AND is_legacy = ? AND enabled = 1
             ORDER BY destination_channel_id ASC",
        )
        .bind(source.0)
        .bind(legacy)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ChannelId(r.get::<i64, _>(0)))
            .collect())
    }

    async fn add_link(&self, link: &NewMirrorLink) -> Result<()> {
        sqlx::query(
            "INSERT INTO mirror_links
                (source_channel_id, destination_channel_id, destination_server_id, is_legacy, enabled, role_mention_id)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_channel_id, destination_channel_id) DO UPDATE SET
                destination_server_id = excluded.destination_server_id,
                is_legacy = excluded.is_legacy,
                enabled = excluded.enabled,
                role_mention_id = excluded.role_mention_id,
                consecutive_error_count = 0,
                disabled_at = NULL",
        )
        .bind(link.source_channel_id.0)
        .bind(link.destination_channel_id.0)
        .bind(link.destination_server_id.map(|id| id.0))
        .bind(link.is_legacy)
        .bind(link.enabled)
        .bind(link.role_mention_id.map(|id| id.0))
        .execute(&self.pool)
        .await
        .context("failed to add mirror link")?;
        Ok(())
    }

    async fn record_traced_link(
        &self,
        source: ChannelId,
        destination: ChannelId,
        destination_server: Option<GuildId>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO mirror_links
                (source_channel_id, destination_channel_id, destination_server_id, is_legacy, enabled)
             VALUES (?, ?, ?, 0, 1)
             ON CONFLICT(source_channel_id, destination_channel_id) DO NOTHING",
        )
        .bind(source.0)
        .bind(destination.0)
        .bind(destination_server.map(|id| id.0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn disable_link(&self, source: ChannelId, destination: ChannelId) -> Result<()> {
        sqlx::query(
            "UPDATE mirror_links SET enabled = 0
             WHERE source_channel_id = ? AND destination_channel_id = ? AND enabled = 1",
        )
        .bind(source.0)
        .bind(destination.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn undo_auto_disable(&self, since: DateTime<Utc>) -> Result<Vec<LinkPair>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT source_channel_id, destination_channel_id FROM mirror_links
             WHERE enabled = 0 AND disabled_at IS NOT NULL AND disabled_at >= ?
             ORDER BY source_channel_id, destination_channel_id",
        )
        .bind(since)
        .fetch_all(&mut *tx)
        .await?;
        let restored: Vec<LinkPair> = rows
            .into_iter()
            .map(|r| LinkPair {
                source_channel_id: ChannelId(r.get::<i64, _>(0)),
                destination_channel_id: ChannelId(r.get::<i64, _>(1)),
            })
            .collect();
        for pair in &restored {
            sqlx::query(
                "UPDATE mirror_links
                 SET enabled = 1, disabled_at = NULL, consecutive_error_count = 0
                 WHERE source_channel_id = ? AND destination_channel_id = ?",
            )
            .bind(pair.source_channel_id.0)
            .bind(pair.destination_channel_id.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(restored)
    }

    async fn prune_mappings(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mirrored_messages WHERE created_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .context("failed to prune message mappings")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
