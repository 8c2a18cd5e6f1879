use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{
    ChannelId, GuildId, LinkPair, MessageId, MirrorDestination, MirrorLink, MirroredMessagePair,
    NewMirrorLink,
};

/// Persistent mirror links and message pairs.
#[async_trait]
pub trait MirrorTopology: Send + Sync {
    /// Enabled legacy destinations of `source`.
    async fn list_destinations(&self, source: ChannelId) -> Result<Vec<MirrorDestination>>;

    async fn record_success_batch(&self, source: ChannelId, destinations: &[ChannelId])
        -> Result<()>;

    async fn record_failure_batch(&self, source: ChannelId, destinations: &[ChannelId])
        -> Result<()>;

    async fn get_destination_mappings(
        &self,
        source_message: MessageId,
    ) -> Result<Vec<MirroredMessagePair>>;

    /// `pairs` holds `(destination_message_id, destination_channel_id)`.
    async fn record_mapping_batch(
        &self,
        source_message: MessageId,
        source_channel: ChannelId,
        pairs: &[(MessageId, ChannelId)],
    ) -> Result<()>;

    async fn links_over_error_threshold(&self, threshold: i64) -> Result<Vec<MirrorLink>>;

    async fn disable_links_over_error_threshold(&self, threshold: i64) -> Result<Vec<MirrorLink>>;

    async fn list_source_channels(&self, legacy: bool) -> Result<HashSet<ChannelId>>;

    async fn list_sources(&self, destination: ChannelId, legacy: bool) -> Result<Vec<ChannelId>>;

    async fn list_destination_ids(&self, source: ChannelId, legacy: bool)
        -> Result<Vec<ChannelId>>;

    /// Inserts the link or overwrites the existing row for the same pair.
    async fn add_link(&self, link: &NewMirrorLink) -> Result<()>;

    /// Inserts a non-legacy link unless the pair is already known.
    async fn record_traced_link(
        &self,
        source: ChannelId,
        destination: ChannelId,
        destination_server: Option<GuildId>,
    ) -> Result<bool>;

    async fn disable_link(&self, source: ChannelId, destination: ChannelId) -> Result<()>;

    async fn undo_auto_disable(&self, since: DateTime<Utc>) -> Result<Vec<LinkPair>>;

    async fn prune_mappings(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
