use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mirror::{maintenance::prune_once, MirrorTopology};
use shared::domain::{ChannelId, GuildId, NewMirrorLink, RoleId};
use storage::Storage;

/// Offline administration of mirror links.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/relay.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Adds a link, or overwrites the existing one for the same pair.
    AddLink {
        source_channel_id: i64,
        destination_channel_id: i64,
        destination_server_id: i64,
        #[arg(long)]
        role_mention_id: Option<i64>,
        /// Store as a followed (non-legacy) link.
        #[arg(long)]
        followed: bool,
    },
    DisableLink {
        source_channel_id: i64,
        destination_channel_id: i64,
    },
    /// Disables every link into a destination channel.
    DisableDestination {
        destination_channel_id: i64,
    },
    SetLegacy {
        source_channel_id: i64,
        destination_channel_id: i64,
        #[arg(action = clap::ArgAction::Set)]
        legacy: bool,
    },
    Sources {
        destination_channel_id: i64,
    },
    /// Lists the enabled destinations of a source channel.
    Destinations {
        source_channel_id: i64,
    },
    /// Counts enabled links, or the destinations of one source channel.
    Count {
        source_channel_id: Option<i64>,
    },
    /// Lists links auto-disabled since an RFC 3339 timestamp.
    DisabledSince {
        since: DateTime<Utc>,
    },
    UndoAutoDisable {
        since: DateTime<Utc>,
    },
    /// Deletes message pairs older than the retention window.
    Prune {
        #[arg(long, default_value_t = 21)]
        retention_days: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::AddLink {
            source_channel_id,
            destination_channel_id,
            destination_server_id,
            role_mention_id,
            followed,
        } => {
            storage
                .add_link(&NewMirrorLink {
                    source_channel_id: ChannelId(source_channel_id),
                    destination_channel_id: ChannelId(destination_channel_id),
                    destination_server_id: Some(GuildId(destination_server_id)),
                    is_legacy: !followed,
                    enabled: true,
                    role_mention_id: role_mention_id.map(RoleId),
                })
                .await?;
            println!("linked {source_channel_id} -> {destination_channel_id}");
        }
        Command::DisableLink {
            source_channel_id,
            destination_channel_id,
        } => {
            storage
                .disable_link(
                    ChannelId(source_channel_id),
                    ChannelId(destination_channel_id),
                )
                .await?;
            println!("disabled {source_channel_id} -> {destination_channel_id}");
        }
        Command::DisableDestination {
            destination_channel_id,
        } => {
            let disabled = storage
                .disable_all_links_to(ChannelId(destination_channel_id))
                .await?;
            println!("disabled {disabled} links into {destination_channel_id}");
        }
        Command::SetLegacy {
            source_channel_id,
            destination_channel_id,
            legacy,
        } => {
            let updated = storage
                .set_legacy(
                    ChannelId(source_channel_id),
                    ChannelId(destination_channel_id),
                    legacy,
                )
                .await?;
            if updated {
                println!("{source_channel_id} -> {destination_channel_id} legacy={legacy}");
            } else {
                println!("no link {source_channel_id} -> {destination_channel_id}");
            }
        }
        Command::Sources {
            destination_channel_id,
        } => {
            let destination = ChannelId(destination_channel_id);
            let legacy = storage.list_sources(destination, true).await?;
            let followed = storage.list_sources(destination, false).await?;
            println!("legacy sources: {}", join_ids(&legacy));
            println!("followed sources: {}", join_ids(&followed));
        }
        Command::Destinations { source_channel_id } => {
            let source = ChannelId(source_channel_id);
            let legacy = storage.list_destination_ids(source, true).await?;
            let followed = storage.list_destination_ids(source, false).await?;
            println!("legacy destinations: {}", join_ids(&legacy));
            println!("followed destinations: {}", join_ids(&followed));
        }
        Command::Count {
            source_channel_id: Some(source_channel_id),
        } => {
            let source = ChannelId(source_channel_id);
            let legacy = storage.count_destinations(source, Some(true)).await?;
            let all = storage.count_destinations(source, None).await?;
            println!("{source_channel_id}: {legacy} legacy of {all} enabled destinations");
        }
        Command::Count {
            source_channel_id: None,
        } => {
            let legacy = storage.count_links(Some(true)).await?;
            let all = storage.count_links(None).await?;
            println!("{legacy} legacy of {all} links");
        }
        Command::DisabledSince { since } => {
            for link in storage.links_disabled_since(since).await? {
                let disabled_at = link
                    .disabled_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default();
                println!(
                    "{} -> {} errors={} disabled_at={disabled_at}",
                    link.source_channel_id, link.destination_channel_id, link.consecutive_error_count
                );
            }
        }
        Command::UndoAutoDisable { since } => {
            let restored = storage.undo_auto_disable(since).await?;
            for pair in &restored {
                println!(
                    "re-enabled {} -> {}",
                    pair.source_channel_id, pair.destination_channel_id
                );
            }
            println!("re-enabled {} links", restored.len());
        }
        Command::Prune { retention_days } => {
            let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
            let pruned = prune_once(&storage, retention).await?;
            println!("pruned {pruned} message pairs");
        }
    }

    Ok(())
}

fn join_ids(ids: &[ChannelId]) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter()
        .map(ChannelId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
