use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::topology::MirrorTopology;

/// Deletes message pairs older than `retention`.
pub async fn prune_once(topology: &dyn MirrorTopology, retention: Duration) -> Result<u64> {
    let retention = chrono::Duration::from_std(retention).context("retention out of range")?;
    let cutoff = Utc::now() - retention;
    let pruned = topology.prune_mappings(cutoff).await?;
    info!(pruned, %cutoff, "pruned mirrored message pairs");
    Ok(pruned)
}

/// Runs [`prune_once`] every `interval`, starting after a random 2 to 30 minute delay.
pub fn spawn_mapping_prune(
    topology: Arc<dyn MirrorTopology>,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let initial = Duration::from_secs(fastrand::u64(120..=1800));
        tokio::time::sleep(initial).await;
        loop {
            if let Err(err) = prune_once(topology.as_ref(), retention).await {
                error!(error = %format!("{err:#}"), "mirrored message prune failed");
            }
            tokio::time::sleep(interval).await;
        }
    })
}
