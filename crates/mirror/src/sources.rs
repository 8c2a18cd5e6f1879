use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use anyhow::Result;
use shared::domain::{ChannelId, MessageSnapshot};
use tracing::{debug, info, warn};

use crate::{rate_limit::RateLimiter, topology::MirrorTopology};

/// Cached view of which channels feed mirrors.
///
/// Gateway events from channels outside `legacy` are ignored. `followed` also
/// holds sources of platform-native follows, which are only traced.
pub struct SourceChannels {
    topology: Arc<dyn MirrorTopology>,
    legacy: RwLock<HashSet<ChannelId>>,
    followed: RwLock<HashSet<ChannelId>>,
    traced: Mutex<HashMap<ChannelId, HashSet<ChannelId>>>,
    /// Tracing is best effort and gets its own slow lane.
    trace_limiter: RateLimiter,
}

impl SourceChannels {
    pub fn new(topology: Arc<dyn MirrorTopology>) -> Self {
        Self {
            topology,
            legacy: RwLock::default(),
            followed: RwLock::default(),
            traced: Mutex::default(),
            trace_limiter: RateLimiter::new(1, Duration::from_secs(1)),
        }
    }

    /// Reloads both source sets from the repository. Returns the legacy count.
    pub async fn refresh(&self) -> Result<usize> {
        let legacy = self.topology.list_source_channels(true).await?;
        let non_legacy = self.topology.list_source_channels(false).await?;
        let followed: HashSet<_> = legacy.union(&non_legacy).copied().collect();
        let count = legacy.len();
        *self.legacy.write().unwrap_or_else(PoisonError::into_inner) = legacy;
        *self.followed.write().unwrap_or_else(PoisonError::into_inner) = followed;
        debug!(legacy = count, "source channels refreshed");
        Ok(count)
    }

    pub fn is_source(&self, channel_id: ChannelId) -> bool {
        self.legacy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&channel_id)
    }

    pub fn insert(&self, channel_id: ChannelId) {
        self.legacy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id);
        self.followed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id);
    }

    /// Records the link implied by a followed copy of a source message.
    ///
    /// Returns true when a new link was stored.
    pub async fn trace_crosspost(&self, message: &MessageSnapshot) -> bool {
        if !message.flags.is_crosspost {
            return false;
        }
        let Some(reference) = message.reference else {
            return false;
        };
        let source = reference.channel_id;
        let destination = message.channel_id;
        let followed = self
            .followed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&source);
        if !followed || self.already_traced(source, destination) {
            return false;
        }

        let _permit = self.trace_limiter.acquire().await;
        match self
            .topology
            .record_traced_link(source, destination, message.guild_id)
            .await
        {
            Ok(inserted) => {
                self.traced
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(source)
                    .or_default()
                    .insert(destination);
                if inserted {
                    info!(%source, %destination, "traced followed mirror");
                }
                inserted
            }
            Err(error) => {
                warn!(%source, %destination, error = %format!("{error:#}"), "could not record traced mirror");
                false
            }
        }
    }

    fn already_traced(&self, source: ChannelId, destination: ChannelId) -> bool {
        self.traced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&source)
            .is_some_and(|destinations| destinations.contains(&destination))
    }
}
