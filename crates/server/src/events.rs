use std::time::Duration;

use mirror::EventPredicate;
use shared::protocol::{PlatformEvent, PlatformEventKind};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

/// In-process fan-out of ingested gateway events to anyone waiting on one.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<PlatformEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns how many waiters saw the event.
    pub fn publish(&self, event: PlatformEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub async fn wait_for(
        &self,
        kind: PlatformEventKind,
        predicate: EventPredicate,
        timeout: Duration,
    ) -> Option<PlatformEvent> {
        let mut receiver = self.sender.subscribe();
        let wait = async {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.kind() == kind && predicate(&event) => return Some(event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event waiter lagged behind ingest");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}
