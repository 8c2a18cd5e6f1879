use std::{sync::Arc, time::Duration};

use tokio::{
    runtime::Handle,
    sync::{OwnedSemaphorePermit, Semaphore},
};

/// Bounds outbound platform calls to `permits` per rolling `period`.
///
/// A permit is returned to the pool only once `period` has passed after it was
/// dropped, so at most `permits` calls can start inside any window of that length.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    period: Duration,
}

#[derive(Debug)]
pub struct RatePermit {
    permit: Option<OwnedSemaphorePermit>,
    period: Duration,
}

impl RateLimiter {
    pub fn new(permits: usize, period: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
            period,
        }
    }

    pub async fn acquire(&self) -> RatePermit {
        // The semaphore is never closed, so a failed acquire only means "no gate".
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        RatePermit {
            permit,
            period: self.period,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if self.period.is_zero() {
            return;
        }
        let period = self.period;
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(period).await;
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/rate_limit_tests.rs"]
mod tests;
