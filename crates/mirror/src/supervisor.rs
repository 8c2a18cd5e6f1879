use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::domain::MirrorOperationKind;
use thiserror::Error;
use tracing::info;

use crate::{controller::WorkController, tracker::OperationKey};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("a mirror operation is already running for message {0}")]
    Conflict(OperationKey),
    #[error("This message does not have any operations in progress")]
    NoOperation,
    #[error("Can only cancel mirror updates. This message has an operation of type '{0}' running")]
    NotCancellable(MirrorOperationKind),
}

type Operations = Arc<Mutex<HashMap<OperationKey, Arc<WorkController>>>>;

/// Process-wide registry of running operations, at most one per source message.
#[derive(Clone, Default)]
pub struct OperationSupervisor {
    operations: Operations,
}

impl OperationSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `controller` for as long as the returned guard lives.
    pub fn register(
        &self,
        controller: Arc<WorkController>,
    ) -> Result<Registration, SupervisorError> {
        let key = controller.key();
        let mut operations = lock(&self.operations);
        if operations.contains_key(&key) {
            return Err(SupervisorError::Conflict(key));
        }
        operations.insert(key, Arc::clone(&controller));
        Ok(Registration {
            key,
            controller,
            operations: Arc::clone(&self.operations),
        })
    }

    /// Cancels the running update for `key`. Other operation kinds are left alone.
    pub fn cancel(&self, key: OperationKey) -> Result<usize, SupervisorError> {
        let controller = {
            let mut operations = lock(&self.operations);
            let kind = operations
                .get(&key)
                .map(|controller| controller.kind())
                .ok_or(SupervisorError::NoOperation)?;
            if kind != MirrorOperationKind::Update {
                return Err(SupervisorError::NotCancellable(kind));
            }
            operations
                .remove(&key)
                .ok_or(SupervisorError::NoOperation)?
        };
        let cancelled = controller.cancel();
        info!(%key, cancelled, "mirror update cancelled");
        Ok(cancelled)
    }

    pub fn get(&self, key: OperationKey) -> Option<Arc<WorkController>> {
        lock(&self.operations).get(&key).cloned()
    }

    pub fn running(&self) -> Vec<OperationKey> {
        let mut keys: Vec<_> = lock(&self.operations).keys().copied().collect();
        keys.sort();
        keys
    }
}

/// Keeps an operation registered; dropping it removes the entry it created.
pub struct Registration {
    key: OperationKey,
    controller: Arc<WorkController>,
    operations: Operations,
}

impl Registration {
    pub fn controller(&self) -> &Arc<WorkController> {
        &self.controller
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut operations = lock(&self.operations);
        let ours = operations
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.controller));
        if ours {
            operations.remove(&self.key);
        }
    }
}

fn lock(
    operations: &Mutex<HashMap<OperationKey, Arc<WorkController>>>,
) -> MutexGuard<'_, HashMap<OperationKey, Arc<WorkController>>> {
    operations.lock().unwrap_or_else(PoisonError::into_inner)
}
