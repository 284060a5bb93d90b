//! Per-record write serialization

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Lazily created per-id async mutexes.
///
/// Entries are dropped again once no guard or waiter references them, so the
/// map only holds ids with a mutation in flight.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`
    pub async fn lock(&self, id: Uuid) -> KeyGuard {
        let mutex = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            id,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of ids currently locked or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one id; may be moved into a spawned task
#[derive(Debug)]
pub struct KeyGuard {
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl KeyGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
