//! Per-request locks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use certa_common::ids::RequestId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<RequestId, Arc<AsyncMutex<()>>>>,
}

/// Exclusive hold on one request id. Released on drop.
#[derive(Debug)]
pub struct RequestLock {
    table: Arc<LockTable>,
    id: RequestId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait up to `timeout` for the lock on `id`. `None` on timeout.
    pub async fn acquire(self: &Arc<Self>, id: RequestId, timeout: Duration) -> Option<RequestLock> {
        let mutex = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone();

        let acquired = tokio::time::timeout(timeout, mutex.lock_owned()).await;
        match acquired {
            Ok(guard) => {
                trace!(%id, "Request locked");
                Some(RequestLock {
                    table: self.clone(),
                    id,
                    guard: Some(guard),
                })
            }
            Err(_) => {
                self.cleanup(id);
                None
            }
        }
    }

    /// Drop the entry for `id` once nobody holds or waits for it.
    fn cleanup(&self, id: RequestId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&id).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(&id);
        }
    }

    /// Number of ids with a holder or waiter.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RequestLock {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for RequestLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table.cleanup(self.id);
        trace!(id = %self.id, "Request unlocked");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn second_holder_waits_for_first() {
        let table = LockTable::new();
        let id = RequestId::new(1);

        let first = table.acquire(id, Duration::from_millis(10)).await.unwrap();
        assert!(table.acquire(id, Duration::from_millis(20)).await.is_none());

        let waiter = tokio::spawn({
            let table = table.clone();
            async move { table.acquire(id, Duration::from_secs(1)).await.is_some() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(first);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn entries_are_removed_when_unused() {
        let table = LockTable::new();
        let a = table.acquire(RequestId::new(1), Duration::from_millis(10)).await.unwrap();
        let b = table.acquire(RequestId::new(2), Duration::from_millis(10)).await.unwrap();
        assert_eq!(table.len(), 2);

        drop(a);
        assert_eq!(table.len(), 1);
        drop(b);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn timed_out_waiter_leaves_entry_to_holder() {
        let table = LockTable::new();
        let id = RequestId::new(3);
        let held = table.acquire(id, Duration::from_millis(10)).await.unwrap();
        assert!(table.acquire(id, Duration::from_millis(5)).await.is_none());
        assert_eq!(table.len(), 1);
        drop(held);
        assert!(table.is_empty());
    }
}
