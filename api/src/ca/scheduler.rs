//! Admission control for service invocations.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use certa_common::ids::RequestId;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

#[async_trait]
pub trait RequestScheduler: Send + Sync + fmt::Debug {
    /// Wait until `id` may run its service.
    async fn admit(&self, id: RequestId);

    /// Give back the slot taken by `admit`. Releasing an id that holds no
    /// slot does nothing.
    fn release(&self, id: RequestId);
}

/// Holds a scheduler slot and releases it when dropped, including when the
/// service future is cancelled by a timeout.
pub struct Admission {
    scheduler: Arc<dyn RequestScheduler>,
    id: RequestId,
}

impl Admission {
    pub async fn acquire(scheduler: Arc<dyn RequestScheduler>, id: RequestId) -> Self {
        scheduler.admit(id).await;
        Self { scheduler, id }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.scheduler.release(self.id);
    }
}

/// Admits everything immediately.
#[derive(Debug, Default)]
pub struct NoopScheduler;

#[async_trait]
impl RequestScheduler for NoopScheduler {
    async fn admit(&self, _id: RequestId) {}

    fn release(&self, _id: RequestId) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub admitted: u64,
    pub released: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
    /// Total time spent waiting for a slot, in microseconds
    pub queued_wait_us: u64,
}

/// Bounds how many requests run a service at once. Waiters are admitted in
/// arrival order.
pub struct ThrottlingScheduler {
    slots: Semaphore,
    holders: Mutex<HashSet<RequestId>>,
    admitted: AtomicU64,
    released: AtomicU64,
    peak: AtomicU64,
    queued_wait_us: AtomicU64,
}

impl fmt::Debug for ThrottlingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottlingScheduler")
            .field("available", &self.slots.available_permits())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ThrottlingScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: Semaphore::new(max_concurrent.max(1)),
            holders: Mutex::new(HashSet::new()),
            admitted: AtomicU64::new(0),
            released: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            queued_wait_us: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let in_flight = self
            .holders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64;
        SchedulerStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            in_flight,
            peak_in_flight: self.peak.load(Ordering::Relaxed),
            queued_wait_us: self.queued_wait_us.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl RequestScheduler for ThrottlingScheduler {
    async fn admit(&self, id: RequestId) {
        let started = Instant::now();
        match self.slots.acquire().await {
            // The slot is handed back explicitly in `release`.
            Ok(permit) => permit.forget(),
            Err(_) => debug!(%id, "Scheduler closed, admitting without a slot"),
        }
        let waited = started.elapsed().as_micros() as u64;
        self.queued_wait_us.fetch_add(waited, Ordering::Relaxed);
        self.admitted.fetch_add(1, Ordering::Relaxed);

        let in_flight = {
            let mut holders = self.holders.lock().unwrap_or_else(PoisonError::into_inner);
            holders.insert(id);
            holders.len() as u64
        };
        self.peak.fetch_max(in_flight, Ordering::Relaxed);
        trace!(%id, in_flight, waited_us = waited, "Request admitted");
    }

    fn release(&self, id: RequestId) {
        let held = self
            .holders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if held {
            self.slots.add_permits(1);
            self.released.fetch_add(1, Ordering::Relaxed);
            trace!(%id, "Request released");
        }
    }
}
