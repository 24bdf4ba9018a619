use std::sync::Arc;

use certa_db::{
    models::DbSerialRange,
    storage::{SerialStore, Storage, StoreError},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("Serial range {counter} is exhausted (last number {end:#x})")]
    Exhausted { counter: String, end: u64 },

    #[error("Serial range {0} is not configured")]
    NotConfigured(String),

    #[error("Invalid serial range: {0}")]
    InvalidRange(String),

    #[error("Serial range {counter} would hand out {next:#x} again")]
    WouldReuse { counter: String, next: u64 },

    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for SerialError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::RangeExhausted { name, end } => Self::Exhausted { counter: name, end },
            StoreError::RangeNotConfigured(name) => Self::NotConfigured(name),
            StoreError::InvalidRange(reason) => Self::InvalidRange(reason),
            StoreError::RangeWouldReuse { name, next } => Self::WouldReuse {
                counter: name,
                next,
            },
            other => Self::Storage(other),
        }
    }
}

/// Hands out numbers from one persisted counter. Allocation is a single
/// atomic increment in the store, independent of any request lock.
#[derive(Debug, Clone)]
pub struct SerialAllocator {
    db: Arc<dyn Storage>,
    counter: String,
}

impl SerialAllocator {
    pub fn new(db: Arc<dyn Storage>, counter: impl Into<String>) -> Self {
        Self {
            db,
            counter: counter.into(),
        }
    }

    pub fn counter(&self) -> &str {
        &self.counter
    }

    /// Write the initial range unless one is persisted already.
    #[instrument(skip(self), fields(counter = %self.counter))]
    pub async fn init(&self, start: u64, end: u64) -> Result<DbSerialRange, SerialError> {
        let range = SerialStore::init_range(&*self.db, &self.counter, start, end).await?;
        if range.start != start || range.end != end {
            info!(
                start = range.start,
                end = range.end,
                next = range.next,
                "Keeping persisted serial range"
            );
        }
        Ok(range)
    }

    #[instrument(skip(self), fields(counter = %self.counter))]
    pub async fn next(&self) -> Result<u64, SerialError> {
        SerialStore::next(&*self.db, &self.counter)
            .await
            .map_err(|e| {
                if matches!(e, StoreError::RangeExhausted { .. }) {
                    warn!("Serial range exhausted");
                }
                e.into()
            })
    }

    pub async fn range(&self) -> Result<DbSerialRange, SerialError> {
        SerialStore::get_range(&*self.db, &self.counter)
            .await?
            .ok_or_else(|| SerialError::NotConfigured(self.counter.clone()))
    }

    /// Administrative reset. Refuses anything that could hand out a number
    /// twice.
    #[instrument(skip(self), fields(counter = %self.counter))]
    pub async fn reset_range(&self, start: u64, end: u64) -> Result<DbSerialRange, SerialError> {
        if start == 0 {
            return Err(SerialError::InvalidRange("numbering starts at 1".into()));
        }
        let range = SerialStore::reset_range(&*self.db, &self.counter, start, end).await?;
        info!(start, end, "Serial range reset");
        Ok(range)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use certa_db::storage::memory::MemoryStorage;

    use super::*;

    fn allocator() -> SerialAllocator {
        SerialAllocator::new(Arc::new(MemoryStorage::new()), "certificates")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocation_is_distinct_and_bounded() {
        let serials = allocator();
        serials.init(0x10, 0x10 + 99).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let serials = serials.clone();
            tasks.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..12 {
                    match serials.next().await {
                        Ok(n) => got.push(n),
                        Err(SerialError::Exhausted { .. }) => break,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                got
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let distinct: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 100);
        assert_eq!(distinct.len(), 100);
        assert!(all.iter().all(|n| (0x10..=0x10 + 99).contains(n)));
    }

    #[tokio::test]
    async fn unconfigured_counter_is_reported() {
        let serials = allocator();
        assert!(matches!(
            serials.next().await,
            Err(SerialError::NotConfigured(_))
        ));
        assert!(matches!(
            serials.range().await,
            Err(SerialError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn reset_maps_store_errors() {
        let serials = allocator();
        serials.init(1, 10).await.unwrap();
        serials.next().await.unwrap();
        serials.next().await.unwrap();

        assert!(matches!(
            serials.reset_range(2, 20).await,
            Err(SerialError::WouldReuse { next: 3, .. })
        ));
        assert!(matches!(
            serials.reset_range(30, 20).await,
            Err(SerialError::InvalidRange(_))
        ));

        let range = serials.reset_range(3, 20).await.unwrap();
        assert_eq!(range.next, 3);
        assert_eq!(serials.next().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reset_initialises_missing_range() {
        let serials = allocator();
        assert!(matches!(
            serials.reset_range(0, 6).await,
            Err(SerialError::InvalidRange(_))
        ));
        assert!(serials.range().await.is_err());

        serials.reset_range(5, 6).await.unwrap();
        assert_eq!(serials.next().await.unwrap(), 5);
        assert_eq!(serials.next().await.unwrap(), 6);
        assert!(matches!(
            serials.next().await,
            Err(SerialError::Exhausted { end: 6, .. })
        ));
    }
}
