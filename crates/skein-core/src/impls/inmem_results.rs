//! In-memory result store with lazy expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{ResultRecord, ResultStoreError, TaskId};
use crate::ports::{Clock, ResultStore, SystemClock};

pub struct InMemoryResultStore {
    records: RwLock<HashMap<TaskId, ResultRecord>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryResultStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage. While unavailable every call fails with
    /// `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Stored records, expired ones included.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), ResultStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ResultStoreError::Unavailable("in-memory result store offline".into()))
        }
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, record: ResultRecord) -> Result<(), ResultStoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut records = self.records.write().await;

        if let Some(current) = records.get(&record.task_id())
            && current.is_terminal()
            && !current.is_expired(now)
        {
            if current.status() == record.status() {
                // Same terminal status again (duplicate delivery): first write stands.
                return Ok(());
            }
            return Err(ResultStoreError::ResultImmutable {
                task_id: record.task_id(),
                current: current.status(),
                attempted: record.status(),
            });
        }
        records.insert(record.task_id(), record);
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<ResultRecord>, ResultStoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let records = self.records.read().await;
        Ok(records
            .get(&task_id)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn sweep_expired(&self) -> Result<usize, ResultStoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok(before - records.len())
    }
}
