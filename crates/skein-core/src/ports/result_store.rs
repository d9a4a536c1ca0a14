//! ResultStore port - task outcomes keyed by task id.
//!
//! - `put` overwrites non-terminal records; rewriting a terminal record with a
//!   different status is refused with `ResultImmutable`
//! - `get` treats expired records as absent
//! - per-key last-write-wins; no cross-key consistency

use async_trait::async_trait;

use crate::domain::{ResultRecord, ResultStoreError, TaskId};

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, record: ResultRecord) -> Result<(), ResultStoreError>;

    /// `Ok(None)` for unknown or expired ids.
    async fn get(&self, task_id: TaskId) -> Result<Option<ResultRecord>, ResultStoreError>;

    /// Delete expired records. Returns how many were removed.
    async fn sweep_expired(&self) -> Result<usize, ResultStoreError>;
}
