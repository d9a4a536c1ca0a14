//! Broker port - named queues with acknowledgement.
//!
//! Queue semantics every backend must provide:
//! - FIFO per queue among envelopes whose not-before time has passed
//! - an envelope is pending, in flight, or removed; never two at once
//! - removal only through `acknowledge`
//! - safe to share between any number of workers; no lock is held across a
//!   dequeue → execute → acknowledge cycle

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{BrokerError, Envelope, TaskId};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append to the envelope's queue (`envelope.queue`).
    async fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError>;

    /// Take the oldest eligible envelope from `queue` and move it in flight.
    /// Returns `Ok(None)` when nothing became eligible within `timeout`.
    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Envelope>, BrokerError> {
        self.dequeue_any(&[queue], timeout).await
    }

    /// Like `dequeue`, over several queues in priority order: the first queue
    /// with an eligible envelope wins.
    async fn dequeue_any(
        &self,
        queues: &[&str],
        timeout: Duration,
    ) -> Result<Option<Envelope>, BrokerError>;

    /// Remove an in-flight envelope for good.
    async fn acknowledge(&self, task_id: TaskId) -> Result<(), BrokerError>;

    /// Move an in-flight envelope back to pending with `retries + 1` and a
    /// not-before of now + `delay`. Returns the new retry count.
    ///
    /// Fails with `RetriesExhausted` (leaving the envelope in flight) when the
    /// new count would exceed `max_retries`.
    async fn requeue_with_delay(&self, task_id: TaskId, delay: Duration) -> Result<u32, BrokerError>;

    /// Move an in-flight envelope back to pending after `delay` without
    /// touching its retry count (rate limiting).
    async fn defer(&self, task_id: TaskId, delay: Duration) -> Result<(), BrokerError>;

    /// Return envelopes in flight for longer than `visibility_timeout` to
    /// pending. Their worker is presumed dead.
    async fn restore_unacked(&self, visibility_timeout: Duration) -> Result<Vec<TaskId>, BrokerError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError>;
}

/// Snapshot of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Pending and eligible now.
    pub ready: usize,
    /// Pending with a future not-before time.
    pub delayed: usize,
    pub in_flight: usize,
}
