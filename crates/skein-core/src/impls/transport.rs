//! Transport-level retry for backend clients.
//!
//! `RetryingBroker` and `RetryingResultStore` wrap a backend and retry every
//! call that fails with a transient error (`QueueUnavailable`, store
//! `Unavailable`) with backoff, forever. Everything else is returned as is.
//! Callers above this layer never see an outage, only latency.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BrokerError, Envelope, ResultRecord, ResultStoreError, TaskId};
use crate::ports::{Broker, QueueCounts, ResultStore};
use crate::retry::RetryPolicy;

trait Transient: Display {
    fn is_transient(&self) -> bool;
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        BrokerError::is_transient(self)
    }
}

impl Transient for ResultStoreError {
    fn is_transient(&self) -> bool {
        ResultStoreError::is_transient(self)
    }
}

async fn retry_transient<T, E, F, Fut>(policy: &RetryPolicy, op: &'static str, mut call: F) -> Result<T, E>
where
    E: Transient,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Err(e) if e.is_transient() => {
                attempt = attempt.saturating_add(1);
                let delay = policy.next_delay(attempt);
                tracing::warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "backend unavailable; retrying");
                tokio::time::sleep(delay).await;
            }
            other => {
                if attempt > 0 {
                    tracing::info!(op, attempts = attempt + 1, "backend call recovered");
                }
                return other;
            }
        }
    }
}

pub struct RetryingBroker<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: Broker> RetryingBroker<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: Broker> Broker for RetryingBroker<B> {
    async fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError> {
        retry_transient(&self.policy, "enqueue", || self.inner.enqueue(envelope.clone())).await
    }

    async fn dequeue_any(
        &self,
        queues: &[&str],
        timeout: Duration,
    ) -> Result<Option<Envelope>, BrokerError> {
        retry_transient(&self.policy, "dequeue", || self.inner.dequeue_any(queues, timeout)).await
    }

    async fn acknowledge(&self, task_id: TaskId) -> Result<(), BrokerError> {
        retry_transient(&self.policy, "acknowledge", || self.inner.acknowledge(task_id)).await
    }

    async fn requeue_with_delay(&self, task_id: TaskId, delay: Duration) -> Result<u32, BrokerError> {
        retry_transient(&self.policy, "requeue", || {
            self.inner.requeue_with_delay(task_id, delay)
        })
        .await
    }

    async fn defer(&self, task_id: TaskId, delay: Duration) -> Result<(), BrokerError> {
        retry_transient(&self.policy, "defer", || self.inner.defer(task_id, delay)).await
    }

    async fn restore_unacked(&self, visibility_timeout: Duration) -> Result<Vec<TaskId>, BrokerError> {
        retry_transient(&self.policy, "restore_unacked", || {
            self.inner.restore_unacked(visibility_timeout)
        })
        .await
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError> {
        retry_transient(&self.policy, "counts", || self.inner.counts(queue)).await
    }
}

pub struct RetryingResultStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ResultStore> RetryingResultStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ResultStore> ResultStore for RetryingResultStore<S> {
    async fn put(&self, record: ResultRecord) -> Result<(), ResultStoreError> {
        retry_transient(&self.policy, "put_result", || self.inner.put(record.clone())).await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<ResultRecord>, ResultStoreError> {
        retry_transient(&self.policy, "get_result", || self.inner.get(task_id)).await
    }

    async fn sweep_expired(&self) -> Result<usize, ResultStoreError> {
        retry_transient(&self.policy, "sweep_results", || self.inner.sweep_expired()).await
    }
}
