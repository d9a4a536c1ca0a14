//! Worker pool: slots that dequeue, execute and report.
//!
//! Each slot loops independently:
//! 1. `dequeue_any` over the worker's queues (priority order)
//! 2. skip envelopes whose result is already terminal (duplicate delivery)
//! 3. take a rate-limit token, or defer the envelope without counting a retry
//! 4. write STARTED and run the handler under its time limits
//! 5. SUCCESS: enqueue the success callback, write SUCCESS, acknowledge
//! 6. otherwise: requeue with the retry delay and write RETRY carrying the
//!    attempt's error, or once retries are used up write FAILURE,
//!    acknowledge and enqueue the failure callback
//!
//! The broker and the result store are the only state shared between slots.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{Config, TaskSettings};
use crate::domain::{
    BrokerError, Envelope, ErrorKind, ResultRecord, SkeinError, TaskError, TaskId, TaskOutcome,
    TaskSignature,
};
use crate::ports::{Broker, Clock, IdGenerator, ResultStore};
use crate::rate_limit::RateLimiter;
use crate::registry::{TaskArgs, TaskContext, TaskRegistry};

use super::client::Client;
use super::executor::{self, Execution, TimeLimits};

/// Everything a slot needs. Shared by all slots of a pool.
pub struct Worker {
    pub(crate) config: Arc<Config>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) results: Arc<dyn ResultStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) client: Client,
    pub(crate) queues: Vec<String>,
}

/// How one attempt went, before retry bookkeeping.
struct Attempt {
    kind: ErrorKind,
    message: String,
    countdown: Option<std::time::Duration>,
}

impl Worker {
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Wait up to the dequeue timeout for one envelope and process it.
    /// Returns whether anything was dequeued.
    pub async fn run_once(&self) -> Result<bool, SkeinError> {
        match self.dequeue().await? {
            Some(envelope) => {
                self.process(envelope).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dequeue(&self) -> Result<Option<Envelope>, BrokerError> {
        let queues: Vec<&str> = self.queues.iter().map(String::as_str).collect();
        self.broker
            .dequeue_any(&queues, self.config.dequeue_timeout())
            .await
    }

    /// Drive one dequeued envelope to acknowledgement, requeue or deferral.
    pub async fn process(&self, envelope: Envelope) {
        let task_id = envelope.task_id;
        let task_type = envelope.task_type().clone();

        let existing = match self.results.get(task_id).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::error!(%task_id, error = %e, "result lookup failed; treating as new");
                None
            }
        };
        if existing.as_ref().is_some_and(ResultRecord::is_terminal) {
            tracing::debug!(%task_id, task = %task_type, "already finished; acknowledging duplicate delivery");
            self.acknowledge(&envelope).await;
            return;
        }
        let record = existing.unwrap_or_else(|| {
            ResultRecord::new(task_id, task_type.clone(), self.clock.now(), self.config.result_expires())
        });

        let Some(handler) = self.registry.get(&task_type) else {
            let error = TaskError::new(
                ErrorKind::UnregisteredTask,
                format!("no handler registered for task type {task_type}"),
            )
            .with_retries(envelope.retries);
            self.fail(&envelope, record, error).await;
            return;
        };

        // engine-owned callbacks are never rate limited
        let settings = self.config.task_settings(&task_type);
        let rate_limit = if task_type.is_internal() {
            None
        } else {
            envelope.signature.rate_limit().copied().or(settings.rate_limit)
        };
        if let Some(spec) = rate_limit
            && let Err(limited) = self.rate_limiter.try_acquire(&task_type, &spec)
        {
            tracing::warn!(%task_id, task = %task_type, wait = ?limited.wait, "rate limited; deferring");
            if let Err(e) = self.broker.defer(task_id, limited.wait).await {
                self.log_broker_error(&envelope, "defer", e);
            }
            return;
        }

        let record = record.started(envelope.retries);
        self.store(record.clone()).await;
        tracing::debug!(%task_id, task = %task_type, retries = envelope.retries, "task started");

        let ctx = TaskContext::new(task_id, task_type.clone(), envelope.retries, envelope.max_retries);
        let args = TaskArgs::from_signature(&envelope.signature);
        let limits = TimeLimits {
            soft: settings.soft_time_limit,
            hard: settings.time_limit,
        };

        let attempt = match executor::execute(handler, ctx, args, limits).await {
            Execution::Finished(TaskOutcome::Success { value }) => {
                self.succeed(&envelope, record, value).await;
                return;
            }
            Execution::Finished(TaskOutcome::Retry { reason, countdown }) => Attempt {
                kind: ErrorKind::RetriesExhausted,
                message: reason,
                countdown,
            },
            Execution::Finished(TaskOutcome::Failure { message }) => Attempt {
                kind: ErrorKind::RetriesExhausted,
                message,
                countdown: None,
            },
            Execution::Panicked(message) => Attempt {
                kind: ErrorKind::RetriesExhausted,
                message: format!("handler panicked: {message}"),
                countdown: None,
            },
            Execution::TimedOut { limit } => Attempt {
                kind: ErrorKind::TaskTimeout,
                message: format!("hard time limit of {limit:?} exceeded"),
                countdown: None,
            },
        };
        self.retry_or_fail(&envelope, record, &settings, attempt).await;
    }

    async fn succeed(&self, envelope: &Envelope, record: ResultRecord, value: Value) {
        let task_id = envelope.task_id;

        let mut link_id = None;
        if let Some(link) = envelope.signature.link() {
            let callback_id = self.ids.task_id();
            let callback = link.clone().with_leading_arg(value.clone());
            match self.dispatch_callback(envelope, callback_id, callback).await {
                Ok(()) if !link.task_type().is_internal() => link_id = Some(callback_id),
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(%task_id, error = %e, "success callback could not be enqueued");
                }
            }
        }

        self.store(record.succeeded(value, link_id)).await;
        self.acknowledge(envelope).await;
        tracing::info!(%task_id, task = %envelope.task_type(), retries = envelope.retries, "task succeeded");
    }

    async fn retry_or_fail(
        &self,
        envelope: &Envelope,
        record: ResultRecord,
        settings: &TaskSettings,
        attempt: Attempt,
    ) {
        let task_id = envelope.task_id;
        if envelope.retries < envelope.max_retries {
            let next = envelope.retries + 1;
            let delay = attempt
                .countdown
                .unwrap_or_else(|| settings.retry.next_delay(next));

            // RETRY goes in before the envelope is visible again, so a fast
            // redelivery's STARTED is not overwritten.
            let last_error =
                TaskError::new(attempt.kind, attempt.message.clone()).with_retries(envelope.retries);
            self.store(record.clone().retrying(next, last_error)).await;
            match self.broker.requeue_with_delay(task_id, delay).await {
                Ok(retries) => {
                    tracing::warn!(
                        %task_id,
                        task = %envelope.task_type(),
                        retries,
                        max_retries = envelope.max_retries,
                        ?delay,
                        kind = ?attempt.kind,
                        reason = %attempt.message,
                        "task failed; retry scheduled"
                    );
                    return;
                }
                Err(BrokerError::RetriesExhausted { .. }) => {}
                Err(e) => {
                    self.log_broker_error(envelope, "requeue", e);
                    return;
                }
            }
        }

        let error = TaskError::new(attempt.kind, attempt.message).with_retries(envelope.retries);
        self.fail(envelope, record, error).await;
    }

    /// Terminal failure: FAILURE record, acknowledge, failure callback.
    async fn fail(&self, envelope: &Envelope, record: ResultRecord, error: TaskError) {
        let task_id = envelope.task_id;
        tracing::error!(
            %task_id,
            task = %envelope.task_type(),
            retries = error.retries,
            kind = ?error.kind,
            error = %error.message,
            "task failed permanently"
        );
        self.store(record.failed(error.clone())).await;
        self.acknowledge(envelope).await;

        if let Some(errback) = envelope.signature.link_error() {
            let callback = errback
                .clone()
                .with_leading_arg(json!(error))
                .with_leading_arg(json!(task_id.to_string()));
            if let Err(e) = self
                .dispatch_callback(envelope, self.ids.task_id(), callback)
                .await
            {
                tracing::error!(%task_id, error = %e, "failure callback could not be enqueued");
            }
        }
    }

    /// Engine-owned callbacks stay on the parent's queue, which this worker
    /// is known to consume. User callbacks are routed normally.
    async fn dispatch_callback(
        &self,
        parent: &Envelope,
        callback_id: TaskId,
        callback: TaskSignature,
    ) -> Result<(), SkeinError> {
        let queue = callback
            .task_type()
            .is_internal()
            .then_some(parent.queue.as_str());
        self.client.submit_with_id(callback_id, callback, queue).await?;
        Ok(())
    }

    async fn store(&self, record: ResultRecord) {
        let task_id = record.task_id();
        let status = record.status();
        if let Err(e) = self.results.put(record).await {
            tracing::error!(%task_id, ?status, error = %e, "result write failed");
        }
    }

    async fn acknowledge(&self, envelope: &Envelope) {
        if let Err(e) = self.broker.acknowledge(envelope.task_id).await {
            self.log_broker_error(envelope, "acknowledge", e);
        }
    }

    fn log_broker_error(&self, envelope: &Envelope, op: &'static str, error: BrokerError) {
        let task_id = envelope.task_id;
        match error {
            BrokerError::UnknownTask(_) => {
                tracing::warn!(%task_id, op, "task no longer in flight; ignoring");
            }
            e => tracing::error!(%task_id, op, error = %e, "broker call failed"),
        }
    }
}

/// Handle to a running pool.
/// - `request_shutdown` stops every slot from taking new work
/// - `shutdown_and_join` also waits for in-flight tasks to finish
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` slots sharing `worker`.
    pub fn spawn(worker: Arc<Worker>, concurrency: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tracing::info!(concurrency, queues = ?worker.queues, "worker pool starting");

        let joins = (0..concurrency)
            .map(|slot| {
                let worker = Arc::clone(&worker);
                let rx = shutdown_rx.clone();
                let span = tracing::info_span!("slot", slot);
                tokio::spawn(slot_loop(worker, rx).instrument(span))
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
        tracing::info!("worker pool stopped");
    }
}

async fn slot_loop(worker: Arc<Worker>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Only the wait for work races shutdown. A task that was dequeued
        // runs to completion.
        let dequeued = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            dequeued = worker.dequeue() => dequeued,
        };

        match dequeued {
            Ok(Some(envelope)) => worker.process(envelope).await,
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "dequeue failed");
                tokio::time::sleep(worker.config.dequeue_timeout()).await;
            }
        }
    }
}
