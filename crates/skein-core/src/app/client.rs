//! Producer-side API: submit tasks, look up results.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::domain::{Envelope, ResultRecord, SkeinError, TaskId, TaskSignature};
use crate::ports::{Broker, ChordStore, Clock, IdGenerator, ResultStore};
use crate::routing::Router;

use super::workflow::{Composer, Workflow, WorkflowHandle};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cheap to clone; every clone talks to the same backends.
#[derive(Clone)]
pub struct Client {
    pub(crate) config: Arc<Config>,
    pub(crate) router: Arc<Router>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) results: Arc<dyn ResultStore>,
    pub(crate) chords: Arc<dyn ChordStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
}

impl Client {
    /// Enqueue `signature` on its routed queue. The result record starts as
    /// PENDING.
    pub async fn submit(&self, signature: TaskSignature) -> Result<TaskId, SkeinError> {
        let task_id = self.ids.task_id();
        self.submit_with_id(task_id, signature, None).await
    }

    pub async fn submit_many<I>(&self, signatures: I) -> Result<Vec<TaskId>, SkeinError>
    where
        I: IntoIterator<Item = TaskSignature>,
    {
        let mut ids = Vec::new();
        for signature in signatures {
            ids.push(self.submit(signature).await?);
        }
        Ok(ids)
    }

    pub async fn submit_workflow(&self, workflow: Workflow) -> Result<WorkflowHandle, SkeinError> {
        self.composer().submit(workflow).await
    }

    pub fn composer(&self) -> Composer<'_> {
        Composer::new(self)
    }

    /// `Ok(None)` for unknown or expired ids. FAILURE records come back with
    /// their error payload as stored.
    pub async fn query_result(&self, task_id: TaskId) -> Result<Option<ResultRecord>, SkeinError> {
        Ok(self.results.get(task_id).await?)
    }

    /// Poll until `task_id` reaches SUCCESS or FAILURE.
    pub async fn wait_for(&self, task_id: TaskId, timeout: Duration) -> Result<ResultRecord, SkeinError> {
        let poll = async {
            loop {
                if let Some(record) = self.query_result(task_id).await?
                    && record.is_terminal()
                {
                    return Ok::<_, SkeinError>(record);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| SkeinError::WaitTimeout(task_id))?
    }

    /// Enqueue under a pre-assigned id. `queue` overrides routing.
    pub(crate) async fn submit_with_id(
        &self,
        task_id: TaskId,
        signature: TaskSignature,
        queue: Option<&str>,
    ) -> Result<TaskId, SkeinError> {
        let task_type = signature.task_type().clone();
        let queue = queue
            .unwrap_or_else(|| self.router.route(&task_type))
            .to_string();
        let settings = self.config.task_settings(&task_type);
        let now = self.clock.now();

        let record = ResultRecord::new(task_id, task_type.clone(), now, self.config.result_expires());
        self.results.put(record).await?;

        let envelope = Envelope::new(task_id, signature, queue, settings.max_retries, now);
        let queue = envelope.queue.clone();
        self.broker.enqueue(envelope).await?;

        tracing::info!(%task_id, task = %task_type, %queue, "task submitted");
        Ok(task_id)
    }
}
