//! Workflow composition: chain, group, chord.
//!
//! - chain: each signature becomes the success callback of the one before it,
//!   so the worker passes every result on as the next leading argument. The
//!   root id is returned; `walk_chain` follows `link_id` to the final record.
//! - group: independent submissions, no aggregation.
//! - chord: every header gets composer-owned callbacks that report into a
//!   `ChordStore` slot. The last report releases the body with the header
//!   results in submission order and settles the chord once the body is
//!   enqueued; the first failure settles the chord as FAILURE and the body
//!   never runs. Settled chords are dropped by the GC loop after
//!   `result_expires`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::domain::{
    ChordId, ResultRecord, SkeinError, TaskError, TaskId, TaskOutcome, TaskSignature, TaskStatus,
    TaskType,
};
use crate::ports::{ChordProgress, ChordState};
use crate::registry::{TaskArgs, TaskContext, TaskHandler, TaskRegistry};

use super::client::Client;

pub const CHORD_HEADER_DONE: &str = "skein.chord.header_done";
pub const CHORD_HEADER_FAILED: &str = "skein.chord.header_failed";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub enum Workflow {
    Chain(Vec<TaskSignature>),
    Group(Vec<TaskSignature>),
    Chord {
        header: Vec<TaskSignature>,
        body: TaskSignature,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowHandle {
    /// Id of the first task. The answer is at the end of its link chain.
    Chain { root: TaskId },
    Group { ids: Vec<TaskId> },
    Chord(ChordHandle),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChordHandle {
    pub chord_id: ChordId,
    pub header_ids: Vec<TaskId>,
    /// Where the chord's own result (the body's result, or the first header
    /// error) is stored.
    pub result_id: TaskId,
}

pub struct Composer<'a> {
    client: &'a Client,
}

impl<'a> Composer<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn submit(&self, workflow: Workflow) -> Result<WorkflowHandle, SkeinError> {
        match workflow {
            Workflow::Chain(signatures) => Ok(WorkflowHandle::Chain {
                root: self.build_chain(signatures).await?,
            }),
            Workflow::Group(signatures) => Ok(WorkflowHandle::Group {
                ids: self.build_group(signatures).await?,
            }),
            Workflow::Chord { header, body } => {
                Ok(WorkflowHandle::Chord(self.build_chord(header, body).await?))
            }
        }
    }

    /// Link the signatures back to front and submit the first one. Any link a
    /// signature already had is replaced by its successor.
    pub async fn build_chain(&self, signatures: Vec<TaskSignature>) -> Result<TaskId, SkeinError> {
        let mut rev = signatures.into_iter().rev();
        let last = rev.next().ok_or(SkeinError::EmptyWorkflow("chain"))?;
        let root = rev.fold(last, |next, signature| signature.with_link(next));
        self.client.submit(root).await
    }

    pub async fn build_group(&self, signatures: Vec<TaskSignature>) -> Result<Vec<TaskId>, SkeinError> {
        self.client.submit_many(signatures).await
    }

    pub async fn build_chord(
        &self,
        header: Vec<TaskSignature>,
        body: TaskSignature,
    ) -> Result<ChordHandle, SkeinError> {
        let chord_id = self.client.ids.chord_id();
        let result_id = self.client.ids.task_id();

        if header.is_empty() {
            self.client
                .submit_with_id(result_id, body.with_leading_arg(json!([])), None)
                .await?;
            return Ok(ChordHandle {
                chord_id,
                header_ids: Vec::new(),
                result_id,
            });
        }

        let pending = ResultRecord::new(
            result_id,
            body.task_type().clone(),
            self.client.clock.now(),
            self.client.config.result_expires(),
        );
        self.client.results.put(pending).await?;
        self.client
            .chords
            .create(ChordState::new(chord_id, body, result_id, header.len()))
            .await?;

        let mut header_ids = Vec::with_capacity(header.len());
        for (index, signature) in header.into_iter().enumerate() {
            let done = TaskSignature::new(CHORD_HEADER_DONE)
                .kwarg("chord_id", chord_id.to_string())
                .kwarg("index", index);
            let failed = TaskSignature::new(CHORD_HEADER_FAILED).kwarg("chord_id", chord_id.to_string());
            let signature = signature.with_link(done).with_link_error(failed);
            header_ids.push(self.client.submit(signature).await?);
        }
        tracing::info!(%chord_id, %result_id, headers = header_ids.len(), "chord submitted");

        Ok(ChordHandle {
            chord_id,
            header_ids,
            result_id,
        })
    }

    /// Follow success callbacks from `root` to the last record reached.
    ///
    /// Stops at a record that is not SUCCESS or has no successor. `Ok(None)`
    /// when some record on the way is unknown or expired.
    pub async fn walk_chain(&self, root: TaskId) -> Result<Option<ResultRecord>, SkeinError> {
        let mut current = root;
        loop {
            let Some(record) = self.client.query_result(current).await? else {
                return Ok(None);
            };
            match (record.status(), record.link_id()) {
                (TaskStatus::Success, Some(next)) => current = next,
                _ => return Ok(Some(record)),
            }
        }
    }

    /// Poll `walk_chain` until it lands on a terminal record with no successor.
    pub async fn wait_chain(&self, root: TaskId, timeout: Duration) -> Result<ResultRecord, SkeinError> {
        let poll = async {
            loop {
                if let Some(record) = self.walk_chain(root).await?
                    && record.is_terminal()
                {
                    return Ok::<_, SkeinError>(record);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| SkeinError::WaitTimeout(root))?
    }
}

/// Register the chord bookkeeping tasks. Called once while the app is built.
pub(crate) fn register_chord_callbacks(registry: &mut TaskRegistry, client: Client) -> Result<(), SkeinError> {
    registry.register(CHORD_HEADER_DONE, HeaderDone { client: client.clone() })?;
    registry.register(CHORD_HEADER_FAILED, HeaderFailed { client })?;
    Ok(())
}

fn chord_id_arg(args: &TaskArgs) -> Result<ChordId, String> {
    let raw: String = args.kwarg("chord_id").map_err(|e| e.to_string())?;
    ChordId::from_str(&raw).map_err(|e| e.to_string())
}

/// `(header_result, chord_id=, index=)`
struct HeaderDone {
    client: Client,
}

impl HeaderDone {
    async fn report(&self, args: TaskArgs) -> Result<Value, String> {
        let chord_id = chord_id_arg(&args)?;
        let index: usize = args.kwarg("index").map_err(|e| e.to_string())?;
        let value: Value = args.arg(0).map_err(|e| e.to_string())?;

        let progress = self
            .client
            .chords
            .complete_header(chord_id, index, value)
            .await
            .map_err(|e| e.to_string())?;
        match progress {
            ChordProgress::Waiting { remaining } => {
                tracing::debug!(%chord_id, slot = index, remaining, "chord header done");
            }
            ChordProgress::Ready {
                body,
                result_id,
                results,
            } => {
                tracing::info!(%chord_id, %result_id, task = %body.task_type(), "chord complete; releasing body");
                self.client
                    .submit_with_id(result_id, body.with_leading_arg(Value::Array(results)), None)
                    .await
                    .map_err(|e| e.to_string())?;
                // Only now is the chord settled. If the submission failed, the
                // retried callback gets `Ready` again.
                self.client
                    .chords
                    .mark_fired(chord_id)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            ChordProgress::Failed { .. } | ChordProgress::Settled => {
                tracing::debug!(%chord_id, slot = index, "chord already settled; header result dropped");
            }
        }
        Ok(Value::Null)
    }
}

#[async_trait]
impl TaskHandler for HeaderDone {
    async fn execute(&self, _ctx: TaskContext, args: TaskArgs) -> TaskOutcome {
        self.report(args).await.into()
    }
}

/// `(header_task_id, header_error, chord_id=)`
struct HeaderFailed {
    client: Client,
}

impl HeaderFailed {
    async fn report(&self, args: TaskArgs) -> Result<Value, String> {
        let chord_id = chord_id_arg(&args)?;
        let header_id: String = args.arg(0).map_err(|e| e.to_string())?;
        let error: TaskError = args.arg(1).map_err(|e| e.to_string())?;

        let progress = self
            .client
            .chords
            .fail_header(chord_id)
            .await
            .map_err(|e| e.to_string())?;
        let ChordProgress::Failed { result_id } = progress else {
            tracing::debug!(%chord_id, header = %header_id, "chord already settled; header failure dropped");
            return Ok(Value::Null);
        };

        let record = match self.client.results.get(result_id).await.map_err(|e| e.to_string())? {
            Some(record) => record,
            None => {
                let body_type = self
                    .client
                    .chords
                    .get(chord_id)
                    .await
                    .map_err(|e| e.to_string())?
                    .map(|state| state.body.task_type().clone())
                    .unwrap_or_else(|| TaskType::new(CHORD_HEADER_FAILED));
                ResultRecord::new(
                    result_id,
                    body_type,
                    self.client.clock.now(),
                    self.client.config.result_expires(),
                )
            }
        };
        tracing::error!(%chord_id, %result_id, header = %header_id, error = %error, "chord failed; body suppressed");
        self.client
            .results
            .put(record.failed(error))
            .await
            .map_err(|e| e.to_string())?;
        Ok(Value::Null)
    }
}

#[async_trait]
impl TaskHandler for HeaderFailed {
    async fn execute(&self, _ctx: TaskContext, args: TaskArgs) -> TaskOutcome {
        self.report(args).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppBuilder;
    use crate::config::Config;
    use crate::domain::ErrorKind;
    use crate::ports::{Broker, ChordPhase};
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    fn app() -> crate::app::App {
        AppBuilder::new(Config::default()).build().unwrap()
    }

    #[tokio::test]
    async fn chain_links_each_step_to_the_next() {
        let app = app();
        let client = app.client();
        let root = client
            .composer()
            .build_chain(vec![
                TaskSignature::new("add").args([3, 4]),
                TaskSignature::new("multiply").arg(2),
                TaskSignature::new("multiply").arg(10),
            ])
            .await
            .unwrap();

        let env = app.broker().dequeue("default", SHORT).await.unwrap().unwrap();
        assert_eq!(env.task_id, root);
        let second = env.signature.link().unwrap();
        assert_eq!(second.task_type().as_str(), "multiply");
        assert_eq!(second.positional(), &[json!(2)]);
        assert_eq!(second.link().unwrap().positional(), &[json!(10)]);
        assert!(second.link().unwrap().link().is_none());
    }

    #[tokio::test]
    async fn empty_chain_is_an_error_and_empty_group_is_not() {
        let client = app().client();
        assert!(matches!(
            client.submit_workflow(Workflow::Chain(vec![])).await,
            Err(SkeinError::EmptyWorkflow("chain"))
        ));
        assert_eq!(
            client.submit_workflow(Workflow::Group(vec![])).await.unwrap(),
            WorkflowHandle::Group { ids: vec![] }
        );
    }

    #[tokio::test]
    async fn walk_chain_follows_success_links() {
        let client = app().client();
        let now = client.clock.now();
        let ttl = Duration::from_secs(60);
        let (a, b, c) = (TaskId::generate(), TaskId::generate(), TaskId::generate());

        let put = |id, record: ResultRecord| {
            let client = client.clone();
            async move {
                assert_eq!(record.task_id(), id);
                client.results.put(record).await.unwrap();
            }
        };
        put(a, ResultRecord::new(a, "add".into(), now, ttl).succeeded(json!(7), Some(b))).await;
        put(b, ResultRecord::new(b, "multiply".into(), now, ttl).succeeded(json!(14), Some(c))).await;
        put(c, ResultRecord::new(c, "multiply".into(), now, ttl).started(0)).await;

        let composer = client.composer();
        let end = composer.walk_chain(a).await.unwrap().unwrap();
        assert_eq!(end.task_id(), c);
        assert_eq!(end.status(), TaskStatus::Started);

        put(c, ResultRecord::new(c, "multiply".into(), now, ttl).succeeded(json!(140), None)).await;
        let end = composer.wait_chain(a, Duration::from_secs(1)).await.unwrap();
        assert_eq!(end.result(), Some(&json!(140)));

        assert!(composer.walk_chain(TaskId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chord_headers_carry_internal_callbacks() {
        let app = app();
        let handle = app
            .client()
            .composer()
            .build_chord(
                vec![TaskSignature::new("add").args([1, 1]), TaskSignature::new("add").args([2, 1])],
                TaskSignature::new("summarize"),
            )
            .await
            .unwrap();

        let pending = app.client().query_result(handle.result_id).await.unwrap().unwrap();
        assert_eq!(pending.status(), TaskStatus::Pending);
        assert_eq!(pending.task_type().as_str(), "summarize");

        for (index, id) in handle.header_ids.iter().enumerate() {
            let env = app.broker().dequeue("default", SHORT).await.unwrap().unwrap();
            assert_eq!(env.task_id, *id);
            let done = env.signature.link().unwrap();
            assert_eq!(done.task_type().as_str(), CHORD_HEADER_DONE);
            assert_eq!(done.keywords()["index"], json!(index));
            assert_eq!(
                env.signature.link_error().unwrap().task_type().as_str(),
                CHORD_HEADER_FAILED
            );
        }
    }

    #[tokio::test]
    async fn chord_without_headers_fires_body_at_once() {
        let app = app();
        let handle = app
            .client()
            .composer()
            .build_chord(vec![], TaskSignature::new("summarize"))
            .await
            .unwrap();

        let env = app.broker().dequeue("default", SHORT).await.unwrap().unwrap();
        assert_eq!(env.task_id, handle.result_id);
        assert_eq!(env.signature.positional(), &[json!([])]);
    }

    #[tokio::test]
    async fn header_callbacks_release_body_in_order() {
        let app = app();
        let client = app.client();
        let handle = client
            .composer()
            .build_chord(
                vec![TaskSignature::new("add"), TaskSignature::new("add")],
                TaskSignature::new("summarize"),
            )
            .await
            .unwrap();
        // Drain the headers; the callbacks are driven by hand below.
        for _ in 0..2 {
            app.broker().dequeue("default", SHORT).await.unwrap().unwrap();
        }

        let done = HeaderDone { client: client.clone() };
        let ctx = || TaskContext::new(TaskId::generate(), TaskType::new(CHORD_HEADER_DONE), 0, 3);
        let report = |index: usize, value: Value| {
            TaskArgs::new(
                vec![value],
                serde_json::Map::from_iter([
                    ("chord_id".to_string(), json!(handle.chord_id.to_string())),
                    ("index".to_string(), json!(index)),
                ]),
            )
        };
        assert!(done.execute(ctx(), report(1, json!(3))).await.is_success());
        assert!(done.execute(ctx(), report(0, json!(2))).await.is_success());

        let body = app.broker().dequeue("default", SHORT).await.unwrap().unwrap();
        assert_eq!(body.task_id, handle.result_id);
        assert_eq!(body.signature.positional(), &[json!([2, 3])]);
    }

    #[tokio::test]
    async fn failed_body_submission_is_released_again_on_retry() {
        use crate::impls::InMemoryBroker;

        let broker = Arc::new(InMemoryBroker::default());
        let app = AppBuilder::new(Config::default())
            .with_broker(broker.clone())
            .build()
            .unwrap();
        let client = app.client();
        let handle = client
            .composer()
            .build_chord(vec![TaskSignature::new("add")], TaskSignature::new("summarize"))
            .await
            .unwrap();
        broker.dequeue("default", SHORT).await.unwrap().unwrap();

        let done = HeaderDone { client: client.clone() };
        let ctx = || TaskContext::new(TaskId::generate(), TaskType::new(CHORD_HEADER_DONE), 0, 3);
        let report = || {
            TaskArgs::new(
                vec![json!(7)],
                serde_json::Map::from_iter([
                    ("chord_id".to_string(), json!(handle.chord_id.to_string())),
                    ("index".to_string(), json!(0)),
                ]),
            )
        };

        broker.set_available(false);
        assert!(!done.execute(ctx(), report()).await.is_success());
        let state = client.chords.get(handle.chord_id).await.unwrap().unwrap();
        assert_eq!(state.phase, ChordPhase::Waiting);

        broker.set_available(true);
        assert!(done.execute(ctx(), report()).await.is_success());
        let body = broker.dequeue("default", SHORT).await.unwrap().unwrap();
        assert_eq!(body.task_id, handle.result_id);
        assert_eq!(body.signature.positional(), &[json!([7])]);
        let state = client.chords.get(handle.chord_id).await.unwrap().unwrap();
        assert_eq!(state.phase, ChordPhase::Fired);
        assert!(state.settled_at.is_some());
    }

    #[tokio::test]
    async fn header_failure_settles_chord_with_the_header_error() {
        let app = app();
        let client = app.client();
        let handle = client
            .composer()
            .build_chord(vec![TaskSignature::new("boom")], TaskSignature::new("summarize"))
            .await
            .unwrap();

        let failed = HeaderFailed { client: client.clone() };
        let error = TaskError::new(ErrorKind::RetriesExhausted, "boom").with_retries(3);
        let args = TaskArgs::new(
            vec![json!(handle.header_ids[0].to_string()), json!(error)],
            serde_json::Map::from_iter([("chord_id".to_string(), json!(handle.chord_id.to_string()))]),
        );
        let ctx = TaskContext::new(TaskId::generate(), TaskType::new(CHORD_HEADER_FAILED), 0, 3);
        assert!(failed.execute(ctx, args).await.is_success());

        let record = client.query_result(handle.result_id).await.unwrap().unwrap();
        assert_eq!(record.status(), TaskStatus::Failure);
        assert_eq!(record.error(), Some(&error));
        let state = client.chords.get(handle.chord_id).await.unwrap().unwrap();
        assert_eq!(state.phase, ChordPhase::Failed);
    }
}
