//! Task registry: task type → handler.
//!
//! Populated once at startup, then shared read-only between worker slots.
//! Handlers receive their arguments as JSON and report a `TaskOutcome`.
//! `handler_fn` adapts an async closure; `typed_fn` additionally decodes the
//! positional arguments into a tuple and serializes the return value.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::domain::{SkeinError, TaskId, TaskOutcome, TaskSignature, TaskType};

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, ctx: TaskContext, args: TaskArgs) -> TaskOutcome;
}

/// Arguments of one invocation, taken from the signature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskArgs {
    positional: Vec<Value>,
    keywords: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ArgError {
    #[error("missing positional argument {0}")]
    Missing(usize),

    #[error("missing keyword argument {0:?}")]
    MissingKeyword(String),

    #[error("argument {name}: {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TaskArgs {
    pub fn new(positional: Vec<Value>, keywords: Map<String, Value>) -> Self {
        Self {
            positional,
            keywords,
        }
    }

    pub fn from_signature(signature: &TaskSignature) -> Self {
        Self::new(signature.positional().to_vec(), signature.keywords().clone())
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keywords(&self) -> &Map<String, Value> {
        &self.keywords
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }

    /// Decode positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, ArgError> {
        let value = self.positional.get(index).ok_or(ArgError::Missing(index))?;
        serde_json::from_value(value.clone()).map_err(|source| ArgError::Invalid {
            name: index.to_string(),
            source,
        })
    }

    /// Decode keyword argument `name`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, ArgError> {
        let value = self
            .keywords
            .get(name)
            .ok_or_else(|| ArgError::MissingKeyword(name.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|source| ArgError::Invalid {
            name: name.to_string(),
            source,
        })
    }

    /// Decode keyword argument `name`, or `default` when absent.
    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, ArgError> {
        match self.keywords.get(name) {
            None => Ok(default),
            Some(_) => self.kwarg(name),
        }
    }

    /// Decode all positional arguments at once, e.g. into a tuple.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ArgError> {
        serde_json::from_value(Value::Array(self.positional.clone())).map_err(|source| {
            ArgError::Invalid {
                name: "args".to_string(),
                source,
            }
        })
    }
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_type: TaskType,
    retries: u32,
    max_retries: u32,
    soft_limit: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: TaskId, task_type: TaskType, retries: u32, max_retries: u32) -> Self {
        Self {
            task_id,
            task_type,
            retries,
            max_retries,
            soft_limit: CancellationToken::new(),
        }
    }

    pub(crate) fn with_soft_limit(mut self, token: CancellationToken) -> Self {
        self.soft_limit = token;
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// How many times this task was requeued before this run.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether the soft time limit has passed. Handlers that care should
    /// check this between units of work and wrap up.
    pub fn soft_limit_exceeded(&self) -> bool {
        self.soft_limit.is_cancelled()
    }

    /// Resolves once the soft time limit passes. Never resolves for tasks
    /// without one.
    pub async fn soft_limit_reached(&self) {
        self.soft_limit.cancelled().await
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f(ctx, args)` as a handler. The closure may return a `TaskOutcome`
/// or a `Result<Value, E>`.
pub fn handler_fn<F, Fut, O>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: Into<TaskOutcome>,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut, O> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: Into<TaskOutcome>,
{
    async fn execute(&self, ctx: TaskContext, args: TaskArgs) -> TaskOutcome {
        (self.f)(ctx, args).await.into()
    }
}

/// Handler whose positional arguments decode into `A` and whose return
/// value serializes into the SUCCESS payload.
pub struct TypedHandler<A, F> {
    f: F,
    _marker: PhantomData<fn(A)>,
}

/// Wrap `f(args)` where `args` is decoded from the positional list, e.g.
/// `typed_fn(|(x, y): (i64, i64)| async move { x + y })`. A decode error is a
/// FAILURE outcome.
pub fn typed_fn<A, R, F, Fut>(f: F) -> TypedHandler<A, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    TypedHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<A, R, F, Fut> TaskHandler for TypedHandler<A, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    async fn execute(&self, _ctx: TaskContext, args: TaskArgs) -> TaskOutcome {
        let decoded: A = match args.decode() {
            Ok(decoded) => decoded,
            Err(e) => return TaskOutcome::failure(e.to_string()),
        };
        let value = (self.f)(decoded).await;
        serde_json::to_value(value)
            .map_err(|e| format!("result encode: {e}"))
            .into()
    }
}

/// Registry of handlers (task_type -> handler).
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `task_type`. Registering a type twice is an error.
    pub fn register<H>(&mut self, task_type: impl Into<TaskType>, handler: H) -> Result<(), SkeinError>
    where
        H: TaskHandler + 'static,
    {
        self.register_arc(task_type.into(), Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), SkeinError> {
        if self.handlers.contains_key(&task_type) {
            return Err(SkeinError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered types, sorted.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("handlers", &self.registered_types())
            .finish()
    }
}
