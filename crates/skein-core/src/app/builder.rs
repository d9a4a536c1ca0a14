//! AppBuilder - wires configuration, handlers and backends into an `App`.
//!
//! `build` fails fast: an invalid configuration, a duplicate handler or a
//! task type listed in `expect_tasks` without a handler all stop start-up
//! with a `BuildError`.

use std::sync::Arc;

use crate::config::{Config, ConfigError};
use crate::domain::{BrokerError, SkeinError, TaskType};
use crate::impls::{InMemoryBroker, InMemoryChordStore, InMemoryResultStore, RetryingBroker, RetryingResultStore};
use crate::ports::{Broker, ChordStore, Clock, IdGenerator, ResultStore, SystemClock, UlidGenerator};
use crate::rate_limit::RateLimiter;
use crate::registry::{TaskHandler, TaskRegistry};
use crate::retry::RetryPolicy;

use super::beat::Beat;
use super::client::Client;
use super::gc_loop::GcLoop;
use super::reaper_loop::ReaperLoop;
use super::status::StatusReport;
use super::worker_loop::{Worker, WorkerPool};
use super::workflow::register_chord_callbacks;

/// # Example
/// ```ignore
/// let app = AppBuilder::new(config)
///     .register("add", typed_fn(|(x, y): (i64, i64)| async move { x + y }))?
///     .expect_tasks(&["add"])
///     .build()?;
/// ```
pub struct AppBuilder {
    config: Config,
    registry: TaskRegistry,
    expected_tasks: Option<Vec<TaskType>>,
    clock: Option<Arc<dyn Clock>>,
    broker: Option<Arc<dyn Broker>>,
    results: Option<Arc<dyn ResultStore>>,
    chords: Option<Arc<dyn ChordStore>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task types: {0:?}; these tasks were expected but not registered")]
    MissingTaskTypes(Vec<TaskType>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] SkeinError),
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: TaskRegistry::new(),
            expected_tasks: None,
            clock: None,
            broker: None,
            results: None,
            chords: None,
        }
    }

    pub fn register<H>(mut self, task_type: impl Into<TaskType>, handler: H) -> Result<Self, SkeinError>
    where
        H: TaskHandler + 'static,
    {
        self.registry.register(task_type, handler)?;
        Ok(self)
    }

    pub fn register_arc(
        mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, SkeinError> {
        self.registry.register_arc(task_type.into(), handler)?;
        Ok(self)
    }

    /// Task types that must have a handler by the time `build` runs.
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().copied().map(TaskType::new).collect());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_result_store(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_chord_store(mut self, chords: Arc<dyn ChordStore>) -> Self {
        self.chords = Some(chords);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_tasks {
            let missing: Vec<TaskType> = expected
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let broker: Arc<dyn Broker> = match self.broker {
            Some(broker) => broker,
            None => Arc::new(RetryingBroker::new(
                InMemoryBroker::new(Arc::clone(&clock)),
                RetryPolicy::default(),
            )),
        };
        let results: Arc<dyn ResultStore> = match self.results {
            Some(results) => results,
            None => Arc::new(RetryingResultStore::new(
                InMemoryResultStore::new(Arc::clone(&clock)),
                RetryPolicy::default(),
            )),
        };
        let chords: Arc<dyn ChordStore> = match self.chords {
            Some(chords) => chords,
            None => Arc::new(InMemoryChordStore::new(Arc::clone(&clock))),
        };
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        let config = Arc::new(self.config);
        let client = Client {
            router: Arc::new(config.router()),
            config: Arc::clone(&config),
            broker,
            results,
            chords,
            clock: Arc::clone(&clock),
            ids,
        };

        let mut registry = self.registry;
        register_chord_callbacks(&mut registry, client.clone())?;
        tracing::info!(
            tasks = ?registry.registered_types(),
            broker = %config.broker_url,
            result_backend = %config.result_backend,
            "app built"
        );

        Ok(App {
            rate_limiter: Arc::new(RateLimiter::new(clock)),
            registry: Arc::new(registry),
            config,
            client,
        })
    }
}

/// A wired engine. Hands out clients, workers and the periodic loops, all
/// sharing the same backends.
pub struct App {
    config: Arc<Config>,
    registry: Arc<TaskRegistry>,
    rate_limiter: Arc<RateLimiter>,
    client: Client,
}

impl App {
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.client.broker)
    }

    pub fn results(&self) -> Arc<dyn ResultStore> {
        Arc::clone(&self.client.results)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.client.clock)
    }

    /// Worker over the configured `worker_queues`.
    pub fn worker(&self) -> Arc<Worker> {
        self.worker_for(self.config.worker_queues())
    }

    /// Worker over `queues`, highest priority first.
    pub fn worker_for(&self, queues: Vec<String>) -> Arc<Worker> {
        Arc::new(Worker {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            broker: self.broker(),
            results: self.results(),
            clock: self.clock(),
            ids: Arc::clone(&self.client.ids),
            rate_limiter: Arc::clone(&self.rate_limiter),
            client: self.client(),
            queues,
        })
    }

    pub fn spawn_workers(&self) -> WorkerPool {
        WorkerPool::spawn(self.worker(), self.config.worker_concurrency)
    }

    pub fn spawn_workers_on(&self, queues: Vec<String>, concurrency: usize) -> WorkerPool {
        WorkerPool::spawn(self.worker_for(queues), concurrency)
    }

    pub fn beat(&self) -> Beat {
        Beat::from_config(self.client(), &self.config)
    }

    pub fn gc_loop(&self) -> GcLoop {
        GcLoop::new(self.results(), self.config.result_sweep_interval())
            .with_chords(Arc::clone(&self.client.chords), self.config.result_expires())
    }

    pub fn reaper_loop(&self) -> ReaperLoop {
        ReaperLoop::new(
            self.broker(),
            self.config.visibility_timeout(),
            self.config.reaper_interval(),
        )
    }

    /// Counts for every routed queue plus any extra queue workers consume.
    pub async fn status(&self) -> Result<StatusReport, BrokerError> {
        let mut queues: Vec<String> = self
            .client
            .router
            .queues()
            .into_iter()
            .map(str::to_string)
            .collect();
        for queue in self.config.worker_queues() {
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }
        StatusReport::collect(self.client.broker.as_ref(), &queues).await
    }
}
