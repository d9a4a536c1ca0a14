//! skein-core
//!
//! A distributed task-queue engine: producers submit task signatures to
//! named queues, worker pools execute them with retries and time limits,
//! and results land in a result store with expiry.
//!
//! # Modules
//! - **domain**: ids, task types, signatures, envelopes, result records, errors
//! - **ports**: broker, result store, chord store, clock and id traits
//! - **impls**: in-memory backends and the retry-on-outage transport wrappers
//! - **app**: builder, client, workflows, worker pool, beat, maintenance loops
//! - **config** / **routing** / **registry** / **retry** / **rate_limit**:
//!   the pieces the app layer is configured with

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod routing;

pub use app::{App, AppBuilder, BuildError, Client, Workflow, WorkflowHandle};
pub use config::{BeatEntry, Config, ConfigError, TaskOptions};
pub use domain::{ErrorKind, ResultRecord, SkeinError, TaskError, TaskId, TaskOutcome, TaskSignature, TaskStatus, TaskType};
pub use registry::{TaskArgs, TaskContext, TaskHandler, TaskRegistry, handler_fn, typed_fn};
