//! Application layer: the ports wired into a running engine.
//!
//! - **AppBuilder / App**: construction, start-up validation, wiring
//! - **Client**: submission and result lookup
//! - **Composer**: chain / group / chord
//! - **Worker / WorkerPool**: dequeue, execute, report
//! - **Beat**: periodic submissions
//! - **GcLoop / ReaperLoop**: result and chord expiry, redelivery of abandoned work

pub mod background;
pub mod beat;
pub mod builder;
pub mod client;
pub mod executor;
pub mod gc_loop;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;
pub mod workflow;

pub use self::background::LoopHandle;
pub use self::beat::Beat;
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::client::Client;
pub use self::executor::{Execution, TimeLimits};
pub use self::gc_loop::{GcLoop, Swept};
pub use self::reaper_loop::ReaperLoop;
pub use self::status::{QueueStatus, StatusReport};
pub use self::worker_loop::{Worker, WorkerPool};
pub use self::workflow::{ChordHandle, Composer, Workflow, WorkflowHandle};
