//! Demo task handlers.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use skein_core::{AppBuilder, SkeinError, TaskArgs, TaskContext, TaskHandler, TaskOutcome, handler_fn, typed_fn};

pub const TASK_TYPES: &[&str] = &[
    "add",
    "multiply",
    "summarize",
    "failing_task",
    "important_task",
    "long_running_task",
    "cpu_burn",
    "io_bound_task",
    "scheduled_task",
];

pub fn register_all(builder: AppBuilder) -> Result<AppBuilder, SkeinError> {
    builder
        .register("add", handler_fn(add))?
        .register("multiply", typed_fn(|(x, y): (i64, i64)| async move { x * y }))?
        .register(
            "summarize",
            typed_fn(|(values,): (Vec<i64>,)| async move { values.iter().sum::<i64>() }),
        )?
        .register("failing_task", FailingTask)?
        .register(
            "important_task",
            handler_fn(|ctx: TaskContext, _args| async move {
                tracing::info!(task_id = %ctx.task_id(), "important work done");
                TaskOutcome::success("important task completed")
            }),
        )?
        .register("long_running_task", handler_fn(long_running_task))?
        .register("cpu_burn", handler_fn(cpu_burn))?
        .register(
            "io_bound_task",
            typed_fn(|(ms,): (u64,)| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ms
            }),
        )?
        .register(
            "scheduled_task",
            handler_fn(|ctx: TaskContext, _args| async move {
                tracing::info!(task_id = %ctx.task_id(), "scheduled task ran");
                TaskOutcome::success("scheduled task completed")
            }),
        )
}

/// `add(x, y)`; an optional `delay_ms` keyword simulates slow work.
async fn add(_ctx: TaskContext, args: TaskArgs) -> TaskOutcome {
    let parsed = (|| {
        let x: i64 = args.arg(0)?;
        let y: i64 = args.arg(1)?;
        let delay_ms: u64 = args.kwarg_or("delay_ms", 0)?;
        Ok::<_, skein_core::registry::ArgError>((x, y, delay_ms))
    })();
    let (x, y, delay_ms) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => return TaskOutcome::failure(e.to_string()),
    };
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    TaskOutcome::success(x + y)
}

/// Fails about half of the time and asks to be retried.
struct FailingTask;

#[async_trait]
impl TaskHandler for FailingTask {
    async fn execute(&self, ctx: TaskContext, _args: TaskArgs) -> TaskOutcome {
        if rand::random::<bool>() {
            tracing::info!(retries = ctx.retries(), "failing_task got lucky");
            TaskOutcome::success(json!({ "attempts": ctx.retries() + 1 }))
        } else {
            TaskOutcome::retry("random failure")
        }
    }
}

#[derive(Debug, Deserialize)]
struct LongRunningOptions {
    #[serde(default = "default_steps")]
    steps: u32,
}

fn default_steps() -> u32 {
    10
}

/// Works in one-second steps until done or the soft time limit passes.
async fn long_running_task(ctx: TaskContext, args: TaskArgs) -> TaskOutcome {
    let options: LongRunningOptions = match serde_json::from_value(Value::Object(args.keywords().clone())) {
        Ok(options) => options,
        Err(e) => return TaskOutcome::failure(format!("long_running_task options: {e}")),
    };
    let steps = options.steps;
    for done in 0..steps {
        if ctx.soft_limit_exceeded() {
            tracing::warn!(done, steps, "soft time limit reached; returning partial result");
            return TaskOutcome::success(json!({ "completed_steps": done, "interrupted": true }));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    TaskOutcome::success(json!({ "completed_steps": steps, "interrupted": false }))
}

/// Counts primes below `n * 1000` on the blocking pool.
async fn cpu_burn(_ctx: TaskContext, args: TaskArgs) -> TaskOutcome {
    let n: u64 = match args.arg(0) {
        Ok(n) => n,
        Err(e) => return TaskOutcome::failure(e.to_string()),
    };
    let limit = n.saturating_mul(1000);
    match tokio::task::spawn_blocking(move || count_primes(limit)).await {
        Ok(count) => TaskOutcome::success(count),
        Err(e) => TaskOutcome::failure(format!("cpu_burn worker thread: {e}")),
    }
}

fn count_primes(limit: u64) -> u64 {
    (2..limit)
        .filter(|&k| (2..).take_while(|d| d * d <= k).all(|d| k % d != 0))
        .count() as u64
}
