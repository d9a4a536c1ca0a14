#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use skein_core::{AppBuilder, Config, SkeinError, TaskArgs, TaskContext, TaskOptions, TaskOutcome, handler_fn, typed_fn};

pub const WAIT: Duration = Duration::from_secs(10);

/// Short poll and retry delays so scenarios finish in well under a second.
pub fn fast_config() -> Config {
    Config {
        dequeue_timeout_secs: 0.02,
        worker_concurrency: 4,
        task_defaults: TaskOptions {
            retry_delay_secs: Some(0.02),
            ..TaskOptions::default()
        },
        ..Config::default()
    }
}

pub fn options(f: impl FnOnce(&mut TaskOptions)) -> TaskOptions {
    let mut options = TaskOptions::default();
    f(&mut options);
    options
}

/// `add(x, y)` with an optional `delay_ms` keyword, `multiply(x, y)` and
/// `summarize([..])`.
pub fn with_math(builder: AppBuilder) -> Result<AppBuilder, SkeinError> {
    builder
        .register(
            "add",
            handler_fn(|_ctx, args: TaskArgs| async move {
                let x: i64 = args.arg(0).map_err(|e| e.to_string())?;
                let y: i64 = args.arg(1).map_err(|e| e.to_string())?;
                let delay_ms: u64 = args.kwarg_or("delay_ms", 0).map_err(|e| e.to_string())?;
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok::<_, String>(Value::from(x + y))
            }),
        )?
        .register("multiply", typed_fn(|(x, y): (i64, i64)| async move { x * y }))?
        .register(
            "summarize",
            typed_fn(|(values,): (Vec<i64>,)| async move { values.iter().sum::<i64>() }),
        )
}

/// Handler that counts its invocations and then delegates to `f`.
pub fn counted<F, Fut>(
    calls: &Arc<AtomicUsize>,
    f: F,
) -> impl skein_core::TaskHandler + 'static
where
    F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = TaskOutcome> + Send + 'static,
{
    let calls = Arc::clone(calls);
    handler_fn(move |ctx, args| {
        calls.fetch_add(1, Ordering::SeqCst);
        f(ctx, args)
    })
}

/// Poll `check` until it holds or `WAIT` runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
