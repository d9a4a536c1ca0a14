//! Runs one handler invocation under its time limits.
//!
//! The handler runs on its own tokio task. At the soft limit the context's
//! cancellation token fires and the handler may wrap up; at the hard limit
//! the task is aborted. A panic inside the handler is caught by the join.

use std::any::Any;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::domain::TaskOutcome;
use crate::registry::{TaskArgs, TaskContext, TaskHandler};

#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Finished(TaskOutcome),
    /// Killed at the hard limit.
    TimedOut { limit: Duration },
    Panicked(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeLimits {
    pub soft: Option<Duration>,
    pub hard: Option<Duration>,
}

pub async fn execute(
    handler: Arc<dyn TaskHandler>,
    ctx: TaskContext,
    args: TaskArgs,
    limits: TimeLimits,
) -> Execution {
    let token = CancellationToken::new();
    let ctx = ctx.with_soft_limit(token.clone());
    let task_id = ctx.task_id();

    let mut join = tokio::spawn(async move { handler.execute(ctx, args).await });

    let soft = sleep_or_never(limits.soft);
    let hard = sleep_or_never(limits.hard);
    tokio::pin!(soft, hard);
    let mut soft_fired = false;

    loop {
        tokio::select! {
            joined = &mut join => {
                return match joined {
                    Ok(outcome) => Execution::Finished(outcome),
                    Err(e) if e.is_panic() => Execution::Panicked(panic_message(e.into_panic())),
                    Err(e) => Execution::Panicked(e.to_string()),
                };
            }
            _ = &mut soft, if !soft_fired => {
                soft_fired = true;
                tracing::warn!(%task_id, limit = ?limits.soft, "soft time limit exceeded");
                token.cancel();
            }
            _ = &mut hard => {
                join.abort();
                let limit = limits.hard.unwrap_or_default();
                tracing::error!(%task_id, ?limit, "hard time limit exceeded; task killed");
                return Execution::TimedOut { limit };
            }
        }
    }
}

async fn sleep_or_never(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => pending::<()>().await,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
