//! Handle shared by the periodic loops (beat, result sweeping, reaping).

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Stand-in for "never" when an interval does not fit in an `Instant`.
const FAR_FUTURE: std::time::Duration = std::time::Duration::from_secs(86_400 * 365 * 30);

/// A spawned loop that stops when asked.
/// - `request_shutdown` signals the loop and returns
/// - `shutdown_and_join` also waits for the current iteration to finish
pub struct LoopHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LoopHandle {
    pub(crate) fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(body(shutdown_rx));
        tracing::debug!(name, "background loop started");
        Self {
            name,
            shutdown_tx,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn request_shutdown(&self) {
        // the loop may already have exited
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            tracing::error!(name = self.name, error = %e, "background loop ended abnormally");
        }
        tracing::debug!(name = self.name, "background loop stopped");
    }
}

/// Sleep for `period`, or return `false` early once shutdown is requested
/// or the handle is gone.
pub(crate) async fn sleep_or_shutdown(
    period: std::time::Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let deadline = deadline_after(Instant::now(), period);
    loop {
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = tokio::time::sleep_until(deadline) => return true,
        }
    }
}

pub(crate) fn deadline_after(now: Instant, period: std::time::Duration) -> Instant {
    now.checked_add(period).unwrap_or(now + FAR_FUTURE)
}
