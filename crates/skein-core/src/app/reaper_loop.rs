//! Periodic return of abandoned in-flight envelopes to their queues.
//!
//! An envelope that stays in flight longer than the visibility timeout is
//! presumed to belong to a dead worker. Redelivery does not count as a retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::{BrokerError, TaskId};
use crate::ports::Broker;

use super::background::{LoopHandle, sleep_or_shutdown};

pub struct ReaperLoop {
    broker: Arc<dyn Broker>,
    visibility_timeout: Duration,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(broker: Arc<dyn Broker>, visibility_timeout: Duration, interval: Duration) -> Self {
        Self {
            broker,
            visibility_timeout,
            interval,
        }
    }

    pub async fn reap_once(&self) -> Result<Vec<TaskId>, BrokerError> {
        let restored = self.broker.restore_unacked(self.visibility_timeout).await?;
        for task_id in &restored {
            tracing::warn!(%task_id, timeout = ?self.visibility_timeout, "visibility timeout passed; redelivering");
        }
        Ok(restored)
    }

    pub fn spawn(self) -> LoopHandle {
        LoopHandle::spawn("reaper", move |rx| self.run(rx))
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        while sleep_or_shutdown(self.interval, &mut shutdown_rx).await {
            if let Err(e) = self.reap_once().await {
                tracing::error!(error = %e, "reaping in-flight envelopes failed");
            }
        }
    }
}
