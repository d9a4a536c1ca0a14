//! Point-in-time view of the queues, for operators.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::BrokerError;
use crate::ports::{Broker, QueueCounts};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue: String,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub queues: Vec<QueueStatus>,
}

impl StatusReport {
    /// Counts for each of `queues`, in the order given.
    pub async fn collect<S: AsRef<str>>(broker: &dyn Broker, queues: &[S]) -> Result<Self, BrokerError> {
        let mut report = Self::default();
        for queue in queues {
            let queue = queue.as_ref();
            let counts = broker.counts(queue).await?;
            report.queues.push(QueueStatus {
                queue: queue.to_string(),
                counts,
            });
        }
        Ok(report)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueCounts> {
        self.queues.iter().find(|q| q.queue == name).map(|q| &q.counts)
    }

    pub fn total(&self) -> QueueCounts {
        self.queues.iter().fold(QueueCounts::default(), |acc, q| QueueCounts {
            ready: acc.ready + q.counts.ready,
            delayed: acc.delayed + q.counts.delayed,
            in_flight: acc.in_flight + q.counts.in_flight,
        })
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .queues
            .iter()
            .map(|q| q.queue.len())
            .max()
            .unwrap_or(0)
            .max("queue".len());
        writeln!(f, "{:<width$}  {:>7}  {:>7}  {:>9}", "queue", "ready", "delayed", "in_flight")?;
        for q in &self.queues {
            writeln!(
                f,
                "{:<width$}  {:>7}  {:>7}  {:>9}",
                q.queue, q.counts.ready, q.counts.delayed, q.counts.in_flight
            )?;
        }
        Ok(())
    }
}
