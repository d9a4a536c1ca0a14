//! Task status as seen through the result store.

use serde::{Deserialize, Serialize};

/// Lifecycle of one task.
///
/// State transitions:
/// - Pending -> Started -> Success
/// - Pending -> Started -> Retry -> Started -> ... (until max_retries)
/// - Pending -> Started -> Failure
///
/// `Success` and `Failure` are terminal: the result store refuses to move a
/// record out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Submitted, waiting in a queue.
    Pending,

    /// Delivered to a worker and running.
    Started,

    /// Failed, requeued with a delay.
    Retry,

    /// Finished with a result.
    Success,

    /// Finished with an error. No more attempts.
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}
