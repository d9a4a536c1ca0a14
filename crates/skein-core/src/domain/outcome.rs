//! TaskOutcome: what a handler returns.
//!
//! Handlers report their result as a value instead of raising: success with a
//! JSON value, an explicit request to be retried, or a business failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Finished; `value` is stored and handed to the success callback.
    Success { value: Value },

    /// Ask to be run again. `countdown` overrides the configured retry delay.
    Retry {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        countdown: Option<Duration>,
    },

    /// Business failure. Retried like `Retry` while retries remain.
    Failure { message: String },
}

impl TaskOutcome {
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success {
            value: value.into(),
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
            countdown: None,
        }
    }

    pub fn retry_in(reason: impl Into<String>, countdown: Duration) -> Self {
        Self::Retry {
            reason: reason.into(),
            countdown: Some(countdown),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl<E: std::fmt::Display> From<Result<Value, E>> for TaskOutcome {
    fn from(result: Result<Value, E>) -> Self {
        match result {
            Ok(value) => Self::Success { value },
            Err(e) => Self::failure(e.to_string()),
        }
    }
}
