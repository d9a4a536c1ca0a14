//! TaskSignature: an immutable description of one task invocation.
//!
//! A signature names the task type, carries its arguments and delivery options,
//! and may link a success callback and a failure callback. Signatures are built
//! with consuming `with_*` methods; once handed to a producer they are never
//! mutated. Attaching a different callback produces a new signature.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::TaskType;
use crate::rate_limit::RateLimitSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSignature {
    task_type: TaskType,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    kwargs: Map<String, Value>,

    /// Enqueued after success, with the result as its leading argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link: Option<Box<TaskSignature>>,

    /// Enqueued after terminal failure, with `(task_id, error)` as arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link_error: Option<Box<TaskSignature>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    countdown: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    eta: Option<DateTime<Utc>>,

    /// Overrides the configured rate limit for this task type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rate_limit: Option<RateLimitSpec>,
}

impl TaskSignature {
    pub fn new(task_type: impl Into<TaskType>) -> Self {
        Self {
            task_type: task_type.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            link: None,
            link_error: None,
            countdown: None,
            eta: None,
            rate_limit: None,
        }
    }

    /// Append one positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append several positional arguments.
    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_link(mut self, callback: TaskSignature) -> Self {
        self.link = Some(Box::new(callback));
        self
    }

    pub fn with_link_error(mut self, errback: TaskSignature) -> Self {
        self.link_error = Some(Box::new(errback));
        self
    }

    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_rate_limit(mut self, spec: RateLimitSpec) -> Self {
        self.rate_limit = Some(spec);
        self
    }

    /// Copy of this signature with `value` inserted as the first positional
    /// argument. Used when a callback receives its predecessor's result.
    pub fn with_leading_arg(mut self, value: Value) -> Self {
        self.args.insert(0, value);
        self
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn positional(&self) -> &[Value] {
        &self.args
    }

    pub fn keywords(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn link(&self) -> Option<&TaskSignature> {
        self.link.as_deref()
    }

    pub fn link_error(&self) -> Option<&TaskSignature> {
        self.link_error.as_deref()
    }

    pub fn countdown(&self) -> Option<Duration> {
        self.countdown
    }

    pub fn eta(&self) -> Option<DateTime<Utc>> {
        self.eta
    }

    pub fn rate_limit(&self) -> Option<&RateLimitSpec> {
        self.rate_limit.as_ref()
    }

    /// Earliest delivery time: `eta` wins over `countdown`; `None` means now.
    pub fn not_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(eta) = self.eta {
            return Some(eta);
        }
        self.countdown
            .map(|c| crate::ports::clock::after(now, c))
    }
}
