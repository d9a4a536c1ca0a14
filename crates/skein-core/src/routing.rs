//! Static task-type → queue routing.

use std::collections::HashMap;

use crate::domain::TaskType;

/// Maps every task type to exactly one queue. Unmapped types go to the
/// default queue.
#[derive(Debug, Clone)]
pub struct Router {
    default_queue: String,
    routes: HashMap<TaskType, String>,
}

impl Router {
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            default_queue: default_queue.into(),
            routes: HashMap::new(),
        }
    }

    pub fn with_route(mut self, task_type: impl Into<TaskType>, queue: impl Into<String>) -> Self {
        self.routes.insert(task_type.into(), queue.into());
        self
    }

    pub fn route(&self, task_type: &TaskType) -> &str {
        self.routes
            .get(task_type)
            .map(String::as_str)
            .unwrap_or(&self.default_queue)
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// Every queue a task can land on: the default queue first, then the
    /// routed queues in name order.
    pub fn queues(&self) -> Vec<&str> {
        let mut routed: Vec<&str> = self
            .routes
            .values()
            .map(String::as_str)
            .filter(|q| *q != self.default_queue)
            .collect();
        routed.sort_unstable();
        routed.dedup();

        let mut queues = vec![self.default_queue.as_str()];
        queues.extend(routed);
        queues
    }
}

impl<K, V> FromIterator<(K, V)> for Router
where
    K: Into<TaskType>,
    V: Into<String>,
{
    /// Router with the `default` queue and the given routes.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Router::new("default"), |r, (k, v)| r.with_route(k, v))
    }
}
