//! Engine configuration.
//!
//! Built once at startup (YAML file, then environment overrides), validated,
//! and handed to every component as `Arc<Config>`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{TaskSignature, TaskType};
use crate::rate_limit::RateLimitSpec;
use crate::retry::RetryPolicy;
use crate::routing::Router;

pub const ENV_BROKER_URL: &str = "SKEIN_BROKER_URL";
pub const ENV_RESULT_BACKEND: &str = "SKEIN_RESULT_BACKEND";

const MEMORY_SCHEME: &str = "memory://";

/// Upper bound for per-task delays and time limits (one year).
const MAX_TASK_SECS: f64 = 365.0 * 86_400.0;

const INTERNAL_MAX_RETRIES: u32 = 10;
const INTERNAL_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{option}: unsupported backend {url:?} (only memory:// is built in)")]
    UnsupportedBackend { option: &'static str, url: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-task-type overrides. Unset fields fall back to `task_defaults`, then
/// to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<f64>,
    /// Delay multiplier per retry. 1.0 keeps the delay constant.
    pub retry_backoff: Option<f64>,
    pub retry_backoff_max_secs: Option<f64>,
    pub retry_jitter: Option<bool>,
    pub soft_time_limit_secs: Option<f64>,
    pub time_limit_secs: Option<f64>,
    pub rate_limit: Option<RateLimitSpec>,
}

impl TaskOptions {
    fn or(&self, fallback: &TaskOptions) -> TaskOptions {
        TaskOptions {
            max_retries: self.max_retries.or(fallback.max_retries),
            retry_delay_secs: self.retry_delay_secs.or(fallback.retry_delay_secs),
            retry_backoff: self.retry_backoff.or(fallback.retry_backoff),
            retry_backoff_max_secs: self.retry_backoff_max_secs.or(fallback.retry_backoff_max_secs),
            retry_jitter: self.retry_jitter.or(fallback.retry_jitter),
            soft_time_limit_secs: self.soft_time_limit_secs.or(fallback.soft_time_limit_secs),
            time_limit_secs: self.time_limit_secs.or(fallback.time_limit_secs),
            rate_limit: self.rate_limit.or(fallback.rate_limit),
        }
    }
}

/// Fully resolved options for one task type.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSettings {
    pub max_retries: u32,
    pub retry: RetryPolicy,
    pub soft_time_limit: Option<Duration>,
    pub time_limit: Option<Duration>,
    pub rate_limit: Option<RateLimitSpec>,
}

/// One periodic entry fired by beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatEntry {
    pub task: TaskType,
    pub interval_secs: f64,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl BeatEntry {
    pub fn new(task: impl Into<TaskType>, interval: Duration) -> Self {
        Self {
            task: task.into(),
            interval_secs: interval.as_secs_f64(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        secs(self.interval_secs)
    }

    pub fn signature(&self) -> TaskSignature {
        self.kwargs.iter().fold(
            TaskSignature::new(self.task.clone()).args(self.args.iter().cloned()),
            |sig, (k, v)| sig.kwarg(k.clone(), v.clone()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker_url: String,
    pub result_backend: String,
    pub default_queue: String,
    pub task_routes: HashMap<TaskType, String>,
    pub task_defaults: TaskOptions,
    pub tasks: HashMap<TaskType, TaskOptions>,
    pub result_expires_secs: f64,
    pub worker_concurrency: usize,
    /// Queues a worker consumes, highest priority first. Empty means the
    /// default queue only.
    pub worker_queues: Vec<String>,
    pub dequeue_timeout_secs: f64,
    pub visibility_timeout_secs: f64,
    pub result_sweep_interval_secs: f64,
    /// How often in-flight messages are checked against the visibility timeout.
    pub reaper_interval_secs: f64,
    pub beat_schedule: BTreeMap<String, BeatEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: MEMORY_SCHEME.to_string(),
            result_backend: MEMORY_SCHEME.to_string(),
            default_queue: "default".to_string(),
            task_routes: HashMap::new(),
            task_defaults: TaskOptions::default(),
            tasks: HashMap::new(),
            result_expires_secs: 86_400.0,
            worker_concurrency: 4,
            worker_queues: Vec::new(),
            dequeue_timeout_secs: 1.0,
            visibility_timeout_secs: 3_600.0,
            result_sweep_interval_secs: 60.0,
            reaper_interval_secs: 30.0,
            beat_schedule: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Apply `SKEIN_BROKER_URL` / `SKEIN_RESULT_BACKEND` from the process
    /// environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_BROKER_URL) {
            self.broker_url = url;
        }
        if let Some(url) = lookup(ENV_RESULT_BACKEND) {
            self.result_backend = url;
        }
        self
    }

    pub fn with_route(mut self, task_type: impl Into<TaskType>, queue: impl Into<String>) -> Self {
        self.task_routes.insert(task_type.into(), queue.into());
        self
    }

    pub fn with_task(mut self, task_type: impl Into<TaskType>, options: TaskOptions) -> Self {
        self.tasks.insert(task_type.into(), options);
        self
    }

    pub fn with_beat_entry(mut self, name: impl Into<String>, entry: BeatEntry) -> Self {
        self.beat_schedule.insert(name.into(), entry);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_backend("broker_url", &self.broker_url)?;
        check_backend("result_backend", &self.result_backend)?;

        if self.default_queue.is_empty() {
            return Err(ConfigError::Invalid("default_queue is empty".into()));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid("worker_concurrency must be at least 1".into()));
        }
        positive("result_expires_secs", self.result_expires_secs)?;
        positive("dequeue_timeout_secs", self.dequeue_timeout_secs)?;
        positive("visibility_timeout_secs", self.visibility_timeout_secs)?;
        positive("result_sweep_interval_secs", self.result_sweep_interval_secs)?;
        positive("reaper_interval_secs", self.reaper_interval_secs)?;

        check_task_options("task_defaults", &self.task_defaults)?;
        for (task_type, options) in &self.tasks {
            check_task_options(task_type.as_str(), options)?;
            check_limits(task_type.as_str(), &options.or(&self.task_defaults))?;
        }
        check_limits("task_defaults", &self.task_defaults)?;

        for (name, entry) in &self.beat_schedule {
            positive(&format!("beat_schedule.{name}.interval_secs"), entry.interval_secs)?;
        }
        Ok(())
    }

    pub fn router(&self) -> Router {
        self.task_routes
            .iter()
            .fold(Router::new(self.default_queue.clone()), |r, (t, q)| {
                r.with_route(t.clone(), q.clone())
            })
    }

    /// Resolve the options for `task_type`: per-type, then `task_defaults`,
    /// then built-in defaults.
    ///
    /// Engine-owned task types ignore all of these and get fixed settings:
    /// no time limits, no rate limit and a short constant retry delay.
    pub fn task_settings(&self, task_type: &TaskType) -> TaskSettings {
        if task_type.is_internal() {
            return TaskSettings {
                max_retries: INTERNAL_MAX_RETRIES,
                retry: RetryPolicy::constant(INTERNAL_RETRY_DELAY),
                soft_time_limit: None,
                time_limit: None,
                rate_limit: None,
            };
        }
        let merged = match self.tasks.get(task_type) {
            Some(options) => options.or(&self.task_defaults),
            None => self.task_defaults.clone(),
        };
        let base = secs(merged.retry_delay_secs.unwrap_or(180.0));
        let max = secs(merged.retry_backoff_max_secs.unwrap_or(600.0));
        let retry = match merged.retry_backoff {
            Some(multiplier) if multiplier > 1.0 => RetryPolicy::exponential(base, multiplier, max),
            _ => RetryPolicy::constant(base),
        }
        .with_jitter(merged.retry_jitter.unwrap_or(false));

        TaskSettings {
            max_retries: merged.max_retries.unwrap_or(3),
            retry,
            soft_time_limit: merged.soft_time_limit_secs.map(secs),
            time_limit: merged.time_limit_secs.map(secs),
            rate_limit: merged.rate_limit,
        }
    }

    /// Queues a worker consumes, in priority order.
    pub fn worker_queues(&self) -> Vec<String> {
        if self.worker_queues.is_empty() {
            vec![self.default_queue.clone()]
        } else {
            self.worker_queues.clone()
        }
    }

    pub fn result_expires(&self) -> Duration {
        secs(self.result_expires_secs)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        secs(self.dequeue_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        secs(self.visibility_timeout_secs)
    }

    pub fn result_sweep_interval(&self) -> Duration {
        secs(self.result_sweep_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        secs(self.reaper_interval_secs)
    }
}

/// Seconds → Duration. Out-of-range values saturate instead of panicking;
/// `validate` is what rejects them.
fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

fn check_backend(option: &'static str, url: &str) -> Result<(), ConfigError> {
    if url == MEMORY_SCHEME || url.starts_with(MEMORY_SCHEME) {
        Ok(())
    } else {
        Err(ConfigError::UnsupportedBackend {
            option,
            url: url.to_string(),
        })
    }
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be a positive number of seconds, got {value}")))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must not be negative, got {value}")))
    }
}

fn at_most(name: &str, value: f64, max: f64) -> Result<(), ConfigError> {
    if value <= max {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be at most {max} seconds, got {value}")))
    }
}

fn check_task_options(scope: &str, options: &TaskOptions) -> Result<(), ConfigError> {
    if let Some(v) = options.retry_delay_secs {
        let name = format!("{scope}.retry_delay_secs");
        non_negative(&name, v)?;
        at_most(&name, v, MAX_TASK_SECS)?;
    }
    if let Some(v) = options.retry_backoff_max_secs {
        let name = format!("{scope}.retry_backoff_max_secs");
        non_negative(&name, v)?;
        at_most(&name, v, MAX_TASK_SECS)?;
    }
    if let Some(v) = options.retry_backoff
        && !(v.is_finite() && v >= 1.0)
    {
        return Err(ConfigError::Invalid(format!(
            "{scope}.retry_backoff must be at least 1.0, got {v}"
        )));
    }
    if let Some(v) = options.soft_time_limit_secs {
        let name = format!("{scope}.soft_time_limit_secs");
        positive(&name, v)?;
        at_most(&name, v, MAX_TASK_SECS)?;
    }
    if let Some(v) = options.time_limit_secs {
        let name = format!("{scope}.time_limit_secs");
        positive(&name, v)?;
        at_most(&name, v, MAX_TASK_SECS)?;
    }
    Ok(())
}

fn check_limits(scope: &str, options: &TaskOptions) -> Result<(), ConfigError> {
    if let (Some(soft), Some(hard)) = (options.soft_time_limit_secs, options.time_limit_secs)
        && soft >= hard
    {
        return Err(ConfigError::Invalid(format!(
            "{scope}: soft_time_limit_secs ({soft}) must be below time_limit_secs ({hard})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const YAML: &str = r#"
default_queue: celery
task_routes:
  important_task: high_priority
task_defaults:
  max_retries: 5
  retry_delay_secs: 2
tasks:
  add:
    rate_limit: "10/m"
    soft_time_limit_secs: 5
    time_limit_secs: 10
  failing_task:
    retry_backoff: 2.0
    retry_backoff_max_secs: 30
worker_concurrency: 8
worker_queues: [high_priority, celery]
beat_schedule:
  scheduled_task:
    task: scheduled_task
    interval_secs: 60
"#;

    #[test]
    fn loads_yaml_with_defaults_for_missing_fields() {
        let config = Config::from_yaml_str(YAML).unwrap();
        config.validate().unwrap();

        assert_eq!(config.default_queue, "celery");
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.result_expires(), Duration::from_secs(86_400));
        assert_eq!(config.worker_queues(), vec!["high_priority", "celery"]);
        assert_eq!(
            config.beat_schedule["scheduled_task"].interval(),
            Duration::from_secs(60)
        );

        let router = config.router();
        assert_eq!(router.route(&TaskType::new("important_task")), "high_priority");
        assert_eq!(router.route(&TaskType::new("add")), "celery");
    }

    #[test]
    fn task_settings_layer_per_type_over_defaults() {
        let config = Config::from_yaml_str(YAML).unwrap();

        let add = config.task_settings(&TaskType::new("add"));
        assert_eq!(add.max_retries, 5);
        assert_eq!(add.retry, RetryPolicy::constant(Duration::from_secs(2)));
        assert_eq!(add.soft_time_limit, Some(Duration::from_secs(5)));
        assert_eq!(add.time_limit, Some(Duration::from_secs(10)));
        assert_eq!(add.rate_limit, Some(RateLimitSpec::per_minute(10).unwrap()));

        let failing = config.task_settings(&TaskType::new("failing_task"));
        assert_eq!(failing.retry.next_delay(3), Duration::from_secs(8));
        assert_eq!(failing.retry.next_delay(10), Duration::from_secs(30));

        let other = config.task_settings(&TaskType::new("other"));
        assert_eq!(other.rate_limit, None);
        assert_eq!(other.time_limit, None);
    }

    #[test]
    fn internal_task_types_ignore_configured_options() {
        let config = Config::from_yaml_str(
            "task_defaults:\n  rate_limit: \"1/m\"\n  time_limit_secs: 5\n  retry_delay_secs: 180\n",
        )
        .unwrap();
        let settings = config.task_settings(&TaskType::new("skein.chord.header_done"));
        assert_eq!(settings.rate_limit, None);
        assert_eq!(settings.time_limit, None);
        assert_eq!(settings.soft_time_limit, None);
        assert_eq!(settings.retry, RetryPolicy::constant(INTERNAL_RETRY_DELAY));

        let user = config.task_settings(&TaskType::new("add"));
        assert_eq!(user.rate_limit, Some(RateLimitSpec::per_minute(1).unwrap()));
    }

    #[test]
    fn built_in_defaults() {
        let settings = Config::default().task_settings(&TaskType::new("x"));
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retry, RetryPolicy::constant(Duration::from_secs(180)));
        assert_eq!(Config::default().worker_queues(), vec!["default"]);
    }

    #[test]
    fn env_overrides_replace_backend_urls() {
        let config = Config::default().with_overrides_from(|key| match key {
            ENV_BROKER_URL => Some("redis://localhost:6379/0".into()),
            _ => None,
        });
        assert_eq!(config.broker_url, "redis://localhost:6379/0");
        assert_eq!(config.result_backend, "memory://");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedBackend { option: "broker_url", .. })
        ));
    }

    #[test]
    fn unparsable_rate_limit_fails_at_load() {
        let err = Config::from_yaml_str("tasks:\n  add:\n    rate_limit: \"ten/m\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[rstest]
    #[case("worker_concurrency: 0")]
    #[case("dequeue_timeout_secs: 0")]
    #[case("result_expires_secs: -1")]
    #[case("task_defaults:\n  soft_time_limit_secs: 10\n  time_limit_secs: 5")]
    #[case("tasks:\n  add:\n    soft_time_limit_secs: 10\ntask_defaults:\n  time_limit_secs: 10")]
    #[case("task_defaults:\n  retry_delay_secs: -3")]
    #[case("task_defaults:\n  retry_backoff: 0.5")]
    #[case("task_defaults:\n  retry_delay_secs: 1.0e30")]
    #[case("tasks:\n  add:\n    retry_backoff_max_secs: 1.0e30")]
    #[case("tasks:\n  add:\n    time_limit_secs: 1.0e30")]
    #[case("beat_schedule:\n  tick:\n    task: tick\n    interval_secs: 0")]
    fn validate_rejects(#[case] yaml: &str) {
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{yaml}");
    }

    #[test]
    fn beat_entry_builds_signature() {
        let entry: BeatEntry =
            serde_yaml::from_str("task: add\ninterval_secs: 5\nargs: [1, 2]\nkwargs: {z: 3}\n").unwrap();
        let sig = entry.signature();
        assert_eq!(sig.task_type().as_str(), "add");
        assert_eq!(sig.positional(), &[Value::from(1), Value::from(2)]);
        assert_eq!(sig.keywords()["z"], Value::from(3));
    }
}
