//! Beat: submits periodic tasks on a fixed interval.
//!
//! Each entry first fires one interval after beat starts. After a firing
//! the next one is scheduled one interval from the moment it actually
//! fired, so a stalled beat does not catch up on missed runs.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{BeatEntry, Config};
use crate::domain::{TaskId, TaskSignature};

use super::background::{LoopHandle, deadline_after};
use super::client::Client;

#[derive(Debug, Clone)]
struct Scheduled {
    name: String,
    signature: TaskSignature,
    interval: Duration,
}

pub struct Beat {
    client: Client,
    entries: Vec<Scheduled>,
}

impl Beat {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            entries: Vec::new(),
        }
    }

    /// Beat over every entry of `config.beat_schedule`.
    pub fn from_config(client: Client, config: &Config) -> Self {
        config
            .beat_schedule
            .iter()
            .fold(Self::new(client), |beat, (name, entry)| {
                beat.with_entry(name.clone(), entry)
            })
    }

    /// Entries with a zero interval are skipped.
    pub fn with_entry(mut self, name: impl Into<String>, entry: &BeatEntry) -> Self {
        let name = name.into();
        let interval = entry.interval();
        if interval.is_zero() {
            tracing::warn!(entry = %name, "beat entry has a zero interval; skipping");
            return self;
        }
        self.entries.push(Scheduled {
            name,
            signature: entry.signature(),
            interval,
        });
        self
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn spawn(self) -> LoopHandle {
        LoopHandle::spawn("beat", move |rx| self.run(rx))
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let start = Instant::now();
        let mut due: Vec<Instant> = self
            .entries
            .iter()
            .map(|e| deadline_after(start, e.interval))
            .collect();
        tracing::info!(entries = self.entries.len(), "beat started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let Some(next) = due.iter().min().copied() else {
                // nothing scheduled; idle until told to stop
                let _ = shutdown_rx.changed().await;
                break;
            };

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(next) => {}
            }

            let now = Instant::now();
            for (entry, due) in self.entries.iter().zip(due.iter_mut()) {
                if *due <= now {
                    self.fire(entry).await;
                    *due = deadline_after(now, entry.interval);
                }
            }
        }
        tracing::info!("beat stopped");
    }

    async fn fire(&self, entry: &Scheduled) -> Option<TaskId> {
        match self.client.submit(entry.signature.clone()).await {
            Ok(task_id) => {
                tracing::info!(entry = %entry.name, %task_id, task = %entry.signature.task_type(), "beat fired");
                Some(task_id)
            }
            Err(e) => {
                tracing::error!(entry = %entry.name, error = %e, "beat could not submit task");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::AppBuilder;
    use crate::ports::Broker;

    fn config() -> Config {
        Config::default()
            .with_beat_entry("tick", BeatEntry::new("tick", Duration::from_secs(60)))
            .with_beat_entry("zero", BeatEntry::new("zero", Duration::ZERO))
    }

    async fn ready(app: &crate::app::App) -> usize {
        app.broker().counts("default").await.unwrap().ready
    }

    #[test]
    fn zero_interval_entries_are_dropped() {
        let app = AppBuilder::new(Config::default()).build().unwrap();
        let beat = Beat::from_config(app.client(), &config());
        assert_eq!(beat.entry_names().collect::<Vec<_>>(), vec!["tick"]);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_interval_after_the_first_interval() {
        let app = AppBuilder::new(Config::default()).build().unwrap();
        let handle = Beat::from_config(app.client(), &config()).spawn();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(ready(&app).await, 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ready(&app).await, 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ready(&app).await, 3);

        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_tasks_carry_the_entry_arguments() {
        let app = AppBuilder::new(Config::default()).build().unwrap();
        let mut entry = BeatEntry::new("report", Duration::from_secs(5));
        entry.args = vec![serde_json::json!(7)];
        let handle = Beat::new(app.client()).with_entry("report", &entry).spawn();

        tokio::time::sleep(Duration::from_secs(6)).await;
        handle.shutdown_and_join().await;

        let envelope = app
            .broker()
            .dequeue("default", Duration::ZERO)
            .await
            .unwrap()
            .expect("beat submitted a task");
        assert_eq!(envelope.task_type().as_str(), "report");
        assert_eq!(envelope.signature.positional(), &[serde_json::json!(7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_beat_idles_until_shutdown() {
        let app = AppBuilder::new(Config::default()).build().unwrap();
        let handle = Beat::new(app.client()).spawn();
        tokio::time::sleep(Duration::from_secs(600)).await;
        handle.shutdown_and_join().await;
        assert_eq!(ready(&app).await, 0);
    }
}
