//! In-memory broker.
//!
//! Messages are kept encoded, the way a networked broker holds them. Each
//! named queue has a FIFO of eligible messages and a min-heap of delayed ones
//! ordered by not-before time; delayed messages move to the FIFO once due.
//! In-flight messages live in one table keyed by task id, so acknowledgement
//! does not need to know the queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{BrokerError, Envelope, TaskId};
use crate::ports::{Broker, Clock, QueueCounts, SystemClock, after, until};

/// A message as stored: wire bytes plus the header fields the broker
/// schedules on.
#[derive(Debug, Clone)]
struct Message {
    task_id: TaskId,
    not_before: Option<DateTime<Utc>>,
    bytes: Vec<u8>,
}

impl Message {
    fn encode(envelope: &Envelope) -> Result<Self, BrokerError> {
        Ok(Self {
            task_id: envelope.task_id,
            not_before: envelope.not_before,
            bytes: envelope.encode()?,
        })
    }
}

/// Delayed entry. Reverse ordering turns `BinaryHeap` into a min-heap on
/// (due, seq).
#[derive(Debug)]
struct Delayed {
    due: DateTime<Utc>,
    seq: u64,
    message: Message,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    delayed: BinaryHeap<Delayed>,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.peek() {
            if entry.due > now {
                break;
            }
            if let Some(entry) = self.delayed.pop() {
                self.ready.push_back(entry.message);
            }
        }
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.delayed.peek().map(|entry| entry.due)
    }
}

#[derive(Debug)]
struct InFlight {
    queue: String,
    message: Message,
    delivered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    in_flight: HashMap<TaskId, InFlight>,
    next_seq: u64,
}

impl BrokerState {
    fn push(&mut self, queue: &str, message: Message, now: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let state = self.queues.entry(queue.to_string()).or_default();
        match message.not_before {
            Some(due) if due > now => state.delayed.push(Delayed { due, seq, message }),
            _ => state.ready.push_back(message),
        }
    }

    /// Pop from the first queue (in the given order) with an eligible
    /// message, or report the earliest delayed due time among them.
    fn pop_any(&mut self, queues: &[&str], now: DateTime<Utc>) -> Result<Message, Option<DateTime<Utc>>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for name in queues {
            let Some(state) = self.queues.get_mut(*name) else {
                continue;
            };
            state.promote_due(now);
            if let Some(message) = state.ready.pop_front() {
                return Ok(message);
            }
            earliest = match (earliest, state.next_due()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        Err(earliest)
    }

    /// Take an in-flight message back out, re-stamp it, and queue it again.
    fn reschedule(
        &mut self,
        task_id: TaskId,
        delay: Duration,
        now: DateTime<Utc>,
        bump_retries: bool,
    ) -> Result<u32, BrokerError> {
        let flight = self
            .in_flight
            .get(&task_id)
            .ok_or(BrokerError::UnknownTask(task_id))?;
        let mut envelope = Envelope::decode(&flight.message.bytes)?;

        if bump_retries {
            let retries = envelope.retries + 1;
            if retries > envelope.max_retries {
                return Err(BrokerError::RetriesExhausted {
                    task_id,
                    retries,
                    max_retries: envelope.max_retries,
                });
            }
            envelope.retries = retries;
        }
        envelope.enqueued_at = now;
        envelope.not_before = (!delay.is_zero()).then(|| after(now, delay));

        let message = Message::encode(&envelope)?;
        let queue = flight.queue.clone();
        self.in_flight.remove(&task_id);
        self.push(&queue, message, now);
        Ok(envelope.retries)
    }
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (`false`) or coming back (`true`).
    /// While unavailable every operation fails with `QueueUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
        if available {
            self.notify.notify_waiters();
        }
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::QueueUnavailable("in-memory broker offline".into()))
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError> {
        self.check_available()?;
        let message = Message::encode(&envelope)?;
        {
            let mut state = self.state.lock().await;
            state.push(&envelope.queue, message, self.clock.now());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue_any(
        &self,
        queues: &[&str],
        timeout: Duration,
    ) -> Result<Option<Envelope>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_available()?;

            // Register for wakeups before looking, so an enqueue between the
            // check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = self.clock.now();
            let next_due = {
                let mut state = self.state.lock().await;
                match state.pop_any(queues, now) {
                    Ok(message) => {
                        let envelope = Envelope::decode(&message.bytes)?;
                        state.in_flight.insert(
                            message.task_id,
                            InFlight {
                                queue: envelope.queue.clone(),
                                message,
                                delivered_at: now,
                            },
                        );
                        return Ok(Some(envelope));
                    }
                    Err(next_due) => next_due,
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let wait = match next_due {
                Some(due) => remaining.min(until(now, due).max(Duration::from_millis(1))),
                None => remaining,
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn acknowledge(&self, task_id: TaskId) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&task_id)
            .map(|_| ())
            .ok_or(BrokerError::UnknownTask(task_id))
    }

    async fn requeue_with_delay(&self, task_id: TaskId, delay: Duration) -> Result<u32, BrokerError> {
        self.check_available()?;
        let retries = {
            let mut state = self.state.lock().await;
            state.reschedule(task_id, delay, self.clock.now(), true)?
        };
        self.notify.notify_waiters();
        Ok(retries)
    }

    async fn defer(&self, task_id: TaskId, delay: Duration) -> Result<(), BrokerError> {
        self.check_available()?;
        {
            let mut state = self.state.lock().await;
            state.reschedule(task_id, delay, self.clock.now(), false)?;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn restore_unacked(&self, visibility_timeout: Duration) -> Result<Vec<TaskId>, BrokerError> {
        self.check_available()?;
        let now = self.clock.now();
        let restored = {
            let mut state = self.state.lock().await;
            let stale: Vec<TaskId> = state
                .in_flight
                .iter()
                .filter(|(_, flight)| until(flight.delivered_at, now) >= visibility_timeout)
                .map(|(id, _)| *id)
                .collect();
            for task_id in &stale {
                if let Some(flight) = state.in_flight.remove(task_id) {
                    // Redelivered ahead of newer work; it was the oldest.
                    state
                        .queues
                        .entry(flight.queue)
                        .or_default()
                        .ready
                        .push_front(flight.message);
                }
            }
            stale
        };
        if !restored.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(restored)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let in_flight = state
            .in_flight
            .values()
            .filter(|flight| flight.queue == queue)
            .count();
        let (ready, delayed) = match state.queues.get_mut(queue) {
            Some(q) => {
                q.promote_due(now);
                (q.ready.len(), q.delayed.len())
            }
            None => (0, 0),
        };
        Ok(QueueCounts {
            ready,
            delayed,
            in_flight,
        })
    }
}
