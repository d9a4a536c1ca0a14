//! Errors raised by the engine itself.
//!
//! Task-level failures are not Rust errors: they end up as `TaskError`
//! payloads in FAILURE records. The enums here cover the broker, the stores
//! and programming mistakes that callers must see.

use thiserror::Error;

use super::envelope::CodecError;
use super::{ChordId, TaskId, TaskStatus, TaskType};

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Backend unreachable. Retried with backoff by the transport layer.
    #[error("queue backend unavailable: {0}")]
    QueueUnavailable(String),

    /// `acknowledge` / requeue for an id that is not in flight.
    #[error("task {0} is not in flight")]
    UnknownTask(TaskId),

    /// Requeue would push the retry count past `max_retries`.
    #[error("task {task_id} exhausted its retries ({retries}/{max_retries})")]
    RetriesExhausted {
        task_id: TaskId,
        retries: u32,
        max_retries: u32,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BrokerError {
    /// Errors worth retrying at the transport level.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::QueueUnavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum ResultStoreError {
    #[error("result backend unavailable: {0}")]
    Unavailable(String),

    /// Write to a record that already reached SUCCESS/FAILURE.
    #[error("result for {task_id} is terminal ({current:?}); refusing {attempted:?}")]
    ResultImmutable {
        task_id: TaskId,
        current: TaskStatus,
        attempted: TaskStatus,
    },
}

impl ResultStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResultStoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum ChordStoreError {
    #[error("chord backend unavailable: {0}")]
    Unavailable(String),

    #[error("unknown chord {0}")]
    UnknownChord(ChordId),

    #[error("chord {chord_id} has no header slot {index}")]
    SlotOutOfRange { chord_id: ChordId, index: usize },
}

#[derive(Debug, Error)]
pub enum SkeinError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Results(#[from] ResultStoreError),

    #[error(transparent)]
    Chord(#[from] ChordStoreError),

    #[error("handler not found for task_type={0}")]
    HandlerNotFound(TaskType),

    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(TaskType),

    #[error("{0} needs at least one task")]
    EmptyWorkflow(&'static str),

    #[error("timed out waiting for {0}")]
    WaitTimeout(TaskId),
}
