//! ChordStore port - synchronization state of running chords.
//!
//! One entry per chord: a slot per header (in submission order) and a count
//! of headers still outstanding. Every update is atomic per chord, so header
//! callbacks may arrive concurrently and in any order.
//!
//! A chord settles when its body has been enqueued (`mark_fired`) or a
//! header failed. Settled chords are kept for a retention period so late
//! header reports resolve to `Settled`, then `sweep_settled` drops them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ChordId, ChordStoreError, TaskId, TaskSignature};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChordPhase {
    /// Headers outstanding, or all reported and the body not yet enqueued.
    Waiting,
    /// Every header succeeded; the body has been enqueued.
    Fired,
    /// A header failed; the body is suppressed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordState {
    pub chord_id: ChordId,

    /// Body to enqueue once every header succeeded.
    pub body: TaskSignature,

    /// Id reserved for the body. The chord's own result lives here.
    pub result_id: TaskId,

    /// Header results by submission position.
    pub slots: Vec<Option<Value>>,

    /// Headers that have not reported yet.
    pub remaining: usize,

    pub phase: ChordPhase,

    /// When the chord fired or failed.
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

impl ChordState {
    pub fn new(chord_id: ChordId, body: TaskSignature, result_id: TaskId, headers: usize) -> Self {
        Self {
            chord_id,
            body,
            result_id,
            slots: vec![None; headers],
            remaining: headers,
            phase: ChordPhase::Waiting,
            settled_at: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.phase != ChordPhase::Waiting
    }
}

/// What a header report changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChordProgress {
    /// More headers outstanding.
    Waiting { remaining: usize },

    /// Every header has reported. Returned for each report until the body
    /// is marked fired, so a callback retried after a failed body submission
    /// releases it again.
    Ready {
        body: TaskSignature,
        result_id: TaskId,
        results: Vec<Value>,
    },

    /// First failure for this chord. Returned exactly once per chord.
    Failed { result_id: TaskId },

    /// Chord already fired or failed; the report changes nothing.
    Settled,
}

#[async_trait]
pub trait ChordStore: Send + Sync {
    async fn create(&self, state: ChordState) -> Result<(), ChordStoreError>;

    /// Record header `index`'s result. Reporting the same slot twice counts once.
    async fn complete_header(
        &self,
        chord_id: ChordId,
        index: usize,
        value: Value,
    ) -> Result<ChordProgress, ChordStoreError>;

    /// Record a header failure. Settles the chord.
    async fn fail_header(&self, chord_id: ChordId) -> Result<ChordProgress, ChordStoreError>;

    /// The body was enqueued. Settles the chord; later reports are `Settled`.
    async fn mark_fired(&self, chord_id: ChordId) -> Result<(), ChordStoreError>;

    async fn get(&self, chord_id: ChordId) -> Result<Option<ChordState>, ChordStoreError>;

    /// Drop chords settled at least `retention` ago. Returns how many were removed.
    async fn sweep_settled(&self, retention: Duration) -> Result<usize, ChordStoreError>;
}
