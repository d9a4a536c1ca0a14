//! In-memory chord store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::domain::{ChordId, ChordStoreError};
use crate::ports::{ChordPhase, ChordProgress, ChordState, ChordStore, Clock, SystemClock, after};

pub struct InMemoryChordStore {
    chords: Mutex<HashMap<ChordId, ChordState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryChordStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            chords: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Stored chords, settled ones included.
    pub async fn len(&self) -> usize {
        self.chords.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chords.lock().await.is_empty()
    }
}

impl Default for InMemoryChordStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl ChordStore for InMemoryChordStore {
    async fn create(&self, state: ChordState) -> Result<(), ChordStoreError> {
        self.chords.lock().await.insert(state.chord_id, state);
        Ok(())
    }

    async fn complete_header(
        &self,
        chord_id: ChordId,
        index: usize,
        value: Value,
    ) -> Result<ChordProgress, ChordStoreError> {
        let mut chords = self.chords.lock().await;
        let chord = chords
            .get_mut(&chord_id)
            .ok_or(ChordStoreError::UnknownChord(chord_id))?;
        if chord.is_settled() {
            return Ok(ChordProgress::Settled);
        }
        let slot = chord
            .slots
            .get_mut(index)
            .ok_or(ChordStoreError::SlotOutOfRange { chord_id, index })?;
        if slot.is_none() {
            *slot = Some(value);
            chord.remaining -= 1;
        }
        if chord.remaining > 0 {
            return Ok(ChordProgress::Waiting {
                remaining: chord.remaining,
            });
        }

        let results = chord
            .slots
            .iter()
            .map(|slot| slot.clone().unwrap_or(Value::Null))
            .collect();
        Ok(ChordProgress::Ready {
            body: chord.body.clone(),
            result_id: chord.result_id,
            results,
        })
    }

    async fn fail_header(&self, chord_id: ChordId) -> Result<ChordProgress, ChordStoreError> {
        let mut chords = self.chords.lock().await;
        let chord = chords
            .get_mut(&chord_id)
            .ok_or(ChordStoreError::UnknownChord(chord_id))?;
        if chord.is_settled() {
            return Ok(ChordProgress::Settled);
        }
        chord.phase = ChordPhase::Failed;
        chord.settled_at = Some(self.clock.now());
        Ok(ChordProgress::Failed {
            result_id: chord.result_id,
        })
    }

    async fn mark_fired(&self, chord_id: ChordId) -> Result<(), ChordStoreError> {
        let mut chords = self.chords.lock().await;
        let chord = chords
            .get_mut(&chord_id)
            .ok_or(ChordStoreError::UnknownChord(chord_id))?;
        if !chord.is_settled() {
            chord.phase = ChordPhase::Fired;
            chord.settled_at = Some(self.clock.now());
        }
        Ok(())
    }

    async fn get(&self, chord_id: ChordId) -> Result<Option<ChordState>, ChordStoreError> {
        Ok(self.chords.lock().await.get(&chord_id).cloned())
    }

    async fn sweep_settled(&self, retention: Duration) -> Result<usize, ChordStoreError> {
        let now = self.clock.now();
        let mut chords = self.chords.lock().await;
        let before = chords.len();
        chords.retain(|_, chord| match chord.settled_at {
            Some(settled_at) => after(settled_at, retention) > now,
            None => true,
        });
        Ok(before - chords.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskSignature};
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    async fn chord(store: &InMemoryChordStore, headers: usize) -> (ChordId, TaskId) {
        let chord_id = ChordId::generate();
        let result_id = TaskId::generate();
        store
            .create(ChordState::new(chord_id, TaskSignature::new("summarize"), result_id, headers))
            .await
            .unwrap();
        (chord_id, result_id)
    }

    #[tokio::test]
    async fn results_keep_header_order_regardless_of_completion_order() {
        let store = InMemoryChordStore::default();
        let (id, result_id) = chord(&store, 3).await;

        assert_eq!(
            store.complete_header(id, 2, json!(4)).await.unwrap(),
            ChordProgress::Waiting { remaining: 2 }
        );
        store.complete_header(id, 0, json!(2)).await.unwrap();
        let progress = store.complete_header(id, 1, json!(3)).await.unwrap();

        assert_eq!(
            progress,
            ChordProgress::Ready {
                body: TaskSignature::new("summarize"),
                result_id,
                results: vec![json!(2), json!(3), json!(4)],
            }
        );
        assert_eq!(store.get(id).await.unwrap().unwrap().phase, ChordPhase::Waiting);
        store.mark_fired(id).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().phase, ChordPhase::Fired);
    }

    #[tokio::test]
    async fn duplicate_reports_count_once() {
        let store = InMemoryChordStore::default();
        let (id, _) = chord(&store, 2).await;

        store.complete_header(id, 0, json!(1)).await.unwrap();
        assert_eq!(
            store.complete_header(id, 0, json!(1)).await.unwrap(),
            ChordProgress::Waiting { remaining: 1 }
        );
        assert!(matches!(
            store.complete_header(id, 1, json!(2)).await.unwrap(),
            ChordProgress::Ready { .. }
        ));
        store.mark_fired(id).await.unwrap();
        assert_eq!(
            store.complete_header(id, 1, json!(2)).await.unwrap(),
            ChordProgress::Settled
        );
    }

    #[tokio::test]
    async fn ready_is_reissued_until_the_body_is_marked_fired() {
        let store = InMemoryChordStore::default();
        let (id, result_id) = chord(&store, 1).await;

        let first = store.complete_header(id, 0, json!(5)).await.unwrap();
        let again = store.complete_header(id, 0, json!(5)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(
            again,
            ChordProgress::Ready {
                body: TaskSignature::new("summarize"),
                result_id,
                results: vec![json!(5)],
            }
        );
        assert!(store.get(id).await.unwrap().unwrap().settled_at.is_none());

        store.mark_fired(id).await.unwrap();
        assert_eq!(
            store.complete_header(id, 0, json!(5)).await.unwrap(),
            ChordProgress::Settled
        );
    }

    #[tokio::test]
    async fn sweep_drops_only_chords_settled_past_retention() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = InMemoryChordStore::new(clock.clone());
        let retention = Duration::from_secs(60);

        let (fired, _) = chord(&store, 1).await;
        store.complete_header(fired, 0, json!(1)).await.unwrap();
        store.mark_fired(fired).await.unwrap();
        let (failed, _) = chord(&store, 2).await;
        store.fail_header(failed).await.unwrap();
        let (waiting, _) = chord(&store, 2).await;

        clock.advance(Duration::from_secs(59));
        assert_eq!(store.sweep_settled(retention).await.unwrap(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.sweep_settled(retention).await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
        assert!(store.get(waiting).await.unwrap().is_some());
        assert!(store.get(fired).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_failure_settles_the_chord() {
        let store = InMemoryChordStore::default();
        let (id, result_id) = chord(&store, 3).await;

        store.complete_header(id, 0, json!(1)).await.unwrap();
        assert_eq!(
            store.fail_header(id).await.unwrap(),
            ChordProgress::Failed { result_id }
        );
        assert_eq!(store.fail_header(id).await.unwrap(), ChordProgress::Settled);
        assert_eq!(
            store.complete_header(id, 1, json!(2)).await.unwrap(),
            ChordProgress::Settled
        );
    }

    #[tokio::test]
    async fn bad_ids_and_slots_are_errors() {
        let store = InMemoryChordStore::default();
        assert!(matches!(
            store.fail_header(ChordId::generate()).await,
            Err(ChordStoreError::UnknownChord(_))
        ));

        let (id, _) = chord(&store, 1).await;
        assert!(matches!(
            store.complete_header(id, 5, json!(0)).await,
            Err(ChordStoreError::SlotOutOfRange { index: 5, .. })
        ));
    }
}
