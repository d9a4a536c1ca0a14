//! IdGenerator port - ID minting behind a trait.

use ulid::Ulid;

use crate::domain::{ChordId, TaskId};
use crate::ports::Clock;

/// Generates ids that are unique across processes without coordination.
pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn chord_id(&self) -> ChordId;
}

/// ULID generator whose timestamp part comes from a `Clock`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn chord_id(&self) -> ChordId {
        ChordId::from(self.next())
    }
}
