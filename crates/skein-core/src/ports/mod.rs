//! Ports - the seams between the engine and its backends.
//!
//! The worker, client and composer only talk to these traits. `impls` holds
//! the in-memory backends; a networked broker or result store plugs in here.

pub mod broker;
pub mod chord_store;
pub mod clock;
pub mod id_generator;
pub mod result_store;

pub use self::broker::{Broker, QueueCounts};
pub use self::chord_store::{ChordPhase, ChordProgress, ChordState, ChordStore};
pub use self::clock::{Clock, ManualClock, SystemClock, after, until};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::result_store::ResultStore;
