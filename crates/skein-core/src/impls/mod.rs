//! Backends for the ports.
//!
//! The in-memory backends run the whole engine inside one process (tests,
//! the demo CLI). `transport` wraps any backend with retry-on-outage.

pub mod inmem_broker;
pub mod inmem_chords;
pub mod inmem_results;
pub mod transport;

pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_chords::InMemoryChordStore;
pub use self::inmem_results::InMemoryResultStore;
pub use self::transport::{RetryingBroker, RetryingResultStore};
