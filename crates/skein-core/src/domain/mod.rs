//! Domain model: ids, signatures, envelopes, result records, outcomes, errors.

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod result;
pub mod signature;
pub mod state;
pub mod task_type;

pub use envelope::{CodecError, ContentType, Envelope};
pub use errors::{BrokerError, ChordStoreError, ResultStoreError, SkeinError};
pub use ids::{ChordId, TaskId};
pub use outcome::TaskOutcome;
pub use result::{ErrorKind, ResultRecord, TaskError};
pub use signature::TaskSignature;
pub use state::TaskStatus;
pub use task_type::TaskType;
