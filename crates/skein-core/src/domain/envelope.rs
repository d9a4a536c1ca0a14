//! Envelope - the unit placed on a queue, and its wire encoding.
//!
//! An Envelope wraps a `TaskSignature` with delivery metadata. The broker
//! stores envelopes encoded (`encode` / `decode`) the way a networked broker
//! would hold message bodies; only the scheduling header (id, not-before)
//! stays in decoded form next to the bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskSignature, TaskType};

/// Body encoding carried in every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "application/json")]
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub task_id: TaskId,
    pub signature: TaskSignature,

    /// Queue the envelope was routed to at submission.
    pub queue: String,

    /// Number of requeues after failure. Starts at 0.
    pub retries: u32,

    /// Upper bound for `retries`, resolved from configuration at submission.
    pub max_retries: u32,

    /// When the envelope was (re)placed on the queue.
    pub enqueued_at: DateTime<Utc>,

    /// The envelope must not be delivered before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(
        task_id: TaskId,
        signature: TaskSignature,
        queue: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let not_before = signature.not_before(now);
        Self {
            task_id,
            signature,
            queue: queue.into(),
            retries: 0,
            max_retries,
            enqueued_at: now,
            not_before,
        }
    }

    pub fn task_type(&self) -> &TaskType {
        self.signature.task_type()
    }

    /// Whether a worker may receive this envelope at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }

    pub fn retries_left(&self) -> u32 {
        self.max_retries.saturating_sub(self.retries)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = WireMessage {
            content_type: ContentType::Json,
            body: self,
        };
        serde_json::to_vec(&wire).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireMessageOwned =
            serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
        match wire.content_type {
            ContentType::Json => Ok(wire.body),
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    content_type: ContentType,
    body: &'a Envelope,
}

#[derive(Deserialize)]
struct WireMessageOwned {
    content_type: ContentType,
    body: Envelope,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("envelope encode: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("envelope decode: {0}")]
    Decode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn countdown_sets_not_before() {
        let sig = TaskSignature::new("add").with_countdown(Duration::from_secs(5));
        let env = Envelope::new(TaskId::generate(), sig, "default", 3, now());

        assert_eq!(env.retries, 0);
        assert!(!env.is_eligible(now()));
        assert!(env.is_eligible(now() + chrono::Duration::seconds(5)));
    }

    #[test]
    fn wire_format_is_tagged_json() {
        let env = Envelope::new(
            TaskId::generate(),
            TaskSignature::new("add").arg(1).arg(2),
            "default",
            3,
            now(),
        );
        let bytes = env.encode().unwrap();

        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["content_type"], "application/json");
        assert_eq!(v["body"]["queue"], "default");
        assert_eq!(v["body"]["signature"]["task_type"], "add");

        assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Envelope::decode(b"{\"content_type\":\"text/plain\"}").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
