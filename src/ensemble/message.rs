//! Typed messages exchanged between actors within a session.
//!
//! Every message flowing through the [`MessageRouter`](crate::router::MessageRouter)
//! is an instance of [`Message`]: identity-tagged, timestamped, and carrying a
//! type drawn from the owning session's pattern vocabulary (or the standard
//! defaults). Payloads are opaque structured JSON — the core routes them, it
//! never interprets them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved sender/recipient identity for the orchestrator itself.
pub const ORCHESTRATOR: &str = "orchestrator";

/// Reserved sender identity for the invoking user.
pub const USER: &str = "user";

/// Reserved recipient identity for session-wide broadcast.
pub const ALL: &str = "all";

/// The standard message-type vocabulary available in every session regardless
/// of what its pattern declares.
///
/// | Type | Meaning |
/// |------|---------|
/// | `READY` | readiness signal after initialization |
/// | `RESULT` | sharing a partial or final result |
/// | `ACK` | acknowledging a received message |
/// | `DISCREPANCY` | flagging a disagreement with another actor's output |
/// | `CONSENSUS` | declaring agreement has been reached |
/// | `ESCALATE` | requesting orchestrator or coordinator attention |
/// | `INSTRUCTION` | directing another actor |
/// | `QUERY` | asking another actor a question |
/// | `RESPONSE` | answering a `QUERY` |
/// | `COMPLETE` | structured completion signal counted by the completion predicate |
pub const STANDARD_VOCABULARY: [&str; 10] = [
    "READY",
    "RESULT",
    "ACK",
    "DISCREPANCY",
    "CONSENSUS",
    "ESCALATE",
    "INSTRUCTION",
    "QUERY",
    "RESPONSE",
    "COMPLETE",
];

/// Message type that feeds the structured completion predicate.
pub const COMPLETE_TYPE: &str = "COMPLETE";

/// A single typed message owned by one session.
///
/// # Examples
///
/// ```
/// use ensemble::message::Message;
///
/// let msg = Message::new(
///     "mirror-1700000000000-ab12cd34",
///     "mirror-1700000000000-ab12cd34/observer-0",
///     "all",
///     "RESULT",
///     serde_json::json!({"finding": "balances match"}),
/// );
/// assert!(!msg.delivered);
/// assert_eq!(msg.message_type, "RESULT");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique message id.
    pub id: String,

    /// Id of the session this message belongs to.
    pub session_id: String,

    /// Actor id, or the reserved literals [`ORCHESTRATOR`] / [`USER`].
    pub sender: String,

    /// Actor id, [`ALL`] for broadcast, or [`ORCHESTRATOR`].
    pub recipient: String,

    /// Type drawn from the session pattern's vocabulary or
    /// [`STANDARD_VOCABULARY`].
    pub message_type: String,

    /// Opaque structured payload.
    pub payload: serde_json::Value,

    /// UTC timestamp assigned when the router accepted the message.
    pub timestamp: DateTime<Utc>,

    /// Set once the recipient has drained this message from its queue.
    pub delivered: bool,
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(
        session_id: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
            delivered: false,
        }
    }
}
