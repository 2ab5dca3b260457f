//! Message Router
//!
//! Session-scoped in-memory pub/sub. The router owns the full roster and
//! vocabulary for every registered session, so broadcast (`"all"`) is resolved
//! here and nowhere else. Per-recipient queues hold undelivered messages until
//! the recipient's next turn drains them; a bounded per-session history ring
//! retains delivered traffic for introspection.
//!
//! All operations take a single internal lock, so a send and a receive racing
//! on the same queue can never lose or duplicate a message.
//!
//! # Example
//!
//! ```
//! use ensemble::message::Message;
//! use ensemble::router::MessageRouter;
//!
//! # async {
//! let router = MessageRouter::new();
//! let vocab = ensemble::message::STANDARD_VOCABULARY
//!     .iter()
//!     .map(|s| s.to_string())
//!     .collect();
//! router
//!     .register_session("s1", vec!["s1/a-0".into(), "s1/b-1".into()], vocab)
//!     .await;
//!
//! router
//!     .send(Message::new("s1", "s1/a-0", "all", "READY", serde_json::json!({})))
//!     .await
//!     .unwrap();
//!
//! let inbox = router.receive("s1/b-1").await;
//! assert_eq!(inbox.len(), 1);
//! assert!(router.receive("s1/b-1").await.is_empty());
//! # };
//! ```

use crate::ensemble::message::{Message, ALL, ORCHESTRATOR, USER};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default per-session history retention.
pub const DEFAULT_HISTORY_CAP: usize = 1000;

/// Validation failures surfaced by [`MessageRouter::send`] before any state
/// is mutated. A rejected message is never enqueued and never recorded.
#[derive(Debug, Clone)]
pub enum RouterError {
    /// The message names a session the router has never seen.
    UnknownSession(String),
    /// The sender is neither a roster member nor a reserved identity.
    UnknownSender(String),
    /// The recipient is neither a roster member nor a reserved identity.
    UnknownRecipient(String),
    /// The message type is outside the session's permitted vocabulary.
    DisallowedType(String),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::UnknownSession(id) => write!(f, "Unknown session: {}", id),
            RouterError::UnknownSender(id) => write!(f, "Unknown sender: {}", id),
            RouterError::UnknownRecipient(id) => write!(f, "Unknown recipient: {}", id),
            RouterError::DisallowedType(t) => {
                write!(f, "Message type not in session vocabulary: {}", t)
            }
        }
    }
}

impl Error for RouterError {}

/// Process-wide observer notified of every accepted send, regardless of
/// recipient. Used by the orchestrator to mirror traffic into the
/// observability sink.
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    async fn on_message(&self, message: &Message);
}

/// Per-session routing state. The roster is fixed at registration; the
/// vocabulary is the union handed in by the orchestrator (pattern vocabulary
/// plus standard defaults).
struct SessionChannels {
    roster: Vec<String>,
    vocabulary: HashSet<String>,
    queues: HashMap<String, VecDeque<Message>>,
    history: VecDeque<Message>,
}

/// The in-memory message routing subsystem.
///
/// Explicitly constructed and explicitly passed — multiple independent
/// routers coexist freely (one per orchestrator, or shared, as the embedder
/// prefers).
pub struct MessageRouter {
    inner: Mutex<HashMap<String, SessionChannels>>,
    subscribers: Mutex<Vec<Arc<dyn MessageSubscriber>>>,
    history_cap: usize,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    /// Create a router with the default history retention of
    /// [`DEFAULT_HISTORY_CAP`] messages per session.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }

    /// Override the per-session history retention cap (builder pattern).
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    /// Register a session's roster and permitted vocabulary.
    ///
    /// Must be called before any `send` naming this session. The vocabulary
    /// passed here should already include the standard defaults; the router
    /// checks membership, it does not know about patterns.
    pub async fn register_session(
        &self,
        session_id: impl Into<String>,
        roster: Vec<String>,
        vocabulary: Vec<String>,
    ) {
        let session_id = session_id.into();
        let queues = roster
            .iter()
            .map(|id| (id.clone(), VecDeque::new()))
            .collect();
        let channels = SessionChannels {
            roster,
            vocabulary: vocabulary.into_iter().collect(),
            queues,
            history: VecDeque::new(),
        };
        let mut inner = self.inner.lock().await;
        inner.insert(session_id, channels);
    }

    /// Register a process-wide subscriber notified of every accepted send.
    pub async fn subscribe(&self, subscriber: Arc<dyn MessageSubscriber>) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.push(subscriber);
    }

    /// Validate, record, and fan out a message.
    ///
    /// - a named actor recipient gets the message appended to its queue
    /// - `"all"` enqueues a copy to every roster member except the sender
    /// - `"orchestrator"` is recorded in history only, never queued
    ///
    /// Returns the message as accepted (id and timestamp already assigned by
    /// [`Message::new`]). Rejections leave the router untouched.
    pub async fn send(&self, message: Message) -> Result<Message, RouterError> {
        {
            let mut inner = self.inner.lock().await;
            let channels = inner
                .get_mut(&message.session_id)
                .ok_or_else(|| RouterError::UnknownSession(message.session_id.clone()))?;

            let sender_known = channels.roster.iter().any(|id| id == &message.sender)
                || message.sender == ORCHESTRATOR
                || message.sender == USER;
            if !sender_known {
                log::warn!(
                    "router rejected send from unknown sender '{}' in session {}",
                    message.sender,
                    message.session_id
                );
                return Err(RouterError::UnknownSender(message.sender.clone()));
            }

            let recipient_known = channels.roster.iter().any(|id| id == &message.recipient)
                || message.recipient == ALL
                || message.recipient == ORCHESTRATOR;
            if !recipient_known {
                return Err(RouterError::UnknownRecipient(message.recipient.clone()));
            }

            if !channels.vocabulary.contains(&message.message_type) {
                log::warn!(
                    "router rejected message type '{}' in session {}",
                    message.message_type,
                    message.session_id
                );
                return Err(RouterError::DisallowedType(message.message_type.clone()));
            }

            // Record first, then fan out. History holds the undelivered copy;
            // the delivered flag flips on the queued copies at drain time.
            channels.history.push_back(message.clone());
            while channels.history.len() > self.history_cap {
                channels.history.pop_front();
            }

            if message.recipient == ALL {
                let targets: Vec<String> = channels
                    .roster
                    .iter()
                    .filter(|id| **id != message.sender)
                    .cloned()
                    .collect();
                for target in targets {
                    if let Some(queue) = channels.queues.get_mut(&target) {
                        queue.push_back(message.clone());
                    }
                }
            } else if message.recipient != ORCHESTRATOR {
                if let Some(queue) = channels.queues.get_mut(&message.recipient) {
                    queue.push_back(message.clone());
                }
            }
        }

        let subscribers = self.subscribers.lock().await;
        for subscriber in subscribers.iter() {
            subscriber.on_message(&message).await;
        }

        Ok(message)
    }

    /// Atomically drain and return an actor's pending queue in enqueue order.
    ///
    /// The read is destructive: a second call before any new send returns an
    /// empty list. An unknown actor id also yields an empty list — a missing
    /// queue is indistinguishable from a drained one.
    pub async fn receive(&self, actor_id: &str) -> Vec<Message> {
        let mut inner = self.inner.lock().await;
        for channels in inner.values_mut() {
            if let Some(queue) = channels.queues.get_mut(actor_id) {
                return queue
                    .drain(..)
                    .map(|mut m| {
                        m.delivered = true;
                        m
                    })
                    .collect();
            }
        }
        Vec::new()
    }

    /// Return the tail of a session's retained history, most recent last.
    pub async fn history(&self, session_id: &str, limit: Option<usize>) -> Vec<Message> {
        let inner = self.inner.lock().await;
        match inner.get(session_id) {
            Some(channels) => {
                let len = channels.history.len();
                let take = limit.unwrap_or(len).min(len);
                channels.history.iter().skip(len - take).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Purge a session's history and any queued-but-undelivered messages.
    pub async fn clear(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.remove(session_id);
    }

    /// Actor ids registered for a session, in registration order.
    pub async fn roster(&self, session_id: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .get(session_id)
            .map(|c| c.roster.clone())
            .unwrap_or_default()
    }
}
