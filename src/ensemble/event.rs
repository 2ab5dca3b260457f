//! Observability Event System
//!
//! The core guarantees *emission* of one event per significant lifecycle
//! transition and per message send; persistence, fan-out, and real-time
//! delivery belong to whatever [`EventHandler`] the embedding application
//! registers.
//!
//! Two event families flow through a single handler:
//!
//! - [`ActorEvent`] — sub-turn granularity: reasoner round-trips and tool
//!   executions inside one actor's turn.
//! - [`SessionEvent`] — session granularity: lifecycle transitions, round
//!   boundaries, actor responses, message sends.
//!
//! Attach a handler via
//! [`Orchestrator::with_event_handler`](crate::orchestrator::Orchestrator::with_event_handler);
//! it is automatically propagated to every actor the orchestrator spawns, so
//! both families arrive through the same callback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Events emitted from within a single actor's turn execution.
///
/// Every variant carries `actor_id` so handlers can identify the source
/// without external state.
///
/// # Event flow (one `execute_turn` call)
///
/// ```text
/// TurnStarted
///   └─ ReasonerCallStarted { iteration: 1 }
///   └─ ReasonerCallCompleted { iteration: 1 }
///   └─ (if tool requests present)
///       ├─ ToolCallRequested
///       ├─ ToolCallCompleted
///       └─ next ReasonerCall iteration
///   └─ (loop continues until no tool requests or ToolLoopCapReached)
/// TurnCompleted
/// ```
#[derive(Debug, Clone)]
pub enum ActorEvent {
    /// A turn has begun.
    TurnStarted {
        actor_id: String,
        /// First ~120 characters of the turn input, useful for logging.
        input_preview: String,
    },

    /// A turn finished with a final narrative response.
    TurnCompleted {
        actor_id: String,
        /// Reasoning units consumed across every invocation in this turn.
        units_used: usize,
        /// Number of tool calls executed during the turn.
        tool_calls_made: usize,
        /// Character length of the final response.
        response_length: usize,
    },

    /// Fired before each reasoning-primitive round-trip. Iteration 1 is the
    /// initial call; later iterations follow tool executions.
    ReasonerCallStarted { actor_id: String, iteration: usize },

    /// Fired after each reasoning-primitive round-trip returns.
    ReasonerCallCompleted {
        actor_id: String,
        iteration: usize,
        units_used: usize,
        response_length: usize,
    },

    /// The primitive requested a tool invocation.
    ToolCallRequested {
        actor_id: String,
        tool_name: String,
        input: serde_json::Value,
        iteration: usize,
    },

    /// A tool invocation resolved (successfully or as an error outcome).
    ToolCallCompleted {
        actor_id: String,
        tool_name: String,
        is_error: bool,
        iteration: usize,
    },

    /// The bounded tool-use loop hit its iteration cap; the turn ends with
    /// the last narrative produced.
    ToolLoopCapReached { actor_id: String },
}

/// Events emitted by the orchestrator around session lifecycle and routing.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session was created and its actors spawned.
    SessionCreated {
        session_id: String,
        pattern: String,
        topology: String,
        actor_count: usize,
    },

    /// The session transitioned to `Running` and its topology loop started.
    SessionRunning { session_id: String },

    /// A new round is beginning. 1-based.
    RoundStarted { session_id: String, round: usize },

    /// A round finished; all of its turns have resolved.
    RoundCompleted { session_id: String, round: usize },

    /// An actor's turn resolved successfully.
    ActorResponded {
        session_id: String,
        actor_id: String,
        units_used: usize,
        response_length: usize,
    },

    /// An actor's turn was skipped because its resource cap was reached.
    ActorCapped { session_id: String, actor_id: String },

    /// A message was accepted by the router.
    MessageSent {
        session_id: String,
        sender: String,
        recipient: String,
        message_type: String,
    },

    /// An actor used the observability-emit tool; the payload is forwarded
    /// verbatim, tagged with session and actor identity.
    Observation {
        session_id: String,
        actor_id: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// The session reached a terminal `Completed` status.
    SessionCompleted {
        session_id: String,
        rounds: usize,
        /// `true` when completion was signaled, `false` when the turn budget
        /// ran out first.
        signaled: bool,
    },

    /// The session terminated with an error recorded.
    SessionErrored { session_id: String, error: String },

    /// The session's duration cap expired.
    SessionTimedOut { session_id: String },

    /// The session was stopped by the caller.
    SessionStopped { session_id: String },
}

/// Unified callback for real-time observability.
///
/// Both methods default to no-ops so handlers implement only what they need.
///
/// ```rust
/// use async_trait::async_trait;
/// use ensemble::event::{EventHandler, SessionEvent};
///
/// struct Printer;
///
/// #[async_trait]
/// impl EventHandler for Printer {
///     async fn on_session_event(&self, event: &SessionEvent) {
///         println!("{:?}", event);
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every [`ActorEvent`] emitted by spawned actors.
    async fn on_actor_event(&self, _event: &ActorEvent) {}

    /// Called for every [`SessionEvent`] emitted by the orchestrator.
    async fn on_session_event(&self, _event: &SessionEvent) {}
}
