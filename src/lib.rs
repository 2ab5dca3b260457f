//! # Ensemble
//!
//! Ensemble is an orchestration core for multi-agent collaborations: it
//! coordinates non-deterministic reasoning agents through named collaboration
//! patterns with deterministic guarantees around messaging, lifecycle, and
//! termination.
//!
//! The crate is deliberately split along one seam: everything *around* the
//! reasoning primitive is owned here — routing, turn order, budgets,
//! completion detection, observability — while the primitive itself stays
//! behind the [`ReasoningClient`] trait and is injected by the embedder.
//!
//! The layers, leaf-first:
//!
//! * **Reasoning seam**: [`ReasoningClient`] plus the request/reply types in
//!   [`reasoner`] — a remote LLM in production, a scripted mock in tests.
//! * **Patterns**: [`pattern::PatternRegistry`] — a catalog of collaboration
//!   patterns (topology, role templates, workflow phases, message vocabulary),
//!   with built-ins for each topology and a forgiving markdown loader.
//! * **Messaging**: [`router::MessageRouter`] — session-scoped pub/sub with
//!   validated typed messages, broadcast, and bounded history.
//! * **Actors**: [`actor::AgentActor`] — one per role per session, running a
//!   bounded tool-use loop inside each turn.
//! * **Sessions**: [`Session`] — one collaboration instance with a monotonic
//!   lifecycle state machine.
//! * **Orchestrator**: [`Orchestrator`] — resolves patterns, spawns actors,
//!   drives the topology loop, mediates tool calls, detects completion.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use ensemble::orchestrator::Orchestrator;
//! use ensemble::session::SessionConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(client: Arc<dyn ensemble::reasoner::ReasoningClient>) -> Result<(), Box<dyn std::error::Error>> {
//! ensemble::init_logger();
//!
//! let orchestrator = Orchestrator::new(client);
//!
//! let handle = orchestrator
//!     .invoke("mirror", SessionConfig::new().with_target("0x5a3f...c41"))
//!     .await?;
//!
//! loop {
//!     let report = orchestrator.status(&handle.session_id).await?;
//!     if report.status.is_terminal() {
//!         println!("finished: {:?} after {} rounds", report.status, report.rounds_run);
//!         break;
//!     }
//!     tokio::time::sleep(Duration::from_millis(250)).await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Termination is guaranteed even when no agent ever signals completion: every
//! topology loop runs under a turn budget, and exhausting it completes the
//! session (with [`session::CompletionKind::BudgetExhausted`]) rather than
//! erroring. Side effects requested by agents flow through
//! [`orchestrator::ToolHandler`] registrations; the core itself performs none.
//!
//! Continue exploring the modules re-exported from the crate root for the
//! individual subsystems.

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Lightweight on purpose: embedding applications opt in to `RUST_LOG` driven
/// diagnostics without the core choosing a logging backend for them.
///
/// ```rust
/// ensemble::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `ensemble` module.
pub mod ensemble;

// Re-exporting key items for easier external access.
pub use crate::ensemble::actor;
pub use crate::ensemble::actor::{ActorStatus, AgentActor, ToolDispatcher, TurnOutcome};
pub use crate::ensemble::event;
pub use crate::ensemble::event::{ActorEvent, EventHandler, SessionEvent};
pub use crate::ensemble::message;
pub use crate::ensemble::message::Message;
pub use crate::ensemble::orchestrator;
pub use crate::ensemble::orchestrator::{
    Orchestrator, OrchestratorError, SessionHandle, SessionReport, StopReport, ToolHandler,
};
pub use crate::ensemble::pattern;
pub use crate::ensemble::pattern::{Pattern, PatternRegistry, RoleTemplate, Topology};
pub use crate::ensemble::reasoner;
pub use crate::ensemble::reasoner::{ReasoningClient, ReasoningReply, ReasoningRequest, ToolSpec};
pub use crate::ensemble::router;
pub use crate::ensemble::router::{MessageRouter, RouterError};
pub use crate::ensemble::session;
pub use crate::ensemble::session::{
    CompletionKind, Network, Session, SessionConfig, SessionStatus,
};
