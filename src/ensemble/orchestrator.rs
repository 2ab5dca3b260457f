//! Session Orchestrator
//!
//! The [`Orchestrator`] is the top-level coordinator: it resolves patterns,
//! creates sessions, spawns one [`AgentActor`](crate::actor::AgentActor) per
//! role, drives the topology-specific execution loop, mediates tool-call side
//! effects, detects completion, and exposes session introspection.
//!
//! It is an explicitly constructed context object — all state lives behind
//! `Arc`s inside the value, so clones share one coordinator and independent
//! instances never interfere. There is no global singleton.
//!
//! # Topology loops
//!
//! | Topology | Discipline |
//! |----------|-----------|
//! | Solo | one actor, turn → check → repeat |
//! | Duet | concurrent turns each round, both must signal completion |
//! | Group | strictly sequential turns within each round |
//! | Hierarchical | decompose once, then fan out workers / synthesize each round |
//!
//! All loops share a turn budget (default [`DEFAULT_TURN_BUDGET`]) so a
//! session terminates even if no completion signal ever arrives. Budget
//! exhaustion is an expected outcome: the session completes with
//! [`CompletionKind::BudgetExhausted`], not an error.
//!
//! # Completion predicate
//!
//! The structured signal is primary: an actor that sends a `COMPLETE`-typed
//! message is marked done. Canonical-phrase matching on turn narratives is a
//! legacy fallback, applied only to turns that produced no structured signal.
//! A round is complete when every participating actor has signaled (duet,
//! group, solo) or when the coordinator has (hierarchical); partial signals
//! are ordinary messages.
//!
//! # Example
//!
//! ```rust,no_run
//! use ensemble::orchestrator::Orchestrator;
//! use ensemble::session::SessionConfig;
//! use std::sync::Arc;
//!
//! # async fn example(client: Arc<dyn ensemble::reasoner::ReasoningClient>) {
//! let orchestrator = Orchestrator::new(client);
//!
//! let handle = orchestrator
//!     .invoke("mirror", SessionConfig::new().with_target("0x5a3f"))
//!     .await
//!     .unwrap();
//!
//! // The topology loop runs asynchronously; poll for the outcome.
//! let report = orchestrator.status(&handle.session_id).await.unwrap();
//! println!("{:?}", report.status);
//! # }
//! ```

use crate::ensemble::actor::{AgentActor, ToolDispatcher};
use crate::ensemble::event::{EventHandler, SessionEvent};
use crate::ensemble::message::{Message, COMPLETE_TYPE, STANDARD_VOCABULARY};
use crate::ensemble::pattern::{Pattern, PatternError, PatternRegistry, Topology};
use crate::ensemble::reasoner::{ReasoningClient, ToolOutcome, ToolRequest, ToolSpec};
use crate::ensemble::router::{MessageRouter, MessageSubscriber};
use crate::ensemble::session::{
    CompletionKind, Session, SessionConfig, SessionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Default hard cap on rounds per session.
pub const DEFAULT_TURN_BUDGET: usize = 20;

/// Canonical phrases accepted as a legacy completion signal. Matching is
/// lowercase substring — fragile by nature, which is why the structured
/// `COMPLETE` message count is checked first.
pub const COMPLETION_PHRASES: [&str; 4] = [
    "collaboration complete",
    "mission accomplished",
    "my work here is done",
    "nothing further to add",
];

/// Errors surfaced synchronously from orchestrator calls. These are caller
/// errors and are never retried by the core.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    /// No pattern with the given name is registered.
    UnknownPattern(String),
    /// The pattern exists but cannot drive a session (no roles to spawn).
    InvalidPattern(String),
    /// No session with the given id exists.
    UnknownSession(String),
    /// The session exists but has no actor with the given id.
    UnknownActor(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::UnknownPattern(name) => write!(f, "Unknown pattern: {}", name),
            OrchestratorError::InvalidPattern(name) => {
                write!(f, "Pattern has no roles to spawn: {}", name)
            }
            OrchestratorError::UnknownSession(id) => write!(f, "Unknown session: {}", id),
            OrchestratorError::UnknownActor(id) => write!(f, "Unknown actor: {}", id),
        }
    }
}

impl Error for OrchestratorError {}

/// Result of one externally handled tool call.
#[derive(Clone, Debug)]
pub struct HandlerResult {
    pub result: serde_json::Value,
    pub is_error: bool,
}

impl HandlerResult {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            result,
            is_error: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::String(error.into()),
            is_error: true,
        }
    }
}

/// Externally registered tool capability.
///
/// The orchestrator owns no knowledge of what these tools do; it routes by
/// name-prefix match and forwards the result. `catalog()` advertises the
/// tools this handler serves so they can be offered to actors —
/// side-effecting specs are dropped from a session's catalog when its config
/// forbids them.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Tool specs this handler serves.
    fn catalog(&self) -> Vec<ToolSpec>;

    /// Execute one tool call. Failures are data (`is_error`), not panics.
    async fn handle(&self, tool_name: &str, input: serde_json::Value) -> HandlerResult;
}

/// What `invoke` returns: enough to poll and address the new session. The
/// topology loop is already running when the caller receives this.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub session_id: String,
    /// Actor ids in spawn order.
    pub actor_ids: Vec<String>,
}

/// Snapshot returned by [`Orchestrator::status`].
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub status: SessionStatus,
    /// How a completed session finished; `None` while live or when terminal
    /// via error/timeout/stop.
    pub outcome: Option<CompletionKind>,
    pub per_actor_turn_counts: HashMap<String, usize>,
    pub per_actor_unit_usage: HashMap<String, usize>,
    pub rounds_run: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Result of [`Orchestrator::stop`].
#[derive(Clone, Debug, Serialize)]
pub struct StopReport {
    pub final_status: SessionStatus,
    pub ran_for_seconds: u64,
}

/// The top-level coordinator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<PatternRegistry>,
    router: Arc<MessageRouter>,
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<Session>>>>>,
    handlers: Arc<RwLock<Vec<(String, Arc<dyn ToolHandler>)>>>,
    event_handler: Option<Arc<dyn EventHandler>>,
    client: Arc<dyn ReasoningClient>,
    turn_budget: usize,
    router_mirrored: Arc<Mutex<bool>>,
}

impl Orchestrator {
    /// Create an orchestrator around a reasoning client, with the built-in
    /// pattern catalog, a fresh router, and the default turn budget.
    pub fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self {
            registry: Arc::new(PatternRegistry::with_builtins()),
            router: Arc::new(MessageRouter::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(Vec::new())),
            event_handler: None,
            client,
            turn_budget: DEFAULT_TURN_BUDGET,
            router_mirrored: Arc::new(Mutex::new(false)),
        }
    }

    /// Substitute a pattern registry (builder pattern).
    pub fn with_registry(mut self, registry: Arc<PatternRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Substitute a message router (builder pattern). Useful for sharing one
    /// router across orchestrators or configuring history retention.
    pub fn with_router(mut self, router: Arc<MessageRouter>) -> Self {
        self.router = router;
        self
    }

    /// Attach an event handler (builder pattern). Propagated to every actor
    /// spawned afterwards, and wired to the router so message sends are
    /// mirrored as [`SessionEvent::MessageSent`].
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Override the per-session round budget (builder pattern).
    pub fn with_turn_budget(mut self, budget: usize) -> Self {
        self.turn_budget = budget.max(1);
        self
    }

    /// Register an external tool handler under a name prefix. Dispatch picks
    /// the longest matching prefix; an unmatched tool name produces an error
    /// outcome for the requesting actor, never a panic.
    pub async fn register_tool_handler(
        &self,
        name_prefix: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) {
        let mut handlers = self.handlers.write().await;
        handlers.push((name_prefix.into(), handler));
    }

    /// Look up a pattern definition without creating a session.
    pub fn describe(&self, pattern_name: &str) -> Result<Arc<Pattern>, OrchestratorError> {
        self.registry.resolve(pattern_name).map_err(map_pattern_err)
    }

    /// Ids of every session this orchestrator has created, live or terminal.
    pub async fn list_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions.keys().cloned().collect()
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_session_event(&event).await;
        }
    }

    /// Create a session for the named pattern and start driving it.
    ///
    /// The caller receives the [`SessionHandle`] immediately; the topology
    /// loop runs on a spawned task. A fault inside that loop is caught
    /// exactly once, recorded as the session's terminal error, and never
    /// thrown back through this call.
    pub async fn invoke(
        &self,
        pattern_name: &str,
        config: SessionConfig,
    ) -> Result<SessionHandle, OrchestratorError> {
        let pattern = self.registry.resolve(pattern_name).map_err(map_pattern_err)?;
        // A role-less pattern would spawn zero actors and give the topology
        // loop nothing to index; reject it before any state is created.
        if pattern.roles.is_empty() {
            return Err(OrchestratorError::InvalidPattern(pattern_name.to_string()));
        }

        self.mirror_router_once().await;

        let mut session = Session::new(Arc::clone(&pattern), config);
        let session_id = session.id.clone();
        session.transition(SessionStatus::SpawningAgents);

        for (index, role) in pattern.roles.iter().enumerate() {
            let mut actor = AgentActor::spawn(
                &session_id,
                index,
                role.clone(),
                &pattern,
                session.config.target.as_deref(),
                Arc::clone(&self.client),
            );
            if let Some(handler) = &self.event_handler {
                actor.set_event_handler(Arc::clone(handler));
            }
            session.attach_actor(actor);
        }

        let roster = session.actor_ids();
        let mut vocabulary: Vec<String> = STANDARD_VOCABULARY
            .iter()
            .map(|s| s.to_string())
            .collect();
        vocabulary.extend(pattern.vocabulary.iter().cloned());
        self.router
            .register_session(&session_id, roster.clone(), vocabulary)
            .await;

        self.emit(SessionEvent::SessionCreated {
            session_id: session_id.clone(),
            pattern: pattern.name.clone(),
            topology: pattern.topology.name().to_string(),
            actor_count: roster.len(),
        })
        .await;

        session.tools = self.session_tools(session.config.allow_side_effects).await;

        session.transition(SessionStatus::Running);
        let session = Arc::new(Mutex::new(session));
        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(session_id.clone(), Arc::clone(&session));
        }
        self.emit(SessionEvent::SessionRunning {
            session_id: session_id.clone(),
        })
        .await;

        let this = self.clone();
        let driven = Arc::clone(&session);
        let driven_id = session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.drive(&driven).await {
                log::warn!("session {} failed: {}", driven_id, e);
                let error = e.to_string();
                let transitioned = {
                    let mut s = driven.lock().await;
                    let transitioned = s.transition(SessionStatus::Error);
                    if transitioned {
                        s.error = Some(error.clone());
                        s.release_actors();
                    }
                    transitioned
                };
                if transitioned {
                    this.router.clear(&driven_id).await;
                    this.emit(SessionEvent::SessionErrored {
                        session_id: driven_id,
                        error,
                    })
                    .await;
                }
            }
        });

        Ok(SessionHandle {
            session_id,
            actor_ids: roster,
        })
    }

    /// Snapshot a session's status and per-actor accounting.
    pub async fn status(&self, session_id: &str) -> Result<SessionReport, OrchestratorError> {
        let session = self.session_arc(session_id).await?;
        let session = session.lock().await;
        Ok(SessionReport {
            status: session.status(),
            outcome: session.outcome,
            per_actor_turn_counts: session.turn_counts.clone(),
            per_actor_unit_usage: session.unit_usage.clone(),
            rounds_run: session.rounds_run,
            started_at: session.started_at,
            completed_at: session.completed_at,
            error: session.error.clone(),
        })
    }

    /// One actor's (turns, units) so far.
    pub async fn actor_usage(
        &self,
        session_id: &str,
        actor_id: &str,
    ) -> Result<(usize, usize), OrchestratorError> {
        let session = self.session_arc(session_id).await?;
        let session = session.lock().await;
        if !session.actor_ids().iter().any(|id| id == actor_id) {
            return Err(OrchestratorError::UnknownActor(actor_id.to_string()));
        }
        Ok((
            session.turn_counts.get(actor_id).copied().unwrap_or(0),
            session.unit_usage.get(actor_id).copied().unwrap_or(0),
        ))
    }

    /// Stop a session cooperatively.
    ///
    /// Idempotent: stopping an already-terminal session reports its existing
    /// terminal status without transitioning. The topology loop notices the
    /// flipped status before its next round or turn; an in-flight turn is
    /// allowed to finish.
    pub async fn stop(&self, session_id: &str) -> Result<StopReport, OrchestratorError> {
        let session = self.session_arc(session_id).await?;
        let (final_status, ran_for_seconds, newly_stopped) = {
            let mut session = session.lock().await;
            let newly = session.transition(SessionStatus::Stopped);
            if newly {
                session.release_actors();
            }
            (session.status(), session.ran_for_seconds(), newly)
        };
        if newly_stopped {
            self.router.clear(session_id).await;
            self.emit(SessionEvent::SessionStopped {
                session_id: session_id.to_string(),
            })
            .await;
        }
        Ok(StopReport {
            final_status,
            ran_for_seconds,
        })
    }

    /// The session's message history tail, for introspection surfaces.
    pub async fn history(&self, session_id: &str, limit: Option<usize>) -> Vec<Message> {
        self.router.history(session_id, limit).await
    }

    async fn session_arc(
        &self,
        session_id: &str,
    ) -> Result<Arc<Mutex<Session>>, OrchestratorError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownSession(session_id.to_string()))
    }

    /// Wire the router's subscriber hook to the event handler, once.
    async fn mirror_router_once(&self) {
        let handler = match &self.event_handler {
            Some(handler) => Arc::clone(handler),
            None => return,
        };
        let mut mirrored = self.router_mirrored.lock().await;
        if !*mirrored {
            self.router
                .subscribe(Arc::new(MessageMirror { handler }))
                .await;
            *mirrored = true;
        }
    }

    /// Build the tool catalog offered to a session's actors: the internal
    /// messaging/observability tools plus every registered handler's catalog.
    /// Side-effecting tools are omitted entirely when the session forbids
    /// them — they are never visible to the reasoning primitive, not merely
    /// blocked at call time.
    async fn session_tools(&self, allow_side_effects: bool) -> Vec<ToolSpec> {
        let mut tools = builtin_tools();
        let handlers = self.handlers.read().await;
        for (_, handler) in handlers.iter() {
            for spec in handler.catalog() {
                if spec.side_effecting && !allow_side_effects {
                    continue;
                }
                tools.push(spec);
            }
        }
        tools
    }

    // ── Tool-call mediation ──────────────────────────────────────────────

    /// Mediate one tool call from an actor.
    ///
    /// Internal families (messaging, roster, history, observability) are
    /// intercepted here; everything else routes to registered handlers by
    /// longest-prefix match. Every failure path returns an error outcome so
    /// the requesting actor's reasoning loop can react.
    pub async fn handle_tool_call(
        &self,
        actor_id: &str,
        session_id: &str,
        request: &ToolRequest,
    ) -> ToolOutcome {
        match request.name.as_str() {
            "send_message" => self.tool_send_message(actor_id, session_id, request).await,
            "list_agents" => {
                let roster = self.router.roster(session_id).await;
                ToolOutcome::success(request, serde_json::json!({ "agents": roster }))
            }
            "message_history" => {
                let limit = request.input["limit"].as_u64().map(|l| l as usize);
                let history = self.router.history(session_id, limit).await;
                match serde_json::to_value(&history) {
                    Ok(value) => ToolOutcome::success(request, serde_json::json!({ "messages": value })),
                    Err(e) => ToolOutcome::failure(request, e.to_string()),
                }
            }
            "emit_observation" => {
                self.emit(SessionEvent::Observation {
                    session_id: session_id.to_string(),
                    actor_id: actor_id.to_string(),
                    payload: request.input.clone(),
                    timestamp: Utc::now(),
                })
                .await;
                ToolOutcome::success(request, serde_json::json!({ "emitted": true }))
            }
            name => {
                let handler = {
                    let handlers = self.handlers.read().await;
                    handlers
                        .iter()
                        .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
                        .max_by_key(|(prefix, _)| prefix.len())
                        .map(|(_, handler)| Arc::clone(handler))
                };
                match handler {
                    Some(handler) => {
                        let result = handler.handle(name, request.input.clone()).await;
                        if result.is_error {
                            ToolOutcome::failure(
                                request,
                                result
                                    .result
                                    .as_str()
                                    .unwrap_or("handler reported failure")
                                    .to_string(),
                            )
                        } else {
                            ToolOutcome::success(request, result.result)
                        }
                    }
                    None => ToolOutcome::failure(
                        request,
                        format!("No handler registered for tool '{}'", name),
                    ),
                }
            }
        }
    }

    async fn tool_send_message(
        &self,
        actor_id: &str,
        session_id: &str,
        request: &ToolRequest,
    ) -> ToolOutcome {
        let to = match request.input["to"].as_str() {
            Some(to) => to.to_string(),
            None => return ToolOutcome::failure(request, "send_message requires 'to'"),
        };
        let message_type = match request.input["type"].as_str() {
            Some(t) => t.to_string(),
            None => return ToolOutcome::failure(request, "send_message requires 'type'"),
        };
        let payload = request.input.get("content").cloned().unwrap_or_default();

        let message = Message::new(session_id, actor_id, to, message_type.clone(), payload);
        match self.router.send(message).await {
            Ok(sent) => {
                if message_type == COMPLETE_TYPE {
                    self.mark_completed(session_id, actor_id).await;
                }
                ToolOutcome::success(request, serde_json::json!({ "message_id": sent.id }))
            }
            Err(e) => ToolOutcome::failure(request, e.to_string()),
        }
    }

    async fn mark_completed(&self, session_id: &str, actor_id: &str) {
        if let Ok(session) = self.session_arc(session_id).await {
            let mut session = session.lock().await;
            session.completed_actors.insert(actor_id.to_string());
        }
    }

    // ── Topology loops ───────────────────────────────────────────────────

    async fn drive(
        &self,
        session: &Arc<Mutex<Session>>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let topology = {
            let session = session.lock().await;
            session.pattern.topology
        };
        match topology {
            Topology::Solo => self.drive_solo(session).await,
            Topology::Duet => self.drive_duet(session).await,
            Topology::Group => self.drive_group(session).await,
            Topology::Hierarchical => self.drive_hierarchical(session).await,
        }
    }

    /// Whether the loop may start another round. Flips the session to
    /// `Timeout` when the duration cap has expired.
    async fn round_permitted(&self, session: &Arc<Mutex<Session>>) -> bool {
        let (session_id, expired) = {
            let mut session = session.lock().await;
            if session.status() != SessionStatus::Running {
                return false;
            }
            let cap = session.config.duration_cap_secs;
            let expired = cap > 0 && session.ran_for_seconds() >= cap;
            if expired {
                session.transition(SessionStatus::Timeout);
                session.release_actors();
            }
            (session.id.clone(), expired)
        };
        if expired {
            self.router.clear(&session_id).await;
            self.emit(SessionEvent::SessionTimedOut { session_id }).await;
            return false;
        }
        true
    }

    /// Run one actor's turn end to end: build the dispatcher, execute,
    /// record bookkeeping, apply the phrase fallback, hub-route the
    /// narrative. Returns the response text.
    async fn run_turn(
        &self,
        session: &Arc<Mutex<Session>>,
        actor_id: &str,
        input: String,
        route_to: Option<String>,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let (session_id, actor, tools) = {
            let session = session.lock().await;
            let actor = session
                .actor(actor_id)
                .ok_or_else(|| OrchestratorError::UnknownActor(actor_id.to_string()))?;
            (session.id.clone(), actor, session.tools.clone())
        };

        let dispatcher = SessionDispatcher {
            orchestrator: self.clone(),
            session_id: session_id.clone(),
        };

        let outcome = {
            let mut actor = actor.lock().await;
            let outcome = actor.execute_turn(&input, &tools, &dispatcher).await?;
            // The actor now idles on its queue until the loop schedules it
            // again next round.
            actor.set_waiting();
            outcome
        };

        let already_signaled = {
            let mut session = session.lock().await;
            session.record_turn(actor_id, outcome.units_used);
            session.completed_actors.contains(actor_id)
        };

        // Legacy fallback: phrase matching only for turns that produced no
        // structured COMPLETE signal.
        if !already_signaled && contains_completion_phrase(&outcome.response) {
            self.mark_completed(&session_id, actor_id).await;
        }

        self.emit(SessionEvent::ActorResponded {
            session_id: session_id.clone(),
            actor_id: actor_id.to_string(),
            units_used: outcome.units_used,
            response_length: outcome.response.len(),
        })
        .await;

        // Hub-route the narrative so counterparts see it next round even if
        // the primitive never touched the messaging tools.
        if let Some(recipient) = route_to {
            let routed = Message::new(
                &session_id,
                actor_id,
                recipient,
                "RESULT",
                serde_json::json!({ "narrative": outcome.response }),
            );
            if let Err(e) = self.router.send(routed).await {
                log::debug!("hub-route failed in session {}: {}", session_id, e);
            }
        }

        Ok(outcome.response)
    }

    /// Whether an actor may take another turn under the per-actor unit cap.
    async fn under_unit_cap(&self, session: &Arc<Mutex<Session>>, actor_id: &str) -> bool {
        let (capped, session_id) = {
            let session = session.lock().await;
            let cap = session.config.per_agent_unit_cap;
            let used = session.unit_usage.get(actor_id).copied().unwrap_or(0);
            (cap > 0 && used >= cap, session.id.clone())
        };
        if capped {
            self.emit(SessionEvent::ActorCapped {
                session_id,
                actor_id: actor_id.to_string(),
            })
            .await;
        }
        !capped
    }

    /// Build a turn input from the actor's drained pending queue.
    async fn turn_input(&self, actor_id: &str) -> String {
        let inbox = self.router.receive(actor_id).await;
        if inbox.is_empty() {
            return String::from(
                "No new messages this round. Continue your work, or send a COMPLETE \
                 message if your part of the collaboration is finished.",
            );
        }
        let mut input = format!("You received {} message(s) this round:\n", inbox.len());
        for message in &inbox {
            input.push_str(&format!(
                "- from {} [{}]: {}\n",
                message.sender, message.message_type, message.payload
            ));
        }
        input.push_str(
            "React to these messages and continue your work. Send a COMPLETE message \
             when your part of the collaboration is finished.",
        );
        input
    }

    async fn required_signals_present(&self, session: &Arc<Mutex<Session>>) -> bool {
        let session = session.lock().await;
        match session.pattern.topology {
            Topology::Hierarchical => {
                // The designated terminal actor is the coordinator (role 0).
                match session.actor_ids().first() {
                    Some(coordinator) => session.completed_actors.contains(coordinator),
                    None => false,
                }
            }
            _ => {
                let ids = session.actor_ids();
                !ids.is_empty()
                    && ids.iter().all(|id| session.completed_actors.contains(id))
            }
        }
    }

    /// Close out a session that ran to completion (signaled or budget-out).
    async fn finalize(&self, session: &Arc<Mutex<Session>>, signaled: bool) {
        let (session_id, rounds, transitioned) = {
            let mut session = session.lock().await;
            let transitioned = session.transition(SessionStatus::Completing)
                && session.transition(SessionStatus::Completed);
            if transitioned {
                session.outcome = Some(if signaled {
                    CompletionKind::Signaled
                } else {
                    CompletionKind::BudgetExhausted
                });
                session.release_actors();
            }
            (session.id.clone(), session.rounds_run, transitioned)
        };
        if transitioned {
            self.router.clear(&session_id).await;
            self.emit(SessionEvent::SessionCompleted {
                session_id,
                rounds,
                signaled,
            })
            .await;
        }
    }

    async fn drive_solo(
        &self,
        session: &Arc<Mutex<Session>>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let actor_id = {
            let session = session.lock().await;
            session.actor_ids()[0].clone()
        };

        let mut signaled = false;
        for round in 1..=self.turn_budget {
            if !self.round_permitted(session).await {
                return Ok(());
            }
            self.emit_round_started(session, round).await;

            if !self.under_unit_cap(session, &actor_id).await {
                break;
            }

            let input = if round == 1 {
                String::from(
                    "The collaboration is beginning. Work the objective described in \
                     your mandate; send a COMPLETE message when it is done.",
                )
            } else {
                self.turn_input(&actor_id).await
            };

            self.run_turn(session, &actor_id, input, None).await?;
            self.emit_round_completed(session, round).await;
            {
                let mut session = session.lock().await;
                session.rounds_run = round;
            }

            if self.required_signals_present(session).await {
                signaled = true;
                break;
            }
        }

        self.finalize(session, signaled).await;
        Ok(())
    }

    async fn drive_duet(
        &self,
        session: &Arc<Mutex<Session>>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let actor_ids = {
            let session = session.lock().await;
            session.actor_ids()
        };

        // Initialization: both partners take a concurrent framing turn.
        if !self.round_permitted(session).await {
            return Ok(());
        }
        let init = "The collaboration is beginning. Review your mandate, state your \
                    plan, and signal READY to your counterpart.";
        self.concurrent_turns(
            session,
            &actor_ids,
            |_| init.to_string(),
            Some("all".to_string()),
            true,
        )
        .await?;

        let mut signaled = self.required_signals_present(session).await;
        let mut round = 0;
        while !signaled && round < self.turn_budget {
            round += 1;
            if !self.round_permitted(session).await {
                return Ok(());
            }
            self.emit_round_started(session, round).await;

            let mut inputs = Vec::new();
            for actor_id in &actor_ids {
                inputs.push(self.turn_input(actor_id).await);
            }
            let ran = self
                .concurrent_turns(
                    session,
                    &actor_ids,
                    |index| inputs[index].clone(),
                    Some("all".to_string()),
                    false,
                )
                .await?;

            self.emit_round_completed(session, round).await;
            {
                let mut session = session.lock().await;
                session.rounds_run = round;
            }
            if !ran {
                break;
            }
            signaled = self.required_signals_present(session).await;
        }

        self.finalize(session, signaled).await;
        Ok(())
    }

    async fn drive_group(
        &self,
        session: &Arc<Mutex<Session>>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let actor_ids = {
            let session = session.lock().await;
            session.actor_ids()
        };

        // Initialization pass, in seating order.
        if !self.round_permitted(session).await {
            return Ok(());
        }
        for actor_id in &actor_ids {
            if !self.under_unit_cap(session, actor_id).await {
                continue;
            }
            let input = "The collaboration is beginning. Review your mandate, state \
                         your plan, and signal READY to the group.";
            self.run_turn(session, actor_id, input.to_string(), Some("all".to_string()))
                .await?;
        }

        let mut signaled = self.required_signals_present(session).await;
        let mut round = 0;
        while !signaled && round < self.turn_budget {
            round += 1;
            if !self.round_permitted(session).await {
                return Ok(());
            }
            self.emit_round_started(session, round).await;

            let mut any_ran = false;
            for actor_id in &actor_ids {
                // Stops are cooperative: check between turns, let the
                // in-flight one finish.
                if !self.round_permitted(session).await {
                    return Ok(());
                }
                if !self.under_unit_cap(session, actor_id).await {
                    continue;
                }
                any_ran = true;
                let input = self.turn_input(actor_id).await;
                self.run_turn(session, actor_id, input, Some("all".to_string()))
                    .await?;
            }

            self.emit_round_completed(session, round).await;
            {
                let mut session = session.lock().await;
                session.rounds_run = round;
            }
            if !any_ran {
                break;
            }
            signaled = self.required_signals_present(session).await;
        }

        self.finalize(session, signaled).await;
        Ok(())
    }

    async fn drive_hierarchical(
        &self,
        session: &Arc<Mutex<Session>>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let actor_ids = {
            let session = session.lock().await;
            session.actor_ids()
        };
        let coordinator = actor_ids[0].clone();
        let workers: Vec<String> = actor_ids[1..].to_vec();

        // Decomposition turn, outside the round budget. The narrative is
        // broadcast so workers see their assignments even if the primitive
        // never used the messaging tools.
        if !self.round_permitted(session).await {
            return Ok(());
        }
        let decompose = format!(
            "The collaboration is beginning. Decompose the objective into {} \
             independent aspects, one per worker, and send each worker its \
             assignment as an INSTRUCTION message.",
            workers.len()
        );
        self.run_turn(session, &coordinator, decompose, Some("all".to_string()))
            .await?;

        let mut signaled = self.required_signals_present(session).await;
        let mut round = 0;
        while !signaled && round < self.turn_budget {
            round += 1;
            if !self.round_permitted(session).await {
                return Ok(());
            }
            self.emit_round_started(session, round).await;

            // Workers fan out concurrently, reporting to the coordinator.
            let mut inputs = Vec::new();
            for worker in &workers {
                inputs.push(self.turn_input(worker).await);
            }
            let workers_ran = self
                .concurrent_turns(
                    session,
                    &workers,
                    |index| inputs[index].clone(),
                    Some(coordinator.clone()),
                    false,
                )
                .await?;

            // Synthesis turn consumes the worker output queued above.
            let mut any_ran = workers_ran;
            if self.under_unit_cap(session, &coordinator).await {
                any_ran = true;
                let input = self.turn_input(&coordinator).await;
                self.run_turn(session, &coordinator, input, Some("all".to_string()))
                    .await?;
            }

            self.emit_round_completed(session, round).await;
            {
                let mut session = session.lock().await;
                session.rounds_run = round;
            }
            if !any_ran {
                break;
            }
            signaled = self.required_signals_present(session).await;
        }

        self.finalize(session, signaled).await;
        Ok(())
    }

    /// Fan out one concurrent turn per actor and join before returning.
    /// Returns whether at least one actor actually ran (capped actors are
    /// skipped). A fault in any turn propagates after the join.
    async fn concurrent_turns<F>(
        &self,
        session: &Arc<Mutex<Session>>,
        actor_ids: &[String],
        input_for: F,
        route_to: Option<String>,
        is_initialization: bool,
    ) -> Result<bool, Box<dyn Error + Send + Sync>>
    where
        F: Fn(usize) -> String,
    {
        let mut tasks = Vec::new();
        let mut any_ran = false;
        for (index, actor_id) in actor_ids.iter().enumerate() {
            if !is_initialization && !self.under_unit_cap(session, actor_id).await {
                continue;
            }
            any_ran = true;
            let this = self.clone();
            let session = Arc::clone(session);
            let actor_id = actor_id.clone();
            let input = input_for(index);
            let route = route_to.clone();
            tasks.push(tokio::spawn(async move {
                this.run_turn(&session, &actor_id, input, route).await
            }));
        }

        for joined in join_all(tasks).await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Box::new(e) as Box<dyn Error + Send + Sync>),
            }
        }
        Ok(any_ran)
    }

    async fn emit_round_started(&self, session: &Arc<Mutex<Session>>, round: usize) {
        let session_id = {
            let session = session.lock().await;
            session.id.clone()
        };
        self.emit(SessionEvent::RoundStarted { session_id, round }).await;
    }

    async fn emit_round_completed(&self, session: &Arc<Mutex<Session>>, round: usize) {
        let session_id = {
            let session = session.lock().await;
            session.id.clone()
        };
        self.emit(SessionEvent::RoundCompleted { session_id, round }).await;
    }
}

/// Bridges an actor's in-turn tool requests back into the orchestrator.
struct SessionDispatcher {
    orchestrator: Orchestrator,
    session_id: String,
}

#[async_trait]
impl ToolDispatcher for SessionDispatcher {
    async fn dispatch(&self, actor_id: &str, request: &ToolRequest) -> ToolOutcome {
        self.orchestrator
            .handle_tool_call(actor_id, &self.session_id, request)
            .await
    }
}

/// Mirrors every accepted router send into the observability sink.
struct MessageMirror {
    handler: Arc<dyn EventHandler>,
}

#[async_trait]
impl MessageSubscriber for MessageMirror {
    async fn on_message(&self, message: &Message) {
        self.handler
            .on_session_event(&SessionEvent::MessageSent {
                session_id: message.session_id.clone(),
                sender: message.sender.clone(),
                recipient: message.recipient.clone(),
                message_type: message.message_type.clone(),
            })
            .await;
    }
}

fn map_pattern_err(e: PatternError) -> OrchestratorError {
    match e {
        PatternError::UnknownPattern(name) => OrchestratorError::UnknownPattern(name),
    }
}

fn contains_completion_phrase(narrative: &str) -> bool {
    let lowered = narrative.to_lowercase();
    COMPLETION_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

/// The internal tool families every session offers: messaging atop the
/// router, and the observability-emit hook. None are side-effecting in the
/// gated sense — they touch only session-scoped state.
fn builtin_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "send_message",
            "Send a typed message to another participant ('to' may be an actor id or 'all')",
        )
        .with_parameters(serde_json::json!({
            "to": "string",
            "type": "string",
            "content": "object"
        })),
        ToolSpec::new("list_agents", "List the session roster"),
        ToolSpec::new("message_history", "Read the tail of the session's message history")
            .with_parameters(serde_json::json!({ "limit": "number" })),
        ToolSpec::new(
            "emit_observation",
            "Emit a structured observation to the observability sink",
        )
        .with_parameters(serde_json::json!({ "payload": "object" })),
    ]
}
