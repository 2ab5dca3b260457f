//! Agent Actor / turn execution
//!
//! One [`AgentActor`] exists per role per session. An actor owns its
//! conversation history, turn counter, cumulative reasoning-unit usage, and a
//! status that mirrors the phase it is in. Its single operation is
//! [`execute_turn`](AgentActor::execute_turn): a bounded tool-use loop that
//! interleaves reasoning-primitive invocations with tool dispatches until the
//! primitive produces a turn with no further tool requests.
//!
//! The tool sub-loop lives here, not in the orchestrator: tool calls and
//! reasoning are interleaved at sub-turn granularity, and the primitive's
//! context must see tool outcomes before it can produce its final narrative.
//! The orchestrator only ever sees whole turns, which keeps the topology
//! loops simple.

use crate::ensemble::event::{ActorEvent, EventHandler};
use crate::ensemble::pattern::{Pattern, RoleTemplate};
use crate::ensemble::reasoner::{
    ConversationEntry, ReasoningClient, ReasoningRequest, Role, ToolOutcome, ToolRequest,
    ToolSpec,
};
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

/// Upper bound on reasoning-primitive invocations within one turn. Each tool
/// dispatch costs one further invocation, so a turn can execute at most
/// `MAX_TOOL_ITERATIONS` batches of tool calls before it is cut off.
pub const MAX_TOOL_ITERATIONS: usize = 5;

/// Status of an actor, maintained for observability. Not used for control
/// decisions elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActorStatus {
    Initializing,
    Idle,
    Thinking,
    ExecutingTool,
    WaitingForMessage,
    Completed,
    Error,
}

/// The seam through which an actor surfaces requested side effects.
///
/// The orchestrator supplies the implementation: internal tool families
/// (messaging, observability) are intercepted directly, everything else is
/// routed to externally registered handlers. Dispatch never fails as a Rust
/// error — failures come back as outcomes with `is_error: true` so the
/// actor's own reasoning can react.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, actor_id: &str, request: &ToolRequest) -> ToolOutcome;
}

/// Everything produced by one turn.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// The final narrative response.
    pub response: String,
    /// Tool invocations requested during the turn, in request order.
    pub tool_calls: Vec<ToolRequest>,
    /// The outcome of each dispatched invocation, aligned with `tool_calls`.
    pub tool_results: Vec<ToolOutcome>,
    /// Reasoning units consumed across every invocation in this turn.
    pub units_used: usize,
}

/// One record in the actor's turn log: the input it was given and the outcome
/// it produced, including any tool traffic.
#[derive(Clone, Debug)]
pub struct TurnRecord {
    pub input: String,
    pub outcome: TurnOutcome,
}

/// A per-role participant in one session.
///
/// Actors are created at session spawn and destroyed with the session; the
/// instruction preamble is built once from role, pattern, and session and is
/// immutable for the actor's lifetime. Turns are strictly sequential per
/// actor — concurrency, if any, happens across actors.
pub struct AgentActor {
    /// Globally unique within the session: `<session_id>/<role>-<index>`.
    pub id: String,
    /// The role template this actor was instantiated from.
    pub role: RoleTemplate,
    /// Immutable instruction preamble used as the system prompt every turn.
    pub preamble: String,

    conversation: Vec<ConversationEntry>,
    turns: Vec<TurnRecord>,
    turn_count: usize,
    units_used: usize,
    status: ActorStatus,
    client: Arc<dyn ReasoningClient>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl AgentActor {
    /// Instantiate an actor from a role template.
    ///
    /// `index` is the role's position within the pattern; together with the
    /// session id and role name it forms the actor's identity.
    pub fn spawn(
        session_id: &str,
        index: usize,
        role: RoleTemplate,
        pattern: &Pattern,
        target: Option<&str>,
        client: Arc<dyn ReasoningClient>,
    ) -> Self {
        let id = format!("{}/{}-{}", session_id, role.name, index);
        let preamble = build_preamble(&id, &role, pattern, target);
        Self {
            id,
            role,
            preamble,
            conversation: Vec::new(),
            turns: Vec::new(),
            turn_count: 0,
            units_used: 0,
            status: ActorStatus::Initializing,
            client,
            event_handler: None,
        }
    }

    /// Attach an event handler for [`ActorEvent`]s (propagated from the
    /// orchestrator at spawn time).
    pub fn set_event_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.event_handler = Some(handler);
    }

    pub fn status(&self) -> ActorStatus {
        self.status
    }

    /// Mark the actor as waiting for inbound messages (set by the topology
    /// loop between rounds).
    pub fn set_waiting(&mut self) {
        if !matches!(self.status, ActorStatus::Completed | ActorStatus::Error) {
            self.status = ActorStatus::WaitingForMessage;
        }
    }

    /// Mark the actor terminally complete and release its conversation.
    pub fn complete(&mut self) {
        self.status = ActorStatus::Completed;
        self.conversation.clear();
    }

    /// Number of turns executed so far.
    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    /// Cumulative reasoning units consumed across all turns.
    pub fn units_used(&self) -> usize {
        self.units_used
    }

    /// The actor's turn log, oldest first.
    pub fn turns(&self) -> &[TurnRecord] {
        &self.turns
    }

    async fn emit(&self, event: ActorEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_actor_event(&event).await;
        }
    }

    /// Execute one turn: feed `input` plus the tool catalog to the reasoning
    /// primitive, dispatch any requested tools through `dispatcher`, replay
    /// the outcomes, and repeat until an invocation produces no further tool
    /// requests or [`MAX_TOOL_ITERATIONS`] is reached.
    ///
    /// A primitive error is a turn-execution fault and propagates; tool
    /// failures do not — they are replayed into the conversation as error
    /// outcomes.
    pub async fn execute_turn(
        &mut self,
        input: &str,
        tools: &[ToolSpec],
        dispatcher: &dyn ToolDispatcher,
    ) -> Result<TurnOutcome, Box<dyn Error + Send + Sync>> {
        let preview: String = input.chars().take(120).collect();
        self.emit(ActorEvent::TurnStarted {
            actor_id: self.id.clone(),
            input_preview: preview,
        })
        .await;

        self.conversation
            .push(ConversationEntry::new(Role::User, input));

        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();
        let mut turn_units = 0;
        let mut iteration = 0;

        let narrative = loop {
            iteration += 1;
            self.status = ActorStatus::Thinking;
            self.emit(ActorEvent::ReasonerCallStarted {
                actor_id: self.id.clone(),
                iteration,
            })
            .await;

            let reply = match self
                .client
                .reason(ReasoningRequest {
                    system_prompt: self.preamble.clone(),
                    conversation: self.conversation.clone(),
                    tools: tools.to_vec(),
                })
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    self.status = ActorStatus::Error;
                    return Err(e);
                }
            };

            turn_units += reply.units_used;
            self.units_used += reply.units_used;
            self.emit(ActorEvent::ReasonerCallCompleted {
                actor_id: self.id.clone(),
                iteration,
                units_used: reply.units_used,
                response_length: reply.narrative.len(),
            })
            .await;

            self.conversation
                .push(ConversationEntry::new(Role::Assistant, &reply.narrative));

            if reply.tool_requests.is_empty() {
                break reply.narrative;
            }

            if iteration >= MAX_TOOL_ITERATIONS {
                self.emit(ActorEvent::ToolLoopCapReached {
                    actor_id: self.id.clone(),
                })
                .await;
                log::debug!("actor {} hit the tool-loop cap", self.id);
                break reply.narrative;
            }

            self.status = ActorStatus::ExecutingTool;
            for request in reply.tool_requests {
                self.emit(ActorEvent::ToolCallRequested {
                    actor_id: self.id.clone(),
                    tool_name: request.name.clone(),
                    input: request.input.clone(),
                    iteration,
                })
                .await;

                let outcome = dispatcher.dispatch(&self.id, &request).await;

                self.emit(ActorEvent::ToolCallCompleted {
                    actor_id: self.id.clone(),
                    tool_name: request.name.clone(),
                    is_error: outcome.is_error,
                    iteration,
                })
                .await;

                let replay = if outcome.is_error {
                    format!(
                        "Tool '{}' failed: {}",
                        outcome.tool_name,
                        outcome.result.as_str().unwrap_or("unknown error")
                    )
                } else {
                    format!(
                        "Tool '{}' result: {}",
                        outcome.tool_name,
                        serde_json::to_string(&outcome.result)
                            .unwrap_or_else(|_| String::from("<unserializable>"))
                    )
                };
                self.conversation
                    .push(ConversationEntry::new(Role::Tool, replay));

                tool_calls.push(request);
                tool_results.push(outcome);
            }
        };

        self.turn_count += 1;
        self.status = ActorStatus::Idle;

        let outcome = TurnOutcome {
            response: narrative,
            tool_calls,
            tool_results,
            units_used: turn_units,
        };

        self.emit(ActorEvent::TurnCompleted {
            actor_id: self.id.clone(),
            units_used: outcome.units_used,
            tool_calls_made: outcome.tool_calls.len(),
            response_length: outcome.response.len(),
        })
        .await;

        self.turns.push(TurnRecord {
            input: input.to_string(),
            outcome: outcome.clone(),
        });

        Ok(outcome)
    }
}

/// Build the immutable instruction preamble from role, pattern, and session
/// framing. Mirrors the shape shown to every actor: identity, mandate,
/// disposition, responsibilities, workflow phases, roster protocol.
fn build_preamble(
    actor_id: &str,
    role: &RoleTemplate,
    pattern: &Pattern,
    target: Option<&str>,
) -> String {
    let mut preamble = format!(
        "You are '{}', the {} in a '{}' collaboration ({} topology, {} participants).\n",
        actor_id,
        role.name,
        pattern.name,
        pattern.topology.name(),
        pattern.participant_count,
    );
    preamble.push_str(&format!("Your mandate: {}\n", role.mandate));
    if !role.disposition.is_empty() {
        preamble.push_str(&format!("Your approach: {}\n", role.disposition));
    }
    if !role.responsibilities.is_empty() {
        preamble.push_str("Your responsibilities:\n");
        for responsibility in &role.responsibilities {
            preamble.push_str(&format!("- {}\n", responsibility));
        }
    }
    if let Some(target) = target {
        preamble.push_str(&format!("The target under analysis: {}\n", target));
    }
    if !pattern.phases.is_empty() {
        preamble.push_str("Workflow phases:\n");
        for phase in &pattern.phases {
            preamble.push_str(&format!("- {}: {}\n", phase.name, phase.guidance));
        }
    }
    preamble.push_str(
        "Coordinate with the other participants using the messaging tools. \
         When your part of the collaboration is finished, send a COMPLETE message.\n",
    );
    preamble
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::pattern::PatternRegistry;
    use crate::ensemble::reasoner::ReasoningReply;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted client: requests one tool on the first invocation, then
    /// answers with plain narrative.
    struct OneToolClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReasoningClient for OneToolClient {
        async fn reason(
            &self,
            _request: ReasoningRequest,
        ) -> Result<ReasoningReply, Box<dyn Error + Send + Sync>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(ReasoningReply {
                    narrative: String::from("checking the ledger"),
                    tool_requests: vec![ToolRequest::new(
                        "ledger_balance",
                        serde_json::json!({"address": "0xabc"}),
                    )],
                    units_used: 7,
                })
            } else {
                Ok(ReasoningReply {
                    narrative: String::from("balance confirmed"),
                    tool_requests: vec![],
                    units_used: 3,
                })
            }
        }
    }

    struct EchoDispatcher;

    #[async_trait]
    impl ToolDispatcher for EchoDispatcher {
        async fn dispatch(&self, _actor_id: &str, request: &ToolRequest) -> ToolOutcome {
            ToolOutcome::success(request, serde_json::json!({"echo": request.name}))
        }
    }

    fn test_actor(client: Arc<dyn ReasoningClient>) -> AgentActor {
        let pattern = PatternRegistry::with_builtins().resolve("solo").unwrap();
        let role = pattern.roles[0].clone();
        AgentActor::spawn("solo-1-test", 0, role, &pattern, Some("0xabc"), client)
    }

    #[tokio::test]
    async fn turn_resolves_tools_then_finishes() {
        let mut actor = test_actor(Arc::new(OneToolClient {
            calls: AtomicUsize::new(0),
        }));

        let outcome = actor
            .execute_turn("Check the balance", &[], &EchoDispatcher)
            .await
            .unwrap();

        assert_eq!(outcome.response, "balance confirmed");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_results.len(), 1);
        assert!(!outcome.tool_results[0].is_error);
        assert_eq!(outcome.units_used, 10);
        assert_eq!(actor.turn_count(), 1);
        assert_eq!(actor.units_used(), 10);
        assert_eq!(actor.status(), ActorStatus::Idle);
    }

    /// A client that always requests another tool must be cut off at the cap.
    struct GreedyClient;

    #[async_trait]
    impl ReasoningClient for GreedyClient {
        async fn reason(
            &self,
            _request: ReasoningRequest,
        ) -> Result<ReasoningReply, Box<dyn Error + Send + Sync>> {
            Ok(ReasoningReply {
                narrative: String::from("one more thing"),
                tool_requests: vec![ToolRequest::new("noop", serde_json::json!({}))],
                units_used: 1,
            })
        }
    }

    #[tokio::test]
    async fn tool_loop_is_bounded() {
        let mut actor = test_actor(Arc::new(GreedyClient));

        let outcome = actor
            .execute_turn("go", &[], &EchoDispatcher)
            .await
            .unwrap();

        // The final (capped) iteration's requests are not dispatched.
        assert_eq!(outcome.tool_calls.len(), MAX_TOOL_ITERATIONS - 1);
        assert_eq!(outcome.units_used, MAX_TOOL_ITERATIONS);
    }

    #[tokio::test]
    async fn waiting_status_applies_only_to_live_actors() {
        let mut actor = test_actor(Arc::new(OneToolClient {
            calls: AtomicUsize::new(0),
        }));
        actor
            .execute_turn("go", &[], &EchoDispatcher)
            .await
            .unwrap();
        assert_eq!(actor.status(), ActorStatus::Idle);

        actor.set_waiting();
        assert_eq!(actor.status(), ActorStatus::WaitingForMessage);

        actor.complete();
        actor.set_waiting();
        assert_eq!(actor.status(), ActorStatus::Completed);
    }

    #[test]
    fn preamble_carries_role_and_target() {
        let pattern = PatternRegistry::with_builtins().resolve("mirror").unwrap();
        let role = pattern.roles[1].clone();
        let actor = AgentActor::spawn(
            "mirror-1-x",
            1,
            role,
            &pattern,
            Some("0xdeadbeef"),
            Arc::new(GreedyClient),
        );
        assert_eq!(actor.id, "mirror-1-x/reflector-1");
        assert!(actor.preamble.contains("0xdeadbeef"));
        assert!(actor.preamble.contains("Duet"));
    }
}
