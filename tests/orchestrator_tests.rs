use async_trait::async_trait;
use ensemble::event::{EventHandler, SessionEvent};
use ensemble::message::Message;
use ensemble::orchestrator::{HandlerResult, Orchestrator, OrchestratorError, ToolHandler};
use ensemble::reasoner::{
    ReasoningClient, ReasoningReply, ReasoningRequest, ToolRequest, ToolSpec,
};
use ensemble::pattern::{Pattern, PatternRegistry, Topology};
use ensemble::router::{MessageRouter, RouterError};
use ensemble::session::{CompletionKind, SessionConfig, SessionStatus};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

/// Always answers with the same narrative and never requests tools.
struct NarrativeClient {
    narrative: String,
    units: usize,
    delay_ms: u64,
}

impl NarrativeClient {
    fn instant(narrative: &str) -> Self {
        Self {
            narrative: narrative.to_string(),
            units: 1,
            delay_ms: 0,
        }
    }
}

#[async_trait]
impl ReasoningClient for NarrativeClient {
    async fn reason(
        &self,
        _request: ReasoningRequest,
    ) -> Result<ReasoningReply, Box<dyn std::error::Error + Send + Sync>> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(ReasoningReply {
            narrative: self.narrative.clone(),
            tool_requests: vec![],
            units_used: self.units,
        })
    }
}

/// Requests one COMPLETE broadcast on each actor's first invocation (keyed by
/// the actor's preamble), then answers with plain narrative.
struct CompleteOnceClient {
    seen: StdMutex<HashSet<String>>,
}

impl CompleteOnceClient {
    fn new() -> Self {
        Self {
            seen: StdMutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ReasoningClient for CompleteOnceClient {
    async fn reason(
        &self,
        request: ReasoningRequest,
    ) -> Result<ReasoningReply, Box<dyn std::error::Error + Send + Sync>> {
        let first_call = self.seen.lock().unwrap().insert(request.system_prompt);
        if first_call {
            Ok(ReasoningReply {
                narrative: "signaling completion".to_string(),
                tool_requests: vec![ToolRequest::new(
                    "send_message",
                    serde_json::json!({
                        "to": "all",
                        "type": "COMPLETE",
                        "content": { "note": "done" }
                    }),
                )],
                units_used: 2,
            })
        } else {
            Ok(ReasoningReply {
                narrative: "acknowledged".to_string(),
                tool_requests: vec![],
                units_used: 1,
            })
        }
    }
}

/// Fails every invocation, standing in for an unreachable reasoning backend.
struct FailingClient;

#[async_trait]
impl ReasoningClient for FailingClient {
    async fn reason(
        &self,
        _request: ReasoningRequest,
    ) -> Result<ReasoningReply, Box<dyn std::error::Error + Send + Sync>> {
        Err("reasoning backend unreachable".into())
    }
}

/// Plans on each actor's first invocation, requests a COMPLETE broadcast on
/// the second, then answers with plain narrative.
struct SecondTurnCompleteClient {
    calls: StdMutex<HashMap<String, usize>>,
}

impl SecondTurnCompleteClient {
    fn new() -> Self {
        Self {
            calls: StdMutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ReasoningClient for SecondTurnCompleteClient {
    async fn reason(
        &self,
        request: ReasoningRequest,
    ) -> Result<ReasoningReply, Box<dyn std::error::Error + Send + Sync>> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(request.system_prompt).or_insert(0);
            *entry += 1;
            *entry
        };
        match call {
            1 => Ok(ReasoningReply {
                narrative: "laying out my plan".to_string(),
                tool_requests: vec![],
                units_used: 1,
            }),
            2 => Ok(ReasoningReply {
                narrative: "wrapping up".to_string(),
                tool_requests: vec![ToolRequest::new(
                    "send_message",
                    serde_json::json!({
                        "to": "all",
                        "type": "COMPLETE",
                        "content": { "note": "done" }
                    }),
                )],
                units_used: 2,
            }),
            _ => Ok(ReasoningReply {
                narrative: "done".to_string(),
                tool_requests: vec![],
                units_used: 1,
            }),
        }
    }
}

/// Records which tools the reasoning primitive was offered, then ends the
/// session via the phrase fallback.
struct CatalogRecordingClient {
    seen_tools: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl ReasoningClient for CatalogRecordingClient {
    async fn reason(
        &self,
        request: ReasoningRequest,
    ) -> Result<ReasoningReply, Box<dyn std::error::Error + Send + Sync>> {
        let mut seen = self.seen_tools.lock().unwrap();
        if seen.is_empty() {
            *seen = request.tools.iter().map(|t| t.name.clone()).collect();
        }
        Ok(ReasoningReply {
            narrative: "collaboration complete".to_string(),
            tool_requests: vec![],
            units_used: 1,
        })
    }
}

struct LedgerHandler;

#[async_trait]
impl ToolHandler for LedgerHandler {
    fn catalog(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("ledger_balance", "Read an account balance"),
            ToolSpec::new("ledger_transfer", "Move funds between accounts").side_effecting(),
        ]
    }

    async fn handle(&self, tool_name: &str, _input: serde_json::Value) -> HandlerResult {
        match tool_name {
            "ledger_balance" => HandlerResult::success(serde_json::json!({ "balance": 42 })),
            other => HandlerResult::failure(format!("refused: {}", other)),
        }
    }
}

/// Records the actor id of every resolved turn, in arrival order.
struct TurnOrderRecorder {
    actor_ids: StdMutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for TurnOrderRecorder {
    async fn on_session_event(&self, event: &SessionEvent) {
        if let SessionEvent::ActorResponded { actor_id, .. } = event {
            self.actor_ids.lock().unwrap().push(actor_id.clone());
        }
    }
}

/// Records session event labels in arrival order.
struct EventRecorder {
    labels: StdMutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn on_session_event(&self, event: &SessionEvent) {
        let label = match event {
            SessionEvent::SessionCreated { .. } => "created".to_string(),
            SessionEvent::SessionRunning { .. } => "running".to_string(),
            SessionEvent::SessionCompleted { .. } => "completed".to_string(),
            SessionEvent::MessageSent { message_type, .. } => {
                format!("sent:{}", message_type)
            }
            _ => return,
        };
        self.labels.lock().unwrap().push(label);
    }
}

async fn wait_terminal(
    orchestrator: &Orchestrator,
    session_id: &str,
) -> ensemble::orchestrator::SessionReport {
    for _ in 0..200 {
        let report = orchestrator.status(session_id).await.unwrap();
        if report.status.is_terminal() {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("session {} never reached a terminal state", session_id);
}

#[tokio::test]
async fn test_mirror_completes_when_both_actors_signal() {
    let orchestrator = Orchestrator::new(Arc::new(CompleteOnceClient::new()));

    let handle = orchestrator
        .invoke("mirror", SessionConfig::new().with_target("X"))
        .await
        .unwrap();
    assert_eq!(handle.actor_ids.len(), 2);

    let report = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.outcome, Some(CompletionKind::Signaled));
    assert!(report.error.is_none());

    let first = report.per_actor_turn_counts[&handle.actor_ids[0]];
    let second = report.per_actor_turn_counts[&handle.actor_ids[1]];
    assert_eq!(first, second);
    assert_eq!(first, 1);

    let (turns, units) = orchestrator
        .actor_usage(&handle.session_id, &handle.actor_ids[0])
        .await
        .unwrap();
    assert_eq!(turns, 1);
    assert!(units > 0);

    let err = orchestrator
        .actor_usage(&handle.session_id, "ghost")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownActor(_)));
}

#[tokio::test]
async fn test_unknown_pattern_and_unknown_session() {
    let orchestrator = Orchestrator::new(Arc::new(NarrativeClient::instant("hi")));

    let err = orchestrator
        .invoke("nonexistent", SessionConfig::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownPattern(_)));
    assert!(orchestrator.list_sessions().await.is_empty());

    let err = orchestrator
        .status("mirror-0000000000000-fabricate")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownSession(_)));
}

#[tokio::test]
async fn test_rejected_type_leaves_no_history_entry() {
    let router = Arc::new(MessageRouter::new());
    let orchestrator = Orchestrator::new(Arc::new(NarrativeClient {
        narrative: "thinking it over".to_string(),
        units: 1,
        delay_ms: 50,
    }))
    .with_router(Arc::clone(&router));

    let handle = orchestrator
        .invoke("mirror", SessionConfig::new())
        .await
        .unwrap();

    let err = router
        .send(Message::new(
            &handle.session_id,
            &handle.actor_ids[0],
            "all",
            "NOT_A_REAL_TYPE",
            serde_json::json!({}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::DisallowedType(_)));

    let history = router.history(&handle.session_id, None).await;
    assert!(history.iter().all(|m| m.message_type != "NOT_A_REAL_TYPE"));

    orchestrator.stop(&handle.session_id).await.unwrap();
}

#[tokio::test]
async fn test_pyramid_budget_exhaustion_runs_exactly_budget_rounds() {
    let orchestrator = Orchestrator::new(Arc::new(NarrativeClient::instant(
        "still working on my aspect",
    )))
    .with_turn_budget(25);

    let handle = orchestrator
        .invoke("pyramid", SessionConfig::new().with_target("0x5a3f"))
        .await
        .unwrap();
    assert_eq!(handle.actor_ids.len(), 4);

    let report = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.outcome, Some(CompletionKind::BudgetExhausted));
    assert_eq!(report.rounds_run, 25);

    // Coordinator: one decomposition turn plus 25 synthesis turns.
    let coordinator = &handle.actor_ids[0];
    assert_eq!(report.per_actor_turn_counts[coordinator], 26);
    for worker in &handle.actor_ids[1..] {
        assert_eq!(report.per_actor_turn_counts[worker], 25);
    }
}

#[tokio::test]
async fn test_role_less_pattern_is_rejected() {
    let registry = Arc::new(PatternRegistry::with_builtins());
    registry.register(Pattern {
        name: "hollow".to_string(),
        topology: Topology::Solo,
        participant_count: 0,
        roles: vec![],
        phases: vec![],
        vocabulary: vec![],
    });
    let orchestrator =
        Orchestrator::new(Arc::new(NarrativeClient::instant("hi"))).with_registry(registry);

    let err = orchestrator
        .invoke("hollow", SessionConfig::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidPattern(_)));
    assert!(orchestrator.list_sessions().await.is_empty());
}

#[tokio::test]
async fn test_duration_cap_times_out_session() {
    let orchestrator = Orchestrator::new(Arc::new(NarrativeClient {
        narrative: "taking my time".to_string(),
        units: 1,
        delay_ms: 200,
    }));

    let handle = orchestrator
        .invoke("mirror", SessionConfig::new().with_duration_cap_secs(1))
        .await
        .unwrap();

    let report = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!(report.status, SessionStatus::Timeout);
    assert!(report.outcome.is_none());
    assert!(report.error.is_none());
    assert!(report.completed_at.is_some());
}

#[tokio::test]
async fn test_reasoner_fault_records_session_error() {
    let orchestrator = Orchestrator::new(Arc::new(FailingClient));

    let handle = orchestrator
        .invoke("solo", SessionConfig::new())
        .await
        .unwrap();

    let report = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!(report.status, SessionStatus::Error);
    assert!(report
        .error
        .as_deref()
        .unwrap()
        .contains("reasoning backend unreachable"));
    assert!(report.outcome.is_none());
}

#[tokio::test]
async fn test_roundtable_runs_strictly_sequential_rounds() {
    let recorder = Arc::new(TurnOrderRecorder {
        actor_ids: StdMutex::new(Vec::new()),
    });
    let orchestrator = Orchestrator::new(Arc::new(SecondTurnCompleteClient::new()))
        .with_event_handler(recorder.clone());

    let handle = orchestrator
        .invoke("roundtable", SessionConfig::new())
        .await
        .unwrap();
    assert_eq!(handle.actor_ids.len(), 3);

    let report = wait_terminal(&orchestrator, &handle.session_id).await;
    // Everyone signaled during round one, after the initialization pass.
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.outcome, Some(CompletionKind::Signaled));
    assert_eq!(report.rounds_run, 1);
    for actor_id in &handle.actor_ids {
        assert_eq!(report.per_actor_turn_counts[actor_id], 2);
    }

    // Turns resolve one at a time, in seating order, in both passes.
    let order = recorder.actor_ids.lock().unwrap().clone();
    let mut expected = handle.actor_ids.clone();
    expected.extend(handle.actor_ids.iter().cloned());
    assert_eq!(order, expected);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let orchestrator = Orchestrator::new(Arc::new(NarrativeClient {
        narrative: "no end in sight".to_string(),
        units: 1,
        delay_ms: 50,
    }));

    let handle = orchestrator
        .invoke("mirror", SessionConfig::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first = orchestrator.stop(&handle.session_id).await.unwrap();
    assert_eq!(first.final_status, SessionStatus::Stopped);

    let second = orchestrator.stop(&handle.session_id).await.unwrap();
    assert_eq!(second.final_status, SessionStatus::Stopped);
    assert!(second.ran_for_seconds >= first.ran_for_seconds);

    let report = orchestrator.status(&handle.session_id).await.unwrap();
    assert_eq!(report.status, SessionStatus::Stopped);
}

#[tokio::test]
async fn test_solo_budget_termination() {
    let orchestrator =
        Orchestrator::new(Arc::new(NarrativeClient::instant("grinding away"))).with_turn_budget(3);

    let handle = orchestrator
        .invoke("solo", SessionConfig::new())
        .await
        .unwrap();

    let report = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.outcome, Some(CompletionKind::BudgetExhausted));
    assert_eq!(report.rounds_run, 3);
    assert_eq!(report.per_actor_turn_counts[&handle.actor_ids[0]], 3);
}

#[tokio::test]
async fn test_phrase_fallback_completes_solo() {
    let orchestrator = Orchestrator::new(Arc::new(NarrativeClient::instant(
        "Collaboration complete: nothing suspicious found.",
    )));

    let handle = orchestrator
        .invoke("solo", SessionConfig::new())
        .await
        .unwrap();

    let report = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.outcome, Some(CompletionKind::Signaled));
    assert_eq!(report.rounds_run, 1);
}

#[tokio::test]
async fn test_per_actor_unit_cap_ends_session() {
    let orchestrator = Orchestrator::new(Arc::new(NarrativeClient {
        narrative: "burning units".to_string(),
        units: 2,
        delay_ms: 0,
    }))
    .with_turn_budget(10);

    let handle = orchestrator
        .invoke("solo", SessionConfig::new().with_per_agent_unit_cap(3))
        .await
        .unwrap();

    let report = wait_terminal(&orchestrator, &handle.session_id).await;
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.outcome, Some(CompletionKind::BudgetExhausted));

    let actor = &handle.actor_ids[0];
    assert_eq!(report.per_actor_turn_counts[actor], 2);
    assert_eq!(report.per_actor_unit_usage[actor], 4);
}

#[tokio::test]
async fn test_side_effecting_tools_are_omitted_by_default() {
    let seen_tools = Arc::new(StdMutex::new(Vec::new()));
    let orchestrator = Orchestrator::new(Arc::new(CatalogRecordingClient {
        seen_tools: Arc::clone(&seen_tools),
    }));
    orchestrator
        .register_tool_handler("ledger_", Arc::new(LedgerHandler))
        .await;

    let handle = orchestrator
        .invoke("solo", SessionConfig::new())
        .await
        .unwrap();
    wait_terminal(&orchestrator, &handle.session_id).await;

    let seen = seen_tools.lock().unwrap().clone();
    assert!(seen.contains(&"send_message".to_string()));
    assert!(seen.contains(&"ledger_balance".to_string()));
    assert!(!seen.contains(&"ledger_transfer".to_string()));
}

#[tokio::test]
async fn test_side_effecting_tools_offered_when_allowed() {
    let seen_tools = Arc::new(StdMutex::new(Vec::new()));
    let orchestrator = Orchestrator::new(Arc::new(CatalogRecordingClient {
        seen_tools: Arc::clone(&seen_tools),
    }));
    orchestrator
        .register_tool_handler("ledger_", Arc::new(LedgerHandler))
        .await;

    let handle = orchestrator
        .invoke("solo", SessionConfig::new().with_side_effects_allowed())
        .await
        .unwrap();
    wait_terminal(&orchestrator, &handle.session_id).await;

    let seen = seen_tools.lock().unwrap().clone();
    assert!(seen.contains(&"ledger_transfer".to_string()));
}

#[tokio::test]
async fn test_lifecycle_events_arrive_in_order() {
    let recorder = Arc::new(EventRecorder {
        labels: StdMutex::new(Vec::new()),
    });
    let orchestrator = Orchestrator::new(Arc::new(CompleteOnceClient::new()))
        .with_event_handler(recorder.clone());

    let handle = orchestrator
        .invoke("mirror", SessionConfig::new())
        .await
        .unwrap();
    wait_terminal(&orchestrator, &handle.session_id).await;
    // The completion event is emitted just after the status flips.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let labels = recorder.labels.lock().unwrap().clone();
    let position = |wanted: &str| {
        labels
            .iter()
            .position(|l| l == wanted)
            .unwrap_or_else(|| panic!("missing event '{}' in {:?}", wanted, labels))
    };
    assert!(position("created") < position("running"));
    assert!(position("running") < position("completed"));
    assert!(labels.contains(&"sent:COMPLETE".to_string()));
}
