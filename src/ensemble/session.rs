//! Session lifecycle
//!
//! A [`Session`] is one running instance of a pattern: a pattern binding, a
//! resolved configuration, a set of spawned actors, and a status that moves
//! monotonically through the lifecycle state machine. Sessions are the unit
//! of lifecycle control — created by
//! [`Orchestrator::invoke`](crate::orchestrator::Orchestrator::invoke),
//! inspected via `status`, and torn down by `stop` or by reaching a terminal
//! state. Nothing survives the session; no cross-session state is retained.

use crate::ensemble::actor::AgentActor;
use crate::ensemble::pattern::Pattern;
use crate::ensemble::reasoner::ToolSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Enumerated environment selector for sessions whose tools touch a network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Default for Network {
    fn default() -> Self {
        Network::Testnet
    }
}

/// Lifecycle states of a session.
///
/// The happy path is `Initializing → SpawningAgents → Running → Completing →
/// Completed`. The branch into `Error`, `Timeout`, or `Stopped` is reachable
/// from any non-terminal state. Terminal states are absorbing: once reached,
/// no further transition is ever observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Initializing,
    SpawningAgents,
    Running,
    Completing,
    Completed,
    Error,
    Timeout,
    Stopped,
}

impl SessionStatus {
    /// Whether this status is terminal (absorbing).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Error
                | SessionStatus::Timeout
                | SessionStatus::Stopped
        )
    }

    /// Position along the happy path, used to enforce monotonicity.
    fn rank(&self) -> u8 {
        match self {
            SessionStatus::Initializing => 0,
            SessionStatus::SpawningAgents => 1,
            SessionStatus::Running => 2,
            SessionStatus::Completing => 3,
            SessionStatus::Completed
            | SessionStatus::Error
            | SessionStatus::Timeout
            | SessionStatus::Stopped => 4,
        }
    }
}

/// How a completed session finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionKind {
    /// Every required participant signaled completion.
    Signaled,
    /// The turn budget ran out first. This is an expected outcome, not a
    /// fault; the session carries whatever partial result exists.
    BudgetExhausted,
}

/// Resolved per-session configuration, fixed at creation.
///
/// The side-effect gate is not mutable after the session starts: when
/// `allow_side_effects` is false, side-effecting tools are omitted from the
/// catalog offered to actors entirely, not merely blocked at call time.
///
/// # Examples
///
/// ```
/// use ensemble::session::{Network, SessionConfig};
///
/// let config = SessionConfig::new()
///     .with_target("0x5a3f...c41")
///     .with_network(Network::Mainnet)
///     .with_duration_cap_secs(300)
///     .with_per_agent_unit_cap(50_000);
/// assert!(!config.allow_side_effects);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Opaque reference the collaboration is about (e.g. an address under
    /// analysis).
    pub target: Option<String>,
    /// Environment selector forwarded to tool handlers.
    pub network: Network,
    /// Wall-clock cap in seconds; `0` means unbounded.
    pub duration_cap_secs: u64,
    /// Gate for side-effecting tools. `false` omits them from the catalog.
    pub allow_side_effects: bool,
    /// Per-actor reasoning-unit cap; `0` means uncapped. Enforced by the
    /// orchestrator between turns, never mid-turn.
    pub per_agent_unit_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            target: None,
            network: Network::default(),
            duration_cap_secs: 0,
            allow_side_effects: false,
            per_agent_unit_cap: 0,
        }
    }

    /// Set the opaque target reference (builder pattern).
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Select the network environment (builder pattern).
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Cap the session's wall-clock duration in seconds (builder pattern).
    pub fn with_duration_cap_secs(mut self, secs: u64) -> Self {
        self.duration_cap_secs = secs;
        self
    }

    /// Allow side-effecting tools into the catalog (builder pattern).
    pub fn with_side_effects_allowed(mut self) -> Self {
        self.allow_side_effects = true;
        self
    }

    /// Cap each actor's cumulative reasoning units (builder pattern).
    pub fn with_per_agent_unit_cap(mut self, cap: usize) -> Self {
        self.per_agent_unit_cap = cap;
        self
    }
}

/// One collaboration instance.
///
/// Actors live behind individual `Arc<Mutex<_>>` cells so logically
/// concurrent turns (duet rounds, hierarchical worker fan-out) can run
/// without a session-wide lock while each actor's own turn sequence stays
/// strictly serial.
pub struct Session {
    /// Globally unique: pattern name + millisecond timestamp + random suffix.
    pub id: String,
    /// The bound pattern definition.
    pub pattern: Arc<Pattern>,
    /// Resolved configuration, immutable for the session's lifetime.
    pub config: SessionConfig,
    /// Tool catalog offered to this session's actors, computed once at
    /// creation (side-effecting tools already filtered per config).
    pub tools: Vec<ToolSpec>,

    status: SessionStatus,
    actors: HashMap<String, Arc<Mutex<AgentActor>>>,
    actor_order: Vec<String>,
    /// Actors that have signaled completion (structured message or phrase).
    pub completed_actors: HashSet<String>,
    /// Per-actor turn counts, kept here so they survive actor release.
    pub turn_counts: HashMap<String, usize>,
    /// Per-actor cumulative reasoning units, likewise retained.
    pub unit_usage: HashMap<String, usize>,
    /// Rounds the topology loop has executed.
    pub rounds_run: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub outcome: Option<CompletionKind>,
}

impl Session {
    /// Allocate a session around a resolved pattern. Status starts at
    /// `Initializing`; actors are attached during spawning.
    pub fn new(pattern: Arc<Pattern>, config: SessionConfig) -> Self {
        let id = format!(
            "{}-{}-{}",
            pattern.name,
            Utc::now().timestamp_millis(),
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        Self {
            id,
            pattern,
            config,
            tools: Vec::new(),
            status: SessionStatus::Initializing,
            actors: HashMap::new(),
            actor_order: Vec::new(),
            completed_actors: HashSet::new(),
            turn_counts: HashMap::new(),
            unit_usage: HashMap::new(),
            rounds_run: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            outcome: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Attempt a status transition, enforcing the state machine.
    ///
    /// Transitions out of a terminal state, and backwards moves along the
    /// happy path, are ignored. Returns whether the transition took effect.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if !next.is_terminal() && next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Attach a spawned actor. Order of attachment is the turn order.
    pub fn attach_actor(&mut self, actor: AgentActor) {
        let id = actor.id.clone();
        self.actor_order.push(id.clone());
        self.actors.insert(id, Arc::new(Mutex::new(actor)));
    }

    /// Actor ids in spawn order.
    pub fn actor_ids(&self) -> Vec<String> {
        self.actor_order.clone()
    }

    /// Shared handle to one actor.
    pub fn actor(&self, id: &str) -> Option<Arc<Mutex<AgentActor>>> {
        self.actors.get(id).cloned()
    }

    /// Shared handles to every actor, in spawn order.
    pub fn actors_in_order(&self) -> Vec<(String, Arc<Mutex<AgentActor>>)> {
        self.actor_order
            .iter()
            .filter_map(|id| self.actors.get(id).map(|a| (id.clone(), Arc::clone(a))))
            .collect()
    }

    /// Record one finished turn for an actor.
    pub fn record_turn(&mut self, actor_id: &str, units: usize) {
        *self.turn_counts.entry(actor_id.to_string()).or_insert(0) += 1;
        *self.unit_usage.entry(actor_id.to_string()).or_insert(0) += units;
    }

    /// Drop every actor handle. Turn and unit bookkeeping survives for
    /// post-terminal introspection. Called when the session reaches a
    /// terminal state.
    pub fn release_actors(&mut self) {
        self.actors.clear();
    }

    /// Seconds between session start and completion (or now, if still live).
    pub fn ran_for_seconds(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::pattern::PatternRegistry;

    fn fresh_session() -> Session {
        let pattern = PatternRegistry::with_builtins().resolve("mirror").unwrap();
        Session::new(pattern, SessionConfig::new())
    }

    #[test]
    fn session_id_embeds_pattern_name() {
        let session = fresh_session();
        assert!(session.id.starts_with("mirror-"));
    }

    #[test]
    fn transitions_are_monotonic() {
        let mut session = fresh_session();
        assert!(session.transition(SessionStatus::SpawningAgents));
        assert!(session.transition(SessionStatus::Running));
        // backwards moves are ignored
        assert!(!session.transition(SessionStatus::SpawningAgents));
        assert_eq!(session.status(), SessionStatus::Running);
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut session = fresh_session();
        assert!(session.transition(SessionStatus::Stopped));
        assert!(!session.transition(SessionStatus::Running));
        assert!(!session.transition(SessionStatus::Completed));
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn error_branch_reachable_from_any_live_state() {
        let mut session = fresh_session();
        assert!(session.transition(SessionStatus::Error));
        assert_eq!(session.status(), SessionStatus::Error);

        let mut session = fresh_session();
        session.transition(SessionStatus::SpawningAgents);
        session.transition(SessionStatus::Running);
        assert!(session.transition(SessionStatus::Timeout));
    }
}
