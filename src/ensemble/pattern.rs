//! Collaboration Pattern Registry
//!
//! A [`Pattern`] is the immutable template behind a session: which topology
//! drives the loop, how many participants take part, the role templates each
//! actor is instantiated from, the workflow phases woven into actor preambles,
//! and the vocabulary of permitted message types.
//!
//! Pattern descriptions are human-authored prose, so loading one is a
//! best-effort fallback chain rather than strict parsing:
//!
//! 1. try a markdown role table (`| Role | Mandate | ... |`)
//! 2. try `###`-headed role subsections with `**Mandate:**`-style fields
//! 3. fall back to a hard-coded default role set keyed by pattern name
//!
//! Optional sections (vocabulary, phases) degrade to sane defaults instead of
//! erroring — a parse failure must never block session creation.
//!
//! # Example
//!
//! ```
//! use ensemble::pattern::{PatternRegistry, Topology};
//!
//! let registry = PatternRegistry::with_builtins();
//! let mirror = registry.resolve("mirror").unwrap();
//! assert_eq!(mirror.topology, Topology::Duet);
//! assert_eq!(mirror.participant_count, 2);
//! ```

use crate::ensemble::message::STANDARD_VOCABULARY;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Topology classes a pattern can declare. Each maps to one driving
/// discipline in the orchestrator's topology loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topology {
    /// A single actor iterating alone.
    Solo,
    /// Two actors taking concurrent turns each round.
    Duet,
    /// Three or more actors taking strictly sequential turns within a round.
    Group,
    /// One coordinating role plus N worker roles: decompose, fan out,
    /// synthesize.
    Hierarchical,
}

impl Topology {
    /// Human-readable name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            Topology::Solo => "Solo",
            Topology::Duet => "Duet",
            Topology::Group => "Group",
            Topology::Hierarchical => "Hierarchical",
        }
    }
}

/// Template for one participant's mandate and framing within a pattern.
///
/// Roles are templates only — each session instantiates fresh actors from
/// them, nothing is shared across sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoleTemplate {
    /// Short role name (`"coordinator"`, `"observer"`). Becomes part of the
    /// actor id.
    pub name: String,
    /// One-line mandate describing what this role exists to do.
    pub mandate: String,
    /// Behavioral disposition, used only to shape the actor's framing.
    pub disposition: String,
    /// Responsibility statements embedded into the actor's preamble.
    pub responsibilities: Vec<String>,
}

impl RoleTemplate {
    pub fn new(name: impl Into<String>, mandate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandate: mandate.into(),
            disposition: String::new(),
            responsibilities: Vec::new(),
        }
    }

    /// Set the behavioral disposition (builder pattern).
    pub fn with_disposition(mut self, disposition: impl Into<String>) -> Self {
        self.disposition = disposition.into();
        self
    }

    /// Append a responsibility statement (builder pattern).
    pub fn with_responsibility(mut self, responsibility: impl Into<String>) -> Self {
        self.responsibilities.push(responsibility.into());
        self
    }
}

/// One named phase of a pattern's workflow, with free-text guidance that is
/// surfaced to actors in their preamble.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub name: String,
    pub guidance: String,
}

impl WorkflowPhase {
    pub fn new(name: impl Into<String>, guidance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guidance: guidance.into(),
        }
    }
}

/// Immutable definition of a collaboration pattern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pattern {
    /// Identity name, unique within a registry.
    pub name: String,
    /// Driving discipline for the topology loop.
    pub topology: Topology,
    /// Number of participants a session of this pattern spawns.
    pub participant_count: usize,
    /// Ordered role templates; index order determines actor spawn order. For
    /// [`Topology::Hierarchical`] the first role is the coordinator.
    pub roles: Vec<RoleTemplate>,
    /// Ordered workflow phases.
    pub phases: Vec<WorkflowPhase>,
    /// Message types this pattern permits beyond the standard defaults.
    pub vocabulary: Vec<String>,
}

impl Pattern {
    /// Whether `message_type` is permitted in sessions of this pattern.
    ///
    /// The permitted set is the pattern's own vocabulary plus the standard
    /// defaults — a closed enumeration.
    pub fn permits_type(&self, message_type: &str) -> bool {
        STANDARD_VOCABULARY.contains(&message_type)
            || self.vocabulary.iter().any(|t| t == message_type)
    }

    /// The coordinator role for hierarchical patterns, by convention role 0.
    pub fn coordinator_role(&self) -> Option<&RoleTemplate> {
        match self.topology {
            Topology::Hierarchical => self.roles.first(),
            _ => None,
        }
    }
}

/// Errors surfaced by the registry.
#[derive(Debug, Clone)]
pub enum PatternError {
    /// No pattern with the given name is registered.
    UnknownPattern(String),
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::UnknownPattern(name) => write!(f, "Unknown pattern: {}", name),
        }
    }
}

impl Error for PatternError {}

/// Static catalog of collaboration patterns, cached by name for the life of
/// the process.
///
/// The registry is an explicitly constructed value — create as many as you
/// need, there is no global state.
pub struct PatternRegistry {
    patterns: RwLock<HashMap<String, Arc<Pattern>>>,
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry pre-populated with the built-in catalog:
    ///
    /// | Name | Topology | Participants |
    /// |------|----------|--------------|
    /// | `solo` | Solo | 1 |
    /// | `mirror` | Duet | 2 |
    /// | `roundtable` | Group | 3 |
    /// | `pyramid` | Hierarchical | 4 (1 coordinator + 3 workers) |
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for name in &["solo", "mirror", "roundtable", "pyramid"] {
            let (topology, count) = builtin_shape(name);
            registry.register(Pattern {
                name: (*name).to_string(),
                topology,
                participant_count: count,
                roles: default_roles(name, topology, count),
                phases: default_phases(topology),
                vocabulary: Vec::new(),
            });
        }
        registry
    }

    /// Insert (or replace) a fully formed pattern.
    pub fn register(&self, pattern: Pattern) {
        let mut patterns = self.patterns.write().expect("pattern registry poisoned");
        patterns.insert(pattern.name.clone(), Arc::new(pattern));
    }

    /// Look up a pattern by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<Pattern>, PatternError> {
        let patterns = self.patterns.read().expect("pattern registry poisoned");
        patterns
            .get(name)
            .cloned()
            .ok_or_else(|| PatternError::UnknownPattern(name.to_string()))
    }

    /// Names of every registered pattern, unordered.
    pub fn pattern_names(&self) -> Vec<String> {
        let patterns = self.patterns.read().expect("pattern registry poisoned");
        patterns.keys().cloned().collect()
    }

    /// Parse a pattern out of a semi-structured textual description, register
    /// it, and return it.
    ///
    /// Role extraction runs the fallback chain documented at the module level.
    /// The optional vocabulary section (`Vocabulary:` / `Message types:` lines
    /// of `UPPER_SNAKE` words) and `##`-headed phase sections degrade to
    /// defaults when absent or unparseable. This method does not fail on
    /// malformed input — the input is human-authored prose and availability
    /// wins over strict validation.
    pub fn load(&self, name: &str, topology: Topology, source_text: &str) -> Arc<Pattern> {
        let mut roles = parse_role_table(source_text);
        if roles.is_empty() {
            roles = parse_role_sections(source_text);
        }
        if roles.is_empty() {
            log::debug!(
                "pattern '{}': no parseable roles, falling back to defaults",
                name
            );
            let count = default_participant_count(topology);
            roles = default_roles(name, topology, count);
        }

        let mut phases = parse_phases(source_text);
        if phases.is_empty() {
            phases = default_phases(topology);
        }

        let participant_count = roles.len();
        let pattern = Pattern {
            name: name.to_string(),
            topology,
            participant_count,
            roles,
            phases,
            vocabulary: parse_vocabulary(source_text),
        };
        self.register(pattern);
        self.resolve(name).expect("pattern registered above")
    }
}

fn builtin_shape(name: &str) -> (Topology, usize) {
    match name {
        "solo" => (Topology::Solo, 1),
        "mirror" => (Topology::Duet, 2),
        "roundtable" => (Topology::Group, 3),
        "pyramid" => (Topology::Hierarchical, 4),
        _ => (Topology::Solo, 1),
    }
}

fn default_participant_count(topology: Topology) -> usize {
    match topology {
        Topology::Solo => 1,
        Topology::Duet => 2,
        Topology::Group => 3,
        Topology::Hierarchical => 4,
    }
}

/// Hard-coded default role sets, the last link of the fallback chain.
///
/// Keyed by pattern name where a purpose-built set exists, otherwise shaped by
/// topology alone.
pub fn default_roles(name: &str, topology: Topology, count: usize) -> Vec<RoleTemplate> {
    match name {
        "mirror" => vec![
            RoleTemplate::new("observer", "Independently analyze the target and report findings")
                .with_disposition("Methodical and literal")
                .with_responsibility("Analyze the target from first principles")
                .with_responsibility("Share every finding as a RESULT message"),
            RoleTemplate::new("reflector", "Re-derive the observer's findings and flag mismatches")
                .with_disposition("Skeptical and precise")
                .with_responsibility("Verify the counterpart's findings independently")
                .with_responsibility("Raise DISCREPANCY messages for any mismatch"),
        ],
        "pyramid" => {
            let mut roles = vec![RoleTemplate::new(
                "coordinator",
                "Decompose the objective, assign aspects, synthesize worker output",
            )
            .with_disposition("Decisive and terse")
            .with_responsibility("Break the objective into independent aspects")
            .with_responsibility("Synthesize worker results each round")
            .with_responsibility("Signal COMPLETE when the synthesis is final")];
            for i in 1..count {
                roles.push(
                    RoleTemplate::new(
                        format!("worker-{}", i),
                        "Work one assigned aspect and report partial results",
                    )
                    .with_disposition("Focused and thorough")
                    .with_responsibility("Report results to the coordinator each round"),
                );
            }
            roles
        }
        _ => default_roles_for_topology(topology, count),
    }
}

fn default_roles_for_topology(topology: Topology, count: usize) -> Vec<RoleTemplate> {
    match topology {
        Topology::Solo => vec![RoleTemplate::new(
            "operator",
            "Carry the objective through to completion alone",
        )
        .with_disposition("Self-directed")
        .with_responsibility("Signal COMPLETE when nothing remains to do")],
        Topology::Duet => vec![
            RoleTemplate::new("partner-a", "Drive the objective forward")
                .with_disposition("Proactive"),
            RoleTemplate::new("partner-b", "Check and extend the counterpart's work")
                .with_disposition("Critical"),
        ],
        Topology::Group => (0..count)
            .map(|i| {
                RoleTemplate::new(
                    format!("member-{}", i),
                    "Contribute one perspective per round and build on the others",
                )
                .with_disposition("Collegial")
            })
            .collect(),
        Topology::Hierarchical => default_roles("pyramid", topology, count),
    }
}

fn default_phases(topology: Topology) -> Vec<WorkflowPhase> {
    match topology {
        Topology::Solo => vec![
            WorkflowPhase::new("work", "Iterate on the objective until it is done"),
            WorkflowPhase::new("wrap-up", "Summarize the outcome and signal completion"),
        ],
        Topology::Hierarchical => vec![
            WorkflowPhase::new("decompose", "Coordinator splits the objective into aspects"),
            WorkflowPhase::new("execute", "Workers produce partial results in parallel"),
            WorkflowPhase::new("synthesize", "Coordinator merges partial results"),
        ],
        _ => vec![
            WorkflowPhase::new("initialize", "Establish your role and signal readiness"),
            WorkflowPhase::new("collaborate", "Exchange results and resolve discrepancies"),
            WorkflowPhase::new("converge", "Reach consensus and signal completion"),
        ],
    }
}

/// Parse a markdown role table.
///
/// Recognizes rows of the form `| name | mandate | disposition | resp; resp |`
/// under a header row containing a `Role` column. Returns an empty vec when no
/// such table exists.
pub fn parse_role_table(text: &str) -> Vec<RoleTemplate> {
    let mut roles = Vec::new();
    let mut in_table = false;
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with('|') {
            in_table = false;
            continue;
        }
        let cells: Vec<&str> = line
            .trim_matches('|')
            .split('|')
            .map(|c| c.trim())
            .collect();
        if cells.is_empty() {
            continue;
        }
        if cells[0].eq_ignore_ascii_case("role") || cells[0].eq_ignore_ascii_case("name") {
            in_table = true;
            continue;
        }
        // separator row like |---|---|
        if cells.iter().all(|c| c.chars().all(|ch| ch == '-' || ch == ':')) {
            continue;
        }
        if in_table && !cells[0].is_empty() {
            let mut role = RoleTemplate::new(
                cells[0].to_lowercase().replace(' ', "-"),
                cells.get(1).copied().unwrap_or("").to_string(),
            );
            if let Some(disposition) = cells.get(2) {
                role = role.with_disposition(*disposition);
            }
            if let Some(responsibilities) = cells.get(3) {
                for resp in responsibilities.split(';') {
                    let resp = resp.trim();
                    if !resp.is_empty() {
                        role = role.with_responsibility(resp);
                    }
                }
            }
            roles.push(role);
        }
    }
    roles
}

/// Parse `###`-headed role subsections.
///
/// Each `### Some Role` heading starts a role; `**Mandate:**`,
/// `**Disposition:**` lines and `-` bullets under the heading fill it in.
pub fn parse_role_sections(text: &str) -> Vec<RoleTemplate> {
    let mut roles: Vec<RoleTemplate> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(heading) = line.strip_prefix("### ") {
            roles.push(RoleTemplate::new(
                heading.trim().to_lowercase().replace(' ', "-"),
                String::new(),
            ));
        } else if let Some(current) = roles.last_mut() {
            if let Some(mandate) = strip_field(line, "Mandate") {
                current.mandate = mandate;
            } else if let Some(disposition) = strip_field(line, "Disposition") {
                current.disposition = disposition;
            } else if let Some(bullet) = line.strip_prefix("- ") {
                current.responsibilities.push(bullet.trim().to_string());
            }
        }
    }
    // A heading with no mandate is prose, not a role definition.
    roles.retain(|r| !r.mandate.is_empty());
    roles
}

fn strip_field(line: &str, field: &str) -> Option<String> {
    let bold = format!("**{}:**", field);
    let plain = format!("{}:", field);
    let rest = line
        .strip_prefix(bold.as_str())
        .or_else(|| line.strip_prefix(plain.as_str()))?;
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Parse `## Phase: name` sections; the text until the next heading becomes
/// the phase guidance.
pub fn parse_phases(text: &str) -> Vec<WorkflowPhase> {
    let mut phases: Vec<WorkflowPhase> = Vec::new();
    let mut collecting = false;
    for line in text.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("## Phase:") {
            phases.push(WorkflowPhase::new(name.trim(), String::new()));
            collecting = true;
        } else if line.starts_with('#') {
            // any other heading ends the current phase body
            collecting = false;
        } else if collecting && !line.is_empty() {
            if let Some(current) = phases.last_mut() {
                if !current.guidance.is_empty() {
                    current.guidance.push(' ');
                }
                current.guidance.push_str(line);
            }
        }
    }
    phases
}

/// Parse a `Vocabulary:` or `Message types:` line listing `UPPER_SNAKE` types.
pub fn parse_vocabulary(text: &str) -> Vec<String> {
    for line in text.lines() {
        let line = line.trim();
        let rest = match line
            .strip_prefix("Vocabulary:")
            .or_else(|| line.strip_prefix("Message types:"))
        {
            Some(rest) => rest,
            None => continue,
        };
        return rest
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(|t| t.trim())
            .filter(|t| {
                !t.is_empty() && t.chars().all(|c| c.is_ascii_uppercase() || c == '_')
            })
            .map(|t| t.to_string())
            .collect();
    }
    Vec::new()
}
