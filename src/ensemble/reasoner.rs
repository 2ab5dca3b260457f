use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// A ReasoningClient is the seam between the orchestration core and whatever
/// actually produces agent reasoning (a remote LLM, a local model, a scripted
/// mock in tests). It is deliberately opaque: the core hands it a conversation
/// plus a tool catalog and gets back a narrative and zero or more tool
/// requests. The core never interprets *how* the reply was produced, only
/// *what* it asks for next.
// src/ensemble/reasoner.rs

/// Represents the possible roles for a conversation entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    // set by the core to frame the actor's mandate
    User,
    // input the orchestrator feeds the actor each turn
    Assistant,
    // the actor's own prior narrative
    Tool, // a tool outcome replayed into the conversation
}

/// One entry in an actor's running conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationEntry {
    /// The role associated with the entry.
    pub role: Role,
    /// The actual content of the entry.
    pub content: String,
}

impl ConversationEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Description of a single callable tool offered to the reasoning primitive.
///
/// `parameters` is a free-form JSON schema fragment; the core never validates
/// it, it is forwarded verbatim so the primitive knows how to shape its
/// requests. `side_effecting` marks tools (fund transfers, contract writes)
/// that a session may exclude from its catalog entirely via
/// [`SessionConfig::allow_side_effects`](crate::session::SessionConfig).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Name the primitive uses to request this tool.
    pub name: String,
    /// One-line description embedded in the catalog shown to the primitive.
    pub description: String,
    /// JSON schema fragment describing the expected input.
    pub parameters: serde_json::Value,
    /// Whether invoking this tool mutates external state.
    pub side_effecting: bool,
}

impl ToolSpec {
    /// Create a side-effect-free tool spec with an empty parameter schema.
    ///
    /// # Examples
    ///
    /// ```
    /// use ensemble::reasoner::ToolSpec;
    ///
    /// let spec = ToolSpec::new("list_agents", "List the session roster");
    /// assert!(!spec.side_effecting);
    /// ```
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({}),
            side_effecting: false,
        }
    }

    /// Attach a JSON schema fragment describing the tool's input (builder pattern).
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Mark this tool as side-effecting (builder pattern).
    pub fn side_effecting(mut self) -> Self {
        self.side_effecting = true;
        self
    }
}

/// A tool invocation requested by the reasoning primitive during a turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Identifier correlating this request with its [`ToolOutcome`].
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// Opaque JSON input forwarded to the tool handler.
    pub input: serde_json::Value,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            input,
        }
    }
}

/// The result of executing (or refusing to execute) one [`ToolRequest`].
///
/// Errors are data, not exceptions: a failed dispatch produces an outcome with
/// `is_error: true` that is replayed into the actor's conversation so its
/// reasoning can react, retry, or give up on its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// The `id` of the request this outcome answers.
    pub request_id: String,
    /// Name of the tool that was dispatched.
    pub tool_name: String,
    /// Result payload (or a human-readable error description when `is_error`).
    pub result: serde_json::Value,
    /// Whether the dispatch failed.
    pub is_error: bool,
}

impl ToolOutcome {
    /// Build a successful outcome for the given request.
    pub fn success(request: &ToolRequest, result: serde_json::Value) -> Self {
        Self {
            request_id: request.id.clone(),
            tool_name: request.name.clone(),
            result,
            is_error: false,
        }
    }

    /// Build a failed outcome carrying an error description.
    pub fn failure(request: &ToolRequest, error: impl Into<String>) -> Self {
        Self {
            request_id: request.id.clone(),
            tool_name: request.name.clone(),
            result: serde_json::Value::String(error.into()),
            is_error: true,
        }
    }
}

/// Everything the reasoning primitive needs for one invocation.
#[derive(Clone, Debug)]
pub struct ReasoningRequest {
    /// The actor's immutable instruction preamble.
    pub system_prompt: String,
    /// The running conversation, oldest first.
    pub conversation: Vec<ConversationEntry>,
    /// Catalog of tools the primitive may request.
    pub tools: Vec<ToolSpec>,
}

/// One invocation's output: narrative text, any tool requests, and cost.
#[derive(Clone, Debug)]
pub struct ReasoningReply {
    /// The narrative portion of the reply. When `tool_requests` is empty this
    /// is the turn's final response.
    pub narrative: String,
    /// Tool invocations the primitive wants executed before it continues.
    pub tool_requests: Vec<ToolRequest>,
    /// Reasoning units consumed by this invocation, accumulated into the
    /// owning actor's usage counter.
    pub units_used: usize,
}

/// Trait defining the interface to the underlying reasoning primitive.
///
/// Implementations are injected into the [`Orchestrator`](crate::orchestrator::Orchestrator)
/// and shared by every actor it spawns. The contract is fixed: the primitive is
/// non-deterministic, the coordination around it is not.
///
/// ```rust
/// use async_trait::async_trait;
/// use ensemble::reasoner::{ReasoningClient, ReasoningReply, ReasoningRequest};
/// use std::error::Error;
///
/// struct Scripted;
///
/// #[async_trait]
/// impl ReasoningClient for Scripted {
///     async fn reason(
///         &self,
///         _request: ReasoningRequest,
///     ) -> Result<ReasoningReply, Box<dyn Error + Send + Sync>> {
///         Ok(ReasoningReply {
///             narrative: "collaboration complete".into(),
///             tool_requests: vec![],
///             units_used: 1,
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Run one invocation of the primitive.
    ///
    /// A returned error is a turn-execution fault: it propagates out of the
    /// topology loop and terminates the owning session with `Error` status.
    async fn reason(
        &self,
        request: ReasoningRequest,
    ) -> Result<ReasoningReply, Box<dyn Error + Send + Sync>>;
}
