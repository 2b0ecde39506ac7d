//! Contracts for external collaborators: the codergen agent backend and
//! the supervision-loop manager backend. Concrete implementations live
//! outside this workspace.

use async_trait::async_trait;

use waypoint_types::{Context, Result};

use crate::events::EventCallback;
use crate::graph::PipelineNode;

/// Structured token accounting reported by an agent run.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Everything a codergen backend needs to run one agent task.
#[derive(Clone)]
pub struct AgentRunConfig {
    pub prompt: String,
    pub goal: String,
    pub node_id: String,
    pub workdir: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub system_prompt: Option<String>,
    pub max_turns: Option<usize>,
    /// The node/edge fidelity directive, passed through opaquely.
    pub fidelity: Option<String>,
    /// Set on the first node executed after a resume whose prior hop ran
    /// at full fidelity; the backend should prepend it to the
    /// conversation.
    pub fidelity_preamble: Option<String>,
    /// Callback for agent-stream events (`agent.tool_call.*`,
    /// `agent.llm_turn`, ...).
    pub events: Option<EventCallback>,
}

impl std::fmt::Debug for AgentRunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunConfig")
            .field("node_id", &self.node_id)
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("max_turns", &self.max_turns)
            .field("fidelity", &self.fidelity)
            .finish_non_exhaustive()
    }
}

/// Result of a completed agent run.
#[derive(Debug, Clone, Default)]
pub struct AgentRunResult {
    pub output: String,
    pub success: bool,
    pub tool_calls: usize,
    pub tokens_used: u64,
    pub token_usage: TokenUsage,
    pub tool_call_log: Vec<String>,
    pub turn_count: usize,
}

/// Backend that runs one LLM agent task per codergen node.
#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn run_agent(&self, config: AgentRunConfig) -> Result<AgentRunResult>;
}

/// Backend driving a supervision loop: observe a subordinate agent,
/// evaluate a guard, steer when the guard fails.
#[async_trait]
pub trait ManagerBackend: Send + Sync {
    /// Collect an observation of the supervised work.
    async fn observe(&self, node: &PipelineNode, context: &Context) -> Result<String>;

    /// Evaluate the guard condition against an observation. `true` means
    /// the loop is on track and no steering is needed.
    async fn guard(
        &self,
        observation: &str,
        guard_condition: Option<&str>,
        context: &Context,
    ) -> Result<bool>;

    /// Steer the supervised work back on track.
    async fn steer(
        &self,
        node: &PipelineNode,
        steer_prompt: Option<&str>,
        context: &Context,
    ) -> Result<()>;
}
