//! Codergen handler: delegates `box` nodes to an LLM agent backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use waypoint_types::{Outcome, Result, StageStatus, WaypointError};

use crate::backend::{AgentRunConfig, CodergenBackend};
use crate::graph::PipelineNode;
use crate::handler::{NodeHandler, RunContext};

pub struct CodergenHandler {
    backend: Option<Arc<dyn CodergenBackend>>,
}

impl CodergenHandler {
    pub fn new(backend: Option<Arc<dyn CodergenBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        if run.cancel.is_cancelled() {
            return Err(WaypointError::Cancelled);
        }

        let Some(backend) = &self.backend else {
            return Ok(Outcome::fail(format!(
                "codergen node '{}' has no agent backend configured",
                node.id
            )));
        };

        // Prompt falls back to the label, then the node id.
        let prompt = node
            .prompt
            .clone()
            .unwrap_or_else(|| if node.label != node.id {
                node.label.clone()
            } else {
                node.id.clone()
            });

        let goal = run.context.get_string("goal", "").await;
        let fidelity_preamble = run.context.get("_fidelity_preamble").await.and_then(|v| {
            v.as_str().map(String::from)
        });

        let config = AgentRunConfig {
            prompt,
            goal,
            node_id: node.id.clone(),
            workdir: node.workdir.clone(),
            model: node.llm_model.clone(),
            provider: node.llm_provider.clone(),
            base_url: node.base_url.clone(),
            system_prompt: node.attr_str("system_prompt").map(String::from),
            max_turns: node.max_turns,
            fidelity: node.fidelity.clone(),
            fidelity_preamble,
            events: run.emitter.callback(),
        };

        tracing::info!(node = %node.id, model = ?config.model, "running agent");

        let result = match backend.run_agent(config).await {
            Ok(result) => result,
            Err(err) => {
                return Ok(Outcome::fail(format!(
                    "agent backend error on '{}': {err}",
                    node.id
                )))
            }
        };

        run.artifacts
            .put(format!("{}.output", node.id), result.output.as_bytes())?;

        let mut updates = HashMap::new();
        updates.insert(
            "codergen.tool_calls".into(),
            serde_json::json!(result.tool_calls),
        );
        updates.insert(
            "codergen.tokens_used".into(),
            serde_json::json!(result.tokens_used),
        );
        updates.insert(
            "codergen.turn_count".into(),
            serde_json::json!(result.turn_count),
        );
        updates.insert(
            "codergen.input_tokens".into(),
            serde_json::json!(result.token_usage.input_tokens),
        );
        updates.insert(
            "codergen.output_tokens".into(),
            serde_json::json!(result.token_usage.output_tokens),
        );
        updates.insert(
            format!("{}.completed", node.id),
            serde_json::Value::Bool(true),
        );

        if !result.success {
            return Ok(Outcome {
                status: StageStatus::Fail,
                preferred_label: None,
                suggested_next_ids: Vec::new(),
                context_updates: updates,
                notes: result.output,
                failure_reason: Some(format!("agent reported failure on '{}'", node.id)),
            });
        }

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: updates,
            notes: result.output,
            failure_reason: None,
        })
    }
}
