//! Supervision loop handler for `house` nodes.
//!
//! Repeatedly observes a subordinate agent, evaluates a guard, and steers
//! when the guard fails. Without a backend the handler records its
//! configuration and succeeds as a stub.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use waypoint_types::{Outcome, Result, StageStatus, WaypointError};

use crate::backend::ManagerBackend;
use crate::graph::PipelineNode;
use crate::handler::{NodeHandler, RunContext};

pub struct ManagerLoopHandler {
    backend: Option<Arc<dyn ManagerBackend>>,
}

impl ManagerLoopHandler {
    pub fn new(backend: Option<Arc<dyn ManagerBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for ManagerLoopHandler {
    fn handler_type(&self) -> &str {
        "stack.manager_loop"
    }

    async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        if run.cancel.is_cancelled() {
            return Err(WaypointError::Cancelled);
        }

        let guard_condition = node.attr_str("guard_condition").map(String::from);
        let steer_prompt = node.attr_str("steer_prompt").map(String::from);

        let Some(backend) = &self.backend else {
            // Stub mode: record the configuration and succeed.
            let mut outcome = Outcome::success(format!(
                "manager loop '{}' has no backend; recorded configuration",
                node.id
            ));
            outcome.context_updates.insert(
                "manager.max_iterations".into(),
                serde_json::json!(node.max_iterations),
            );
            if let Some(g) = guard_condition {
                outcome
                    .context_updates
                    .insert("manager.guard_condition".into(), serde_json::json!(g));
            }
            if let Some(s) = steer_prompt {
                outcome
                    .context_updates
                    .insert("manager.steer_prompt".into(), serde_json::json!(s));
            }
            if let Some(p) = node.attr_str("sub_pipeline") {
                outcome
                    .context_updates
                    .insert("manager.sub_pipeline".into(), serde_json::json!(p));
            }
            return Ok(outcome);
        };

        let mut iterations = 0usize;
        let mut steers = 0usize;
        let mut last_observation = String::new();

        for iteration in 1..=node.max_iterations {
            if run.cancel.is_cancelled() {
                return Err(WaypointError::Cancelled);
            }

            last_observation = match backend.observe(node, &run.context).await {
                Ok(obs) => obs,
                Err(err) => {
                    return Ok(Outcome::fail(format!(
                        "manager observe failed on iteration {iteration}: {err}"
                    )))
                }
            };

            let on_track = match backend
                .guard(&last_observation, guard_condition.as_deref(), &run.context)
                .await
            {
                Ok(v) => v,
                Err(err) => {
                    return Ok(Outcome::fail(format!(
                        "manager guard failed on iteration {iteration}: {err}"
                    )))
                }
            };

            if !on_track {
                if let Err(err) = backend
                    .steer(node, steer_prompt.as_deref(), &run.context)
                    .await
                {
                    return Ok(Outcome::fail(format!(
                        "manager steer failed on iteration {iteration}: {err}"
                    )));
                }
                steers += 1;
            }

            iterations = iteration;
        }

        tracing::info!(node = %node.id, iterations, steers, "manager loop finished");

        let mut updates = HashMap::new();
        updates.insert("manager.iterations".into(), serde_json::json!(iterations));
        updates.insert("manager.steers".into(), serde_json::json!(steers));
        updates.insert(
            "manager.last_observation".into(),
            serde_json::Value::String(last_observation),
        );

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: updates,
            notes: format!("{iterations} iterations, {steers} steers"),
            failure_reason: None,
        })
    }
}
