//! Human gate handler: pauses the pipeline for a human decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use waypoint_types::{Outcome, Result, StageStatus, WaypointError};

use crate::edge_selection::normalize_label;
use crate::graph::{PipelineEdge, PipelineNode};
use crate::handler::{NodeHandler, RunContext};
use crate::interviewer::{Interviewer, Question};

pub struct WaitHumanHandler {
    interviewer: Option<Arc<dyn Interviewer>>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Option<Arc<dyn Interviewer>>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    fn handler_type(&self) -> &str {
        "wait.human"
    }

    async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        if run.cancel.is_cancelled() {
            return Err(WaypointError::Cancelled);
        }
        let Some(interviewer) = &self.interviewer else {
            return Ok(Outcome::fail(format!(
                "human gate '{}' has no interviewer configured",
                node.id
            )));
        };

        let edges = run.graph.outgoing_edges(&node.id);
        if edges.is_empty() {
            return Ok(Outcome::fail(format!(
                "human gate '{}' has no outgoing edges to choose from",
                node.id
            )));
        }

        // Options from edge labels, falling back to target ids.
        let options: Vec<String> = edges
            .iter()
            .map(|e| e.label.clone().unwrap_or_else(|| e.to.clone()))
            .collect();

        let question = Question {
            prompt: node
                .attr_str("question")
                .map(String::from)
                .unwrap_or_else(|| {
                    if node.label != node.id {
                        node.label.clone()
                    } else {
                        format!("Choose the next step after '{}'", node.id)
                    }
                }),
            options: options.clone(),
        };

        let started = Instant::now();
        let mut timed_out = false;

        let answer = match node.timeout {
            Some(deadline) => {
                tokio::select! {
                    answer = interviewer.ask(&question) => answer?,
                    _ = tokio::time::sleep(deadline) => {
                        // Per-call deadline elapsed: fall back to the
                        // default choice. Parent cancellation is handled
                        // below, not here.
                        timed_out = true;
                        node.attr_str("default_choice")
                            .map(String::from)
                            .unwrap_or_else(|| options[0].clone())
                    }
                    _ = run.cancel.cancelled() => return Err(WaypointError::Cancelled),
                }
            }
            None => {
                tokio::select! {
                    answer = interviewer.ask(&question) => answer?,
                    _ = run.cancel.cancelled() => return Err(WaypointError::Cancelled),
                }
            }
        };

        let response_time_ms = started.elapsed().as_millis() as u64;
        let matched = match_edge(edges, &answer);

        let mut updates = HashMap::new();
        updates.insert(
            "human.gate.selected".into(),
            serde_json::Value::String(answer.clone()),
        );
        updates.insert(
            "human.gate.label".into(),
            serde_json::Value::String(matched.label.clone().unwrap_or_else(|| matched.to.clone())),
        );
        updates.insert("human.timed_out".into(), serde_json::Value::Bool(timed_out));
        updates.insert(
            "human.response_time_ms".into(),
            serde_json::json!(response_time_ms),
        );

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: matched.label.clone(),
            suggested_next_ids: vec![matched.to.clone()],
            context_updates: updates,
            notes: format!("human selected '{answer}'"),
            failure_reason: None,
        })
    }
}

/// Resolve an answer to an edge: normalized label equality, then
/// accelerator-key equality, then the first edge.
fn match_edge<'a>(edges: &'a [PipelineEdge], answer: &str) -> &'a PipelineEdge {
    let normalized = normalize_label(answer);

    if let Some(edge) = edges.iter().find(|e| {
        let candidate = e.label.clone().unwrap_or_else(|| e.to.clone());
        normalize_label(&candidate) == normalized
    }) {
        return edge;
    }

    // Accelerator key: a single-character answer matches the option whose
    // accelerator (or first character) equals it.
    let key = answer.trim().to_lowercase();
    if key.chars().count() == 1 {
        if let Some(edge) = edges.iter().find(|e| {
            let candidate = e.label.clone().unwrap_or_else(|| e.to.clone());
            accelerator_key(&candidate).as_deref() == Some(key.as_str())
        }) {
            return edge;
        }
    }

    &edges[0]
}

/// The accelerator key of a label: the bracketed/prefixed key when one
/// exists (`[Y] Yes`, `Y) Yes`, `Y - Yes`), otherwise its first character.
fn accelerator_key(label: &str) -> Option<String> {
    let trimmed = label.trim();
    let lowered = trimmed.to_lowercase();
    if let Some(rest) = lowered.strip_prefix('[') {
        let mut chars = rest.chars();
        let key = chars.next()?;
        if chars.next() == Some(']') {
            return Some(key.to_string());
        }
    }
    lowered.chars().next().map(|c| c.to_string())
}
