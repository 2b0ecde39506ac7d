//! Resume from a checkpoint.
//!
//! Rebuilds the execution state recorded by a [`Checkpoint`] and decides
//! where traversal re-enters the graph. The checkpoint does not carry
//! per-node outcomes; completed nodes are restored as successes, which is
//! what a checkpoint taken after a non-failing node implies.

use std::collections::HashMap;

use waypoint_types::{
    Checkpoint, Context, FidelityMode, Outcome, Result, StageStatus, WaypointError,
};

use crate::condition::resolver_for;
use crate::edge_selection::select_edge;
use crate::graph::{PipelineEdge, PipelineGraph, PipelineNode};

/// The context key carrying the resume-time fidelity preamble. The
/// codergen handler forwards it to its backend; the engine removes it
/// after the first resumed node completes.
pub const FIDELITY_PREAMBLE_KEY: &str = "_fidelity_preamble";

/// Text written under [`FIDELITY_PREAMBLE_KEY`].
pub const FIDELITY_PREAMBLE: &str = "Conversation history was not preserved across resume; \
continue from prior summaries at fidelity summary:high.";

/// Execution state restored from a checkpoint.
#[derive(Debug)]
pub struct ResumeState {
    pub context: Context,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: HashMap<String, Outcome>,
    pub node_retries: HashMap<String, usize>,
    /// The node traversal re-enters at: the target of the edge selected
    /// out of the checkpoint's `current_node`.
    pub entry_node: String,
    /// Whether the first resumed node runs with the fidelity preamble.
    pub degraded: bool,
}

/// Build a [`ResumeState`] from a loaded checkpoint.
pub async fn resume_state(checkpoint: Checkpoint, graph: &PipelineGraph) -> Result<ResumeState> {
    let current = &checkpoint.current_node;
    if graph.node(current).is_none() {
        return Err(WaypointError::RoutingError(format!(
            "checkpoint node '{current}' does not exist in the graph"
        )));
    }

    let context = Context::from_parts(checkpoint.context_values.clone(), checkpoint.logs.clone());

    // Completed nodes restore as successes; the checkpoint was written
    // after each of them finished.
    let node_outcomes: HashMap<String, Outcome> = checkpoint
        .completed_nodes
        .iter()
        .map(|id| (id.clone(), Outcome::success("restored from checkpoint")))
        .collect();

    // Re-select the edge out of the checkpointed node using the outcome
    // it recorded into context.
    let snapshot = context.snapshot().await;
    let recorded = synthesized_outcome(&snapshot);
    let resolve = resolver_for(&recorded, &snapshot);
    let Some(edge) = select_edge(current, &recorded, &resolve, graph) else {
        return Err(WaypointError::RoutingError(format!(
            "cannot resume: no edge out of checkpoint node '{current}'"
        )));
    };
    let entry_node = edge.to.clone();

    // Fidelity degradation: when the hop into the checkpointed node ran
    // at full fidelity, the first resumed node must degrade because
    // in-memory agent sessions do not survive a checkpoint.
    let degraded = incoming_fidelity(&checkpoint, graph) == FidelityMode::Full;
    if degraded {
        context
            .set(
                FIDELITY_PREAMBLE_KEY,
                serde_json::Value::String(FIDELITY_PREAMBLE.to_string()),
            )
            .await;
    }

    tracing::info!(
        resume_from = %current,
        entry = %entry_node,
        degraded,
        "resuming from checkpoint"
    );

    Ok(ResumeState {
        context,
        completed_nodes: checkpoint.completed_nodes,
        node_outcomes,
        node_retries: checkpoint.node_retries,
        entry_node,
        degraded,
    })
}

/// Outcome the checkpointed node recorded into context (`outcome` and
/// `preferred_label` keys); defaults to success.
fn synthesized_outcome(snapshot: &HashMap<String, serde_json::Value>) -> Outcome {
    let status = snapshot
        .get("outcome")
        .and_then(|v| v.as_str())
        .and_then(StageStatus::parse)
        .unwrap_or(StageStatus::Success);
    let mut outcome = Outcome::success("checkpointed outcome");
    outcome.status = status;
    outcome.preferred_label = snapshot
        .get("preferred_label")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from);
    outcome
}

/// Effective fidelity of the hop that led into the checkpoint's node:
/// the traversed edge's `fidelity`, else the node's, else the graph's,
/// else `full`.
fn incoming_fidelity(checkpoint: &Checkpoint, graph: &PipelineGraph) -> FidelityMode {
    let current = &checkpoint.current_node;
    let incoming = graph.incoming_edges(current);

    // The predecessor is the entry before `current` in the completed
    // list, which disambiguates nodes with several incoming edges.
    let predecessor = checkpoint
        .completed_nodes
        .len()
        .checked_sub(2)
        .and_then(|i| checkpoint.completed_nodes.get(i));
    let traversed: Option<&&PipelineEdge> = predecessor
        .and_then(|pred| incoming.iter().find(|e| e.from == *pred))
        .or_else(|| incoming.first());

    let node = graph.node(current);
    resolve_fidelity(traversed.copied(), node, graph)
}

fn resolve_fidelity(
    edge: Option<&PipelineEdge>,
    node: Option<&PipelineNode>,
    graph: &PipelineGraph,
) -> FidelityMode {
    edge.and_then(|e| e.fidelity.as_deref())
        .or_else(|| node.and_then(|n| n.fidelity.as_deref()))
        .or_else(|| graph.attrs.get("fidelity").and_then(|v| v.as_str()))
        .and_then(FidelityMode::parse)
        .unwrap_or(FidelityMode::Full)
}
