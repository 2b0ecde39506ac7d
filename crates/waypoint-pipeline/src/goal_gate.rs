//! Goal gates: nodes whose success is required before the run may finish.
//!
//! The engine runs the check when it reaches a terminal node, after
//! executing it. Any completed `goal_gate=true` node whose last outcome is
//! not success-like fails the gate; a valid `retry_target` re-enters the
//! graph there, otherwise the run errors out.

use std::collections::HashMap;

use waypoint_types::{Outcome, Result, WaypointError};

use crate::graph::PipelineGraph;

/// Result of scanning all completed goal-gate nodes.
#[derive(Debug)]
pub struct GoalGateResult {
    pub all_satisfied: bool,
    pub failed_node_id: Option<String>,
    pub retry_target: Option<String>,
}

/// Scan completed nodes for unsatisfied goal gates.
///
/// `completed` lists node ids in completion order; `node_outcomes` holds
/// the last outcome per node. Only nodes that actually ran are checked.
pub fn check_goal_gates(
    graph: &PipelineGraph,
    completed: &[String],
    node_outcomes: &HashMap<String, Outcome>,
) -> GoalGateResult {
    for node_id in completed {
        let Some(node) = graph.node(node_id) else {
            continue;
        };
        if !node.goal_gate {
            continue;
        }
        let satisfied = node_outcomes
            .get(node_id)
            .map(|o| o.status.is_success_like())
            .unwrap_or(false);
        if !satisfied {
            let retry_target = node
                .retry_target
                .clone()
                .filter(|target| graph.node(target).is_some());
            return GoalGateResult {
                all_satisfied: false,
                failed_node_id: Some(node_id.clone()),
                retry_target,
            };
        }
    }
    GoalGateResult {
        all_satisfied: true,
        failed_node_id: None,
        retry_target: None,
    }
}

/// As [`check_goal_gates`], but an unsatisfied gate without a usable
/// retry target is an error.
pub fn enforce_goal_gates(
    graph: &PipelineGraph,
    completed: &[String],
    node_outcomes: &HashMap<String, Outcome>,
) -> Result<GoalGateResult> {
    let result = check_goal_gates(graph, completed, node_outcomes);
    if !result.all_satisfied && result.retry_target.is_none() {
        return Err(WaypointError::GoalGateUnsatisfied {
            node: result.failed_node_id.unwrap_or_default(),
        });
    }
    Ok(result)
}
