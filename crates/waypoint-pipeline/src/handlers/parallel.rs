//! Fan-out and fan-in handlers bracketing a parallel region.
//!
//! The fan-out handler is an observable signal: it records the region's
//! policies and branch list in context. Actual branch execution lives in
//! [`crate::parallel`], which the engine invokes when it sees a node
//! resolve to the `parallel` type.

use std::collections::HashMap;

use async_trait::async_trait;

use waypoint_types::{Outcome, Result, StageStatus, WaypointError};

use crate::graph::PipelineNode;
use crate::handler::{NodeHandler, RunContext};

/// Fan-out: `component` nodes.
pub struct FanOutHandler;

#[async_trait]
impl NodeHandler for FanOutHandler {
    fn handler_type(&self) -> &str {
        "parallel"
    }

    async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        if run.cancel.is_cancelled() {
            return Err(WaypointError::Cancelled);
        }

        let branches: Vec<String> = run
            .graph
            .outgoing_edges(&node.id)
            .iter()
            .map(|e| e.to.clone())
            .collect();
        if branches.is_empty() {
            return Ok(Outcome::fail(format!(
                "parallel node '{}' has no outgoing branches",
                node.id
            )));
        }

        tracing::info!(node = %node.id, count = branches.len(), "parallel fan-out");

        let count = branches.len();
        let mut updates = HashMap::new();
        updates.insert("parallel.branches".into(), serde_json::json!(branches));
        updates.insert(
            "parallel.join_policy".into(),
            serde_json::json!(node.attr_str("join_policy").unwrap_or("wait_all")),
        );
        updates.insert(
            "parallel.error_policy".into(),
            serde_json::json!(node.attr_str("error_policy").unwrap_or("continue")),
        );
        updates.insert(
            "parallel.max_parallel".into(),
            serde_json::json!(node.attr_int("max_parallel").unwrap_or(4)),
        );

        // Routing after a fan-out belongs to the parallel executor, not
        // edge selection; the branch list is observable via context only.
        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: updates,
            notes: format!("fan-out to {count} branches"),
            failure_reason: None,
        })
    }
}

/// Fan-in: `tripleoctagon` nodes. A no-op gate that succeeds only when
/// the merged `parallel.results` are present in context.
pub struct FanInHandler;

#[async_trait]
impl NodeHandler for FanInHandler {
    fn handler_type(&self) -> &str {
        "parallel.fan_in"
    }

    async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        if run.cancel.is_cancelled() {
            return Err(WaypointError::Cancelled);
        }
        if run.context.get("parallel.results").await.is_none() {
            return Ok(Outcome::fail(format!(
                "fan-in '{}' reached without parallel results in context",
                node.id
            )));
        }
        Ok(Outcome::success("parallel branches joined"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PipelineGraph;
    use crate::handler::test_support::{node_with_shape, run_context, run_context_with_graph};

    #[tokio::test]
    async fn fan_out_records_branches_and_policies() {
        let dot = r#"digraph G {
            fork [shape="component", join_policy="wait_any", error_policy="fail_fast", max_parallel=2]
            fork -> b1
            fork -> b2
        }"#;
        let parsed = waypoint_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        let node = graph.node("fork").unwrap().clone();
        let run = run_context_with_graph(graph);

        let outcome = FanOutHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome.context_updates.get("parallel.branches"),
            Some(&serde_json::json!(["b1", "b2"]))
        );
        assert_eq!(
            outcome.context_updates.get("parallel.join_policy"),
            Some(&serde_json::json!("wait_any"))
        );
        assert_eq!(
            outcome.context_updates.get("parallel.error_policy"),
            Some(&serde_json::json!("fail_fast"))
        );
        assert_eq!(
            outcome.context_updates.get("parallel.max_parallel"),
            Some(&serde_json::json!(2))
        );
    }

    #[tokio::test]
    async fn fan_out_without_branches_fails() {
        let dot = r#"digraph G { lonely [shape="component"] }"#;
        let parsed = waypoint_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        let node = graph.node("lonely").unwrap().clone();
        let run = run_context_with_graph(graph);

        let outcome = FanOutHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test]
    async fn fan_in_requires_parallel_results() {
        let run = run_context().await;
        let node = node_with_shape("join", "tripleoctagon");

        let outcome = FanInHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);

        run.context
            .set("parallel.results", serde_json::json!([]))
            .await;
        let outcome = FanInHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
    }
}
