//! Parallel region executor.
//!
//! Runs one branch chain per fan-out edge concurrently, each on a forked
//! context, bounded by a semaphore. After all branches finish the parent
//! context receives the merged branch state according to the join policy,
//! plus the `parallel.results` array and the `parallel.artifacts`
//! manifest. Branch chains stop at a fan-in or terminal node without
//! executing it; the engine then jumps to the discovered fan-in node.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use waypoint_types::{Outcome, Result, StageStatus, WaypointError};

use crate::condition::resolver_for;
use crate::edge_selection::select_edge;
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::{HandlerRegistry, RunContext};
use crate::retry::{execute_with_retry, RetryPolicy};

/// Default branch concurrency when `max_parallel` is unset.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Hard cap on nodes executed within a single branch chain.
const BRANCH_STEP_CAP: usize = 1000;

/// Join policy for a parallel region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    WaitAll,
    WaitAny,
    KOfN,
    Quorum,
}

impl JoinPolicy {
    fn parse(s: Option<&str>) -> Self {
        match s.map(str::trim) {
            Some("wait_any") => Self::WaitAny,
            Some("k_of_n") => Self::KOfN,
            Some("quorum") => Self::Quorum,
            _ => Self::WaitAll,
        }
    }
}

/// Error policy for a parallel region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Continue,
    FailFast,
}

impl ErrorPolicy {
    fn parse(s: Option<&str>) -> Self {
        match s.map(str::trim) {
            Some("fail_fast") => Self::FailFast,
            _ => Self::Continue,
        }
    }
}

/// Result of executing a whole parallel region.
#[derive(Debug)]
pub struct ParallelOutcome {
    /// Summary outcome for the region (merge already applied to the
    /// parent context).
    pub outcome: Outcome,
    /// The fan-in node branches converged on, when one exists.
    pub fan_in: Option<String>,
}

/// One finished branch chain.
struct BranchRun {
    target: String,
    status: StageStatus,
    notes: String,
    failure_reason: Option<String>,
    snapshot: HashMap<String, serde_json::Value>,
    fan_in: Option<String>,
}

/// Execute the parallel region rooted at `node` (a fan-out node).
pub fn run_parallel<'a>(
    node: &'a PipelineNode,
    run: &'a RunContext,
    registry: Arc<HandlerRegistry>,
) -> BoxFuture<'a, Result<ParallelOutcome>> {
    Box::pin(run_parallel_inner(node, run, registry))
}

async fn run_parallel_inner(
    node: &PipelineNode,
    run: &RunContext,
    registry: Arc<HandlerRegistry>,
) -> Result<ParallelOutcome> {
    let branch_targets: Vec<String> = run
        .graph
        .outgoing_edges(&node.id)
        .iter()
        .map(|e| e.to.clone())
        .collect();
    if branch_targets.is_empty() {
        return Err(WaypointError::HandlerError {
            handler: "parallel".into(),
            node: node.id.clone(),
            message: "no outgoing branches".into(),
        });
    }

    let join_policy = JoinPolicy::parse(node.attr_str("join_policy"));
    let error_policy = ErrorPolicy::parse(node.attr_str("error_policy"));
    let max_parallel = node
        .attr_int("max_parallel")
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_PARALLEL);

    let parent_snapshot = run.context.snapshot().await;

    // Branch cancellation: fail_fast cancels this child token on the
    // first failing branch; parent cancellation propagates through it.
    let branch_cancel = run.cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(max_parallel));

    let mut handles = Vec::with_capacity(branch_targets.len());
    for target in &branch_targets {
        let target = target.clone();
        let branch_context = run.context.fork().await;
        let branch_run = RunContext {
            context: branch_context,
            cancel: branch_cancel.clone(),
            ..run.clone()
        };
        let registry = Arc::clone(&registry);
        let semaphore = Arc::clone(&semaphore);
        let cancel_on_fail = if error_policy == ErrorPolicy::FailFast {
            Some(branch_cancel.clone())
        } else {
            None
        };

        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return BranchRun {
                    target: target.clone(),
                    status: StageStatus::Fail,
                    notes: String::new(),
                    failure_reason: Some("branch semaphore closed".into()),
                    snapshot: HashMap::new(),
                    fan_in: None,
                };
            };
            let result = run_branch_chain(&target, &branch_run, &registry).await;
            if result.status == StageStatus::Fail {
                if let Some(token) = cancel_on_fail {
                    tracing::warn!(branch = %target, "fail_fast: cancelling sibling branches");
                    token.cancel();
                }
            }
            result
        }));
    }

    let mut branches = Vec::with_capacity(handles.len());
    for (handle, target) in handles.into_iter().zip(&branch_targets) {
        match handle.await {
            Ok(branch) => branches.push(branch),
            Err(join_err) => branches.push(BranchRun {
                target: target.clone(),
                status: StageStatus::Fail,
                notes: String::new(),
                failure_reason: Some(format!("branch task panicked: {join_err}")),
                snapshot: HashMap::new(),
                fan_in: None,
            }),
        }
    }

    // The whole run was cancelled, not just a fail-fast sibling group.
    if run.cancel.is_cancelled() {
        return Err(WaypointError::Cancelled);
    }

    merge_branches(
        node,
        run,
        &parent_snapshot,
        branches,
        join_policy,
        error_policy,
    )
    .await
}

/// Execute a single branch chain starting at `start_id`.
///
/// Stops (without executing) at a fan-in or terminal node, on a failing
/// outcome, on a dead end, or at the hard step cap.
async fn run_branch_chain(
    start_id: &str,
    run: &RunContext,
    registry: &Arc<HandlerRegistry>,
) -> BranchRun {
    let mut current = start_id.to_string();
    let mut status = StageStatus::Success;
    let mut notes = String::new();
    let mut failure_reason = None;
    let mut fan_in = None;

    for step in 0.. {
        if step >= BRANCH_STEP_CAP {
            status = StageStatus::Fail;
            failure_reason = Some(format!("branch exceeded {BRANCH_STEP_CAP} steps"));
            break;
        }
        if run.cancel.is_cancelled() {
            status = StageStatus::Fail;
            failure_reason = Some("branch cancelled".into());
            break;
        }

        let Some(node) = run.graph.node(&current) else {
            status = StageStatus::Fail;
            failure_reason = Some(format!("branch reached unknown node '{current}'"));
            break;
        };

        let node_type = registry.resolve_type(node);
        if node_type == "parallel.fan_in" {
            fan_in = Some(current.clone());
            break;
        }
        if PipelineGraph::is_terminal(node) {
            break;
        }

        let outcome = if node_type == "parallel" {
            // Nested region: recurse and continue at its fan-in.
            match Box::pin(run_parallel(node, run, Arc::clone(registry))).await {
                Ok(nested) => {
                    if let Some(next) = nested.fan_in {
                        current = next;
                        continue;
                    }
                    // Nested branches all terminated; this branch is done.
                    status = nested.outcome.status;
                    notes = nested.outcome.notes;
                    break;
                }
                Err(err) => {
                    status = StageStatus::Fail;
                    failure_reason = Some(format!("nested parallel failed: {err}"));
                    break;
                }
            }
        } else {
            let Some(handler) = registry.get(&node_type) else {
                status = StageStatus::Fail;
                failure_reason = Some(format!("no handler registered for type '{node_type}'"));
                break;
            };
            let policy = RetryPolicy::for_node(node);
            let mut retries = 0usize;
            match execute_with_retry(handler, node, run, &policy, &mut retries).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    status = StageStatus::Fail;
                    failure_reason = Some("branch cancelled".into());
                    break;
                }
            }
        };

        run.context.apply_updates(outcome.context_updates.clone()).await;
        run.context
            .set(
                "outcome",
                serde_json::Value::String(outcome.status.as_str().to_string()),
            )
            .await;

        status = outcome.status;
        notes = outcome.notes.clone();
        failure_reason = outcome.failure_reason.clone();
        if status == StageStatus::Fail {
            break;
        }

        let snapshot = run.context.snapshot().await;
        let resolve = resolver_for(&outcome, &snapshot);
        match select_edge(&current, &outcome, &resolve, &run.graph) {
            Some(edge) => current = edge.to.clone(),
            None => break,
        }
    }

    BranchRun {
        target: start_id.to_string(),
        status,
        notes,
        failure_reason,
        snapshot: run.context.snapshot().await,
        fan_in,
    }
}

/// Apply the join policy and merge branch state into the parent context.
async fn merge_branches(
    node: &PipelineNode,
    run: &RunContext,
    parent_snapshot: &HashMap<String, serde_json::Value>,
    branches: Vec<BranchRun>,
    join_policy: JoinPolicy,
    error_policy: ErrorPolicy,
) -> Result<ParallelOutcome> {
    let total = branches.len();
    let successes = branches
        .iter()
        .filter(|b| b.status.is_success_like())
        .count();

    let required = match join_policy {
        JoinPolicy::WaitAll => total,
        JoinPolicy::WaitAny => 1,
        JoinPolicy::KOfN => {
            let from_context = run
                .context
                .get("parallel.k_required")
                .await
                .and_then(|v| v.as_u64())
                .map(|v| v as usize);
            from_context
                .or_else(|| {
                    node.attr_int("k_required")
                        .filter(|v| *v > 0)
                        .map(|v| v as usize)
                })
                .unwrap_or(total)
        }
        JoinPolicy::Quorum => total / 2 + 1,
    };

    if successes < required {
        return Err(WaypointError::HandlerError {
            handler: "parallel".into(),
            node: node.id.clone(),
            message: format!(
                "join policy {join_policy:?} unsatisfied: {successes} of {total} branches succeeded, {required} required"
            ),
        });
    }

    // Merge branch values last-write-wins in authored branch order. Under
    // wait_all every branch merged; otherwise only successful branches.
    let mut winners: HashMap<String, String> = HashMap::new();
    for branch in &branches {
        if join_policy != JoinPolicy::WaitAll && !branch.status.is_success_like() {
            continue;
        }
        for (key, value) in &branch.snapshot {
            if parent_snapshot.get(key) == Some(value) {
                continue; // unchanged from the fork point
            }
            if let Some(previous) = winners.get(key) {
                run.context
                    .append_log(format!(
                        "parallel merge conflict on '{key}': branch '{previous}' overwritten by branch '{}'",
                        branch.target
                    ))
                    .await;
            } else {
                run.context
                    .append_log(format!(
                        "parallel merge: '{key}' from branch '{}'",
                        branch.target
                    ))
                    .await;
            }
            winners.insert(key.clone(), branch.target.clone());
            run.context.set(key.clone(), value.clone()).await;
        }
    }

    // Artifact manifest: every branch contributes an entry listing the
    // values of its context keys that mention `artifact_id`.
    let mut manifest = serde_json::Map::new();
    for branch in &branches {
        let mut ids: Vec<String> = branch
            .snapshot
            .iter()
            .filter(|(key, _)| key.contains("artifact_id"))
            .map(|(_, value)| waypoint_types::coerce_to_string(value))
            .collect();
        ids.sort();
        manifest.insert(branch.target.clone(), serde_json::json!(ids));
    }
    run.context
        .set(
            "parallel.artifacts",
            serde_json::Value::Object(manifest),
        )
        .await;

    let results: Vec<serde_json::Value> = branches
        .iter()
        .map(|b| {
            serde_json::json!({
                "branch": b.target,
                "status": b.status.as_str(),
                "notes": b.notes,
                "failure_reason": b.failure_reason,
            })
        })
        .collect();
    run.context
        .set("parallel.results", serde_json::Value::Array(results))
        .await;

    let fan_in = branches.iter().find_map(|b| b.fan_in.clone());
    let failures = total - successes;
    let notes = match error_policy {
        ErrorPolicy::Continue if failures > 0 => {
            format!("{successes} of {total} branches succeeded ({failures} failures tolerated)")
        }
        _ => format!("{successes} of {total} branches succeeded"),
    };

    tracing::info!(node = %node.id, successes, total, ?join_policy, "parallel region merged");

    Ok(ParallelOutcome {
        outcome: Outcome::success(notes),
        fan_in,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::run_context_with_graph;
    use crate::handler::{default_registry, Collaborators, NodeHandler};
    use async_trait::async_trait;
    use serde_json::json;

    /// Test handler: applies attributes `set_key`/`set_value` to context,
    /// optionally fails when `branch_fail=true`, optionally sleeps.
    struct BranchProbeHandler;

    #[async_trait]
    impl NodeHandler for BranchProbeHandler {
        fn handler_type(&self) -> &str {
            "codergen"
        }

        async fn execute(
            &self,
            node: &PipelineNode,
            run: &RunContext,
        ) -> Result<Outcome> {
            if let Some(ms) = node.attr_int("sleep_ms") {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(ms as u64)) => {}
                    _ = run.cancel.cancelled() => return Err(WaypointError::Cancelled),
                }
            }
            if run.cancel.is_cancelled() {
                return Err(WaypointError::Cancelled);
            }
            if node.attr_bool("branch_fail").unwrap_or(false) {
                return Ok(Outcome::fail(format!("{} failed", node.id)));
            }
            let mut outcome = Outcome::success(format!("{} ran", node.id));
            if let (Some(key), Some(value)) = (node.attr_str("set_key"), node.attr_str("set_value"))
            {
                outcome
                    .context_updates
                    .insert(key.to_string(), json!(value));
            }
            if let Some(artifact) = node.attr_str("artifact") {
                outcome.context_updates.insert(
                    format!("{}.artifact_id", node.id),
                    json!(artifact),
                );
            }
            Ok(outcome)
        }
    }

    fn registry() -> Arc<HandlerRegistry> {
        let mut reg = default_registry(&Collaborators::default());
        reg.register(BranchProbeHandler);
        Arc::new(reg)
    }

    fn parallel_graph(extra: &str) -> PipelineGraph {
        let dot = format!(
            r#"digraph G {{
                fork [shape="component"{extra}]
                b1 [set_key="k", set_value="x", artifact="art-1"]
                b2 [set_key="k", set_value="y", artifact="art-2"]
                join [shape="tripleoctagon"]
                fork -> b1
                fork -> b2
                b1 -> join
                b2 -> join
            }}"#
        );
        let parsed = waypoint_dot::parse(&dot).unwrap();
        PipelineGraph::from_parsed(parsed).unwrap()
    }

    #[tokio::test]
    async fn wait_all_merges_last_writer_wins_with_conflict_log() {
        let graph = parallel_graph("");
        let node = graph.node("fork").unwrap().clone();
        let run = run_context_with_graph(graph);

        let result = run_parallel(&node, &run, registry()).await.unwrap();
        assert_eq!(result.outcome.status, StageStatus::Success);
        assert_eq!(result.fan_in.as_deref(), Some("join"));

        // Last branch in authored order wins the conflict.
        assert_eq!(run.context.get("k").await, Some(json!("y")));

        let logs = run.context.logs().await;
        assert!(
            logs.iter().any(|l| l.contains("conflict")
                && l.contains("b1")
                && l.contains("b2")),
            "expected a conflict log naming both branches, got {logs:?}"
        );

        // Manifest has exactly one entry per branch.
        let manifest = run.context.get("parallel.artifacts").await.unwrap();
        let obj = manifest.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj.get("b1"), Some(&json!(["art-1"])));
        assert_eq!(obj.get("b2"), Some(&json!(["art-2"])));

        // Aggregated results in authored order.
        let results = run.context.get("parallel.results").await.unwrap();
        let arr = results.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["branch"], json!("b1"));
        assert_eq!(arr[1]["branch"], json!("b2"));
    }

    #[tokio::test]
    async fn wait_all_with_a_failed_branch_errors() {
        let dot = r#"digraph G {
            fork [shape="component"]
            ok_branch [set_key="a", set_value="1"]
            bad_branch [branch_fail=true]
            join [shape="tripleoctagon"]
            fork -> ok_branch
            fork -> bad_branch
            ok_branch -> join
            bad_branch -> join
        }"#;
        let parsed = waypoint_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        let node = graph.node("fork").unwrap().clone();
        let run = run_context_with_graph(graph);

        let err = run_parallel(&node, &run, registry()).await.unwrap_err();
        assert!(err.to_string().contains("unsatisfied"));
    }

    #[tokio::test]
    async fn wait_any_merges_only_successful_branches() {
        let dot = r#"digraph G {
            fork [shape="component", join_policy="wait_any"]
            good [set_key="from_good", set_value="yes"]
            bad [branch_fail=true, set_key="from_bad", set_value="no"]
            join [shape="tripleoctagon"]
            fork -> good
            fork -> bad
            good -> join
            bad -> join
        }"#;
        let parsed = waypoint_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        let node = graph.node("fork").unwrap().clone();
        let run = run_context_with_graph(graph);

        let result = run_parallel(&node, &run, registry()).await.unwrap();
        assert_eq!(result.outcome.status, StageStatus::Success);
        assert_eq!(run.context.get("from_good").await, Some(json!("yes")));
        // The failed branch's writes are not merged.
        assert_eq!(run.context.get("from_bad").await, None);
        // But it still has a manifest entry.
        let manifest = run.context.get("parallel.artifacts").await.unwrap();
        assert_eq!(manifest.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn k_of_n_reads_context_key_first() {
        let dot = r#"digraph G {
            fork [shape="component", join_policy="k_of_n", k_required=2]
            good [set_key="g", set_value="1"]
            bad [branch_fail=true]
            join [shape="tripleoctagon"]
            fork -> good
            fork -> bad
            good -> join
            bad -> join
        }"#;
        let parsed = waypoint_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        let node = graph.node("fork").unwrap().clone();

        // Context says 1 required, overriding the node's k_required=2.
        let run = run_context_with_graph(graph);
        run.context.set("parallel.k_required", json!(1)).await;
        assert!(run_parallel(&node, &run, registry()).await.is_ok());
    }

    #[tokio::test]
    async fn k_of_n_falls_back_to_node_attr() {
        let dot = r#"digraph G {
            fork [shape="component", join_policy="k_of_n", k_required=2]
            good [set_key="g", set_value="1"]
            bad [branch_fail=true]
            join [shape="tripleoctagon"]
            fork -> good
            fork -> bad
            good -> join
            bad -> join
        }"#;
        let parsed = waypoint_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        let node = graph.node("fork").unwrap().clone();
        let run = run_context_with_graph(graph);

        let err = run_parallel(&node, &run, registry()).await.unwrap_err();
        assert!(err.to_string().contains("2 required"));
    }

    #[tokio::test]
    async fn quorum_requires_strict_majority() {
        let dot = r#"digraph G {
            fork [shape="component", join_policy="quorum"]
            a [set_key="a", set_value="1"]
            b [branch_fail=true]
            c [branch_fail=true]
            join [shape="tripleoctagon"]
            fork -> a
            fork -> b
            fork -> c
            a -> join
            b -> join
            c -> join
        }"#;
        let parsed = waypoint_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        let node = graph.node("fork").unwrap().clone();
        let run = run_context_with_graph(graph);

        // 1 of 3 succeeded; quorum needs 2.
        let err = run_parallel(&node, &run, registry()).await.unwrap_err();
        assert!(err.to_string().contains("unsatisfied"));
    }

    #[tokio::test]
    async fn branch_chains_execute_multiple_nodes() {
        let dot = r#"digraph G {
            fork [shape="component"]
            step_one [set_key="one", set_value="ran"]
            step_two [set_key="two", set_value="ran"]
            other [set_key="other", set_value="ran"]
            join [shape="tripleoctagon"]
            fork -> step_one
            fork -> other
            step_one -> step_two
            step_two -> join
            other -> join
        }"#;
        let parsed = waypoint_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        let node = graph.node("fork").unwrap().clone();
        let run = run_context_with_graph(graph);

        let result = run_parallel(&node, &run, registry()).await.unwrap();
        assert_eq!(result.fan_in.as_deref(), Some("join"));
        assert_eq!(run.context.get("one").await, Some(json!("ran")));
        assert_eq!(run.context.get("two").await, Some(json!("ran")));
        assert_eq!(run.context.get("other").await, Some(json!("ran")));
    }

    #[tokio::test]
    async fn fail_fast_cancels_slow_siblings() {
        let dot = r#"digraph G {
            fork [shape="component", join_policy="wait_any", error_policy="fail_fast"]
            quick_fail [branch_fail=true]
            slow [sleep_ms=30000, set_key="slow", set_value="done"]
            join [shape="tripleoctagon"]
            fork -> quick_fail
            fork -> slow
            quick_fail -> join
            slow -> join
        }"#;
        let parsed = waypoint_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        let node = graph.node("fork").unwrap().clone();
        let run = run_context_with_graph(graph);

        // wait_any with zero successes: the join policy is unsatisfied,
        // but crucially this returns quickly because the slow branch is
        // cancelled rather than slept to completion.
        let started = std::time::Instant::now();
        let err = run_parallel(&node, &run, registry()).await.unwrap_err();
        assert!(err.to_string().contains("unsatisfied"));
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "fail_fast should not wait for the slow branch"
        );
    }

    #[tokio::test]
    async fn branch_isolation_prevents_cross_branch_races() {
        // Both branches read-modify-write the same parent key; with forked
        // contexts each sees the parent value, not the sibling's write.
        let graph = parallel_graph("");
        let node = graph.node("fork").unwrap().clone();
        let run = run_context_with_graph(graph);
        run.context.set("k", json!("parent")).await;

        run_parallel(&node, &run, registry()).await.unwrap();
        // Last-writer-wins resolved deterministically by authored order.
        assert_eq!(run.context.get("k").await, Some(json!("y")));
    }
}
