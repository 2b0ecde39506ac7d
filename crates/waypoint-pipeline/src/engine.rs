//! The engine driver: phase orchestration and the traversal loop.
//!
//! Phases: parse (via [`PipelineExecutor::run_source`]), transform +
//! validate, initialize (context, artifact store, registry), execute,
//! finalize (terminal events). Traversal executes one node at a time,
//! applies retry policy, persists checkpoints, delegates parallel regions,
//! enforces goal gates at terminals, and honors `loop_restart` edges.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use waypoint_types::{
    ArtifactStore, Checkpoint, Context, Outcome, Result, StageStatus, WaypointError,
};

use crate::checkpoint::save_checkpoint;
use crate::condition::resolver_for;
use crate::edge_selection::select_edge;
use crate::events::{EventCallback, EventEmitter, PipelineEvent};
use crate::goal_gate::check_goal_gates;
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::{default_registry, Collaborators, HandlerRegistry, RunContext};
use crate::parallel::run_parallel;
use crate::resume::{resume_state, ResumeState, FIDELITY_PREAMBLE_KEY};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::transforms::apply_transforms;
use crate::validation::validate_or_error;

/// Hard cap on traversal iterations, protecting against cycles without
/// `loop_restart`.
const MAX_ITERATIONS: usize = 10_000;

// ---------------------------------------------------------------------------
// Configuration and results
// ---------------------------------------------------------------------------

/// Configuration for a pipeline run.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory for checkpoint files; `None` disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
    /// Directory backing the artifact store; `None` uses a fresh shared
    /// temporary directory recorded under `_workdir`.
    pub artifact_dir: Option<PathBuf>,
    /// Cap on `loop_restart` edges taken in one run.
    pub max_restarts: usize,
    /// Subscriber for lifecycle events.
    pub events: Option<EventCallback>,
    /// Run-level cancellation token.
    pub cancel: CancellationToken,
    /// External collaborators wired into the default registry.
    pub collaborators: Collaborators,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            artifact_dir: None,
            max_restarts: 10,
            events: None,
            cancel: CancellationToken::new(),
            collaborators: Collaborators::default(),
        }
    }
}

/// The result of a completed pipeline execution.
#[derive(Debug)]
pub struct PipelineResult {
    pub final_outcome: Outcome,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: HashMap<String, Outcome>,
    pub final_context: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

/// Drives graph traversal with a handler registry and a configuration.
pub struct PipelineExecutor {
    registry: Arc<HandlerRegistry>,
    config: PipelineConfig,
}

/// Mutable traversal state.
struct LoopState {
    current: String,
    completed: Vec<String>,
    node_outcomes: HashMap<String, Outcome>,
    node_retries: HashMap<String, usize>,
    restarts: usize,
    checkpoint_seq: usize,
    clear_preamble: bool,
}

impl PipelineExecutor {
    /// Executor with the default registry built from the configured
    /// collaborators.
    pub fn new(config: PipelineConfig) -> Self {
        let registry = Arc::new(default_registry(&config.collaborators));
        Self { registry, config }
    }

    /// Executor with a caller-assembled registry.
    pub fn with_registry(registry: HandlerRegistry, config: PipelineConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    /// Parse, transform, validate, and run DSL source.
    pub async fn run_source(&self, source: &str) -> Result<PipelineResult> {
        let parsed = waypoint_dot::parse(source)?;
        let mut graph = PipelineGraph::from_parsed(parsed)?;
        apply_transforms(&mut graph);
        self.run(&graph).await
    }

    /// Run a transformed graph from its start node.
    pub async fn run(&self, graph: &PipelineGraph) -> Result<PipelineResult> {
        validate_or_error(graph)?;
        let emitter = self.emitter();

        let start = graph
            .start_node()
            .ok_or_else(|| WaypointError::ValidationError("no start node found".into()))?;

        let state = LoopState {
            current: start.id.clone(),
            completed: Vec::new(),
            node_outcomes: HashMap::new(),
            node_retries: HashMap::new(),
            restarts: 0,
            checkpoint_seq: 0,
            clear_preamble: false,
        };

        emitter.emit(PipelineEvent::PipelineStarted {
            pipeline: graph.name.clone(),
        });
        let result = self.execute(graph, &emitter, None, state).await;
        self.finalize(graph, &emitter, result)
    }

    /// Resume a run from a checkpoint file.
    pub async fn resume(
        &self,
        graph: &PipelineGraph,
        checkpoint_path: &Path,
    ) -> Result<PipelineResult> {
        validate_or_error(graph)?;
        let emitter = self.emitter();

        let checkpoint = Checkpoint::load(checkpoint_path)?;
        let restored: ResumeState = resume_state(checkpoint, graph).await?;

        let state = LoopState {
            current: restored.entry_node.clone(),
            completed: restored.completed_nodes.clone(),
            node_outcomes: restored.node_outcomes.clone(),
            node_retries: restored.node_retries.clone(),
            restarts: 0,
            checkpoint_seq: restored.completed_nodes.len(),
            clear_preamble: restored.degraded,
        };

        emitter.emit(PipelineEvent::PipelineStarted {
            pipeline: graph.name.clone(),
        });
        let result = self
            .execute(graph, &emitter, Some(restored.context), state)
            .await;
        self.finalize(graph, &emitter, result)
    }

    fn emitter(&self) -> EventEmitter {
        match &self.config.events {
            Some(cb) => EventEmitter::new(cb.clone()),
            None => EventEmitter::disabled(),
        }
    }

    fn finalize(
        &self,
        graph: &PipelineGraph,
        emitter: &EventEmitter,
        result: Result<PipelineResult>,
    ) -> Result<PipelineResult> {
        match &result {
            Ok(_) => emitter.emit(PipelineEvent::PipelineCompleted {
                pipeline: graph.name.clone(),
            }),
            Err(err) => emitter.emit(PipelineEvent::PipelineFailed {
                pipeline: graph.name.clone(),
                error: err.to_string(),
            }),
        }
        result
    }

    /// Initialize the run context and drive the traversal loop.
    async fn execute(
        &self,
        graph: &PipelineGraph,
        emitter: &EventEmitter,
        restored_context: Option<Context>,
        mut state: LoopState,
    ) -> Result<PipelineResult> {
        // Artifact store: configured directory, or a shared temp dir
        // recorded under `_workdir`.
        let (artifact_dir, temp_workdir) = match &self.config.artifact_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let dir = std::env::temp_dir().join(format!("waypoint-{}", uuid::Uuid::new_v4()));
                std::fs::create_dir_all(&dir)?;
                (dir.clone(), Some(dir))
            }
        };
        let artifacts = Arc::new(ArtifactStore::new(artifact_dir));

        let context = match restored_context {
            Some(context) => context,
            None => init_context(graph, temp_workdir.as_deref()).await,
        };

        let mut run = RunContext {
            graph: Arc::new(graph.clone()),
            context,
            artifacts,
            cancel: self.config.cancel.clone(),
            emitter: emitter.clone(),
        };

        let mut iterations = 0usize;
        let final_outcome = loop {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(WaypointError::RoutingError(format!(
                    "iteration cap exceeded ({MAX_ITERATIONS}); cyclic graph without loop_restart?"
                )));
            }
            if run.cancel.is_cancelled() {
                return Err(WaypointError::Cancelled);
            }

            let node = graph.node(&state.current).ok_or_else(|| {
                WaypointError::RoutingError(format!("edge target '{}' not found", state.current))
            })?;

            if PipelineGraph::is_terminal(node) {
                let outcome = self.run_node(node, &run, &mut state, true).await?;
                record(&mut state, node, &outcome);
                run.context.apply_updates(outcome.context_updates.clone()).await;
                self.emit_stage_end(emitter, node, &outcome);

                // Goal gates run after the terminal executes.
                let gate = check_goal_gates(graph, &state.completed, &state.node_outcomes);
                if !gate.all_satisfied {
                    match gate.retry_target {
                        Some(target) => {
                            tracing::info!(
                                gate = ?gate.failed_node_id,
                                target = %target,
                                "goal gate unsatisfied; re-entering at retry target"
                            );
                            state.current = target;
                            continue;
                        }
                        None => {
                            return Err(WaypointError::GoalGateUnsatisfied {
                                node: gate.failed_node_id.unwrap_or_default(),
                            })
                        }
                    }
                }
                break outcome;
            }

            // Non-terminal node.
            let node_type = self.registry.resolve_type(node);
            let outcome = self.run_node(node, &run, &mut state, false).await?;
            record(&mut state, node, &outcome);

            run.context.apply_updates(outcome.context_updates.clone()).await;
            run.context
                .set(
                    "outcome",
                    serde_json::Value::String(outcome.status.as_str().to_string()),
                )
                .await;
            run.context
                .set(
                    "preferred_label",
                    serde_json::Value::String(outcome.preferred_label.clone().unwrap_or_default()),
                )
                .await;

            // The resume fidelity preamble is one-shot: visible to the
            // first resumed node only.
            if state.clear_preamble {
                run.context.remove(FIDELITY_PREAMBLE_KEY).await;
                state.clear_preamble = false;
            }

            self.emit_stage_end(emitter, node, &outcome);
            self.save_checkpoint_for(node, &run, &mut state, emitter).await;

            // Parallel regions: the fan-out handler already ran as the
            // observable signal; the executor owns branch traversal.
            if node_type == "parallel" && outcome.status.is_success_like() {
                let region = run_parallel(node, &run, Arc::clone(&self.registry)).await?;
                match region.fan_in {
                    Some(fan_in) => {
                        state.current = fan_in;
                        continue;
                    }
                    // Branches all ended at terminals or dead ends.
                    None => break region.outcome,
                }
            }

            // Select the next edge.
            let snapshot = run.context.snapshot().await;
            let selected_edge = {
                let resolve = resolver_for(&outcome, &snapshot);
                select_edge(&state.current, &outcome, &resolve, graph)
            };
            match selected_edge {
                Some(edge) if edge.loop_restart => {
                    state.restarts += 1;
                    emitter.emit(PipelineEvent::StageLoopRestart {
                        node: state.current.clone(),
                        target: edge.to.clone(),
                        restarts: state.restarts,
                    });
                    if state.restarts > self.config.max_restarts {
                        return Err(WaypointError::RoutingError(format!(
                            "restart limit exceeded: {} loop restarts (max {})",
                            state.restarts, self.config.max_restarts
                        )));
                    }
                    tracing::info!(target = %edge.to, restarts = state.restarts, "loop restart");

                    // Discard the context and start fresh from graph
                    // attributes.
                    run.context = init_context(graph, temp_workdir.as_deref()).await;
                    state.completed.clear();
                    state.node_outcomes.clear();
                    state.node_retries.clear();
                    state.current = edge.to.clone();
                }
                Some(edge) => {
                    state.current = edge.to.clone();
                }
                None if outcome.status == StageStatus::Fail => {
                    return Err(WaypointError::RoutingError(format!(
                        "stage '{}' failed with no outgoing fail edge",
                        node.id
                    )));
                }
                None => break outcome,
            }
        };

        Ok(PipelineResult {
            final_outcome,
            completed_nodes: state.completed.clone(),
            node_outcomes: state.node_outcomes.clone(),
            final_context: run.context.snapshot().await,
        })
    }

    /// Execute one node under the retry boundary, emitting the start
    /// event. Terminals get a single attempt.
    async fn run_node(
        &self,
        node: &PipelineNode,
        run: &RunContext,
        state: &mut LoopState,
        terminal: bool,
    ) -> Result<Outcome> {
        let node_type = self.registry.resolve_type(node);
        let handler =
            self.registry
                .get(&node_type)
                .ok_or_else(|| WaypointError::HandlerError {
                    handler: node_type.clone(),
                    node: node.id.clone(),
                    message: format!("no handler registered for type '{node_type}'"),
                })?;

        run.emitter.emit(PipelineEvent::StageStarted {
            node: node.id.clone(),
        });

        let policy = if terminal {
            RetryPolicy::once()
        } else {
            RetryPolicy::for_node(node)
        };
        let counter = state.node_retries.entry(node.id.clone()).or_insert(0);
        execute_with_retry(handler, node, run, &policy, counter).await
    }

    fn emit_stage_end(&self, emitter: &EventEmitter, node: &PipelineNode, outcome: &Outcome) {
        if outcome.status == StageStatus::Fail {
            emitter.emit(PipelineEvent::StageFailed {
                node: node.id.clone(),
                reason: outcome.failure_reason.clone().unwrap_or_default(),
            });
        } else {
            emitter.emit(PipelineEvent::StageCompleted {
                node: node.id.clone(),
                status: outcome.status.as_str().to_string(),
            });
        }
    }

    /// Persist a checkpoint after a non-terminal node. Failures are
    /// logged into the context but never abort the run.
    async fn save_checkpoint_for(
        &self,
        node: &PipelineNode,
        run: &RunContext,
        state: &mut LoopState,
        emitter: &EventEmitter,
    ) {
        let Some(dir) = &self.config.checkpoint_dir else {
            return;
        };
        state.checkpoint_seq += 1;

        let checkpoint = Checkpoint {
            timestamp: chrono::Utc::now(),
            current_node: node.id.clone(),
            completed_nodes: state.completed.clone(),
            node_retries: state.node_retries.clone(),
            context_values: run.context.snapshot().await,
            logs: run.context.logs().await,
        };
        match save_checkpoint(&checkpoint, dir, state.checkpoint_seq) {
            Ok(path) => emitter.emit(PipelineEvent::CheckpointSaved {
                node: node.id.clone(),
                path: path.display().to_string(),
            }),
            Err(err) => {
                tracing::warn!(node = %node.id, error = %err, "checkpoint write failed");
                run.context
                    .append_log(format!("checkpoint write failed at '{}': {err}", node.id))
                    .await;
            }
        }
    }
}

/// Fresh run context state: every graph attribute mirrored as a string,
/// plus `_workdir` when the engine owns a temporary artifact directory.
async fn init_context(graph: &PipelineGraph, temp_workdir: Option<&Path>) -> Context {
    let context = Context::new();
    for (key, value) in &graph.attrs {
        context
            .set(
                key.clone(),
                serde_json::Value::String(value.to_string_value()),
            )
            .await;
    }
    if let Some(dir) = temp_workdir {
        context
            .set(
                "_workdir",
                serde_json::Value::String(dir.display().to_string()),
            )
            .await;
    }
    context
}

fn record(state: &mut LoopState, node: &PipelineNode, outcome: &Outcome) {
    state.completed.push(node.id.clone());
    state.node_outcomes.insert(node.id.clone(), outcome.clone());
}
