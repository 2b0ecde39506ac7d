//! Node handler contract, run context, registry, and the structural
//! start/exit/conditional handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use waypoint_types::{ArtifactStore, Context, Outcome, Result, StageStatus};

use crate::backend::{CodergenBackend, ManagerBackend};
use crate::events::EventEmitter;
use crate::graph::{PipelineGraph, PipelineNode};
use crate::interviewer::Interviewer;
use crate::verify::run_verify_command;

/// Handler type identifiers the validator accepts.
pub const KNOWN_HANDLER_TYPES: &[&str] = &[
    "start",
    "exit",
    "codergen",
    "conditional",
    "parallel",
    "parallel.fan_in",
    "tool",
    "wait.human",
    "stack.manager_loop",
];

/// Map a node shape to its handler type. Unknown shapes default to
/// `codergen`.
pub fn shape_to_type(shape: &str) -> &'static str {
    match shape {
        "Mdiamond" => "start",
        "Msquare" => "exit",
        "box" => "codergen",
        "diamond" => "conditional",
        "component" => "parallel",
        "tripleoctagon" => "parallel.fan_in",
        "parallelogram" => "tool",
        "house" => "stack.manager_loop",
        "hexagon" => "wait.human",
        _ => "codergen",
    }
}

// ---------------------------------------------------------------------------
// RunContext — everything a handler sees besides its node
// ---------------------------------------------------------------------------

/// Shared execution state handed to every handler invocation.
///
/// Cloning is cheap; the context clone is a handle to the same store. The
/// parallel executor swaps in a forked context per branch.
#[derive(Clone)]
pub struct RunContext {
    pub graph: Arc<PipelineGraph>,
    pub context: Context,
    pub artifacts: Arc<ArtifactStore>,
    pub cancel: CancellationToken,
    pub emitter: EventEmitter,
}

impl RunContext {
    /// A copy of this run context with `context` replaced (used for
    /// parallel branch isolation).
    pub fn with_context(&self, context: Context) -> RunContext {
        RunContext {
            context,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// NodeHandler trait and registry
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The handler type identifier (e.g. "start", "exit", "codergen").
    fn handler_type(&self) -> &str;

    /// Execute this handler for a node. Handlers must honor cancellation
    /// at entry.
    async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome>;
}

/// Object-safe wrapper for registered handlers.
pub struct DynHandler(Box<dyn NodeHandler>);

impl DynHandler {
    pub fn new(handler: impl NodeHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn handler_type(&self) -> &str {
        self.0.handler_type()
    }

    pub async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        self.0.execute(node, run).await
    }
}

/// Registry mapping handler type identifiers to handlers.
pub struct HandlerRegistry {
    handlers: HashMap<String, DynHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: impl NodeHandler + 'static) {
        let t = handler.handler_type().to_string();
        self.handlers.insert(t, DynHandler::new(handler));
    }

    /// Resolve a node to its handler type: explicit `type` attribute,
    /// then shape mapping, then `codergen`.
    pub fn resolve_type(&self, node: &PipelineNode) -> String {
        if let Some(ref t) = node.node_type {
            return t.clone();
        }
        shape_to_type(&node.shape).to_string()
    }

    pub fn get(&self, handler_type: &str) -> Option<&DynHandler> {
        self.handlers.get(handler_type)
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Collaborators and the default registry builder
// ---------------------------------------------------------------------------

/// External collaborators injected into the built-in handlers.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub codergen: Option<Arc<dyn CodergenBackend>>,
    pub manager: Option<Arc<dyn ManagerBackend>>,
    pub interviewer: Option<Arc<dyn Interviewer>>,
}

/// Build a registry containing every structural handler, wired to the
/// given collaborators.
pub fn default_registry(collaborators: &Collaborators) -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(ConditionalHandler);
    reg.register(crate::handlers::ToolHandler);
    reg.register(crate::handlers::CodergenHandler::new(
        collaborators.codergen.clone(),
    ));
    reg.register(crate::handlers::FanOutHandler);
    reg.register(crate::handlers::FanInHandler);
    reg.register(crate::handlers::ManagerLoopHandler::new(
        collaborators.manager.clone(),
    ));
    reg.register(crate::handlers::WaitHumanHandler::new(
        collaborators.interviewer.clone(),
    ));
    reg
}

// ---------------------------------------------------------------------------
// Structural handlers
// ---------------------------------------------------------------------------

/// Entry point: records the run start timestamp.
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(&self, _node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        if run.cancel.is_cancelled() {
            return Err(waypoint_types::WaypointError::Cancelled);
        }
        let mut outcome = Outcome::success("pipeline started");
        outcome.context_updates.insert(
            "_started_at".into(),
            serde_json::Value::String(
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            ),
        );
        Ok(outcome)
    }
}

/// Terminal node: records the finish timestamp and optionally runs a
/// verification command.
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        if run.cancel.is_cancelled() {
            return Err(waypoint_types::WaypointError::Cancelled);
        }

        let mut outcome = Outcome::success("pipeline finished");
        outcome.context_updates.insert(
            "_finished_at".into(),
            serde_json::Value::String(
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            ),
        );

        if let Some(command) = node.attr_str("verify_command") {
            tracing::info!(node = %node.id, command, "running verify command");
            let report = run_verify_command(command, None, run.cancel.clone()).await?;
            let blob = format!(
                "exit_code={}\nstdout:\n{}\nstderr:\n{}",
                report.exit_code, report.stdout, report.stderr
            );
            run.artifacts
                .put(format!("{}.verify_output", node.id), blob.as_bytes())?;
            if !report.success {
                let reason = if report.timed_out {
                    format!("verify command timed out: {command}")
                } else {
                    format!("verify command exited with code {}", report.exit_code)
                };
                return Ok(Outcome::fail(reason));
            }
        }

        Ok(outcome)
    }
}

/// Routing-only node: passes the previous outcome's status through so
/// downstream `condition="outcome=..."` edges match.
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    fn handler_type(&self) -> &str {
        "conditional"
    }

    async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        if run.cancel.is_cancelled() {
            return Err(waypoint_types::WaypointError::Cancelled);
        }
        let prior = run.context.get_string("outcome", "success").await;
        let status = StageStatus::parse(&prior).unwrap_or(StageStatus::Success);

        let mut outcome = Outcome::success("conditional pass-through");
        outcome.status = status;
        if status == StageStatus::Fail {
            outcome.failure_reason = Some("propagated failing outcome".into());
        }
        outcome.context_updates.insert(
            "last_stage".into(),
            serde_json::Value::String(node.id.clone()),
        );
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A node with the given shape and all defaults.
    pub fn node_with_shape(id: &str, shape: &str) -> PipelineNode {
        PipelineNode {
            id: id.to_string(),
            label: id.to_string(),
            shape: shape.to_string(),
            node_type: None,
            prompt: None,
            max_retries: 0,
            allow_partial: false,
            goal_gate: false,
            retry_target: None,
            max_iterations: 10,
            fidelity: None,
            timeout: None,
            llm_model: None,
            llm_provider: None,
            workdir: None,
            base_url: None,
            max_turns: None,
            classes: Vec::new(),
            raw_attrs: HashMap::new(),
        }
    }

    /// A run context over a minimal two-node graph.
    pub async fn run_context() -> RunContext {
        let parsed = waypoint_dot::parse("digraph G { A -> B }").unwrap();
        let graph = PipelineGraph::from_parsed(parsed).unwrap();
        run_context_with_graph(graph)
    }

    /// A run context over the given graph with a temp-backed artifact
    /// store and a disabled emitter.
    pub fn run_context_with_graph(graph: PipelineGraph) -> RunContext {
        let dir = std::env::temp_dir().join(format!("waypoint-test-{}", uuid::Uuid::new_v4()));
        RunContext {
            graph: Arc::new(graph),
            context: Context::new(),
            artifacts: Arc::new(ArtifactStore::new(dir)),
            cancel: CancellationToken::new(),
            emitter: EventEmitter::disabled(),
        }
    }

    /// Handler driven by a synchronous closure.
    pub struct FnHandler<F> {
        handler_type: &'static str,
        f: F,
    }

    impl<F> FnHandler<F>
    where
        F: Fn() -> Result<Outcome> + Send + Sync,
    {
        pub fn new(handler_type: &'static str, f: F) -> Self {
            Self { handler_type, f }
        }
    }

    #[async_trait]
    impl<F> NodeHandler for FnHandler<F>
    where
        F: Fn() -> Result<Outcome> + Send + Sync,
    {
        fn handler_type(&self) -> &str {
            self.handler_type
        }

        async fn execute(&self, _node: &PipelineNode, _run: &RunContext) -> Result<Outcome> {
            (self.f)()
        }
    }

    struct ScriptedHandler {
        script: Mutex<VecDeque<Result<Outcome>>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeHandler for ScriptedHandler {
        fn handler_type(&self) -> &str {
            "codergen"
        }

        async fn execute(&self, _node: &PipelineNode, _run: &RunContext) -> Result<Outcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Outcome::success("script exhausted")))
        }
    }

    /// A handler that returns the scripted results in order, then
    /// successes; also returns its call counter.
    pub fn scripted_handler(script: Vec<Result<Outcome>>) -> (DynHandler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = ScriptedHandler {
            script: Mutex::new(script.into()),
            calls: calls.clone(),
        };
        (DynHandler::new(handler), calls)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::test_support::{node_with_shape, run_context};
    use super::*;

    #[test]
    fn shape_table_matches_contract() {
        assert_eq!(shape_to_type("Mdiamond"), "start");
        assert_eq!(shape_to_type("Msquare"), "exit");
        assert_eq!(shape_to_type("box"), "codergen");
        assert_eq!(shape_to_type("diamond"), "conditional");
        assert_eq!(shape_to_type("component"), "parallel");
        assert_eq!(shape_to_type("tripleoctagon"), "parallel.fan_in");
        assert_eq!(shape_to_type("parallelogram"), "tool");
        assert_eq!(shape_to_type("house"), "stack.manager_loop");
        assert_eq!(shape_to_type("hexagon"), "wait.human");
        assert_eq!(shape_to_type("anything_else"), "codergen");
    }

    #[test]
    fn resolve_type_prefers_explicit_attribute() {
        let reg = HandlerRegistry::new();
        let mut node = node_with_shape("n", "box");
        node.node_type = Some("tool".into());
        assert_eq!(reg.resolve_type(&node), "tool");

        let node = node_with_shape("n", "hexagon");
        assert_eq!(reg.resolve_type(&node), "wait.human");

        let node = node_with_shape("n", "mystery");
        assert_eq!(reg.resolve_type(&node), "codergen");
    }

    #[test]
    fn register_and_get_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register(StartHandler);
        assert!(reg.has("start"));
        assert!(reg.get("start").is_some());
        assert!(!reg.has("missing"));
    }

    #[test]
    fn default_registry_has_all_structural_handlers() {
        let reg = default_registry(&Collaborators::default());
        for t in KNOWN_HANDLER_TYPES {
            assert!(reg.has(t), "missing handler for {t}");
        }
    }

    #[tokio::test]
    async fn start_handler_records_timestamp() {
        let run = run_context().await;
        let node = node_with_shape("s", "Mdiamond");
        let outcome = StartHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        let stamp = outcome
            .context_updates
            .get("_started_at")
            .and_then(|v| v.as_str())
            .unwrap();
        // RFC 3339 with sub-second precision.
        assert!(stamp.contains('T') && stamp.contains('.'));
    }

    #[tokio::test]
    async fn exit_handler_records_timestamp() {
        let run = run_context().await;
        let node = node_with_shape("e", "Msquare");
        let outcome = ExitHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome.context_updates.contains_key("_finished_at"));
    }

    #[tokio::test]
    async fn exit_handler_runs_verify_command() {
        let run = run_context().await;
        let mut node = node_with_shape("e", "Msquare");
        node.raw_attrs.insert(
            "verify_command".into(),
            waypoint_dot::AttrValue::Str("echo checked".into()),
        );

        let outcome = ExitHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);

        let blob = run.artifacts.get("e.verify_output").unwrap();
        let text = String::from_utf8(blob).unwrap();
        assert!(text.starts_with("exit_code=0\nstdout:\n"), "got: {text}");
        assert!(text.contains("checked"));
        assert!(text.contains("stderr:\n"));
    }

    #[tokio::test]
    async fn exit_handler_fails_on_nonzero_verify() {
        let run = run_context().await;
        let mut node = node_with_shape("e", "Msquare");
        node.raw_attrs.insert(
            "verify_command".into(),
            waypoint_dot::AttrValue::Str("exit 3".into()),
        );

        let outcome = ExitHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome.failure_reason.unwrap().contains("3"));
        assert!(run.artifacts.has("e.verify_output"));
    }

    #[tokio::test]
    async fn conditional_handler_passes_status_through() {
        let run = run_context().await;
        run.context
            .set("outcome", serde_json::Value::String("fail".into()))
            .await;
        let node = node_with_shape("check", "diamond");

        let outcome = ConditionalHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert_eq!(
            outcome.context_updates.get("last_stage"),
            Some(&serde_json::Value::String("check".into()))
        );
    }

    #[tokio::test]
    async fn conditional_handler_defaults_to_success() {
        let run = run_context().await;
        let node = node_with_shape("check", "diamond");
        let outcome = ConditionalHandler.execute(&node, &run).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
    }
}
