//! Pipeline execution engine for Waypoint graphs.
//!
//! Parses a DOT-style pipeline definition (via `waypoint-dot`), validates
//! it, and drives each node through pluggable async handlers with retry
//! policies, goal gates, parallel regions, checkpoint/resume, and a
//! structured event stream.

pub mod backend;
pub mod checkpoint;
pub mod condition;
pub mod edge_selection;
pub mod engine;
pub mod events;
pub mod goal_gate;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod interviewer;
pub mod parallel;
pub mod resume;
pub mod retry;
pub mod transforms;
pub mod validation;
pub mod verify;

pub use backend::{AgentRunConfig, AgentRunResult, CodergenBackend, ManagerBackend, TokenUsage};
pub use checkpoint::{latest_checkpoint, save_checkpoint};
pub use condition::{evaluate_condition, parse_condition, Clause, ConditionExpr, Operator};
pub use edge_selection::select_edge;
pub use engine::{PipelineConfig, PipelineExecutor, PipelineResult};
pub use events::{EventCallback, EventEmitter, PipelineEvent};
pub use goal_gate::{check_goal_gates, enforce_goal_gates, GoalGateResult};
pub use graph::{PipelineEdge, PipelineGraph, PipelineNode};
pub use handler::{
    default_registry, Collaborators, ConditionalHandler, DynHandler, ExitHandler, HandlerRegistry,
    NodeHandler, RunContext, StartHandler,
};
pub use handlers::{
    CodergenHandler, FanInHandler, FanOutHandler, ManagerLoopHandler, ToolHandler,
    WaitHumanHandler,
};
pub use interviewer::{
    AutoApproveInterviewer, ConsoleInterviewer, Interviewer, Question, RecordingInterviewer,
};
pub use parallel::{run_parallel, ErrorPolicy, JoinPolicy, ParallelOutcome};
pub use resume::{resume_state, ResumeState, FIDELITY_PREAMBLE_KEY};
pub use retry::{execute_with_retry, BackoffPolicy, RetryPolicy};
pub use transforms::{apply_transforms, expand_variables};
pub use validation::{validate, validate_or_error, Diagnostic, LintRule, Severity};
pub use verify::{run_verify_command, VerifyReport};
