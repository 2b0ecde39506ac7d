//! Typed lifecycle events emitted through a single synchronous callback.
//!
//! The engine invokes the callback in definition order relative to phase
//! transitions; consumers (run-state stores, UIs, loggers) subscribe by
//! passing a callback into the pipeline configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        pipeline: String,
    },
    PipelineCompleted {
        pipeline: String,
    },
    PipelineFailed {
        pipeline: String,
        error: String,
    },
    StageStarted {
        node: String,
    },
    StageCompleted {
        node: String,
        status: String,
    },
    StageFailed {
        node: String,
        reason: String,
    },
    StageRetrying {
        node: String,
        attempt: usize,
    },
    /// A `loop_restart` edge was taken: the run context is discarded and
    /// traversal resumes at `target`.
    StageLoopRestart {
        node: String,
        target: String,
        restarts: usize,
    },
    CheckpointSaved {
        node: String,
        path: String,
    },
    AgentToolCallStarted {
        tool_name: String,
        call_id: String,
    },
    AgentToolCallFinished {
        tool_name: String,
        call_id: String,
        duration_ms: Option<u64>,
        output_snippet: Option<String>,
    },
    AgentLlmTurn {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        text_length: usize,
        has_reasoning: bool,
    },
    AgentSteering {
        message: String,
    },
    AgentLoopDetected {
        message: String,
    },
}

impl PipelineEvent {
    /// The dotted event kind, e.g. `stage.completed`.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStarted { .. } => "pipeline.started",
            PipelineEvent::PipelineCompleted { .. } => "pipeline.completed",
            PipelineEvent::PipelineFailed { .. } => "pipeline.failed",
            PipelineEvent::StageStarted { .. } => "stage.started",
            PipelineEvent::StageCompleted { .. } => "stage.completed",
            PipelineEvent::StageFailed { .. } => "stage.failed",
            PipelineEvent::StageRetrying { .. } => "stage.retrying",
            PipelineEvent::StageLoopRestart { .. } => "stage.loop_restart",
            PipelineEvent::CheckpointSaved { .. } => "checkpoint.saved",
            PipelineEvent::AgentToolCallStarted { .. } => "agent.tool_call.start",
            PipelineEvent::AgentToolCallFinished { .. } => "agent.tool_call.end",
            PipelineEvent::AgentLlmTurn { .. } => "agent.llm_turn",
            PipelineEvent::AgentSteering { .. } => "agent.steering",
            PipelineEvent::AgentLoopDetected { .. } => "agent.loop_detected",
        }
    }

    /// The node this event concerns, when any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::StageStarted { node }
            | PipelineEvent::StageCompleted { node, .. }
            | PipelineEvent::StageFailed { node, .. }
            | PipelineEvent::StageRetrying { node, .. }
            | PipelineEvent::StageLoopRestart { node, .. }
            | PipelineEvent::CheckpointSaved { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// The subscriber callback type.
pub type EventCallback = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

/// Synchronous event emitter. Cloning shares the underlying callback.
#[derive(Clone, Default)]
pub struct EventEmitter {
    callback: Option<EventCallback>,
}

impl EventEmitter {
    /// An emitter that invokes `callback` for every event.
    pub fn new(callback: EventCallback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    /// An emitter that drops all events.
    pub fn disabled() -> Self {
        Self { callback: None }
    }

    /// The underlying callback, for forwarding into collaborators that
    /// emit their own agent-stream events.
    pub fn callback(&self) -> Option<EventCallback> {
        self.callback.clone()
    }

    /// Emit one event.
    pub fn emit(&self, event: PipelineEvent) {
        tracing::debug!(kind = event.kind(), node = ?event.node_id(), "pipeline event");
        if let Some(cb) = &self.callback {
            cb(&event);
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("enabled", &self.callback.is_some())
            .finish()
    }
}
