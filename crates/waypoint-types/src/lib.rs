//! Shared types for the Waypoint pipeline engine.
//!
//! This crate provides the foundational types used across the other Waypoint
//! crates:
//! - [`WaypointError`] — unified error taxonomy
//! - [`Context`] — concurrent key-value store for per-run state
//! - [`ArtifactStore`] — named binary blobs, file-backed above a size threshold
//! - [`Outcome`] / [`StageStatus`] — result of executing a node handler
//! - [`Checkpoint`] — serializable snapshot for resume

use serde::{Deserialize, Serialize};

mod artifact;
mod context;
mod checkpoint;

pub use artifact::{ArtifactRef, ArtifactStore};
pub use checkpoint::Checkpoint;
pub use context::{coerce_to_string, Context};

// ---------------------------------------------------------------------------
// WaypointError — unified error taxonomy
// ---------------------------------------------------------------------------

/// Unified error type for all Waypoint subsystems.
#[derive(Debug, thiserror::Error)]
pub enum WaypointError {
    // === Parser errors ===
    #[error("parse error at line {line}, col {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    // === Validation errors ===
    #[error("pipeline validation failed: {0}")]
    ValidationError(String),

    // === Routing errors ===
    #[error("routing error: {0}")]
    RoutingError(String),

    #[error("goal gate unsatisfied: node '{node}' did not reach success")]
    GoalGateUnsatisfied { node: String },

    // === Handler errors ===
    #[error("handler '{handler}' failed on node '{node}': {message}")]
    HandlerError {
        handler: String,
        node: String,
        message: String,
    },

    #[error("handler panicked while executing node '{node}'")]
    HandlerPanic { node: String },

    // === Cancellation ===
    #[error("pipeline run was cancelled")]
    Cancelled,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl WaypointError {
    /// Returns `true` for errors that no retry policy may recover from.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WaypointError::ParseError { .. }
                | WaypointError::ValidationError(_)
                | WaypointError::RoutingError(_)
                | WaypointError::Cancelled
        )
    }
}

/// A convenience alias for `Result<T, WaypointError>`.
pub type Result<T> = std::result::Result<T, WaypointError>;

// ---------------------------------------------------------------------------
// StageStatus — outcome status of a pipeline node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
    Skipped,
}

impl StageStatus {
    /// The lowercase string used in edge conditions and the context
    /// `outcome` key.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::PartialSuccess => "partial_success",
            StageStatus::Retry => "retry",
            StageStatus::Fail => "fail",
            StageStatus::Skipped => "skipped",
        }
    }

    /// Parse the lowercase wire form back into a status.
    pub fn parse(s: &str) -> Option<StageStatus> {
        match s.trim() {
            "success" => Some(StageStatus::Success),
            "partial_success" => Some(StageStatus::PartialSuccess),
            "retry" => Some(StageStatus::Retry),
            "fail" => Some(StageStatus::Fail),
            "skipped" => Some(StageStatus::Skipped),
            _ => None,
        }
    }

    /// `true` for `Success` and `PartialSuccess` — the statuses that
    /// satisfy goal gates and parallel join policies.
    pub fn is_success_like(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::PartialSuccess)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome — result of executing a node handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: StageStatus,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub context_updates: std::collections::HashMap<String, serde_json::Value>,
    pub notes: String,
    pub failure_reason: Option<String>,
}

impl Outcome {
    /// Create a successful outcome with the given notes.
    pub fn success(notes: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: std::collections::HashMap::new(),
            notes: notes.into(),
            failure_reason: None,
        }
    }

    /// Create a failed outcome with the given reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: std::collections::HashMap::new(),
            notes: String::new(),
            failure_reason: Some(reason.into()),
        }
    }

    /// Create an outcome with a specific status and preferred label.
    pub fn with_label(status: StageStatus, label: impl Into<String>) -> Self {
        Self {
            status,
            preferred_label: Some(label.into()),
            suggested_next_ids: Vec::new(),
            context_updates: std::collections::HashMap::new(),
            notes: String::new(),
            failure_reason: None,
        }
    }

    /// Create an outcome with status `Retry` and a reason.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Retry,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: std::collections::HashMap::new(),
            notes: String::new(),
            failure_reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// FidelityMode — conversation-history directive, opaque to the engine
// ---------------------------------------------------------------------------

/// The six recognized fidelity modes. The engine treats these as opaque
/// except for resume-time degradation to `SummaryHigh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FidelityMode {
    Full,
    Truncate,
    Compact,
    SummaryLow,
    SummaryMedium,
    SummaryHigh,
}

impl FidelityMode {
    /// Parse an attribute value like `full` or `summary:high`.
    pub fn parse(s: &str) -> Option<FidelityMode> {
        match s.trim().to_lowercase().as_str() {
            "full" => Some(FidelityMode::Full),
            "truncate" => Some(FidelityMode::Truncate),
            "compact" => Some(FidelityMode::Compact),
            "summary:low" => Some(FidelityMode::SummaryLow),
            "summary:medium" => Some(FidelityMode::SummaryMedium),
            "summary:high" => Some(FidelityMode::SummaryHigh),
            _ => None,
        }
    }

    /// The attribute spelling of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            FidelityMode::Full => "full",
            FidelityMode::Truncate => "truncate",
            FidelityMode::Compact => "compact",
            FidelityMode::SummaryLow => "summary:low",
            FidelityMode::SummaryMedium => "summary:medium",
            FidelityMode::SummaryHigh => "summary:high",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_parse_error() {
        let err = WaypointError::ParseError {
            line: 10,
            col: 5,
            message: "unexpected token".into(),
            source_snippet: Some("digraph {".into()),
        };
        assert_eq!(
            err.to_string(),
            "parse error at line 10, col 5: unexpected token"
        );
    }

    #[test]
    fn error_display_validation() {
        let err = WaypointError::ValidationError("no start node".into());
        assert_eq!(
            err.to_string(),
            "pipeline validation failed: no start node"
        );
    }

    #[test]
    fn error_display_handler_error() {
        let err = WaypointError::HandlerError {
            handler: "tool".into(),
            node: "build".into(),
            message: "command missing".into(),
        };
        assert_eq!(
            err.to_string(),
            "handler 'tool' failed on node 'build': command missing"
        );
    }

    #[test]
    fn error_display_goal_gate() {
        let err = WaypointError::GoalGateUnsatisfied {
            node: "review".into(),
        };
        assert!(err.to_string().contains("review"));
    }

    #[test]
    fn error_display_panic_names_node() {
        let err = WaypointError::HandlerPanic {
            node: "flaky".into(),
        };
        assert!(err.to_string().contains("flaky"));
    }

    #[test]
    fn terminal_errors() {
        assert!(WaypointError::ValidationError("bad".into()).is_terminal());
        assert!(WaypointError::Cancelled.is_terminal());
        assert!(WaypointError::RoutingError("loop".into()).is_terminal());
        assert!(!WaypointError::Other("hmm".into()).is_terminal());
        assert!(!WaypointError::HandlerPanic { node: "x".into() }.is_terminal());
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: WaypointError = io_err.into();
        assert!(matches!(err, WaypointError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: WaypointError = json_err.into();
        assert!(matches!(err, WaypointError::Json(_)));
    }

    // --- StageStatus ---

    #[test]
    fn stage_status_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&StageStatus::PartialSuccess).unwrap(),
            "\"partial_success\""
        );
        assert_eq!(
            serde_json::to_string(&StageStatus::Skipped).unwrap(),
            "\"skipped\""
        );
    }

    #[test]
    fn stage_status_round_trips_through_str() {
        for status in [
            StageStatus::Success,
            StageStatus::PartialSuccess,
            StageStatus::Retry,
            StageStatus::Fail,
            StageStatus::Skipped,
        ] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StageStatus::parse("nonsense"), None);
    }

    #[test]
    fn success_like_statuses() {
        assert!(StageStatus::Success.is_success_like());
        assert!(StageStatus::PartialSuccess.is_success_like());
        assert!(!StageStatus::Retry.is_success_like());
        assert!(!StageStatus::Fail.is_success_like());
        assert!(!StageStatus::Skipped.is_success_like());
    }

    // --- Outcome ---

    #[test]
    fn outcome_success_constructor() {
        let o = Outcome::success("all good");
        assert_eq!(o.status, StageStatus::Success);
        assert_eq!(o.notes, "all good");
        assert!(o.preferred_label.is_none());
        assert!(o.failure_reason.is_none());
        assert!(o.suggested_next_ids.is_empty());
        assert!(o.context_updates.is_empty());
    }

    #[test]
    fn outcome_fail_constructor() {
        let o = Outcome::fail("something broke");
        assert_eq!(o.status, StageStatus::Fail);
        assert_eq!(o.failure_reason, Some("something broke".to_string()));
        assert!(o.notes.is_empty());
    }

    #[test]
    fn outcome_with_label_constructor() {
        let o = Outcome::with_label(StageStatus::Retry, "try_again");
        assert_eq!(o.status, StageStatus::Retry);
        assert_eq!(o.preferred_label, Some("try_again".to_string()));
    }

    #[test]
    fn outcome_retry_constructor() {
        let o = Outcome::retry("transient");
        assert_eq!(o.status, StageStatus::Retry);
        assert_eq!(o.failure_reason.as_deref(), Some("transient"));
    }

    // --- FidelityMode ---

    #[test]
    fn fidelity_mode_parses_all_six() {
        assert_eq!(FidelityMode::parse("full"), Some(FidelityMode::Full));
        assert_eq!(FidelityMode::parse("truncate"), Some(FidelityMode::Truncate));
        assert_eq!(FidelityMode::parse("compact"), Some(FidelityMode::Compact));
        assert_eq!(
            FidelityMode::parse("summary:low"),
            Some(FidelityMode::SummaryLow)
        );
        assert_eq!(
            FidelityMode::parse("summary:medium"),
            Some(FidelityMode::SummaryMedium)
        );
        assert_eq!(
            FidelityMode::parse("Summary:High"),
            Some(FidelityMode::SummaryHigh)
        );
        assert_eq!(FidelityMode::parse("bogus"), None);
    }

    #[test]
    fn fidelity_mode_as_str_round_trips() {
        for mode in [
            FidelityMode::Full,
            FidelityMode::Truncate,
            FidelityMode::Compact,
            FidelityMode::SummaryLow,
            FidelityMode::SummaryMedium,
            FidelityMode::SummaryHigh,
        ] {
            assert_eq!(FidelityMode::parse(mode.as_str()), Some(mode));
        }
    }
}
