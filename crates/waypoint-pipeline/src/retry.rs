//! Per-node retry execution with backoff, panic catching, and cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use waypoint_types::{Outcome, Result, StageStatus, WaypointError};

use crate::events::PipelineEvent;
use crate::graph::PipelineNode;
use crate::handler::{DynHandler, RunContext};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64)
                    .saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Predicate deciding whether an error is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&WaypointError) -> bool + Send + Sync>;

/// Retry policy for one node execution.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
    pub should_retry: RetryPredicate,
}

impl RetryPolicy {
    /// Policy for a node: `max_retries=N` becomes `max_attempts=N+1`.
    pub fn for_node(node: &PipelineNode) -> Self {
        Self {
            max_attempts: node.max_retries + 1,
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
            // Default predicate: retry anything that is not terminal.
            should_retry: Arc::new(|err| !err.is_terminal()),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Execute a node handler under the retry policy.
///
/// Behavior per attempt:
/// - a cancelled run token aborts with [`WaypointError::Cancelled`];
/// - panics are caught and treated as errors naming the node;
/// - returned errors and `retry`-status outcomes consume an attempt,
///   bump the node's retry counter, emit a `stage.retrying` event, and
///   sleep the backoff delay (interruptible by cancellation);
/// - exhausted attempts synthesize `partial_success` when the node has
///   `allow_partial=true`, otherwise `fail`; the failure reason records
///   the attempt count;
/// - `success`/`partial_success` reset the retry counter to zero;
/// - `fail` and `skipped` return immediately.
///
/// The only `Err` this returns is cancellation.
pub async fn execute_with_retry(
    handler: &DynHandler,
    node: &PipelineNode,
    run: &RunContext,
    policy: &RetryPolicy,
    retry_counter: &mut usize,
) -> Result<Outcome> {
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        if run.cancel.is_cancelled() {
            return Err(WaypointError::Cancelled);
        }

        let result = std::panic::AssertUnwindSafe(handler.execute(node, run))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(WaypointError::HandlerPanic {
                    node: node.id.clone(),
                })
            });

        match result {
            Ok(outcome) if outcome.status == StageStatus::Retry => {
                if attempt < policy.max_attempts {
                    *retry_counter += 1;
                    sleep_before_retry(node, run, policy, attempt).await?;
                    continue;
                }
                return Ok(synthesize_exhausted(node, attempt, outcome.failure_reason));
            }
            Ok(outcome) => {
                if outcome.status.is_success_like() {
                    *retry_counter = 0;
                }
                return Ok(outcome);
            }
            Err(WaypointError::Cancelled) => return Err(WaypointError::Cancelled),
            Err(err) => {
                if attempt < policy.max_attempts && (policy.should_retry)(&err) {
                    tracing::warn!(node = %node.id, attempt, error = %err, "retrying after error");
                    *retry_counter += 1;
                    sleep_before_retry(node, run, policy, attempt).await?;
                    continue;
                }
                return Ok(synthesize_exhausted(node, attempt, Some(err.to_string())));
            }
        }
    }
}

/// Emit the retry event and sleep the backoff delay, yielding to
/// cancellation.
async fn sleep_before_retry(
    node: &PipelineNode,
    run: &RunContext,
    policy: &RetryPolicy,
    attempt: usize,
) -> Result<()> {
    run.emitter.emit(PipelineEvent::StageRetrying {
        node: node.id.clone(),
        attempt,
    });
    let delay = policy.backoff.delay_for_attempt(attempt - 1);
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = run.cancel.cancelled() => Err(WaypointError::Cancelled),
    }
}

fn synthesize_exhausted(node: &PipelineNode, attempts: usize, cause: Option<String>) -> Outcome {
    let status = if node.allow_partial {
        StageStatus::PartialSuccess
    } else {
        StageStatus::Fail
    };
    let mut reason = format!("node '{}' failed after {attempts} attempt(s)", node.id);
    if let Some(cause) = cause {
        reason.push_str(": ");
        reason.push_str(&cause);
    }
    Outcome {
        status,
        preferred_label: None,
        suggested_next_ids: Vec::new(),
        context_updates: std::collections::HashMap::new(),
        notes: String::new(),
        failure_reason: Some(reason),
    }
}
