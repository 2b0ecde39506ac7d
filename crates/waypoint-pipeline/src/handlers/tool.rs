//! Tool handler: runs a shell command for `parallelogram` nodes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use waypoint_types::{Outcome, Result, StageStatus, WaypointError};

use crate::graph::PipelineNode;
use crate::handler::{NodeHandler, RunContext};
use crate::verify::kill_process_group;

/// Combined output beyond this many bytes is truncated in `notes` and
/// stored in full as the `<node>.stdout` artifact.
const NOTES_LIMIT: usize = 10 * 1024;

/// Default command timeout when the node sets none.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variables come from attributes with this prefix.
const ENV_PREFIX: &str = "env_";

pub struct ToolHandler;

#[async_trait]
impl NodeHandler for ToolHandler {
    fn handler_type(&self) -> &str {
        "tool"
    }

    async fn execute(&self, node: &PipelineNode, run: &RunContext) -> Result<Outcome> {
        if run.cancel.is_cancelled() {
            return Err(WaypointError::Cancelled);
        }

        let Some(command) = node
            .attr_str("command")
            .or_else(|| node.attr_str("tool_command"))
            .or(node.prompt.as_deref())
        else {
            return Ok(Outcome::fail(format!(
                "tool node '{}' specifies no command",
                node.id
            )));
        };

        let timeout = match node.raw_attrs.get("timeout") {
            None => DEFAULT_TIMEOUT,
            Some(v) => match v.as_duration() {
                Some(d) if !d.is_zero() => d,
                _ => {
                    return Ok(Outcome::fail(format!(
                        "tool node '{}' has an invalid timeout",
                        node.id
                    )))
                }
            },
        };

        let working_dir = node
            .attr_str("working_dir")
            .or(node.workdir.as_deref())
            .map(std::path::PathBuf::from);
        if let Some(ref dir) = working_dir {
            if !dir.is_dir() {
                return Ok(Outcome::fail(format!(
                    "working directory '{}' does not exist",
                    dir.display()
                )));
            }
        }

        tracing::info!(node = %node.id, command, "executing tool command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        // Inherit the caller's environment, overlay env_* attributes.
        for (key, value) in &node.raw_attrs {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                cmd.env(name, value.to_string_value());
            }
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| WaypointError::HandlerError {
            handler: "tool".into(),
            node: node.id.clone(),
            message: format!("failed to spawn command: {e}"),
        })?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let pid = child.id();

        let (status, stdout, stderr) = tokio::select! {
            status = child.wait() => {
                let status = status?;
                let stdout = read_pipe(&mut stdout_pipe).await;
                let stderr = read_pipe(&mut stderr_pipe).await;
                (status, stdout, stderr)
            }
            _ = tokio::time::sleep(timeout) => {
                kill_process_group(pid, &mut child).await;
                return Ok(Outcome::fail(format!(
                    "command timed out after {}ms",
                    timeout.as_millis()
                )));
            }
            _ = run.cancel.cancelled() => {
                kill_process_group(pid, &mut child).await;
                return Err(WaypointError::Cancelled);
            }
        };
        let exit_code = status.code().unwrap_or(-1);

        tracing::info!(
            node = %node.id,
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "tool command finished"
        );

        let mut updates = HashMap::new();
        updates.insert("tool.exit_code".into(), serde_json::json!(exit_code));
        updates.insert(
            "tool.stdout".into(),
            serde_json::Value::String(stdout.clone()),
        );
        updates.insert(
            "tool.stderr".into(),
            serde_json::Value::String(stderr.clone()),
        );

        let combined = if stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}\n--- stderr ---\n{stderr}")
        };
        let notes = if combined.len() > NOTES_LIMIT {
            run.artifacts
                .put(format!("{}.stdout", node.id), combined.as_bytes())?;
            let cut = combined
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= NOTES_LIMIT)
                .last()
                .unwrap_or(0);
            format!("{}...(truncated)", &combined[..cut])
        } else {
            combined
        };

        if !status.success() {
            return Ok(Outcome {
                status: StageStatus::Fail,
                preferred_label: None,
                suggested_next_ids: Vec::new(),
                context_updates: updates,
                notes,
                failure_reason: Some(format!("command exited with code {exit_code}")),
            });
        }

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: updates,
            notes,
            failure_reason: None,
        })
    }
}

async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: &mut Option<R>) -> String {
    use tokio::io::AsyncReadExt;
    let Some(reader) = pipe.as_mut() else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).to_string()
}
