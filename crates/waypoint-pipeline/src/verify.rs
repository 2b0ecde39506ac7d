//! Shared shell helper for post-execution verification commands.
//!
//! Runs `sh -c <command>` in its own process group with a default 60 s
//! timeout. On timeout or cancellation the whole group receives SIGKILL,
//! so shell children cannot outlive the pipeline.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use waypoint_types::{Result, WaypointError};

/// Default timeout for verification commands.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured result of a verification command.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub timed_out: bool,
}

/// Run `sh -c <command>` and capture its output.
///
/// `timeout` defaults to [`DEFAULT_VERIFY_TIMEOUT`]. Cancellation of
/// `cancel` kills the process group and returns
/// [`WaypointError::Cancelled`].
pub async fn run_verify_command(
    command: &str,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) -> Result<VerifyReport> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let pid = child.id();

    let timeout = timeout.unwrap_or(DEFAULT_VERIFY_TIMEOUT);

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            let stdout = read_pipe(&mut stdout_pipe).await;
            let stderr = read_pipe(&mut stderr_pipe).await;
            let exit_code = status.code().unwrap_or(-1);
            Ok(VerifyReport {
                exit_code,
                stdout,
                stderr,
                success: status.success(),
                timed_out: false,
            })
        }
        _ = tokio::time::sleep(timeout) => {
            kill_process_group(pid, &mut child).await;
            Ok(VerifyReport {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("command timed out after {}ms", timeout.as_millis()),
                success: false,
                timed_out: true,
            })
        }
        _ = cancel.cancelled() => {
            kill_process_group(pid, &mut child).await;
            Err(WaypointError::Cancelled)
        }
    }
}

/// SIGKILL the child's process group, falling back to a plain kill.
pub(crate) async fn kill_process_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let report = run_verify_command("echo hello", None, CancellationToken::new())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.stdout.trim(), "hello");
        assert!(!report.timed_out);
    }

    #[tokio::test]
    async fn captures_stderr_and_failure() {
        let report = run_verify_command("echo oops >&2; exit 7", None, CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.exit_code, 7);
        assert_eq!(report.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let report = run_verify_command(
            "sleep 30",
            Some(Duration::from_millis(100)),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(report.timed_out);
        assert!(!report.success);
        assert!(report.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_aborts_with_error() {
        let cancel = CancellationToken::new();
        let child_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child_cancel.cancel();
        });

        let err = run_verify_command("sleep 30", None, cancel).await.unwrap_err();
        assert!(matches!(err, WaypointError::Cancelled));
    }
}
