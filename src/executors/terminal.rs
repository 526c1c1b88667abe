//! `terminal-command` action type (§4.1).
//!
//! Spawns a subprocess under the workspace root with a hard wall-clock
//! timeout (default 300 s). Stdout/stderr are buffered in memory up to a
//! 1 MiB cap per stream, keeping the tail on overflow since the end of
//! output is usually what explains a failure. Both streams are drained by
//! their own task running concurrently with `child.wait()` — a child that
//! fills the OS pipe buffer (~64 KiB) before exiting would otherwise
//! deadlock against a parent blocked in `wait()`. On timeout, sends
//! SIGTERM (via `Child::start_kill` on platforms without signal
//! granularity), waits a 5 s grace period, then force-kills, still
//! collecting whatever the reader tasks had already captured.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::instrument;

use crate::classifier::RawActionResult;
use crate::protocol::{Action, ActionBody};

use super::{ActionExecutor, ExecutionEnvironment};

const STREAM_CAP_BYTES: usize = 1024 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct TerminalCommandExecutor;

#[async_trait]
impl ActionExecutor for TerminalCommandExecutor {
    fn can_handle(&self, action: &Action) -> bool {
        matches!(action.body, ActionBody::TerminalCommand { .. })
    }

    #[instrument(skip(self, env), fields(action_id = %action.id))]
    async fn execute(&self, action: &Action, env: &ExecutionEnvironment) -> RawActionResult {
        let command = match &action.body {
            ActionBody::TerminalCommand { command } => command,
            _ => unreachable!("can_handle guarantees TerminalCommand"),
        };

        let timeout_secs = action.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS.max(env.default_timeout_secs));
        let mut child = match spawn(command, &env.workspace_root) {
            Ok(child) => child,
            Err(_) => {
                return RawActionResult {
                    spawn_error: true,
                    ..Default::default()
                }
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout));
        let stderr_task = tokio::spawn(read_capped(stderr));

        let started = Instant::now();
        let wait_result = timeout(Duration::from_secs(timeout_secs), child.wait()).await;

        match wait_result {
            Ok(Ok(status)) => {
                let stdout_bytes = stdout_task.await.unwrap_or_default();
                let stderr_bytes = stderr_task.await.unwrap_or_default();
                RawActionResult {
                    exit_code: status.code(),
                    stdout: stdout_bytes,
                    stderr: stderr_bytes,
                    ..Default::default()
                }
            }
            Ok(Err(_)) => {
                stdout_task.abort();
                stderr_task.abort();
                RawActionResult {
                    spawn_error: true,
                    ..Default::default()
                }
            }
            Err(_elapsed) => {
                let _ = child.start_kill();
                let _ = timeout(KILL_GRACE, child.wait()).await;
                let _ = child.kill().await;
                let _ = started; // duration is recorded by the caller's span timing
                let stdout_bytes = timeout(KILL_GRACE, stdout_task).await.ok().and_then(Result::ok).unwrap_or_default();
                let stderr_bytes = timeout(KILL_GRACE, stderr_task).await.ok().and_then(Result::ok).unwrap_or_default();
                RawActionResult {
                    timed_out: true,
                    stdout: stdout_bytes,
                    stderr: stderr_bytes,
                    ..Default::default()
                }
            }
        }
    }
}

fn spawn(command: &str, workspace_root: &std::path::Path) -> std::io::Result<tokio::process::Child> {
    let mut parts = shell_words();
    parts.push(command.to_string());
    let (program, args) = parts.split_first().expect("always has shell invocation");

    Command::new(program)
        .args(args)
        .current_dir(workspace_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

#[cfg(unix)]
fn shell_words() -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string()]
}

#[cfg(not(unix))]
fn shell_words() -> Vec<String> {
    vec!["cmd".to_string(), "/C".to_string()]
}

async fn read_capped(stream: Option<impl AsyncRead + Unpin>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    if buf.len() > STREAM_CAP_BYTES {
        let tail_start = buf.len() - STREAM_CAP_BYTES;
        buf.drain(0..tail_start);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
