use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const MAX_CAPTURE_BYTES: usize = 256 * 1024;

/// One command for the sandbox runtime: a `sh -c` line, an optional
/// working directory, and a hard deadline.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, cwd: Option<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd,
            timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

/// Boundary to the sandbox runtime. The production deployment points this
/// at a remote executor; `LocalExecutor` runs the same contract in-process.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, ExecError>;
}

/// Runs commands on the local host via `sh -c`, killing the process at the
/// deadline.
pub struct LocalExecutor;

#[async_trait]
impl Executor for LocalExecutor {
    async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, ExecError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&req.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| ExecError::Spawn(e.to_string()))?;

        let stdout_pipe = child.stdout.take().expect("stdout piped");
        let stderr_pipe = child.stderr.take().expect("stderr piped");
        let mut stdout_lines = BufReader::new(stdout_pipe).lines();
        let mut stderr_lines = BufReader::new(stderr_pipe).lines();

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stdout_done = false;
        let mut stderr_done = false;

        let deadline = tokio::time::Instant::now() + req.timeout;

        while !stdout_done || !stderr_done {
            tokio::select! {
                biased;
                result = stdout_lines.next_line(), if !stdout_done => {
                    match result {
                        Ok(Some(line)) => append_capped(&mut stdout, &line),
                        _ => stdout_done = true,
                    }
                }
                result = stderr_lines.next_line(), if !stderr_done => {
                    match result {
                        Ok(Some(line)) => append_capped(&mut stderr, &line),
                        _ => stderr_done = true,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return Err(ExecError::Timeout(req.timeout));
                }
            }
        }

        let status = child.wait().await;
        let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

fn append_capped(buf: &mut String, line: &str) {
    if buf.len() >= MAX_CAPTURE_BYTES {
        return;
    }
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
}

/// Single-quote a string for interpolation into a `sh -c` line. Interior
/// quotes become `'\''`.
pub fn shell_quote_single(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_plain_string() {
        assert_eq!(shell_quote_single("https://host/repo.git"), "'https://host/repo.git'");
    }

    #[test]
    fn quote_escapes_interior_single_quotes() {
        assert_eq!(shell_quote_single("a'b"), r"'a'\''b'");
    }

    #[tokio::test]
    async fn local_executor_captures_streams_and_exit_code() {
        let out = LocalExecutor
            .exec(ExecRequest::new(
                "echo out-line && echo err-line 1>&2 && exit 3",
                None,
                Duration::from_secs(5),
            ))
            .await
            .unwrap();
        assert_eq!(out.stdout, "out-line");
        assert_eq!(out.stderr, "err-line");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn local_executor_kills_on_deadline() {
        let err = LocalExecutor
            .exec(ExecRequest::new("sleep 30", None, Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn local_executor_honors_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("probe.txt"), "hello").unwrap();
        let out = LocalExecutor
            .exec(ExecRequest::new(
                "cat probe.txt",
                Some(dir.path().to_string_lossy().into_owned()),
                Duration::from_secs(5),
            ))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
    }
}
