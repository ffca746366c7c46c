//! Child process lifecycle and the serialized stdin write path
//!
//! The child's stdin is a single non-multiplexable pipe shared by every HTTP
//! submission, so all writes go through one async mutex. The liveness flag is
//! cleared by the stdout dispatcher on end-of-stream so later submissions
//! fail fast instead of hanging.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::AppError;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn child process `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Submission seam between the HTTP layer and the child process.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn submit(&self, frame: &Value) -> Result<(), AppError>;
    fn is_alive(&self) -> bool;
}

/// The process-wide singleton child. Created once at startup, shut down once
/// at exit; never restarted.
pub struct Subprocess {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    alive: AtomicBool,
    pid: Option<u32>,
}

/// Read ends handed to the dispatcher tasks at startup.
pub struct ChildPipes {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl Subprocess {
    /// Spawn the child with piped stdio. The credential goes into the child
    /// environment only; it is never logged (see [`crate::config::Secret`]).
    /// Spawn failure is fatal to the bridge, there is no retry.
    pub fn spawn(config: &Config) -> Result<(Arc<Self>, ChildPipes), SpawnError> {
        let mut command = Command::new(&config.child_command);
        command
            .args(&config.child_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &config.child_token {
            command.env(&config.child_token_var, token.expose());
        }

        let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
            command: config.child_command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe("stderr"))?;

        let pid = child.id();
        info!(pid = ?pid, command = %config.child_command, "child process started");

        let subprocess = Arc::new(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            alive: AtomicBool::new(true),
            pid,
        });
        Ok((subprocess, ChildPipes { stdout, stderr }))
    }

    pub fn mark_exited(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// SIGTERM, bounded grace, SIGKILL fallback. Called exactly once from
    /// `main` after the server future resolves.
    pub async fn shutdown(&self, grace: Duration) {
        self.mark_exited();
        let mut child = self.child.lock().await;

        match child.try_wait() {
            Ok(Some(status)) => {
                info!(%status, "child process already exited");
                return;
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not query child process state"),
        }

        if let Some(pid) = self.pid {
            let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if rc != 0 {
                warn!(pid, "sending SIGTERM to child failed");
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "child process exited"),
            Ok(Err(err)) => warn!(error = %err, "waiting for child process failed"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "grace period elapsed, killing child");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "killing child process failed");
                }
            }
        }
    }
}

#[async_trait]
impl FrameSink for Subprocess {
    /// Serialize the frame to one newline-terminated line and write it under
    /// the stdin lock, so concurrent submissions never interleave on the wire.
    async fn submit(&self, frame: &Value) -> Result<(), AppError> {
        if !self.is_alive() {
            return Err(AppError::ChildGone);
        }

        let mut line = serde_json::to_vec(frame)
            .map_err(|err| AppError::internal(format!("frame serialization failed: {err}")))?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        };
        if let Err(err) = write.await {
            self.mark_exited();
            warn!(error = %err, "write to child stdin failed");
            return Err(AppError::ChildGone);
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn config_for(command: &str, args: &[&str]) -> Config {
        Config {
            child_command: command.to_string(),
            child_args: args.iter().map(|arg| arg.to_string()).collect(),
            child_token: None,
            child_token_var: "BRIDGE_TOKEN".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 0,
            request_timeout: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn submit_writes_one_parseable_line() {
        let (subprocess, pipes) = Subprocess::spawn(&config_for("cat", &[])).expect("spawn cat");
        let mut lines = BufReader::new(pipes.stdout).lines();

        let frame = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        subprocess.submit(&frame).await.expect("submit");

        let echoed = lines
            .next_line()
            .await
            .expect("read line")
            .expect("line present");
        let parsed: Value = serde_json::from_str(&echoed).expect("echoed line is valid json");
        assert_eq!(parsed, frame);

        subprocess.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn concurrent_submissions_do_not_interleave() {
        let (subprocess, pipes) = Subprocess::spawn(&config_for("cat", &[])).expect("spawn cat");
        let mut lines = BufReader::new(pipes.stdout).lines();

        let count = 24usize;
        let mut tasks = Vec::new();
        for n in 0..count {
            let subprocess = Arc::clone(&subprocess);
            tasks.push(tokio::spawn(async move {
                let frame = json!({
                    "jsonrpc": "2.0",
                    "id": n,
                    "method": "ping",
                    "params": {"payload": "x".repeat(512)}
                });
                subprocess.submit(&frame).await
            }));
        }
        for task in tasks {
            task.await.expect("task join").expect("submit");
        }

        let mut seen_ids = std::collections::HashSet::new();
        for _ in 0..count {
            let line = lines
                .next_line()
                .await
                .expect("read line")
                .expect("line present");
            let parsed: Value =
                serde_json::from_str(&line).expect("every line parses independently");
            let id = parsed["id"].as_u64().expect("numeric id");
            assert!(seen_ids.insert(id), "id {id} written twice");
        }
        assert_eq!(seen_ids.len(), count);

        subprocess.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn submit_fails_after_child_exit() {
        let (subprocess, _pipes) = Subprocess::spawn(&config_for("true", &[])).expect("spawn");

        // The child exits immediately; the broken pipe surfaces on write.
        let frame = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let mut failed = false;
        for _ in 0..50 {
            match subprocess.submit(&frame).await {
                Err(AppError::ChildGone) => {
                    failed = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
                Ok(()) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert!(failed, "submit kept succeeding after child exit");
        assert!(!subprocess.is_alive());
    }

    #[tokio::test]
    async fn submit_fails_fast_once_marked_exited() {
        let (subprocess, _pipes) = Subprocess::spawn(&config_for("cat", &[])).expect("spawn cat");
        subprocess.mark_exited();

        let frame = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let err = subprocess.submit(&frame).await.expect_err("must fail");
        assert!(matches!(err, AppError::ChildGone));

        subprocess.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn shutdown_terminates_child_within_grace() {
        let (subprocess, _pipes) = Subprocess::spawn(&config_for("cat", &[])).expect("spawn cat");
        subprocess.shutdown(Duration::from_secs(5)).await;
        assert!(!subprocess.is_alive());
    }

    #[tokio::test]
    async fn credential_reaches_child_environment() {
        use crate::config::Secret;

        let mut config = config_for("sh", &["-c", "printf '%s' \"$BRIDGE_TOKEN\""]);
        config.child_token = Some(Secret::new("tok-123"));

        let (_subprocess, pipes) = Subprocess::spawn(&config).expect("spawn sh");
        let mut output = String::new();
        let mut reader = BufReader::new(pipes.stdout);
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut output)
            .await
            .expect("read child output");
        assert_eq!(output, "tok-123");
    }
}
