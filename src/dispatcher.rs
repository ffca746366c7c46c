//! Background readers for the child's output streams
//!
//! One task reads stdout and routes each reply line to the session that
//! registered the matching request id. A second task drains stderr so the
//! child never blocks on a full diagnostic pipe. A third task reaps pending
//! entries older than the configured bound.
//!
//! A malformed or unmatched line is logged and skipped; nothing the child
//! prints can terminate these loops before end-of-stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use crate::registry::PendingRegistry;
use crate::rpc::{timeout_error_frame, Frame};
use crate::subprocess::Subprocess;

const SWEEP_PERIOD: Duration = Duration::from_secs(5);

/// Route one stdout line to its pending session, if any.
pub fn dispatch_line(line: &str, pending: &PendingRegistry) {
    if line.trim().is_empty() {
        return;
    }

    let frame: Frame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "discarding unparseable line from child stdout");
            return;
        }
    };

    let Some(id) = frame.correlation_id() else {
        warn!("discarding child frame without an id");
        return;
    };

    let Some(entry) = pending.take(id) else {
        // Already delivered, orphaned and reaped, or an id we never issued.
        warn!(request_id = %id, "discarding reply with no pending request");
        return;
    };

    match entry.reply_tx.try_send(line.to_string()) {
        Ok(()) => {}
        Err(TrySendError::Closed(_)) => {
            // Session disconnected before its reply arrived. Expected
            // steady-state behavior; the reply is dropped, not redelivered.
            debug!(request_id = %id, session_id = %entry.session_id, "session gone, reply dropped");
        }
        Err(TrySendError::Full(_)) => {
            // Unlike a closed channel, a full one means a connected session
            // lost a reply it was owed. Loud on purpose.
            error!(request_id = %id, session_id = %entry.session_id, "session channel full, reply dropped");
        }
    }
}

/// Read the child's stdout until end-of-stream, dispatching one frame per
/// line. EOF means the child exited; the liveness flag is cleared so later
/// submissions fail instead of hanging.
pub async fn run_stdout_loop(
    stdout: ChildStdout,
    pending: Arc<PendingRegistry>,
    subprocess: Arc<Subprocess>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_line(&line, &pending),
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "reading child stdout failed");
                break;
            }
        }
    }
    subprocess.mark_exited();
    warn!("child stdout closed, no further replies will be delivered");
}

/// Consume the child's stderr so it can never block on a full pipe.
pub async fn run_stderr_drain(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(child_stderr = %line, "child diagnostic");
    }
    debug!("child stderr closed");
}

/// Periodically remove pending entries older than `bound`, pushing a
/// synthesized timeout error to the owning session.
pub async fn run_expiry_sweep(pending: Arc<PendingRegistry>, bound: Duration) {
    let mut ticker = tokio::time::interval(SWEEP_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for (id, entry) in pending.sweep_expired(bound) {
            warn!(
                request_id = %id,
                session_id = %entry.session_id,
                age_secs = entry.registered_at.elapsed().as_secs(),
                "pending request expired"
            );
            let _ = entry.reply_tx.try_send(timeout_error_frame(&id));
        }
    }
}
