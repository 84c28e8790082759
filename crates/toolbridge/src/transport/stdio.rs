//! Stdio transport - a child process speaking newline-delimited JSON.
//!
//! Requests are written to the child's stdin; its stdout is decoded by
//! [`JsonLinesCodec`] and routed either to the correlator (frames with an
//! `id`) or to the push sink. Stderr is never parsed: it is logged under the
//! `toolbridge::stderr` target and a short tail is kept for error reports.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportContext, TransportKind};
use crate::bridge::codec::{CodecError, Frame, JsonLinesCodec};
use crate::bridge::protocol::{Inbound, Request};
use crate::config::BridgeConfig;
use crate::connection::{ConnectionId, StdioParams};
use crate::correlator::RequestCorrelator;
use crate::error::CallError;

/// How long a failing reader waits for stderr to reach EOF before reporting.
const STDERR_DRAIN: Duration = Duration::from_millis(250);
const STDERR_MAX_LINE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("child {0} was not captured")]
    MissingPipe(&'static str),
}

/// Ring of the most recent stderr lines.
struct StderrTail {
    lines: StdMutex<VecDeque<String>>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: StdMutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn render(&self) -> Option<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.is_empty() {
            return None;
        }
        Some(lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n"))
    }
}

/// State shared between the transport handle and its reader tasks.
struct StdioShared {
    connection_id: ConnectionId,
    correlator: Arc<RequestCorrelator>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    stderr_tail: StderrTail,
    child: Mutex<Option<Child>>,
}

impl StdioShared {
    /// Tear down after the endpoint died or broke protocol.
    ///
    /// No-op if the transport was already closed.
    fn fail(&self, ctx: &TransportContext, reason: String) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut reason = reason;
        if let Ok(mut guard) = self.child.try_lock()
            && let Some(child) = guard.as_mut()
        {
            match child.try_wait() {
                Ok(Some(status)) => reason = format!("{reason} ({status})"),
                _ => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(connection_id = %self.connection_id, error = %e, "Failed to kill endpoint process");
                    }
                }
            }
        }
        if let Some(tail) = self.stderr_tail.render() {
            reason = format!("{reason}; stderr tail:\n{tail}");
        }

        tracing::warn!(connection_id = %self.connection_id, %reason, "Stdio transport terminated");
        self.shutdown.cancel();
        self.correlator.cancel_all(&reason);
        ctx.notify_terminated();
    }
}

pub struct StdioTransport {
    shared: Arc<StdioShared>,
    writer: Mutex<Option<FramedWrite<ChildStdin, JsonLinesCodec>>>,
    ctx: TransportContext,
    kill_grace: Duration,
}

impl StdioTransport {
    /// Spawn the endpoint process and start its reader tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        params: &StdioParams,
        config: &BridgeConfig,
        ctx: TransportContext,
    ) -> Result<Self, SpawnError> {
        let mut command = Command::new(&params.command);
        command
            .args(&params.args)
            .envs(&params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
            command: params.command.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        tracing::info!(
            connection_id = %ctx.connection_id,
            command = %params.command,
            pid = ?child.id(),
            "Spawned stdio endpoint"
        );

        let shared = Arc::new(StdioShared {
            connection_id: ctx.connection_id,
            correlator: RequestCorrelator::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            stderr_tail: StderrTail::new(config.stderr_tail_lines),
            child: Mutex::new(Some(child)),
        });

        let stderr_closed = CancellationToken::new();
        tokio::spawn(pump_stderr(
            stderr,
            Arc::clone(&shared),
            stderr_closed.clone(),
        ));
        tokio::spawn(read_stdout(
            FramedRead::new(stdout, JsonLinesCodec::new(config.max_frame_bytes)),
            Arc::clone(&shared),
            ctx.clone(),
            stderr_closed,
        ));

        Ok(Self {
            shared,
            writer: Mutex::new(Some(FramedWrite::new(
                stdin,
                JsonLinesCodec::new(config.max_frame_bytes),
            ))),
            ctx,
            kill_grace: config.kill_grace,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.ctx.connection_id
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn supports_call(&self) -> bool {
        true
    }

    async fn call(
        &self,
        operation: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        // One deadline covers waiting for the writer, the write and the reply.
        let deadline = Instant::now() + timeout;
        let pending = self.shared.correlator.register()?;
        let request = Request {
            id: pending.id(),
            operation,
            arguments: &arguments,
        };

        let write = async {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(CallError::Closed("stdio transport is closed".to_string()));
            };
            Ok(writer.send(request).await)
        };
        // A frame is encoded whole into the write buffer before flushing, so
        // abandoning a stalled flush never leaves a partial line behind.
        let sent = match tokio::time::timeout_at(deadline, write).await {
            Ok(sent) => sent?,
            Err(_) => {
                tracing::debug!(
                    connection_id = %self.ctx.connection_id,
                    request_id = %pending.id(),
                    %operation,
                    ?timeout,
                    "Request timed out while writing to endpoint"
                );
                return Err(CallError::Timeout(timeout));
            }
        };

        match sent {
            Ok(()) => {}
            Err(CodecError::FrameTooLarge { len, max }) => {
                return Err(CallError::InvalidRequest(format!(
                    "request of {len} bytes exceeds frame limit of {max} bytes"
                )));
            }
            Err(CodecError::Encode(e)) => {
                return Err(CallError::InvalidRequest(format!(
                    "arguments could not be encoded: {e}"
                )));
            }
            Err(CodecError::Io(e)) => {
                // The pending slot receives the failure reason from cancel_all.
                self.shared
                    .fail(&self.ctx, format!("failed to write to endpoint: {e}"));
            }
        }

        tracing::debug!(
            connection_id = %self.ctx.connection_id,
            request_id = %pending.id(),
            %operation,
            "Request sent"
        );
        pending.wait_until(deadline, timeout).await
    }

    async fn close(&self) {
        let first = !self.shared.closed.swap(true, Ordering::SeqCst);
        self.shared.shutdown.cancel();
        self.shared.correlator.cancel_all("connection closed");

        // Closing stdin lets well-behaved endpoints exit on EOF. A writer
        // stuck on a full pipe is released once the child is gone.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        let child = self.shared.child.lock().await.take();
        if let Some(child) = child {
            terminate_child(self.ctx.connection_id, child, self.kill_grace).await;
        }

        if first {
            tracing::info!(connection_id = %self.ctx.connection_id, "Closed stdio connection");
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

fn route_frame(shared: &StdioShared, ctx: &TransportContext, frame: Frame) {
    match Inbound::classify(frame) {
        Inbound::Response { id, outcome } => {
            tracing::trace!(connection_id = %ctx.connection_id, request_id = %id, "Response received");
            shared.correlator.complete(&id, outcome);
        }
        Inbound::Notification(value) => {
            ctx.deliver(TransportKind::Stdio, None, Frame::Json(value));
        }
        Inbound::Raw(text) => {
            tracing::debug!(connection_id = %ctx.connection_id, "Non-JSON line on endpoint output");
            ctx.deliver(TransportKind::Stdio, None, Frame::Raw(text));
        }
    }
}

async fn read_stdout(
    mut reader: FramedRead<ChildStdout, JsonLinesCodec>,
    shared: Arc<StdioShared>,
    ctx: TransportContext,
    stderr_closed: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                tracing::debug!(connection_id = %ctx.connection_id, "Stdout reader stopping");
                return;
            }
            frame = reader.next() => match frame {
                Some(Ok(frame)) => {
                    ctx.activity.touch();
                    route_frame(&shared, &ctx, frame);
                }
                Some(Err(e)) => break format!("failed to read endpoint output: {e}"),
                None => break "endpoint process closed its output".to_string(),
            }
        }
    };

    // Give stderr a moment so the tail includes the child's last words.
    let _ = tokio::time::timeout(STDERR_DRAIN, stderr_closed.cancelled()).await;
    shared.fail(&ctx, reason);
}

async fn pump_stderr(stderr: ChildStderr, shared: Arc<StdioShared>, done: CancellationToken) {
    let _done = done.drop_guard();
    let connection_id = shared.connection_id;
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(STDERR_MAX_LINE));

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                tracing::debug!(target: "toolbridge::stderr", %connection_id, "{}", line);
                shared.stderr_tail.push(line);
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::debug!(target: "toolbridge::stderr", %connection_id, "Dropped oversized stderr line");
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::debug!(%connection_id, error = %e, "Stderr read failed");
                break;
            }
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate_child(connection_id: ConnectionId, mut child: Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(%connection_id, %status, "Endpoint process already exited");
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        send_sigterm(connection_id, pid);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(%connection_id, %status, "Endpoint process exited");
        }
        Ok(Err(e)) => {
            tracing::warn!(%connection_id, error = %e, "Failed to wait for endpoint process");
        }
        Err(_) => {
            tracing::warn!(%connection_id, ?grace, "Endpoint process did not exit after SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::error!(%connection_id, error = %e, "SIGKILL failed");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(connection_id: ConnectionId, pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(%connection_id, pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::captured_context;
    use serde_json::json;

    /// Answers every request with `{"pong": true}`, echoing its id.
    const PONG: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  printf '{"id":"%s","result":{"pong":true}}\n' "$id"
done"#;

    fn sh(script: &str) -> StdioParams {
        StdioParams::new("sh").with_args(["-c", script])
    }

    fn config() -> BridgeConfig {
        BridgeConfig::builtin().with_kill_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn call_round_trips_through_child() {
        let cap = captured_context();
        let transport = StdioTransport::spawn(&sh(PONG), &config(), cap.ctx.clone()).unwrap();

        let result = transport
            .call("ping", json!({}), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result, json!({"pong": true}));
        assert_eq!(transport.pending_requests(), 0);
        transport.close().await;
    }

    #[tokio::test]
    async fn notifications_and_raw_lines_reach_sink() {
        let cap = captured_context();
        let script = r#"echo '{"event":"progress","pct":50}'; echo 'plain log line'; sleep 5"#;
        let transport = StdioTransport::spawn(&sh(script), &config(), cap.ctx.clone()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while cap.messages.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let messages = cap.messages.lock().unwrap().clone();
        assert_eq!(
            messages[0].payload,
            Frame::Json(json!({"event": "progress", "pct": 50}))
        );
        assert_eq!(messages[0].event, None);
        assert_eq!(messages[0].kind, TransportKind::Stdio);
        assert_eq!(messages[1].payload, Frame::Raw("plain log line".to_string()));
        transport.close().await;
    }

    #[tokio::test]
    async fn child_exit_reports_stderr_tail() {
        let mut cap = captured_context();
        let script = "echo 'fatal: missing config' >&2; exit 3";
        let transport = StdioTransport::spawn(&sh(script), &config(), cap.ctx.clone()).unwrap();

        let dead = tokio::time::timeout(Duration::from_secs(5), cap.terminated.recv())
            .await
            .unwrap();

        assert_eq!(dead, Some(cap.ctx.connection_id));
        assert!(transport.is_closed());
        match transport.call("ping", json!({}), Duration::from_secs(1)).await {
            Err(CallError::Closed(reason)) => {
                assert!(reason.contains("fatal: missing config"), "{reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        transport.close().await;
    }

    #[tokio::test]
    async fn oversized_frame_terminates_transport() {
        let mut cap = captured_context();
        let script = format!("echo {}; sleep 5", "x".repeat(64));
        let config = config().with_max_frame_bytes(16);
        let transport = StdioTransport::spawn(&sh(&script), &config, cap.ctx.clone()).unwrap();

        let dead = tokio::time::timeout(Duration::from_secs(5), cap.terminated.recv())
            .await
            .unwrap();

        assert_eq!(dead, Some(cap.ctx.connection_id));
        assert!(transport.is_closed());
        transport.close().await;
    }

    #[tokio::test]
    async fn pending_call_fails_when_child_exits() {
        let cap = captured_context();
        let transport =
            StdioTransport::spawn(&sh("read -r line; exit 0"), &config(), cap.ctx.clone())
                .unwrap();

        let err = transport
            .call("ping", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Closed(_)), "{err:?}");
        transport.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_cancels_pending() {
        let cap = captured_context();
        let transport = Arc::new(
            StdioTransport::spawn(&sh("cat > /dev/null"), &config(), cap.ctx.clone()).unwrap(),
        );

        let caller = Arc::clone(&transport);
        let call = tokio::spawn(async move {
            caller.call("slow", json!({}), Duration::from_secs(30)).await
        });
        while transport.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        transport.close().await;
        transport.close().await;

        let outcome = call.await.unwrap();
        assert!(matches!(outcome, Err(CallError::Closed(_))));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let cap = captured_context();
        let params = StdioParams::new("/nonexistent/toolbridge-endpoint");

        let err = StdioTransport::spawn(&params, &config(), cap.ctx).err().unwrap();

        assert!(matches!(err, SpawnError::Spawn { .. }));
    }
}
