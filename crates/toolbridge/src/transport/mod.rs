//! Transports to remote tool endpoints.
//!
//! - **stdio**: child process speaking newline-delimited JSON over its pipes
//! - **event_stream**: server-sent event subscription over HTTP
//!
//! Both expose the same [`Transport`] capability surface to the supervisor.
//! Transports report their own termination through [`TransportContext`] so
//! the supervisor can evict them without waiting for the next access.

pub mod event_stream;
pub mod stdio;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::codec::Frame;
use crate::connection::{Activity, ConnectionId};
use crate::error::{BridgeError, CallError};

pub use event_stream::EventStreamTransport;
pub use stdio::StdioTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    EventStream,
    Stdio,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventStream => "event-stream",
            Self::Stdio => "stdio",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event-stream" | "sse" => Ok(Self::EventStream),
            "stdio" => Ok(Self::Stdio),
            other => Err(BridgeError::invalid(format!(
                "unknown transport kind '{other}' (expected 'stdio' or 'event-stream')"
            ))),
        }
    }
}

/// Capability surface shared by all transports.
///
/// Exists so the supervisor can hold heterogeneous transports and tests can
/// substitute a mock.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether `call` can currently be issued.
    fn supports_call(&self) -> bool;

    /// Issue one request and wait up to `timeout` for its outcome.
    async fn call(
        &self,
        operation: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, CallError>;

    /// Release the transport's resources. Idempotent.
    async fn close(&self);

    /// True once the transport has terminated, by `close` or on its own.
    fn is_closed(&self) -> bool;
}

/// Unsolicited message from an endpoint: an event-stream delivery or a stdio
/// notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub connection_id: ConnectionId,
    pub kind: TransportKind,
    /// SSE event name; `None` for stdio notifications.
    pub event: Option<String>,
    pub payload: Frame,
}

pub type MessageSink = Arc<dyn Fn(PushMessage) + Send + Sync>;

/// Per-connection wiring handed to a transport when it is opened.
#[derive(Clone)]
pub struct TransportContext {
    pub connection_id: ConnectionId,
    pub activity: Arc<Activity>,
    sink: MessageSink,
    terminated: mpsc::UnboundedSender<ConnectionId>,
}

impl TransportContext {
    pub fn new(
        connection_id: ConnectionId,
        activity: Arc<Activity>,
        sink: MessageSink,
        terminated: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self {
            connection_id,
            activity,
            sink,
            terminated,
        }
    }

    pub(crate) fn deliver(&self, kind: TransportKind, event: Option<String>, payload: Frame) {
        (self.sink)(PushMessage {
            connection_id: self.connection_id,
            kind,
            event,
            payload,
        });
    }

    /// Tell the owner this transport died on its own.
    pub(crate) fn notify_terminated(&self) {
        if self.terminated.send(self.connection_id).is_err() {
            tracing::debug!(connection_id = %self.connection_id, "Termination receiver gone");
        }
    }
}
