//! Error types for bridge operations.
//!
//! [`CallError`] is what transports and the correlator produce; it knows
//! nothing about which connection or operation it belongs to. The supervisor
//! attaches that context and surfaces a [`BridgeError`].

use std::time::Duration;

use serde_json::Value;

use crate::bridge::protocol::RemoteError;
use crate::connection::ConnectionId;
use crate::transport::TransportKind;

/// Coarse classification of a [`BridgeError`], stable for callers to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    ConnectionNotFound,
    ConnectionFailed,
    Timeout,
    RemoteOperationError,
    TransportError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidParameter => "invalid_parameter",
            Self::ConnectionNotFound => "connection_not_found",
            Self::ConnectionFailed => "connection_failed",
            Self::Timeout => "timeout",
            Self::RemoteOperationError => "remote_operation_error",
            Self::TransportError => "transport_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Caller misuse: unknown kind, malformed parameters, unsupported call.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("failed to open {kind} connection: {reason}")]
    ConnectionFailed { kind: TransportKind, reason: String },

    /// The call timed out; the connection stays registered.
    #[error("operation '{operation}' on connection {connection_id} timed out after {timeout:?}")]
    Timeout {
        connection_id: ConnectionId,
        operation: String,
        timeout: Duration,
    },

    /// The endpoint answered with an error payload.
    #[error("operation '{operation}' on connection {connection_id} failed: {message}")]
    RemoteOperationError {
        connection_id: ConnectionId,
        operation: String,
        message: String,
        code: Option<i64>,
        payload: Value,
    },

    #[error("transport error on connection {connection_id} during '{operation}': {reason}")]
    TransportError {
        connection_id: ConnectionId,
        operation: String,
        reason: String,
    },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Self::ConnectionNotFound(_) => ErrorKind::ConnectionNotFound,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RemoteOperationError { .. } => ErrorKind::RemoteOperationError,
            Self::TransportError { .. } => ErrorKind::TransportError,
        }
    }

    /// Only timeouts leave the connection in a state where retrying the same
    /// call can make sense; everything else needs a caller decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::ConnectionNotFound(id)
            | Self::Timeout { connection_id: id, .. }
            | Self::RemoteOperationError { connection_id: id, .. }
            | Self::TransportError { connection_id: id, .. } => Some(*id),
            Self::InvalidParameter(_) | Self::ConnectionFailed { .. } => None,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}

/// Failure of a single call, before connection context is attached.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("remote error: {}", .0.message())]
    Remote(RemoteError),

    /// The connection went away while the call was pending, or before it
    /// could be issued.
    #[error("{0}")]
    Closed(String),

    #[error("request rejected: {0}")]
    InvalidRequest(String),

    #[error("transport does not support calls")]
    Unsupported,
}

impl CallError {
    pub(crate) fn into_bridge_error(
        self,
        connection_id: ConnectionId,
        operation: &str,
    ) -> BridgeError {
        let operation = operation.to_string();
        match self {
            Self::Timeout(timeout) => BridgeError::Timeout {
                connection_id,
                operation,
                timeout,
            },
            Self::Remote(err) => BridgeError::RemoteOperationError {
                connection_id,
                operation,
                message: err.message(),
                code: err.code(),
                payload: err.payload,
            },
            Self::Closed(reason) => BridgeError::TransportError {
                connection_id,
                operation,
                reason,
            },
            Self::InvalidRequest(reason) => BridgeError::InvalidParameter(format!(
                "operation '{operation}' on connection {connection_id}: {reason}"
            )),
            Self::Unsupported => BridgeError::InvalidParameter(format!(
                "connection {connection_id} does not support invoke"
            )),
        }
    }
}
