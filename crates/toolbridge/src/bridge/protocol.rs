//! Wire protocol types for the stdio transport.
//!
//! - **Request** (bridge → endpoint): `{"id", "operation", "arguments"}`
//! - **Response** (endpoint → bridge): `{"id", "result"}` or `{"id", "error"}`
//! - **Notification** (endpoint → bridge): any object without an `id`
//!
//! Frames are classified by the presence of `id` only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::Frame;

/// Correlation id for one outgoing request.
///
/// Sent as a string; responses that echo it back as a number are matched by
/// their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Read an id from a decoded frame. `null` and non-scalar ids are treated
    /// as absent.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outgoing request frame.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub id: &'a RequestId,
    pub operation: &'a str,
    pub arguments: &'a Value,
}

/// Error payload returned by the remote endpoint, kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub payload: Value,
}

impl RemoteError {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// Human-readable message: `error.message`, the error itself if it is a
    /// string, or the serialized payload.
    pub fn message(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("message") {
                Some(Value::String(s)) => s.clone(),
                _ => self.payload.to_string(),
            },
            other => other.to_string(),
        }
    }

    pub fn code(&self) -> Option<i64> {
        self.payload.get("code").and_then(Value::as_i64)
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: RequestId,
        outcome: Result<Value, RemoteError>,
    },
    Notification(Value),
    /// Not JSON; delivered as text.
    Raw(String),
}

impl Inbound {
    pub fn classify(frame: Frame) -> Self {
        let value = match frame {
            Frame::Raw(text) => return Inbound::Raw(text),
            Frame::Json(value) => value,
        };

        let id = value.get("id").and_then(RequestId::from_wire);
        let Some(id) = id else {
            return Inbound::Notification(value);
        };

        let outcome = match value {
            Value::Object(mut map) => match map.remove("error") {
                Some(error) if !error.is_null() => Err(RemoteError::new(error)),
                _ => Ok(map.remove("result").unwrap_or(Value::Null)),
            },
            _ => Ok(Value::Null),
        };

        Inbound::Response { id, outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_wire_shape() {
        let id = RequestId::from(3);
        let arguments = json!({"path": "/tmp"});
        let request = Request {
            id: &id,
            operation: "read_file",
            arguments: &arguments,
        };

        let encoded = serde_json::to_value(&request).unwrap();

        assert_eq!(
            encoded,
            json!({"id": "3", "operation": "read_file", "arguments": {"path": "/tmp"}})
        );
    }

    #[test]
    fn classifies_result_response() {
        let inbound = Inbound::classify(Frame::Json(json!({"id": "1", "result": {"pong": true}})));

        assert_eq!(
            inbound,
            Inbound::Response {
                id: RequestId::new("1"),
                outcome: Ok(json!({"pong": true})),
            }
        );
    }

    #[test]
    fn classifies_error_response() {
        let inbound = Inbound::classify(Frame::Json(
            json!({"id": 2, "error": {"code": -32601, "message": "no such operation"}}),
        ));

        match inbound {
            Inbound::Response { id, outcome } => {
                assert_eq!(id.as_str(), "2");
                let err = outcome.unwrap_err();
                assert_eq!(err.message(), "no such operation");
                assert_eq!(err.code(), Some(-32601));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn null_error_is_success() {
        let inbound =
            Inbound::classify(Frame::Json(json!({"id": "4", "result": 5, "error": null})));

        assert!(matches!(inbound, Inbound::Response { outcome: Ok(v), .. } if v == json!(5)));
    }

    #[test]
    fn missing_or_null_id_is_notification() {
        let progress = json!({"event": "progress", "pct": 50});
        assert_eq!(
            Inbound::classify(Frame::Json(progress.clone())),
            Inbound::Notification(progress)
        );

        let null_id = json!({"id": null, "event": "log"});
        assert_eq!(
            Inbound::classify(Frame::Json(null_id.clone())),
            Inbound::Notification(null_id)
        );
    }

    #[test]
    fn raw_frames_stay_raw() {
        assert_eq!(
            Inbound::classify(Frame::Raw("hello".to_string())),
            Inbound::Raw("hello".to_string())
        );
    }

    #[test]
    fn remote_error_message_fallbacks() {
        assert_eq!(RemoteError::new(json!("boom")).message(), "boom");
        assert_eq!(
            RemoteError::new(json!({"detail": "x"})).message(),
            r#"{"detail":"x"}"#
        );
        assert_eq!(RemoteError::new(json!({"detail": "x"})).code(), None);
    }
}
