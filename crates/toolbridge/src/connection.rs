//! Connection identity, lifecycle state, activity tracking and connect
//! parameter validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::BridgeError;
use crate::transport::TransportKind;

/// Opaque identifier of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a connection.
///
/// Only `Open` connections are ever visible in the registry: a connection is
/// inserted after its transport is established and removed before it is
/// closed. `Connecting` and `Closed` exist for snapshots and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-activity timestamp shared between a connection's transport and the
/// supervisor.
///
/// Touched on every inbound frame or event and on every issued call. Uses
/// tokio's clock so paused-time tests can drive staleness.
#[derive(Debug)]
pub struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Instant> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn touch(&self) {
        *self.lock() = Instant::now();
    }

    pub fn last(&self) -> Instant {
        *self.lock()
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last())
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub kind: TransportKind,
    pub state: ConnectionState,
    pub idle_for: Duration,
}

/// Parameters for spawning a stdio endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StdioParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Merged over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl StdioParams {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Parameters for subscribing to an event-stream endpoint.
#[derive(Debug, Clone)]
pub struct EventStreamParams {
    pub url: Url,
    pub headers: HeaderMap,
    /// Where calls are POSTed. May also be announced by the remote with an
    /// `endpoint` event.
    pub post_url: Option<Url>,
}

#[derive(Deserialize)]
struct RawEventStreamParams {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default, alias = "postUrl")]
    post_url: Option<String>,
}

impl EventStreamParams {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
            post_url: None,
        }
    }

    pub fn with_post_url(mut self, post_url: Url) -> Self {
        self.post_url = Some(post_url);
        self
    }
}

fn parse_http_url(field: &str, raw: &str) -> Result<Url, BridgeError> {
    let url = Url::parse(raw)
        .map_err(|e| BridgeError::invalid(format!("{field} '{raw}' is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(BridgeError::invalid(format!(
            "{field} '{raw}' has unsupported scheme '{other}'"
        ))),
    }
}

fn parse_headers(raw: HashMap<String, String>) -> Result<HeaderMap, BridgeError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for (name, value) in raw {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| BridgeError::invalid(format!("invalid header name '{name}'")))?;
        let header_value = HeaderValue::from_str(&value)
            .map_err(|_| BridgeError::invalid(format!("invalid value for header '{name}'")))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

/// Validated connect request.
#[derive(Debug, Clone)]
pub enum ConnectSpec {
    Stdio(StdioParams),
    EventStream(EventStreamParams),
}

impl ConnectSpec {
    /// Validate a `(kind, params)` pair as received from a caller.
    ///
    /// All validation happens here, before any resource is created.
    pub fn parse(kind: &str, params: &Value) -> Result<Self, BridgeError> {
        let kind: TransportKind = kind.parse()?;
        if !params.is_object() {
            return Err(BridgeError::invalid(format!(
                "{kind} connection parameters must be an object"
            )));
        }

        match kind {
            TransportKind::Stdio => {
                let params: StdioParams = serde_json::from_value(params.clone()).map_err(|e| {
                    BridgeError::invalid(format!("invalid stdio parameters: {e}"))
                })?;
                Self::stdio(params)
            }
            TransportKind::EventStream => {
                let raw: RawEventStreamParams =
                    serde_json::from_value(params.clone()).map_err(|e| {
                        BridgeError::invalid(format!("invalid event-stream parameters: {e}"))
                    })?;
                let url = parse_http_url("url", &raw.url)?;
                let post_url = raw
                    .post_url
                    .as_deref()
                    .map(|p| url.join(p).map_err(|e| {
                        BridgeError::invalid(format!("post_url '{p}' is not a valid URL: {e}"))
                    }))
                    .transpose()?;
                Ok(Self::EventStream(EventStreamParams {
                    url,
                    headers: parse_headers(raw.headers)?,
                    post_url,
                }))
            }
        }
    }

    pub fn stdio(params: StdioParams) -> Result<Self, BridgeError> {
        if params.command.trim().is_empty() {
            return Err(BridgeError::invalid(
                "stdio connection requires a non-empty command",
            ));
        }
        Ok(Self::Stdio(params))
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio(_) => TransportKind::Stdio,
            Self::EventStream(_) => TransportKind::EventStream,
        }
    }
}
