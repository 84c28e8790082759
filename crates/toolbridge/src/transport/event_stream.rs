//! Event-stream transport - a server-sent event subscription.
//!
//! Opening issues a GET and succeeds once the server answers 2xx. A
//! background task then forwards every event to the push sink, parsed as
//! JSON when possible and as text otherwise. The stream is never
//! reconnected: when it ends or errors the transport closes itself.
//!
//! Calls are only possible once a POST endpoint is known, either from the
//! connect parameters or from an `endpoint` event sent by the server. A call
//! is fire-and-forget; whatever the server produces in reply arrives as a
//! later push delivery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use reqwest::Url;
use reqwest::header::{ACCEPT, CACHE_CONTROL, HeaderValue};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportContext, TransportKind};
use crate::bridge::codec::decode_frame;
use crate::bridge::protocol::{RemoteError, Request, RequestId};
use crate::config::BridgeConfig;
use crate::connection::{ConnectionId, EventStreamParams};
use crate::error::CallError;

/// Event name a server uses to announce where calls should be POSTed.
pub const ENDPOINT_EVENT: &str = "endpoint";

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("server answered {0}")]
    Status(reqwest::StatusCode),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

struct EventStreamShared {
    connection_id: ConnectionId,
    url: Url,
    post_url: RwLock<Option<Url>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl EventStreamShared {
    fn post_url(&self) -> Option<Url> {
        self.post_url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_post_url(&self, url: Url) {
        *self.post_url.write().unwrap_or_else(PoisonError::into_inner) = Some(url);
    }

    /// Close after the stream ended or a request failed. No-op if already closed.
    fn terminate(&self, ctx: &TransportContext, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(connection_id = %self.connection_id, %reason, "Event stream terminated");
        self.shutdown.cancel();
        ctx.notify_terminated();
    }
}

pub struct EventStreamTransport {
    shared: Arc<EventStreamShared>,
    client: reqwest::Client,
    next_id: AtomicU64,
    ctx: TransportContext,
}

impl EventStreamTransport {
    /// Subscribe to `params.url`, waiting at most `config.connect_timeout`
    /// for the server to accept.
    pub async fn open(
        params: &EventStreamParams,
        config: &BridgeConfig,
        ctx: TransportContext,
    ) -> Result<Self, SubscribeError> {
        // No overall request timeout: it would cut the stream itself.
        let client = reqwest::Client::builder()
            .default_headers(params.headers.clone())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(SubscribeError::Client)?;

        let request = client
            .get(params.url.clone())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let response = match tokio::time::timeout(config.connect_timeout, request.send()).await {
            Err(_) => return Err(SubscribeError::Timeout(config.connect_timeout)),
            Ok(Err(e)) => return Err(SubscribeError::Request(e)),
            Ok(Ok(response)) => response,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(SubscribeError::Status(status));
        }

        tracing::info!(
            connection_id = %ctx.connection_id,
            url = %params.url,
            %status,
            "Subscribed to event stream"
        );

        let shared = Arc::new(EventStreamShared {
            connection_id: ctx.connection_id,
            url: params.url.clone(),
            post_url: RwLock::new(params.post_url.clone()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let events = Box::pin(response.bytes_stream().eventsource());
        tokio::spawn(pump_events(events, Arc::clone(&shared), ctx.clone()));

        Ok(Self {
            shared,
            client,
            next_id: AtomicU64::new(1),
            ctx,
        })
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Where calls are currently POSTed, if anywhere.
    pub fn post_url(&self) -> Option<Url> {
        self.shared.post_url()
    }
}

#[async_trait]
impl Transport for EventStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    fn supports_call(&self) -> bool {
        !self.is_closed() && self.shared.post_url().is_some()
    }

    async fn call(
        &self,
        operation: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        if self.is_closed() {
            return Err(CallError::Closed("event stream is closed".to_string()));
        }
        let Some(post_url) = self.shared.post_url() else {
            return Err(CallError::Unsupported);
        };

        let id = RequestId::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let body = Request {
            id: &id,
            operation,
            arguments: &arguments,
        };
        // The send and any rejection body share one deadline.
        let deadline = Instant::now() + timeout;
        let send = self.client.post(post_url).json(&body).send();

        let response = match tokio::time::timeout_at(deadline, send).await {
            Err(_) => return Err(CallError::Timeout(timeout)),
            Ok(Err(e)) => {
                let reason = format!("failed to post request: {e}");
                self.shared.terminate(&self.ctx, &reason);
                return Err(CallError::Closed(reason));
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let text = match tokio::time::timeout_at(deadline, response.text()).await {
                Ok(text) => text.unwrap_or_default(),
                Err(_) => return Err(CallError::Timeout(timeout)),
            };
            return Err(CallError::Remote(RemoteError::new(rejection_payload(
                status, text,
            ))));
        }

        tracing::debug!(
            connection_id = %self.ctx.connection_id,
            request_id = %id,
            %operation,
            "Request accepted by event-stream endpoint"
        );
        Ok(json!({"id": id, "accepted": true}))
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.cancel();
        tracing::info!(connection_id = %self.ctx.connection_id, "Closed event-stream connection");
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Error payload for a rejected POST: the body if it is a JSON object,
/// otherwise a synthesized `{status, message}`.
fn rejection_payload(status: reqwest::StatusCode, text: String) -> Value {
    match serde_json::from_str::<Value>(&text) {
        Ok(value @ Value::Object(_)) => value,
        _ => {
            let message = if text.trim().is_empty() {
                status.to_string()
            } else {
                text
            };
            json!({"status": status.as_u16(), "message": message})
        }
    }
}

fn handle_event(shared: &EventStreamShared, ctx: &TransportContext, event: Event) {
    if event.event == ENDPOINT_EVENT {
        match shared.url.join(event.data.trim()) {
            Ok(url) => {
                tracing::info!(connection_id = %ctx.connection_id, post_url = %url, "Event stream announced call endpoint");
                shared.set_post_url(url);
            }
            Err(e) => {
                tracing::warn!(connection_id = %ctx.connection_id, data = %event.data, error = %e, "Ignoring malformed endpoint event");
            }
        }
    }

    tracing::trace!(connection_id = %ctx.connection_id, event = %event.event, "Event received");
    let payload = decode_frame(event.data.as_bytes());
    ctx.deliver(TransportKind::EventStream, Some(event.event), payload);
}

async fn pump_events<S>(mut events: S, shared: Arc<EventStreamShared>, ctx: TransportContext)
where
    S: Stream<Item = Result<Event, EventStreamError<reqwest::Error>>> + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                tracing::debug!(connection_id = %ctx.connection_id, "Event pump stopping");
                return;
            }
            next = events.next() => match next {
                Some(Ok(event)) => {
                    ctx.activity.touch();
                    handle_event(&shared, &ctx, event);
                }
                Some(Err(e)) => break format!("event stream error: {e}"),
                None => break "event stream ended".to_string(),
            }
        }
    };
    shared.terminate(&ctx, &reason);
}
