//! Connection supervisor - owns the registry of live connections.
//!
//! Separates connection lifecycle from callers, enabling:
//! - One uniform `invoke` over stdio and event-stream endpoints
//! - Eviction of dead transports as soon as they report termination
//! - Periodic eviction of connections idle past the stale threshold
//! - Lock-free concurrent access via DashMap
//!
//! A connection is inserted only after its transport is established and
//! removed before its transport is closed, so every registered connection is
//! open from the registry's point of view.

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{BridgeConfig, nonzero_sweep_interval};
use crate::connection::{
    Activity, ConnectSpec, ConnectionId, ConnectionInfo, ConnectionState,
};
use crate::error::BridgeError;
use crate::transport::{
    EventStreamTransport, MessageSink, PushMessage, StdioTransport, Transport, TransportContext,
    TransportKind,
};

struct ConnectionEntry {
    kind: TransportKind,
    transport: Arc<dyn Transport>,
    activity: Arc<Activity>,
}

type HandlerSlot = Arc<RwLock<Option<MessageSink>>>;

pub struct BridgeSupervisor {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    config: BridgeConfig,
    message_handler: HandlerSlot,
    terminated_tx: mpsc::UnboundedSender<ConnectionId>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeSupervisor {
    /// Create a supervisor and start its sweep and reaper tasks.
    ///
    /// Must be called from within a tokio runtime. Background tasks hold only
    /// a weak reference and stop when the supervisor is shut down or dropped.
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let (terminated_tx, terminated_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            connections: DashMap::new(),
            config,
            message_handler: Arc::new(RwLock::new(None)),
            terminated_tx,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        // The field is public, so a zero interval can bypass the builder.
        let sweep_interval = nonzero_sweep_interval(
            supervisor.config.sweep_interval,
            BridgeConfig::DEFAULT_SWEEP_INTERVAL,
        );
        let sweep = tokio::spawn(run_sweep(
            Arc::downgrade(&supervisor),
            sweep_interval,
            supervisor.config.stale_threshold,
            supervisor.shutdown.clone(),
        ));
        let reaper = tokio::spawn(run_reaper(
            Arc::downgrade(&supervisor),
            terminated_rx,
            supervisor.shutdown.clone(),
        ));
        supervisor.lock_tasks().extend([sweep, reaper]);

        supervisor
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Route every push delivery and stdio notification to `handler`.
    ///
    /// Replaces any previous handler. Applies to existing connections too.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(PushMessage) + Send + Sync + 'static,
    {
        let handler: MessageSink = Arc::new(handler);
        *self
            .message_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn clear_message_handler(&self) {
        *self
            .message_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn sink(&self) -> MessageSink {
        let handler = Arc::clone(&self.message_handler);
        Arc::new(move |message: PushMessage| {
            let handler = handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match handler {
                Some(handler) => handler(message),
                None => tracing::debug!(
                    connection_id = %message.connection_id,
                    event = ?message.event,
                    "No message handler registered, discarding push message"
                ),
            }
        })
    }

    /// Validate `(kind, params)`, open the transport and register it.
    pub async fn connect(&self, kind: &str, params: &Value) -> Result<ConnectionId, BridgeError> {
        let spec = ConnectSpec::parse(kind, params)?;
        self.connect_spec(spec).await
    }

    /// Open and register an already validated connection.
    pub async fn connect_spec(&self, spec: ConnectSpec) -> Result<ConnectionId, BridgeError> {
        let kind = spec.kind();
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::ConnectionFailed {
                kind,
                reason: "supervisor is shut down".to_string(),
            });
        }

        // The id exists before the transport so its tasks can report under it.
        let id = ConnectionId::new();
        let activity = Arc::new(Activity::new());
        let ctx = TransportContext::new(
            id,
            Arc::clone(&activity),
            self.sink(),
            self.terminated_tx.clone(),
        );
        tracing::debug!(connection_id = %id, %kind, state = %ConnectionState::Connecting, "Opening connection");

        let failed = |reason: String| BridgeError::ConnectionFailed { kind, reason };
        let transport: Arc<dyn Transport> = match spec {
            ConnectSpec::Stdio(params) => Arc::new(
                StdioTransport::spawn(&params, &self.config, ctx)
                    .map_err(|e| failed(e.to_string()))?,
            ),
            ConnectSpec::EventStream(params) => Arc::new(
                EventStreamTransport::open(&params, &self.config, ctx)
                    .await
                    .map_err(|e| failed(e.to_string()))?,
            ),
        };

        activity.touch();
        self.connections.insert(
            id,
            ConnectionEntry {
                kind,
                transport: Arc::clone(&transport),
                activity,
            },
        );

        // The transport may have died before it was registered, in which case
        // its termination notice found nothing to evict.
        if transport.is_closed() {
            self.connections.remove(&id);
            transport.close().await;
            return Err(failed("transport terminated during setup".to_string()));
        }

        tracing::info!(connection_id = %id, %kind, "Connection open");
        Ok(id)
    }

    /// Issue `operation` on a registered connection and await its result.
    ///
    /// `timeout` defaults to `config.call_timeout`. A timeout leaves the
    /// connection registered.
    pub async fn invoke(
        &self,
        id: &ConnectionId,
        operation: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let (kind, transport, activity) = {
            let entry = self
                .connections
                .get(id)
                .ok_or(BridgeError::ConnectionNotFound(*id))?;
            (
                entry.kind,
                Arc::clone(&entry.transport),
                Arc::clone(&entry.activity),
            )
        };

        // Issuance counts as activity whatever the outcome.
        activity.touch();
        if transport.is_closed() {
            self.evict_terminated(id).await;
            return Err(BridgeError::TransportError {
                connection_id: *id,
                operation: operation.to_string(),
                reason: "transport is closed".to_string(),
            });
        }
        if !transport.supports_call() {
            return Err(BridgeError::invalid(format!(
                "{kind} connection {id} does not support invoke"
            )));
        }

        let timeout = timeout.unwrap_or(self.config.call_timeout);
        tracing::debug!(connection_id = %id, %operation, ?timeout, "Invoking operation");

        match transport.call(operation, arguments, timeout).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let err = e.into_bridge_error(*id, operation);
                tracing::debug!(connection_id = %id, %operation, error = %err, "Invocation failed");
                if transport.is_closed() {
                    self.evict_terminated(id).await;
                }
                Err(err)
            }
        }
    }

    /// Close and forget a connection.
    pub async fn disconnect(&self, id: &ConnectionId) -> Result<(), BridgeError> {
        let (_, entry) = self
            .connections
            .remove(id)
            .ok_or(BridgeError::ConnectionNotFound(*id))?;
        tracing::info!(connection_id = %id, kind = %entry.kind, "Disconnecting");
        close_isolated(*id, entry.transport).await;
        Ok(())
    }

    /// Evict every connection idle for longer than `threshold`.
    ///
    /// Returns the ids that were evicted. Connections removed concurrently
    /// are skipped, and a failure closing one connection does not stop the
    /// sweep.
    pub async fn sweep_stale(&self, threshold: Duration) -> Vec<ConnectionId> {
        let candidates: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.activity.idle_for() > threshold)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Re-check under the shard lock: activity may have been touched since.
            let Some((_, entry)) = self
                .connections
                .remove_if(&id, |_, entry| entry.activity.idle_for() > threshold)
            else {
                continue;
            };
            tracing::info!(
                connection_id = %id,
                kind = %entry.kind,
                idle_for = ?entry.activity.idle_for(),
                "Evicting stale connection"
            );
            close_isolated(id, entry.transport).await;
            evicted.push(id);
        }
        evicted
    }

    /// Remove `id` if its transport has terminated.
    async fn evict_terminated(&self, id: &ConnectionId) {
        let removed = self
            .connections
            .remove_if(id, |_, entry| entry.transport.is_closed());
        if let Some((_, entry)) = removed {
            tracing::info!(connection_id = %id, kind = %entry.kind, "Evicting terminated connection");
            close_isolated(*id, entry.transport).await;
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(id).map(|entry| snapshot(*entry.key(), &entry))
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| snapshot(*entry.key(), &entry))
            .collect()
    }

    /// Stop background tasks and close every connection. Idempotent.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(connections = self.connections.len(), "Shutting down bridge supervisor");
        }
        self.shutdown.cancel();

        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "Supervisor task panicked");
            }
        }

        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.connections.remove(&id) {
                close_isolated(id, entry.transport).await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_transport(
        &self,
        transport: Arc<dyn Transport>,
        activity: Arc<Activity>,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.insert(
            id,
            ConnectionEntry {
                kind: transport.kind(),
                transport,
                activity,
            },
        );
        id
    }
}

impl Drop for BridgeSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn snapshot(id: ConnectionId, entry: &ConnectionEntry) -> ConnectionInfo {
    ConnectionInfo {
        id,
        kind: entry.kind,
        state: if entry.transport.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        },
        idle_for: entry.activity.idle_for(),
    }
}

/// Close a transport on its own task so a panic in one close cannot take
/// down the caller.
async fn close_isolated(id: ConnectionId, transport: Arc<dyn Transport>) {
    let closing = tokio::spawn(async move { transport.close().await });
    if let Err(e) = closing.await {
        tracing::error!(connection_id = %id, error = %e, "Closing connection failed");
    }
}

async fn run_sweep(
    supervisor: Weak<BridgeSupervisor>,
    interval: Duration,
    threshold: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                let evicted = supervisor.sweep_stale(threshold).await;
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "Stale sweep evicted connections");
                }
            }
        }
    }
    tracing::debug!("Stale sweep task exiting");
}

async fn run_reaper(
    supervisor: Weak<BridgeSupervisor>,
    mut terminated: mpsc::UnboundedReceiver<ConnectionId>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = terminated.recv() => {
                let Some(id) = next else {
                    break;
                };
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                supervisor.evict_terminated(&id).await;
            }
        }
    }
    tracing::debug!("Reaper task exiting");
}
