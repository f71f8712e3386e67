//! The real-time delivery core: a process-wide registry of live chat
//! sockets, a best-effort dispatcher that pushes persisted messages to
//! them, and the WebSocket gateway that binds authenticated users to
//! registry entries.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use planora_core::PushFrame;
use planora_storage::ChatMessage;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore},
    time::timeout,
};
use uuid::Uuid;

use crate::{config::ChatConfig, AppState};
#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;

/// One live chat socket. The sender side feeds the socket task's outbound
/// pump; `connection_id` distinguishes this connection from any other the
/// same user opens, which is what makes compare-and-delete unregistration
/// possible.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<PushFrame>,
}

impl ConnectionHandle {
    pub fn open() -> (Self, mpsc::UnboundedReceiver<PushFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                connection_id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue a frame for the socket task. Returns `false` when the task
    /// has already gone away; the caller must not treat that as cause to
    /// touch the registry.
    pub fn push(&self, frame: PushFrame) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// Identity -> live connection. At most one entry per user: a reconnect
/// overwrites, and the displaced handle is simply orphaned (its socket
/// task winds down on its own).
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, identity: Uuid, handle: ConnectionHandle) {
        self.connections.write().await.insert(identity, handle);
    }

    /// Remove the entry only if it still names `connection_id`. A stale
    /// close handler racing a fast reconnect therefore cannot evict the
    /// newer connection's entry. Absent or mismatched entries are a no-op.
    pub async fn unregister(&self, identity: Uuid, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&identity) {
            Some(current) if current.connection_id == connection_id => {
                connections.remove(&identity);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, identity: Uuid) -> Option<ConnectionHandle> {
        self.connections.read().await.get(&identity).cloned()
    }

    pub async fn live_connections(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// Why a delivery attempt did not reach the recipient. Neither case is an
/// error: persistence has already succeeded and history remains the
/// system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    RecipientOffline,
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Skipped(SkipReason),
}

impl DeliveryOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }

    #[cfg(feature = "metrics")]
    fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Skipped(SkipReason::RecipientOffline) => "recipient_offline",
            DeliveryOutcome::Skipped(SkipReason::ChannelClosed) => "channel_closed",
        }
    }
}

/// Fire-and-forget push of an already-persisted message to its recipient's
/// live socket, if one exists. Never retries and never mutates the
/// registry; a dead handle is cleaned up by its own socket task's exit.
#[derive(Clone)]
pub struct PushDispatcher {
    registry: Arc<ConnectionRegistry>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl PushDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn deliver(&self, message: &ChatMessage) -> DeliveryOutcome {
        let outcome = match self.registry.lookup(message.recipient).await {
            None => DeliveryOutcome::Skipped(SkipReason::RecipientOffline),
            Some(handle) => {
                if handle.push(PushFrame::chat(message)) {
                    DeliveryOutcome::Delivered
                } else {
                    DeliveryOutcome::Skipped(SkipReason::ChannelClosed)
                }
            }
        };

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_push_delivery(outcome.label());
        }

        outcome
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatSocketQuery {
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
struct SocketErrorBody<'a> {
    error: &'a str,
}

/// Owns the socket lifecycle: token check before upgrade, register on
/// bind, pump until close or terminal error, unregister exactly once on
/// the way out.
pub struct ChatGateway {
    registry: Arc<ConnectionRegistry>,
    semaphore: Arc<Semaphore>,
    send_timeout: Duration,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl ChatGateway {
    pub fn new(registry: Arc<ConnectionRegistry>, config: &ChatConfig) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn run_socket(
        self: Arc<Self>,
        identity: Uuid,
        mut socket: WebSocket,
        _permit: OwnedSemaphorePermit,
    ) {
        let (handle, mut frames) = ConnectionHandle::open();
        let connection_id = handle.connection_id();
        self.registry.register(identity, handle).await;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.websocket_opened();
        }
        tracing::info!(%identity, %connection_id, "chat socket bound");

        self.pump(identity, &mut socket, &mut frames).await;

        // The single unregister site for this connection. Compare-and-delete
        // keeps a fast reconnect's fresh entry intact.
        self.registry.unregister(identity, connection_id).await;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.websocket_closed();
        }
        tracing::info!(%identity, %connection_id, "chat socket closed");
    }

    async fn pump(
        &self,
        identity: Uuid,
        socket: &mut WebSocket,
        frames: &mut mpsc::UnboundedReceiver<PushFrame>,
    ) {
        let ack = PushFrame::status("Connected!");
        if socket
            .send(WsMessage::Text(ack.to_text().into()))
            .await
            .is_err()
        {
            return;
        }

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    match timeout(
                        self.send_timeout,
                        socket.send(WsMessage::Text(frame.to_text().into())),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(%identity, ?err, "chat socket send failed");
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(%identity, "chat socket send timed out");
                            break;
                        }
                    }
                }
                message = socket.recv() => {
                    match message {
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(%identity, ?err, "chat socket transport error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// `GET /api/v1/chat/ws?token=...` — the credential is re-validated here,
/// before the upgrade; a bare claimed identity is never trusted.
pub async fn chat_socket(
    State(state): State<AppState>,
    Query(query): Query<ChatSocketQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    #[cfg(feature = "metrics")]
    let route = "chat.ws";

    let Some(token) = query.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
        let status = StatusCode::UNAUTHORIZED;
        #[cfg(feature = "metrics")]
        state.record_http_request(route, status.as_u16());
        return (status, Json(SocketErrorBody { error: "missing_token" })).into_response();
    };

    let account = match state.session().authorize(token).await {
        Ok(account) => account,
        Err(err) => {
            let status = err.status();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(?err, "failed to authorize chat socket");
            }
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            return (status, Json(SocketErrorBody { error: "unauthorized" })).into_response();
        }
    };

    let gateway = state.gateway();
    match gateway.semaphore.clone().try_acquire_owned() {
        Ok(permit) => {
            #[cfg(feature = "metrics")]
            state.record_http_request(route, StatusCode::SWITCHING_PROTOCOLS.as_u16());
            ws.on_upgrade(move |socket| gateway.run_socket(account.id, socket, permit))
        }
        Err(_) => {
            let status = StatusCode::TOO_MANY_REQUESTS;
            tracing::warn!(identity = %account.id, "chat connection limit reached");
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            (status, Json(SocketErrorBody { error: "connection_limit_reached" }))
                .into_response()
        }
    }
}
