//! Chat persistence and the HTTP half of the messaging path. Sending a
//! message always writes to the store first; only then is a push at the
//! recipient's live socket attempted. History is the system of record,
//! push is an accelerator.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use planora_storage::{ChatMessage, ChatRepository, StoragePool};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    realtime::{DeliveryOutcome, PushDispatcher},
    session::AccountStore,
    AppState,
};

/// Message persistence seam, Postgres-backed in production and in-memory
/// when no database is configured.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(
        &self,
        sender: Uuid,
        recipient: Uuid,
        event_id: Uuid,
        text: &str,
    ) -> Result<ChatMessage>;
    /// Every message the user sent or received, oldest first.
    async fn history_for(&self, user_id: Uuid) -> Result<Vec<ChatMessage>>;
}

#[derive(Default)]
pub struct InMemoryChatStore {
    messages: RwLock<Vec<ChatMessage>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn append(
        &self,
        sender: Uuid,
        recipient: Uuid,
        event_id: Uuid,
        text: &str,
    ) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender,
            recipient,
            event_id,
            text: text.to_string(),
            created_at: Utc::now(),
        };
        self.messages.write().await.push(message.clone());
        Ok(message)
    }

    async fn history_for(&self, user_id: Uuid) -> Result<Vec<ChatMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.sender == user_id || m.recipient == user_id)
            .cloned()
            .collect())
    }
}

pub struct PostgresChatStore {
    repository: Arc<ChatRepository>,
}

impl PostgresChatStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            repository: ChatRepository::new(pool),
        }
    }
}

#[async_trait]
impl ChatStore for PostgresChatStore {
    async fn append(
        &self,
        sender: Uuid,
        recipient: Uuid,
        event_id: Uuid,
        text: &str,
    ) -> Result<ChatMessage> {
        self.repository
            .append_message(sender, recipient, event_id, text)
            .await
    }

    async fn history_for(&self, user_id: Uuid) -> Result<Vec<ChatMessage>> {
        self.repository.messages_for_user(user_id).await
    }
}

/// Persist-then-deliver. The store write is authoritative; the push is
/// best effort and its outcome is surfaced, never retried.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    dispatcher: PushDispatcher,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, dispatcher: PushDispatcher) -> Self {
        Self { store, dispatcher }
    }

    pub async fn send(
        &self,
        sender: Uuid,
        recipient: Uuid,
        event_id: Uuid,
        text: &str,
    ) -> Result<(ChatMessage, DeliveryOutcome)> {
        let message = self.store.append(sender, recipient, event_id, text).await?;
        let outcome = self.dispatcher.deliver(&message).await;
        tracing::debug!(
            message_id = %message.id,
            recipient = %message.recipient,
            delivered = outcome.delivered(),
            "chat message stored"
        );
        Ok((message, outcome))
    }

    pub async fn history_for(&self, user_id: Uuid) -> Result<Vec<ChatMessage>> {
        self.store.history_for(user_id).await
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender: Uuid,
    pub recipient: Uuid,
    pub event_id: Uuid,
    pub text: String,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    message: ChatMessage,
    delivered: bool,
}

/// Point-in-time account view attached to each history entry. Accounts
/// deleted since the message was written show as "Unknown".
#[derive(Debug, Serialize)]
pub struct AccountSnapshot {
    pub id: Uuid,
    pub username: String,
}

/// A history entry with both sides resolved at read time.
#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub sender_details: AccountSnapshot,
    pub recipient_details: AccountSnapshot,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    messages: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub async fn enrich_history(
    accounts: &dyn AccountStore,
    messages: Vec<ChatMessage>,
) -> Result<Vec<HistoryEntry>> {
    let mut ids: Vec<Uuid> = messages
        .iter()
        .flat_map(|m| [m.sender, m.recipient])
        .collect();
    ids.sort_unstable();
    ids.dedup();

    let usernames = accounts.usernames_by_ids(&ids).await?;
    let snapshot = |id: Uuid| AccountSnapshot {
        id,
        username: usernames
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
    };

    Ok(messages
        .into_iter()
        .map(|message| HistoryEntry {
            sender_details: snapshot(message.sender),
            recipient_details: snapshot(message.recipient),
            message,
        })
        .collect())
}

/// `POST /api/v1/chat/messages` — requires a bearer token whose account is
/// the claimed sender.
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SendMessageRequest>,
) -> Response {
    #[cfg(feature = "metrics")]
    let route = "chat.send";

    let account = match state.session().authorize_headers(&headers).await {
        Ok(account) => account,
        Err(err) => {
            let status = err.status();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(?err, "failed to authorize chat send");
            }
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            return (status, Json(ErrorBody { error: "unauthorized" })).into_response();
        }
    };

    if payload.sender != account.id {
        let status = StatusCode::FORBIDDEN;
        #[cfg(feature = "metrics")]
        state.record_http_request(route, status.as_u16());
        return (status, Json(ErrorBody { error: "sender_mismatch" })).into_response();
    }

    let text = payload.text.trim();
    if text.is_empty() {
        let status = StatusCode::BAD_REQUEST;
        #[cfg(feature = "metrics")]
        state.record_http_request(route, status.as_u16());
        return (status, Json(ErrorBody { error: "empty_message" })).into_response();
    }

    match state
        .chat()
        .send(account.id, payload.recipient, payload.event_id, text)
        .await
    {
        Ok((message, outcome)) => {
            let status = StatusCode::CREATED;
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            (
                status,
                Json(SendMessageResponse {
                    message,
                    delivered: outcome.delivered(),
                }),
            )
                .into_response()
        }
        Err(err) => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            tracing::error!(?err, "failed to store chat message");
            (status, Json(ErrorBody { error: "server_error" })).into_response()
        }
    }
}

/// `GET /api/v1/chat/messages/{user_id}` — any authenticated account may
/// read, matching the conversation views both sides render.
pub async fn message_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Response {
    #[cfg(feature = "metrics")]
    let route = "chat.history";

    if let Err(err) = state.session().authorize_headers(&headers).await {
        let status = err.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(?err, "failed to authorize chat history");
        }
        #[cfg(feature = "metrics")]
        state.record_http_request(route, status.as_u16());
        return (status, Json(ErrorBody { error: "unauthorized" })).into_response();
    }

    let messages = match state.chat().history_for(user_id).await {
        Ok(messages) => messages,
        Err(err) => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            tracing::error!(?err, "failed to load chat history");
            return (status, Json(ErrorBody { error: "server_error" })).into_response();
        }
    };

    match enrich_history(state.session().accounts().as_ref(), messages).await {
        Ok(entries) => {
            let status = StatusCode::OK;
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            (status, Json(HistoryResponse { messages: entries })).into_response()
        }
        Err(err) => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            tracing::error!(?err, "failed to enrich chat history");
            (status, Json(ErrorBody { error: "server_error" })).into_response()
        }
    }
}
