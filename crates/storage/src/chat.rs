use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoragePool;

#[derive(Clone)]
pub struct ChatRepository {
    pool: StoragePool,
}

/// A stored chat message. This is also the wire shape: push frames and
/// history responses carry the record exactly as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: Uuid,
    pub recipient: Uuid,
    pub event_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ChatRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    pub async fn append_message(
        &self,
        sender: Uuid,
        recipient: Uuid,
        event_id: Uuid,
        text: &str,
    ) -> Result<ChatMessage> {
        let message = sqlx::query_as::<_, ChatMessage>(
            r#"
            INSERT INTO chat_messages (id, sender, recipient, event_id, text)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, sender, recipient, event_id, text, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(sender)
        .bind(recipient)
        .bind(event_id)
        .bind(text)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(message)
    }

    /// Every message the user sent or received, oldest first.
    pub async fn messages_for_user(&self, user_id: Uuid) -> Result<Vec<ChatMessage>> {
        let messages = sqlx::query_as::<_, ChatMessage>(
            r#"
            SELECT id, sender, recipient, event_id, text, created_at
            FROM chat_messages
            WHERE sender = $1 OR recipient = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(messages)
    }
}
