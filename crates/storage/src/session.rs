use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::StoragePool;
use anyhow::Result;

#[derive(Clone)]
pub struct SessionPersistence {
    pool: StoragePool,
}

#[derive(Debug, Clone)]
pub struct PersistedSession {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionPersistence {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn store_session(&self, session: &PersistedSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, issued_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                issued_at = EXCLUDED.issued_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(session.issued_at)
        .bind(session.expires_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }
}
