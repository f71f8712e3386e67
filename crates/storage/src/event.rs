use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use planora_core::planning::{ExpenseEntry, GuestEntry, GuestStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoragePool;

#[derive(Clone)]
pub struct EventRepository {
    pool: StoragePool,
}

/// A planned event. Guest and expense lists are stored as JSONB documents
/// beside the row and replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PlannedEvent {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub organizer: Uuid,
    pub starts_at: DateTime<Utc>,
    pub location: String,
    pub budget: f64,
    pub event_type: String,
    pub invitation: Option<String>,
    #[sqlx(json)]
    pub guests: Vec<GuestEntry>,
    #[sqlx(json)]
    pub expenses: Vec<ExpenseEntry>,
    pub vendors: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventDraft {
    pub name: String,
    pub description: String,
    pub organizer: Uuid,
    pub starts_at: DateTime<Utc>,
    pub location: String,
    pub budget: f64,
    pub event_type: String,
    pub invitation: Option<String>,
    pub guests: Vec<GuestEntry>,
    pub expenses: Vec<ExpenseEntry>,
    pub vendors: Vec<Uuid>,
}

const EVENT_COLUMNS: &str = "id, name, description, organizer, starts_at, location, budget, \
                             event_type, invitation, guests, expenses, vendors, created_at";

impl EventRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    pub async fn create_event(&self, draft: &EventDraft) -> Result<PlannedEvent> {
        let event = sqlx::query_as::<_, PlannedEvent>(&format!(
            r#"
            INSERT INTO events
                (id, name, description, organizer, starts_at, location, budget,
                 event_type, invitation, guests, expenses, vendors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(draft.organizer)
        .bind(draft.starts_at)
        .bind(&draft.location)
        .bind(draft.budget)
        .bind(&draft.event_type)
        .bind(&draft.invitation)
        .bind(sqlx::types::Json(&draft.guests))
        .bind(sqlx::types::Json(&draft.expenses))
        .bind(&draft.vendors)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(event)
    }

    pub async fn events_for_organizer(&self, organizer: Uuid) -> Result<Vec<PlannedEvent>> {
        let events = sqlx::query_as::<_, PlannedEvent>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE organizer = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(organizer)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(events)
    }

    pub async fn fetch_event(&self, event_id: Uuid) -> Result<Option<PlannedEvent>> {
        let event = sqlx::query_as::<_, PlannedEvent>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE id = $1
            "#
        ))
        .bind(event_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(event)
    }

    /// Replace every mutable field of the event. Returns `None` when the
    /// event does not exist.
    pub async fn replace_event(
        &self,
        event_id: Uuid,
        draft: &EventDraft,
    ) -> Result<Option<PlannedEvent>> {
        let event = sqlx::query_as::<_, PlannedEvent>(&format!(
            r#"
            UPDATE events
            SET name = $2,
                description = $3,
                organizer = $4,
                starts_at = $5,
                location = $6,
                budget = $7,
                event_type = $8,
                invitation = $9,
                guests = $10,
                expenses = $11,
                vendors = $12
            WHERE id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(draft.organizer)
        .bind(draft.starts_at)
        .bind(&draft.location)
        .bind(draft.budget)
        .bind(&draft.event_type)
        .bind(&draft.invitation)
        .bind(sqlx::types::Json(&draft.guests))
        .bind(sqlx::types::Json(&draft.expenses))
        .bind(&draft.vendors)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(event)
    }

    /// Delete the event, returning the removed record when it existed.
    pub async fn delete_event(&self, event_id: Uuid) -> Result<Option<PlannedEvent>> {
        let event = sqlx::query_as::<_, PlannedEvent>(&format!(
            r#"
            DELETE FROM events
            WHERE id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(event)
    }

    /// Events that carry an invitation for the given guest email.
    pub async fn invitations_for_email(&self, email: &str) -> Result<Vec<PlannedEvent>> {
        let events = sqlx::query_as::<_, PlannedEvent>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE EXISTS (
                SELECT 1 FROM jsonb_array_elements(guests) AS entry
                WHERE entry->>'email' = $1
            )
            ORDER BY starts_at ASC
            "#
        ))
        .bind(email)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(events)
    }

    /// Update one guest's invitation status in place. Returns `None` when
    /// the event is missing or the email is not on the guest list.
    pub async fn set_guest_status(
        &self,
        event_id: Uuid,
        email: &str,
        status: GuestStatus,
    ) -> Result<Option<PlannedEvent>> {
        let event = sqlx::query_as::<_, PlannedEvent>(&format!(
            r#"
            UPDATE events
            SET guests = (
                SELECT COALESCE(jsonb_agg(
                    CASE WHEN entry->>'email' = $2
                         THEN jsonb_set(entry, '{{status}}', to_jsonb($3::text))
                         ELSE entry
                    END
                ), '[]'::jsonb)
                FROM jsonb_array_elements(guests) AS entry
            )
            WHERE id = $1
              AND EXISTS (
                  SELECT 1 FROM jsonb_array_elements(guests) AS entry
                  WHERE entry->>'email' = $2
              )
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .bind(email)
        .bind(status.as_str())
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(event)
    }
}
