//! Storage helpers for Postgres access.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;

pub mod chat;
pub mod event;
pub mod session;
pub mod user;
pub mod vendor;

pub use sqlx::PgPool;

pub use chat::{ChatMessage, ChatRepository};
pub use event::{EventDraft, EventRepository, PlannedEvent};
pub use session::{PersistedSession, SessionPersistence};
pub use user::{CreateUserError, CredentialError, NewUser, UserProfile, UserRepository};
pub use vendor::{CreateVendorError, VendorDraft, VendorProfile, VendorRepository, VendorSearch};

/// Thin wrapper around a shared `PgPool`.
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    /// Wrap an existing pool in an `Arc` so it can be cloned safely.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow the underlying `PgPool`.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::ops::Deref for StoragePool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        self.pool()
    }
}

pub async fn connect(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(StoragePool::new(pool))
}
