use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::StoragePool;

#[derive(Clone)]
pub struct VendorRepository {
    pool: StoragePool,
}

/// A vendor's public listing. `owner` is the vendor's user account and is
/// the key every lookup and mutation goes through, since a vendor account
/// carries at most one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct VendorProfile {
    pub id: Uuid,
    pub owner: Uuid,
    pub name: String,
    pub location: String,
    pub availability: bool,
    pub pricing: f64,
    pub services: String,
    pub reviews: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VendorDraft {
    pub owner: Uuid,
    pub name: String,
    pub location: String,
    pub availability: bool,
    pub pricing: f64,
    pub services: String,
    pub reviews: Vec<String>,
}

/// Optional search filters. Absent fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct VendorSearch {
    pub location: Option<String>,
    pub availability: Option<bool>,
    pub min_pricing: Option<f64>,
    pub max_pricing: Option<f64>,
}

#[derive(Debug, Error)]
pub enum CreateVendorError {
    #[error("vendor listing already exists for this account")]
    ListingExists,
    #[error("failed to create vendor listing: {0}")]
    Other(#[from] anyhow::Error),
}

const VENDOR_COLUMNS: &str =
    "id, owner, name, location, availability, pricing, services, reviews, created_at";

/// Escape LIKE metacharacters so user input only ever matches literally.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl VendorRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    pub async fn create_vendor(
        &self,
        draft: &VendorDraft,
    ) -> Result<VendorProfile, CreateVendorError> {
        let vendor = sqlx::query_as::<_, VendorProfile>(&format!(
            r#"
            INSERT INTO vendors (id, owner, name, location, availability, pricing, services, reviews)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {VENDOR_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(draft.owner)
        .bind(&draft.name)
        .bind(&draft.location)
        .bind(draft.availability)
        .bind(draft.pricing)
        .bind(&draft.services)
        .bind(&draft.reviews)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if matches!(db_err.code(), Some(code) if code.as_ref() == "23505") => {
                CreateVendorError::ListingExists
            }
            other => CreateVendorError::Other(
                anyhow!(other).context(format!("creating vendor listing for '{}'", draft.owner)),
            ),
        })?;
        Ok(vendor)
    }

    pub async fn vendor_by_owner(&self, owner: Uuid) -> Result<Option<VendorProfile>> {
        let vendor = sqlx::query_as::<_, VendorProfile>(&format!(
            r#"
            SELECT {VENDOR_COLUMNS}
            FROM vendors
            WHERE owner = $1
            "#
        ))
        .bind(owner)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(vendor)
    }

    pub async fn replace_vendor(
        &self,
        owner: Uuid,
        draft: &VendorDraft,
    ) -> Result<Option<VendorProfile>> {
        let vendor = sqlx::query_as::<_, VendorProfile>(&format!(
            r#"
            UPDATE vendors
            SET name = $2,
                location = $3,
                availability = $4,
                pricing = $5,
                services = $6,
                reviews = $7
            WHERE owner = $1
            RETURNING {VENDOR_COLUMNS}
            "#
        ))
        .bind(owner)
        .bind(&draft.name)
        .bind(&draft.location)
        .bind(draft.availability)
        .bind(draft.pricing)
        .bind(&draft.services)
        .bind(&draft.reviews)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(vendor)
    }

    pub async fn delete_vendor(&self, owner: Uuid) -> Result<Option<VendorProfile>> {
        let vendor = sqlx::query_as::<_, VendorProfile>(&format!(
            r#"
            DELETE FROM vendors
            WHERE owner = $1
            RETURNING {VENDOR_COLUMNS}
            "#
        ))
        .bind(owner)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(vendor)
    }

    pub async fn search_vendors(&self, search: &VendorSearch) -> Result<Vec<VendorProfile>> {
        let location_pattern = search
            .location
            .as_deref()
            .map(|loc| format!("%{}%", escape_like(loc)));

        let vendors = sqlx::query_as::<_, VendorProfile>(&format!(
            r#"
            SELECT {VENDOR_COLUMNS}
            FROM vendors
            WHERE ($1::text IS NULL OR location ILIKE $1)
              AND ($2::boolean IS NULL OR availability = $2)
              AND ($3::double precision IS NULL OR pricing >= $3)
              AND ($4::double precision IS NULL OR pricing <= $4)
            ORDER BY created_at ASC
            "#
        ))
        .bind(location_pattern)
        .bind(search.availability)
        .bind(search.min_pricing)
        .bind(search.max_pricing)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(vendors)
    }
}
