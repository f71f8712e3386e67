//! Vendor listings: one listing per vendor account, plus the search
//! endpoint organizers use to find venues and services.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use planora_core::UserRole;
use planora_storage::{
    CreateVendorError, VendorDraft, VendorProfile, VendorRepository, VendorSearch, StoragePool,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{session::AccountProfile, AppState};

/// Listing persistence seam, keyed by the owning vendor account.
#[async_trait]
pub trait VendorStore: Send + Sync {
    async fn create(&self, draft: &VendorDraft) -> Result<VendorProfile, CreateVendorError>;
    async fn by_owner(&self, owner: Uuid) -> Result<Option<VendorProfile>>;
    async fn replace(&self, owner: Uuid, draft: &VendorDraft) -> Result<Option<VendorProfile>>;
    async fn delete(&self, owner: Uuid) -> Result<Option<VendorProfile>>;
    async fn search(&self, search: &VendorSearch) -> Result<Vec<VendorProfile>>;
}

#[derive(Default)]
pub struct InMemoryVendorStore {
    vendors: RwLock<HashMap<Uuid, VendorProfile>>,
}

impl InMemoryVendorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn materialize(id: Uuid, created_at: chrono::DateTime<Utc>, draft: &VendorDraft) -> VendorProfile {
        VendorProfile {
            id,
            owner: draft.owner,
            name: draft.name.clone(),
            location: draft.location.clone(),
            availability: draft.availability,
            pricing: draft.pricing,
            services: draft.services.clone(),
            reviews: draft.reviews.clone(),
            created_at,
        }
    }
}

#[async_trait]
impl VendorStore for InMemoryVendorStore {
    async fn create(&self, draft: &VendorDraft) -> Result<VendorProfile, CreateVendorError> {
        let mut vendors = self.vendors.write().await;
        if vendors.contains_key(&draft.owner) {
            return Err(CreateVendorError::ListingExists);
        }
        let vendor = Self::materialize(Uuid::new_v4(), Utc::now(), draft);
        vendors.insert(draft.owner, vendor.clone());
        Ok(vendor)
    }

    async fn by_owner(&self, owner: Uuid) -> Result<Option<VendorProfile>> {
        Ok(self.vendors.read().await.get(&owner).cloned())
    }

    async fn replace(&self, owner: Uuid, draft: &VendorDraft) -> Result<Option<VendorProfile>> {
        let mut vendors = self.vendors.write().await;
        let Some(existing) = vendors.get(&owner) else {
            return Ok(None);
        };
        let replaced = Self::materialize(existing.id, existing.created_at, draft);
        vendors.insert(owner, replaced.clone());
        Ok(Some(replaced))
    }

    async fn delete(&self, owner: Uuid) -> Result<Option<VendorProfile>> {
        Ok(self.vendors.write().await.remove(&owner))
    }

    async fn search(&self, search: &VendorSearch) -> Result<Vec<VendorProfile>> {
        let vendors = self.vendors.read().await;
        let needle = search.location.as_deref().map(str::to_lowercase);
        let mut matches: Vec<VendorProfile> = vendors
            .values()
            .filter(|v| {
                needle
                    .as_deref()
                    .map(|loc| v.location.to_lowercase().contains(loc))
                    .unwrap_or(true)
                    && search.availability.map(|a| v.availability == a).unwrap_or(true)
                    && search.min_pricing.map(|min| v.pricing >= min).unwrap_or(true)
                    && search.max_pricing.map(|max| v.pricing <= max).unwrap_or(true)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|v| v.created_at);
        Ok(matches)
    }
}

pub struct PostgresVendorStore {
    repository: Arc<VendorRepository>,
}

impl PostgresVendorStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            repository: VendorRepository::new(pool),
        }
    }
}

#[async_trait]
impl VendorStore for PostgresVendorStore {
    async fn create(&self, draft: &VendorDraft) -> Result<VendorProfile, CreateVendorError> {
        self.repository.create_vendor(draft).await
    }

    async fn by_owner(&self, owner: Uuid) -> Result<Option<VendorProfile>> {
        self.repository.vendor_by_owner(owner).await
    }

    async fn replace(&self, owner: Uuid, draft: &VendorDraft) -> Result<Option<VendorProfile>> {
        self.repository.replace_vendor(owner, draft).await
    }

    async fn delete(&self, owner: Uuid) -> Result<Option<VendorProfile>> {
        self.repository.delete_vendor(owner).await
    }

    async fn search(&self, search: &VendorSearch) -> Result<Vec<VendorProfile>> {
        self.repository.search_vendors(search).await
    }
}

#[derive(Debug, Deserialize)]
pub struct VendorRequest {
    pub name: String,
    pub location: String,
    pub availability: bool,
    pub pricing: f64,
    pub services: String,
    #[serde(default)]
    pub reviews: Vec<String>,
}

impl VendorRequest {
    fn into_draft(self, owner: Uuid) -> Result<VendorDraft, Vec<FieldError>> {
        let mut errors = Vec::new();

        let name = self.name.trim().to_string();
        if name.is_empty() {
            errors.push(FieldError::new("name", "must be provided"));
        }

        let location = self.location.trim().to_string();
        if location.is_empty() {
            errors.push(FieldError::new("location", "must be provided"));
        }

        if !self.pricing.is_finite() || self.pricing < 0.0 {
            errors.push(FieldError::new("pricing", "must be a non-negative number"));
        }

        if errors.is_empty() {
            Ok(VendorDraft {
                owner,
                name,
                location,
                availability: self.availability,
                pricing: self.pricing,
                services: self.services.trim().to_string(),
                reviews: self.reviews,
            })
        } else {
            Err(errors)
        }
    }
}

/// Search filters arrive as query parameters; `availability=all` (or an
/// absent parameter) leaves availability unconstrained.
#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub location: Option<String>,
    pub availability: Option<String>,
    pub min_pricing: Option<f64>,
    pub max_pricing: Option<f64>,
}

impl SearchQuery {
    fn into_search(self) -> Result<VendorSearch, &'static str> {
        let availability = match self.availability.as_deref() {
            None | Some("all") => None,
            Some("true") => Some(true),
            Some("false") => Some(false),
            Some(_) => return Err("availability must be 'true', 'false', or 'all'"),
        };
        Ok(VendorSearch {
            location: self
                .location
                .map(|loc| loc.trim().to_string())
                .filter(|loc| !loc.is_empty()),
            availability,
            min_pricing: self.min_pricing,
            max_pricing: self.max_pricing,
        })
    }
}

#[derive(Debug, Serialize)]
struct VendorResponse {
    vendor: VendorProfile,
}

#[derive(Debug, Serialize)]
struct VendorListResponse {
    vendors: Vec<VendorProfile>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

impl<'a> ErrorBody<'a> {
    fn plain(error: &'a str) -> Self {
        Self {
            error,
            details: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: &'static str,
    message: &'static str,
}

impl FieldError {
    const fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

fn respond(
    state: &AppState,
    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))] route: &'static str,
    status: StatusCode,
    body: impl Serialize,
) -> Response {
    #[cfg(feature = "metrics")]
    state.record_http_request(route, status.as_u16());
    #[cfg(not(feature = "metrics"))]
    let _ = state;
    (status, Json(body)).into_response()
}

/// Only accounts registered with the vendor role may manage a listing.
async fn authorize_vendor(
    state: &AppState,
    headers: &HeaderMap,
    route: &'static str,
) -> Result<AccountProfile, Response> {
    let account = match state.session().authorize_headers(headers).await {
        Ok(account) => account,
        Err(err) => {
            let status = err.status();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(?err, "failed to authorize vendor request");
            }
            return Err(respond(state, route, status, ErrorBody::plain("unauthorized")));
        }
    };
    if account.role != UserRole::Vendor {
        return Err(respond(
            state,
            route,
            StatusCode::FORBIDDEN,
            ErrorBody::plain("vendor_role_required"),
        ));
    }
    Ok(account)
}

/// `POST /api/v1/vendors`
pub async fn create_vendor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<VendorRequest>,
) -> Response {
    let route = "vendors.create";
    let account = match authorize_vendor(&state, &headers, route).await {
        Ok(account) => account,
        Err(response) => return response,
    };

    let draft = match payload.into_draft(account.id) {
        Ok(draft) => draft,
        Err(details) => {
            return respond(
                &state,
                route,
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "validation_error",
                    details: Some(details),
                },
            )
        }
    };

    match state.vendors().create(&draft).await {
        Ok(vendor) => respond(&state, route, StatusCode::CREATED, VendorResponse { vendor }),
        Err(CreateVendorError::ListingExists) => respond(
            &state,
            route,
            StatusCode::CONFLICT,
            ErrorBody::plain("listing_exists"),
        ),
        Err(CreateVendorError::Other(err)) => {
            tracing::error!(?err, "failed to create vendor listing");
            respond(
                &state,
                route,
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::plain("server_error"),
            )
        }
    }
}

/// `GET /api/v1/vendors/me` — the authenticated vendor's own listing.
pub async fn my_vendor(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let route = "vendors.me";
    let account = match authorize_vendor(&state, &headers, route).await {
        Ok(account) => account,
        Err(response) => return response,
    };

    match state.vendors().by_owner(account.id).await {
        Ok(Some(vendor)) => respond(&state, route, StatusCode::OK, VendorResponse { vendor }),
        Ok(None) => respond(
            &state,
            route,
            StatusCode::NOT_FOUND,
            ErrorBody::plain("listing_not_found"),
        ),
        Err(err) => {
            tracing::error!(?err, "failed to load vendor listing");
            respond(
                &state,
                route,
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::plain("server_error"),
            )
        }
    }
}

/// `PUT /api/v1/vendors/me`
pub async fn update_vendor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<VendorRequest>,
) -> Response {
    let route = "vendors.update";
    let account = match authorize_vendor(&state, &headers, route).await {
        Ok(account) => account,
        Err(response) => return response,
    };

    let draft = match payload.into_draft(account.id) {
        Ok(draft) => draft,
        Err(details) => {
            return respond(
                &state,
                route,
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "validation_error",
                    details: Some(details),
                },
            )
        }
    };

    match state.vendors().replace(account.id, &draft).await {
        Ok(Some(vendor)) => respond(&state, route, StatusCode::OK, VendorResponse { vendor }),
        Ok(None) => respond(
            &state,
            route,
            StatusCode::NOT_FOUND,
            ErrorBody::plain("listing_not_found"),
        ),
        Err(err) => {
            tracing::error!(?err, "failed to update vendor listing");
            respond(
                &state,
                route,
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::plain("server_error"),
            )
        }
    }
}

/// `DELETE /api/v1/vendors/me`
pub async fn delete_vendor(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let route = "vendors.delete";
    let account = match authorize_vendor(&state, &headers, route).await {
        Ok(account) => account,
        Err(response) => return response,
    };

    match state.vendors().delete(account.id).await {
        Ok(Some(vendor)) => respond(&state, route, StatusCode::OK, VendorResponse { vendor }),
        Ok(None) => respond(
            &state,
            route,
            StatusCode::NOT_FOUND,
            ErrorBody::plain("listing_not_found"),
        ),
        Err(err) => {
            tracing::error!(?err, "failed to delete vendor listing");
            respond(
                &state,
                route,
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::plain("server_error"),
            )
        }
    }
}

/// `GET /api/v1/vendors/search` — open to any authenticated account.
pub async fn search_vendors(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Response {
    let route = "vendors.search";
    if let Err(err) = state.session().authorize_headers(&headers).await {
        let status = err.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(?err, "failed to authorize vendor search");
        }
        return respond(&state, route, status, ErrorBody::plain("unauthorized"));
    }

    let search = match query.into_search() {
        Ok(search) => search,
        Err(message) => {
            return respond(
                &state,
                route,
                StatusCode::BAD_REQUEST,
                ErrorBody::plain(message),
            )
        }
    };

    match state.vendors().search(&search).await {
        Ok(vendors) => respond(&state, route, StatusCode::OK, VendorListResponse { vendors }),
        Err(err) => {
            tracing::error!(?err, "failed to search vendor listings");
            respond(
                &state,
                route,
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::plain("server_error"),
            )
        }
    }
}
