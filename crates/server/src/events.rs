//! Event planning: CRUD over planned events, the invitation feed, and
//! guest RSVP updates. Guests and expenses travel inside the event record
//! and are replaced wholesale on update.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use planora_core::planning::{ExpenseEntry, GuestEntry, GuestStatus};
use planora_storage::{EventDraft, EventRepository, PlannedEvent, StoragePool};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{session::AccountProfile, AppState};

/// Event persistence seam. RSVP updates go through `set_guest_status` so
/// the Postgres impl can update the guest entry in place instead of
/// rewriting the whole record.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create(&self, draft: &EventDraft) -> Result<PlannedEvent>;
    async fn for_organizer(&self, organizer: Uuid) -> Result<Vec<PlannedEvent>>;
    async fn fetch(&self, event_id: Uuid) -> Result<Option<PlannedEvent>>;
    async fn replace(&self, event_id: Uuid, draft: &EventDraft) -> Result<Option<PlannedEvent>>;
    async fn delete(&self, event_id: Uuid) -> Result<Option<PlannedEvent>>;
    async fn invitations_for_email(&self, email: &str) -> Result<Vec<PlannedEvent>>;
    async fn set_guest_status(
        &self,
        event_id: Uuid,
        email: &str,
        status: GuestStatus,
    ) -> Result<Option<PlannedEvent>>;
}

#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<Uuid, PlannedEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn materialize(id: Uuid, created_at: DateTime<Utc>, draft: &EventDraft) -> PlannedEvent {
        PlannedEvent {
            id,
            name: draft.name.clone(),
            description: draft.description.clone(),
            organizer: draft.organizer,
            starts_at: draft.starts_at,
            location: draft.location.clone(),
            budget: draft.budget,
            event_type: draft.event_type.clone(),
            invitation: draft.invitation.clone(),
            guests: draft.guests.clone(),
            expenses: draft.expenses.clone(),
            vendors: draft.vendors.clone(),
            created_at,
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create(&self, draft: &EventDraft) -> Result<PlannedEvent> {
        let event = Self::materialize(Uuid::new_v4(), Utc::now(), draft);
        self.events.write().await.insert(event.id, event.clone());
        Ok(event)
    }

    async fn for_organizer(&self, organizer: Uuid) -> Result<Vec<PlannedEvent>> {
        let events = self.events.read().await;
        let mut owned: Vec<PlannedEvent> = events
            .values()
            .filter(|e| e.organizer == organizer)
            .cloned()
            .collect();
        owned.sort_by_key(|e| e.created_at);
        Ok(owned)
    }

    async fn fetch(&self, event_id: Uuid) -> Result<Option<PlannedEvent>> {
        Ok(self.events.read().await.get(&event_id).cloned())
    }

    async fn replace(&self, event_id: Uuid, draft: &EventDraft) -> Result<Option<PlannedEvent>> {
        let mut events = self.events.write().await;
        let Some(existing) = events.get(&event_id) else {
            return Ok(None);
        };
        let replaced = Self::materialize(event_id, existing.created_at, draft);
        events.insert(event_id, replaced.clone());
        Ok(Some(replaced))
    }

    async fn delete(&self, event_id: Uuid) -> Result<Option<PlannedEvent>> {
        Ok(self.events.write().await.remove(&event_id))
    }

    async fn invitations_for_email(&self, email: &str) -> Result<Vec<PlannedEvent>> {
        let events = self.events.read().await;
        let mut invited: Vec<PlannedEvent> = events
            .values()
            .filter(|e| e.guests.iter().any(|g| g.email == email))
            .cloned()
            .collect();
        invited.sort_by_key(|e| e.starts_at);
        Ok(invited)
    }

    async fn set_guest_status(
        &self,
        event_id: Uuid,
        email: &str,
        status: GuestStatus,
    ) -> Result<Option<PlannedEvent>> {
        let mut events = self.events.write().await;
        let Some(event) = events.get_mut(&event_id) else {
            return Ok(None);
        };
        let Some(guest) = event.guests.iter_mut().find(|g| g.email == email) else {
            return Ok(None);
        };
        guest.status = status;
        Ok(Some(event.clone()))
    }
}

pub struct PostgresEventStore {
    repository: Arc<EventRepository>,
}

impl PostgresEventStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            repository: EventRepository::new(pool),
        }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn create(&self, draft: &EventDraft) -> Result<PlannedEvent> {
        self.repository.create_event(draft).await
    }

    async fn for_organizer(&self, organizer: Uuid) -> Result<Vec<PlannedEvent>> {
        self.repository.events_for_organizer(organizer).await
    }

    async fn fetch(&self, event_id: Uuid) -> Result<Option<PlannedEvent>> {
        self.repository.fetch_event(event_id).await
    }

    async fn replace(&self, event_id: Uuid, draft: &EventDraft) -> Result<Option<PlannedEvent>> {
        self.repository.replace_event(event_id, draft).await
    }

    async fn delete(&self, event_id: Uuid) -> Result<Option<PlannedEvent>> {
        self.repository.delete_event(event_id).await
    }

    async fn invitations_for_email(&self, email: &str) -> Result<Vec<PlannedEvent>> {
        self.repository.invitations_for_email(email).await
    }

    async fn set_guest_status(
        &self,
        event_id: Uuid,
        email: &str,
        status: GuestStatus,
    ) -> Result<Option<PlannedEvent>> {
        self.repository
            .set_guest_status(event_id, email, status)
            .await
    }
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub name: String,
    pub description: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub location: String,
    pub budget: f64,
    pub event_type: String,
    pub invitation: Option<String>,
    #[serde(default)]
    pub guests: Vec<GuestEntry>,
    #[serde(default)]
    pub expenses: Vec<ExpenseEntry>,
    #[serde(default)]
    pub vendors: Vec<Uuid>,
}

impl EventRequest {
    /// The organizer always comes from the bearer token, never the body.
    fn into_draft(self, organizer: Uuid) -> Result<EventDraft, Vec<FieldError>> {
        let mut errors = Vec::new();

        let name = self.name.trim().to_string();
        if name.is_empty() {
            errors.push(FieldError::new("name", "must be provided"));
        }

        let location = self.location.trim().to_string();
        if location.is_empty() {
            errors.push(FieldError::new("location", "must be provided"));
        }

        if !self.budget.is_finite() || self.budget < 0.0 {
            errors.push(FieldError::new("budget", "must be a non-negative number"));
        }

        if self.expenses.iter().any(|e| !e.amount.is_finite() || e.amount < 0.0) {
            errors.push(FieldError::new(
                "expenses",
                "amounts must be non-negative numbers",
            ));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(EventDraft {
            name,
            description: self.description.unwrap_or_default(),
            organizer,
            starts_at: self.starts_at,
            location,
            budget: self.budget,
            event_type: self.event_type.trim().to_string(),
            invitation: self.invitation,
            guests: self.guests,
            expenses: self.expenses,
            vendors: self.vendors,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RsvpRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
struct EventResponse {
    event: PlannedEvent,
}

#[derive(Debug, Serialize)]
struct EventListResponse {
    events: Vec<PlannedEvent>,
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

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))] route: &'static str,
) -> Result<AccountProfile, Response> {
    match state.session().authorize_headers(headers).await {
        Ok(profile) => Ok(profile),
        Err(err) => {
            let status = err.status();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(?err, "failed to authorize event request");
            }
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            Err((status, Json(ErrorBody::plain("unauthorized"))).into_response())
        }
    }
}

fn server_error(
    state: &AppState,
    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))] route: &'static str,
    err: anyhow::Error,
    context: &'static str,
) -> Response {
    let status = StatusCode::INTERNAL_SERVER_ERROR;
    #[cfg(feature = "metrics")]
    state.record_http_request(route, status.as_u16());
    #[cfg(not(feature = "metrics"))]
    let _ = state;
    tracing::error!(?err, "{context}");
    (status, Json(ErrorBody::plain("server_error"))).into_response()
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

/// `POST /api/v1/events`
pub async fn create_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<EventRequest>,
) -> Response {
    let route = "events.create";
    let account = match authorize(&state, &headers, route).await {
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

    match state.events().create(&draft).await {
        Ok(event) => respond(&state, route, StatusCode::CREATED, EventResponse { event }),
        Err(err) => server_error(&state, route, err, "failed to create event"),
    }
}

/// `GET /api/v1/events` — the authenticated organizer's events.
pub async fn list_events(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let route = "events.list";
    let account = match authorize(&state, &headers, route).await {
        Ok(account) => account,
        Err(response) => return response,
    };

    match state.events().for_organizer(account.id).await {
        Ok(events) => respond(&state, route, StatusCode::OK, EventListResponse { events }),
        Err(err) => server_error(&state, route, err, "failed to list events"),
    }
}

/// `GET /api/v1/events/{event_id}`
pub async fn fetch_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
) -> Response {
    let route = "events.fetch";
    if let Err(response) = authorize(&state, &headers, route).await {
        return response;
    }

    match state.events().fetch(event_id).await {
        Ok(Some(event)) => respond(&state, route, StatusCode::OK, EventResponse { event }),
        Ok(None) => respond(
            &state,
            route,
            StatusCode::NOT_FOUND,
            ErrorBody::plain("event_not_found"),
        ),
        Err(err) => server_error(&state, route, err, "failed to fetch event"),
    }
}

/// `PUT /api/v1/events/{event_id}` — organizer only.
pub async fn update_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
    Json(payload): Json<EventRequest>,
) -> Response {
    let route = "events.update";
    let account = match authorize(&state, &headers, route).await {
        Ok(account) => account,
        Err(response) => return response,
    };

    let existing = match state.events().fetch(event_id).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            return respond(
                &state,
                route,
                StatusCode::NOT_FOUND,
                ErrorBody::plain("event_not_found"),
            )
        }
        Err(err) => return server_error(&state, route, err, "failed to fetch event"),
    };
    if existing.organizer != account.id {
        return respond(
            &state,
            route,
            StatusCode::FORBIDDEN,
            ErrorBody::plain("not_the_organizer"),
        );
    }

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

    match state.events().replace(event_id, &draft).await {
        Ok(Some(event)) => respond(&state, route, StatusCode::OK, EventResponse { event }),
        Ok(None) => respond(
            &state,
            route,
            StatusCode::NOT_FOUND,
            ErrorBody::plain("event_not_found"),
        ),
        Err(err) => server_error(&state, route, err, "failed to update event"),
    }
}

/// `DELETE /api/v1/events/{event_id}` — organizer only.
pub async fn delete_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
) -> Response {
    let route = "events.delete";
    let account = match authorize(&state, &headers, route).await {
        Ok(account) => account,
        Err(response) => return response,
    };

    let existing = match state.events().fetch(event_id).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            return respond(
                &state,
                route,
                StatusCode::NOT_FOUND,
                ErrorBody::plain("event_not_found"),
            )
        }
        Err(err) => return server_error(&state, route, err, "failed to fetch event"),
    };
    if existing.organizer != account.id {
        return respond(
            &state,
            route,
            StatusCode::FORBIDDEN,
            ErrorBody::plain("not_the_organizer"),
        );
    }

    match state.events().delete(event_id).await {
        Ok(Some(event)) => respond(&state, route, StatusCode::OK, EventResponse { event }),
        Ok(None) => respond(
            &state,
            route,
            StatusCode::NOT_FOUND,
            ErrorBody::plain("event_not_found"),
        ),
        Err(err) => server_error(&state, route, err, "failed to delete event"),
    }
}

/// `GET /api/v1/events/invitations` — events that carry an invitation for
/// the authenticated account's email.
pub async fn list_invitations(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let route = "events.invitations";
    let account = match authorize(&state, &headers, route).await {
        Ok(account) => account,
        Err(response) => return response,
    };

    match state.events().invitations_for_email(&account.email).await {
        Ok(events) => respond(&state, route, StatusCode::OK, EventListResponse { events }),
        Err(err) => server_error(&state, route, err, "failed to list invitations"),
    }
}

/// `POST /api/v1/events/{event_id}/rsvp` — the authenticated guest updates
/// their own invitation status.
pub async fn rsvp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
    Json(payload): Json<RsvpRequest>,
) -> Response {
    let route = "events.rsvp";
    let account = match authorize(&state, &headers, route).await {
        Ok(account) => account,
        Err(response) => return response,
    };

    let Ok(status) = GuestStatus::from_str(&payload.status) else {
        return respond(
            &state,
            route,
            StatusCode::BAD_REQUEST,
            ErrorBody::plain("invalid_status"),
        );
    };

    match state
        .events()
        .set_guest_status(event_id, &account.email, status)
        .await
    {
        Ok(Some(event)) => respond(&state, route, StatusCode::OK, EventResponse { event }),
        Ok(None) => respond(
            &state,
            route,
            StatusCode::NOT_FOUND,
            ErrorBody::plain("invitation_not_found"),
        ),
        Err(err) => server_error(&state, route, err, "failed to update invitation"),
    }
}
