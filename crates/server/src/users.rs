use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use planora_core::UserRole;
use serde::{Deserialize, Serialize};

use crate::{
    session::{AccountProfile, NewAccount, RegisterError},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: String,
}

impl RegisterRequest {
    fn validate(self) -> Result<NewAccount, Vec<FieldError>> {
        let mut errors = Vec::new();

        let username = self.username.trim().to_string();
        if username.len() < 3 {
            errors.push(FieldError::new("username", "must be at least 3 characters"));
        }

        let email = self.email.trim().to_string();
        if !email.contains('@') || email.len() < 3 {
            errors.push(FieldError::new("email", "must be a valid email address"));
        }

        // No trim here: leading or trailing whitespace is a legal password.
        if self.password.len() < 6 {
            errors.push(FieldError::new("password", "must be at least 6 characters"));
        }

        let role = match self.role.parse::<UserRole>() {
            Ok(role) => Some(role),
            Err(_) => {
                errors.push(FieldError::new(
                    "role",
                    "must be one of eventuser, vendor, guest",
                ));
                None
            }
        };

        match (errors.is_empty(), role) {
            (true, Some(role)) => Ok(NewAccount {
                username,
                email,
                password: self.password,
                role,
            }),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    user: AccountProfile,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
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

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Response {
    let account = match payload.validate() {
        Ok(account) => account,
        Err(details) => {
            let status = StatusCode::BAD_REQUEST;
            #[cfg(feature = "metrics")]
            state.record_http_request("users.register", status.as_u16());
            return (
                status,
                Json(ErrorBody {
                    error: "validation_error",
                    details: Some(details),
                }),
            )
                .into_response();
        }
    };

    match state.session().accounts().create_account(&account).await {
        Ok(user) => {
            let status = StatusCode::CREATED;
            #[cfg(feature = "metrics")]
            state.record_http_request("users.register", status.as_u16());
            tracing::info!(user_id = %user.id, username = %user.username, "registered account");
            (status, Json(RegisterResponse { user })).into_response()
        }
        Err(RegisterError::UsernameTaken) => {
            let status = StatusCode::CONFLICT;
            #[cfg(feature = "metrics")]
            state.record_http_request("users.register", status.as_u16());
            (
                status,
                Json(ErrorBody {
                    error: "username_taken",
                    details: None,
                }),
            )
                .into_response()
        }
        Err(RegisterError::Other(err)) => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            #[cfg(feature = "metrics")]
            state.record_http_request("users.register", status.as_u16());
            tracing::error!(?err, "failed to register account");
            (
                status,
                Json(ErrorBody {
                    error: "server_error",
                    details: None,
                }),
            )
                .into_response()
        }
    }
}

/// `GET /api/v1/users/me` — resolves the bearer token to its profile.
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.session().authorize_headers(&headers).await {
        Ok(profile) => {
            let status = StatusCode::OK;
            #[cfg(feature = "metrics")]
            state.record_http_request("users.me", status.as_u16());
            (status, Json(profile)).into_response()
        }
        Err(err) => {
            let status = err.status();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(?err, "failed to resolve current user");
            }
            #[cfg(feature = "metrics")]
            state.record_http_request("users.me", status.as_u16());
            (
                status,
                Json(ErrorBody {
                    error: "unauthorized",
                    details: None,
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::SessionTestHarness;
    use crate::session::AccountStore;

    fn request(username: &str, email: &str, password: &str, role: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.into(),
            email: email.into(),
            password: password.into(),
            role: role.into(),
        }
    }

    #[test]
    fn valid_registration_passes_validation() {
        let account = request("organizer", "organizer@example.org", "secret-pass", "eventuser")
            .validate()
            .expect("valid request");
        assert_eq!(account.username, "organizer");
        assert_eq!(account.role, UserRole::EventUser);
    }

    #[test]
    fn validation_collects_every_failing_field() {
        let errors = request("ab", "not-an-email", "pw", "admin")
            .validate()
            .unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["username", "email", "password", "role"]);
    }

    #[test]
    fn username_is_trimmed_before_length_check() {
        let errors = request("  ab  ", "a@b.org", "secret-pass", "guest")
            .validate()
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "username");
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected_by_store() {
        let harness = SessionTestHarness::new();
        harness
            .register_account("organizer", "secret-pass", UserRole::EventUser)
            .await;

        let account = request("organizer", "other@example.org", "secret-pass", "vendor")
            .validate()
            .expect("valid request");
        let err = harness
            .store
            .create_account(&account)
            .await
            .expect_err("duplicate rejected");
        assert!(matches!(err, RegisterError::UsernameTaken));
    }
}
