use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use planora_core::UserRole;
use planora_storage::{
    CreateUserError, CredentialError, NewUser, PersistedSession, SessionPersistence, StoragePool,
    UserRepository,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{config::SessionConfig, AppState};

// Matches the two-day expiry the login tokens have always carried.
const SESSION_TTL_HOURS: i64 = 48;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("account no longer exists")]
    UnknownAccount,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("username already exists")]
    UsernameTaken,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Public view of an account, shared by login responses, `/users/me`, and
/// the chat history enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: UserRole,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,
}

/// Identity resolver seam: credential checks and profile lookups, backed
/// by Postgres in production and by an in-memory map when no database is
/// configured.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<Uuid>>;
    async fn create_account(&self, account: &NewAccount) -> Result<AccountProfile, RegisterError>;
    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<AccountProfile>>;
    /// Ids with no matching account are absent from the result.
    async fn usernames_by_ids(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn persist_session(&self, record: &SessionRecord) -> Result<()>;
}

#[derive(Clone)]
pub struct SessionContext {
    signer: SessionSigner,
    accounts: Arc<dyn AccountStore>,
    repository: Arc<dyn SessionRepository>,
    ttl: Duration,
}

impl SessionContext {
    pub fn new(
        signer: SessionSigner,
        accounts: Arc<dyn AccountStore>,
        repository: Arc<dyn SessionRepository>,
    ) -> Self {
        Self {
            signer,
            accounts,
            repository,
            ttl: Duration::hours(SESSION_TTL_HOURS),
        }
    }

    pub fn accounts(&self) -> Arc<dyn AccountStore> {
        self.accounts.clone()
    }

    pub async fn login(&self, attempt: LoginAttempt) -> Result<Option<LoginResponse>> {
        let user_id = match self
            .accounts
            .authenticate(&attempt.username, &attempt.password)
            .await?
        {
            Some(user_id) => user_id,
            None => return Ok(None),
        };
        let Some(user) = self.accounts.fetch_profile(user_id).await? else {
            return Ok(None);
        };

        let record = self.build_record(user_id);
        let token = self.signer.sign(&record)?;
        self.repository.persist_session(&record).await?;

        Ok(Some(LoginResponse {
            token,
            expires_at: record.expires_at,
            user,
        }))
    }

    /// Resolve a bearer token to its account. The signature and expiry
    /// checks prove the token was issued here; the profile fetch re-checks
    /// that the account still exists, so a token never outlives its user.
    pub async fn authorize(&self, token: &str) -> Result<AccountProfile, AuthError> {
        let claims = self.signer.verify(token)?;
        if claims.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        let profile = self
            .accounts
            .fetch_profile(claims.user_id)
            .await
            .map_err(AuthError::Internal)?;
        profile.ok_or(AuthError::UnknownAccount)
    }

    pub async fn authorize_headers(&self, headers: &HeaderMap) -> Result<AccountProfile, AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        self.authorize(token).await
    }

    fn build_record(&self, user_id: Uuid) -> SessionRecord {
        let issued_at = Utc::now();
        let expires_at = issued_at + self.ttl;
        SessionRecord {
            session_id: Uuid::new_v4(),
            user_id,
            issued_at,
            expires_at,
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Signs and verifies access tokens:
/// `base64url(claims_json).base64url(ed25519_signature)`, no padding.
#[derive(Clone)]
pub struct SessionSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SessionSigner {
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let signing_key = match config.signing_key.as_deref() {
            Some(raw) => {
                let decoded = URL_SAFE_NO_PAD.decode(raw.trim()).with_context(|| {
                    "failed to decode session signing key from base64 (URL-safe)"
                })?;
                let bytes: [u8; 32] = decoded
                    .try_into()
                    .map_err(|_| anyhow!("session signing key must be 32 bytes"))?;
                SigningKey::from_bytes(&bytes)
            }
            None => SigningKey::generate(&mut OsRng),
        };
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    pub fn verifying_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key.as_bytes())
    }

    pub fn sign(&self, record: &SessionRecord) -> Result<String> {
        let payload = serde_json::to_vec(&SessionClaims::from(record))?;
        let signature = self.signing_key.sign(&payload);

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, AuthError> {
        let (payload_b64, signature_b64) =
            token.split_once('.').ok_or(AuthError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        let signature_bytes: [u8; 64] = signature_bytes
            .try_into()
            .map_err(|_| AuthError::Malformed)?;
        let signature = Signature::from_bytes(&signature_bytes);

        self.verifying_key
            .verify(&payload, &signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&SessionRecord> for SessionClaims {
    fn from(value: &SessionRecord) -> Self {
        Self {
            session_id: value.session_id,
            user_id: value.user_id,
            issued_at: value.issued_at,
            expires_at: value.expires_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub username: String,
    pub password: String,
}

#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<Uuid, InMemoryAccount>>,
    usernames: RwLock<HashMap<String, Uuid>>,
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
}

struct InMemoryAccount {
    profile: AccountProfile,
    // Plaintext comparison; this store only backs tests and the degraded
    // no-database mode.
    password: String,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<Uuid>> {
        let usernames = self.usernames.read().await;
        let Some(user_id) = usernames.get(username) else {
            return Ok(None);
        };
        let accounts = self.accounts.read().await;
        match accounts.get(user_id) {
            Some(account) if account.password == password => Ok(Some(*user_id)),
            _ => Ok(None),
        }
    }

    async fn create_account(&self, account: &NewAccount) -> Result<AccountProfile, RegisterError> {
        let mut usernames = self.usernames.write().await;
        if usernames.contains_key(&account.username) {
            return Err(RegisterError::UsernameTaken);
        }
        let profile = AccountProfile {
            id: Uuid::new_v4(),
            username: account.username.clone(),
            email: account.email.clone(),
            role: account.role,
        };
        usernames.insert(account.username.clone(), profile.id);
        self.accounts.write().await.insert(
            profile.id,
            InMemoryAccount {
                profile: profile.clone(),
                password: account.password.clone(),
            },
        );
        Ok(profile)
    }

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<AccountProfile>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(&user_id).map(|account| account.profile.clone()))
    }

    async fn usernames_by_ids(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>> {
        let accounts = self.accounts.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                accounts
                    .get(id)
                    .map(|account| (*id, account.profile.username.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl SessionRepository for InMemoryAccountStore {
    async fn persist_session(&self, record: &SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(record.session_id, record.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresAccountStore {
    pool: StoragePool,
}

impl PostgresAccountStore {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<Uuid>> {
        match UserRepository::verify_credentials(self.pool.pool(), username, password).await {
            Ok(user_id) => Ok(Some(user_id)),
            Err(err) => {
                if err.downcast_ref::<CredentialError>().is_some() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn create_account(&self, account: &NewAccount) -> Result<AccountProfile, RegisterError> {
        let new_user = NewUser {
            username: account.username.clone(),
            email: account.email.clone(),
            password: account.password.clone(),
            role: account.role,
        };
        let user_id = UserRepository::create_user(self.pool.pool(), &new_user)
            .await
            .map_err(|err| match err {
                CreateUserError::UsernameTaken => RegisterError::UsernameTaken,
                CreateUserError::Other(err) => RegisterError::Other(err),
            })?;
        Ok(AccountProfile {
            id: user_id,
            username: account.username.clone(),
            email: account.email.clone(),
            role: account.role,
        })
    }

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<AccountProfile>> {
        let profile = UserRepository::find_profile(self.pool.pool(), user_id).await?;
        Ok(profile.map(|p| AccountProfile {
            id: p.id,
            username: p.username,
            email: p.email,
            role: p.role,
        }))
    }

    async fn usernames_by_ids(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>> {
        UserRepository::usernames_by_ids(self.pool.pool(), ids).await
    }
}

pub struct PostgresSessionRepository {
    persistence: SessionPersistence,
}

impl PostgresSessionRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            persistence: SessionPersistence::new(pool),
        }
    }
}

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    async fn persist_session(&self, record: &SessionRecord) -> Result<()> {
        let persisted = PersistedSession {
            session_id: record.session_id,
            user_id: record.user_id,
            issued_at: record.issued_at,
            expires_at: record.expires_at,
        };
        self.persistence.store_session(&persisted).await
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    fn validate(self) -> Result<LoginAttempt, Vec<FieldError>> {
        let mut errors = Vec::new();
        let username = self.username.trim().to_string();
        if username.is_empty() {
            errors.push(FieldError::new("username", "must be provided"));
        }

        let password = self.password.trim().to_string();
        if password.is_empty() {
            errors.push(FieldError::new("password", "must be provided"));
        }

        if errors.is_empty() {
            Ok(LoginAttempt { username, password })
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: AccountProfile,
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

pub async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> Response {
    let attempt = match payload.validate() {
        Ok(attempt) => attempt,
        Err(errors) => {
            let status = StatusCode::BAD_REQUEST;
            #[cfg(feature = "metrics")]
            state.record_http_request("sessions.login", status.as_u16());
            return (status, Json(ErrorBody::validation(errors))).into_response();
        }
    };

    match state.session().login(attempt).await {
        Ok(Some(response)) => {
            let status = StatusCode::OK;
            #[cfg(feature = "metrics")]
            state.record_http_request("sessions.login", status.as_u16());
            (status, Json(response)).into_response()
        }
        Ok(None) => {
            let status = StatusCode::UNAUTHORIZED;
            #[cfg(feature = "metrics")]
            state.record_http_request("sessions.login", status.as_u16());
            (status, Json(ErrorBody::unauthorized())).into_response()
        }
        Err(err) => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            #[cfg(feature = "metrics")]
            state.record_http_request("sessions.login", status.as_u16());
            tracing::error!(?err, "failed to complete login attempt");
            (status, Json(ErrorBody::server_error())).into_response()
        }
    }
}

impl<'a> ErrorBody<'a> {
    fn validation(details: Vec<FieldError>) -> Self {
        Self {
            error: "validation_error",
            details: Some(details),
        }
    }

    fn unauthorized() -> Self {
        Self {
            error: "invalid_credentials",
            details: None,
        }
    }

    fn server_error() -> Self {
        Self {
            error: "server_error",
            details: None,
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub struct SessionTestHarness {
        pub context: Arc<SessionContext>,
        pub store: Arc<InMemoryAccountStore>,
    }

    impl SessionTestHarness {
        pub fn new() -> Self {
            let store = Arc::new(InMemoryAccountStore::new());
            let signer = SessionSigner::from_config(&SessionConfig::default()).expect("signer");
            let context = Arc::new(SessionContext::new(signer, store.clone(), store.clone()));
            Self { context, store }
        }

        pub async fn register_account(
            &self,
            username: impl Into<String>,
            password: impl Into<String>,
            role: UserRole,
        ) -> AccountProfile {
            let username = username.into();
            self.store
                .create_account(&NewAccount {
                    username: username.clone(),
                    email: format!("{username}@example.org"),
                    password: password.into(),
                    role,
                })
                .await
                .expect("account created")
        }
    }

    #[tokio::test]
    async fn login_issues_verifiable_token() {
        let harness = SessionTestHarness::new();
        let profile = harness
            .register_account("organizer", "secret-pass", UserRole::EventUser)
            .await;

        let response = harness
            .context
            .login(LoginAttempt {
                username: "organizer".into(),
                password: "secret-pass".into(),
            })
            .await
            .expect("login succeeds")
            .expect("credentials accepted");

        assert_eq!(response.user.id, profile.id);
        assert!(response.expires_at > Utc::now());
        assert_eq!(harness.store.session_count().await, 1);

        let authorized = harness
            .context
            .authorize(&response.token)
            .await
            .expect("token resolves");
        assert_eq!(authorized.id, profile.id);
        assert_eq!(authorized.username, "organizer");
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() {
        let harness = SessionTestHarness::new();
        harness
            .register_account("organizer", "secret-pass", UserRole::EventUser)
            .await;

        let response = harness
            .context
            .login(LoginAttempt {
                username: "organizer".into(),
                password: "wrong".into(),
            })
            .await
            .expect("login runs");
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let harness = SessionTestHarness::new();
        harness
            .register_account("organizer", "secret-pass", UserRole::EventUser)
            .await;
        let response = harness
            .context
            .login(LoginAttempt {
                username: "organizer".into(),
                password: "secret-pass".into(),
            })
            .await
            .unwrap()
            .unwrap();

        let mut tampered = response.token.clone();
        // Flip a character inside the claims payload.
        let replacement = if tampered.starts_with('A') { 'B' } else { 'A' };
        tampered.replace_range(0..1, &replacement.to_string());

        let err = harness.context.authorize(&tampered).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidSignature | AuthError::Malformed
        ));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let harness = SessionTestHarness::new();
        let profile = harness
            .register_account("organizer", "secret-pass", UserRole::EventUser)
            .await;

        let signer = SessionSigner::from_config(&SessionConfig::default()).expect("signer");
        let context = SessionContext::new(
            signer.clone(),
            harness.store.clone(),
            harness.store.clone(),
        );
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            user_id: profile.id,
            issued_at: Utc::now() - Duration::hours(50),
            expires_at: Utc::now() - Duration::hours(2),
        };
        let token = signer.sign(&record).expect("signed");

        let err = context.authorize(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn token_for_deleted_account_is_rejected() {
        let harness = SessionTestHarness::new();
        let signer = SessionSigner::from_config(&SessionConfig::default()).expect("signer");
        let context = SessionContext::new(
            signer.clone(),
            harness.store.clone(),
            harness.store.clone(),
        );

        // Valid token for a user id that was never (or is no longer) stored.
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        let token = signer.sign(&record).expect("signed");

        let err = context.authorize(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownAccount));
    }

    #[test]
    fn unconfigured_signer_generates_ephemeral_key() {
        let config = SessionConfig::default();
        let first = SessionSigner::from_config(&config).expect("signer");
        let second = SessionSigner::from_config(&config).expect("signer");
        assert_ne!(
            first.verifying_key_base64(),
            second.verifying_key_base64()
        );
    }

    #[test]
    fn configured_signing_key_round_trips() {
        let seed = [7u8; 32];
        let encoded = URL_SAFE_NO_PAD.encode(seed);
        let config = SessionConfig {
            signing_key: Some(encoded),
        };
        let signer = SessionSigner::from_config(&config).expect("signer");
        let again = SessionSigner::from_config(&config).expect("signer");
        assert_eq!(signer.verifying_key_base64(), again.verifying_key_base64());
    }

    #[test]
    fn short_signing_key_is_rejected() {
        let config = SessionConfig {
            signing_key: Some(URL_SAFE_NO_PAD.encode([1u8; 16])),
        };
        assert!(SessionSigner::from_config(&config).is_err());
    }

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc.def".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
