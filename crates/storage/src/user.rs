use anyhow::{anyhow, Context, Result};
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use planora_core::UserRole;
use pwhash::rand_core::OsRng;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

/// Repository utilities for account persistence.
pub struct UserRepository;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user not found")]
    UserNotFound,
    #[error("invalid credentials")]
    InvalidCredentials,
}

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("username already exists")]
    UsernameTaken,
    #[error("failed to create user: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,
}

/// Public view of an account, safe to hand back over the wire.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[sqlx(try_from = "String")]
    pub role: UserRole,
}

impl UserRepository {
    /// Create a new account with a hashed password.
    pub async fn create_user(pool: &PgPool, user: &NewUser) -> Result<Uuid, CreateUserError> {
        let id = Uuid::new_v4();
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let password_hash = argon2
            .hash_password(user.password.as_bytes(), &salt)
            .map_err(|err| anyhow!("hashing password failed: {err}"))?
            .to_string();

        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, password_hash, role)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(password_hash)
        .bind(user.role.as_str())
        .execute(pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if matches!(db_err.code(), Some(code) if code.as_ref() == "23505") => {
                CreateUserError::UsernameTaken
            }
            other => CreateUserError::Other(
                anyhow!(other).context(format!("creating user '{}'", user.username)),
            ),
        })?;

        Ok(id)
    }

    /// Verify credentials and return the user id when successful.
    pub async fn verify_credentials(pool: &PgPool, username: &str, password: &str) -> Result<Uuid> {
        let record = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            SELECT id, password_hash
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user '{username}'"))?;

        let Some((user_id, password_hash)) = record else {
            return Err(CredentialError::UserNotFound.into());
        };

        let parsed_hash = PasswordHash::new(&password_hash)
            .map_err(|err| anyhow!("invalid password hash for '{username}': {err}"))?;

        let argon2 = Argon2::default();
        argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|_| CredentialError::InvalidCredentials)?;

        Ok(user_id)
    }

    pub async fn find_profile(pool: &PgPool, user_id: Uuid) -> Result<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT id, username, email, role
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying profile for '{user_id}'"))?;
        Ok(profile)
    }

    /// Resolve usernames for a batch of ids. Ids with no matching account
    /// are simply absent from the result.
    pub async fn usernames_by_ids(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            SELECT id, username
            FROM users
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(pool)
        .await
        .context("resolving usernames")?;
        Ok(rows)
    }
}
