//! User records and the stores that hold them

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::guard::Credentials;
use crate::auth::password;
use crate::auth::two_factor::TwoFactorMethod;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("User not found: {0}")]
    NotFound(Uuid),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid user record: {0}")]
    InvalidRecord(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    /// Base32 TOTP secret, created lazily on first code
    pub two_factor_secret: Option<String>,
    pub two_factor_method: TwoFactorMethod,
    /// Second factor is enabled while this is unset
    pub two_factor_disabled_at: Option<OffsetDateTime>,
    pub email_verified_at: Option<OffsetDateTime>,
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
}

impl User {
    /// New user with email-based second factor enabled
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            password_hash: password_hash.into(),
            two_factor_secret: None,
            two_factor_method: TwoFactorMethod::Email,
            two_factor_disabled_at: None,
            email_verified_at: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    pub fn with_two_factor(mut self, method: TwoFactorMethod) -> Self {
        self.two_factor_method = method;
        self.two_factor_disabled_at = None;
        self
    }

    pub fn without_two_factor(mut self) -> Self {
        self.two_factor_disabled_at = Some(OffsetDateTime::now_utc());
        self
    }

    pub fn has_two_factor_enabled(&self) -> bool {
        self.two_factor_disabled_at.is_none()
    }

    pub fn uses_authenticator_app(&self) -> bool {
        self.two_factor_method == TwoFactorMethod::AuthenticatorApp
    }
}

/// Public view of a user; timestamps are Unix seconds as strings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserResource {
    pub id: String,
    pub name: String,
    pub email: String,
    pub email_verified_at: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

fn unix_string(at: Option<OffsetDateTime>) -> Option<String> {
    at.map(|t| t.unix_timestamp().to_string())
}

impl From<&User> for UserResource {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.to_string(),
            name: user.name.clone(),
            email: user.email.clone(),
            email_verified_at: unix_string(user.email_verified_at),
            created_at: unix_string(user.created_at),
            updated_at: unix_string(user.updated_at),
        }
    }
}

/// Resolves users for authentication
#[async_trait]
pub trait UserProvider: Send + Sync {
    async fn retrieve_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Look up the user the credentials claim to belong to (by email)
    async fn retrieve_by_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Option<User>, StoreError>;

    fn validate_credentials(&self, user: &User, credentials: &Credentials) -> bool {
        password::verify_password(credentials.password.expose_secret(), &user.password_hash)
    }
}

/// Persists two-factor secrets
#[async_trait]
pub trait TwoFactorSecretStore: Send + Sync {
    /// Store `secret` unless the user already has one; returns the stored secret
    async fn store_secret_if_absent(&self, user_id: Uuid, secret: &str)
        -> Result<String, StoreError>;
}

/// In-process user store
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn find(&self, id: Uuid) -> Option<User> {
        self.users.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl UserProvider for MemoryUserStore {
    async fn retrieve_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.find(id).await)
    }

    async fn retrieve_by_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email == credentials.email)
            .cloned())
    }
}

#[async_trait]
impl TwoFactorSecretStore for MemoryUserStore {
    async fn store_secret_if_absent(
        &self,
        user_id: Uuid,
        secret: &str,
    ) -> Result<String, StoreError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&user_id).ok_or(StoreError::NotFound(user_id))?;

        Ok(user
            .two_factor_secret
            .get_or_insert_with(|| secret.to_string())
            .clone())
    }
}

/// Database row for the `users` table
#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    password_hash: String,
    two_factor_secret: Option<String>,
    two_factor_method: String,
    two_factor_disabled_at: Option<OffsetDateTime>,
    email_verified_at: Option<OffsetDateTime>,
    created_at: Option<OffsetDateTime>,
    updated_at: Option<OffsetDateTime>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            email: row.email,
            password_hash: row.password_hash,
            two_factor_secret: row.two_factor_secret,
            two_factor_method: row
                .two_factor_method
                .parse()
                .map_err(StoreError::InvalidRecord)?,
            two_factor_disabled_at: row.two_factor_disabled_at,
            email_verified_at: row.email_verified_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed user store
#[derive(Debug, Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, name, email, password_hash, two_factor_secret, two_factor_method,
                two_factor_disabled_at, email_verified_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, NOW()), COALESCE($10, NOW()))
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.two_factor_secret)
        .bind(user.two_factor_method.as_str())
        .bind(user.two_factor_disabled_at)
        .bind(user.email_verified_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl UserProvider for PgUserStore {
    async fn retrieve_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, name, email, password_hash, two_factor_secret, two_factor_method,
                   two_factor_disabled_at, email_verified_at, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn retrieve_by_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, name, email, password_hash, two_factor_secret, two_factor_method,
                   two_factor_disabled_at, email_verified_at, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(&credentials.email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(User::try_from).transpose()
    }
}

#[async_trait]
impl TwoFactorSecretStore for PgUserStore {
    async fn store_secret_if_absent(
        &self,
        user_id: Uuid,
        secret: &str,
    ) -> Result<String, StoreError> {
        // Only the first writer's UPDATE matches; later callers read back its secret
        let stored: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE users
            SET two_factor_secret = $2, updated_at = NOW()
            WHERE id = $1
              AND two_factor_secret IS NULL
            RETURNING two_factor_secret
            "#,
        )
        .bind(user_id)
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((secret,)) = stored {
            return Ok(secret);
        }

        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT two_factor_secret FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            Some((Some(secret),)) => Ok(secret),
            Some((None,)) => Err(StoreError::InvalidRecord(format!(
                "two_factor_secret for {user_id} vanished during update"
            ))),
            None => Err(StoreError::NotFound(user_id)),
        }
    }
}
