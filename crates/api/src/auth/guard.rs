//! Per-request credential guard
//!
//! A guard lives for one request. It resolves the caller from the bearer
//! token at most once and checks email/password pairs inside the
//! minimum-duration envelope, so a missing user and a wrong password take
//! the same time to reject.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::claims::ClaimSet;
use super::codec::TokenCodec;
use super::scope::ScopeSet;
use super::timebox::Timebox;
use crate::error::{AuthError, AuthResult};
use crate::users::{User, UserProvider};

/// Email/password pair
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.email.trim().is_empty() || self.password.expose_secret().is_empty()
    }
}

/// Validated login input
#[derive(Debug, Clone)]
pub struct LoginRequest {
    credentials: Credentials,
}

impl LoginRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> AuthResult<Self> {
        let email: String = email.into();
        let credentials = Credentials::new(email.trim(), password);
        let email = credentials.email.as_str();

        if email.is_empty() {
            return Err(AuthError::validation("email", "The email field is required."));
        }
        let valid_email = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
        if !valid_email {
            return Err(AuthError::validation(
                "email",
                "The email field must be a valid email address.",
            ));
        }
        if credentials.password.expose_secret().is_empty() {
            return Err(AuthError::validation(
                "password",
                "The password field is required.",
            ));
        }

        Ok(Self { credentials })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

#[derive(Debug)]
struct Identity {
    user: User,
    claims: ClaimSet,
}

pub struct CredentialGuard {
    provider: Arc<dyn UserProvider>,
    codec: Arc<TokenCodec>,
    timebox: Timebox,
    bearer: Option<String>,
    identity: OnceCell<Option<Identity>>,
    last_attempted: Option<User>,
}

impl CredentialGuard {
    pub fn new(provider: Arc<dyn UserProvider>, codec: Arc<TokenCodec>, floor: Duration) -> Self {
        Self {
            provider,
            codec,
            timebox: Timebox::new(floor),
            bearer: None,
            identity: OnceCell::new(),
            last_attempted: None,
        }
    }

    /// Attach the raw bearer token of the current request
    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token.filter(|t| !t.is_empty());
        self
    }

    async fn identity(&self) -> Option<&Identity> {
        self.identity
            .get_or_init(|| self.resolve_identity())
            .await
            .as_ref()
    }

    async fn resolve_identity(&self) -> Option<Identity> {
        let token = self.bearer.as_deref()?;
        let claims = self.codec.decode(token)?;

        let Some(user_id) = claims.subject().and_then(|s| Uuid::parse_str(s).ok()) else {
            tracing::warn!("bearer token has no usable subject");
            return None;
        };

        match self.provider.retrieve_by_id(user_id).await {
            Ok(Some(user)) => Some(Identity { user, claims }),
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "bearer token subject no longer exists");
                None
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "failed to resolve bearer token subject");
                None
            }
        }
    }

    /// The user behind the bearer token, resolved once per guard
    pub async fn current_user(&self) -> Option<&User> {
        self.identity().await.map(|i| &i.user)
    }

    /// Scopes granted to the bearer token, empty for guests
    pub async fn scopes(&self) -> ScopeSet {
        self.identity()
            .await
            .map(|i| i.claims.scopes())
            .unwrap_or_default()
    }

    pub async fn is_guest(&self) -> bool {
        self.current_user().await.is_none()
    }

    /// Check an email/password pair against the user store.
    ///
    /// Empty credentials are rejected immediately. Everything else takes at
    /// least the configured floor.
    pub async fn validate(&mut self, credentials: &Credentials) -> bool {
        self.last_attempted = None;

        if credentials.is_empty() {
            return false;
        }

        let provider = Arc::clone(&self.provider);
        let outcome = self
            .timebox
            .run(|early| async move {
                let user = match provider.retrieve_by_credentials(credentials).await {
                    Ok(Some(user)) => user,
                    Ok(None) => {
                        early.signal();
                        return Ok(None);
                    }
                    Err(e) => {
                        early.signal();
                        return Err(e);
                    }
                };

                Ok(provider
                    .validate_credentials(&user, credentials)
                    .then_some(user))
            })
            .await;

        match outcome {
            Ok(Some(user)) => {
                tracing::debug!(user_id = %user.id, "credentials validated");
                self.last_attempted = Some(user);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!(error = %e, "credential validation failed");
                false
            }
        }
    }

    /// User from the last successful `validate`
    pub fn last_attempted(&self) -> Option<&User> {
        self.last_attempted.as_ref()
    }
}
