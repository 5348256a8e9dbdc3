//! Login and second-factor completion
//!
//! Both protocols stop at the first failure. A token is only signed after
//! the credentials (or the code) checked out, and side effects fire only
//! after signing succeeded.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;

use super::claims::{ClaimSet, ClaimSetBuilder};
use super::codec::{CodecError, TokenCodec};
use super::guard::{CredentialGuard, LoginRequest};
use super::scope::Scope;
use super::two_factor::{SecondFactorService, TwoFactorMethod};
use crate::config::JwtConfig;
use crate::email::ChallengeNotifier;
use crate::error::{AuthError, AuthResult};
use crate::users::{User, UserProvider, UserResource};

/// Outcome of a successful login or second-factor completion
#[derive(Debug, Clone)]
pub struct AuthenticationResponse {
    /// Only present once no second factor is pending
    pub user: Option<User>,
    pub token: String,
    /// Unix seconds
    pub expires_at: i64,
    pub requires_two_factor: bool,
    /// Only present while a second factor is pending
    pub two_factor_method: Option<TwoFactorMethod>,
}

#[derive(Serialize)]
struct TokenBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    access_token: &'a str,
    expires_at: String,
}

#[derive(Serialize)]
struct ResponseBody<'a> {
    user: Option<UserResource>,
    requires_two_factor_challenge: bool,
    two_factor_method: Option<TwoFactorMethod>,
    token: TokenBody<'a>,
}

impl Serialize for AuthenticationResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ResponseBody {
            user: self.user.as_ref().map(UserResource::from),
            requires_two_factor_challenge: self.requires_two_factor,
            two_factor_method: self.two_factor_method,
            token: TokenBody {
                kind: "Bearer",
                access_token: &self.token,
                expires_at: self.expires_at.to_string(),
            },
        }
        .serialize(serializer)
    }
}

/// Side effects that follow a successful authentication step
pub trait AuthEvents: Send + Sync {
    /// A full-access token was issued
    fn authenticated(&self, user: &User);

    /// A challenge token was issued and the user must supply a code
    fn two_factor_challenge_initiated(&self, user: &User);
}

/// Default event sink: logs events and sends email codes in the background
#[derive(Clone)]
pub struct ChallengeDispatcher {
    two_factor: SecondFactorService,
    notifier: Arc<dyn ChallengeNotifier>,
}

impl ChallengeDispatcher {
    pub fn new(two_factor: SecondFactorService, notifier: Arc<dyn ChallengeNotifier>) -> Self {
        Self {
            two_factor,
            notifier,
        }
    }

    /// Issue and send an email code on a background task.
    ///
    /// Returns `None` for authenticator-app users, who already hold the secret.
    pub fn dispatch(&self, user: &User) -> Option<JoinHandle<()>> {
        if user.uses_authenticator_app() {
            tracing::debug!(user_id = %user.id, "authenticator app user, no code sent");
            return None;
        }

        let two_factor = self.two_factor.clone();
        let notifier = Arc::clone(&self.notifier);
        let user = user.clone();

        Some(tokio::spawn(async move {
            let code = match two_factor.issue_email_code(&user).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(user_id = %user.id, error = %e, "failed to issue two-factor code");
                    return;
                }
            };

            if let Err(e) = notifier.send_two_factor_code(&user, &code).await {
                tracing::error!(user_id = %user.id, error = %e, "failed to deliver two-factor code");
            }
        }))
    }
}

impl AuthEvents for ChallengeDispatcher {
    fn authenticated(&self, user: &User) {
        tracing::info!(user_id = %user.id, "user authenticated");
    }

    fn two_factor_challenge_initiated(&self, user: &User) {
        tracing::info!(
            user_id = %user.id,
            method = %user.two_factor_method,
            "two-factor challenge initiated"
        );
        // Delivery is fire-and-forget
        let _ = self.dispatch(user);
    }
}

pub struct AuthenticationFlow {
    provider: Arc<dyn UserProvider>,
    codec: Arc<TokenCodec>,
    two_factor: SecondFactorService,
    events: Arc<dyn AuthEvents>,
    jwt: JwtConfig,
    floor: Duration,
}

impl AuthenticationFlow {
    pub fn new(
        provider: Arc<dyn UserProvider>,
        codec: Arc<TokenCodec>,
        two_factor: SecondFactorService,
        events: Arc<dyn AuthEvents>,
        jwt: JwtConfig,
        floor: Duration,
    ) -> Self {
        Self {
            provider,
            codec,
            two_factor,
            events,
            jwt,
            floor,
        }
    }

    /// Fresh guard for one request
    pub fn guard(&self, bearer: Option<String>) -> CredentialGuard {
        CredentialGuard::new(Arc::clone(&self.provider), Arc::clone(&self.codec), self.floor)
            .with_bearer(bearer)
    }

    pub fn two_factor(&self) -> &SecondFactorService {
        &self.two_factor
    }

    /// Email/password login.
    ///
    /// Users with a second factor get a short-lived `2fa-challenge` token and
    /// no user block; everyone else gets a full-access token.
    pub async fn login(&self, request: &LoginRequest) -> AuthResult<AuthenticationResponse> {
        let mut guard = self.guard(None);
        if !guard.validate(request.credentials()).await {
            tracing::info!("login failed");
            return Err(AuthError::AuthenticationFailed);
        }

        let user = guard
            .last_attempted()
            .cloned()
            .ok_or(AuthError::AuthenticationFailed)?;
        let requires_two_factor = user.has_two_factor_enabled();

        let mut builder = ClaimSetBuilder::for_user(&user, &self.jwt);
        builder.mark_issued_now();
        if requires_two_factor {
            builder
                .set_lifetime(self.jwt.two_factor_token_lifetime_minutes)
                .add_scope(Scope::TwoFactorChallenge)?;
        } else {
            builder.add_scope(Scope::All)?;
        }

        let claims = builder.build();
        let token = self.sign(&claims)?;

        if requires_two_factor {
            self.events.two_factor_challenge_initiated(&user);
        } else {
            self.events.authenticated(&user);
        }

        Ok(AuthenticationResponse {
            two_factor_method: requires_two_factor.then_some(user.two_factor_method),
            user: (!requires_two_factor).then_some(user),
            token,
            expires_at: claims.expires_at().unwrap_or_default(),
            requires_two_factor,
        })
    }

    /// Exchange a valid code for a full-access token.
    ///
    /// `user` is the subject of the caller's `2fa-challenge` token.
    pub fn complete_two_factor_challenge(
        &self,
        user: &User,
        code: &str,
    ) -> AuthResult<AuthenticationResponse> {
        if !user.has_two_factor_enabled() {
            return Err(AuthError::NotEnabled);
        }

        if !self.two_factor.verify(user, code) {
            tracing::info!(user_id = %user.id, "invalid two-factor code");
            return Err(AuthError::InvalidCode);
        }

        let mut builder = ClaimSetBuilder::for_user(user, &self.jwt);
        builder.mark_issued_now().add_scope(Scope::All)?;

        let claims = builder.build();
        let token = self.sign(&claims)?;

        self.events.authenticated(user);

        Ok(AuthenticationResponse {
            user: Some(user.clone()),
            token,
            expires_at: claims.expires_at().unwrap_or_default(),
            requires_two_factor: false,
            two_factor_method: None,
        })
    }

    fn sign(&self, claims: &ClaimSet) -> AuthResult<String> {
        self.codec.encode(claims).map_err(|e| match e {
            CodecError::KeyNotFound { name, .. } => AuthError::KeyNotFound(name),
            _ => AuthError::TokenIssuanceFailed,
        })
    }
}
