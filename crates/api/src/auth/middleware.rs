//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::scope::ScopeSet;
use crate::error::AuthError;
use crate::state::AppState;
use crate::users::User;

/// Authenticated caller, inserted into request extensions by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub scopes: ScopeSet,
}

/// Extract the token from an `Authorization: Bearer <token>` header
pub fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(String::from)
}

/// Middleware that requires a valid bearer token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let token = extract_bearer_token(&request);
    if token.is_none() {
        tracing::debug!(path = %path, "require_auth: no bearer token");
        return AuthError::AuthenticationFailed.into_response();
    }

    let guard = state.guard(token);
    let Some(user) = guard.current_user().await.cloned() else {
        tracing::warn!(path = %path, "require_auth: authentication failed");
        return AuthError::AuthenticationFailed.into_response();
    };
    let scopes = guard.scopes().await;

    tracing::debug!(path = %path, user_id = %user.id, "require_auth: authentication successful");
    request.extensions_mut().insert(AuthUser { user, scopes });
    next.run(request).await
}

/// Middleware that only lets unauthenticated callers through
pub async fn guest_only(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = extract_bearer_token(&request);
    if token.is_some() && !state.guard(token).is_guest().await {
        return AuthError::AlreadyAuthenticated.into_response();
    }
    next.run(request).await
}

fn require_scope(request: &Request, check: impl Fn(&ScopeSet) -> bool) -> Result<(), AuthError> {
    match request.extensions().get::<AuthUser>() {
        Some(auth_user) if check(&auth_user.scopes) => Ok(()),
        Some(auth_user) => {
            tracing::warn!(
                path = %request.uri().path(),
                user_id = %auth_user.user.id,
                "token lacks required scope"
            );
            Err(AuthError::InsufficientScope)
        }
        None => Err(AuthError::AuthenticationFailed),
    }
}

/// Middleware (after [`require_auth`]) that requires the `*` scope
pub async fn require_full_access(request: Request, next: Next) -> Response {
    match require_scope(&request, ScopeSet::grants_full_access) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Middleware (after [`require_auth`]) that requires a pending `2fa-challenge`
pub async fn require_two_factor_challenge(request: Request, next: Next) -> Response {
    match require_scope(&request, ScopeSet::is_two_factor_pending) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
