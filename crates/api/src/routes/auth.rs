//! Login, second-factor and current-user endpoints

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    auth::{AuthUser, LoginRequest},
    error::{AuthError, AuthResult},
    state::AppState,
    users::UserResource,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginPayload {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VerifyTwoFactorPayload {
    pub code: String,
}

/// POST /api/login
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginPayload>,
) -> AuthResult<Json<Value>> {
    let request = LoginRequest::new(payload.email, payload.password)?;
    let response = state.flow.login(&request).await?;

    Ok(Json(json!({ "data": response })))
}

/// POST /api/two-factor/verify
pub async fn verify_two_factor(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(payload): Json<VerifyTwoFactorPayload>,
) -> AuthResult<Json<Value>> {
    let code = payload.code.trim();
    if code.is_empty() {
        return Err(AuthError::validation("code", "The code field is required."));
    }

    let response = state
        .flow
        .complete_two_factor_challenge(&auth_user.user, code)?;

    Ok(Json(json!({ "data": response })))
}

/// GET /api/user
pub async fn current_user(Extension(auth_user): Extension<AuthUser>) -> Json<Value> {
    Json(json!({ "data": UserResource::from(&auth_user.user) }))
}

/// GET /api/two-factor/provisioning-uri
///
/// Enrollment URI for authenticator apps. Creates the secret on first call.
pub async fn provisioning_uri(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> AuthResult<Json<Value>> {
    let user = &auth_user.user;
    if !user.has_two_factor_enabled() || !user.uses_authenticator_app() {
        return Err(AuthError::NotEnabled);
    }

    let uri = state.flow.two_factor().provisioning_uri(user).await?;
    tracing::info!(user_id = %user.id, "authenticator provisioning URI issued");

    Ok(Json(json!({ "data": { "otpauth_url": uri } })))
}
