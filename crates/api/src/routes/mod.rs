//! HTTP routes

mod auth;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{guest_only, require_auth, require_full_access, require_two_factor_challenge},
    state::AppState,
};

pub use auth::{LoginPayload, VerifyTwoFactorPayload};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let guest = Router::new()
        .route("/login", post(auth::login))
        .route_layer(from_fn_with_state(state.clone(), guest_only));

    // Layers run outermost-last: require_auth before the scope check
    let challenge = Router::new()
        .route("/two-factor/verify", post(auth::verify_two_factor))
        .route_layer(from_fn(require_two_factor_challenge))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    let authenticated = Router::new()
        .route("/user", get(auth::current_user))
        .route("/two-factor/provisioning-uri", get(auth::provisioning_uri))
        .route_layer(from_fn(require_full_access))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .nest("/api", guest.merge(challenge).merge(authenticated))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{hash_password, MemoryKeyStore, TwoFactorMethod};
    use crate::config::Config;
    use crate::users::{MemoryUserStore, User};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const PRIVATE_PEM: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/fixtures/jwt_private.pem"
    ));
    const PUBLIC_PEM: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/fixtures/jwt_public.pem"
    ));

    struct TestApp {
        app: Router,
        state: AppState,
        store: Arc<MemoryUserStore>,
    }

    async fn test_app(users: Vec<User>) -> TestApp {
        let mut config = Config::default();
        config.minimum_credential_check = Duration::ZERO;

        let keys = Arc::new(
            MemoryKeyStore::new()
                .with_key(&config.jwt.keys.private_key_filename, PRIVATE_PEM)
                .with_key(&config.jwt.keys.public_key_filename, PUBLIC_PEM),
        );
        let store = Arc::new(MemoryUserStore::new());
        for user in users {
            store.insert(user).await;
        }

        let state = AppState::new(config, store.clone(), keys).unwrap();
        TestApp {
            app: router(state.clone()),
            state,
            store,
        }
    }

    fn plain_user() -> User {
        User::new("Ada", "a@x.com", hash_password("pw").unwrap()).without_two_factor()
    }

    fn app_user() -> User {
        let mut user = User::new("Grace", "g@x.com", hash_password("pw").unwrap())
            .with_two_factor(TwoFactorMethod::AuthenticatorApp);
        user.two_factor_secret = Some("JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP".into());
        user
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn login(app: &Router, email: &str, password: &str) -> (StatusCode, Value) {
        send(
            app,
            "POST",
            "/api/login",
            None,
            Some(json!({ "email": email, "password": password })),
        )
        .await
    }

    #[tokio::test]
    async fn test_health() {
        let t = test_app(vec![]).await;
        let (status, body) = send(&t.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_login_and_fetch_user() {
        let user = plain_user();
        let t = test_app(vec![user.clone()]).await;

        let (status, body) = login(&t.app, "a@x.com", "pw").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["user"]["email"], "a@x.com");
        assert_eq!(body["data"]["requires_two_factor_challenge"], false);
        assert_eq!(body["data"]["token"]["type"], "Bearer");

        let token = body["data"]["token"]["access_token"].as_str().unwrap();
        let (status, body) = send(&t.app, "GET", "/api/user", Some(token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], user.id.to_string());
    }

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let t = test_app(vec![plain_user()]).await;

        let (status, body) = login(&t.app, "a@x.com", "wrong").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "These credentials do not match our records.");

        let (status, _) = login(&t.app, "nobody@x.com", "pw").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_validates_input() {
        let t = test_app(vec![]).await;

        let (status, body) = send(&t.app, "POST", "/api/login", None, Some(json!({}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["errors"]["email"].is_array());

        let (status, body) = login(&t.app, "a@x.com", "").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["errors"]["password"].is_array());
    }

    #[tokio::test]
    async fn test_login_is_guest_only() {
        let t = test_app(vec![plain_user()]).await;
        let (_, body) = login(&t.app, "a@x.com", "pw").await;
        let token = body["data"]["token"]["access_token"].as_str().unwrap();

        let (status, _) = send(
            &t.app,
            "POST",
            "/api/login",
            Some(token),
            Some(json!({ "email": "a@x.com", "password": "pw" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // A garbage token is treated as a guest
        let (status, _) = send(
            &t.app,
            "POST",
            "/api/login",
            Some("garbage"),
            Some(json!({ "email": "a@x.com", "password": "pw" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_user_requires_token() {
        let t = test_app(vec![]).await;
        let (status, _) = send(&t.app, "GET", "/api/user", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&t.app, "GET", "/api/user", Some("not.a.jwt"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_two_factor_round_trip_over_http() {
        let user = app_user();
        let t = test_app(vec![user.clone()]).await;

        let (status, body) = login(&t.app, "g@x.com", "pw").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["user"].is_null());
        assert_eq!(body["data"]["requires_two_factor_challenge"], true);
        assert_eq!(body["data"]["two_factor_method"], "authenticator_app");
        let challenge = body["data"]["token"]["access_token"].as_str().unwrap().to_string();

        // The challenge token does not grant access to the API
        let (status, _) = send(&t.app, "GET", "/api/user", Some(&challenge), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/two-factor/verify",
            Some(&challenge),
            Some(json!({ "code": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["errors"]["code"].is_array());

        let stored = t.store.find(user.id).await.unwrap();
        let secret = stored.two_factor_secret.clone().unwrap();
        let now = time::OffsetDateTime::now_utc().unix_timestamp() as u64;
        let code = t.state.flow.two_factor().code_at(&stored, &secret, now).unwrap();

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/two-factor/verify",
            Some(&challenge),
            Some(json!({ "code": code })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["user"]["id"], user.id.to_string());
        let full = body["data"]["token"]["access_token"].as_str().unwrap();

        let (status, _) = send(&t.app, "GET", "/api/user", Some(full), None).await;
        assert_eq!(status, StatusCode::OK);

        // A full token can not be used to complete a challenge again
        let (status, _) = send(
            &t.app,
            "POST",
            "/api/two-factor/verify",
            Some(full),
            Some(json!({ "code": code })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_wrong_code_is_a_field_error() {
        let user = app_user();
        let t = test_app(vec![user.clone()]).await;
        let (_, body) = login(&t.app, "g@x.com", "pw").await;
        let challenge = body["data"]["token"]["access_token"].as_str().unwrap().to_string();

        let stored = t.store.find(user.id).await.unwrap();
        let secret = stored.two_factor_secret.clone().unwrap();
        let now = time::OffsetDateTime::now_utc().unix_timestamp() as u64;
        let valid = t.state.flow.two_factor().code_at(&stored, &secret, now).unwrap();
        let wrong = if valid == "000000" { "111111" } else { "000000" };

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/two-factor/verify",
            Some(&challenge),
            Some(json!({ "code": wrong })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["errors"]["code"][0], "The code is invalid.");
    }

    #[tokio::test]
    async fn test_provisioning_uri_for_enrolled_app_user() {
        let user = app_user();
        let t = test_app(vec![user.clone(), plain_user()]).await;

        let (_, body) = login(&t.app, "g@x.com", "pw").await;
        let challenge = body["data"]["token"]["access_token"].as_str().unwrap().to_string();

        // Not reachable while the second factor is pending
        let (status, _) = send(
            &t.app,
            "GET",
            "/api/two-factor/provisioning-uri",
            Some(&challenge),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let secret = user.two_factor_secret.clone().unwrap();
        let now = time::OffsetDateTime::now_utc().unix_timestamp() as u64;
        let code = t.state.flow.two_factor().code_at(&user, &secret, now).unwrap();
        let (_, body) = send(
            &t.app,
            "POST",
            "/api/two-factor/verify",
            Some(&challenge),
            Some(json!({ "code": code })),
        )
        .await;
        let full = body["data"]["token"]["access_token"].as_str().unwrap().to_string();

        let (status, body) = send(
            &t.app,
            "GET",
            "/api/two-factor/provisioning-uri",
            Some(&full),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let uri = body["data"]["otpauth_url"].as_str().unwrap();
        assert!(uri.starts_with("otpauth://totp/"));
        assert!(uri.contains(&format!("secret={secret}")));
    }

    #[tokio::test]
    async fn test_provisioning_uri_requires_authenticator_app() {
        let t = test_app(vec![plain_user()]).await;
        let (_, body) = login(&t.app, "a@x.com", "pw").await;
        let token = body["data"]["token"]["access_token"].as_str().unwrap().to_string();

        let (status, _) = send(
            &t.app,
            "GET",
            "/api/two-factor/provisioning-uri",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
