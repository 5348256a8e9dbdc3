//! Edge Case Tests for Authentication System
//!
//! Tests the login and second-factor protocols end to end:
//! - Token issuance and decoding
//! - Scope rules on issued tokens
//! - Credential check timing
//! - Second-factor completion

use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use uuid::Uuid;

use super::claims::{ClaimSetBuilder, ClaimValue};
use super::codec::TokenCodec;
use super::flow::{AuthEvents, AuthenticationFlow};
use super::guard::{CredentialGuard, Credentials, LoginRequest};
use super::keys::MemoryKeyStore;
use super::password::hash_password;
use super::scope::{Scope, ScopeError};
use super::two_factor::{SecondFactorService, TwoFactorMethod};
use crate::config::{JwtConfig, KeyConfig};
use crate::error::AuthError;
use crate::users::{MemoryUserStore, User};

const PRIVATE_PEM: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/fixtures/jwt_private.pem"
));
const PUBLIC_PEM: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/fixtures/jwt_public.pem"
));

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Authenticated(Uuid),
    ChallengeInitiated(Uuid),
}

#[derive(Default)]
struct RecordingEvents {
    events: Mutex<Vec<Event>>,
}

impl RecordingEvents {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl AuthEvents for RecordingEvents {
    fn authenticated(&self, user: &User) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Authenticated(user.id));
    }

    fn two_factor_challenge_initiated(&self, user: &User) {
        self.events
            .lock()
            .unwrap()
            .push(Event::ChallengeInitiated(user.id));
    }
}

fn jwt_config() -> JwtConfig {
    JwtConfig {
        keys: KeyConfig {
            private_key: Some(SecretString::from(PRIVATE_PEM.to_string())),
            public_key: Some(PUBLIC_PEM.to_string()),
            ..KeyConfig::default()
        },
        ..JwtConfig::default()
    }
}

fn codec() -> Arc<TokenCodec> {
    let jwt = jwt_config();
    Arc::new(TokenCodec::new(&jwt.algorithm, jwt.keys, Arc::new(MemoryKeyStore::new())).unwrap())
}

struct Harness {
    flow: AuthenticationFlow,
    codec: Arc<TokenCodec>,
    store: Arc<MemoryUserStore>,
    events: Arc<RecordingEvents>,
}

async fn harness(users: Vec<User>, floor: Duration) -> Harness {
    let store = Arc::new(MemoryUserStore::new());
    for user in users {
        store.insert(user).await;
    }

    let codec = codec();
    let events = Arc::new(RecordingEvents::default());
    let flow = AuthenticationFlow::new(
        store.clone(),
        codec.clone(),
        SecondFactorService::new("Passgate", store.clone()),
        events.clone(),
        jwt_config(),
        floor,
    );

    Harness {
        flow,
        codec,
        store,
        events,
    }
}

fn user(email: &str) -> User {
    User::new("Ada", email, hash_password("pw").unwrap())
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

// =========================================================================
// Token issuance
// =========================================================================

#[test]
fn test_issued_claims_round_trip_exactly() {
    let user = user("a@x.com");
    let codec = codec();

    let mut builder = ClaimSetBuilder::for_user(&user, &jwt_config());
    builder
        .mark_issued_now()
        .set_claim("tenant", "acme")
        .set_claim("level", 3_i64)
        .set_claim("beta", true)
        .set_claim("ratio", 0.5_f64)
        .add_scope(Scope::Read)
        .unwrap()
        .add_scope(Scope::Write)
        .unwrap();
    let claims = builder.build();

    let decoded = codec.decode(&codec.encode(&claims).unwrap()).unwrap();
    assert_eq!(decoded, claims);
    assert_eq!(decoded.get("tenant"), Some(ClaimValue::String("acme".into())));
    assert_eq!(decoded.get("level"), Some(ClaimValue::Int(3)));
    assert_eq!(decoded.get("scope"), Some(ClaimValue::String("read write".into())));
}

#[test]
fn test_lifetime_is_measured_from_issue_time() {
    let user = user("a@x.com");
    for minutes in [0_i64, 1, 60, -15] {
        let mut builder = ClaimSetBuilder::for_user(&user, &jwt_config());
        let before = unix_now();
        builder.set_lifetime(minutes);
        let exp = builder.build().expires_at().unwrap();
        let after = unix_now();

        let span = minutes.abs() * 60;
        assert!(exp >= before + span && exp <= after + span, "lifetime {minutes}");
    }
}

#[test]
fn test_builders_for_same_user_get_distinct_token_ids() {
    let user = user("a@x.com");
    let first = ClaimSetBuilder::for_user(&user, &jwt_config()).build();
    let second = ClaimSetBuilder::for_user(&user, &jwt_config()).build();

    assert_eq!(first.subject(), second.subject());
    assert_ne!(first.token_id(), second.token_id());
}

// =========================================================================
// Scope rules
// =========================================================================

#[test]
fn test_full_access_collapses_prior_scopes() {
    let mut builder = ClaimSetBuilder::new(Uuid::new_v4().to_string(), "http://localhost", 60);
    builder
        .add_scope(Scope::Read)
        .unwrap()
        .add_scope(Scope::Other("billing".into()))
        .unwrap()
        .add_scope(Scope::All)
        .unwrap();

    assert_eq!(builder.build().get("scope"), Some(ClaimValue::String("*".into())));
}

#[test]
fn test_full_access_and_challenge_conflict_both_ways() {
    let mut builder = ClaimSetBuilder::new(Uuid::new_v4().to_string(), "http://localhost", 60);
    builder.add_scope(Scope::All).unwrap();
    assert!(matches!(
        builder.add_scope(Scope::TwoFactorChallenge),
        Err(ScopeError::ChallengeWithFullAccess)
    ));

    let mut builder = ClaimSetBuilder::new(Uuid::new_v4().to_string(), "http://localhost", 60);
    builder.add_scope(Scope::TwoFactorChallenge).unwrap();
    let err = builder.add_scope(Scope::All).unwrap_err();
    assert!(matches!(err, ScopeError::FullAccessWithChallenge));

    // Surfaces to callers as a scope conflict
    assert!(matches!(AuthError::from(err), AuthError::ScopeConflict(_)));
}

#[test]
fn test_removing_last_scope_drops_the_claim() {
    let mut builder = ClaimSetBuilder::new(Uuid::new_v4().to_string(), "http://localhost", 60);
    builder.add_scope(Scope::Read).unwrap();
    builder.remove_scope(Scope::Read);

    let claims = builder.build();
    assert!(!claims.contains("scope"));
    assert!(claims.scopes().is_empty());
}

// =========================================================================
// Credential check timing
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_unknown_user_and_wrong_password_take_the_same_time() {
    let floor = Duration::from_millis(250);
    let store = Arc::new(MemoryUserStore::new());
    store.insert(user("a@x.com")).await;
    let codec = codec();

    for _ in 0..5 {
        let mut guard = CredentialGuard::new(store.clone(), codec.clone(), floor);
        let started = tokio::time::Instant::now();
        assert!(!guard.validate(&Credentials::new("nobody@x.com", "pw")).await);
        let unknown = started.elapsed();

        let mut guard = CredentialGuard::new(store.clone(), codec.clone(), floor);
        let started = tokio::time::Instant::now();
        assert!(!guard.validate(&Credentials::new("a@x.com", "wrong")).await);
        let wrong_password = started.elapsed();

        assert!(unknown >= floor);
        assert!(wrong_password >= floor);
        let difference = unknown.max(wrong_password) - unknown.min(wrong_password);
        assert!(difference < Duration::from_millis(10), "difference {difference:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_floor_hides_lookup_outcome_on_the_wall_clock() {
    const TRIALS: u32 = 5;
    let floor = Duration::from_millis(200);
    let store = Arc::new(MemoryUserStore::new());
    store.insert(user("a@x.com")).await;
    let codec = codec();

    let mut unknown_total = Duration::ZERO;
    let mut wrong_total = Duration::ZERO;

    for _ in 0..TRIALS {
        let mut guard = CredentialGuard::new(store.clone(), codec.clone(), floor);
        let started = std::time::Instant::now();
        assert!(!guard.validate(&Credentials::new("nobody@x.com", "pw")).await);
        let unknown = started.elapsed();

        let mut guard = CredentialGuard::new(store.clone(), codec.clone(), floor);
        let started = std::time::Instant::now();
        assert!(!guard.validate(&Credentials::new("a@x.com", "wrong")).await);
        let wrong_password = started.elapsed();

        assert!(unknown >= floor, "unknown user took {unknown:?}");
        assert!(wrong_password >= floor, "wrong password took {wrong_password:?}");
        unknown_total += unknown;
        wrong_total += wrong_password;
    }

    let unknown_mean = unknown_total / TRIALS;
    let wrong_mean = wrong_total / TRIALS;
    let difference = unknown_mean.max(wrong_mean) - unknown_mean.min(wrong_mean);
    assert!(
        difference < Duration::from_millis(10),
        "unknown {unknown_mean:?} vs wrong password {wrong_mean:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_successful_check_also_waits_for_floor() {
    let floor = Duration::from_millis(250);
    let store = Arc::new(MemoryUserStore::new());
    store.insert(user("a@x.com")).await;

    let mut guard = CredentialGuard::new(store, codec(), floor);
    let started = tokio::time::Instant::now();
    assert!(guard.validate(&Credentials::new("a@x.com", "pw")).await);
    assert!(started.elapsed() >= floor);
}

// =========================================================================
// Login
// =========================================================================

#[tokio::test]
async fn test_login_without_second_factor_grants_full_access() {
    let user = user("a@x.com").without_two_factor();
    let h = harness(vec![user.clone()], Duration::ZERO).await;

    let response = h
        .flow
        .login(&LoginRequest::new("a@x.com", "pw").unwrap())
        .await
        .unwrap();

    assert_eq!(response.user.as_ref().map(|u| u.id), Some(user.id));
    assert!(!response.requires_two_factor);
    assert!(response.two_factor_method.is_none());

    let claims = h.codec.decode(&response.token).unwrap();
    assert_eq!(claims.subject(), Some(user.id.to_string().as_str()));
    assert!(claims.scopes().grants_full_access());
    assert_eq!(claims.expires_at(), Some(response.expires_at));
    assert_eq!(h.events.take(), vec![Event::Authenticated(user.id)]);
}

#[tokio::test]
async fn test_login_with_wrong_password_issues_nothing() {
    let h = harness(vec![user("a@x.com")], Duration::ZERO).await;

    let err = h
        .flow
        .login(&LoginRequest::new("a@x.com", "nope").unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::AuthenticationFailed));
    assert!(h.events.take().is_empty());
}

#[tokio::test]
async fn test_challenge_token_is_short_lived() {
    let h = harness(vec![user("a@x.com")], Duration::ZERO).await;
    let jwt = jwt_config();

    let before = unix_now();
    let response = h
        .flow
        .login(&LoginRequest::new("a@x.com", "pw").unwrap())
        .await
        .unwrap();

    let span = jwt.two_factor_token_lifetime_minutes * 60;
    assert!(response.expires_at >= before + span);
    assert!(response.expires_at < before + jwt.token_lifetime_minutes * 60);
}

// =========================================================================
// Second-factor completion
// =========================================================================

#[tokio::test]
async fn test_email_second_factor_round_trip() {
    let user = user("a@x.com");
    let h = harness(vec![user.clone()], Duration::ZERO).await;

    let pending = h
        .flow
        .login(&LoginRequest::new("a@x.com", "pw").unwrap())
        .await
        .unwrap();

    assert!(pending.user.is_none());
    assert!(pending.requires_two_factor);
    assert_eq!(pending.two_factor_method, Some(TwoFactorMethod::Email));
    let claims = h.codec.decode(&pending.token).unwrap();
    assert!(claims.scopes().is_two_factor_pending());
    assert!(!claims.scopes().grants_full_access());
    assert_eq!(h.events.take(), vec![Event::ChallengeInitiated(user.id)]);

    let code = h.flow.two_factor().issue_email_code(&user).await.unwrap();

    // The challenge token identifies the user completing the challenge
    let guard = h.flow.guard(Some(pending.token.clone()));
    let challenger = guard.current_user().await.cloned().unwrap();
    assert!(challenger.two_factor_secret.is_some());

    let complete = h
        .flow
        .complete_two_factor_challenge(&challenger, &code)
        .unwrap();
    assert_eq!(complete.user.as_ref().map(|u| u.id), Some(user.id));
    assert!(!complete.requires_two_factor);

    let claims = h.codec.decode(&complete.token).unwrap();
    assert!(claims.scopes().grants_full_access());
    assert_eq!(h.events.take(), vec![Event::Authenticated(user.id)]);
}

#[tokio::test]
async fn test_wrong_code_leaves_pending_token_usable() {
    let user = user("a@x.com");
    let h = harness(vec![user.clone()], Duration::ZERO).await;

    let pending = h
        .flow
        .login(&LoginRequest::new("a@x.com", "pw").unwrap())
        .await
        .unwrap();
    let code = h.flow.two_factor().issue_email_code(&user).await.unwrap();
    let stored = h.store.find(user.id).await.unwrap();
    h.events.take();

    let wrong = if code == "000000" { "111111" } else { "000000" };
    let err = h
        .flow
        .complete_two_factor_challenge(&stored, wrong)
        .unwrap_err();

    assert!(matches!(err, AuthError::InvalidCode));
    assert!(h.events.take().is_empty());
    let claims = h.codec.decode(&pending.token).unwrap();
    assert!(claims.scopes().is_two_factor_pending());

    // The right code still works afterwards
    assert!(h.flow.complete_two_factor_challenge(&stored, &code).is_ok());
}

#[tokio::test]
async fn test_completion_requires_enabled_second_factor() {
    let user = user("a@x.com").without_two_factor();
    let h = harness(vec![user.clone()], Duration::ZERO).await;

    let err = h
        .flow
        .complete_two_factor_challenge(&user, "123456")
        .unwrap_err();
    assert!(matches!(err, AuthError::NotEnabled));
}

#[tokio::test]
async fn test_completion_without_secret_is_invalid_code() {
    let user = user("a@x.com");
    let h = harness(vec![user.clone()], Duration::ZERO).await;

    let err = h
        .flow
        .complete_two_factor_challenge(&user, "123456")
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCode));
}

#[tokio::test]
async fn test_authenticator_app_login_reports_method() {
    let mut user = user("a@x.com").with_two_factor(TwoFactorMethod::AuthenticatorApp);
    user.two_factor_secret = Some(super::two_factor::generate_secret(32).unwrap());
    let h = harness(vec![user.clone()], Duration::ZERO).await;

    let pending = h
        .flow
        .login(&LoginRequest::new("a@x.com", "pw").unwrap())
        .await
        .unwrap();
    assert_eq!(
        pending.two_factor_method,
        Some(TwoFactorMethod::AuthenticatorApp)
    );

    let secret = user.two_factor_secret.clone().unwrap();
    let code = h
        .flow
        .two_factor()
        .code_at(&user, &secret, unix_now() as u64)
        .unwrap();
    assert!(h.flow.complete_two_factor_challenge(&user, &code).is_ok());
}
