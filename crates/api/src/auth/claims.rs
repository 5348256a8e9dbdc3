//! JWT claim sets and the builder that assembles them

use serde::Serialize;
use serde_json::{Map, Number, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use super::scope::{Scope, ScopeError, ScopeSet};
use crate::config::JwtConfig;
use crate::users::User;

/// Claims that are seeded at construction and can never be removed
pub const PROTECTED_CLAIMS: [&str; 4] = ["sub", "jti", "iss", "exp"];

const SCOPE_CLAIM: &str = "scope";

/// Scalar claim value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClaimValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ClaimValue {
    fn into_json(self) -> Option<Value> {
        match self {
            ClaimValue::Bool(b) => Some(Value::Bool(b)),
            ClaimValue::Int(i) => Some(Value::Number(i.into())),
            ClaimValue::Float(f) => Number::from_f64(f).map(Value::Number),
            ClaimValue::String(s) => Some(Value::String(s)),
        }
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(ClaimValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(ClaimValue::Int)
                .or_else(|| n.as_f64().map(ClaimValue::Float)),
            Value::String(s) => Some(ClaimValue::String(s.clone())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ClaimValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ClaimValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<bool> for ClaimValue {
    fn from(value: bool) -> Self {
        ClaimValue::Bool(value)
    }
}

impl From<i64> for ClaimValue {
    fn from(value: i64) -> Self {
        ClaimValue::Int(value)
    }
}

impl From<f64> for ClaimValue {
    fn from(value: f64) -> Self {
        ClaimValue::Float(value)
    }
}

impl From<&str> for ClaimValue {
    fn from(value: &str) -> Self {
        ClaimValue::String(value.to_string())
    }
}

impl From<String> for ClaimValue {
    fn from(value: String) -> Self {
        ClaimValue::String(value)
    }
}

/// Finalized, insertion-ordered claim set
///
/// Serializes as a flat JSON object, which is the body of the signed token.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ClaimSet(Map<String, Value>);

impl ClaimSet {
    /// Accept a decoded JSON object only if every value is a scalar
    pub fn from_json_object(map: Map<String, Value>) -> Option<Self> {
        map.values()
            .all(|v| ClaimValue::from_json(v).is_some())
            .then_some(Self(map))
    }

    pub fn get(&self, name: &str) -> Option<ClaimValue> {
        self.0.get(name).and_then(ClaimValue::from_json)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn subject(&self) -> Option<&str> {
        self.0.get("sub").and_then(Value::as_str)
    }

    pub fn token_id(&self) -> Option<&str> {
        self.0.get("jti").and_then(Value::as_str)
    }

    pub fn issuer(&self) -> Option<&str> {
        self.0.get("iss").and_then(Value::as_str)
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.0.get("exp").and_then(Value::as_i64)
    }

    pub fn scopes(&self) -> ScopeSet {
        self.0
            .get(SCOPE_CLAIM)
            .and_then(Value::as_str)
            .map(ScopeSet::from_claim)
            .unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Accumulates claims for a single token
///
/// Every builder is seeded with `sub`, `jti`, `iss` and `exp`. Scopes go
/// through [`ScopeSet`] so the `scope` claim always reflects its rules.
#[derive(Debug, Clone)]
pub struct ClaimSetBuilder {
    claims: Map<String, Value>,
    scopes: ScopeSet,
}

impl ClaimSetBuilder {
    pub fn new(subject: impl Into<String>, issuer: impl Into<String>, lifetime_minutes: i64) -> Self {
        let mut claims = Map::new();
        claims.insert("sub".into(), Value::String(subject.into()));
        claims.insert(
            "jti".into(),
            Value::String(Uuid::new_v4().simple().to_string()),
        );
        claims.insert("iss".into(), Value::String(issuer.into()));

        let mut builder = Self {
            claims,
            scopes: ScopeSet::new(),
        };
        builder.set_lifetime(lifetime_minutes);
        builder
    }

    /// Builder for `user` with the configured issuer and default lifetime
    pub fn for_user(user: &User, config: &JwtConfig) -> Self {
        Self::new(
            user.id.to_string(),
            config.issuer.clone(),
            config.token_lifetime_minutes,
        )
    }

    /// Set `exp` to now plus `minutes`; the sign of `minutes` is ignored
    pub fn set_lifetime(&mut self, minutes: i64) -> &mut Self {
        let exp = now_unix().saturating_add(minutes.saturating_abs().saturating_mul(60));
        self.claims.insert("exp".into(), Value::Number(exp.into()));
        self
    }

    /// Set `iat` and `nbf` to the current time
    pub fn mark_issued_now(&mut self) -> &mut Self {
        let now = now_unix();
        self.claims.insert("iat".into(), Value::Number(now.into()));
        self.claims.insert("nbf".into(), Value::Number(now.into()));
        self
    }

    /// Set a claim, replacing any earlier value.
    ///
    /// The `scope` claim is owned by the scope set and only changes through
    /// [`add_scope`](Self::add_scope) and [`remove_scope`](Self::remove_scope).
    pub fn set_claim(&mut self, name: impl Into<String>, value: impl Into<ClaimValue>) -> &mut Self {
        let name = name.into();
        if name == SCOPE_CLAIM {
            tracing::warn!("ignoring direct write to the scope claim");
            return self;
        }
        if let Some(value) = value.into().into_json() {
            self.claims.insert(name, value);
        }
        self
    }

    pub fn set_claims<I, K, V>(&mut self, claims: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ClaimValue>,
    {
        for (name, value) in claims {
            self.set_claim(name, value);
        }
        self
    }

    /// Remove a claim. Protected claims are left untouched.
    pub fn unset_claim(&mut self, name: &str) -> &mut Self {
        if PROTECTED_CLAIMS.contains(&name) {
            return self;
        }
        if name == SCOPE_CLAIM {
            self.scopes = ScopeSet::new();
        }
        self.claims.remove(name);
        self
    }

    pub fn add_scope(&mut self, scope: impl Into<Scope>) -> Result<&mut Self, ScopeError> {
        if self.scopes.insert(scope.into())? {
            self.sync_scope_claim();
        }
        Ok(self)
    }

    pub fn remove_scope(&mut self, scope: impl Into<Scope>) -> &mut Self {
        if self.scopes.remove(&scope.into()) {
            self.sync_scope_claim();
        }
        self
    }

    fn sync_scope_claim(&mut self) {
        match self.scopes.to_claim() {
            Some(value) => {
                self.claims.insert(SCOPE_CLAIM.into(), Value::String(value));
            }
            None => {
                self.claims.remove(SCOPE_CLAIM);
            }
        }
    }

    /// Snapshot of the claims; later builder changes do not affect it
    pub fn build(&self) -> ClaimSet {
        ClaimSet(self.claims.clone())
    }
}
