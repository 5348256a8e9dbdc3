//! Token scopes
//!
//! A token carries its granted scopes in the space-separated `scope` claim.
//! `*` (full access) and `2fa-challenge` (second factor pending) can never be
//! held together: a token is either waiting on a second factor or it is not.

use std::fmt;

/// A single authorization scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// `*` - every scope
    All,
    /// `2fa-challenge` - the bearer still has to complete a second factor
    TwoFactorChallenge,
    /// `read`
    Read,
    /// `write`
    Write,
    /// Any other scope token
    Other(String),
}

impl Scope {
    pub fn as_str(&self) -> &str {
        match self {
            Scope::All => "*",
            Scope::TwoFactorChallenge => "2fa-challenge",
            Scope::Read => "read",
            Scope::Write => "write",
            Scope::Other(value) => value,
        }
    }

    /// Scopes are joined with spaces inside the claim, so an empty token or
    /// one containing whitespace can never round-trip.
    pub fn is_valid(&self) -> bool {
        let value = self.as_str();
        !value.is_empty() && !value.chars().any(char::is_whitespace)
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        match value {
            "*" => Scope::All,
            "2fa-challenge" => Scope::TwoFactorChallenge,
            "read" => Scope::Read,
            "write" => Scope::Write,
            other => Scope::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("Can not add 2FA challenge scope when all scopes are granted.")]
    ChallengeWithFullAccess,
    #[error("Can not grant all scopes when 2FA challenge scope is present.")]
    FullAccessWithChallenge,
}

/// Ordered, de-duplicated set of scopes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet {
    scopes: Vec<Scope>,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the value of a `scope` claim. Invalid entries are dropped.
    pub fn from_claim(value: &str) -> Self {
        let mut set = Self::new();
        for scope in value.split_whitespace().map(Scope::from) {
            if !set.scopes.contains(&scope) {
                set.scopes.push(scope);
            }
        }
        set
    }

    /// Add a scope.
    ///
    /// Returns `Ok(false)` when nothing changed (invalid or already present).
    /// Adding `*` replaces every other scope.
    pub fn insert(&mut self, scope: Scope) -> Result<bool, ScopeError> {
        if !scope.is_valid() || self.scopes.contains(&scope) {
            return Ok(false);
        }

        match scope {
            Scope::TwoFactorChallenge if self.contains(&Scope::All) => {
                Err(ScopeError::ChallengeWithFullAccess)
            }
            Scope::All if self.contains(&Scope::TwoFactorChallenge) => {
                Err(ScopeError::FullAccessWithChallenge)
            }
            Scope::All => {
                self.scopes = vec![Scope::All];
                Ok(true)
            }
            scope => {
                self.scopes.push(scope);
                Ok(true)
            }
        }
    }

    /// Remove a scope, returning whether it was present
    pub fn remove(&mut self, scope: &Scope) -> bool {
        let before = self.scopes.len();
        self.scopes.retain(|s| s != scope);
        self.scopes.len() != before
    }

    pub fn contains(&self, scope: &Scope) -> bool {
        self.scopes.contains(scope)
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter()
    }

    /// Whether the holder has full access and no pending challenge
    pub fn grants_full_access(&self) -> bool {
        self.contains(&Scope::All)
    }

    pub fn is_two_factor_pending(&self) -> bool {
        self.contains(&Scope::TwoFactorChallenge)
    }

    /// Space-joined claim value, `None` when the set is empty
    pub fn to_claim(&self) -> Option<String> {
        if self.scopes.is_empty() {
            return None;
        }
        Some(
            self.scopes
                .iter()
                .map(Scope::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}
