//! Time-based one-time passwords (RFC 6238)
//!
//! Codes are 6 digits, SHA-1, with one window of clock drift tolerated either
//! side. Email codes live for 5 minutes; authenticator apps use the usual
//! 30 second window.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::users::{StoreError, TwoFactorSecretStore, User};

/// Secret length used when a user gets their first code
pub const DEFAULT_SECRET_LENGTH: usize = 32;

const DIGITS: usize = 6;
const SKEW: u8 = 1;

/// How a user receives second-factor codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorMethod {
    #[default]
    Email,
    AuthenticatorApp,
}

impl TwoFactorMethod {
    /// TOTP step in seconds
    pub fn period(self) -> u64 {
        match self {
            TwoFactorMethod::Email => 300,
            TwoFactorMethod::AuthenticatorApp => 30,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TwoFactorMethod::Email => "email",
            TwoFactorMethod::AuthenticatorApp => "authenticator_app",
        }
    }
}

impl fmt::Display for TwoFactorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TwoFactorMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(TwoFactorMethod::Email),
            "authenticator_app" => Ok(TwoFactorMethod::AuthenticatorApp),
            other => Err(format!("unknown two-factor method: {other}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TwoFactorError {
    #[error("Secret length must be a power of two and at least 16 bytes, got {0}")]
    InvalidLength(usize),
    #[error("Two factor authentication is not enabled for this user.")]
    NotEnabled,
    #[error("Stored two-factor secret is not valid base32")]
    MalformedSecret,
    #[error("Invalid TOTP parameters: {0}")]
    Totp(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Random secret of `length` bytes, base32 encoded (uppercase, unpadded)
pub fn generate_secret(length: usize) -> Result<String, TwoFactorError> {
    if length < 16 || !length.is_power_of_two() {
        return Err(TwoFactorError::InvalidLength(length));
    }

    let mut bytes = vec![0u8; length];
    rand::rng().fill_bytes(&mut bytes);
    Ok(Secret::Raw(bytes).to_encoded().to_string())
}

fn unix_now() -> u64 {
    u64::try_from(OffsetDateTime::now_utc().unix_timestamp()).unwrap_or_default()
}

/// Issues and verifies second-factor codes
#[derive(Clone)]
pub struct SecondFactorService {
    issuer: String,
    secrets: Arc<dyn TwoFactorSecretStore>,
}

impl SecondFactorService {
    /// `issuer` is the application name shown in authenticator apps
    pub fn new(issuer: impl Into<String>, secrets: Arc<dyn TwoFactorSecretStore>) -> Self {
        Self {
            issuer: issuer.into(),
            secrets,
        }
    }

    fn totp(&self, user: &User, secret: &str) -> Result<TOTP, TwoFactorError> {
        let bytes = Secret::Encoded(secret.to_string())
            .to_bytes()
            .map_err(|_| TwoFactorError::MalformedSecret)?;

        Ok(TOTP::new_unchecked(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            user.two_factor_method.period(),
            bytes,
            Some(self.issuer.clone()),
            user.email.clone(),
        ))
    }

    /// The user's secret, creating and persisting one on first use.
    ///
    /// Concurrent callers converge on whichever secret was stored first.
    pub async fn ensure_secret(&self, user: &User) -> Result<String, TwoFactorError> {
        if let Some(secret) = &user.two_factor_secret {
            return Ok(secret.clone());
        }

        let candidate = generate_secret(DEFAULT_SECRET_LENGTH)?;
        let stored = self
            .secrets
            .store_secret_if_absent(user.id, &candidate)
            .await?;

        if stored == candidate {
            tracing::info!(user_id = %user.id, "two-factor secret created");
        }
        Ok(stored)
    }

    /// Code for the current window, creating the user's secret if needed
    pub async fn issue_email_code(&self, user: &User) -> Result<String, TwoFactorError> {
        let secret = self.ensure_secret(user).await?;
        self.code_at(user, &secret, unix_now())
    }

    pub fn code_at(&self, user: &User, secret: &str, unix_time: u64) -> Result<String, TwoFactorError> {
        Ok(self.totp(user, secret)?.generate(unix_time))
    }

    /// Check `code` against the current window and its neighbours
    pub fn verify(&self, user: &User, code: &str) -> bool {
        self.verify_at(user, code, unix_now())
    }

    pub fn verify_at(&self, user: &User, code: &str, unix_time: u64) -> bool {
        let Some(secret) = &user.two_factor_secret else {
            return false;
        };

        match self.totp(user, secret) {
            Ok(totp) => totp.check(code.trim(), unix_time),
            Err(e) => {
                tracing::error!(user_id = %user.id, error = %e, "two-factor verification failed");
                false
            }
        }
    }

    /// `otpauth://` URI for enrolling an authenticator app
    pub async fn provisioning_uri(&self, user: &User) -> Result<String, TwoFactorError> {
        let secret = self.ensure_secret(user).await?;
        let bytes = Secret::Encoded(secret)
            .to_bytes()
            .map_err(|_| TwoFactorError::MalformedSecret)?;

        let totp = TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            user.two_factor_method.period(),
            bytes,
            Some(self.issuer.clone()),
            user.email.clone(),
        )
        .map_err(|e| TwoFactorError::Totp(e.to_string()))?;

        Ok(totp.get_url())
    }
}
