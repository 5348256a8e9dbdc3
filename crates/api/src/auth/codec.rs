//! JWT encoding and decoding
//!
//! Keys are resolved on first use (inline configuration first, then the key
//! store) and cached for the lifetime of the codec. After that the codec never
//! touches the store again, so one instance can be shared across requests.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};

use super::claims::ClaimSet;
use super::keys::KeyStore;
use crate::config::KeyConfig;

/// Which half of the key material an operation needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Signing,
    Verification,
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRole::Signing => f.write_str("signing"),
            KeyRole::Verification => f.write_str("verification"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported JWT algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("{role} key not found: {name}")]
    KeyNotFound { role: KeyRole, name: String },
    #[error("Failed to read {role} key: {source}")]
    Storage {
        role: KeyRole,
        #[source]
        source: io::Error,
    },
    #[error("Invalid {role} key: {source}")]
    InvalidKey {
        role: KeyRole,
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    #[error("JWT encoding failed: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Hmac,
    Rsa,
    Ec,
    Ed,
}

impl KeyFamily {
    fn of(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => KeyFamily::Hmac,
            Algorithm::ES256 | Algorithm::ES384 => KeyFamily::Ec,
            Algorithm::EdDSA => KeyFamily::Ed,
            _ => KeyFamily::Rsa,
        }
    }
}

/// Signs claim sets into compact JWTs and verifies them again
pub struct TokenCodec {
    algorithm: Algorithm,
    keys: KeyConfig,
    store: Arc<dyn KeyStore>,
    signing_key: OnceLock<EncodingKey>,
    verification_key: OnceLock<DecodingKey>,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("algorithm", &self.algorithm)
            .field("signing_key_loaded", &self.signing_key.get().is_some())
            .field("verification_key_loaded", &self.verification_key.get().is_some())
            .finish()
    }
}

impl TokenCodec {
    pub fn new(
        algorithm: &str,
        keys: KeyConfig,
        store: Arc<dyn KeyStore>,
    ) -> Result<Self, CodecError> {
        let algorithm = Algorithm::from_str(algorithm)
            .map_err(|_| CodecError::UnsupportedAlgorithm(algorithm.to_string()))?;

        Ok(Self {
            algorithm,
            keys,
            store,
            signing_key: OnceLock::new(),
            verification_key: OnceLock::new(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn family(&self) -> KeyFamily {
        KeyFamily::of(self.algorithm)
    }

    /// Raw key bytes for `role`: inline configuration, else the key store.
    /// HMAC algorithms use the private/secret settings for both roles.
    fn resolve(&self, role: KeyRole) -> Result<Vec<u8>, CodecError> {
        let role_for_source = if self.family() == KeyFamily::Hmac {
            KeyRole::Signing
        } else {
            role
        };

        let (inline, filename) = match role_for_source {
            KeyRole::Signing => (
                self.keys
                    .private_key
                    .as_ref()
                    .map(|k| k.expose_secret().as_bytes().to_vec()),
                &self.keys.private_key_filename,
            ),
            KeyRole::Verification => (
                self.keys.public_key.as_ref().map(|k| k.as_bytes().to_vec()),
                &self.keys.public_key_filename,
            ),
        };

        if let Some(inline) = inline.filter(|k| !k.is_empty()) {
            return Ok(inline);
        }

        if !self.store.exists(filename) {
            return Err(CodecError::KeyNotFound {
                role,
                name: filename.clone(),
            });
        }

        self.store.get(filename).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => CodecError::KeyNotFound {
                role,
                name: filename.clone(),
            },
            _ => CodecError::Storage { role, source },
        })
    }

    fn signing_key(&self) -> Result<&EncodingKey, CodecError> {
        if let Some(key) = self.signing_key.get() {
            return Ok(key);
        }

        let material = self.resolve(KeyRole::Signing)?;
        let key = match self.family() {
            KeyFamily::Hmac => Ok(EncodingKey::from_secret(&material)),
            KeyFamily::Rsa => EncodingKey::from_rsa_pem(&material),
            KeyFamily::Ec => EncodingKey::from_ec_pem(&material),
            KeyFamily::Ed => EncodingKey::from_ed_pem(&material),
        }
        .map_err(|source| CodecError::InvalidKey {
            role: KeyRole::Signing,
            source,
        })?;

        Ok(self.signing_key.get_or_init(|| key))
    }

    fn verification_key(&self) -> Result<&DecodingKey, CodecError> {
        if let Some(key) = self.verification_key.get() {
            return Ok(key);
        }

        let material = self.resolve(KeyRole::Verification)?;
        let key = match self.family() {
            KeyFamily::Hmac => Ok(DecodingKey::from_secret(&material)),
            KeyFamily::Rsa => DecodingKey::from_rsa_pem(&material),
            KeyFamily::Ec => DecodingKey::from_ec_pem(&material),
            KeyFamily::Ed => DecodingKey::from_ed_pem(&material),
        }
        .map_err(|source| CodecError::InvalidKey {
            role: KeyRole::Verification,
            source,
        })?;

        Ok(self.verification_key.get_or_init(|| key))
    }

    /// Sign `claims` into a compact token
    pub fn encode(&self, claims: &ClaimSet) -> Result<String, CodecError> {
        let result = self.signing_key().and_then(|key| {
            jsonwebtoken::encode(&Header::new(self.algorithm), claims, key)
                .map_err(CodecError::Signing)
        });

        if let Err(e) = &result {
            tracing::error!(
                error = %e,
                algorithm = ?self.algorithm,
                subject = claims.subject().unwrap_or_default(),
                "JWT encoding failed"
            );
        }
        result
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        // `exp` is enforced when present but never required
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation
    }

    /// Verify `token` and return its claims.
    ///
    /// Every failure yields `None`; the reason is only logged.
    pub fn decode(&self, token: &str) -> Option<ClaimSet> {
        let key = match self.verification_key() {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(error = %e, reason = "key", "JWT decoding failed");
                return None;
            }
        };

        let data = match jsonwebtoken::decode::<Map<String, Value>>(token, key, &self.validation())
        {
            Ok(data) => data,
            Err(e) => {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "expired",
                    ErrorKind::ImmatureSignature => "immature",
                    ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => "signature",
                    _ => "malformed",
                };
                tracing::warn!(error = %e, reason, "JWT decoding failed");
                return None;
            }
        };

        let claims = ClaimSet::from_json_object(data.claims);
        if claims.is_none() {
            tracing::warn!(reason = "malformed", "JWT claims are not all scalar values");
        }
        claims
    }
}
