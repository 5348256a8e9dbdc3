//! Application configuration loaded from environment variables

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Only the server binary needs a database
    pub database_url: Option<String>,
    /// Shown as the issuer in authenticator apps
    pub app_name: String,
    pub jwt: JwtConfig,
    /// Floor applied to every credential check
    pub minimum_credential_check: Duration,
    pub email: EmailConfig,
}

/// Token issuance settings
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// `iss` claim of every token
    pub issuer: String,
    /// Signature algorithm name, e.g. `RS256` or `HS256`
    pub algorithm: String,
    pub token_lifetime_minutes: i64,
    /// Lifetime of tokens waiting on a second factor
    pub two_factor_token_lifetime_minutes: i64,
    pub keys: KeyConfig,
}

/// Where signing and verification keys come from.
///
/// Inline values win over files in the key store.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// Private PEM, or the shared secret for HMAC algorithms
    pub private_key: Option<SecretString>,
    pub public_key: Option<String>,
    pub private_key_filename: String,
    pub public_key_filename: String,
    pub keys_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub resend_api_key: Option<SecretString>,
    pub from: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            database_url: None,
            app_name: "Passgate".to_string(),
            jwt: JwtConfig::default(),
            minimum_credential_check: Duration::from_micros(200_000),
            email: EmailConfig::default(),
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost".to_string(),
            algorithm: "RS256".to_string(),
            token_lifetime_minutes: 60,
            two_factor_token_lifetime_minutes: 10,
            keys: KeyConfig::default(),
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            public_key: None,
            private_key_filename: "auth_private.key".to_string(),
            public_key_filename: "auth_public.key".to_string(),
            keys_path: PathBuf::from("storage/keys"),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            resend_api_key: None,
            from: "Passgate <no-reply@passgate.local>".to_string(),
        }
    }
}

/// Non-empty value of an environment variable
fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var: name,
            value,
        }),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let jwt_defaults = JwtConfig::default();
        let key_defaults = KeyConfig::default();

        let keys = KeyConfig {
            private_key: var("JWT_PRIVATE_KEY").map(SecretString::from),
            public_key: var("JWT_PUBLIC_KEY"),
            private_key_filename: var("JWT_PRIVATE_KEY_FILENAME")
                .unwrap_or(key_defaults.private_key_filename),
            public_key_filename: var("JWT_PUBLIC_KEY_FILENAME")
                .unwrap_or(key_defaults.public_key_filename),
            keys_path: var("JWT_KEYS_PATH")
                .map(PathBuf::from)
                .unwrap_or(key_defaults.keys_path),
        };

        let jwt = JwtConfig {
            issuer: var("APP_URL").unwrap_or(jwt_defaults.issuer),
            algorithm: var("JWT_ALGORITHM").unwrap_or(jwt_defaults.algorithm),
            token_lifetime_minutes: parse_var(
                "JWT_TOKEN_LIFETIME",
                jwt_defaults.token_lifetime_minutes,
            )?,
            two_factor_token_lifetime_minutes: parse_var(
                "JWT_TWO_FACTOR_TOKEN_LIFETIME",
                jwt_defaults.two_factor_token_lifetime_minutes,
            )?,
            keys,
        };

        let minimum_us: u64 = parse_var("AUTH_MINIMUM_DURATION_US", 200_000)?;

        Ok(Self {
            bind_address: var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            database_url: var("DATABASE_URL"),
            app_name: var("APP_NAME").unwrap_or(defaults.app_name),
            jwt,
            minimum_credential_check: Duration::from_micros(minimum_us),
            email: EmailConfig {
                resend_api_key: var("RESEND_API_KEY").map(SecretString::from),
                from: var("EMAIL_FROM").unwrap_or(defaults.email.from),
            },
        })
    }
}
