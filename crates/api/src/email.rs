//! Delivery of second-factor codes

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::config::EmailConfig;
use crate::users::User;

const RESEND_API_URL: &str = "https://api.resend.com";
const TWO_FACTOR_SUBJECT: &str = "Your Two-Factor Authentication Code";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Email request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Email provider rejected the message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Delivers a one-time code to a user
#[async_trait]
pub trait ChallengeNotifier: Send + Sync {
    async fn send_two_factor_code(&self, user: &User, code: &str) -> Result<(), NotifyError>;
}

/// Sends security emails through the Resend HTTP API
#[derive(Clone)]
pub struct SecurityEmailService {
    client: Client,
    api_key: SecretString,
    from: String,
    base_url: String,
}

impl SecurityEmailService {
    pub fn new(api_key: SecretString, from: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            from: from.into(),
            base_url: RESEND_API_URL.to_string(),
        }
    }

    /// `None` when no API key is configured
    pub fn from_config(config: &EmailConfig) -> Option<Self> {
        config
            .resend_api_key
            .clone()
            .map(|key| Self::new(key, config.from.clone()))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn two_factor_body(user: &User, code: &str) -> String {
        format!(
            "<p>Hello {name},</p>\
             <p>Your two-factor authentication code is: <strong>{code}</strong></p>\
             <p>This code will expire in 5 minutes.</p>\
             <p>If you did not try to sign in, you can ignore this email.</p>",
            name = user.name,
        )
    }
}

#[async_trait]
impl ChallengeNotifier for SecurityEmailService {
    async fn send_two_factor_code(&self, user: &User, code: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({
                "from": self.from,
                "to": [user.email],
                "subject": TWO_FACTOR_SUBJECT,
                "html": Self::two_factor_body(user, code),
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(user_id = %user.id, "two-factor code email sent");
        Ok(())
    }
}

/// Fallback when email delivery is not configured
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl ChallengeNotifier for LogNotifier {
    async fn send_two_factor_code(&self, user: &User, _code: &str) -> Result<(), NotifyError> {
        tracing::warn!(
            user_id = %user.id,
            "email delivery is not configured, two-factor code was not sent"
        );
        Ok(())
    }
}
