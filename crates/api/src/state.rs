//! Application state

use std::sync::Arc;

use crate::{
    auth::{
        AuthenticationFlow, ChallengeDispatcher, CodecError, CredentialGuard, KeyStore,
        SecondFactorService, TokenCodec,
    },
    config::Config,
    email::{ChallengeNotifier, LogNotifier, SecurityEmailService},
    users::{TwoFactorSecretStore, UserProvider},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub codec: Arc<TokenCodec>,
    pub flow: Arc<AuthenticationFlow>,
}

impl AppState {
    /// Wire the token core to a user store and key store.
    ///
    /// Fails only when the configured JWT algorithm is not supported. Keys
    /// themselves are loaded on first use.
    pub fn new<S>(config: Config, users: Arc<S>, keys: Arc<dyn KeyStore>) -> Result<Self, CodecError>
    where
        S: UserProvider + TwoFactorSecretStore + 'static,
    {
        let codec = Arc::new(TokenCodec::new(
            &config.jwt.algorithm,
            config.jwt.keys.clone(),
            keys,
        )?);
        tracing::info!(algorithm = ?codec.algorithm(), "token codec configured");

        let two_factor = SecondFactorService::new(config.app_name.clone(), users.clone());

        // Initialize security email service
        let notifier: Arc<dyn ChallengeNotifier> =
            match SecurityEmailService::from_config(&config.email) {
                Some(service) => {
                    tracing::info!("Security email notifications enabled");
                    Arc::new(service)
                }
                None => {
                    tracing::warn!(
                        "Security email notifications not configured (missing RESEND_API_KEY)"
                    );
                    Arc::new(LogNotifier)
                }
            };

        let events = Arc::new(ChallengeDispatcher::new(two_factor.clone(), notifier));

        let flow = Arc::new(AuthenticationFlow::new(
            users,
            codec.clone(),
            two_factor,
            events,
            config.jwt.clone(),
            config.minimum_credential_check,
        ));

        Ok(Self {
            config,
            codec,
            flow,
        })
    }

    /// Credential guard for a single request
    pub fn guard(&self, bearer: Option<String>) -> CredentialGuard {
        self.flow.guard(bearer)
    }
}
