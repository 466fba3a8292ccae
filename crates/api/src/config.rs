//! Application configuration

use std::env;

use siteloft_billing::StripeConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,

    // Stripe webhooks
    pub stripe_webhook_secret: String,
    pub stripe_signature_tolerance_secs: i64,

    // Internal operator endpoints
    pub internal_api_token: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,

            // Stripe webhooks
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?,
            stripe_signature_tolerance_secs: env::var("STRIPE_SIGNATURE_TOLERANCE_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300),

            // Internal operator endpoints
            internal_api_token: {
                let token = env::var("INTERNAL_API_TOKEN")
                    .map_err(|_| ConfigError::Missing("INTERNAL_API_TOKEN"))?;
                // The token gates raw delivery audit data; reject guessable values
                if token.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "INTERNAL_API_TOKEN must be at least 32 characters",
                    ));
                }
                token
            },
        })
    }

    /// Webhook verification settings for the billing service
    pub fn stripe(&self) -> StripeConfig {
        StripeConfig::new(self.stripe_webhook_secret.as_str())
            .with_tolerance(self.stripe_signature_tolerance_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
