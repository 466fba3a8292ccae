//! Stripe webhook configuration

use crate::error::{BillingError, BillingResult};

/// Maximum accepted age of a signed webhook timestamp, in seconds.
/// Matches the replay window Stripe documents for signature verification.
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Configuration for the Stripe webhook integration
///
/// Constructed explicitly and passed into `BillingService::new`; there is no
/// process-global configuration. Tests build their own config and sign their
/// own payloads.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe webhook signing secret (whsec_...)
    pub webhook_secret: String,
    /// Reject signed timestamps older than this many seconds
    pub signature_tolerance_secs: i64,
}

impl StripeConfig {
    /// Create a config with the default signature tolerance
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            signature_tolerance_secs: DEFAULT_SIGNATURE_TOLERANCE_SECS,
        }
    }

    /// Override the signature tolerance (tests use short windows)
    pub fn with_tolerance(mut self, secs: i64) -> Self {
        self.signature_tolerance_secs = secs;
        self
    }

    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Ok(Self::new(webhook_secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env mutations are process-wide; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_new_uses_default_tolerance() {
        let config = StripeConfig::new("whsec_test");
        assert_eq!(config.webhook_secret, "whsec_test");
        assert_eq!(
            config.signature_tolerance_secs,
            DEFAULT_SIGNATURE_TOLERANCE_SECS
        );
    }

    #[test]
    fn test_with_tolerance() {
        let config = StripeConfig::new("whsec_test").with_tolerance(60);
        assert_eq!(config.signature_tolerance_secs, 60);
    }

    #[test]
    fn test_from_env_reads_secret() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_from_env");

        let config = StripeConfig::from_env().unwrap();
        assert_eq!(config.webhook_secret, "whsec_from_env");

        std::env::remove_var("STRIPE_WEBHOOK_SECRET");
    }

    #[test]
    fn test_from_env_missing_secret_names_variable() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("STRIPE_WEBHOOK_SECRET");

        let err = StripeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("STRIPE_WEBHOOK_SECRET"));
    }
}
