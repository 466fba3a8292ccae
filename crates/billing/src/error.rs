//! Billing error types

use thiserror::Error;

/// Billing-specific errors
///
/// Only `Database` and `ConcurrentModification` are transient; everything
/// else is permanent and must not be retried by the caller.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Webhook payload malformed: {0}")]
    PayloadMalformed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// True when the payment processor should redeliver the event.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::ConcurrentModification(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
