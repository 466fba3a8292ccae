//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use siteloft_billing::BillingService;

use crate::config::Config;

/// Application state shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = BillingService::new(config.stripe(), pool.clone());
        tracing::info!("Billing service initialized");

        Self {
            pool,
            config: Arc::new(config),
            billing: Arc::new(billing),
        }
    }
}
