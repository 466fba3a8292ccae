//! Processed-event retention
//!
//! The idempotency table only has to remember event ids for as long as
//! Stripe can redeliver them. Stripe retries failed deliveries for up to
//! 3 days; the default 30 day window keeps a wide audit margin on top.

use siteloft_billing::IdempotencyGuard;
use tracing::{error, info, warn};

/// Default number of days a processed event row is kept
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Smallest accepted retention window. Pruning inside the redelivery
/// horizon would let a replayed event pass the idempotency guard as fresh.
pub const MIN_RETENTION_DAYS: i64 = 7;

/// Read the retention window from PROCESSED_EVENT_RETENTION_DAYS,
/// clamping values that would break replay protection.
pub fn retention_days_from_env() -> i64 {
    let days = std::env::var("PROCESSED_EVENT_RETENTION_DAYS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_RETENTION_DAYS);

    if days < MIN_RETENTION_DAYS {
        warn!(
            requested = days,
            clamped = MIN_RETENTION_DAYS,
            "Configured retention is inside the redelivery horizon, clamping"
        );
        MIN_RETENTION_DAYS
    } else {
        days
    }
}

/// Delete processed event rows older than the retention window
pub async fn prune_processed_events(guard: &IdempotencyGuard, retention_days: i64) {
    info!(retention_days, "Running processed event prune");

    match guard
        .prune_older_than(time::Duration::days(retention_days))
        .await
    {
        Ok(deleted) => info!(deleted, "Processed event prune complete"),
        Err(e) => error!(error = %e, "Processed event prune failed"),
    }
}
