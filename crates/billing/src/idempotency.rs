//! Idempotency guard for webhook deliveries
//!
//! Stripe delivers events at least once; the guard makes redelivery safe.
//! Each delivery atomically reserves its processor event id inside the same
//! transaction as the handler's writes, so a failed handler rolls the
//! reservation back and the processor's retry can re-reserve. Two concurrent
//! deliveries of one event cannot both pass: the second blocks on the unique
//! index until the first commits, then observes the conflict.

use sqlx::PgPool;
use time::OffsetDateTime;

use siteloft_shared::ProcessedEvent;

use crate::error::BillingResult;
use crate::event::PaymentEvent;

/// Durable set of processed event identifiers, doubling as the delivery
/// audit log (each row records how its delivery was resolved).
#[derive(Clone)]
pub struct IdempotencyGuard {
    pool: PgPool,
}

impl IdempotencyGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically reserve an event id inside the delivery's transaction.
    ///
    /// Returns `true` when this delivery holds the claim; `false` means the
    /// event was already processed (or is being processed) and the caller
    /// must ack without further work.
    pub async fn claim(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
    ) -> BillingResult<bool> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_events (event_id, event_type, occurred_at, outcome)
            VALUES ($1, $2, $3, 'processing')
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(event.occurred_at)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(claimed.is_some())
    }

    /// Record how the delivery was resolved on its reservation row.
    /// Runs before commit so the row never stays in `processing`.
    pub async fn record_outcome(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event_id: &str,
        outcome: &str,
        detail: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET outcome = $1, detail = $2
            WHERE event_id = $3
            "#,
        )
        .bind(outcome)
        .bind(detail)
        .bind(event_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Delete reservation rows older than the retention window.
    ///
    /// Retention must stay much longer than the processor's redelivery
    /// horizon (Stripe retries for up to 3 days); a pruned id could
    /// otherwise be reprocessed as fresh. Rows inserted by in-flight
    /// deliveries are hours old at most and never match the cutoff.
    pub async fn prune_older_than(&self, retention: time::Duration) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - retention;

        let result = sqlx::query("DELETE FROM processed_events WHERE received_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Recent deliveries that were acked without being applied.
    /// This is the operator's data-quality signal for missing tenant
    /// metadata and unknown tenant ids.
    pub async fn recent_anomalies(&self, limit: i64) -> BillingResult<Vec<ProcessedEvent>> {
        let rows: Vec<ProcessedEvent> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, occurred_at, outcome, detail, received_at
            FROM processed_events
            WHERE outcome NOT IN ('applied', 'processing')
            ORDER BY received_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
