//! Invoice ledger
//!
//! Append-mostly record of payment attempts keyed by the processor's own
//! invoice/payment reference. At most one row exists per `provider_ref`;
//! later events for the same reference update that row in place, gated by
//! the processor timestamp so paid/failed pairs converge to one terminal
//! state regardless of arrival order.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use siteloft_shared::{Invoice, InvoiceStatus};

use crate::error::{BillingError, BillingResult};

/// Decide whether an incoming terminal outcome replaces the stored one.
///
/// A `failed` at the same timestamp as a `paid` wins the tie; combined with
/// `paid` requiring a strictly later timestamp, both arrival orders of a
/// paid/failed pair settle on the same status.
pub fn terminal_supersedes(
    current_status: InvoiceStatus,
    current_event_at: Option<OffsetDateTime>,
    incoming_status: InvoiceStatus,
    incoming_event_at: OffsetDateTime,
) -> bool {
    if !incoming_status.is_terminal() {
        return false;
    }
    if !current_status.is_terminal() {
        return true;
    }
    if current_status == incoming_status {
        return false;
    }
    let Some(current_at) = current_event_at else {
        return true;
    };

    match incoming_status {
        InvoiceStatus::Paid => incoming_event_at > current_at,
        InvoiceStatus::Failed => incoming_event_at >= current_at,
        InvoiceStatus::Pending => false,
    }
}

/// Durable record of payment attempts and outcomes
#[derive(Clone)]
pub struct InvoiceLedger {
    pool: PgPool,
}

impl InvoiceLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a terminal payment outcome for a provider reference.
    ///
    /// First sight of the reference inserts the row; afterwards the row is
    /// locked and updated only when the incoming outcome supersedes the
    /// stored one. Returns the row's status after this call.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_outcome(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        agency_tenant_id: Uuid,
        client_tenant_id: Option<Uuid>,
        provider_ref: &str,
        amount_cents: i64,
        outcome: InvoiceStatus,
        event_time: OffsetDateTime,
    ) -> BillingResult<InvoiceStatus> {
        sqlx::query(
            r#"
            INSERT INTO invoices
                (agency_tenant_id, client_tenant_id, provider_ref, amount_cents, status)
            VALUES ($1, $2, $3, $4, 'pending')
            ON CONFLICT (provider_ref) DO NOTHING
            "#,
        )
        .bind(agency_tenant_id)
        .bind(client_tenant_id)
        .bind(provider_ref)
        .bind(amount_cents)
        .execute(&mut **tx)
        .await?;

        // Row lock serializes concurrent outcomes for one reference
        let current: Option<(Uuid, InvoiceStatus, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT id, status, status_event_at
            FROM invoices
            WHERE provider_ref = $1
            FOR UPDATE
            "#,
        )
        .bind(provider_ref)
        .fetch_optional(&mut **tx)
        .await?;

        let (invoice_id, current_status, current_event_at) = current.ok_or_else(|| {
            BillingError::Internal(format!("invoice row missing for {}", provider_ref))
        })?;

        if !terminal_supersedes(current_status, current_event_at, outcome, event_time) {
            return Ok(current_status);
        }

        let (paid_at, failed_at) = match outcome {
            InvoiceStatus::Paid => (Some(event_time), None),
            InvoiceStatus::Failed => (None, Some(event_time)),
            InvoiceStatus::Pending => (None, None),
        };

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2,
                status_event_at = $3,
                amount_cents = $4,
                paid_at = COALESCE($5, paid_at),
                failed_at = COALESCE($6, failed_at)
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(outcome)
        .bind(event_time)
        .bind(amount_cents)
        .bind(paid_at)
        .bind(failed_at)
        .execute(&mut **tx)
        .await?;

        Ok(outcome)
    }

    /// Look up an invoice by its processor reference
    pub async fn find_by_provider_ref(&self, provider_ref: &str) -> BillingResult<Option<Invoice>> {
        let invoice: Option<Invoice> = sqlx::query_as(
            r#"
            SELECT id, agency_tenant_id, client_tenant_id, provider_ref, amount_cents,
                   status, status_event_at, created_at, paid_at, failed_at
            FROM invoices
            WHERE provider_ref = $1
            "#,
        )
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(invoice)
    }

    /// Count invoices recorded for an agency (its own and its clients')
    pub async fn count_for_agency(&self, agency_tenant_id: Uuid) -> BillingResult<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM invoices WHERE agency_tenant_id = $1")
                .bind(agency_tenant_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0)
    }
}
