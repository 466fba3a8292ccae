//! Tenant billing store
//!
//! All handler writes to a tenant's billing sub-record go through
//! [`TenantStore::apply_billing_patch`], which enforces two gates:
//!
//! - optimistic concurrency: the UPDATE is conditional on the
//!   `billing_version` read, retried a bounded number of times;
//! - temporal ordering: an event strictly older than the record's
//!   `billing_last_event_at` watermark is skipped as stale.
//!
//! Suspension is one-way here. Payment failures and cancellations suspend
//! the tenant; reactivation is owned by the tenant directory, so a later
//! successful payment never flips `status` back by itself.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use siteloft_shared::{BillingStatus, ConnectStatus, Tenant, TenantBilling, TenantStatus};

use crate::error::{BillingError, BillingResult};

/// Version-conflict retry budget for one billing write
const MAX_CAS_ATTEMPTS: u32 = 3;

/// How a billing patch was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The patch was written and the version advanced
    Applied,
    /// A newer event already updated this tenant; nothing was written
    Stale,
}

/// One handler's intended change to a tenant's billing sub-record.
/// Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct BillingPatch {
    status: Option<BillingStatus>,
    last_payment: Option<(OffsetDateTime, i64)>,
    next_billing_date: Option<Option<OffsetDateTime>>,
    cancel_at_period_end: Option<bool>,
    connect: Option<(ConnectStatus, bool, bool)>,
    suspend: bool,
}

impl BillingPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: BillingStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Record a successful payment: when it happened and the amount in cents
    pub fn payment_received(mut self, paid_at: OffsetDateTime, amount_cents: i64) -> Self {
        self.last_payment = Some((paid_at, amount_cents));
        self
    }

    /// Overwrite the next billing date, including clearing it
    pub fn next_billing_date(mut self, date: Option<OffsetDateTime>) -> Self {
        self.next_billing_date = Some(date);
        self
    }

    pub fn cancel_at_period_end(mut self, flag: bool) -> Self {
        self.cancel_at_period_end = Some(flag);
        self
    }

    /// Update the Connect payout-account flags
    pub fn connect(
        mut self,
        status: ConnectStatus,
        charges_enabled: bool,
        payouts_enabled: bool,
    ) -> Self {
        self.connect = Some((status, charges_enabled, payouts_enabled));
        self
    }

    /// Suspend the tenant account alongside the billing change
    pub fn suspend(mut self) -> Self {
        self.suspend = true;
        self
    }

    pub fn suspends_tenant(&self) -> bool {
        self.suspend
    }

    /// Compute the new billing value. Watermark and version are the store's
    /// responsibility, not the patch's.
    pub fn apply(&self, current: &TenantBilling) -> TenantBilling {
        let mut next = current.clone();

        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some((paid_at, cents)) = self.last_payment {
            next.last_payment_at = Some(paid_at);
            next.last_payment_cents = Some(cents);
        }
        if let Some(date) = self.next_billing_date {
            next.next_billing_date = date;
        }
        if let Some(flag) = self.cancel_at_period_end {
            next.cancel_at_period_end = flag;
        }
        if let Some((status, charges, payouts)) = self.connect {
            next.connect_status = Some(status);
            next.charges_enabled = charges;
            next.payouts_enabled = payouts;
        }

        next
    }
}

/// True when the event is strictly older than the applied-event watermark.
/// Events at the same timestamp still apply.
fn is_stale(last_event_at: Option<OffsetDateTime>, event_time: OffsetDateTime) -> bool {
    match last_event_at {
        Some(watermark) => event_time < watermark,
        None => false,
    }
}

/// Authoritative per-tenant billing record access
#[derive(Clone)]
pub struct TenantStore {
    pool: PgPool,
}

impl TenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load a tenant outside any delivery transaction
    pub async fn find(&self, tenant_id: Uuid) -> BillingResult<Option<Tenant>> {
        let tenant: Option<Tenant> = sqlx::query_as(
            r#"
            SELECT
                id, parent_agency_id, kind, name, status,
                billing_status, billing_last_payment_at, billing_last_payment_cents,
                billing_next_billing_date, billing_cancel_at_period_end,
                billing_connect_status, billing_charges_enabled, billing_payouts_enabled,
                billing_last_event_at, billing_version,
                created_at, updated_at
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(tenant)
    }

    /// Load a tenant inside the delivery's transaction
    pub async fn find_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: Uuid,
    ) -> BillingResult<Option<Tenant>> {
        let tenant: Option<Tenant> = sqlx::query_as(
            r#"
            SELECT
                id, parent_agency_id, kind, name, status,
                billing_status, billing_last_payment_at, billing_last_payment_cents,
                billing_next_billing_date, billing_cancel_at_period_end,
                billing_connect_status, billing_charges_enabled, billing_payouts_enabled,
                billing_last_event_at, billing_version,
                created_at, updated_at
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(tenant)
    }

    /// Apply a billing patch to a tenant under the version and timestamp
    /// gates. `tenant` is the row the caller already loaded in this
    /// transaction; conflicting writers trigger a re-read and retry.
    pub async fn apply_billing_patch(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant: &Tenant,
        event_time: OffsetDateTime,
        patch: &BillingPatch,
    ) -> BillingResult<PatchOutcome> {
        let mut current_status = tenant.status;
        let mut current = tenant.billing.clone();

        for _ in 0..MAX_CAS_ATTEMPTS {
            if is_stale(current.last_event_at, event_time) {
                return Ok(PatchOutcome::Stale);
            }

            let next = patch.apply(&current);
            let next_status = if patch.suspend {
                TenantStatus::Suspended
            } else {
                current_status
            };

            let result = sqlx::query(
                r#"
                UPDATE tenants
                SET status = $2,
                    billing_status = $3,
                    billing_last_payment_at = $4,
                    billing_last_payment_cents = $5,
                    billing_next_billing_date = $6,
                    billing_cancel_at_period_end = $7,
                    billing_connect_status = $8,
                    billing_charges_enabled = $9,
                    billing_payouts_enabled = $10,
                    billing_last_event_at = $11,
                    billing_version = billing_version + 1,
                    updated_at = NOW()
                WHERE id = $1 AND billing_version = $12
                "#,
            )
            .bind(tenant.id)
            .bind(next_status)
            .bind(next.status)
            .bind(next.last_payment_at)
            .bind(next.last_payment_cents)
            .bind(next.next_billing_date)
            .bind(next.cancel_at_period_end)
            .bind(next.connect_status)
            .bind(next.charges_enabled)
            .bind(next.payouts_enabled)
            .bind(event_time)
            .bind(current.version)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(PatchOutcome::Applied);
            }

            // Version moved under us. Re-read and retry against the newer
            // record; the staleness gate re-runs with the fresh watermark.
            let fresh = self.find_in_tx(tx, tenant.id).await?.ok_or_else(|| {
                BillingError::Internal(format!("tenant {} disappeared during update", tenant.id))
            })?;
            current_status = fresh.status;
            current = fresh.billing;
        }

        Err(BillingError::ConcurrentModification(format!(
            "tenant {} billing version conflict after {} attempts",
            tenant.id, MAX_CAS_ATTEMPTS
        )))
    }
}
