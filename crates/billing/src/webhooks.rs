//! Stripe webhook handling
//!
//! Verifies, routes, and applies processor events. One delivery runs in one
//! database transaction: the idempotency reservation, every handler write,
//! and the delivery audit row commit together or roll back together, so the
//! processor's retry always starts from a clean slate.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use siteloft_shared::{ActivityType, BillingStatus, InvoiceStatus, Tenant, TenantKind};

use crate::activity::{ActivityLog, ActivityRecordBuilder};
use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::event::{
    AccountObject, EventPayload, InvoiceObject, PaymentEvent, PaymentIntentObject,
    SubscriptionObject, TenantRefs,
};
use crate::idempotency::IdempotencyGuard;
use crate::ledger::InvoiceLedger;
use crate::tenants::{BillingPatch, PatchOutcome, TenantStore};

type HmacSha256 = Hmac<Sha256>;

/// How one webhook delivery was resolved
///
/// Every variant is an ack. Failures that warrant a processor retry surface
/// as `BillingError` instead of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler writes were committed
    Applied,
    /// The event id was already reserved by an earlier delivery
    Duplicate,
    /// Known event type but no usable tenant reference in metadata
    SkippedUnroutable,
    /// The referenced tenant does not exist in the directory
    SkippedUnknownTenant,
    /// A newer event already updated the target tenant's billing record
    SkippedStale,
    /// Event type has no handler
    SkippedUnsupported,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::SkippedUnroutable => "skipped_unroutable",
            Self::SkippedUnknownTenant => "skipped_unknown_tenant",
            Self::SkippedStale => "skipped_stale",
            Self::SkippedUnsupported => "skipped_unsupported",
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome plus the short diagnostic stored on the audit row
struct Resolution {
    outcome: DeliveryOutcome,
    detail: Option<String>,
}

impl Resolution {
    fn applied() -> Self {
        Self {
            outcome: DeliveryOutcome::Applied,
            detail: None,
        }
    }

    fn applied_with_detail(detail: String) -> Self {
        Self {
            outcome: DeliveryOutcome::Applied,
            detail: Some(detail),
        }
    }

    fn stale() -> Self {
        Self {
            outcome: DeliveryOutcome::SkippedStale,
            detail: Some("event older than billing watermark".to_string()),
        }
    }

    fn unroutable(detail: String) -> Self {
        Self {
            outcome: DeliveryOutcome::SkippedUnroutable,
            detail: Some(detail),
        }
    }

    fn unknown_tenant(tenant_id: Uuid) -> Self {
        Self {
            outcome: DeliveryOutcome::SkippedUnknownTenant,
            detail: Some(format!("tenant {} not found", tenant_id)),
        }
    }

    fn unsupported(event_type: &str) -> Self {
        Self {
            outcome: DeliveryOutcome::SkippedUnsupported,
            detail: Some(format!("no handler for {}", event_type)),
        }
    }

    fn from_patch(patch_outcome: PatchOutcome) -> Self {
        match patch_outcome {
            PatchOutcome::Applied => Self::applied(),
            PatchOutcome::Stale => Self::stale(),
        }
    }

    /// Ledger and activity writes are not gated by the tenant watermark, so
    /// a stale patch still leaves those rows; the audit detail names them.
    fn from_patch_with_records(patch_outcome: PatchOutcome, records: &str) -> Self {
        match patch_outcome {
            PatchOutcome::Applied => Self::applied(),
            PatchOutcome::Stale => Self {
                outcome: DeliveryOutcome::SkippedStale,
                detail: Some(format!(
                    "event older than billing watermark; {} still recorded",
                    records
                )),
            },
        }
    }
}

/// Verify a `stripe-signature` header against the raw request body.
///
/// The header has the form `t=<unix-ts>,v1=<hex hmac>[,v1=...]`; the signed
/// payload is `"{t}.{raw body}"` over the exact bytes received. Comparison
/// is constant-time, and any `v1` candidate may match (Stripe sends several
/// during secret rotation).
pub fn verify_signature(
    config: &StripeConfig,
    payload: &[u8],
    signature_header: &str,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(value)) => timestamp = value.parse().ok(),
            (Some("v1"), Some(value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        BillingError::SignatureInvalid("missing timestamp in signature header".to_string())
    })?;

    if signatures.is_empty() {
        return Err(BillingError::SignatureInvalid(
            "no v1 signature in header".to_string(),
        ));
    }

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > config.signature_tolerance_secs {
        return Err(BillingError::SignatureInvalid(format!(
            "timestamp {} outside {}s tolerance",
            timestamp, config.signature_tolerance_secs
        )));
    }

    let mut mac = HmacSha256::new_from_slice(config.webhook_secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    let valid = signatures
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if !valid {
        return Err(BillingError::SignatureInvalid(
            "signature mismatch".to_string(),
        ));
    }

    Ok(())
}

/// The agency a ledger or activity row is filed under, plus the client
/// cross-reference when the event applied to a sub-account.
///
/// Returns None for a client tenant with no resolvable parent agency, which
/// is a data-integrity problem the caller surfaces as unroutable.
fn agency_scope<'t>(
    tenant: &'t Tenant,
    refs: &TenantRefs,
) -> Option<(Uuid, Option<(Uuid, &'t str)>)> {
    match tenant.kind {
        TenantKind::Agency => Some((tenant.id, None)),
        TenantKind::AgencyClient => {
            let agency_id = refs.agency_tenant_id.or(tenant.parent_agency_id)?;
            Some((agency_id, Some((tenant.id, tenant.name.as_str()))))
        }
    }
}

/// Webhook handler: verifier, router, and the billing state machine
pub struct WebhookHandler {
    config: StripeConfig,
    pool: PgPool,
    tenants: TenantStore,
    ledger: InvoiceLedger,
    activity: ActivityLog,
    guard: IdempotencyGuard,
}

impl WebhookHandler {
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self {
            tenants: TenantStore::new(pool.clone()),
            ledger: InvoiceLedger::new(pool.clone()),
            activity: ActivityLog::new(pool.clone()),
            guard: IdempotencyGuard::new(pool.clone()),
            config,
            pool,
        }
    }

    /// Verify the signature header against the raw body, then decode.
    /// Nothing is parsed and no state is touched until the signature
    /// checks out; a mismatch fails closed.
    pub fn verify_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> BillingResult<PaymentEvent> {
        verify_signature(&self.config, payload, signature_header)?;
        PaymentEvent::decode(payload)
    }

    /// Process a verified event end to end.
    ///
    /// Reserves the event id, routes to the handler, records the outcome on
    /// the reservation row, and commits, all in one transaction. Any error
    /// rolls the whole delivery back, reservation included, and propagates
    /// so the caller answers 5xx and the processor redelivers.
    pub async fn handle_event(&self, event: &PaymentEvent) -> BillingResult<DeliveryOutcome> {
        let mut tx = self.pool.begin().await?;

        if !self.guard.claim(&mut tx, event).await? {
            tx.rollback().await?;
            self.log_outcome(event, DeliveryOutcome::Duplicate, None);
            return Ok(DeliveryOutcome::Duplicate);
        }

        let resolution = match self.route_event(&mut tx, event).await {
            Ok(resolution) => resolution,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        event_id = %event.id,
                        error = %rollback_err,
                        "Failed to roll back webhook transaction"
                    );
                }
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook delivery failed"
                );
                return Err(e);
            }
        };

        self.guard
            .record_outcome(
                &mut tx,
                &event.id,
                resolution.outcome.as_str(),
                resolution.detail.as_deref(),
            )
            .await?;
        tx.commit().await?;

        self.log_outcome(event, resolution.outcome, resolution.detail.as_deref());
        Ok(resolution.outcome)
    }

    /// One consolidated structured emission per delivery
    fn log_outcome(&self, event: &PaymentEvent, outcome: DeliveryOutcome, detail: Option<&str>) {
        match outcome {
            DeliveryOutcome::SkippedUnroutable | DeliveryOutcome::SkippedUnknownTenant => {
                // Data-quality signal, distinct from the unsupported no-op
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = %outcome,
                    detail = detail.unwrap_or(""),
                    "Webhook delivery skipped"
                );
            }
            _ => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = %outcome,
                    detail = detail.unwrap_or(""),
                    "Webhook delivery resolved"
                );
            }
        }
    }

    /// Map the decoded payload to exactly one handler
    async fn route_event(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
    ) -> BillingResult<Resolution> {
        match &event.payload {
            EventPayload::PaymentIntentSucceeded(intent) => {
                self.handle_payment_succeeded(tx, event, intent).await
            }
            EventPayload::PaymentIntentFailed(intent) => {
                self.handle_payment_failed(tx, event, intent).await
            }
            EventPayload::InvoicePaymentSucceeded(invoice) => {
                self.handle_invoice_paid(tx, event, invoice).await
            }
            EventPayload::InvoicePaymentFailed(invoice) => {
                self.handle_invoice_failed(tx, event, invoice).await
            }
            EventPayload::SubscriptionUpdated(subscription) => {
                self.handle_subscription_updated(tx, event, subscription).await
            }
            EventPayload::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(tx, event, subscription).await
            }
            EventPayload::AccountUpdated(account) => {
                self.handle_account_updated(tx, event, account).await
            }
            EventPayload::Unsupported => Ok(Resolution::unsupported(&event.event_type)),
        }
    }

    async fn handle_payment_succeeded(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
        intent: &PaymentIntentObject,
    ) -> BillingResult<Resolution> {
        let Some(target_id) = event.refs.billing_target() else {
            return Ok(Resolution::unroutable(format!(
                "no tenant reference in {} metadata",
                event.event_type
            )));
        };
        let Some(tenant) = self.tenants.find_in_tx(tx, target_id).await? else {
            return Ok(Resolution::unknown_tenant(target_id));
        };
        let Some((agency_id, client)) = agency_scope(&tenant, &event.refs) else {
            return Ok(Resolution::unroutable(format!(
                "client {} has no parent agency",
                tenant.id
            )));
        };

        let patch = BillingPatch::new()
            .status(BillingStatus::Active)
            .payment_received(event.occurred_at, intent.amount);
        let patch_outcome = self
            .tenants
            .apply_billing_patch(tx, &tenant, event.occurred_at, &patch)
            .await?;

        self.ledger
            .record_outcome(
                tx,
                agency_id,
                client.map(|(id, _)| id),
                &intent.id,
                intent.amount,
                InvoiceStatus::Paid,
                event.occurred_at,
            )
            .await?;

        let mut record = ActivityRecordBuilder::new(agency_id, ActivityType::PaymentReceived)
            .amount_cents(intent.amount)
            .provider_event(&event.id);
        if let Some((client_id, client_name)) = client {
            record = record.client(client_id, client_name);
        }
        self.activity.append(tx, record).await?;

        Ok(Resolution::from_patch_with_records(
            patch_outcome,
            "invoice and activity rows",
        ))
    }

    async fn handle_payment_failed(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
        intent: &PaymentIntentObject,
    ) -> BillingResult<Resolution> {
        let Some(target_id) = event.refs.billing_target() else {
            return Ok(Resolution::unroutable(format!(
                "no tenant reference in {} metadata",
                event.event_type
            )));
        };
        let Some(tenant) = self.tenants.find_in_tx(tx, target_id).await? else {
            return Ok(Resolution::unknown_tenant(target_id));
        };
        let Some((agency_id, client)) = agency_scope(&tenant, &event.refs) else {
            return Ok(Resolution::unroutable(format!(
                "client {} has no parent agency",
                tenant.id
            )));
        };

        let patch = BillingPatch::new()
            .status(BillingStatus::PaymentFailed)
            .suspend();
        let patch_outcome = self
            .tenants
            .apply_billing_patch(tx, &tenant, event.occurred_at, &patch)
            .await?;

        let mut record = ActivityRecordBuilder::new(agency_id, ActivityType::PaymentFailed)
            .amount_cents(intent.amount)
            .provider_event(&event.id);
        if let Some((client_id, client_name)) = client {
            record = record.client(client_id, client_name);
        }
        self.activity.append(tx, record).await?;

        Ok(Resolution::from_patch_with_records(
            patch_outcome,
            "activity row",
        ))
    }

    async fn handle_invoice_paid(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
        invoice: &InvoiceObject,
    ) -> BillingResult<Resolution> {
        let Some(target_id) = event.refs.billing_target() else {
            return Ok(Resolution::unroutable(format!(
                "no tenant reference in {} metadata",
                event.event_type
            )));
        };
        let Some(tenant) = self.tenants.find_in_tx(tx, target_id).await? else {
            return Ok(Resolution::unknown_tenant(target_id));
        };
        let Some((agency_id, client)) = agency_scope(&tenant, &event.refs) else {
            return Ok(Resolution::unroutable(format!(
                "client {} has no parent agency",
                tenant.id
            )));
        };

        let patch = BillingPatch::new().status(BillingStatus::Active);
        let patch_outcome = self
            .tenants
            .apply_billing_patch(tx, &tenant, event.occurred_at, &patch)
            .await?;

        self.ledger
            .record_outcome(
                tx,
                agency_id,
                client.map(|(id, _)| id),
                &invoice.id,
                invoice.amount_paid,
                InvoiceStatus::Paid,
                event.occurred_at,
            )
            .await?;

        Ok(Resolution::from_patch_with_records(
            patch_outcome,
            "invoice row",
        ))
    }

    async fn handle_invoice_failed(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
        invoice: &InvoiceObject,
    ) -> BillingResult<Resolution> {
        let Some(target_id) = event.refs.billing_target() else {
            return Ok(Resolution::unroutable(format!(
                "no tenant reference in {} metadata",
                event.event_type
            )));
        };
        let Some(tenant) = self.tenants.find_in_tx(tx, target_id).await? else {
            return Ok(Resolution::unknown_tenant(target_id));
        };
        let Some((agency_id, client)) = agency_scope(&tenant, &event.refs) else {
            return Ok(Resolution::unroutable(format!(
                "client {} has no parent agency",
                tenant.id
            )));
        };

        let patch = BillingPatch::new()
            .status(BillingStatus::PaymentFailed)
            .suspend();
        let patch_outcome = self
            .tenants
            .apply_billing_patch(tx, &tenant, event.occurred_at, &patch)
            .await?;

        self.ledger
            .record_outcome(
                tx,
                agency_id,
                client.map(|(id, _)| id),
                &invoice.id,
                invoice.amount_due,
                InvoiceStatus::Failed,
                event.occurred_at,
            )
            .await?;

        let mut record = ActivityRecordBuilder::new(agency_id, ActivityType::PaymentFailed)
            .amount_cents(invoice.amount_due)
            .provider_event(&event.id);
        if let Some((client_id, client_name)) = client {
            record = record.client(client_id, client_name);
        }
        self.activity.append(tx, record).await?;

        Ok(Resolution::from_patch_with_records(
            patch_outcome,
            "invoice and activity rows",
        ))
    }

    async fn handle_subscription_updated(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
        subscription: &SubscriptionObject,
    ) -> BillingResult<Resolution> {
        let Some(target_id) = event.refs.billing_target() else {
            return Ok(Resolution::unroutable(format!(
                "no tenant reference in {} metadata",
                event.event_type
            )));
        };
        let Some(tenant) = self.tenants.find_in_tx(tx, target_id).await? else {
            return Ok(Resolution::unknown_tenant(target_id));
        };

        let mut patch = BillingPatch::new()
            .next_billing_date(subscription.next_billing_date())
            .cancel_at_period_end(subscription.cancel_at_period_end);

        // Statuses we do not track leave the stored value unchanged; the
        // audit row notes the gap instead of guessing.
        let unmapped_status = match BillingStatus::from_provider(&subscription.status) {
            Some(status) => {
                patch = patch.status(status);
                None
            }
            None => Some(subscription.status.clone()),
        };

        let patch_outcome = self
            .tenants
            .apply_billing_patch(tx, &tenant, event.occurred_at, &patch)
            .await?;

        match (patch_outcome, unmapped_status) {
            (PatchOutcome::Applied, Some(status)) => Ok(Resolution::applied_with_detail(format!(
                "unmapped subscription status '{}'",
                status
            ))),
            (patch_outcome, _) => Ok(Resolution::from_patch(patch_outcome)),
        }
    }

    async fn handle_subscription_deleted(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
        _subscription: &SubscriptionObject,
    ) -> BillingResult<Resolution> {
        let Some(target_id) = event.refs.billing_target() else {
            return Ok(Resolution::unroutable(format!(
                "no tenant reference in {} metadata",
                event.event_type
            )));
        };
        let Some(tenant) = self.tenants.find_in_tx(tx, target_id).await? else {
            return Ok(Resolution::unknown_tenant(target_id));
        };
        let Some((agency_id, client)) = agency_scope(&tenant, &event.refs) else {
            return Ok(Resolution::unroutable(format!(
                "client {} has no parent agency",
                tenant.id
            )));
        };

        let patch = BillingPatch::new()
            .status(BillingStatus::Canceled)
            .suspend();
        let patch_outcome = self
            .tenants
            .apply_billing_patch(tx, &tenant, event.occurred_at, &patch)
            .await?;

        let mut record = ActivityRecordBuilder::new(agency_id, ActivityType::SubscriptionCanceled)
            .provider_event(&event.id);
        if let Some((client_id, client_name)) = client {
            record = record.client(client_id, client_name);
        }
        self.activity.append(tx, record).await?;

        Ok(Resolution::from_patch_with_records(
            patch_outcome,
            "activity row",
        ))
    }

    async fn handle_account_updated(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
        account: &AccountObject,
    ) -> BillingResult<Resolution> {
        // Connect payout accounts belong to agencies
        let Some(target_id) = event.refs.connect_target() else {
            return Ok(Resolution::unroutable(format!(
                "no tenant reference in {} metadata",
                event.event_type
            )));
        };
        let Some(tenant) = self.tenants.find_in_tx(tx, target_id).await? else {
            return Ok(Resolution::unknown_tenant(target_id));
        };

        let connect_status = siteloft_shared::ConnectStatus::from_account_flags(
            account.details_submitted,
            account.charges_enabled,
            account.payouts_enabled,
        );
        let patch = BillingPatch::new().connect(
            connect_status,
            account.charges_enabled,
            account.payouts_enabled,
        );
        let patch_outcome = self
            .tenants
            .apply_billing_patch(tx, &tenant, event.occurred_at, &patch)
            .await?;

        Ok(Resolution::from_patch(patch_outcome))
    }
}
