//! Integration tests for webhook delivery and replay
//!
//! These tests run the full delivery path (reserve, route, apply, audit)
//! against a real Postgres database and verify the reconciliation guarantees
//! hold under redelivery and reordering.
//!
//! ## Test Coverage
//! - Idempotent replay (one event id applies exactly once)
//! - Out-of-order terminal invoice events converging in either arrival order
//! - Stale tenant updates gated by the billing watermark, with ungated
//!   ledger and activity rows still landing
//! - Version-conflict retries against a concurrent billing writer
//! - Client events cascading into the parent agency's activity feed
//! - Unroutable, unknown-tenant, and unsupported deliveries acked and audited
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/siteloft_test"
//! cargo test --test webhook_replay -- --ignored --test-threads=1
//! ```

use serde_json::json;
use siteloft_billing::{
    BillingPatch, BillingService, DeliveryOutcome, PatchOutcome, PaymentEvent, StripeConfig,
};
use siteloft_shared::BillingStatus;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

// ============================================================================
// Test Utilities
// ============================================================================

/// Fixed base instant so event ordering is deterministic
const BASE_TS: i64 = 1_755_000_000;

async fn setup() -> (BillingService, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    let billing = BillingService::new(StripeConfig::new("whsec_test_secret"), pool.clone());
    (billing, pool)
}

async fn create_agency(pool: &PgPool, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO tenants (id, kind, name) VALUES ($1, 'agency', $2)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await
        .expect("Failed to create agency tenant");
    id
}

async fn create_client(pool: &PgPool, agency_id: Uuid, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO tenants (id, parent_agency_id, kind, name) VALUES ($1, $2, 'agency_client', $3)",
    )
    .bind(id)
    .bind(agency_id)
    .bind(name)
    .execute(pool)
    .await
    .expect("Failed to create client tenant");
    id
}

/// Cleanup test data after test completion
async fn cleanup(pool: &PgPool, agency_id: Uuid, run: Uuid) {
    // Delete in order to respect foreign key constraints
    sqlx::query("DELETE FROM agency_activity WHERE agency_tenant_id = $1")
        .bind(agency_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM invoices WHERE agency_tenant_id = $1")
        .bind(agency_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM processed_events WHERE event_id LIKE $1")
        .bind(format!("evt_{}%", run.simple()))
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM tenants WHERE parent_agency_id = $1")
        .bind(agency_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM tenants WHERE id = $1")
        .bind(agency_id)
        .execute(pool)
        .await
        .ok();
}

fn event_id(run: Uuid, seq: u32) -> String {
    format!("evt_{}_{}", run.simple(), seq)
}

fn decode_event(value: &serde_json::Value) -> PaymentEvent {
    let bytes = serde_json::to_vec(value).expect("Failed to serialize test event");
    PaymentEvent::decode(&bytes).expect("Failed to decode test event")
}

fn tenant_metadata(client: Option<Uuid>, agency: Option<Uuid>) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    if let Some(id) = client {
        map.insert("client_tenant_id".to_string(), json!(id.to_string()));
    }
    if let Some(id) = agency {
        map.insert("agency_tenant_id".to_string(), json!(id.to_string()));
    }
    serde_json::Value::Object(map)
}

fn payment_succeeded(
    id: &str,
    created: i64,
    provider_ref: &str,
    amount: i64,
    metadata: serde_json::Value,
) -> PaymentEvent {
    decode_event(&json!({
        "id": id,
        "type": "payment_intent.succeeded",
        "created": created,
        "data": {"object": {"id": provider_ref, "amount": amount, "metadata": metadata}}
    }))
}

fn invoice_event(
    id: &str,
    event_type: &str,
    created: i64,
    provider_ref: &str,
    amount: i64,
    metadata: serde_json::Value,
) -> PaymentEvent {
    decode_event(&json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": {"object": {
            "id": provider_ref,
            "amount_paid": amount,
            "amount_due": amount,
            "metadata": metadata,
        }}
    }))
}

fn subscription_event(
    id: &str,
    event_type: &str,
    created: i64,
    status: &str,
    metadata: serde_json::Value,
) -> PaymentEvent {
    decode_event(&json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": {"object": {
            "id": "sub_test",
            "status": status,
            "cancel_at_period_end": false,
            "metadata": metadata,
        }}
    }))
}

async fn audit_outcome(pool: &PgPool, event_id: &str) -> Option<(String, Option<String>)> {
    sqlx::query_as("SELECT outcome, detail FROM processed_events WHERE event_id = $1")
        .bind(event_id)
        .fetch_optional(pool)
        .await
        .expect("Failed to fetch audit row")
}

async fn count_invoices(pool: &PgPool, provider_ref: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM invoices WHERE provider_ref = $1")
        .bind(provider_ref)
        .fetch_one(pool)
        .await
        .expect("Failed to count invoices")
}

async fn count_activity(pool: &PgPool, agency_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM agency_activity WHERE agency_tenant_id = $1")
        .bind(agency_id)
        .fetch_one(pool)
        .await
        .expect("Failed to count activity records")
}

/// Advance a tenant's billing version behind a caller's back, the way a
/// concurrent delivery would. Optionally moves the watermark too.
async fn bump_version(pool: &PgPool, tenant_id: Uuid, last_event_at: Option<OffsetDateTime>) {
    sqlx::query(
        r#"
        UPDATE tenants
        SET billing_version = billing_version + 1,
            billing_last_event_at = COALESCE($2, billing_last_event_at)
        WHERE id = $1
        "#,
    )
    .bind(tenant_id)
    .bind(last_event_at)
    .execute(pool)
    .await
    .expect("Failed to bump billing version");
}

// ============================================================================
// Test Cases: Idempotent Replay
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_replayed_payment_applies_once() {
    // Given: an agency with one client sub-account
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;
    let client_id = create_client(&pool, agency_id, "Harbor Dental").await;

    let evt = payment_succeeded(
        &event_id(run, 1),
        BASE_TS,
        &format!("pi_{}", run.simple()),
        5000,
        tenant_metadata(Some(client_id), Some(agency_id)),
    );

    // When: the same event is delivered three times
    let first = billing.webhooks.handle_event(&evt).await.expect("First delivery failed");
    let second = billing.webhooks.handle_event(&evt).await.expect("Second delivery failed");
    let third = billing.webhooks.handle_event(&evt).await.expect("Third delivery failed");

    // Then: only the first delivery applies
    assert_eq!(first, DeliveryOutcome::Applied);
    assert_eq!(second, DeliveryOutcome::Duplicate);
    assert_eq!(third, DeliveryOutcome::Duplicate);

    let tenant = billing
        .tenants
        .find(client_id)
        .await
        .expect("Failed to load tenant")
        .expect("Client tenant should exist");
    assert_eq!(tenant.billing.status.to_string(), "active");
    assert_eq!(tenant.billing.last_payment_cents, Some(5000));
    assert_eq!(
        tenant.billing.last_payment_at.map(|t| t.unix_timestamp()),
        Some(BASE_TS)
    );
    assert_eq!(tenant.billing.version, 1, "Replay must not bump the version again");

    let provider_ref = format!("pi_{}", run.simple());
    assert_eq!(count_invoices(&pool, &provider_ref).await, 1);
    let invoice = billing
        .ledger
        .find_by_provider_ref(&provider_ref)
        .await
        .expect("Failed to load invoice")
        .expect("Invoice should exist");
    assert_eq!(invoice.status.to_string(), "paid");
    assert_eq!(invoice.amount_cents, 5000);
    assert_eq!(invoice.agency_tenant_id, agency_id);
    assert_eq!(invoice.client_tenant_id, Some(client_id));

    assert_eq!(count_activity(&pool, agency_id).await, 1);

    let (outcome, _) = audit_outcome(&pool, &event_id(run, 1))
        .await
        .expect("Audit row should exist");
    assert_eq!(outcome, "applied", "Duplicate deliveries keep the original outcome");

    cleanup(&pool, agency_id, run).await;
}

// ============================================================================
// Test Cases: Out-of-Order Delivery
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_terminal_invoice_events_converge_in_either_order() {
    // Given: a paid event strictly newer than a failed event, for two refs
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;
    let metadata = tenant_metadata(None, Some(agency_id));

    let ref_forward = format!("in_{}_fwd", run.simple());
    let ref_reverse = format!("in_{}_rev", run.simple());

    // When: one ref sees paid then failed, the other failed then paid
    let paid_fwd = invoice_event(
        &event_id(run, 1),
        "invoice.payment_succeeded",
        BASE_TS + 60,
        &ref_forward,
        5000,
        metadata.clone(),
    );
    let failed_fwd = invoice_event(
        &event_id(run, 2),
        "invoice.payment_failed",
        BASE_TS,
        &ref_forward,
        5000,
        metadata.clone(),
    );
    billing.webhooks.handle_event(&paid_fwd).await.expect("Delivery failed");
    billing.webhooks.handle_event(&failed_fwd).await.expect("Delivery failed");

    let failed_rev = invoice_event(
        &event_id(run, 3),
        "invoice.payment_failed",
        BASE_TS,
        &ref_reverse,
        5000,
        metadata.clone(),
    );
    let paid_rev = invoice_event(
        &event_id(run, 4),
        "invoice.payment_succeeded",
        BASE_TS + 60,
        &ref_reverse,
        5000,
        metadata,
    );
    billing.webhooks.handle_event(&failed_rev).await.expect("Delivery failed");
    billing.webhooks.handle_event(&paid_rev).await.expect("Delivery failed");

    // Then: both refs converge on paid, the strictly newer terminal status
    for provider_ref in [&ref_forward, &ref_reverse] {
        let invoice = billing
            .ledger
            .find_by_provider_ref(provider_ref)
            .await
            .expect("Failed to load invoice")
            .expect("Invoice should exist");
        assert_eq!(
            invoice.status.to_string(),
            "paid",
            "Arrival order must not change the terminal status"
        );
        assert_eq!(
            invoice.status_event_at.map(|t| t.unix_timestamp()),
            Some(BASE_TS + 60)
        );
        assert_eq!(count_invoices(&pool, provider_ref).await, 1);
    }

    cleanup(&pool, agency_id, run).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_tied_terminal_timestamps_resolve_to_failed() {
    // Given: paid and failed events carrying the same processor timestamp
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;
    let metadata = tenant_metadata(None, Some(agency_id));

    let ref_forward = format!("in_{}_tie_fwd", run.simple());
    let ref_reverse = format!("in_{}_tie_rev", run.simple());

    let paid_fwd = invoice_event(
        &event_id(run, 1),
        "invoice.payment_succeeded",
        BASE_TS,
        &ref_forward,
        5000,
        metadata.clone(),
    );
    let failed_fwd = invoice_event(
        &event_id(run, 2),
        "invoice.payment_failed",
        BASE_TS,
        &ref_forward,
        5000,
        metadata.clone(),
    );
    billing.webhooks.handle_event(&paid_fwd).await.expect("Delivery failed");
    billing.webhooks.handle_event(&failed_fwd).await.expect("Delivery failed");

    let failed_rev = invoice_event(
        &event_id(run, 3),
        "invoice.payment_failed",
        BASE_TS,
        &ref_reverse,
        5000,
        metadata.clone(),
    );
    let paid_rev = invoice_event(
        &event_id(run, 4),
        "invoice.payment_succeeded",
        BASE_TS,
        &ref_reverse,
        5000,
        metadata,
    );
    billing.webhooks.handle_event(&failed_rev).await.expect("Delivery failed");
    billing.webhooks.handle_event(&paid_rev).await.expect("Delivery failed");

    // Then: the tie resolves to failed in both arrival orders
    for provider_ref in [&ref_forward, &ref_reverse] {
        let invoice = billing
            .ledger
            .find_by_provider_ref(provider_ref)
            .await
            .expect("Failed to load invoice")
            .expect("Invoice should exist");
        assert_eq!(
            invoice.status.to_string(),
            "failed",
            "A timestamp tie must resolve to failed so a real failure is never masked"
        );
    }

    cleanup(&pool, agency_id, run).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_stale_subscription_update_is_gated() {
    // Given: a newer subscription update already applied
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;
    let metadata = tenant_metadata(None, Some(agency_id));

    let newer = subscription_event(
        &event_id(run, 1),
        "customer.subscription.updated",
        BASE_TS + 120,
        "past_due",
        metadata.clone(),
    );
    let older = subscription_event(
        &event_id(run, 2),
        "customer.subscription.updated",
        BASE_TS,
        "active",
        metadata,
    );

    // When: the older event arrives second
    let first = billing.webhooks.handle_event(&newer).await.expect("Delivery failed");
    let second = billing.webhooks.handle_event(&older).await.expect("Delivery failed");

    // Then: the older event is skipped and the newer state stands
    assert_eq!(first, DeliveryOutcome::Applied);
    assert_eq!(second, DeliveryOutcome::SkippedStale);

    let tenant = billing
        .tenants
        .find(agency_id)
        .await
        .expect("Failed to load tenant")
        .expect("Agency tenant should exist");
    assert_eq!(tenant.billing.status.to_string(), "past_due");
    assert_eq!(tenant.billing.version, 1);
    assert_eq!(
        tenant.billing.last_event_at.map(|t| t.unix_timestamp()),
        Some(BASE_TS + 120)
    );

    let (outcome, _) = audit_outcome(&pool, &event_id(run, 2))
        .await
        .expect("Audit row should exist");
    assert_eq!(outcome, "skipped_stale");

    cleanup(&pool, agency_id, run).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_stale_payment_still_records_ledger_and_activity() {
    // Given: a client whose watermark was set by a newer subscription event
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;
    let client_id = create_client(&pool, agency_id, "Harbor Dental").await;
    let metadata = tenant_metadata(Some(client_id), Some(agency_id));

    let newer = subscription_event(
        &event_id(run, 1),
        "customer.subscription.updated",
        BASE_TS + 600,
        "active",
        metadata.clone(),
    );
    billing.webhooks.handle_event(&newer).await.expect("Delivery failed");

    // When: an older payment arrives late
    let provider_ref = format!("pi_{}", run.simple());
    let late = payment_succeeded(&event_id(run, 2), BASE_TS, &provider_ref, 5000, metadata);
    let outcome = billing.webhooks.handle_event(&late).await.expect("Delivery failed");

    // Then: the tenant record is gated but the invoice and feed entry land
    assert_eq!(outcome, DeliveryOutcome::SkippedStale);

    let client = billing
        .tenants
        .find(client_id)
        .await
        .expect("Failed to load tenant")
        .expect("Client tenant should exist");
    assert_eq!(
        client.billing.last_payment_cents, None,
        "A stale payment must not touch the billing record"
    );
    assert_eq!(client.billing.version, 1);

    let invoice = billing
        .ledger
        .find_by_provider_ref(&provider_ref)
        .await
        .expect("Failed to load invoice")
        .expect("Invoice should exist");
    assert_eq!(invoice.status.to_string(), "paid");
    assert_eq!(invoice.client_tenant_id, Some(client_id));

    assert_eq!(count_activity(&pool, agency_id).await, 1);

    let (recorded, detail) = audit_outcome(&pool, &event_id(run, 2))
        .await
        .expect("Audit row should exist");
    assert_eq!(recorded, "skipped_stale");
    assert!(
        detail.unwrap_or_default().contains("still recorded"),
        "Audit detail should name the rows that landed"
    );

    cleanup(&pool, agency_id, run).await;
}

// ============================================================================
// Test Cases: Concurrent Writers
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_version_conflict_retries_against_fresh_record() {
    // Given: a tenant snapshot read before another writer advanced it
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;

    let snapshot = billing
        .tenants
        .find(agency_id)
        .await
        .expect("Failed to load tenant")
        .expect("Agency tenant should exist");
    assert_eq!(snapshot.billing.version, 0);

    bump_version(&pool, agency_id, None).await;

    // When: a patch is applied against the stale snapshot
    let event_time = OffsetDateTime::from_unix_timestamp(BASE_TS).expect("Valid timestamp");
    let patch = BillingPatch::new().status(BillingStatus::PastDue);

    let mut tx = pool.begin().await.expect("Failed to begin transaction");
    let outcome = billing
        .tenants
        .apply_billing_patch(&mut tx, &snapshot, event_time, &patch)
        .await
        .expect("A conflict within the attempt budget must not fail the write");
    tx.commit().await.expect("Failed to commit");

    // Then: the first update misses and the re-read retry lands
    assert_eq!(outcome, PatchOutcome::Applied);

    let tenant = billing
        .tenants
        .find(agency_id)
        .await
        .expect("Failed to load tenant")
        .expect("Agency tenant should exist");
    assert_eq!(tenant.billing.status.to_string(), "past_due");
    assert_eq!(
        tenant.billing.version, 2,
        "The concurrent bump and the retried patch each advance the version"
    );
    assert_eq!(
        tenant.billing.last_event_at.map(|t| t.unix_timestamp()),
        Some(BASE_TS)
    );

    cleanup(&pool, agency_id, run).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_version_conflict_reread_honors_fresh_watermark() {
    // Given: a concurrent writer that applied a newer event after our read
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;

    let snapshot = billing
        .tenants
        .find(agency_id)
        .await
        .expect("Failed to load tenant")
        .expect("Agency tenant should exist");

    let newer = OffsetDateTime::from_unix_timestamp(BASE_TS + 60).expect("Valid timestamp");
    bump_version(&pool, agency_id, Some(newer)).await;

    // When: an older event's patch retries after the version conflict
    let event_time = OffsetDateTime::from_unix_timestamp(BASE_TS).expect("Valid timestamp");
    let patch = BillingPatch::new().status(BillingStatus::PastDue);

    let mut tx = pool.begin().await.expect("Failed to begin transaction");
    let outcome = billing
        .tenants
        .apply_billing_patch(&mut tx, &snapshot, event_time, &patch)
        .await
        .expect("A stale resolution is not an error");
    tx.commit().await.expect("Failed to commit");

    // Then: the re-read watermark gates the event instead of applying it
    assert_eq!(outcome, PatchOutcome::Stale);

    let tenant = billing
        .tenants
        .find(agency_id)
        .await
        .expect("Failed to load tenant")
        .expect("Agency tenant should exist");
    assert_eq!(
        tenant.billing.status.to_string(),
        "active",
        "The gated patch must not land"
    );
    assert_eq!(
        tenant.billing.version, 1,
        "Only the concurrent writer's bump remains"
    );
    assert_eq!(
        tenant.billing.last_event_at.map(|t| t.unix_timestamp()),
        Some(BASE_TS + 60)
    );

    cleanup(&pool, agency_id, run).await;
}

// ============================================================================
// Test Cases: Agency Cascade
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_subscription_deleted_cascades_to_agency_feed() {
    // Given: a client sub-account under an agency
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;
    let client_id = create_client(&pool, agency_id, "Harbor Dental").await;

    let evt = subscription_event(
        &event_id(run, 1),
        "customer.subscription.deleted",
        BASE_TS,
        "canceled",
        tenant_metadata(Some(client_id), Some(agency_id)),
    );

    // When: the client's subscription is deleted
    let outcome = billing.webhooks.handle_event(&evt).await.expect("Delivery failed");
    assert_eq!(outcome, DeliveryOutcome::Applied);

    // Then: the client is canceled and suspended
    let client = billing
        .tenants
        .find(client_id)
        .await
        .expect("Failed to load tenant")
        .expect("Client tenant should exist");
    assert_eq!(client.billing.status.to_string(), "canceled");
    assert_eq!(client.status.to_string(), "suspended");

    // And: the agency's own state is untouched
    let agency = billing
        .tenants
        .find(agency_id)
        .await
        .expect("Failed to load tenant")
        .expect("Agency tenant should exist");
    assert_eq!(agency.billing.status.to_string(), "active");
    assert_eq!(agency.status.to_string(), "active");
    assert_eq!(agency.billing.version, 0, "Cascade must not write the agency's billing record");

    // And: exactly one feed entry names both the client and the agency
    let feed = billing
        .activity
        .recent_for_agency(agency_id, 10)
        .await
        .expect("Failed to load activity feed");
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].activity_type.to_string(), "subscription_canceled");
    assert_eq!(feed[0].client_tenant_id, Some(client_id));
    assert_eq!(feed[0].client_name.as_deref(), Some("Harbor Dental"));
    assert_eq!(feed[0].provider_event_id.as_deref(), Some(event_id(run, 1).as_str()));

    cleanup(&pool, agency_id, run).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_client_payment_resolves_agency_from_tenant_row() {
    // Given: an event naming only the client, no agency reference
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;
    let client_id = create_client(&pool, agency_id, "Harbor Dental").await;

    let evt = payment_succeeded(
        &event_id(run, 1),
        BASE_TS,
        &format!("pi_{}", run.simple()),
        5000,
        tenant_metadata(Some(client_id), None),
    );

    // When: the payment is delivered
    let outcome = billing.webhooks.handle_event(&evt).await.expect("Delivery failed");
    assert_eq!(outcome, DeliveryOutcome::Applied);

    // Then: the feed entry is filed under the parent agency from the tenant row
    let feed = billing
        .activity
        .recent_for_agency(agency_id, 10)
        .await
        .expect("Failed to load activity feed");
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].client_tenant_id, Some(client_id));
    assert_eq!(feed[0].amount_cents, Some(5000));

    cleanup(&pool, agency_id, run).await;
}

// ============================================================================
// Test Cases: Suspension
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_payment_failure_suspends_and_success_does_not_reactivate() {
    // Given: a client whose invoice payment failed
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;
    let client_id = create_client(&pool, agency_id, "Harbor Dental").await;
    let metadata = tenant_metadata(Some(client_id), Some(agency_id));

    let failed = invoice_event(
        &event_id(run, 1),
        "invoice.payment_failed",
        BASE_TS,
        &format!("in_{}", run.simple()),
        5000,
        metadata.clone(),
    );
    billing.webhooks.handle_event(&failed).await.expect("Delivery failed");

    let client = billing
        .tenants
        .find(client_id)
        .await
        .expect("Failed to load tenant")
        .expect("Client tenant should exist");
    assert_eq!(client.billing.status.to_string(), "payment_failed");
    assert_eq!(client.status.to_string(), "suspended");

    // When: a later payment succeeds
    let succeeded = payment_succeeded(
        &event_id(run, 2),
        BASE_TS + 3600,
        &format!("pi_{}", run.simple()),
        5000,
        metadata,
    );
    billing.webhooks.handle_event(&succeeded).await.expect("Delivery failed");

    // Then: billing recovers but the suspension stands until the directory
    // reactivates the tenant
    let client = billing
        .tenants
        .find(client_id)
        .await
        .expect("Failed to load tenant")
        .expect("Client tenant should exist");
    assert_eq!(client.billing.status.to_string(), "active");
    assert_eq!(client.billing.last_payment_cents, Some(5000));
    assert_eq!(client.status.to_string(), "suspended");

    cleanup(&pool, agency_id, run).await;
}

// ============================================================================
// Test Cases: Boundary Deliveries
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_unknown_tenant_is_acked_and_audited() {
    // Given: an event referencing a tenant that does not exist
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let missing_id = Uuid::new_v4();

    let evt = payment_succeeded(
        &event_id(run, 1),
        BASE_TS,
        "pi_unknown_tenant",
        5000,
        tenant_metadata(Some(missing_id), None),
    );

    // When: the event is delivered twice
    let first = billing.webhooks.handle_event(&evt).await.expect("Delivery failed");
    let second = billing.webhooks.handle_event(&evt).await.expect("Delivery failed");

    // Then: delivery is acked, audited, and deduplicated
    assert_eq!(first, DeliveryOutcome::SkippedUnknownTenant);
    assert_eq!(second, DeliveryOutcome::Duplicate);

    let (outcome, detail) = audit_outcome(&pool, &event_id(run, 1))
        .await
        .expect("Audit row should exist");
    assert_eq!(outcome, "skipped_unknown_tenant");
    assert!(
        detail.unwrap_or_default().contains(&missing_id.to_string()),
        "Audit detail should name the missing tenant"
    );

    assert_eq!(count_invoices(&pool, "pi_unknown_tenant").await, 0);

    sqlx::query("DELETE FROM processed_events WHERE event_id LIKE $1")
        .bind(format!("evt_{}%", run.simple()))
        .execute(&pool)
        .await
        .ok();
}

#[tokio::test]
#[ignore] // Requires database
async fn test_event_without_tenant_metadata_is_surfaced() {
    // Given: a routable event type with no tenant references at all
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();

    let evt = payment_succeeded(
        &event_id(run, 1),
        BASE_TS,
        "pi_no_metadata",
        5000,
        json!({}),
    );

    // When: the event is delivered
    let outcome = billing.webhooks.handle_event(&evt).await.expect("Delivery failed");

    // Then: it is acked but leaves a durable data-quality record
    assert_eq!(outcome, DeliveryOutcome::SkippedUnroutable);

    let (recorded, detail) = audit_outcome(&pool, &event_id(run, 1))
        .await
        .expect("Audit row should exist");
    assert_eq!(recorded, "skipped_unroutable");
    assert!(
        detail.unwrap_or_default().contains("payment_intent.succeeded"),
        "Audit detail should name the event type"
    );

    sqlx::query("DELETE FROM processed_events WHERE event_id LIKE $1")
        .bind(format!("evt_{}%", run.simple()))
        .execute(&pool)
        .await
        .ok();
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unsupported_event_type_is_acked() {
    // Given: an event type with no handler
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();

    let evt = decode_event(&json!({
        "id": event_id(run, 1),
        "type": "charge.refunded",
        "created": BASE_TS,
        "data": {"object": {"id": "ch_1"}}
    }));

    // When: the event is delivered
    let outcome = billing.webhooks.handle_event(&evt).await.expect("Delivery failed");

    // Then: it is acked as unsupported and audited
    assert_eq!(outcome, DeliveryOutcome::SkippedUnsupported);

    let (recorded, _) = audit_outcome(&pool, &event_id(run, 1))
        .await
        .expect("Audit row should exist");
    assert_eq!(recorded, "skipped_unsupported");

    sqlx::query("DELETE FROM processed_events WHERE event_id LIKE $1")
        .bind(format!("evt_{}%", run.simple()))
        .execute(&pool)
        .await
        .ok();
}

// ============================================================================
// Test Cases: Connect Account Updates
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_account_updated_sets_connect_flags() {
    // Given: an agency with no Connect state yet
    let (billing, pool) = setup().await;
    let run = Uuid::new_v4();
    let agency_id = create_agency(&pool, "Test Agency").await;

    let evt = decode_event(&json!({
        "id": event_id(run, 1),
        "type": "account.updated",
        "created": BASE_TS,
        "data": {"object": {
            "id": "acct_1",
            "details_submitted": true,
            "charges_enabled": true,
            "payouts_enabled": true,
            "metadata": tenant_metadata(None, Some(agency_id)),
        }}
    }));

    // When: the account update is delivered
    let outcome = billing.webhooks.handle_event(&evt).await.expect("Delivery failed");
    assert_eq!(outcome, DeliveryOutcome::Applied);

    // Then: onboarding state lands on the agency without touching billing
    let agency = billing
        .tenants
        .find(agency_id)
        .await
        .expect("Failed to load tenant")
        .expect("Agency tenant should exist");
    assert_eq!(
        agency.billing.connect_status.map(|s| s.to_string()),
        Some("complete".to_string())
    );
    assert!(agency.billing.charges_enabled);
    assert!(agency.billing.payouts_enabled);
    assert_eq!(agency.billing.status.to_string(), "active");

    cleanup(&pool, agency_id, run).await;
}
