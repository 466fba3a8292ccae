// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! SiteLoft Billing Module
//!
//! Reconciles payment processor state into the tenant directory, driven
//! entirely by webhooks. Stripe is the source of truth for money; this crate
//! folds its events into tenant billing status, the invoice ledger, and the
//! per-agency activity feed.
//!
//! ## Features
//!
//! - **Webhook Verification**: Signed-payload HMAC verification, fail closed
//! - **Idempotent Delivery**: Transactional event-id reservation so redelivered
//!   events never apply twice
//! - **Billing State Machine**: Payment, invoice, subscription, and Connect
//!   account events folded into tenant billing records
//! - **Out-of-Order Arbitration**: Event-timestamp gating for tenant state and
//!   terminal-status arbitration for invoices
//! - **Agency Cascade**: Client sub-account events surface in the parent
//!   agency's activity feed
//! - **Consistency Checks**: Runnable invariant sweep over billing state

pub mod activity;
pub mod client;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod invariants;
pub mod ledger;
pub mod tenants;
pub mod webhooks;

// Activity
pub use activity::{ActivityLog, ActivityRecordBuilder};

// Client
pub use client::{StripeConfig, DEFAULT_SIGNATURE_TOLERANCE_SECS};

// Error
pub use error::{BillingError, BillingResult};

// Event
pub use event::{
    AccountObject, EventEnvelope, EventPayload, InvoiceObject, PaymentEvent, PaymentIntentObject,
    SubscriptionObject, TenantRefs,
};

// Idempotency
pub use idempotency::IdempotencyGuard;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{terminal_supersedes, InvoiceLedger};

// Tenants
pub use tenants::{BillingPatch, PatchOutcome, TenantStore};

// Webhooks
pub use webhooks::{verify_signature, DeliveryOutcome, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines webhook processing with the read
/// paths the API and worker use
pub struct BillingService {
    pub webhooks: WebhookHandler,
    pub tenants: TenantStore,
    pub ledger: InvoiceLedger,
    pub activity: ActivityLog,
    pub guard: IdempotencyGuard,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self {
            webhooks: WebhookHandler::new(config, pool.clone()),
            tenants: TenantStore::new(pool.clone()),
            ledger: InvoiceLedger::new(pool.clone()),
            activity: ActivityLog::new(pool.clone()),
            guard: IdempotencyGuard::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
        }
    }
}
