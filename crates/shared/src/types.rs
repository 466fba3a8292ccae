//! Common types used across SiteLoft

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Tenant kind within the two-level hierarchy.
///
/// Agencies are the paying accounts; agency clients are the sub-accounts an
/// agency resells to. Every `AgencyClient` row has exactly one parent agency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TenantKind {
    Agency,
    AgencyClient,
}

impl TenantKind {
    pub fn is_agency(&self) -> bool {
        matches!(self, Self::Agency)
    }
}

impl std::fmt::Display for TenantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agency => write!(f, "agency"),
            Self::AgencyClient => write!(f, "agency_client"),
        }
    }
}

impl std::str::FromStr for TenantKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agency" => Ok(Self::Agency),
            "agency_client" => Ok(Self::AgencyClient),
            _ => Err(format!("Invalid tenant kind: {}", s)),
        }
    }
}

/// Tenant account status. Suspension is driven by billing outcomes;
/// reactivation is owned by the tenant directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
}

impl Default for TenantStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Billing status of a tenant's subscription.
///
/// `PaymentFailed` is set by failed payment/invoice events; the remaining
/// variants mirror the processor's own subscription statuses so that
/// `customer.subscription.updated` can be applied directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Active,
    Trialing,
    PastDue,
    PaymentFailed,
    Unpaid,
    Incomplete,
    Canceled,
}

impl Default for BillingStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl BillingStatus {
    /// Map a processor subscription status string onto our billing status.
    /// Returns None for statuses we do not track; callers leave the stored
    /// value unchanged in that case rather than guessing.
    pub fn from_provider(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "trialing" => Some(Self::Trialing),
            "past_due" => Some(Self::PastDue),
            "unpaid" => Some(Self::Unpaid),
            "incomplete" | "incomplete_expired" => Some(Self::Incomplete),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Trialing => write!(f, "trialing"),
            Self::PastDue => write!(f, "past_due"),
            Self::PaymentFailed => write!(f, "payment_failed"),
            Self::Unpaid => write!(f, "unpaid"),
            Self::Incomplete => write!(f, "incomplete"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Connect (payout account) onboarding state, derived from `account.updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectStatus {
    Pending,
    Complete,
    Restricted,
}

impl ConnectStatus {
    /// Derive the onboarding state from the account flags the processor
    /// sends on `account.updated`.
    pub fn from_account_flags(
        details_submitted: bool,
        charges_enabled: bool,
        payouts_enabled: bool,
    ) -> Self {
        if charges_enabled && payouts_enabled {
            Self::Complete
        } else if !details_submitted {
            Self::Pending
        } else {
            Self::Restricted
        }
    }
}

impl std::fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Complete => write!(f, "complete"),
            Self::Restricted => write!(f, "restricted"),
        }
    }
}

/// Invoice ledger status. Rows start pending and settle to exactly one
/// terminal state; out-of-order terminal events are reconciled by event
/// timestamp, not arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Failed,
}

impl Default for InvoiceStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl InvoiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Failed)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Activity feed record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    PaymentReceived,
    PaymentFailed,
    SubscriptionCanceled,
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PaymentReceived => write!(f, "payment_received"),
            Self::PaymentFailed => write!(f, "payment_failed"),
            Self::SubscriptionCanceled => write!(f, "subscription_canceled"),
        }
    }
}

impl std::str::FromStr for ActivityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "payment_received" => Ok(Self::PaymentReceived),
            "payment_failed" => Ok(Self::PaymentFailed),
            "subscription_canceled" => Ok(Self::SubscriptionCanceled),
            _ => Err(format!("Invalid activity type: {}", s)),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Embedded billing sub-record of a tenant.
///
/// Mutated exclusively by webhook handlers. `version` is the optimistic
/// concurrency counter: every write is conditional on the version read and
/// bumps it by one. `last_event_at` is the processor timestamp of the newest
/// applied event; strictly older events are stale.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantBilling {
    #[sqlx(rename = "billing_status")]
    pub status: BillingStatus,
    #[sqlx(rename = "billing_last_payment_at")]
    pub last_payment_at: Option<OffsetDateTime>,
    #[sqlx(rename = "billing_last_payment_cents")]
    pub last_payment_cents: Option<i64>,
    #[sqlx(rename = "billing_next_billing_date")]
    pub next_billing_date: Option<OffsetDateTime>,
    #[sqlx(rename = "billing_cancel_at_period_end")]
    pub cancel_at_period_end: bool,
    #[sqlx(rename = "billing_connect_status")]
    pub connect_status: Option<ConnectStatus>,
    #[sqlx(rename = "billing_charges_enabled")]
    pub charges_enabled: bool,
    #[sqlx(rename = "billing_payouts_enabled")]
    pub payouts_enabled: bool,
    #[sqlx(rename = "billing_last_event_at")]
    pub last_event_at: Option<OffsetDateTime>,
    #[sqlx(rename = "billing_version")]
    pub version: i64,
}

impl Default for TenantBilling {
    fn default() -> Self {
        Self {
            status: BillingStatus::Active,
            last_payment_at: None,
            last_payment_cents: None,
            next_billing_date: None,
            cancel_at_period_end: false,
            connect_status: None,
            charges_enabled: false,
            payouts_enabled: false,
            last_event_at: None,
            version: 0,
        }
    }
}

/// Tenant model. Rows are provisioned by the tenant directory; this
/// subsystem only reads existence and writes `status` plus `billing`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub parent_agency_id: Option<Uuid>,
    pub kind: TenantKind,
    pub name: String,
    pub status: TenantStatus,
    #[sqlx(flatten)]
    pub billing: TenantBilling,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Invoice ledger row: at most one per processor reference.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub agency_tenant_id: Uuid,
    /// None for an agency's own subscription invoice.
    pub client_tenant_id: Option<Uuid>,
    pub provider_ref: String,
    pub amount_cents: i64,
    pub status: InvoiceStatus,
    pub status_event_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
}

/// Agency activity feed row. Write-once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub agency_tenant_id: Uuid,
    pub activity_type: ActivityType,
    pub client_tenant_id: Option<Uuid>,
    pub client_name: Option<String>,
    pub amount_cents: Option<i64>,
    pub provider_event_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Idempotency guard / delivery audit row.
///
/// `outcome` stays a plain string here: the typed outcome lives with the
/// webhook handler, and operator tooling only filters and displays it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: OffsetDateTime,
    pub outcome: String,
    pub detail: Option<String>,
    pub received_at: OffsetDateTime,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // TenantKind Tests
    // =========================================================================

    #[test]
    fn test_tenant_kind_display_and_parse() {
        assert_eq!(format!("{}", TenantKind::Agency), "agency");
        assert_eq!(format!("{}", TenantKind::AgencyClient), "agency_client");
        assert_eq!("agency".parse::<TenantKind>().unwrap(), TenantKind::Agency);
        assert_eq!(
            "AGENCY_CLIENT".parse::<TenantKind>().unwrap(),
            TenantKind::AgencyClient
        );
        assert!("reseller".parse::<TenantKind>().is_err());
    }

    #[test]
    fn test_tenant_kind_is_agency() {
        assert!(TenantKind::Agency.is_agency());
        assert!(!TenantKind::AgencyClient.is_agency());
    }

    // =========================================================================
    // BillingStatus Tests
    // =========================================================================

    #[test]
    fn test_billing_status_default() {
        assert_eq!(BillingStatus::default(), BillingStatus::Active);
    }

    #[test]
    fn test_billing_status_from_provider() {
        assert_eq!(
            BillingStatus::from_provider("active"),
            Some(BillingStatus::Active)
        );
        assert_eq!(
            BillingStatus::from_provider("past_due"),
            Some(BillingStatus::PastDue)
        );
        assert_eq!(
            BillingStatus::from_provider("incomplete_expired"),
            Some(BillingStatus::Incomplete)
        );
        assert_eq!(
            BillingStatus::from_provider("canceled"),
            Some(BillingStatus::Canceled)
        );
        // Unknown provider statuses are ignored, not guessed
        assert_eq!(BillingStatus::from_provider("paused"), None);
        assert_eq!(BillingStatus::from_provider(""), None);
    }

    #[test]
    fn test_billing_status_display() {
        assert_eq!(format!("{}", BillingStatus::PaymentFailed), "payment_failed");
        assert_eq!(format!("{}", BillingStatus::PastDue), "past_due");
        assert_eq!(format!("{}", BillingStatus::Canceled), "canceled");
    }

    #[test]
    fn test_billing_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&BillingStatus::PaymentFailed).unwrap();
        assert_eq!(json, "\"payment_failed\"");
        let parsed: BillingStatus = serde_json::from_str("\"past_due\"").unwrap();
        assert_eq!(parsed, BillingStatus::PastDue);
    }

    // =========================================================================
    // ConnectStatus Tests
    // =========================================================================

    #[test]
    fn test_connect_status_derivation() {
        // Fully enabled account
        assert_eq!(
            ConnectStatus::from_account_flags(true, true, true),
            ConnectStatus::Complete
        );
        // Never finished onboarding
        assert_eq!(
            ConnectStatus::from_account_flags(false, false, false),
            ConnectStatus::Pending
        );
        // Submitted but the processor disabled charges or payouts
        assert_eq!(
            ConnectStatus::from_account_flags(true, false, false),
            ConnectStatus::Restricted
        );
        assert_eq!(
            ConnectStatus::from_account_flags(true, true, false),
            ConnectStatus::Restricted
        );
    }

    // =========================================================================
    // InvoiceStatus Tests
    // =========================================================================

    #[test]
    fn test_invoice_status_default_and_terminal() {
        assert_eq!(InvoiceStatus::default(), InvoiceStatus::Pending);
        assert!(!InvoiceStatus::Pending.is_terminal());
        assert!(InvoiceStatus::Paid.is_terminal());
        assert!(InvoiceStatus::Failed.is_terminal());
    }

    // =========================================================================
    // ActivityType Tests
    // =========================================================================

    #[test]
    fn test_activity_type_display_and_parse() {
        assert_eq!(
            format!("{}", ActivityType::PaymentReceived),
            "payment_received"
        );
        assert_eq!(
            format!("{}", ActivityType::SubscriptionCanceled),
            "subscription_canceled"
        );
        assert_eq!(
            "payment_failed".parse::<ActivityType>().unwrap(),
            ActivityType::PaymentFailed
        );
        assert!("login".parse::<ActivityType>().is_err());
    }

    // =========================================================================
    // Model Tests
    // =========================================================================

    #[test]
    fn test_tenant_billing_default() {
        let billing = TenantBilling::default();
        assert_eq!(billing.status, BillingStatus::Active);
        assert_eq!(billing.version, 0);
        assert!(billing.last_event_at.is_none());
        assert!(!billing.cancel_at_period_end);
    }

    #[test]
    fn test_tenant_serializes_billing_as_nested_object() {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            parent_agency_id: None,
            kind: TenantKind::Agency,
            name: "Acme Web Co".to_string(),
            status: TenantStatus::Active,
            billing: TenantBilling::default(),
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };

        let value = serde_json::to_value(&tenant).unwrap();
        assert_eq!(value["kind"], "agency");
        assert_eq!(value["billing"]["status"], "active");
        assert_eq!(value["billing"]["version"], 0);
    }
}
