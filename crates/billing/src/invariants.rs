//! Billing consistency checks
//!
//! Runnable read-only checks over the tenant, invoice, activity, and
//! delivery-audit tables. Each check is a real SQL query returning the rows
//! that violate it, with enough context to debug. The worker runs the full
//! sweep daily and operators can trigger it through the admin API after a
//! webhook replay or a support escalation.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single violated consistency rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which check was violated
    pub invariant: String,
    /// Tenant(s) affected, when the violation is tenant-scoped
    pub tenant_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - the delivery pipeline itself misbehaved
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of one full sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the sweep was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DelinquentActiveRow {
    tenant_id: Uuid,
    name: String,
    billing_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UnresolvedTerminalInvoiceRow {
    invoice_id: Uuid,
    agency_tenant_id: Uuid,
    provider_ref: String,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ResolvedPendingInvoiceRow {
    invoice_id: Uuid,
    agency_tenant_id: Uuid,
    provider_ref: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MisfiledActivityRow {
    activity_id: Uuid,
    agency_tenant_id: Uuid,
    activity_type: String,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanClientRow {
    tenant_id: Uuid,
    name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckReservationRow {
    event_id: String,
    event_type: String,
    received_at: OffsetDateTime,
}

/// Service for running billing consistency checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and return the summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_suspended_when_delinquent().await?);
        violations.extend(self.check_terminal_invoice_has_resolution().await?);
        violations.extend(self.check_pending_invoice_unresolved().await?);
        violations.extend(self.check_activity_filed_under_agency().await?);
        violations.extend(self.check_client_has_parent_agency().await?);
        violations.extend(self.check_no_stuck_reservations().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Check 1: Delinquent tenants are suspended
    ///
    /// The payment-failed and canceled handlers suspend the tenant in the
    /// same transaction that records the billing status. An active tenant
    /// with one of those statuses either missed the suspension write or was
    /// manually reactivated without clearing the delinquency, so this is a
    /// prompt to investigate rather than proof of corruption.
    async fn check_suspended_when_delinquent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DelinquentActiveRow> = sqlx::query_as(
            r#"
            SELECT id AS tenant_id, name, billing_status
            FROM tenants
            WHERE billing_status IN ('payment_failed', 'canceled')
              AND status = 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "suspended_when_delinquent".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant '{}' has billing status '{}' but is still active",
                    row.name, row.billing_status
                ),
                context: serde_json::json!({
                    "name": row.name,
                    "billing_status": row.billing_status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Check 2: Terminal invoices carry their resolution timestamps
    ///
    /// A paid invoice gets paid_at and a failed invoice gets failed_at in
    /// the same update that sets the status, along with the event timestamp
    /// used for ordering. A terminal row missing them cannot participate in
    /// out-of-order arbitration.
    async fn check_terminal_invoice_has_resolution(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnresolvedTerminalInvoiceRow> = sqlx::query_as(
            r#"
            SELECT id AS invoice_id, agency_tenant_id, provider_ref, status
            FROM invoices
            WHERE (status = 'paid' AND (paid_at IS NULL OR status_event_at IS NULL))
               OR (status = 'failed' AND (failed_at IS NULL OR status_event_at IS NULL))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "terminal_invoice_has_resolution".to_string(),
                tenant_ids: vec![row.agency_tenant_id],
                description: format!(
                    "Invoice '{}' is {} but is missing its resolution timestamps",
                    row.provider_ref, row.status
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "provider_ref": row.provider_ref,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Check 3: Pending invoices have no resolution timestamps
    ///
    /// paid_at and failed_at are only written by the terminal transitions,
    /// which also leave the terminal status behind.
    async fn check_pending_invoice_unresolved(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ResolvedPendingInvoiceRow> = sqlx::query_as(
            r#"
            SELECT id AS invoice_id, agency_tenant_id, provider_ref
            FROM invoices
            WHERE status = 'pending'
              AND (paid_at IS NOT NULL OR failed_at IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_invoice_unresolved".to_string(),
                tenant_ids: vec![row.agency_tenant_id],
                description: format!(
                    "Invoice '{}' is pending but carries a resolution timestamp",
                    row.provider_ref
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "provider_ref": row.provider_ref,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Check 4: Activity records are filed under agency tenants
    ///
    /// The feed is the agency's view of its book of business, so every row
    /// must point at an existing tenant of kind 'agency'.
    async fn check_activity_filed_under_agency(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MisfiledActivityRow> = sqlx::query_as(
            r#"
            SELECT a.id AS activity_id, a.agency_tenant_id, a.activity_type
            FROM agency_activity a
            LEFT JOIN tenants t ON t.id = a.agency_tenant_id
            WHERE t.id IS NULL OR t.kind != 'agency'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "activity_filed_under_agency".to_string(),
                tenant_ids: vec![row.agency_tenant_id],
                description: format!(
                    "Activity record {} ({}) is not filed under an agency tenant",
                    row.activity_id, row.activity_type
                ),
                context: serde_json::json!({
                    "activity_id": row.activity_id,
                    "activity_type": row.activity_type,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Check 5: Client tenants have a parent agency
    ///
    /// Cascade routing resolves a client's agency from the tenant row when
    /// the event metadata names only the client. A client without a parent
    /// agency row makes its payment events unroutable.
    async fn check_client_has_parent_agency(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanClientRow> = sqlx::query_as(
            r#"
            SELECT c.id AS tenant_id, c.name
            FROM tenants c
            LEFT JOIN tenants p ON p.id = c.parent_agency_id
            WHERE c.kind = 'agency_client'
              AND (c.parent_agency_id IS NULL OR p.kind IS DISTINCT FROM 'agency')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "client_has_parent_agency".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!("Client tenant '{}' has no parent agency", row.name),
                context: serde_json::json!({
                    "name": row.name,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Check 6: No delivery reservation stays in 'processing'
    ///
    /// A delivery reserves its event id and records the outcome in the same
    /// transaction, and a failed delivery rolls the reservation back. A
    /// reservation still 'processing' long after it was received means a
    /// write path bypassed that transaction.
    async fn check_no_stuck_reservations(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckReservationRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, received_at
            FROM processed_events
            WHERE outcome = 'processing'
              AND received_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_reservations".to_string(),
                tenant_ids: vec![],
                description: format!(
                    "Event '{}' ({}) has been in processing since {}",
                    row.event_id, row.event_type, row.received_at
                ),
                context: serde_json::json!({
                    "event_id": row.event_id,
                    "event_type": row.event_type,
                    "received_at": row.received_at.to_string(),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "suspended_when_delinquent" => self.check_suspended_when_delinquent().await,
            "terminal_invoice_has_resolution" => {
                self.check_terminal_invoice_has_resolution().await
            }
            "pending_invoice_unresolved" => self.check_pending_invoice_unresolved().await,
            "activity_filed_under_agency" => self.check_activity_filed_under_agency().await,
            "client_has_parent_agency" => self.check_client_has_parent_agency().await,
            "no_stuck_reservations" => self.check_no_stuck_reservations().await,
            _ => Ok(vec![]),
        }
    }

    /// Names of all available checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "suspended_when_delinquent",
            "terminal_invoice_has_resolution",
            "pending_invoice_unresolved",
            "activity_filed_under_agency",
            "client_has_parent_agency",
            "no_stuck_reservations",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"no_stuck_reservations"));
        assert!(checks.contains(&"client_has_parent_agency"));
    }

    #[test]
    fn test_violation_serializes_with_context() {
        let violation = InvariantViolation {
            invariant: "client_has_parent_agency".to_string(),
            tenant_ids: vec![Uuid::new_v4()],
            description: "Client tenant 'Harbor Dental' has no parent agency".to_string(),
            context: serde_json::json!({"name": "Harbor Dental"}),
            severity: ViolationSeverity::High,
        };

        let encoded = serde_json::to_value(&violation).unwrap();
        assert_eq!(encoded["invariant"], "client_has_parent_agency");
        assert_eq!(encoded["context"]["name"], "Harbor Dental");
    }
}
