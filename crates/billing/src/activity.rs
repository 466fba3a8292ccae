//! Agency activity log
//!
//! Append-only, human-readable audit feed scoped to the agency, used for
//! support and dispute resolution. Rows are written once inside the
//! delivery's transaction and never mutated. Cascades from client
//! sub-accounts cross-reference both the client and its parent agency.

use sqlx::PgPool;
use uuid::Uuid;

use siteloft_shared::{ActivityRecord, ActivityType};

use crate::error::BillingResult;

/// Builder for activity records
pub struct ActivityRecordBuilder {
    agency_tenant_id: Uuid,
    activity_type: ActivityType,
    client_tenant_id: Option<Uuid>,
    client_name: Option<String>,
    amount_cents: Option<i64>,
    provider_event_id: Option<String>,
}

impl ActivityRecordBuilder {
    pub fn new(agency_tenant_id: Uuid, activity_type: ActivityType) -> Self {
        Self {
            agency_tenant_id,
            activity_type,
            client_tenant_id: None,
            client_name: None,
            amount_cents: None,
            provider_event_id: None,
        }
    }

    /// Cross-reference the client sub-account the event applied to
    pub fn client(mut self, client_tenant_id: Uuid, client_name: impl Into<String>) -> Self {
        self.client_tenant_id = Some(client_tenant_id);
        self.client_name = Some(client_name.into());
        self
    }

    pub fn amount_cents(mut self, cents: i64) -> Self {
        self.amount_cents = Some(cents);
        self
    }

    /// Link back to the processor event that produced this record
    pub fn provider_event(mut self, event_id: impl Into<String>) -> Self {
        self.provider_event_id = Some(event_id.into());
        self
    }
}

/// Service for writing and reading the agency activity feed
#[derive(Clone)]
pub struct ActivityLog {
    pool: PgPool,
}

impl ActivityLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a record inside the delivery's transaction
    pub async fn append(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        builder: ActivityRecordBuilder,
    ) -> BillingResult<Uuid> {
        let record_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO agency_activity
                (agency_tenant_id, activity_type, client_tenant_id, client_name,
                 amount_cents, provider_event_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(builder.agency_tenant_id)
        .bind(builder.activity_type)
        .bind(builder.client_tenant_id)
        .bind(&builder.client_name)
        .bind(builder.amount_cents)
        .bind(&builder.provider_event_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(record_id.0)
    }

    /// Most recent records for an agency, newest first
    pub async fn recent_for_agency(
        &self,
        agency_tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<ActivityRecord>> {
        let records: Vec<ActivityRecord> = sqlx::query_as(
            r#"
            SELECT id, agency_tenant_id, activity_type, client_tenant_id, client_name,
                   amount_cents, provider_event_id, created_at
            FROM agency_activity
            WHERE agency_tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(agency_tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Most recent records cross-referencing one client sub-account
    pub async fn recent_for_client(
        &self,
        client_tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<ActivityRecord>> {
        let records: Vec<ActivityRecord> = sqlx::query_as(
            r#"
            SELECT id, agency_tenant_id, activity_type, client_tenant_id, client_name,
                   amount_cents, provider_event_id, created_at
            FROM agency_activity
            WHERE client_tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(client_tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
