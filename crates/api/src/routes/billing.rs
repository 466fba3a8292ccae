//! Billing webhook and activity feed endpoints

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use siteloft_shared::TenantKind;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /api/v1/billing/webhook
///
/// Stripe delivers every subscription and payment event here. The body is
/// extracted as the raw string so the signature check runs over exactly the
/// bytes Stripe signed; parsing happens only after verification passes.
///
/// Stripe treats any 2xx as delivered, so intentional no-ops (duplicates,
/// events we cannot route) are acknowledged the same way as applied events.
/// Only transient store failures surface as 5xx, which makes Stripe retry.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing stripe-signature header".to_string()))?;

    let event = state.billing.webhooks.verify_event(body.as_bytes(), signature)?;
    let outcome = state.billing.webhooks.handle_event(&event).await?;

    tracing::debug!(event_id = %event.id, %outcome, "Webhook delivery acknowledged");
    Ok(Json(json!({ "received": true })))
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
}

/// GET /api/v1/billing/tenants/:tenant_id/activity
///
/// Billing activity feed for support and dispute resolution, served to the
/// internal tooling behind the operator token. An agency id returns the
/// agency's own feed; a client id returns the records that cross-reference
/// that client on its parent agency's feed.
pub async fn tenant_activity(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);

    let tenant = state
        .billing
        .tenants
        .find(tenant_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let activity = match tenant.kind {
        TenantKind::Agency => {
            state
                .billing
                .activity
                .recent_for_agency(tenant.id, limit)
                .await?
        }
        TenantKind::AgencyClient => {
            state
                .billing
                .activity
                .recent_for_client(tenant.id, limit)
                .await?
        }
    };

    Ok(Json(json!({
        "tenant_id": tenant_id,
        "count": activity.len(),
        "activity": activity,
    })))
}
