//! Internal operator endpoints
//!
//! Everything under /api/v1/admin is for on-call tooling, not customers.
//! Access is gated by a static bearer token distributed out of band; the
//! comparison is constant time so the token cannot be probed byte by byte.

use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Middleware guarding the admin router
pub async fn require_internal_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let expected = state.config.internal_api_token.as_bytes();
    if !bool::from(expected.ct_eq(provided.as_bytes())) {
        tracing::warn!(path = %request.uri().path(), "Rejected internal request with bad token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
pub struct AnomalyQuery {
    pub limit: Option<i64>,
}

/// GET /api/v1/admin/billing/anomalies
///
/// Recent deliveries that were acknowledged without being applied. A spike
/// here usually means checkout stopped attaching tenant metadata, or events
/// are arriving for tenants that were deleted.
pub async fn billing_anomalies(
    State(state): State<AppState>,
    Query(query): Query<AnomalyQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let anomalies = state.billing.guard.recent_anomalies(limit).await?;

    Ok(Json(json!({
        "count": anomalies.len(),
        "anomalies": anomalies,
    })))
}

/// GET /api/v1/admin/billing/invariants
///
/// Run every billing consistency check and report violations. The worker
/// runs the same sweep daily; this endpoint exists for on-demand checks
/// during incident response.
pub async fn billing_invariants(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let summary = state.billing.invariants.run_all_checks().await?;

    if !summary.healthy {
        tracing::warn!(
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "On-demand invariant sweep found violations"
        );
    }

    Ok(Json(summary))
}
