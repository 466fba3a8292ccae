//! API route definitions

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub mod admin;
pub mod billing;
pub mod health;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // Health endpoints stay at the root for load balancer probes
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // The webhook authenticates itself through the Stripe signature, not
    // through a session.
    let webhook_routes = Router::new().route("/billing/webhook", post(billing::stripe_webhook));

    // Operator tooling, guarded by the internal bearer token
    let operator_routes = Router::new()
        .route(
            "/billing/tenants/:tenant_id/activity",
            get(billing::tenant_activity),
        )
        .route("/admin/billing/anomalies", get(admin::billing_anomalies))
        .route("/admin/billing/invariants", get(admin::billing_invariants))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::require_internal_token,
        ));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", webhook_routes.merge(operator_routes))
        .with_state(state)
}
