//! SiteLoft Billing API Library
//!
//! Axum HTTP surface over the billing crate: the Stripe webhook receiver,
//! the agency activity feed, and the internal operator endpoints.

// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
