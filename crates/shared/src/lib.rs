// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! SiteLoft Shared Types and Utilities
//!
//! This crate contains database models and utilities shared across the
//! SiteLoft platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
