#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared types for Sketchbench services.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{AccountId, ParsePlanIdError, ParseStatusError, PlanId, SubscriptionStatus};
