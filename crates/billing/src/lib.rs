// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sketchbench Billing Module
//!
//! Keeps the locally persisted billing state of every account synchronized
//! with Stripe and gates resource creation under per-plan quotas.
//!
//! ## Features
//!
//! - **Plan Catalog**: Compiled-in tiers with quota limits and feature flags
//! - **Subscription Store**: One persisted row per account, upsert semantics
//! - **Subscription Management**: Create, cancel, reactivate subscriptions
//! - **Billing Portal**: Stripe-hosted portal sessions
//! - **Quota Enforcement**: Allow/deny decisions from plan + live usage
//! - **Webhooks**: Stripe event processing with replay protection and
//!   stale-event guards
//! - **Invariants**: Runnable consistency checks over billing state

pub mod client;
pub mod customer;
pub mod error;
pub mod invariants;
pub mod plans;
pub mod portal;
pub mod quota;
pub mod store;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig, PROVIDER_TIMEOUT};

// Customer
pub use customer::CustomerService;

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Plans
pub use plans::{Plan, PlanCatalog, PlanQuotas, UNLIMITED};

// Portal
pub use portal::PortalService;

// Quota
pub use quota::{
    MetricStatus, QuotaAction, QuotaCheck, QuotaMetrics, QuotaService, QuotaStatus,
};

// Store
pub use store::{Subscription, SubscriptionStore, SubscriptionUpsert};

// Subscriptions
pub use subscriptions::{
    CreateSubscriptionOutcome, CurrentPlan, SubscriptionService, FREE_LOCAL_SUBSCRIPTION_ID,
};

// Usage
pub use usage::{Usage, UsageCalculator};

// Webhooks
pub use webhooks::WebhookProcessor;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub customer: CustomerService,
    pub invariants: InvariantChecker,
    pub portal: PortalService,
    pub quota: QuotaService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookProcessor,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        let customer = CustomerService::new(stripe.clone(), pool.clone());
        Self {
            portal: PortalService::new(stripe.clone(), customer.clone()),
            quota: QuotaService::new(pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookProcessor::new(stripe, pool.clone()),
            invariants: InvariantChecker::new(pool),
            customer,
        }
    }
}
