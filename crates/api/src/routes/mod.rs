//! HTTP route definitions.

pub mod billing;
pub mod health;
pub mod quota;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        // Stripe webhook (public; authenticated by signature)
        .route("/api/subscriptions/webhook", post(billing::stripe_webhook))
        // Account-facing billing operations
        .route("/api/subscriptions/plans", get(billing::list_plans))
        .route(
            "/api/subscriptions/current",
            get(billing::current_subscription),
        )
        .route(
            "/api/subscriptions/create",
            post(billing::create_subscription),
        )
        .route(
            "/api/subscriptions/cancel",
            post(billing::cancel_subscription),
        )
        .route(
            "/api/subscriptions/reactivate",
            post(billing::reactivate_subscription),
        )
        .route(
            "/api/subscriptions/billing-portal",
            post(billing::billing_portal),
        )
        // Quota projection
        .route("/api/quotas/status", get(quota::quota_status))
        .with_state(state)
}
