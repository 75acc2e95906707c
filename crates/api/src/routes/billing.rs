//! Billing routes for Stripe integration.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use sketchbench_billing::{Plan, PlanCatalog};
use sketchbench_shared::PlanId;

use crate::auth::AuthAccount;
use crate::error::ApiError;
use crate::state::AppState;

/// Request to create a subscription
#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_id: String,
    /// Payment method collected on the client, if any
    pub payment_method_id: Option<String>,
}

/// Response from creating a subscription
#[derive(Debug, Serialize)]
pub struct CreateSubscriptionResponse {
    pub subscription_id: String,
    /// Present when the initial payment needs client confirmation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Subscription info for the current-plan response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub status: String,
    pub current_period_end: String,
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Serialize)]
pub struct CurrentPlanResponse {
    pub plan: Plan,
    pub subscription: Option<SubscriptionInfo>,
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

fn envelope<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true, "data": data }))
}

fn message(text: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true, "message": text }))
}

/// List the plan catalog
pub async fn list_plans(_auth: AuthAccount) -> Json<serde_json::Value> {
    envelope(serde_json::json!({ "plans": PlanCatalog::all() }))
}

/// Current plan and subscription for the calling account
pub async fn current_subscription(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> Result<Json<serde_json::Value>, ApiError> {
    let current = state
        .billing
        .subscriptions
        .current_plan(auth.account_id)
        .await?;

    let subscription = current.subscription.map(|sub| SubscriptionInfo {
        status: sub.status.to_string(),
        current_period_end: sub.current_period_end.to_string(),
        cancel_at_period_end: sub.cancel_at_period_end,
    });

    Ok(envelope(CurrentPlanResponse {
        plan: current.plan,
        subscription,
    }))
}

/// Create a subscription on the requested plan
pub async fn create_subscription(
    State(state): State<AppState>,
    auth: AuthAccount,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let plan_id: PlanId = req
        .plan_id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("plan not found: {}", req.plan_id)))?;

    let outcome = state
        .billing
        .subscriptions
        .create_subscription(auth.account_id, plan_id, req.payment_method_id.as_deref())
        .await?;

    Ok(envelope(CreateSubscriptionResponse {
        subscription_id: outcome.subscription_id,
        client_secret: outcome.client_secret,
    }))
}

/// Schedule cancellation at the end of the billing period
pub async fn cancel_subscription(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.billing.subscriptions.cancel(auth.account_id).await?;

    Ok(message(
        "Subscription will be canceled at the end of the billing period",
    ))
}

/// Undo a scheduled cancellation
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .billing
        .subscriptions
        .reactivate(auth.account_id)
        .await?;

    Ok(message("Subscription reactivated successfully"))
}

/// Create a billing portal session
pub async fn billing_portal(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> Result<Json<serde_json::Value>, ApiError> {
    let return_url = format!("{}/billing", state.config.frontend_url);
    let url = state
        .billing
        .portal
        .create_session(auth.account_id, &return_url)
        .await?;

    Ok(envelope(PortalResponse { url }))
}

/// Handle Stripe webhook events
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    // Authenticity failure is a client error: the provider must not retry
    // a signature-failure loop.
    let event = state.billing.webhooks.verify_event(&body, signature)?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    // Processing failures map to a server error so the delivery is retried.
    state.billing.webhooks.handle_event(event).await?;

    Ok(StatusCode::OK)
}
