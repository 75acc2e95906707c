//! Quota status route.

use axum::extract::State;
use axum::Json;

use crate::auth::AuthAccount;
use crate::error::ApiError;
use crate::state::AppState;

/// Read-only quota projection for the calling account. Display only; the
/// resource-creation path enforces separately.
pub async fn quota_status(
    State(state): State<AppState>,
    auth: AuthAccount,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.billing.quota.status(auth.account_id).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "data": status,
    })))
}
