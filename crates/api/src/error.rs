//! API error types and their HTTP mappings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sketchbench_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    /// Recoverable and user-visible; the body carries the numbers for
    /// client display.
    #[error("{reason}")]
    QuotaExceeded {
        reason: String,
        current: i64,
        limit: i64,
    },

    /// Authenticity failure on a webhook delivery. Mapped to a client error
    /// so the provider does not retry a signature-failure loop.
    #[error("invalid webhook signature")]
    InvalidWebhookSignature,

    #[error("billing provider unavailable: {0}")]
    Provider(String),

    /// Transient processing failure. Mapped to a server error so webhook
    /// deliveries are retried.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::PlanNotFound(_)
            | BillingError::AccountNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::CustomerNotFound(_) => ApiError::NotFound(err.to_string()),
            BillingError::WebhookSignatureInvalid => ApiError::InvalidWebhookSignature,
            BillingError::QuotaExceeded {
                reason,
                current,
                limit,
            } => ApiError::QuotaExceeded {
                reason,
                current,
                limit,
            },
            BillingError::InvalidProviderId(_) => ApiError::BadRequest(err.to_string()),
            BillingError::Provider(_) | BillingError::ProviderTimeout => {
                ApiError::Provider(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "AUTH_REQUIRED"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::QuotaExceeded { .. } => (StatusCode::FORBIDDEN, "QUOTA_EXCEEDED"),
            ApiError::InvalidWebhookSignature => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE"),
            ApiError::Provider(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(code = code, error = %self, "Request failed");
        }

        let error = match &self {
            ApiError::QuotaExceeded {
                reason,
                current,
                limit,
            } => serde_json::json!({
                "code": code,
                "message": reason,
                "current": current,
                "limit": limit,
            }),
            other => serde_json::json!({
                "code": code,
                "message": other.to_string(),
            }),
        };

        (
            status,
            Json(serde_json::json!({ "success": false, "error": error })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::Unauthorized.status_and_code().0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::NotFound("x".into()).status_and_code().0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::InvalidWebhookSignature.status_and_code().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Provider("down".into()).status_and_code().0,
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn quota_exceeded_is_recoverable_client_error() {
        let err = ApiError::QuotaExceeded {
            reason: "Project limit reached (3 projects)".into(),
            current: 3,
            limit: 3,
        };
        let (status, code) = err.status_and_code();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(code, "QUOTA_EXCEEDED");
    }

    #[test]
    fn billing_not_found_maps_to_404() {
        let err: ApiError =
            BillingError::PlanNotFound("premium".into()).into();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn provider_timeout_maps_to_bad_gateway() {
        let err: ApiError = BillingError::ProviderTimeout.into();
        assert!(matches!(err, ApiError::Provider(_)));
    }
}
