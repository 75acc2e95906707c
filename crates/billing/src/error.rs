//! Billing error types.

use sketchbench_shared::AccountId;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("no active subscription for account {0}")]
    SubscriptionNotFound(AccountId),

    #[error("no billing customer for account {0}")]
    CustomerNotFound(AccountId),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("webhook payload missing expected {0} object")]
    WebhookPayloadMismatch(&'static str),

    #[error("{reason}")]
    QuotaExceeded {
        reason: String,
        current: i64,
        limit: i64,
    },

    #[error("invalid provider id: {0}")]
    InvalidProviderId(String),

    /// Outbound provider call failed with a definite error.
    #[error("billing provider error: {0}")]
    Provider(#[from] stripe::StripeError),

    /// Outbound provider call timed out. The remote outcome is unknown, so
    /// callers must not mirror the intended change locally.
    #[error("billing provider call timed out; outcome unknown")]
    ProviderTimeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
