//! Stripe client wrapper and configuration.

use std::future::Future;
use std::time::Duration;

use sketchbench_shared::PlanId;

use crate::error::{BillingError, BillingResult};

/// Bounded timeout for outbound provider calls. An elapsed timeout means the
/// remote outcome is unknown, not that the call failed.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Stripe price ids for the paid plans. The free plan has no price.
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub pro: String,
    pub enterprise: String,
}

/// Stripe configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: require_env("STRIPE_SECRET_KEY")?,
            webhook_secret: require_env("STRIPE_WEBHOOK_SECRET")?,
            price_ids: PriceIds {
                pro: require_env("STRIPE_PRO_PRICE_ID")?,
                enterprise: require_env("STRIPE_ENTERPRISE_PRICE_ID")?,
            },
        })
    }

    /// Price id for a paid plan; `None` for the free plan.
    pub fn price_id_for_plan(&self, plan: PlanId) -> Option<&str> {
        match plan {
            PlanId::Free => None,
            PlanId::Pro => Some(&self.price_ids.pro),
            PlanId::Enterprise => Some(&self.price_ids.enterprise),
        }
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} not set", name)))
}

/// Shared Stripe client handed to every outbound service.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: stripe::Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// Run an outbound provider call under [`PROVIDER_TIMEOUT`].
pub(crate) async fn with_provider_timeout<T, F>(fut: F) -> BillingResult<T>
where
    F: Future<Output = Result<T, stripe::StripeError>>,
{
    match tokio::time::timeout(PROVIDER_TIMEOUT, fut).await {
        Ok(result) => result.map_err(BillingError::from),
        Err(_) => Err(BillingError::ProviderTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_plan_has_no_price() {
        let config = StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: "whsec_x".to_string(),
            price_ids: PriceIds {
                pro: "price_pro_monthly".to_string(),
                enterprise: "price_enterprise_monthly".to_string(),
            },
        };

        assert!(config.price_id_for_plan(PlanId::Free).is_none());
        assert_eq!(
            config.price_id_for_plan(PlanId::Pro),
            Some("price_pro_monthly")
        );
        assert_eq!(
            config.price_id_for_plan(PlanId::Enterprise),
            Some("price_enterprise_monthly")
        );
    }
}
