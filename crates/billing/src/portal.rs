//! Stripe billing portal sessions.

use sketchbench_shared::AccountId;
use stripe::{BillingPortalSession, CreateBillingPortalSession, CustomerId};

use crate::client::{with_provider_timeout, StripeClient};
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct PortalService {
    stripe: StripeClient,
    customers: CustomerService,
}

impl PortalService {
    pub fn new(stripe: StripeClient, customers: CustomerService) -> Self {
        Self { stripe, customers }
    }

    /// Create a billing portal session for the account and return its URL.
    /// Fails with a not-found error when the account has never been a
    /// customer.
    pub async fn create_session(
        &self,
        account_id: AccountId,
        return_url: &str,
    ) -> BillingResult<String> {
        let customer_id = self.customers.require_customer_id(account_id).await?;
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidProviderId(e.to_string()))?;

        let mut params = CreateBillingPortalSession::new(customer);
        params.return_url = Some(return_url);

        let session =
            with_provider_timeout(BillingPortalSession::create(self.stripe.inner(), params))
                .await?;

        tracing::info!(account_id = %account_id, "Created billing portal session");

        Ok(session.url)
    }
}
