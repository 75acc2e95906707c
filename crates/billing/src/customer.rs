//! Stripe customer management.

use sketchbench_shared::AccountId;
use sqlx::PgPool;
use stripe::{AttachPaymentMethod, CreateCustomer, Customer, CustomerId, PaymentMethod, PaymentMethodId};

use crate::client::{with_provider_timeout, StripeClient};
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Get the account's Stripe customer id, creating the customer on first
    /// use and persisting the id on the account row.
    pub async fn get_or_create(&self, account_id: AccountId) -> BillingResult<String> {
        let account: Option<(Option<String>, String, String)> =
            sqlx::query_as("SELECT stripe_customer_id, email, name FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        let (existing, email, name) =
            account.ok_or(BillingError::AccountNotFound(account_id))?;

        if let Some(customer_id) = existing {
            return Ok(customer_id);
        }

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("account_id".to_string(), account_id.to_string());

        let params = CreateCustomer {
            email: Some(&email),
            name: Some(&name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer =
            with_provider_timeout(Customer::create(self.stripe.inner(), params)).await?;

        sqlx::query(
            "UPDATE accounts SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(customer.id.as_str())
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            account_id = %account_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    /// Attach a payment method collected on the client to the customer.
    pub async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidProviderId(e.to_string()))?;
        let payment_method = payment_method_id
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::InvalidProviderId(e.to_string()))?;

        with_provider_timeout(PaymentMethod::attach(
            self.stripe.inner(),
            &payment_method,
            AttachPaymentMethod { customer },
        ))
        .await?;

        tracing::info!(
            customer_id = %customer_id,
            "Attached payment method to customer"
        );

        Ok(())
    }

    /// Customer id for an account that already has one.
    pub async fn require_customer_id(&self, account_id: AccountId) -> BillingResult<String> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(BillingError::AccountNotFound(account_id))?
            .0
            .ok_or(BillingError::CustomerNotFound(account_id))
    }
}
