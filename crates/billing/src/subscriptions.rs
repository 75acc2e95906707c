//! Subscription management.
//!
//! Outbound Stripe operations and their local mirror. Every successful
//! provider call that changes billing state is written to the subscription
//! store in the same logical operation; a timed-out call is surfaced as
//! unknown-outcome and nothing is mirrored.

use sketchbench_shared::{AccountId, PlanId, SubscriptionStatus};
use sqlx::PgPool;
use stripe::{
    CreateSubscription, CreateSubscriptionItems, Subscription as StripeSubscription,
    SubscriptionId, SubscriptionPaymentBehavior, UpdateSubscription,
};
use time::{Duration, OffsetDateTime};

use crate::client::{with_provider_timeout, StripeClient};
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::plans::{Plan, PlanCatalog};
use crate::store::{Subscription, SubscriptionStore, SubscriptionUpsert};
use crate::webhooks::map_subscription_status;

/// Sentinel subscription id for free-plan signups, which never touch the
/// provider.
pub const FREE_LOCAL_SUBSCRIPTION_ID: &str = "free-local";

/// Result of creating a subscription. `client_secret` is present only when
/// the initial payment needs further confirmation on the client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CreateSubscriptionOutcome {
    pub subscription_id: String,
    pub client_secret: Option<String>,
}

/// An account's resolved plan plus its subscription row, if any.
#[derive(Debug, Clone)]
pub struct CurrentPlan {
    pub plan: Plan,
    pub subscription: Option<Subscription>,
}

pub struct SubscriptionService {
    stripe: StripeClient,
    customers: CustomerService,
    store: SubscriptionStore,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let customers = CustomerService::new(stripe.clone(), pool.clone());
        let store = SubscriptionStore::new(pool);
        Self {
            stripe,
            customers,
            store,
        }
    }

    /// Resolve the account's plan. Accounts without a subscription row are
    /// on the free plan; this never fails for a known account.
    pub async fn current_plan(&self, account_id: AccountId) -> BillingResult<CurrentPlan> {
        let subscription = self.store.get_by_account(account_id).await?;
        let plan = PlanCatalog::resolve(subscription.as_ref().map(|s| s.plan_id));
        Ok(CurrentPlan { plan, subscription })
    }

    /// Create a subscription for the account on `plan_id`.
    ///
    /// Free-plan signups upsert a local row and return without a provider
    /// call. Paid plans create (or reuse) the Stripe customer, optionally
    /// attach a payment method, create the provider subscription, and mirror
    /// it locally.
    pub async fn create_subscription(
        &self,
        account_id: AccountId,
        plan_id: PlanId,
        payment_method_id: Option<&str>,
    ) -> BillingResult<CreateSubscriptionOutcome> {
        let customer_id = self.customers.get_or_create(account_id).await?;

        if let Some(payment_method) = payment_method_id {
            self.customers
                .attach_payment_method(&customer_id, payment_method)
                .await?;
        }

        if plan_id == PlanId::Free {
            let now = OffsetDateTime::now_utc();
            self.store
                .upsert(SubscriptionUpsert {
                    account_id,
                    plan_id: PlanId::Free,
                    stripe_customer_id: Some(customer_id),
                    stripe_subscription_id: None,
                    status: SubscriptionStatus::Active,
                    current_period_start: now,
                    current_period_end: now + Duration::days(30),
                })
                .await?;

            return Ok(CreateSubscriptionOutcome {
                subscription_id: FREE_LOCAL_SUBSCRIPTION_ID.to_string(),
                client_secret: None,
            });
        }

        let price_id = self
            .stripe
            .config()
            .price_id_for_plan(plan_id)
            .ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))?
            .to_string();

        let customer = customer_id
            .parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::InvalidProviderId(e.to_string()))?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("account_id".to_string(), account_id.to_string());
        metadata.insert("plan_id".to_string(), plan_id.to_string());

        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        // Defer the initial payment to the client: the subscription starts
        // incomplete and the caller confirms with the returned secret.
        params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        params.default_payment_method = payment_method_id;
        params.expand = &["latest_invoice.payment_intent"];

        let subscription =
            with_provider_timeout(StripeSubscription::create(self.stripe.inner(), params))
                .await?;

        self.store
            .upsert(SubscriptionUpsert {
                account_id,
                plan_id,
                stripe_customer_id: Some(customer_id),
                stripe_subscription_id: Some(subscription.id.to_string()),
                status: map_subscription_status(subscription.status),
                current_period_start: timestamp(subscription.current_period_start),
                current_period_end: timestamp(subscription.current_period_end),
            })
            .await?;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %subscription.id,
            plan_id = %plan_id,
            "Created subscription"
        );

        Ok(CreateSubscriptionOutcome {
            subscription_id: subscription.id.to_string(),
            client_secret: extract_client_secret(&subscription),
        })
    }

    /// Schedule cancellation at period end. Idempotent: cancelling an
    /// already-cancelling subscription is a no-op success.
    pub async fn cancel(&self, account_id: AccountId) -> BillingResult<()> {
        let (subscription, sub_id) = self.require_provider_subscription(account_id).await?;

        if subscription.cancel_at_period_end {
            tracing::info!(
                account_id = %account_id,
                "Subscription already scheduled for cancellation"
            );
            return Ok(());
        }

        self.set_cancel_flag(account_id, &sub_id, true).await?;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %sub_id,
            "Subscription will cancel at period end"
        );

        Ok(())
    }

    /// Undo a scheduled cancellation. Idempotent like [`Self::cancel`].
    pub async fn reactivate(&self, account_id: AccountId) -> BillingResult<()> {
        let (subscription, sub_id) = self.require_provider_subscription(account_id).await?;

        if !subscription.cancel_at_period_end {
            tracing::info!(
                account_id = %account_id,
                "Subscription is not scheduled for cancellation"
            );
            return Ok(());
        }

        self.set_cancel_flag(account_id, &sub_id, false).await?;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %sub_id,
            "Subscription reactivated"
        );

        Ok(())
    }

    async fn require_provider_subscription(
        &self,
        account_id: AccountId,
    ) -> BillingResult<(Subscription, String)> {
        let subscription = self
            .store
            .get_by_account(account_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(account_id))?;

        let sub_id = subscription
            .stripe_subscription_id
            .clone()
            .ok_or(BillingError::SubscriptionNotFound(account_id))?;

        Ok((subscription, sub_id))
    }

    /// Flip `cancel_at_period_end` at the provider, then mirror locally.
    /// Order matters: the local write happens only after the provider
    /// confirms the change.
    async fn set_cancel_flag(
        &self,
        account_id: AccountId,
        stripe_subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<()> {
        let sub_id = stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidProviderId(e.to_string()))?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };

        with_provider_timeout(StripeSubscription::update(
            self.stripe.inner(),
            &sub_id,
            params,
        ))
        .await?;

        self.store
            .set_cancel_at_period_end(account_id, cancel)
            .await?;

        Ok(())
    }
}

fn timestamp(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Client confirmation secret, present when the expanded latest invoice
/// carries a payment intent that still needs the client.
fn extract_client_secret(subscription: &StripeSubscription) -> Option<String> {
    let invoice = match subscription.latest_invoice.as_ref()? {
        stripe::Expandable::Object(invoice) => invoice,
        stripe::Expandable::Id(_) => return None,
    };
    let intent = match invoice.payment_intent.as_ref()? {
        stripe::Expandable::Object(intent) => intent,
        stripe::Expandable::Id(_) => return None,
    };
    intent.client_secret.clone()
}
