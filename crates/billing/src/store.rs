//! Subscription store.
//!
//! One row per account, keyed on `account_id`. Every mutation is a
//! single-row atomic update; there is no application-level locking here.
//! Webhook-driven transitions take the provider event timestamp and apply
//! with a `updated_at <= event_ts` predicate so a stale event can never
//! overwrite the effect of a newer one.

use sketchbench_shared::{AccountId, PlanId, SubscriptionStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Local record of an account's billing relationship.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: AccountId,
    pub plan_id: PlanId,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Subscription {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let plan_id: String = row.try_get("plan_id")?;
        let status: String = row.try_get("status")?;

        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            plan_id: plan_id.parse().map_err(|e| sqlx::Error::ColumnDecode {
                index: "plan_id".to_string(),
                source: Box::new(e),
            })?,
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            status: status.parse().map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: Box::new(e),
            })?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Parameters for [`SubscriptionStore::upsert`].
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub account_id: AccountId,
    pub plan_id: PlanId,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
}

/// Persistence for subscription rows.
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the account's row, or update it if one exists. `COALESCE`
    /// preserves a known external id when the incoming value is absent; a
    /// known id is never overwritten with null here.
    pub async fn upsert(&self, params: SubscriptionUpsert) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (account_id, plan_id, stripe_customer_id, stripe_subscription_id, status,
                 current_period_start, current_period_end, cancel_at_period_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
            ON CONFLICT (account_id) DO UPDATE SET
                plan_id = $2,
                stripe_customer_id = COALESCE($3, subscriptions.stripe_customer_id),
                stripe_subscription_id = COALESCE($4, subscriptions.stripe_subscription_id),
                status = $5,
                current_period_start = $6,
                current_period_end = $7,
                cancel_at_period_end = FALSE,
                updated_at = NOW()
            "#,
        )
        .bind(params.account_id)
        .bind(params.plan_id.as_str())
        .bind(&params.stripe_customer_id)
        .bind(&params.stripe_subscription_id)
        .bind(params.status.as_str())
        .bind(params.current_period_start)
        .bind(params.current_period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            account_id = %params.account_id,
            plan_id = %params.plan_id,
            status = %params.status,
            "Subscription saved"
        );

        Ok(())
    }

    /// `None` is a valid result: callers map it to the implicit free plan.
    pub async fn get_by_account(
        &self,
        account_id: AccountId,
    ) -> BillingResult<Option<Subscription>> {
        self.get_by_account_with(&self.pool, account_id).await
    }

    /// Executor-generic variant so quota enforcement can read inside the
    /// caller's transaction.
    pub async fn get_by_account_with<'e, E>(
        &self,
        executor: E,
        account_id: AccountId,
    ) -> BillingResult<Option<Subscription>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let row = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(executor)
        .await?;

        Ok(row)
    }

    pub async fn get_by_stripe_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Successful payment: status becomes `active`. The period end may only
    /// move forward; `GREATEST` keeps it monotonic even under replay. Returns
    /// the number of rows updated — zero means the event was stale or the
    /// external id is no longer attached to any row.
    pub async fn mark_active(
        &self,
        stripe_subscription_id: &str,
        period: Option<(OffsetDateTime, OffsetDateTime)>,
        event_ts: OffsetDateTime,
    ) -> BillingResult<u64> {
        let (period_start, period_end) = match period {
            Some((start, end)) => (Some(start), Some(end)),
            None => (None, None),
        };

        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active',
                current_period_start = COALESCE($2, current_period_start),
                current_period_end = GREATEST(current_period_end, COALESCE($3, current_period_end)),
                updated_at = NOW()
            WHERE stripe_subscription_id = $1 AND updated_at <= $4
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(period_start)
        .bind(period_end)
        .bind(event_ts)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Absolute status overwrite, guarded against stale events.
    pub async fn update_status(
        &self,
        stripe_subscription_id: &str,
        status: SubscriptionStatus,
        event_ts: OffsetDateTime,
    ) -> BillingResult<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1 AND updated_at <= $3
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(status.as_str())
        .bind(event_ts)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    pub async fn set_cancel_at_period_end(
        &self,
        account_id: AccountId,
        cancel: bool,
    ) -> BillingResult<u64> {
        let rows = sqlx::query(
            "UPDATE subscriptions SET cancel_at_period_end = $2, updated_at = NOW() WHERE account_id = $1",
        )
        .bind(account_id)
        .bind(cancel)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Terminal transition for an external subscription id: back to the free
    /// plan, active, with the external id detached. Later events referencing
    /// the same id match zero rows and are logged no-ops.
    pub async fn downgrade_to_free(&self, stripe_subscription_id: &str) -> BillingResult<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_id = 'free',
                status = 'active',
                stripe_subscription_id = NULL,
                cancel_at_period_end = FALSE,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("../../migrations").run(&pool).await.unwrap();
        pool
    }

    async fn seed_account(pool: &PgPool) -> AccountId {
        let account_id = AccountId::new();
        sqlx::query("INSERT INTO accounts (id, email, name) VALUES ($1, $2, $3)")
            .bind(account_id)
            .bind(format!("{}@example.com", account_id))
            .bind("Store Test")
            .execute(pool)
            .await
            .unwrap();
        account_id
    }

    #[tokio::test]
    #[ignore = "requires a migrated Postgres database via DATABASE_URL"]
    async fn lookup_by_external_id_and_downgrade() {
        let pool = test_pool().await;
        let store = SubscriptionStore::new(pool.clone());
        let account_id = seed_account(&pool).await;

        let external_id = format!("sub_{}", Uuid::new_v4().simple());
        let now = OffsetDateTime::now_utc();

        store
            .upsert(SubscriptionUpsert {
                account_id,
                plan_id: PlanId::Pro,
                stripe_customer_id: Some("cus_store_test".to_string()),
                stripe_subscription_id: Some(external_id.clone()),
                status: SubscriptionStatus::Active,
                current_period_start: now,
                current_period_end: now + time::Duration::days(30),
            })
            .await
            .unwrap();

        let row = store
            .get_by_stripe_subscription(&external_id)
            .await
            .unwrap()
            .expect("row must resolve by external id");
        assert_eq!(row.account_id, account_id);
        assert_eq!(row.plan_id, PlanId::Pro);
        assert_eq!(row.status, SubscriptionStatus::Active);

        // Upserting with absent external ids must not clear the known ones
        store
            .upsert(SubscriptionUpsert {
                account_id,
                plan_id: PlanId::Pro,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                status: SubscriptionStatus::PastDue,
                current_period_start: now,
                current_period_end: now + time::Duration::days(30),
            })
            .await
            .unwrap();

        let row = store
            .get_by_stripe_subscription(&external_id)
            .await
            .unwrap()
            .expect("external id must survive a null upsert");
        assert_eq!(row.status, SubscriptionStatus::PastDue);
        assert_eq!(row.stripe_customer_id.as_deref(), Some("cus_store_test"));

        // Terminal downgrade detaches the external id
        let rows = store.downgrade_to_free(&external_id).await.unwrap();
        assert_eq!(rows, 1);
        assert!(store
            .get_by_stripe_subscription(&external_id)
            .await
            .unwrap()
            .is_none());

        let row = store.get_by_account(account_id).await.unwrap().unwrap();
        assert_eq!(row.plan_id, PlanId::Free);
        assert_eq!(row.status, SubscriptionStatus::Active);
        assert!(!row.cancel_at_period_end);
    }
}
