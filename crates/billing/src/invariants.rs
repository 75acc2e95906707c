//! Billing invariant checks.
//!
//! Runnable read-only consistency checks over the subscription store. They
//! can be run after webhook replay or on demand; the API server runs them
//! once at startup and logs violations.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single consistency violation with enough context to debug it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Accounts affected
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlement decisions may be wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of one full check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ViolationRow {
    account_id: Uuid,
    detail: String,
}

/// Service for running billing invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_free_rows_detached().await?);
        violations.extend(self.check_paid_rows_attached().await?);
        violations.extend(self.check_paid_rows_have_customer().await?);
        violations.extend(self.check_period_ordering().await?);

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: Self::available_checks().len(),
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// A row on the free plan must not keep an external subscription id;
    /// the id is cleared exactly when the account reverts to free.
    async fn check_free_rows_detached(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ViolationRow> = sqlx::query_as(
            r#"
            SELECT account_id, stripe_subscription_id AS detail
            FROM subscriptions
            WHERE plan_id = 'free' AND stripe_subscription_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_rows_detached".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Free-plan row still references external subscription '{}'",
                    row.detail
                ),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A paid row in good standing should reference a live external
    /// subscription; without one, webhook events cannot reach it.
    async fn check_paid_rows_attached(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ViolationRow> = sqlx::query_as(
            r#"
            SELECT account_id, plan_id AS detail
            FROM subscriptions
            WHERE plan_id != 'free'
              AND status IN ('active', 'trialing')
              AND stripe_subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_rows_attached".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Paid plan '{}' in good standing has no external subscription id",
                    row.detail
                ),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Accounts on a paid plan must have a Stripe customer.
    async fn check_paid_rows_have_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ViolationRow> = sqlx::query_as(
            r#"
            SELECT s.account_id, s.plan_id AS detail
            FROM subscriptions s
            JOIN accounts a ON a.id = s.account_id
            WHERE s.plan_id != 'free' AND a.stripe_customer_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_rows_have_customer".to_string(),
                account_ids: vec![row.account_id],
                description: format!("Account on plan '{}' has no Stripe customer", row.detail),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Billing periods must be ordered.
    async fn check_period_ordering(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ViolationRow> = sqlx::query_as(
            r#"
            SELECT account_id, status AS detail
            FROM subscriptions
            WHERE current_period_start > current_period_end
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "period_ordering".to_string(),
                account_ids: vec![row.account_id],
                description: "Subscription period starts after it ends".to_string(),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "free_rows_detached",
            "paid_rows_attached",
            "paid_rows_have_customer",
            "period_ordering",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn available_checks_listed() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"free_rows_detached"));
        assert!(checks.contains(&"period_ordering"));
    }
}
