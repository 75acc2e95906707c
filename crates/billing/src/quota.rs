//! Quota enforcement.
//!
//! Combines the plan catalog, the subscription store and the usage
//! calculator into an allow/deny decision. A limit of `-1` means unlimited;
//! otherwise the comparison is strict: usage equal to the limit is already
//! at capacity and blocks the next creation.

use serde::Serialize;
use sketchbench_shared::AccountId;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{BillingError, BillingResult};
use crate::plans::{Plan, PlanCatalog, UNLIMITED};
use crate::store::SubscriptionStore;
use crate::usage::{Usage, UsageCalculator};

/// Account actions gated by quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaAction {
    CreateProject,
    UploadAsset,
}

impl QuotaAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaAction::CreateProject => "create_project",
            QuotaAction::UploadAsset => "upload_asset",
        }
    }
}

impl std::fmt::Display for QuotaAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a single quota check.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub current: i64,
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-metric view for client display.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricStatus {
    pub used: i64,
    pub limit: i64,
    pub available: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaMetrics {
    pub projects: MetricStatus,
    pub storage: MetricStatus,
}

/// Read-only projection of an account's quota position. Not a gate.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub plan: String,
    pub quotas: QuotaMetrics,
    pub features: Vec<String>,
}

#[derive(Clone)]
pub struct QuotaService {
    store: SubscriptionStore,
    usage: UsageCalculator,
}

impl QuotaService {
    pub fn new(pool: PgPool) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        let usage = UsageCalculator::new(pool);
        Self { store, usage }
    }

    /// Resolve plan and usage, then decide whether `action` is allowed.
    pub async fn check(
        &self,
        account_id: AccountId,
        action: QuotaAction,
    ) -> BillingResult<QuotaCheck> {
        let subscription = self.store.get_by_account(account_id).await?;
        let plan = PlanCatalog::resolve(subscription.as_ref().map(|s| s.plan_id));
        let usage = self.usage.compute(account_id).await?;

        Ok(decide(&plan, &usage, action))
    }

    /// `check` that fails with a quota-exceeded error when the action is not
    /// allowed. The error carries the human-readable reason plus the numbers
    /// for client display; it is recoverable, never fatal.
    pub async fn enforce(&self, account_id: AccountId, action: QuotaAction) -> BillingResult<()> {
        let check = self.check(account_id, action).await?;
        if !check.allowed {
            return Err(BillingError::QuotaExceeded {
                reason: check
                    .reason
                    .unwrap_or_else(|| "Quota exceeded".to_string()),
                current: check.current,
                limit: check.limit,
            });
        }
        Ok(())
    }

    /// Take the account's advisory lock inside `tx`. Held until the
    /// transaction commits or rolls back, so a resource-creation path that
    /// calls this, then [`Self::enforce_in_tx`], then inserts — all in the
    /// same transaction — closes the check-then-act window.
    pub async fn lock_account(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: AccountId,
    ) -> BillingResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(account_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Transaction-scoped variant of [`Self::check`].
    pub async fn check_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: AccountId,
        action: QuotaAction,
    ) -> BillingResult<QuotaCheck> {
        let subscription = self
            .store
            .get_by_account_with(&mut **tx, account_id)
            .await?;
        let plan = PlanCatalog::resolve(subscription.as_ref().map(|s| s.plan_id));
        let usage = self.usage.compute_with(&mut **tx, account_id).await?;

        Ok(decide(&plan, &usage, action))
    }

    /// Transaction-scoped variant of [`Self::enforce`]. Takes the advisory
    /// lock first.
    pub async fn enforce_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: AccountId,
        action: QuotaAction,
    ) -> BillingResult<()> {
        self.lock_account(tx, account_id).await?;
        let check = self.check_in_tx(tx, account_id, action).await?;
        if !check.allowed {
            return Err(BillingError::QuotaExceeded {
                reason: check
                    .reason
                    .unwrap_or_else(|| "Quota exceeded".to_string()),
                current: check.current,
                limit: check.limit,
            });
        }
        Ok(())
    }

    /// Quota position across every metric, for client display.
    pub async fn status(&self, account_id: AccountId) -> BillingResult<QuotaStatus> {
        let subscription = self.store.get_by_account(account_id).await?;
        let plan = PlanCatalog::resolve(subscription.as_ref().map(|s| s.plan_id));
        let usage = self.usage.compute(account_id).await?;

        let storage_used = usage.storage_mb.round() as i64;

        Ok(QuotaStatus {
            plan: plan.name.to_string(),
            quotas: QuotaMetrics {
                projects: MetricStatus {
                    used: usage.projects,
                    limit: plan.quotas.max_projects,
                    available: available(plan.quotas.max_projects, usage.projects),
                },
                storage: MetricStatus {
                    used: storage_used,
                    limit: plan.quotas.max_storage_mb,
                    available: available(plan.quotas.max_storage_mb, storage_used),
                },
            },
            features: plan.quotas.features.iter().map(|f| f.to_string()).collect(),
        })
    }
}

/// Pure decision: which metric the action consumes, and whether one more
/// unit fits under the plan's limit.
pub(crate) fn decide(plan: &Plan, usage: &Usage, action: QuotaAction) -> QuotaCheck {
    match action {
        QuotaAction::CreateProject => {
            decide_projects(usage.projects, plan.quotas.max_projects)
        }
        QuotaAction::UploadAsset => decide_storage(usage.storage_mb, plan.quotas.max_storage_mb),
    }
}

pub(crate) fn decide_projects(used: i64, limit: i64) -> QuotaCheck {
    let allowed = limit == UNLIMITED || used < limit;
    QuotaCheck {
        allowed,
        current: used,
        limit,
        reason: (!allowed).then(|| format!("Project limit reached ({} projects)", limit)),
    }
}

pub(crate) fn decide_storage(used_mb: f64, limit: i64) -> QuotaCheck {
    // The comparison uses the exact value; the reported number is rounded.
    let allowed = limit == UNLIMITED || used_mb < limit as f64;
    QuotaCheck {
        allowed,
        current: used_mb.round() as i64,
        limit,
        reason: (!allowed).then(|| format!("Storage limit reached ({} MB)", limit)),
    }
}

pub(crate) fn available(limit: i64, used: i64) -> i64 {
    if limit == UNLIMITED {
        UNLIMITED
    } else {
        (limit - used).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_inequality_at_the_boundary() {
        // Usage equal to the limit is at capacity: the next creation blocks.
        assert!(!decide_projects(3, 3).allowed);
        assert!(decide_projects(2, 3).allowed);
        assert!(!decide_projects(4, 3).allowed);
    }

    #[test]
    fn unlimited_sentinel_always_allows() {
        for used in [0, 1, 50, 10_000] {
            assert!(decide_projects(used, UNLIMITED).allowed);
        }
        assert!(decide_storage(1e9, UNLIMITED).allowed);
    }

    #[test]
    fn blocked_check_carries_numbers_and_reason() {
        let check = decide_projects(50, 50);
        assert!(!check.allowed);
        assert_eq!(check.current, 50);
        assert_eq!(check.limit, 50);
        assert_eq!(
            check.reason.as_deref(),
            Some("Project limit reached (50 projects)")
        );
    }

    #[test]
    fn storage_compares_exact_but_reports_rounded() {
        // 99.6 MB is still under a 100 MB limit even though it rounds to 100.
        let check = decide_storage(99.6, 100);
        assert!(check.allowed);
        assert_eq!(check.current, 100);

        assert!(!decide_storage(100.0, 100).allowed);
    }

    #[test]
    fn available_never_goes_negative() {
        // Downgrade can leave usage above the new limit; display clamps at 0.
        assert_eq!(available(3, 50), 0);
        assert_eq!(available(3, 3), 0);
        assert_eq!(available(3, 1), 2);
        assert_eq!(available(UNLIMITED, 123), UNLIMITED);
    }
}
