//! Usage calculator.
//!
//! Live aggregation over the account's non-archived projects. Results are
//! never cached: a quota decision must see the latest committed writes.

use serde::Serialize;
use sketchbench_shared::AccountId;
use sqlx::PgPool;

use crate::error::BillingResult;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Point-in-time consumption snapshot. Derived, not stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Usage {
    pub projects: i64,
    pub storage_mb: f64,
}

#[derive(Clone)]
pub struct UsageCalculator {
    pool: PgPool,
}

impl UsageCalculator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn compute(&self, account_id: AccountId) -> BillingResult<Usage> {
        self.compute_with(&self.pool, account_id).await
    }

    /// Executor-generic variant so quota enforcement can aggregate inside
    /// the caller's transaction. Storage is the encoded size of project
    /// payloads in megabytes.
    pub async fn compute_with<'e, E>(
        &self,
        executor: E,
        account_id: AccountId,
    ) -> BillingResult<Usage>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let (projects, storage_bytes): (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), SUM(octet_length(data::text))
            FROM projects
            WHERE account_id = $1 AND is_archived = FALSE
            "#,
        )
        .bind(account_id)
        .fetch_one(executor)
        .await?;

        Ok(Usage {
            projects,
            storage_mb: bytes_to_mb(storage_bytes.unwrap_or(0)),
        })
    }
}

fn bytes_to_mb(bytes: i64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_converts_bytes_to_mb() {
        assert_eq!(bytes_to_mb(0), 0.0);
        assert_eq!(bytes_to_mb(3 * 1024 * 1024), 3.0);
        assert_eq!(bytes_to_mb(512 * 1024), 0.5);
    }
}
