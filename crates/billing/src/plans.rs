//! Plan catalog.
//!
//! Plans are compiled in and read-only. Quota limits use `-1` to mean
//! unlimited.

use serde::Serialize;
use sketchbench_shared::PlanId;

/// Sentinel limit meaning "no ceiling".
pub const UNLIMITED: i64 = -1;

/// Quota limits and feature flags for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanQuotas {
    pub max_projects: i64,
    pub max_storage_mb: i64,
    pub features: &'static [&'static str],
}

/// A subscription plan tier.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: &'static str,
    pub quotas: PlanQuotas,
}

impl Plan {
    /// Free tier: 3 projects, 100 MB storage.
    pub const fn free() -> Self {
        Self {
            id: PlanId::Free,
            name: "Free",
            quotas: PlanQuotas {
                max_projects: 3,
                max_storage_mb: 100,
                features: &["basic_2d", "basic_3d"],
            },
        }
    }

    /// Pro tier: 50 projects, 5 GB storage, advanced tooling and PDF export.
    pub const fn pro() -> Self {
        Self {
            id: PlanId::Pro,
            name: "Pro",
            quotas: PlanQuotas {
                max_projects: 50,
                max_storage_mb: 5000,
                features: &[
                    "basic_2d",
                    "basic_3d",
                    "advanced_2d",
                    "advanced_3d",
                    "export_pdf",
                ],
            },
        }
    }

    /// Enterprise tier: unlimited everything.
    pub const fn enterprise() -> Self {
        Self {
            id: PlanId::Enterprise,
            name: "Enterprise",
            quotas: PlanQuotas {
                max_projects: UNLIMITED,
                max_storage_mb: UNLIMITED,
                features: &["all"],
            },
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.quotas.features.contains(&"all") || self.quotas.features.contains(&feature)
    }
}

/// Read-only lookup of plans by id.
pub struct PlanCatalog;

impl PlanCatalog {
    /// Total by construction: every `PlanId` maps to exactly one plan, and
    /// the free plan always exists. Unknown plan strings are rejected when
    /// parsing into `PlanId`.
    pub fn lookup(id: PlanId) -> Plan {
        match id {
            PlanId::Free => Plan::free(),
            PlanId::Pro => Plan::pro(),
            PlanId::Enterprise => Plan::enterprise(),
        }
    }

    /// Resolve an optional subscription row to its plan. Absence of a row is
    /// the canonical representation of "on the free plan".
    pub fn resolve(plan_id: Option<PlanId>) -> Plan {
        Self::lookup(plan_id.unwrap_or(PlanId::Free))
    }

    pub fn all() -> [Plan; 3] {
        [Plan::free(), Plan::pro(), Plan::enterprise()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_plan_is_the_default() {
        let plan = PlanCatalog::resolve(None);
        assert_eq!(plan.id, PlanId::Free);
        assert_eq!(plan.quotas.max_projects, 3);
        assert_eq!(plan.quotas.max_storage_mb, 100);
    }

    #[test]
    fn enterprise_is_unlimited() {
        let plan = PlanCatalog::lookup(PlanId::Enterprise);
        assert_eq!(plan.quotas.max_projects, UNLIMITED);
        assert_eq!(plan.quotas.max_storage_mb, UNLIMITED);
    }

    #[test]
    fn feature_flags() {
        assert!(Plan::free().has_feature("basic_2d"));
        assert!(!Plan::free().has_feature("export_pdf"));
        assert!(Plan::pro().has_feature("export_pdf"));
        // "all" grants everything, including features no other plan lists
        assert!(Plan::enterprise().has_feature("export_pdf"));
    }

    #[test]
    fn catalog_covers_every_plan_id() {
        let all = PlanCatalog::all();
        assert_eq!(all.len(), 3);
        for plan in all {
            assert_eq!(PlanCatalog::lookup(plan.id).name, plan.name);
        }
    }
}
