// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the billing system
//!
//! Scenario tests over the pure decision layer:
//! - Quota boundaries and the unlimited sentinel
//! - Plan resolution for accounts with and without subscription rows
//! - Quota position display after a downgrade

#[cfg(test)]
mod quota_boundary_tests {
    use crate::plans::{Plan, UNLIMITED};
    use crate::quota::{decide, QuotaAction};
    use crate::usage::Usage;

    // =========================================================================
    // Pro plan at exactly its project limit - next creation must block
    // =========================================================================
    #[test]
    fn pro_at_capacity_blocks_creation() {
        let plan = Plan::pro();
        let usage = Usage {
            projects: 50,
            storage_mb: 10.0,
        };

        let check = decide(&plan, &usage, QuotaAction::CreateProject);
        assert!(!check.allowed);
        assert_eq!(check.current, 50);
        assert_eq!(check.limit, 50);
        assert!(check.reason.unwrap().contains("50"));
    }

    #[test]
    fn pro_below_capacity_allows_creation() {
        let plan = Plan::pro();
        let usage = Usage {
            projects: 49,
            storage_mb: 10.0,
        };

        assert!(decide(&plan, &usage, QuotaAction::CreateProject).allowed);
    }

    // =========================================================================
    // Unlimited sentinel: allowed for any usage value
    // =========================================================================
    #[test]
    fn enterprise_never_blocks() {
        let plan = Plan::enterprise();
        assert_eq!(plan.quotas.max_projects, UNLIMITED);

        for projects in [0, 3, 50, 1_000_000] {
            let usage = Usage {
                projects,
                storage_mb: projects as f64 * 100.0,
            };
            assert!(decide(&plan, &usage, QuotaAction::CreateProject).allowed);
            assert!(decide(&plan, &usage, QuotaAction::UploadAsset).allowed);
        }
    }

    // =========================================================================
    // Storage metric gates uploads, not project creation
    // =========================================================================
    #[test]
    fn storage_and_projects_are_independent() {
        let plan = Plan::free();
        let usage = Usage {
            projects: 0,
            storage_mb: 100.0,
        };

        assert!(decide(&plan, &usage, QuotaAction::CreateProject).allowed);
        assert!(!decide(&plan, &usage, QuotaAction::UploadAsset).allowed);
    }
}

#[cfg(test)]
mod plan_resolution_tests {
    use crate::plans::PlanCatalog;
    use sketchbench_shared::PlanId;

    // =========================================================================
    // No subscription row is a valid, terminal representation of "free"
    // =========================================================================
    #[test]
    fn missing_row_resolves_to_free() {
        let plan = PlanCatalog::resolve(None);
        assert_eq!(plan.id, PlanId::Free);
        assert_eq!(plan.name, "Free");
    }

    #[test]
    fn present_row_resolves_to_its_plan() {
        let plan = PlanCatalog::resolve(Some(PlanId::Pro));
        assert_eq!(plan.id, PlanId::Pro);
    }
}

#[cfg(test)]
mod downgrade_display_tests {
    use crate::quota::{available, decide_projects};

    // =========================================================================
    // Account downgraded from pro (50 used) to free (limit 3):
    // creation blocks and the displayed availability clamps at zero
    // =========================================================================
    #[test]
    fn over_limit_after_downgrade() {
        let check = decide_projects(50, 3);
        assert!(!check.allowed);
        assert_eq!(check.current, 50);
        assert_eq!(check.limit, 3);

        assert_eq!(available(3, 50), 0, "available must not go negative");
    }
}
