//! Application state.

use std::sync::Arc;

use sketchbench_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state. Every component is dependency-injected here;
/// there are no process-wide singletons.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Stripe billing service initialized");

        Ok(Self {
            pool,
            config,
            billing: Arc::new(billing),
        })
    }
}
