// API server clippy configuration
#![allow(dead_code)] // Library items compiled into the binary module tree
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sketchbench API Server
//!
//! Serves the billing and quota endpoints and the Stripe webhook.

mod auth;
mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;

use axum::http::{header, Method};
use sketchbench_shared::{create_pool, run_migrations};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sketchbench_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Sketchbench API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;

    tracing::info!("Running database migrations...");
    run_migrations(&pool).await?;

    let state = AppState::new(pool, config.clone())?;

    // One consistency pass over billing state at startup; violations are
    // logged, never fatal.
    let invariant_billing = state.billing.clone();
    tokio::spawn(async move {
        match invariant_billing.invariants.run_all_checks().await {
            Ok(summary) if summary.healthy => {
                tracing::info!(checks_run = summary.checks_run, "Billing invariants healthy");
            }
            Ok(summary) => {
                for violation in &summary.violations {
                    tracing::warn!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        "{}",
                        violation.description
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "Billing invariant check failed"),
        }
    });

    // CORS: explicit origin allowlist
    let allowed_origins: Vec<axum::http::HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:5173".to_string())
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
