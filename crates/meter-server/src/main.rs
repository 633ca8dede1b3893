//! design-meter HTTP Server
//!
//! Axum-based server that meters generation requests against purchased
//! points and subscription allowances, and reconciles Stripe webhooks.

mod auth;
mod config;
mod handlers;
mod routes;
mod state;

use std::sync::Arc;

use chrono::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meter_billing::{
    Billing, BillingConfig, Clock, MemoryStore, PaymentGateway, PgStore, StripeConfig,
    StripeGateway, SystemClock,
};
use meter_runtime::{GenerationCapability, HttpCapability};

use crate::auth::HmacIdentity;
use crate::config::ServerConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let server_config = ServerConfig::from_env()?;
    let billing_config = BillingConfig::from_env()?;
    tracing::info!(
        capabilities = billing_config.catalog.capabilities.len(),
        plans = billing_config.catalog.plans.len(),
        packages = billing_config.catalog.packages.len(),
        points_per_dollar = %billing_config.points_per_dollar,
        min_preflight_points = billing_config.min_preflight_points,
        "Billing catalog loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Storage
    let billing = if let Some(url) = &server_config.database_url {
        let store = PgStore::connect(url).await?;
        store.migrate().await?;
        tracing::info!("✓ Connected to Postgres");
        Billing::new(billing_config, Arc::new(store), clock.clone())
    } else {
        tracing::warn!("⚠ DATABASE_URL not set - using in-memory store");
        Billing::new(billing_config, Arc::new(MemoryStore::new()), clock.clone())
    };

    // Generation backend
    let capability = Arc::new(HttpCapability::from_env()?);
    if capability.health_check().await {
        tracing::info!("✓ Generation backend reachable");
    } else {
        tracing::warn!("⚠ Generation backend not reachable - requests will fail");
    }

    // Payments
    let payments = match StripeConfig::from_env()? {
        Some(stripe_config) => {
            let tolerance_secs = stripe_config.webhook_tolerance_secs;
            let gateway = StripeGateway::new(stripe_config);
            let verifier = gateway.signature_verifier();
            tracing::info!(gateway = gateway.name(), tolerance_secs, "✓ Payments configured");
            Some(Arc::new(billing.payments(Arc::new(gateway), verifier)))
        }
        None => {
            tracing::warn!("⚠ Stripe not configured - payments disabled");
            tracing::warn!("  Set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET in .env");
            None
        }
    };

    let state = AppState {
        billing: Arc::new(billing),
        payments,
        capability,
        identity: Arc::new(HmacIdentity::new(server_config.identity_secret.clone())),
        clock,
        handoff_ttl: Duration::seconds(server_config.handoff_ttl_secs),
    };

    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&server_config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 design-meter server running on http://{}", server_config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                    - Health check");
    tracing::info!("  POST /api/generate              - Metered generation");
    tracing::info!("  GET  /api/balance               - Points balance");
    tracing::info!("  GET  /api/subscription          - Subscription status");
    tracing::info!("  POST /api/checkout              - Buy a points package");
    tracing::info!("  POST /api/subscription/checkout - Subscribe to a plan");
    tracing::info!("  POST /webhook/stripe            - Stripe events");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
