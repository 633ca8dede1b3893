//! Router

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(handlers::health_check))

        // Metered generation
        .route("/api/generate", post(handlers::generate))

        // Account queries
        .route("/api/balance", get(handlers::balance))
        .route("/api/subscription", get(handlers::subscription_status))
        .route("/api/payments", get(handlers::payment_history))
        .route("/api/payments/{session_id}", get(handlers::payment_status))

        // Purchases
        .route("/api/checkout", post(handlers::create_checkout))
        .route("/api/subscription/checkout", post(handlers::create_subscription_checkout))
        .route("/api/subscription/cancel", post(handlers::cancel_subscription))
        .route("/webhook/stripe", post(handlers::stripe_webhook))

        // Catalog
        .route("/api/packages", get(handlers::list_packages))
        .route("/api/plans", get(handlers::list_plans))

        // Sign-in handoff
        .route("/auth/handoff", post(handlers::store_handoff))
        .route("/auth/handoff/{id}", get(handlers::take_handoff))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
