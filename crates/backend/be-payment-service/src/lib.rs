use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
};
use be_remote_db::DatabaseManager;
use tower::ServiceBuilder;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::debug;

pub mod analytics;
pub mod applier;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod notifier;
pub mod reconciler;
pub mod service;
pub mod signature;
pub mod store;
pub mod types;
pub mod webhook;
pub mod worker;

use service::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);
    // FRONTEND_URL is validated during PaymentConfig::from_env().
    let cors = match HeaderValue::from_str(&state.config.frontend_url) {
        Ok(origin) => cors.allow_origin(AllowOrigin::exact(origin)),
        Err(_) => cors,
    };

    let order_governor = GovernorConfigBuilder::default()
        .per_second(6)
        .burst_size(10)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("valid governor config");

    let order_route = Router::new()
        .route("/payments/order", post(handlers::create_order))
        .layer(GovernorLayer::new(Arc::new(order_governor)));

    let confirm_routes = Router::new()
        .route("/payments/confirm", post(handlers::confirm_payment))
        .route(
            "/payments/{gateway_order_id}/status",
            get(handlers::get_purchase_status),
        );

    let webhook_route = Router::new().route("/payments/webhook", post(handlers::handle_webhook));

    let router = order_route.merge(confirm_routes).merge(webhook_route);
    let router = match state.jwt_config.clone() {
        Some(jwt_config) => router.layer(Extension(jwt_config)),
        None => router,
    };

    router
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Builds the payment router over Postgres. The returned worker must be
/// spawned for queued enrollments and the sweep to run.
pub fn init_payment_service(db: Arc<DatabaseManager>) -> Result<(Router, EnrollmentWorker)> {
    debug!("Initializing payment service");

    let (state, worker) =
        AppState::from_env(db).context("Failed to create payment service state")?;

    Ok((create_router(Arc::new(state)), worker))
}

/// Builds the payment router over in-memory stores with a local gateway.
pub fn init_local_payment_service(store: MemoryStore) -> Result<(Router, EnrollmentWorker)> {
    debug!("Initializing payment service in local mode");

    let (state, worker) =
        AppState::local(store).context("Failed to create local payment service state")?;

    Ok((create_router(Arc::new(state)), worker))
}

pub use config::{PaymentConfig, RetryPolicy};
pub use error::PaymentError;
pub use reconciler::{Confirmation, ConfirmOutcome, OrderRequest, Reconciler, WebhookOutcome};
pub use store::MemoryStore;
pub use types::{
    ConfirmPaymentRequest, ConfirmPaymentResponse, ConfirmStatus, CreateOrderRequest,
    CreateOrderResponse, PurchaseStatusResponse,
};
pub use worker::EnrollmentWorker;
