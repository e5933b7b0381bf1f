use be_payment_service::{
    EnrollmentWorker, MemoryStore, init_local_payment_service, init_payment_service,
};
use be_remote_db::{DatabaseManager, PaymentTarget};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Configuration for running the monolith server.
pub struct ServerConfig {
    /// Required unless `local_mode` is set.
    pub database_url: Option<String>,
    pub http_addr: SocketAddr,
    /// In-memory stores and a local gateway instead of Postgres and the
    /// payment provider.
    pub local_mode: bool,
    /// When this receiver gets a value, the server shuts down gracefully.
    pub shutdown: watch::Receiver<()>,
}

pub async fn init_analytics() {
    if let Some(posthog_key) = std::env::var("POSTHOG_API_KEY")
        .ok()
        .filter(|s| !s.is_empty())
    {
        match posthog_rs::init_global(posthog_key.as_str()).await {
            Ok(()) => {
                be_payment_service::analytics::enable();
                tracing::info!("PostHog analytics initialized");
            }
            Err(e) => tracing::warn!("Failed to initialize PostHog: {}", e),
        }
    } else {
        tracing::info!("POSTHOG_API_KEY not set, analytics disabled");
    }
}

/// Builds the HTTP router and the enrollment worker that backs it.
pub async fn build_app(
    database_url: Option<&str>,
    local_mode: bool,
) -> Result<(axum::Router, EnrollmentWorker), Box<dyn std::error::Error + Send + Sync>> {
    let (payment_router, worker) = match database_url {
        Some(url) if !local_mode => {
            let db_manager = Arc::new(DatabaseManager::new(url).await?);
            init_payment_service(db_manager).map_err(|e| {
                tracing::error!("Failed to initialize payment service: {}", e);
                e
            })?
        }
        _ => {
            tracing::warn!("Running fully local: in-memory payment store, local gateway");
            let store = MemoryStore::new();
            store
                .add_catalog_item(PaymentTarget::Course("demo-course".into()), 49_900, "INR")
                .await;
            init_local_payment_service(store)?
        }
    };

    let health_route = axum::Router::new().route(
        "/health",
        axum::routing::get(|| async { axum::http::StatusCode::OK }),
    );

    Ok((payment_router.merge(health_route), worker))
}

/// Serves `router` on `listener` and runs `worker` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    router: axum::Router,
    worker: EnrollmentWorker,
    shutdown: watch::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    let mut http_shutdown = shutdown;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = http_shutdown.changed().await;
        tracing::info!("Shutting down HTTP server...");
    })
    .await
    .map_err(|e| {
        tracing::error!("HTTP server error: {}", e);
        e
    })?;

    if let Err(e) = worker_handle.await {
        tracing::error!("Enrollment worker panicked: {}", e);
    }

    Ok(())
}

pub async fn run_server(
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_analytics().await;

    let (router, worker) = build_app(config.database_url.as_deref(), config.local_mode).await?;

    tracing::info!("Starting HTTP server at {}", config.http_addr);
    let listener = TcpListener::bind(config.http_addr).await?;

    serve(listener, router, worker, config.shutdown).await
}
