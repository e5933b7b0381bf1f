use dotenv::dotenv;
use std::net::SocketAddr;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv().ok();

    // --- Sentry ---
    let _sentry_guard = if cfg!(not(debug_assertions)) {
        std::env::var("SENTRY_MONOLITH_DSN")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|sentry_dsn| {
                let send_pii = std::env::var("SENTRY_SEND_PII")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false);

                sentry::init((
                    sentry_dsn,
                    sentry::ClientOptions {
                        release: sentry::release_name!(),
                        traces_sample_rate: 0.0,
                        send_default_pii: send_pii,
                        ..Default::default()
                    },
                ))
            })
    } else {
        None
    };

    // --- Tracing ---
    let app_level = if cfg!(debug_assertions) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let global_filter = Targets::new()
        .with_default(LevelFilter::WARN)
        .with_target("be_", app_level)
        .with_target("hyper", LevelFilter::OFF)
        .with_target("tokio", LevelFilter::OFF);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .with(global_filter)
        .try_init()?;

    // --- Shutdown channel ---
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            return;
        }
        tracing::info!("Received CTRL+C, initiating shutdown...");
        let _ = shutdown_tx.send(());
    });

    // --- Server config from environment ---
    let local_mode = std::env::var("RUNNING_FULLY_LOCAL")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let database_url = match std::env::var("REMOTE_DATABASE_URL") {
        Ok(url) => Some(url),
        Err(_) if local_mode => None,
        Err(_) => return Err("REMOTE_DATABASE_URL environment variable must be set".into()),
    };

    let config = be_monolith::ServerConfig {
        database_url,
        http_addr: std::env::var("HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| format!("Invalid HTTP_ADDR format: {e}"))?,
        local_mode,
        shutdown: shutdown_rx,
    };

    be_monolith::run_server(config).await
}
