use std::sync::Arc;

use be_auth_core::JwtConfig;
use be_email_service::{EmailService, NotificationConfig};
use be_remote_db::DatabaseManager;
use tracing::info;

use crate::config::PaymentConfig;
use crate::error::PaymentError;
use crate::gateway::{GatewayClient, LocalGateway, RazorpayClient};
use crate::notifier::{LoggingNotifier, NotificationDispatcher, Notifier};
use crate::reconciler::Reconciler;
use crate::store::{Catalog, EnrollmentQueue, EnrollmentStore, MemoryStore, PaymentLedger};
use crate::worker::EnrollmentWorker;

pub struct AppState {
    pub config: PaymentConfig,
    pub reconciler: Reconciler,
    pub jwt_config: Option<Arc<JwtConfig>>,
}

impl AppState {
    /// Production wiring: Postgres stores, the configured gateway and
    /// notification provider.
    pub fn from_env(db: Arc<DatabaseManager>) -> Result<(Self, EnrollmentWorker), PaymentError> {
        let config = PaymentConfig::from_env()?;
        let gateway = RazorpayClient::new(
            &config.gateway_base_url,
            &config.gateway_key_id,
            &config.gateway_key_secret,
            config.gateway_timeout,
        )
        .map_err(|e| PaymentError::Config(format!("Failed to build gateway client: {e}")))?;

        Ok(Self::assemble(
            config,
            db,
            Arc::new(gateway),
            notifier_from_env()?,
            jwt_from_env()?,
        ))
    }

    /// Fully local wiring: in-memory stores and a gateway that accepts every
    /// order.
    pub fn local(store: MemoryStore) -> Result<(Self, EnrollmentWorker), PaymentError> {
        let config = PaymentConfig::local_from_env()?;
        Ok(Self::assemble(
            config,
            Arc::new(store),
            Arc::new(LocalGateway),
            Arc::new(LoggingNotifier),
            jwt_from_env()?,
        ))
    }

    pub fn assemble<S>(
        config: PaymentConfig,
        store: Arc<S>,
        gateway: Arc<dyn GatewayClient>,
        notifier: Arc<dyn Notifier>,
        jwt_config: Option<Arc<JwtConfig>>,
    ) -> (Self, EnrollmentWorker)
    where
        S: PaymentLedger + Catalog + EnrollmentStore + EnrollmentQueue + 'static,
    {
        let reconciler = Reconciler::builder()
            .ledger(store.clone())
            .catalog(store.clone())
            .enrollments(store.clone())
            .queue(store.clone())
            .gateway(gateway)
            .notifications(NotificationDispatcher::new(notifier))
            .key_secret(config.gateway_key_secret.clone())
            .webhook_secret(config.gateway_webhook_secret.clone())
            .retry(config.retry)
            .build();

        let worker = EnrollmentWorker::builder()
            .ledger(store.clone())
            .queue(store.clone())
            .enrollments(store)
            .retry(config.retry)
            .interval(config.worker_interval)
            .sweep_interval(config.sweep_interval)
            .build();

        let state = Self {
            config,
            reconciler,
            jwt_config,
        };
        (state, worker)
    }
}

fn notifier_from_env() -> Result<Arc<dyn Notifier>, PaymentError> {
    let config = NotificationConfig::from_env().map_err(|e| PaymentError::Config(e.to_string()))?;
    match config {
        Some(config) => {
            info!(api_url = %config.api_url, "Notification provider configured");
            let service =
                EmailService::new(config).map_err(|e| PaymentError::Config(e.to_string()))?;
            Ok(Arc::new(service))
        }
        None => {
            info!("NOTIFICATION_API_URL not set, notifications will only be logged");
            Ok(Arc::new(LoggingNotifier))
        }
    }
}

fn jwt_from_env() -> Result<Option<Arc<JwtConfig>>, PaymentError> {
    JwtConfig::from_env()
        .map(|config| config.map(Arc::new))
        .map_err(|e| PaymentError::Config(e.to_string()))
}
