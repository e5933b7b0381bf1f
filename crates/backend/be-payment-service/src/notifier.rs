//! Best-effort purchase notifications.
//!
//! Nothing here can fail a confirmation: delivery happens on a spawned task,
//! is retried a bounded number of times and is then given up with a warning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use be_email_service::{EmailService, Notification, NotifyError, Recipient, TemplateKind};
use be_remote_db::{Payment, PaymentTarget};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Attempts per notification, including the first.
const MAX_ATTEMPTS: usize = 3;
const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[async_trait]
impl Notifier for EmailService {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        EmailService::send(self, notification).await
    }
}

/// Used when no delivery provider is configured.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            recipient = ?notification.recipient,
            template = ?notification.template,
            context = ?notification.context,
            "Notification (no provider configured)"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    min_delay: Duration,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            min_delay: DEFAULT_MIN_DELAY,
        }
    }

    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    fn retry_strategy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_times(MAX_ATTEMPTS - 1)
    }

    /// Sends in the background. The handle resolves to whether delivery
    /// eventually succeeded; callers on the request path drop it.
    pub fn dispatch(&self, notification: Notification) -> JoinHandle<bool> {
        let notifier = self.notifier.clone();
        let strategy = self.retry_strategy();

        tokio::spawn(async move {
            let result = (|| notifier.send(&notification))
                .retry(strategy)
                .when(|e| e.is_retryable())
                .notify(|e, after| {
                    debug!(error = %e, ?after, "Retrying notification");
                })
                .await;

            match result {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        recipient = ?notification.recipient,
                        template = ?notification.template,
                        error = %e,
                        "Notification dropped"
                    );
                    false
                }
            }
        })
    }
}

fn base_notification(payment: &Payment, template: TemplateKind) -> Option<Notification> {
    let user_id = payment.user_id.as_ref()?;
    Some(
        Notification::new(Recipient::User(user_id.clone()), template)
            .with("gatewayOrderId", &payment.gateway_order_id)
            .with("amount", payment.amount.to_string())
            .with("currency", &payment.currency)
            .with("targetId", payment.target.id()),
    )
}

/// Confirmation for a settled payment, or `None` for a guest with no
/// address on file.
pub fn confirmation_for(payment: &Payment) -> Option<Notification> {
    let template = match payment.target {
        PaymentTarget::Course(_) => TemplateKind::CoursePurchased,
        PaymentTarget::LiveSession(_) => TemplateKind::LiveSessionBooked,
        PaymentTarget::Enquiry(_) => TemplateKind::EnquiryPaid,
    };
    base_notification(payment, template)
}

pub fn failure_for(payment: &Payment) -> Option<Notification> {
    base_notification(payment, TemplateKind::PaymentFailed).map(|n| {
        n.with(
            "reason",
            payment.failure_reason.clone().unwrap_or_default(),
        )
    })
}
