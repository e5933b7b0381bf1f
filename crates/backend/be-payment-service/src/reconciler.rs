//! Drives a payment from order creation to enrollment.
//!
//! The ledger's compare-and-swap decides every race: whichever caller moves
//! an order out of `created` runs the side effects, everybody else gets the
//! stored record back. Confirmations from the client and from provider
//! webhooks go through the same path.

use std::sync::Arc;

use anyhow::anyhow;
use be_remote_db::{
    CreateOutcome, DbError, EnrollmentRecord, FAILURE_BAD_SIGNATURE, NewPayment, Payment,
    PaymentStatus, PaymentTarget, Transition,
};
use bon::bon;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analytics;
use crate::applier::{EnrollmentApplier, EnrollmentError};
use crate::config::{RetryPolicy, due_after};
use crate::error::PaymentError;
use crate::gateway::GatewayClient;
use crate::notifier::{self, NotificationDispatcher};
use crate::signature;
use crate::store::{Catalog, EnrollmentQueue, EnrollmentStore, PaymentLedger};
use crate::webhook::{WebhookAction, WebhookEvent};

/// A request to pay for one item, with the caller's identity already
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub target: PaymentTarget,
    pub user_id: Option<String>,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// This call moved the payment to `success`.
    Settled,
    /// This call moved the payment to `failed`.
    Rejected,
    /// The payment was already terminal; nothing was written.
    Replayed,
}

#[derive(Debug, Clone)]
pub struct Confirmation {
    pub payment: Payment,
    pub enrollment: Option<EnrollmentRecord>,
    pub outcome: ConfirmOutcome,
}

impl Confirmation {
    pub fn succeeded(&self) -> bool {
        self.payment.status == PaymentStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Settled,
    Replayed,
    UnknownOrder,
    Ignored,
}

#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<dyn PaymentLedger>,
    catalog: Arc<dyn Catalog>,
    enrollments: Arc<dyn EnrollmentStore>,
    queue: Arc<dyn EnrollmentQueue>,
    gateway: Arc<dyn GatewayClient>,
    applier: EnrollmentApplier,
    notifications: NotificationDispatcher,
    key_secret: String,
    webhook_secret: String,
    retry: RetryPolicy,
}

#[bon]
impl Reconciler {
    #[builder]
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        catalog: Arc<dyn Catalog>,
        enrollments: Arc<dyn EnrollmentStore>,
        queue: Arc<dyn EnrollmentQueue>,
        gateway: Arc<dyn GatewayClient>,
        notifications: NotificationDispatcher,
        #[builder(into)] key_secret: String,
        #[builder(into)] webhook_secret: String,
        #[builder(default)] retry: RetryPolicy,
    ) -> Self {
        Self {
            applier: EnrollmentApplier::new(enrollments.clone()),
            ledger,
            catalog,
            enrollments,
            queue,
            gateway,
            notifications,
            key_secret,
            webhook_secret,
            retry,
        }
    }

    /// Validates the request against the catalog, opens an order at the
    /// gateway and records it as `created`. Gateway failures surface before
    /// anything is stored.
    pub async fn create_order(&self, request: OrderRequest) -> Result<Payment, PaymentError> {
        let kind = request.target.kind();
        let currency = request.currency.trim().to_ascii_uppercase();

        if request.target.id().is_empty() {
            return Err(PaymentError::invalid("targetId", "must not be empty"));
        }
        if request.amount <= 0 {
            return Err(PaymentError::invalid("amount", "must be positive"));
        }
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PaymentError::invalid(
                "currency",
                "must be a three-letter ISO code",
            ));
        }
        if kind.requires_user() && request.user_id.is_none() {
            return Err(PaymentError::MissingField("userId"));
        }

        let price = self.catalog.price(&request.target).await?.ok_or_else(|| {
            PaymentError::invalid(
                "targetId",
                format!("no {kind} with id '{}'", request.target.id()),
            )
        })?;
        if price.amount != request.amount || !price.currency.eq_ignore_ascii_case(&currency) {
            return Err(PaymentError::invalid(
                "amount",
                format!(
                    "{} {} does not match the listed price of {} {}",
                    request.amount, currency, price.amount, price.currency
                ),
            ));
        }

        let receipt = format!("rcpt_{}", Uuid::now_v7().simple());
        let order = match self
            .gateway
            .create_order(request.amount, &currency, &receipt)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                let e = PaymentError::from(e);
                analytics::track_order_failed(kind, e.kind());
                return Err(e);
            }
        };

        if order.amount != request.amount || !order.currency.eq_ignore_ascii_case(&currency) {
            return Err(PaymentError::Internal(anyhow!(
                "gateway order {} was issued for {} {}, expected {} {}",
                order.id,
                order.amount,
                order.currency,
                request.amount,
                currency
            )));
        }

        let outcome = self
            .ledger
            .create_pending(NewPayment {
                target: request.target.clone(),
                user_id: request.user_id.clone(),
                amount: request.amount,
                currency: currency.clone(),
                receipt,
                gateway_order_id: order.id,
            })
            .await?;

        if let CreateOutcome::Existing(stored) = &outcome {
            if !is_same_order(stored, &request, &currency) {
                error!(
                    gateway_order_id = %stored.gateway_order_id,
                    "Gateway reissued an order id that belongs to a different purchase"
                );
                analytics::track_order_failed(kind, "order_id_reused");
                return Err(PaymentError::Internal(anyhow!(
                    "gateway order {} already belongs to another purchase",
                    stored.gateway_order_id
                )));
            }
            warn!(
                gateway_order_id = %stored.gateway_order_id,
                "Gateway reissued an existing order id"
            );
        }

        let payment = outcome.into_payment();
        info!(
            gateway_order_id = %payment.gateway_order_id,
            payment_for = %kind,
            amount = payment.amount,
            currency = %payment.currency,
            "Payment order created"
        );
        analytics::track_order_created(kind, payment.amount, &payment.currency);

        Ok(payment)
    }

    /// Handles the checkout callback `(order, payment, signature)`.
    ///
    /// A bad signature fails the order for good. A good one settles it; if
    /// the order is already terminal the stored outcome is returned and no
    /// side effect runs again.
    pub async fn confirm_payment(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        gateway_signature: &str,
    ) -> Result<Confirmation, PaymentError> {
        let payment = self
            .ledger
            .get(gateway_order_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(gateway_order_id.to_string()))?;

        if payment.status.is_terminal() {
            debug!(gateway_order_id, status = %payment.status, "Confirmation replayed");
            return Ok(self.replayed(payment).await);
        }

        if !signature::verify(
            gateway_order_id,
            gateway_payment_id,
            gateway_signature,
            &self.key_secret,
        ) {
            return self.reject(gateway_order_id).await;
        }

        self.settle(gateway_order_id, gateway_payment_id, gateway_signature, "confirm")
            .await
    }

    /// Authenticates and applies a provider webhook. Events that do not
    /// report a captured payment are acknowledged without effect.
    pub async fn handle_webhook(
        &self,
        body: &[u8],
        webhook_signature: &str,
    ) -> Result<WebhookOutcome, PaymentError> {
        if !signature::verify_webhook(body, webhook_signature, &self.webhook_secret) {
            return Err(PaymentError::WebhookSignatureInvalid);
        }

        let event =
            WebhookEvent::parse(body).map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;

        match event.action() {
            WebhookAction::Settle {
                gateway_order_id,
                gateway_payment_id,
            } => {
                let confirmation = match self
                    .settle(
                        &gateway_order_id,
                        &gateway_payment_id,
                        webhook_signature,
                        "webhook",
                    )
                    .await
                {
                    Ok(confirmation) => confirmation,
                    Err(PaymentError::NotFound(_)) => {
                        warn!(%gateway_order_id, event = %event.event, "Webhook for unknown order");
                        return Ok(WebhookOutcome::UnknownOrder);
                    }
                    Err(e) => return Err(e),
                };

                if confirmation.outcome == ConfirmOutcome::Settled {
                    return Ok(WebhookOutcome::Settled);
                }
                if confirmation.payment.status == PaymentStatus::Failed {
                    error!(
                        %gateway_order_id,
                        %gateway_payment_id,
                        "Gateway captured a payment on a failed order, needs manual reconciliation"
                    );
                }
                Ok(WebhookOutcome::Replayed)
            }
            WebhookAction::AttemptFailed {
                gateway_order_id,
                reason,
            } => {
                info!(
                    %gateway_order_id,
                    %reason,
                    "Payment attempt failed at gateway, order stays open"
                );
                Ok(WebhookOutcome::Ignored)
            }
            WebhookAction::Ignore => {
                debug!(event = %event.event, "Ignoring webhook event");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    pub async fn purchase_status(&self, gateway_order_id: &str) -> Result<Payment, PaymentError> {
        self.ledger
            .get(gateway_order_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(gateway_order_id.to_string()))
    }

    async fn reject(&self, gateway_order_id: &str) -> Result<Confirmation, PaymentError> {
        let transition = self
            .ledger
            .transition_to_failed(gateway_order_id, FAILURE_BAD_SIGNATURE, None)
            .await
            .map_err(|e| order_error(gateway_order_id, e))?;

        let payment = match transition {
            Transition::Applied(payment) => payment,
            Transition::AlreadyTerminal(payment) => return Ok(self.replayed(payment).await),
        };

        warn!(gateway_order_id, "Payment signature rejected, order failed");
        analytics::track_payment_failed(payment.payment_for(), FAILURE_BAD_SIGNATURE);
        if let Some(notification) = notifier::failure_for(&payment) {
            self.notifications.dispatch(notification);
        }

        Ok(Confirmation {
            payment,
            enrollment: None,
            outcome: ConfirmOutcome::Rejected,
        })
    }

    async fn settle(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        evidence: &str,
        source: &str,
    ) -> Result<Confirmation, PaymentError> {
        let transition = self
            .ledger
            .transition_to_success(gateway_order_id, gateway_payment_id, evidence)
            .await
            .map_err(|e| order_error(gateway_order_id, e))?;

        let payment = match transition {
            Transition::Applied(payment) => payment,
            Transition::AlreadyTerminal(payment) => return Ok(self.replayed(payment).await),
        };

        info!(
            gateway_order_id,
            gateway_payment_id,
            source,
            payment_for = %payment.payment_for(),
            "Payment settled"
        );
        analytics::track_payment_confirmed(payment.payment_for(), source);

        let enrollment = match self.applier.apply(&payment).await {
            Ok(record) => Some(record),
            Err(e) => {
                self.defer(&payment, &e).await;
                None
            }
        };

        if let Some(notification) = notifier::confirmation_for(&payment) {
            self.notifications.dispatch(notification);
        } else {
            debug!(gateway_order_id, "No recipient for confirmation");
        }

        Ok(Confirmation {
            payment,
            enrollment,
            outcome: ConfirmOutcome::Settled,
        })
    }

    async fn defer(&self, payment: &Payment, cause: &EnrollmentError) {
        warn!(
            gateway_order_id = %payment.gateway_order_id,
            error = %cause,
            "Enrollment failed after payment success, queued for retry"
        );
        analytics::track_enrollment_deferred(payment.payment_for());

        let due_at = due_after(Utc::now(), self.retry.base_delay);
        if let Err(e) = self
            .queue
            .enqueue(payment.id, due_at, Some(cause.to_string()))
            .await
        {
            error!(
                gateway_order_id = %payment.gateway_order_id,
                error = %e,
                "Could not queue enrollment retry, leaving it to the sweep"
            );
        }
    }

    async fn replayed(&self, payment: Payment) -> Confirmation {
        let enrollment = if payment.status == PaymentStatus::Success {
            self.enrollments
                .find(payment.user_id.as_deref(), &payment.target)
                .await
                .unwrap_or_else(|e| {
                    warn!(
                        gateway_order_id = %payment.gateway_order_id,
                        error = %e,
                        "Enrollment lookup failed"
                    );
                    None
                })
        } else {
            None
        };

        Confirmation {
            payment,
            enrollment,
            outcome: ConfirmOutcome::Replayed,
        }
    }
}

/// Whether a stored payment was opened for exactly this purchase.
fn is_same_order(stored: &Payment, request: &OrderRequest, currency: &str) -> bool {
    stored.target == request.target
        && stored.user_id == request.user_id
        && stored.amount == request.amount
        && stored.currency.eq_ignore_ascii_case(currency)
}

fn order_error(gateway_order_id: &str, e: DbError) -> PaymentError {
    if e.is_not_found() {
        PaymentError::NotFound(gateway_order_id.to_string())
    } else {
        PaymentError::Database(e)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use be_remote_db::PaymentFor;

    use super::*;
    use crate::gateway::LocalGateway;
    use crate::notifier::LoggingNotifier;
    use crate::store::MemoryStore;

    const KEY_SECRET: &str = "key_secret";
    const WEBHOOK_SECRET: &str = "webhook_secret";

    async fn setup() -> (MemoryStore, Reconciler) {
        let store = MemoryStore::new();
        store
            .add_catalog_item(PaymentTarget::Course("C1".into()), 49_900, "INR")
            .await;
        let reconciler = Reconciler::builder()
            .ledger(Arc::new(store.clone()))
            .catalog(Arc::new(store.clone()))
            .enrollments(Arc::new(store.clone()))
            .queue(Arc::new(store.clone()))
            .gateway(Arc::new(LocalGateway))
            .notifications(NotificationDispatcher::new(Arc::new(LoggingNotifier)))
            .key_secret(KEY_SECRET)
            .webhook_secret(WEBHOOK_SECRET)
            .retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
            })
            .build();
        (store, reconciler)
    }

    fn course_order(user: Option<&str>, amount: i64) -> OrderRequest {
        OrderRequest {
            target: PaymentTarget::new(PaymentFor::Course, "C1"),
            user_id: user.map(str::to_string),
            amount,
            currency: "inr".into(),
        }
    }

    #[tokio::test]
    async fn create_order_records_created_payment() {
        let (store, reconciler) = setup().await;

        let payment = reconciler
            .create_order(course_order(Some("U1"), 49_900))
            .await
            .unwrap();

        assert_eq!(payment.status, PaymentStatus::Created);
        assert_eq!(payment.currency, "INR");
        assert!(payment.receipt.starts_with("rcpt_"));
        assert_eq!(store.payment_count().await, 1);
    }

    #[tokio::test]
    async fn create_order_checks_catalog_and_user() {
        let (store, reconciler) = setup().await;

        let mismatch = reconciler
            .create_order(course_order(Some("U1"), 100))
            .await
            .unwrap_err();
        assert!(matches!(mismatch, PaymentError::InvalidField { field: "amount", .. }));

        let guest = reconciler
            .create_order(course_order(None, 49_900))
            .await
            .unwrap_err();
        assert!(matches!(guest, PaymentError::MissingField("userId")));

        let unknown = reconciler
            .create_order(OrderRequest {
                target: PaymentTarget::Course("C404".into()),
                ..course_order(Some("U1"), 49_900)
            })
            .await
            .unwrap_err();
        assert!(matches!(unknown, PaymentError::InvalidField { field: "targetId", .. }));

        assert_eq!(store.payment_count().await, 0);
    }

    #[tokio::test]
    async fn confirm_then_replay() {
        let (store, reconciler) = setup().await;
        let order = reconciler
            .create_order(course_order(Some("U1"), 49_900))
            .await
            .unwrap()
            .gateway_order_id;
        let sig = signature::sign(&order, "pay_123", KEY_SECRET);

        let first = reconciler
            .confirm_payment(&order, "pay_123", &sig)
            .await
            .unwrap();
        assert_eq!(first.outcome, ConfirmOutcome::Settled);
        assert!(first.succeeded());
        let enrollment = first.enrollment.clone().unwrap();

        let replay = reconciler
            .confirm_payment(&order, "pay_123", &sig)
            .await
            .unwrap();
        assert_eq!(replay.outcome, ConfirmOutcome::Replayed);
        assert!(replay.succeeded());
        assert_eq!(replay.enrollment, Some(enrollment));
        assert_eq!(store.purchased_courses("U1").await.len(), 1);
    }

    #[tokio::test]
    async fn bad_signature_fails_for_good() {
        let (store, reconciler) = setup().await;
        let order = reconciler
            .create_order(course_order(Some("U1"), 49_900))
            .await
            .unwrap()
            .gateway_order_id;

        let rejected = reconciler
            .confirm_payment(&order, "pay_123", "deadbeef")
            .await
            .unwrap();
        assert_eq!(rejected.outcome, ConfirmOutcome::Rejected);
        assert_eq!(
            rejected.payment.failure_reason.as_deref(),
            Some(FAILURE_BAD_SIGNATURE)
        );

        let sig = signature::sign(&order, "pay_123", KEY_SECRET);
        let later = reconciler
            .confirm_payment(&order, "pay_123", &sig)
            .await
            .unwrap();
        assert!(!later.succeeded());
        assert!(store.purchased_courses("U1").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let (_, reconciler) = setup().await;
        let err = reconciler
            .confirm_payment("order_missing", "pay_1", "sig")
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NotFound(_)));
    }

    #[tokio::test]
    async fn webhook_settles_and_absorbs_replays() {
        let (store, reconciler) = setup().await;
        let order = reconciler
            .create_order(course_order(Some("U1"), 49_900))
            .await
            .unwrap()
            .gateway_order_id;
        let body = serde_json::json!({
            "event": "payment.captured",
            "payload": { "payment": { "entity": {
                "id": "pay_9", "order_id": order, "status": "captured"
            }}}
        })
        .to_string();
        let sig = signature::sign_webhook(body.as_bytes(), WEBHOOK_SECRET);

        let first = reconciler
            .handle_webhook(body.as_bytes(), &sig)
            .await
            .unwrap();
        let second = reconciler
            .handle_webhook(body.as_bytes(), &sig)
            .await
            .unwrap();

        assert_eq!(first, WebhookOutcome::Settled);
        assert_eq!(second, WebhookOutcome::Replayed);
        assert_eq!(store.enrollment_count().await, 1);

        let forged = reconciler
            .handle_webhook(body.as_bytes(), "00")
            .await
            .unwrap_err();
        assert!(matches!(forged, PaymentError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn purchase_status_reflects_ledger() {
        let (_, reconciler) = setup().await;
        let order = reconciler
            .create_order(course_order(Some("U1"), 49_900))
            .await
            .unwrap()
            .gateway_order_id;

        let before = reconciler.purchase_status(&order).await.unwrap();
        assert_eq!(before.status, PaymentStatus::Created);

        let sig = signature::sign(&order, "pay_1", KEY_SECRET);
        reconciler.confirm_payment(&order, "pay_1", &sig).await.unwrap();

        let after = reconciler.purchase_status(&order).await.unwrap();
        assert_eq!(after.status, PaymentStatus::Success);
    }
}
