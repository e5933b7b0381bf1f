//! Provider webhook events.
//!
//! Only the fields the reconciler acts on are decoded. Statuses the service
//! does not know about deserialize to `Unknown` and never grant access.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayPaymentStatus {
    Created,
    Authorized,
    Captured,
    Refunded,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub status: GatewayPaymentStatus,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entity<T> {
    pub entity: T,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPayload {
    #[serde(default)]
    pub payment: Option<Entity<PaymentEntity>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(default)]
    pub payload: EventPayload,
}

/// What the reconciler should do about an authenticated event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    Settle {
        gateway_order_id: String,
        gateway_payment_id: String,
    },
    /// The attempt failed but the order stays open for another attempt.
    AttemptFailed {
        gateway_order_id: String,
        reason: String,
    },
    Ignore,
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn action(&self) -> WebhookAction {
        let Some(payment) = self.payload.payment.as_ref().map(|p| &p.entity) else {
            return WebhookAction::Ignore;
        };
        let Some(order_id) = payment.order_id.clone().filter(|id| !id.is_empty()) else {
            return WebhookAction::Ignore;
        };

        match (self.event.as_str(), payment.status) {
            ("payment.captured" | "order.paid", GatewayPaymentStatus::Captured) => {
                WebhookAction::Settle {
                    gateway_order_id: order_id,
                    gateway_payment_id: payment.id.clone(),
                }
            }
            ("payment.failed", GatewayPaymentStatus::Failed) => WebhookAction::AttemptFailed {
                gateway_order_id: order_id,
                reason: payment
                    .error_description
                    .clone()
                    .unwrap_or_else(|| "payment failed".to_string()),
            },
            _ => WebhookAction::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, status: &str) -> WebhookEvent {
        let body = serde_json::json!({
            "entity": "event",
            "event": name,
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_123",
                        "order_id": "order_abc",
                        "status": status,
                        "amount": 49900,
                        "error_description": "Card declined"
                    }
                }
            }
        });
        WebhookEvent::parse(body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_captured_payment_settles() {
        let expected = WebhookAction::Settle {
            gateway_order_id: "order_abc".into(),
            gateway_payment_id: "pay_123".into(),
        };
        assert_eq!(event("payment.captured", "captured").action(), expected);
        assert_eq!(event("order.paid", "captured").action(), expected);
    }

    #[test]
    fn test_uncaptured_statuses_never_settle() {
        assert_eq!(
            event("payment.captured", "authorized").action(),
            WebhookAction::Ignore
        );
        assert_eq!(
            event("payment.captured", "something_new").action(),
            WebhookAction::Ignore
        );
        assert_eq!(
            event("payment.authorized", "captured").action(),
            WebhookAction::Ignore
        );
    }

    #[test]
    fn test_failed_attempt() {
        assert_eq!(
            event("payment.failed", "failed").action(),
            WebhookAction::AttemptFailed {
                gateway_order_id: "order_abc".into(),
                reason: "Card declined".into(),
            }
        );
    }

    #[test]
    fn test_event_without_payment_is_ignored() {
        let parsed = WebhookEvent::parse(br#"{"event":"refund.created","payload":{}}"#).unwrap();
        assert_eq!(parsed.action(), WebhookAction::Ignore);
        assert!(WebhookEvent::parse(b"not json").is_err());
    }
}
