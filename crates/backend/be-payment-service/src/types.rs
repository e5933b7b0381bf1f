use be_remote_db::{EnrollmentRecord, PaymentFor, PaymentStatus, PaymentTarget};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub payment_for: PaymentFor,
    pub target_id: String,
    /// Smallest currency unit.
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl CreateOrderRequest {
    pub fn target(&self) -> PaymentTarget {
        PaymentTarget::new(self.payment_for, self.target_id.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub gateway_order_id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub gateway_signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentView {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub target: PaymentTarget,
    pub created_at: DateTime<Utc>,
}

impl From<EnrollmentRecord> for EnrollmentView {
    fn from(record: EnrollmentRecord) -> Self {
        Self {
            id: record.id,
            payment_id: record.payment_id,
            user_id: record.user_id,
            target: record.target,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentResponse {
    pub status: ConfirmStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<EnrollmentView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseStatusResponse {
    pub gateway_order_id: String,
    pub status: PaymentStatus,
    pub purchased: bool,
}
