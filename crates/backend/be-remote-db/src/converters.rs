use crate::error::DbError;
use crate::types::{EnrollmentRecord, EnrollmentRow, Payment, PaymentFor, PaymentRow, PaymentTarget};

impl TryFrom<PaymentRow> for Payment {
    type Error = DbError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let id = match (row.payment_for, row.course_id, row.live_session_id, row.enquiry_id) {
            (PaymentFor::Course, Some(id), None, None)
            | (PaymentFor::LiveSession, None, Some(id), None)
            | (PaymentFor::Enquiry, None, None, Some(id)) => id,
            (kind, ..) => {
                return Err(DbError::encoding(format!(
                    "payment {} ({kind}) must reference exactly one matching target",
                    row.gateway_order_id
                )));
            }
        };

        Ok(Payment {
            id: row.id,
            target: PaymentTarget::new(row.payment_for, id),
            user_id: row.user_id,
            amount: row.amount,
            currency: row.currency,
            receipt: row.receipt,
            gateway_order_id: row.gateway_order_id,
            gateway_payment_id: row.gateway_payment_id,
            gateway_signature: row.gateway_signature,
            status: row.status,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<EnrollmentRow> for EnrollmentRecord {
    fn from(row: EnrollmentRow) -> Self {
        EnrollmentRecord {
            id: row.id,
            payment_id: row.payment_id,
            user_id: row.user_id,
            target: PaymentTarget::new(row.payment_for, row.target_id),
            created_at: row.created_at,
        }
    }
}

/// Splits a target into the `(course_id, live_session_id, enquiry_id)` column
/// triple used by the `payments` table.
pub(crate) fn target_columns(
    target: &PaymentTarget,
) -> (Option<&str>, Option<&str>, Option<&str>) {
    match target {
        PaymentTarget::Course(id) => (Some(id), None, None),
        PaymentTarget::LiveSession(id) => (None, Some(id), None),
        PaymentTarget::Enquiry(id) => (None, None, Some(id)),
    }
}
