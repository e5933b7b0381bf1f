use std::sync::Arc;

use be_remote_db::{DbError, EnrollmentRecord, Payment, PaymentStatus};
use tracing::info;

use crate::store::EnrollmentStore;

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("Payment {0} is not confirmed")]
    NotConfirmed(String),

    #[error("Enrollment store error: {0}")]
    Store(#[from] DbError),
}

/// Grants what a confirmed payment bought.
///
/// Running `apply` any number of times for the same payment leaves one
/// enrollment and one side effect behind.
#[derive(Clone)]
pub struct EnrollmentApplier {
    store: Arc<dyn EnrollmentStore>,
}

impl EnrollmentApplier {
    pub fn new(store: Arc<dyn EnrollmentStore>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, payment: &Payment) -> Result<EnrollmentRecord, EnrollmentError> {
        if payment.status != PaymentStatus::Success {
            return Err(EnrollmentError::NotConfirmed(
                payment.gateway_order_id.clone(),
            ));
        }

        let record = self.store.upsert(payment).await?;
        info!(
            gateway_order_id = %payment.gateway_order_id,
            payment_for = %payment.payment_for(),
            target_id = payment.target.id(),
            enrollment_id = %record.id,
            "Enrollment applied"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use be_remote_db::{NewPayment, PaymentTarget};

    use super::*;
    use crate::store::{MemoryStore, PaymentLedger};

    async fn confirmed(store: &MemoryStore, target: PaymentTarget, user: Option<&str>) -> Payment {
        store
            .create_pending(NewPayment {
                target,
                user_id: user.map(str::to_string),
                amount: 49_900,
                currency: "INR".into(),
                receipt: "rcpt_1".into(),
                gateway_order_id: "order_abc".into(),
            })
            .await
            .unwrap();
        store
            .transition_to_success("order_abc", "pay_123", "sig")
            .await
            .unwrap()
            .into_payment()
    }

    #[tokio::test]
    async fn course_enrollment_is_a_set_union() {
        let store = MemoryStore::new();
        let applier = EnrollmentApplier::new(Arc::new(store.clone()));
        let payment = confirmed(&store, PaymentTarget::Course("C1".into()), Some("U1")).await;

        let first = applier.apply(&payment).await.unwrap();
        let second = applier.apply(&payment).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.payment_id, payment.id);
        let courses = store.purchased_courses("U1").await;
        assert_eq!(courses.len(), 1);
        assert!(courses.contains("C1"));
    }

    #[tokio::test]
    async fn concurrent_applies_take_one_seat() {
        let store = MemoryStore::new();
        let applier = EnrollmentApplier::new(Arc::new(store.clone()));
        let payment = confirmed(&store, PaymentTarget::LiveSession("LS1".into()), Some("U1")).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let applier = applier.clone();
                let payment = payment.clone();
                tokio::spawn(async move { applier.apply(&payment).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.session_seat_count("LS1").await, 1);
        assert_eq!(store.enrollment_count().await, 1);
    }

    #[tokio::test]
    async fn guest_enquiry_is_marked_paid() {
        let store = MemoryStore::new();
        let applier = EnrollmentApplier::new(Arc::new(store.clone()));
        let payment = confirmed(&store, PaymentTarget::Enquiry("E1".into()), None).await;

        let record = applier.apply(&payment).await.unwrap();

        assert!(record.user_id.is_none());
        assert!(store.is_enquiry_paid("E1").await);
    }

    #[tokio::test]
    async fn unconfirmed_payment_is_rejected() {
        let store = MemoryStore::new();
        let applier = EnrollmentApplier::new(Arc::new(store.clone()));
        let pending = store
            .create_pending(NewPayment {
                target: PaymentTarget::Course("C1".into()),
                user_id: Some("U1".into()),
                amount: 49_900,
                currency: "INR".into(),
                receipt: "rcpt_1".into(),
                gateway_order_id: "order_abc".into(),
            })
            .await
            .unwrap()
            .into_payment();

        let err = applier.apply(&pending).await.unwrap_err();

        assert!(matches!(err, EnrollmentError::NotConfirmed(_)));
        assert_eq!(store.enrollment_count().await, 0);
    }
}
