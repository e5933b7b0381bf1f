use async_trait::async_trait;
use be_remote_db::{
    CatalogPrice, CreateOutcome, DatabaseManager, DbResult, EnrollmentJob, EnrollmentRecord,
    NewPayment, Payment, PaymentTarget, Transition,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Catalog, EnrollmentQueue, EnrollmentStore, PaymentLedger};

#[async_trait]
impl PaymentLedger for DatabaseManager {
    async fn create_pending(&self, payment: NewPayment) -> DbResult<CreateOutcome> {
        self.create_pending_payment(payment).await
    }

    async fn get(&self, gateway_order_id: &str) -> DbResult<Option<Payment>> {
        self.get_payment_by_order(gateway_order_id).await
    }

    async fn get_by_id(&self, id: Uuid) -> DbResult<Option<Payment>> {
        self.get_payment(id).await
    }

    async fn transition_to_success(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> DbResult<Transition> {
        self.mark_payment_succeeded()
            .gateway_order_id(gateway_order_id)
            .gateway_payment_id(gateway_payment_id)
            .gateway_signature(signature)
            .call()
            .await
    }

    async fn transition_to_failed(
        &self,
        gateway_order_id: &str,
        reason: &str,
        gateway_payment_id: Option<&str>,
    ) -> DbResult<Transition> {
        self.mark_payment_failed()
            .gateway_order_id(gateway_order_id)
            .reason(reason.to_string())
            .maybe_gateway_payment_id(gateway_payment_id.map(str::to_string))
            .call()
            .await
    }

    async fn unenrolled_successes(&self, limit: i64) -> DbResult<Vec<Payment>> {
        self.list_unenrolled_payments(limit).await
    }
}

#[async_trait]
impl Catalog for DatabaseManager {
    async fn price(&self, target: &PaymentTarget) -> DbResult<Option<CatalogPrice>> {
        self.get_catalog_price(target).await
    }
}

#[async_trait]
impl EnrollmentStore for DatabaseManager {
    async fn upsert(&self, payment: &Payment) -> DbResult<EnrollmentRecord> {
        self.upsert_enrollment(payment).await
    }

    async fn find(
        &self,
        user_id: Option<&str>,
        target: &PaymentTarget,
    ) -> DbResult<Option<EnrollmentRecord>> {
        self.get_enrollment()
            .maybe_user_id(user_id)
            .target(target)
            .call()
            .await
    }
}

#[async_trait]
impl EnrollmentQueue for DatabaseManager {
    async fn enqueue(
        &self,
        payment_id: Uuid,
        due_at: DateTime<Utc>,
        error: Option<String>,
    ) -> DbResult<bool> {
        self.enqueue_enrollment_job()
            .payment_id(payment_id)
            .next_attempt_at(due_at)
            .maybe_last_error(error)
            .call()
            .await
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<EnrollmentJob>> {
        self.due_enrollment_jobs(now, limit).await
    }

    async fn get(&self, payment_id: Uuid) -> DbResult<Option<EnrollmentJob>> {
        self.get_enrollment_job(payment_id).await
    }

    async fn complete(&self, payment_id: Uuid) -> DbResult<()> {
        self.complete_enrollment_job(payment_id).await
    }

    async fn fail(
        &self,
        payment_id: Uuid,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        self.fail_enrollment_job()
            .payment_id(payment_id)
            .error(error)
            .maybe_next_attempt_at(retry_at)
            .call()
            .await
    }
}
