//! Storage ports used by the reconciler.
//!
//! `DatabaseManager` implements all of them against Postgres; [`MemoryStore`]
//! implements them in process for tests and fully local runs. Every status
//! change goes through a compare-and-swap so the ports can be shared by any
//! number of concurrent callers without outside locking.

use async_trait::async_trait;
use be_remote_db::{
    CatalogPrice, CreateOutcome, DbResult, EnrollmentJob, EnrollmentRecord, NewPayment, Payment,
    PaymentTarget, Transition,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;

#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Idempotent on `gateway_order_id`.
    async fn create_pending(&self, payment: NewPayment) -> DbResult<CreateOutcome>;

    async fn get(&self, gateway_order_id: &str) -> DbResult<Option<Payment>>;

    async fn get_by_id(&self, id: Uuid) -> DbResult<Option<Payment>>;

    /// `created -> success`, applied only if the stored status is `created`.
    async fn transition_to_success(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> DbResult<Transition>;

    /// `created -> failed`, applied only if the stored status is `created`.
    async fn transition_to_failed(
        &self,
        gateway_order_id: &str,
        reason: &str,
        gateway_payment_id: Option<&str>,
    ) -> DbResult<Transition>;

    /// Successful payments whose (user, target) has no enrollment yet.
    async fn unenrolled_successes(&self, limit: i64) -> DbResult<Vec<Payment>>;
}

/// Read-only price lookup owned by the catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn price(&self, target: &PaymentTarget) -> DbResult<Option<CatalogPrice>>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Grants access for a successful payment. Upsert keyed on
    /// (user, target, kind): a second call returns the first record.
    async fn upsert(&self, payment: &Payment) -> DbResult<EnrollmentRecord>;

    async fn find(
        &self,
        user_id: Option<&str>,
        target: &PaymentTarget,
    ) -> DbResult<Option<EnrollmentRecord>>;
}

/// Durable queue of payments whose enrollment must be retried.
#[async_trait]
pub trait EnrollmentQueue: Send + Sync {
    /// Returns `false` without touching the existing job when the payment
    /// is already queued, whatever that job's state.
    async fn enqueue(
        &self,
        payment_id: Uuid,
        due_at: DateTime<Utc>,
        error: Option<String>,
    ) -> DbResult<bool>;

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<EnrollmentJob>>;

    async fn get(&self, payment_id: Uuid) -> DbResult<Option<EnrollmentJob>>;

    async fn complete(&self, payment_id: Uuid) -> DbResult<()>;

    /// Records a failed attempt; `retry_at: None` buries the job.
    async fn fail(
        &self,
        payment_id: Uuid,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> DbResult<()>;
}
