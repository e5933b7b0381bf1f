use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use be_remote_db::{
    CatalogPrice, CreateOutcome, DbError, DbResult, EnrollmentJob, EnrollmentJobState,
    EnrollmentRecord, NewPayment, Payment, PaymentFor, PaymentStatus, PaymentTarget, Transition,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Catalog, EnrollmentQueue, EnrollmentStore, PaymentLedger};

type EnrollmentKey = (String, PaymentFor, String);

fn enrollment_key(user_id: Option<&str>, target: &PaymentTarget) -> EnrollmentKey {
    (
        user_id.unwrap_or_default().to_string(),
        target.kind(),
        target.id().to_string(),
    )
}

#[derive(Default)]
struct State {
    payments: HashMap<String, Payment>,
    enrollments: HashMap<EnrollmentKey, EnrollmentRecord>,
    purchased_courses: HashMap<String, HashSet<String>>,
    session_seats: HashMap<String, HashSet<String>>,
    session_counts: HashMap<String, i64>,
    paid_enquiries: HashMap<String, Uuid>,
    jobs: HashMap<Uuid, EnrollmentJob>,
    catalog: HashMap<PaymentTarget, CatalogPrice>,
}

/// A thread-safe in-memory implementation of every storage port.
///
/// All state sits behind one `RwLock`, so each compare-and-swap runs under
/// the write lock and is atomic with respect to every other operation.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists an item in the catalog.
    pub async fn add_catalog_item(&self, target: PaymentTarget, amount: i64, currency: &str) {
        self.state.write().await.catalog.insert(
            target,
            CatalogPrice {
                amount,
                currency: currency.to_string(),
            },
        );
    }

    pub async fn purchased_courses(&self, user_id: &str) -> HashSet<String> {
        self.state
            .read()
            .await
            .purchased_courses
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn session_seat_count(&self, live_session_id: &str) -> i64 {
        self.state
            .read()
            .await
            .session_counts
            .get(live_session_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn is_enquiry_paid(&self, enquiry_id: &str) -> bool {
        self.state
            .read()
            .await
            .paid_enquiries
            .contains_key(enquiry_id)
    }

    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    pub async fn enrollment_count(&self) -> usize {
        self.state.read().await.enrollments.len()
    }
}

fn cas(
    state: &mut State,
    gateway_order_id: &str,
    next: PaymentStatus,
    apply: impl FnOnce(&mut Payment),
) -> DbResult<Transition> {
    let payment = state
        .payments
        .get_mut(gateway_order_id)
        .ok_or_else(|| DbError::not_found_with_id("payment", gateway_order_id))?;

    if !payment.status.can_transition_to(next) {
        return Ok(Transition::AlreadyTerminal(payment.clone()));
    }

    payment.status = next;
    payment.updated_at = Utc::now();
    apply(payment);
    Ok(Transition::Applied(payment.clone()))
}

#[async_trait]
impl PaymentLedger for MemoryStore {
    async fn create_pending(&self, new: NewPayment) -> DbResult<CreateOutcome> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.payments.get(&new.gateway_order_id) {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }

        let now = Utc::now();
        let payment = Payment {
            id: Uuid::now_v7(),
            target: new.target,
            user_id: new.user_id,
            amount: new.amount,
            currency: new.currency,
            receipt: new.receipt,
            gateway_order_id: new.gateway_order_id,
            gateway_payment_id: None,
            gateway_signature: None,
            status: PaymentStatus::Created,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        state
            .payments
            .insert(payment.gateway_order_id.clone(), payment.clone());

        Ok(CreateOutcome::Created(payment))
    }

    async fn get(&self, gateway_order_id: &str) -> DbResult<Option<Payment>> {
        Ok(self.state.read().await.payments.get(gateway_order_id).cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> DbResult<Option<Payment>> {
        Ok(self
            .state
            .read()
            .await
            .payments
            .values()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn transition_to_success(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> DbResult<Transition> {
        let mut state = self.state.write().await;
        cas(&mut state, gateway_order_id, PaymentStatus::Success, |p| {
            p.gateway_payment_id = Some(gateway_payment_id.to_string());
            p.gateway_signature = Some(signature.to_string());
        })
    }

    async fn transition_to_failed(
        &self,
        gateway_order_id: &str,
        reason: &str,
        gateway_payment_id: Option<&str>,
    ) -> DbResult<Transition> {
        let mut state = self.state.write().await;
        cas(&mut state, gateway_order_id, PaymentStatus::Failed, |p| {
            p.failure_reason = Some(reason.to_string());
            if let Some(id) = gateway_payment_id {
                p.gateway_payment_id = Some(id.to_string());
            }
        })
    }

    async fn unenrolled_successes(&self, limit: i64) -> DbResult<Vec<Payment>> {
        let state = self.state.read().await;
        let mut gaps: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Success)
            .filter(|p| {
                !state
                    .enrollments
                    .contains_key(&enrollment_key(p.user_id.as_deref(), &p.target))
            })
            .cloned()
            .collect();
        gaps.sort_by_key(|p| p.updated_at);
        gaps.truncate(limit.max(0) as usize);
        Ok(gaps)
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn price(&self, target: &PaymentTarget) -> DbResult<Option<CatalogPrice>> {
        Ok(self.state.read().await.catalog.get(target).cloned())
    }
}

#[async_trait]
impl EnrollmentStore for MemoryStore {
    async fn upsert(&self, payment: &Payment) -> DbResult<EnrollmentRecord> {
        if payment.status != PaymentStatus::Success {
            return Err(DbError::invalid_input(format!(
                "payment {} is {}, not success",
                payment.gateway_order_id, payment.status
            )));
        }

        let mut state = self.state.write().await;
        let user_id = payment.user_id.as_deref();

        match (&payment.target, user_id) {
            (PaymentTarget::Course(course_id), Some(user_id)) => {
                state
                    .purchased_courses
                    .entry(user_id.to_string())
                    .or_default()
                    .insert(course_id.clone());
            }
            (PaymentTarget::LiveSession(session_id), Some(user_id)) => {
                let newly_seated = state
                    .session_seats
                    .entry(session_id.clone())
                    .or_default()
                    .insert(user_id.to_string());
                if newly_seated {
                    *state.session_counts.entry(session_id.clone()).or_default() += 1;
                }
            }
            (PaymentTarget::Enquiry(enquiry_id), _) => {
                state
                    .paid_enquiries
                    .entry(enquiry_id.clone())
                    .or_insert(payment.id);
            }
            (_, None) => {
                return Err(DbError::invalid_input(format!(
                    "{} payment {} has no user",
                    payment.payment_for(),
                    payment.gateway_order_id
                )));
            }
        }

        let record = state
            .enrollments
            .entry(enrollment_key(user_id, &payment.target))
            .or_insert_with(|| EnrollmentRecord {
                id: Uuid::now_v7(),
                payment_id: payment.id,
                user_id: payment.user_id.clone(),
                target: payment.target.clone(),
                created_at: Utc::now(),
            });

        Ok(record.clone())
    }

    async fn find(
        &self,
        user_id: Option<&str>,
        target: &PaymentTarget,
    ) -> DbResult<Option<EnrollmentRecord>> {
        Ok(self
            .state
            .read()
            .await
            .enrollments
            .get(&enrollment_key(user_id, target))
            .cloned())
    }
}

#[async_trait]
impl EnrollmentQueue for MemoryStore {
    async fn enqueue(
        &self,
        payment_id: Uuid,
        due_at: DateTime<Utc>,
        error: Option<String>,
    ) -> DbResult<bool> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&payment_id) {
            return Ok(false);
        }
        state.jobs.insert(
            payment_id,
            EnrollmentJob {
                payment_id,
                attempts: 0,
                state: EnrollmentJobState::Pending,
                next_attempt_at: due_at,
                last_error: error,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<EnrollmentJob>> {
        let state = self.state.read().await;
        let mut due: Vec<EnrollmentJob> = state
            .jobs
            .values()
            .filter(|j| j.state == EnrollmentJobState::Pending && j.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_attempt_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn get(&self, payment_id: Uuid) -> DbResult<Option<EnrollmentJob>> {
        Ok(self.state.read().await.jobs.get(&payment_id).cloned())
    }

    async fn complete(&self, payment_id: Uuid) -> DbResult<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.get_mut(&payment_id)
            && job.state == EnrollmentJobState::Pending
        {
            job.state = EnrollmentJobState::Done;
            job.attempts += 1;
            job.last_error = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail(
        &self,
        payment_id: Uuid,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.get_mut(&payment_id)
            && job.state == EnrollmentJobState::Pending
        {
            job.attempts += 1;
            job.last_error = Some(error);
            job.updated_at = Utc::now();
            match retry_at {
                Some(at) => job.next_attempt_at = at,
                None => job.state = EnrollmentJobState::Dead,
            }
        }
        Ok(())
    }
}
