use bon::bon;
use chrono::{DateTime, Utc};
use sqlx::{
    migrate::MigrateDatabase,
    postgres::{PgPool, PgPoolOptions},
};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::{
    converters::target_columns,
    error::{DbError, DbResult},
    types::{
        CatalogPrice, CreateOutcome, EnrollmentJob, EnrollmentRecord, EnrollmentRow, NewPayment,
        Payment, PaymentRow, PaymentStatus, PaymentTarget, Transition,
    },
};

const PAYMENT_COLUMNS: &str = "id, payment_for, course_id, live_session_id, enquiry_id, user_id, \
     amount, currency, receipt, gateway_order_id, gateway_payment_id, gateway_signature, \
     status, failure_reason, created_at, updated_at";

const ENROLLMENT_COLUMNS: &str = "id, payment_id, user_id, payment_for, target_id, created_at";

const JOB_COLUMNS: &str =
    "payment_id, attempts, state, next_attempt_at, last_error, created_at, updated_at";

#[derive(Debug)]
pub struct DatabaseManager {
    pub pool: PgPool,
}

#[bon]
impl DatabaseManager {
    pub async fn new(database_url: &str) -> DbResult<Self> {
        if !sqlx::Postgres::database_exists(database_url).await? {
            sqlx::Postgres::create_database(database_url).await?;
        }

        let pool = PgPoolOptions::new()
            .max_connections(50)
            .min_connections(3)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        let db_manager = DatabaseManager { pool };

        Self::run_migrations(&db_manager.pool).await?;

        Ok(db_manager)
    }

    async fn run_migrations(pool: &PgPool) -> DbResult<()> {
        let migrator = sqlx::migrate!("./src/migrations");
        migrator.run(pool).await?;
        Ok(())
    }

    // ==================== Payment Ledger ====================

    /// Inserts a payment in `created` state. The gateway order id is unique,
    /// so a retried insert returns the row that is already stored.
    pub async fn create_pending_payment(&self, new: NewPayment) -> DbResult<CreateOutcome> {
        let now = Utc::now();
        let (course_id, live_session_id, enquiry_id) = target_columns(&new.target);

        let query = format!(
            r#"
            INSERT INTO payments (
                id, payment_for, course_id, live_session_id, enquiry_id, user_id,
                amount, currency, receipt, gateway_order_id, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'created', $11, $11)
            ON CONFLICT (gateway_order_id) DO NOTHING
            RETURNING {PAYMENT_COLUMNS}
            "#
        );

        let inserted = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(Uuid::now_v7())
            .bind(new.target.kind())
            .bind(course_id)
            .bind(live_session_id)
            .bind(enquiry_id)
            .bind(&new.user_id)
            .bind(new.amount)
            .bind(&new.currency)
            .bind(&new.receipt)
            .bind(&new.gateway_order_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok(CreateOutcome::Created(row.try_into()?)),
            None => {
                debug!(gateway_order_id = %new.gateway_order_id, "Payment already exists");
                let existing = self
                    .get_payment_by_order(&new.gateway_order_id)
                    .await?
                    .ok_or_else(|| DbError::not_found_with_id("payment", &new.gateway_order_id))?;
                Ok(CreateOutcome::Existing(existing))
            }
        }
    }

    pub async fn get_payment_by_order(&self, gateway_order_id: &str) -> DbResult<Option<Payment>> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE gateway_order_id = $1");

        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(gateway_order_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    pub async fn get_payment(&self, id: Uuid) -> DbResult<Option<Payment>> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");

        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    /// Compare-and-swap `created -> success`. The status filter in the
    /// `WHERE` clause makes this a single atomic conditional update, so of
    /// any number of concurrent callers at most one sees `Applied`.
    #[builder]
    pub async fn mark_payment_succeeded(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        gateway_signature: &str,
    ) -> DbResult<Transition> {
        let query = format!(
            r#"
            UPDATE payments
            SET status = 'success', gateway_payment_id = $2, gateway_signature = $3, updated_at = $4
            WHERE gateway_order_id = $1 AND status = 'created'
            RETURNING {PAYMENT_COLUMNS}
            "#
        );

        let updated = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(gateway_order_id)
            .bind(gateway_payment_id)
            .bind(gateway_signature)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;

        self.resolve_transition(gateway_order_id, updated).await
    }

    /// Compare-and-swap `created -> failed`.
    #[builder]
    pub async fn mark_payment_failed(
        &self,
        gateway_order_id: &str,
        reason: String,
        gateway_payment_id: Option<String>,
    ) -> DbResult<Transition> {
        let query = format!(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = $2,
                gateway_payment_id = COALESCE($3, gateway_payment_id), updated_at = $4
            WHERE gateway_order_id = $1 AND status = 'created'
            RETURNING {PAYMENT_COLUMNS}
            "#
        );

        let updated = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(gateway_order_id)
            .bind(&reason)
            .bind(&gateway_payment_id)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;

        self.resolve_transition(gateway_order_id, updated).await
    }

    async fn resolve_transition(
        &self,
        gateway_order_id: &str,
        updated: Option<PaymentRow>,
    ) -> DbResult<Transition> {
        if let Some(row) = updated {
            return Ok(Transition::Applied(row.try_into()?));
        }

        // The conditional update matched nothing: either the order is unknown
        // or somebody else already moved it out of `created`.
        match self.get_payment_by_order(gateway_order_id).await? {
            Some(payment) if payment.status.is_terminal() => {
                Ok(Transition::AlreadyTerminal(payment))
            }
            Some(payment) => Err(DbError::Conflict(format!(
                "payment {} still {} after conditional update",
                gateway_order_id, payment.status
            ))),
            None => Err(DbError::not_found_with_id("payment", gateway_order_id)),
        }
    }

    /// Successful payments with no enrollment for their (user, target) key.
    pub async fn list_unenrolled_payments(&self, limit: i64) -> DbResult<Vec<Payment>> {
        let query = format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payments p
            WHERE p.status = 'success'
              AND NOT EXISTS (
                SELECT 1 FROM enrollments e
                WHERE e.payment_for = p.payment_for
                  AND e.target_id = COALESCE(p.course_id, p.live_session_id, p.enquiry_id)
                  AND COALESCE(e.user_id, '') = COALESCE(p.user_id, '')
              )
            ORDER BY p.updated_at ASC
            LIMIT $1
            "#
        );

        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Payment::try_from)
            .collect()
    }

    // ==================== Catalog ====================

    pub async fn get_catalog_price(
        &self,
        target: &PaymentTarget,
    ) -> DbResult<Option<CatalogPrice>> {
        let table = match target {
            PaymentTarget::Course(_) => "courses",
            PaymentTarget::LiveSession(_) => "live_sessions",
            PaymentTarget::Enquiry(_) => "enquiries",
        };
        let query = format!("SELECT price AS amount, currency FROM {table} WHERE id = $1");

        let price = sqlx::query_as::<_, CatalogPrice>(&query)
            .bind(target.id())
            .fetch_optional(&self.pool)
            .await?;

        Ok(price)
    }

    // ==================== Enrollment ====================

    /// Grants what a successful payment bought and records the enrollment,
    /// all in one transaction. Running it again for the same (user, target)
    /// changes nothing and returns the stored enrollment.
    pub async fn upsert_enrollment(&self, payment: &Payment) -> DbResult<EnrollmentRecord> {
        if payment.status != PaymentStatus::Success {
            return Err(DbError::invalid_input(format!(
                "payment {} is {}, not success",
                payment.gateway_order_id, payment.status
            )));
        }

        let user_id = payment.user_id.as_deref();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        match (&payment.target, user_id) {
            (PaymentTarget::Course(course_id), Some(user_id)) => {
                sqlx::query(
                    r#"
                    INSERT INTO purchased_courses (user_id, course_id, payment_id, created_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (user_id, course_id) DO NOTHING
                    "#,
                )
                .bind(user_id)
                .bind(course_id)
                .bind(payment.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            (PaymentTarget::LiveSession(session_id), Some(user_id)) => {
                let seat = sqlx::query(
                    r#"
                    INSERT INTO live_session_seats (
                        live_session_id, user_id, payment_id, created_at
                    )
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (live_session_id, user_id) DO NOTHING
                    "#,
                )
                .bind(session_id)
                .bind(user_id)
                .bind(payment.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                // The counter moves only together with a newly taken seat.
                if seat.rows_affected() == 1 {
                    let counted = sqlx::query(
                        r#"
                        UPDATE live_sessions SET enrolled_count = enrolled_count + 1
                        WHERE id = $1
                        "#,
                    )
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await?;

                    if counted.rows_affected() == 0 {
                        return Err(DbError::not_found_with_id("live session", session_id));
                    }
                }
            }
            (PaymentTarget::Enquiry(enquiry_id), _) => {
                let paid = sqlx::query(
                    r#"
                    UPDATE enquiries
                    SET status = 'paid', payment_id = COALESCE(payment_id, $2), updated_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(enquiry_id)
                .bind(payment.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                if paid.rows_affected() == 0 {
                    return Err(DbError::not_found_with_id("enquiry", enquiry_id));
                }
            }
            (_, None) => {
                return Err(DbError::invalid_input(format!(
                    "{} payment {} has no user",
                    payment.payment_for(),
                    payment.gateway_order_id
                )));
            }
        }

        let insert = format!(
            r#"
            INSERT INTO enrollments (id, payment_id, user_id, payment_for, target_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT ((COALESCE(user_id, '')), payment_for, target_id) DO NOTHING
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        );

        let inserted = sqlx::query_as::<_, EnrollmentRow>(&insert)
            .bind(Uuid::now_v7())
            .bind(payment.id)
            .bind(user_id)
            .bind(payment.payment_for())
            .bind(payment.target.id())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        let row = match inserted {
            Some(row) => row,
            None => {
                let select = format!(
                    r#"
                    SELECT {ENROLLMENT_COLUMNS} FROM enrollments
                    WHERE COALESCE(user_id, '') = COALESCE($1, '')
                      AND payment_for = $2 AND target_id = $3
                    "#
                );
                sqlx::query_as::<_, EnrollmentRow>(&select)
                    .bind(user_id)
                    .bind(payment.payment_for())
                    .bind(payment.target.id())
                    .fetch_one(&mut *tx)
                    .await?
            }
        };

        tx.commit().await?;

        Ok(row.into())
    }

    #[builder]
    pub async fn get_enrollment(
        &self,
        user_id: Option<&str>,
        target: &PaymentTarget,
    ) -> DbResult<Option<EnrollmentRecord>> {
        let query = format!(
            r#"
            SELECT {ENROLLMENT_COLUMNS} FROM enrollments
            WHERE COALESCE(user_id, '') = COALESCE($1, '')
              AND payment_for = $2 AND target_id = $3
            "#
        );

        let row = sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(user_id)
            .bind(target.kind())
            .bind(target.id())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    // ==================== Enrollment Retry Queue ====================

    /// Queues a payment for another enrollment attempt. A payment that is
    /// already queued keeps its existing job and `false` is returned.
    #[builder]
    pub async fn enqueue_enrollment_job(
        &self,
        payment_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> DbResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO enrollment_jobs (
                payment_id, attempts, state, next_attempt_at, last_error, created_at, updated_at
            )
            VALUES ($1, 0, 'pending', $2, $3, $4, $4)
            ON CONFLICT (payment_id) DO NOTHING
            "#,
        )
        .bind(payment_id)
        .bind(next_attempt_at)
        .bind(&last_error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn due_enrollment_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<EnrollmentJob>> {
        let query = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM enrollment_jobs
            WHERE state = 'pending' AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC
            LIMIT $2
            "#
        );

        let jobs = sqlx::query_as::<_, EnrollmentJob>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(jobs)
    }

    pub async fn get_enrollment_job(&self, payment_id: Uuid) -> DbResult<Option<EnrollmentJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM enrollment_jobs WHERE payment_id = $1");

        let job = sqlx::query_as::<_, EnrollmentJob>(&query)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    pub async fn complete_enrollment_job(&self, payment_id: Uuid) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE enrollment_jobs
            SET state = 'done', attempts = attempts + 1, last_error = NULL, updated_at = $2
            WHERE payment_id = $1 AND state = 'pending'
            "#,
        )
        .bind(payment_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a failed attempt. The job goes back to `pending` with the
    /// given due time, or to `dead` when `next_attempt_at` is `None`.
    #[builder]
    pub async fn fail_enrollment_job(
        &self,
        payment_id: Uuid,
        error: String,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE enrollment_jobs
            SET attempts = attempts + 1,
                last_error = $2,
                state = CASE WHEN $3::timestamptz IS NULL THEN 'dead'::enrollment_job_state
                             ELSE 'pending'::enrollment_job_state END,
                next_attempt_at = COALESCE($3, next_attempt_at),
                updated_at = $4
            WHERE payment_id = $1 AND state = 'pending'
            "#,
        )
        .bind(payment_id)
        .bind(&error)
        .bind(next_attempt_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
