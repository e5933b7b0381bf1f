//! Background repair of enrollments that did not apply on the request path.
//!
//! Two loops share one task: the queue consumer retries payments the
//! reconciler queued, and the sweep finds successful payments that have no
//! enrollment at all.

use std::sync::Arc;
use std::time::Duration;

use be_remote_db::{DbResult, EnrollmentJob};
use bon::bon;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::applier::{EnrollmentApplier, EnrollmentError};
use crate::config::{RetryPolicy, due_after};
use crate::store::{EnrollmentQueue, EnrollmentStore, PaymentLedger};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub rescheduled: usize,
    pub buried: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.completed + self.rescheduled + self.buried == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub repaired: usize,
    /// Payments that got a new retry job. Payments already queued, including
    /// dead jobs, are not counted.
    pub queued: usize,
}

pub struct EnrollmentWorker {
    ledger: Arc<dyn PaymentLedger>,
    queue: Arc<dyn EnrollmentQueue>,
    applier: EnrollmentApplier,
    retry: RetryPolicy,
    interval: Duration,
    sweep_interval: Duration,
    batch_size: i64,
}

#[bon]
impl EnrollmentWorker {
    #[builder]
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        queue: Arc<dyn EnrollmentQueue>,
        enrollments: Arc<dyn EnrollmentStore>,
        #[builder(default)] retry: RetryPolicy,
        #[builder(default = Duration::from_secs(15))] interval: Duration,
        #[builder(default = Duration::from_secs(300))] sweep_interval: Duration,
        #[builder(default = 50)] batch_size: i64,
    ) -> Self {
        Self {
            ledger,
            queue,
            applier: EnrollmentApplier::new(enrollments),
            retry,
            interval,
            sweep_interval,
            batch_size,
        }
    }

    /// Retries every job due at `now`.
    pub async fn drain_due(&self, now: DateTime<Utc>) -> DbResult<DrainReport> {
        let mut report = DrainReport::default();

        for job in self.queue.due(now, self.batch_size).await? {
            let Some(payment) = self.ledger.get_by_id(job.payment_id).await? else {
                error!(payment_id = %job.payment_id, "Queued enrollment has no payment");
                self.queue
                    .fail(job.payment_id, "payment not found".into(), None)
                    .await?;
                report.buried += 1;
                continue;
            };

            match self.applier.apply(&payment).await {
                Ok(_) => {
                    self.queue.complete(job.payment_id).await?;
                    report.completed += 1;
                }
                Err(e) => {
                    if self.reschedule(&job, &e, now).await? {
                        report.rescheduled += 1;
                    } else {
                        error!(
                            gateway_order_id = %payment.gateway_order_id,
                            attempts = job.attempts + 1,
                            error = %e,
                            "Enrollment abandoned, needs manual reconciliation"
                        );
                        report.buried += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Records a failed attempt. Returns `false` when the job was buried.
    async fn reschedule(
        &self,
        job: &EnrollmentJob,
        cause: &EnrollmentError,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let attempts = u32::try_from(job.attempts).unwrap_or_default() + 1;
        // Only errors that can clear up on their own are worth another try.
        let retry_at = match cause {
            EnrollmentError::NotConfirmed(_) => None,
            EnrollmentError::Store(e) if !e.is_transient() => None,
            EnrollmentError::Store(_) if self.retry.exhausted(attempts) => None,
            EnrollmentError::Store(_) => Some(due_after(now, self.retry.delay_after(attempts))),
        };

        if let Some(at) = retry_at {
            warn!(
                payment_id = %job.payment_id,
                attempts,
                retry_at = %at,
                error = %cause,
                "Enrollment retry failed"
            );
        }
        self.queue
            .fail(job.payment_id, cause.to_string(), retry_at)
            .await?;
        Ok(retry_at.is_some())
    }

    /// Applies enrollment for successful payments that have none. Payments
    /// that still fail are put on the retry queue.
    pub async fn sweep(&self) -> DbResult<SweepReport> {
        let mut report = SweepReport::default();

        for payment in self.ledger.unenrolled_successes(self.batch_size).await? {
            match self.applier.apply(&payment).await {
                Ok(_) => {
                    info!(
                        gateway_order_id = %payment.gateway_order_id,
                        "Sweep repaired enrollment"
                    );
                    report.repaired += 1;
                }
                Err(e) => {
                    warn!(
                        gateway_order_id = %payment.gateway_order_id,
                        error = %e,
                        "Sweep could not apply enrollment"
                    );
                    let queued = self
                        .queue
                        .enqueue(
                            payment.id,
                            due_after(Utc::now(), self.retry.base_delay),
                            Some(e.to_string()),
                        )
                        .await?;
                    if queued {
                        report.queued += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Runs both loops until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let mut drain_tick = tokio::time::interval(self.interval);
        let mut sweep_tick = tokio::time::interval(self.sweep_interval);
        drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval = ?self.interval,
            sweep_interval = ?self.sweep_interval,
            "Enrollment worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Enrollment worker stopping");
                    break;
                }
                _ = drain_tick.tick() => match self.drain_due(Utc::now()).await {
                    Ok(report) if !report.is_empty() => info!(?report, "Drained enrollment queue"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Enrollment queue drain failed"),
                },
                _ = sweep_tick.tick() => match self.sweep().await {
                    Ok(report) => debug!(?report, "Enrollment sweep finished"),
                    Err(e) => error!(error = %e, "Enrollment sweep failed"),
                },
            }
        }
    }
}
