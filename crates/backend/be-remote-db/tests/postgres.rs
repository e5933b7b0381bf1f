//! Ledger and enrollment SQL against a real Postgres.
//!
//! All tests require REMOTE_DATABASE_URL to be set and are marked with #[ignore].
//! Run with: cargo test --package be-remote-db --test postgres -- --ignored

use std::sync::Arc;

use be_remote_db::{
    CreateOutcome, DatabaseManager, EnrollmentJobState, NewPayment, Payment, PaymentStatus,
    PaymentTarget, Transition,
};
use uuid::Uuid;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn database() -> Arc<DatabaseManager> {
    dotenv::dotenv().ok();
    let url = std::env::var("REMOTE_DATABASE_URL").expect("REMOTE_DATABASE_URL must be set");
    Arc::new(
        DatabaseManager::new(&url)
            .await
            .expect("connect and migrate REMOTE_DATABASE_URL"),
    )
}

/// Payments are never deleted, so every run works on fresh ids.
fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7().simple())
}

fn new_payment(target: PaymentTarget, user_id: Option<&str>, order: &str) -> NewPayment {
    NewPayment {
        target,
        user_id: user_id.map(str::to_string),
        amount: 49_900,
        currency: "INR".into(),
        receipt: unique("rcpt"),
        gateway_order_id: order.to_string(),
    }
}

async fn settled(
    db: &DatabaseManager,
    target: PaymentTarget,
    user_id: Option<&str>,
) -> Payment {
    let order = unique("order");
    db.create_pending_payment(new_payment(target, user_id, &order))
        .await
        .expect("insert payment");
    db.mark_payment_succeeded()
        .gateway_order_id(&order)
        .gateway_payment_id("pay_1")
        .gateway_signature("sig")
        .call()
        .await
        .expect("settle payment")
        .into_payment()
}

#[tokio::test]
#[ignore]
async fn create_pending_returns_stored_row_on_repeat() -> TestResult {
    let db = database().await;
    let order = unique("order");
    let target = PaymentTarget::Course(unique("course"));

    let first = db
        .create_pending_payment(new_payment(target.clone(), Some("U1"), &order))
        .await?;
    let second = db
        .create_pending_payment(new_payment(target, Some("U1"), &order))
        .await?;

    assert!(matches!(first, CreateOutcome::Created(_)));
    assert!(second.is_duplicate());
    assert_eq!(first.payment().id, second.payment().id);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn concurrent_success_transitions_apply_once() -> TestResult {
    let db = database().await;
    let order = unique("order");
    db.create_pending_payment(new_payment(
        PaymentTarget::Course(unique("course")),
        Some("U1"),
        &order,
    ))
    .await?;

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let db = db.clone();
            let order = order.clone();
            tokio::spawn(async move {
                db.mark_payment_succeeded()
                    .gateway_order_id(&order)
                    .gateway_payment_id(&format!("pay_{i}"))
                    .gateway_signature("sig")
                    .call()
                    .await
            })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        if handle.await??.is_applied() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    let failed = db
        .mark_payment_failed()
        .gateway_order_id(&order)
        .reason("bad_signature".to_string())
        .call()
        .await?;
    assert!(matches!(failed, Transition::AlreadyTerminal(_)));
    assert_eq!(failed.payment().status, PaymentStatus::Success);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn transition_on_unknown_order_is_not_found() -> TestResult {
    let db = database().await;

    let err = db
        .mark_payment_succeeded()
        .gateway_order_id(&unique("order"))
        .gateway_payment_id("pay_1")
        .gateway_signature("sig")
        .call()
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn concurrent_upserts_take_one_seat() -> TestResult {
    let db = database().await;
    let session_id = unique("ls");
    sqlx::query("INSERT INTO live_sessions (id, title, price, currency) VALUES ($1, $2, $3, $4)")
        .bind(&session_id)
        .bind("Live Q&A")
        .bind(49_900_i64)
        .bind("INR")
        .execute(&db.pool)
        .await?;
    let payment = settled(&db, PaymentTarget::LiveSession(session_id.clone()), Some("U1")).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            let payment = payment.clone();
            tokio::spawn(async move { db.upsert_enrollment(&payment).await })
        })
        .collect();

    let mut records = Vec::new();
    for handle in handles {
        records.push(handle.await??);
    }
    assert!(records.iter().all(|r| r.id == records[0].id));

    let (enrolled,): (i32,) =
        sqlx::query_as("SELECT enrolled_count FROM live_sessions WHERE id = $1")
            .bind(&session_id)
            .fetch_one(&db.pool)
            .await?;
    assert_eq!(enrolled, 1);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn missing_enquiry_records_no_enrollment() -> TestResult {
    let db = database().await;
    let target = PaymentTarget::Enquiry(unique("enquiry"));
    let payment = settled(&db, target.clone(), None).await;

    let err = db.upsert_enrollment(&payment).await.unwrap_err();
    assert!(err.is_not_found());

    let record = db.get_enrollment().target(&target).call().await?;
    assert!(record.is_none());
    Ok(())
}

#[tokio::test]
#[ignore]
async fn enqueue_keeps_the_existing_job() -> TestResult {
    let db = database().await;
    let payment = settled(&db, PaymentTarget::Course(unique("course")), Some("U1")).await;
    let now = chrono::Utc::now();

    let inserted = db
        .enqueue_enrollment_job()
        .payment_id(payment.id)
        .next_attempt_at(now)
        .call()
        .await?;
    db.fail_enrollment_job()
        .payment_id(payment.id)
        .error("gave up".to_string())
        .call()
        .await?;
    let again = db
        .enqueue_enrollment_job()
        .payment_id(payment.id)
        .next_attempt_at(now)
        .call()
        .await?;

    assert!(inserted);
    assert!(!again);
    let job = db.get_enrollment_job(payment.id).await?.expect("job row");
    assert_eq!(job.state, EnrollmentJobState::Dead);
    assert_eq!(job.attempts, 1);
    Ok(())
}
