use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use be_remote_db::PaymentFor;
use posthog_rs::Event;
use tracing::warn;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Turns capture on once the global PostHog client is initialized.
pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

fn capture_async(event: Event) {
    if !ENABLED.load(Ordering::Relaxed) {
        return;
    }
    tokio::spawn(async move {
        match tokio::time::timeout(CAPTURE_TIMEOUT, posthog_rs::capture(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to capture analytics event: {e}"),
            Err(_) => warn!("Analytics event capture timed out"),
        }
    });
}

pub fn track_order_created(payment_for: PaymentFor, amount: i64, currency: &str) {
    let mut event = Event::new_anon("payment_order_created");
    event.insert_prop("payment_for", payment_for.to_string()).ok();
    event.insert_prop("amount", amount).ok();
    event.insert_prop("currency", currency).ok();
    capture_async(event);
}

pub fn track_order_failed(payment_for: PaymentFor, error_kind: &str) {
    let mut event = Event::new_anon("payment_order_failed");
    event.insert_prop("payment_for", payment_for.to_string()).ok();
    event.insert_prop("error_kind", error_kind).ok();
    capture_async(event);
}

pub fn track_payment_confirmed(payment_for: PaymentFor, source: &str) {
    let mut event = Event::new_anon("payment_confirmed");
    event.insert_prop("payment_for", payment_for.to_string()).ok();
    event.insert_prop("source", source).ok();
    capture_async(event);
}

pub fn track_payment_failed(payment_for: PaymentFor, reason: &str) {
    let mut event = Event::new_anon("payment_failed");
    event.insert_prop("payment_for", payment_for.to_string()).ok();
    event.insert_prop("reason", reason).ok();
    capture_async(event);
}

pub fn track_enrollment_deferred(payment_for: PaymentFor) {
    let mut event = Event::new_anon("enrollment_deferred");
    event.insert_prop("payment_for", payment_for.to_string()).ok();
    capture_async(event);
}
