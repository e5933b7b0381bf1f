use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderValue;
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::PaymentError;

const DEFAULT_GATEWAY_BASE_URL: &str = "https://api.razorpay.com";
const DEFAULT_FRONTEND_URL: &str = "http://localhost:5173";
const LOCAL_SECRET: &str = "local_gateway_secret";
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Bounded exponential retry for enrollment jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempts` failures, capped at an
    /// hour.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

pub(crate) fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + TimeDelta::from_std(delay.min(MAX_RETRY_DELAY)).unwrap_or_else(|_| TimeDelta::hours(1))
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub gateway_key_id: String,
    /// Also the secret for checkout signatures.
    pub gateway_key_secret: String,
    pub gateway_webhook_secret: String,
    pub gateway_base_url: String,
    pub gateway_timeout: Duration,
    pub frontend_url: String,
    pub retry: RetryPolicy,
    pub worker_interval: Duration,
    pub sweep_interval: Duration,
}

impl PaymentConfig {
    pub fn from_env() -> Result<Self, PaymentError> {
        Self::load(false)
    }

    /// Like [`PaymentConfig::from_env`] but with placeholder gateway
    /// credentials when they are not set, for fully local runs.
    pub fn local_from_env() -> Result<Self, PaymentError> {
        Self::load(true)
    }

    fn load(local: bool) -> Result<Self, PaymentError> {
        let secret = |name: &str| -> Result<String, PaymentError> {
            match std::env::var(name).ok().filter(|v| !v.is_empty()) {
                Some(value) => Ok(value),
                None if local => Ok(LOCAL_SECRET.to_string()),
                None => Err(PaymentError::Config(format!(
                    "{name} environment variable must be set"
                ))),
            }
        };

        let gateway_key_id = secret("GATEWAY_KEY_ID")?;
        let gateway_key_secret = secret("GATEWAY_KEY_SECRET")?;
        let gateway_webhook_secret = secret("GATEWAY_WEBHOOK_SECRET")?;

        let gateway_base_url = std::env::var("GATEWAY_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_GATEWAY_BASE_URL.to_string());

        let frontend_url =
            std::env::var("FRONTEND_URL").unwrap_or_else(|_| DEFAULT_FRONTEND_URL.to_string());

        HeaderValue::from_str(&frontend_url).map_err(|e| {
            PaymentError::Config(format!(
                "FRONTEND_URL '{frontend_url}' is not a valid header value: {e}"
            ))
        })?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_var("ENROLLMENT_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay: Duration::from_secs(parse_var(
                "ENROLLMENT_RETRY_BASE_SECS",
                defaults.base_delay.as_secs(),
            )?),
        };
        if retry.max_attempts == 0 {
            return Err(PaymentError::Config(
                "ENROLLMENT_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }

        Ok(Self {
            gateway_key_id,
            gateway_key_secret,
            gateway_webhook_secret,
            gateway_base_url,
            gateway_timeout: Duration::from_secs(parse_var("GATEWAY_TIMEOUT_SECS", 10)?),
            frontend_url,
            retry,
            worker_interval: Duration::from_secs(parse_var(
                "ENROLLMENT_WORKER_INTERVAL_SECS",
                15,
            )?),
            sweep_interval: Duration::from_secs(parse_var(
                "ENROLLMENT_SWEEP_INTERVAL_SECS",
                300,
            )?),
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, PaymentError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            PaymentError::Config(format!("{name} must be a non-negative integer, got '{raw}'"))
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(30));
        assert_eq!(policy.delay_after(2), Duration::from_secs(60));
        assert_eq!(policy.delay_after(3), Duration::from_secs(120));
        assert_eq!(policy.delay_after(40), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_retry_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }
}
