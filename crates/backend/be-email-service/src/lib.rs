//! Outbound delivery of purchase notifications.
//!
//! The provider is any HTTP endpoint accepting
//! `POST {api_url}/v1/messages` with a bearer API key and a JSON message.
//! Retries and scheduling are the caller's concern; [`EmailService::send`]
//! makes exactly one attempt and says whether another one could help.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

mod error;

pub use error::NotifyError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

impl NotificationConfig {
    /// Returns `None` when `NOTIFICATION_API_URL` is unset, meaning
    /// notifications are only logged.
    pub fn from_env() -> Result<Option<Self>, NotifyError> {
        let Some(api_url) = std::env::var("NOTIFICATION_API_URL")
            .ok()
            .filter(|s| !s.is_empty())
        else {
            return Ok(None);
        };

        let api_key = std::env::var("NOTIFICATION_API_KEY").map_err(|_| {
            NotifyError::Config(
                "NOTIFICATION_API_KEY must be set when NOTIFICATION_API_URL is".into(),
            )
        })?;

        let from = std::env::var("NOTIFICATION_FROM")
            .unwrap_or_else(|_| "no-reply@localhost".to_string());

        Ok(Some(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            from,
        }))
    }
}

/// Who a notification goes to. A bare user id is resolved to a contact
/// address by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Recipient {
    User(String),
    Email(String),
    Phone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    CoursePurchased,
    LiveSessionBooked,
    EnquiryPaid,
    PaymentFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub template: TemplateKind,
    pub context: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(recipient: Recipient, template: TemplateKind) -> Self {
        Self {
            recipient,
            template,
            context: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    from: &'a str,
    to: &'a Recipient,
    template: TemplateKind,
    context: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EmailService {
    client: reqwest::Client,
    config: NotificationConfig,
}

impl EmailService {
    pub fn new(config: NotificationConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let url = format!("{}/v1/messages", self.config.api_url);
        let message = OutboundMessage {
            from: &self.config.from,
            to: &notification.recipient,
            template: notification.template,
            context: &notification.context,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&message)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(template = ?notification.template, "Notification accepted by provider");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
