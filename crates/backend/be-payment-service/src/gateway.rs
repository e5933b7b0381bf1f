//! Order creation at the external payment provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Order as issued by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Network failure, timeout or a 5xx. Safe to retry: no payment row
    /// exists yet.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),

    /// The gateway refused the order (4xx). Retrying the same request will
    /// not help.
    #[error("Payment gateway rejected the order ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn create_order(
        &self,
        amount: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, GatewayError>;
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Client for a Razorpay-compatible orders API.
#[derive(Debug, Clone)]
pub struct RazorpayClient {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl RazorpayClient {
    pub fn new(
        base_url: &str,
        key_id: &str,
        key_secret: &str,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id: key_id.to_string(),
            key_secret: key_secret.to_string(),
        })
    }
}

#[async_trait]
impl GatewayClient for RazorpayClient {
    async fn create_order(
        &self,
        amount: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        let url = format!("{}/v1/orders", self.base_url);

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&CreateOrderBody {
                amount,
                currency,
                receipt,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Unavailable("order creation timed out".into())
                } else {
                    GatewayError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let order = response
                .json::<GatewayOrder>()
                .await
                .map_err(|e| GatewayError::Unavailable(format!("unreadable order: {e}")))?;
            debug!(gateway_order_id = %order.id, receipt, "Gateway order created");
            return Ok(order);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .and_then(|env| env.error.description.or(env.error.code))
            .unwrap_or(body);

        if status.is_client_error() {
            Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            })
        } else {
            warn!(%status, %message, "Gateway returned a server error");
            Err(GatewayError::Unavailable(format!("{status}: {message}")))
        }
    }
}

/// Stand-in gateway for fully local runs: accepts every order and invents
/// an order id.
#[derive(Debug, Default, Clone)]
pub struct LocalGateway;

#[async_trait]
impl GatewayClient for LocalGateway {
    async fn create_order(
        &self,
        amount: i64,
        currency: &str,
        _receipt: &str,
    ) -> Result<GatewayOrder, GatewayError> {
        Ok(GatewayOrder {
            id: format!("order_{}", Uuid::now_v7().simple()),
            amount,
            currency: currency.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::{Json, Router, routing::post};

    use super::*;

    async fn spawn_gateway(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str, timeout: Duration) -> RazorpayClient {
        RazorpayClient::new(base_url, "rzp_test_key", "rzp_test_secret", timeout).unwrap()
    }

    #[tokio::test]
    async fn creates_order_with_basic_auth() {
        let router = Router::new().route(
            "/v1/orders",
            post(
                |headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if !auth.starts_with("Basic ") {
                        return StatusCode::UNAUTHORIZED.into_response();
                    }
                    Json(serde_json::json!({
                        "id": "order_abc",
                        "entity": "order",
                        "amount": body["amount"],
                        "currency": body["currency"],
                        "receipt": body["receipt"],
                        "status": "created"
                    }))
                    .into_response()
                },
            ),
        );
        let url = spawn_gateway(router).await;

        let order = client(&url, Duration::from_secs(5))
            .create_order(49_900, "INR", "rcpt_1")
            .await
            .unwrap();

        assert_eq!(
            order,
            GatewayOrder {
                id: "order_abc".into(),
                amount: 49_900,
                currency: "INR".into(),
            }
        );
    }

    #[tokio::test]
    async fn client_error_is_rejected() {
        let router = Router::new().route(
            "/v1/orders",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": {
                            "code": "BAD_REQUEST_ERROR",
                            "description": "The amount must be at least INR 1.00."
                        }
                    })),
                )
            }),
        );
        let url = spawn_gateway(router).await;

        let err = client(&url, Duration::from_secs(5))
            .create_order(10, "INR", "rcpt_1")
            .await
            .unwrap_err();

        match err {
            GatewayError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "The amount must be at least INR 1.00.");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let router = Router::new().route(
            "/v1/orders",
            post(|| async { StatusCode::BAD_GATEWAY }),
        );
        let url = spawn_gateway(router).await;

        let err = client(&url, Duration::from_secs(5))
            .create_order(49_900, "INR", "rcpt_1")
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn timeout_is_unavailable() {
        let router = Router::new().route(
            "/v1/orders",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                StatusCode::OK
            }),
        );
        let url = spawn_gateway(router).await;

        let err = client(&url, Duration::from_millis(100))
            .create_order(49_900, "INR", "rcpt_1")
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Unavailable(_)));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_unavailable() {
        let err = client("http://127.0.0.1:9", Duration::from_secs(1))
            .create_order(49_900, "INR", "rcpt_1")
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }
}
