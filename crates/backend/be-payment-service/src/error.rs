use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use be_remote_db::DbError;
use serde::Serialize;

use crate::gateway::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("{0}")]
    Gateway(#[from] GatewayError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Payment not found: {0}")]
    NotFound(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl PaymentError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        PaymentError::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Short label for analytics; never carries user data.
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentError::Gateway(GatewayError::Unavailable(_)) => "gateway_unavailable",
            PaymentError::Gateway(GatewayError::Rejected { .. }) => "gateway_rejected",
            PaymentError::Unauthorized(_) => "unauthorized",
            PaymentError::NotFound(_) => "not_found",
            PaymentError::WebhookSignatureInvalid => "webhook_signature_invalid",
            PaymentError::InvalidPayload(_) => "invalid_payload",
            PaymentError::MissingField(_) | PaymentError::InvalidField { .. } => "validation",
            PaymentError::Database(_) => "database",
            PaymentError::Config(_) => "config",
            PaymentError::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PaymentError::Gateway(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            PaymentError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            PaymentError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            PaymentError::WebhookSignatureInvalid | PaymentError::InvalidPayload(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            PaymentError::MissingField(_) | PaymentError::InvalidField { .. } => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            PaymentError::Database(_) | PaymentError::Config(_) | PaymentError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %self, "Payment service error");
        } else {
            tracing::warn!(%status, error = %self, "Payment request rejected");
        }

        (status, axum::Json(ErrorBody { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                PaymentError::Gateway(GatewayError::Unavailable("timeout".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                PaymentError::Gateway(GatewayError::Rejected {
                    status: 400,
                    message: "bad amount".into(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                PaymentError::NotFound("order_x".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                PaymentError::invalid("amount", "must be positive"),
                StatusCode::BAD_REQUEST,
            ),
            (
                PaymentError::Unauthorized("mismatch".into()),
                StatusCode::UNAUTHORIZED,
            ),
            (
                PaymentError::Database(DbError::Internal("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
