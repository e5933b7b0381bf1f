use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use be_remote_db::PaymentStatus;
use tracing::info;

use crate::auth::MaybeUser;
use crate::error::PaymentError;
use crate::reconciler::{OrderRequest, WebhookOutcome};
use crate::service::AppState;
use crate::types::{
    ConfirmPaymentRequest, ConfirmPaymentResponse, ConfirmStatus, CreateOrderRequest,
    CreateOrderResponse, PurchaseStatusResponse,
};

pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-razorpay-signature";

// ---------------------------------------------------------------------------
// POST /payments/order
// ---------------------------------------------------------------------------

/// Opens a gateway order for one catalog item.
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    user: MaybeUser,
    Json(body): Json<CreateOrderRequest>,
) -> Result<Json<CreateOrderResponse>, PaymentError> {
    let request = OrderRequest {
        target: body.target(),
        user_id: user.resolve(body.user_id)?,
        amount: body.amount,
        currency: body.currency,
    };

    let payment = state.reconciler.create_order(request).await?;

    Ok(Json(CreateOrderResponse {
        gateway_order_id: payment.gateway_order_id,
        amount: payment.amount,
        currency: payment.currency,
    }))
}

// ---------------------------------------------------------------------------
// POST /payments/confirm
// ---------------------------------------------------------------------------

/// Verifies a completed checkout and grants access. A rejected signature is
/// reported in the body, not as an HTTP error.
pub async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConfirmPaymentRequest>,
) -> Result<Json<ConfirmPaymentResponse>, PaymentError> {
    if body.gateway_order_id.trim().is_empty() {
        return Err(PaymentError::MissingField("gatewayOrderId"));
    }

    let confirmation = state
        .reconciler
        .confirm_payment(
            body.gateway_order_id.trim(),
            body.gateway_payment_id.trim(),
            body.gateway_signature.trim(),
        )
        .await?;

    let status = if confirmation.succeeded() {
        ConfirmStatus::Success
    } else {
        ConfirmStatus::Failed
    };

    Ok(Json(ConfirmPaymentResponse {
        status,
        enrollment: confirmation.enrollment.map(Into::into),
    }))
}

// ---------------------------------------------------------------------------
// GET /payments/{gateway_order_id}/status
// ---------------------------------------------------------------------------

pub async fn get_purchase_status(
    State(state): State<Arc<AppState>>,
    Path(gateway_order_id): Path<String>,
) -> Result<Json<PurchaseStatusResponse>, PaymentError> {
    let payment = state.reconciler.purchase_status(&gateway_order_id).await?;

    Ok(Json(PurchaseStatusResponse {
        purchased: payment.status == PaymentStatus::Success,
        gateway_order_id: payment.gateway_order_id,
        status: payment.status,
    }))
}

// ---------------------------------------------------------------------------
// POST /payments/webhook
// ---------------------------------------------------------------------------

/// Handles provider webhook events with signature verification over the raw
/// body.
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, PaymentError> {
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(PaymentError::WebhookSignatureInvalid)?;

    let outcome = state.reconciler.handle_webhook(&body, signature).await?;
    if outcome != WebhookOutcome::Ignored {
        info!(?outcome, "Webhook processed");
    }

    Ok(StatusCode::OK)
}
