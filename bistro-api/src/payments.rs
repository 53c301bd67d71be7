use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use bistro_core::payment::WebhookEvent;
use bistro_core::signature::verify_signature;
use bistro_order::{Order, OrderDraft, OrderError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::{Anyone, Authorized};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmPaymentResponse {
    pub order_id: Uuid,
    pub order: Order,
}

/// Storefront-facing payment routes. These sit behind the per-client rate limit.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payments/checkout", post(begin_checkout))
        .route("/v1/payments/confirm", post(confirm_payment))
}

/// Provider callbacks arrive in bursts from a few addresses, so they are
/// authenticated by signature rather than throttled per IP.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/v1/payments/webhook", post(handle_webhook))
}

/// POST /v1/payments/checkout
/// Open a hosted checkout session for a cart
pub async fn begin_checkout(
    State(state): State<AppState>,
    auth: Authorized<Anyone>,
    Json(draft): Json<OrderDraft>,
) -> Result<Json<CheckoutResponse>, AppError> {
    let session = state.lifecycle.begin_checkout(&auth.caller, &draft).await?;
    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

/// POST /v1/payments/confirm
/// Called by the storefront after the provider redirects back. Idempotent.
pub async fn confirm_payment(
    State(state): State<AppState>,
    _auth: Authorized<Anyone>,
    Json(req): Json<ConfirmPaymentRequest>,
) -> Result<Json<ConfirmPaymentResponse>, AppError> {
    let order = state
        .lifecycle
        .confirm_payment(&req.session_id)
        .await?
        .into_order();
    Ok(Json(ConfirmPaymentResponse {
        order_id: order.id,
        order,
    }))
}

/// POST /v1/payments/webhook
/// Signed provider callbacks. Failures that a redelivery cannot fix are
/// acknowledged so the provider stops retrying; transient ones are not.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let secret = state.webhook.secret.as_deref().ok_or_else(|| {
        warn!("Webhook received but no signing secret is configured");
        AppError::AuthenticationError("Webhook signing is not configured".to_string())
    })?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::AuthenticationError("Missing signature".to_string()))?;

    verify_signature(
        &body,
        signature,
        secret,
        state.webhook.tolerance_secs,
        chrono::Utc::now().timestamp(),
    )
    .map_err(|e| {
        warn!("Rejected webhook: {}", e);
        AppError::AuthenticationError("Invalid signature".to_string())
    })?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::ValidationError(format!("Malformed event: {}", e)))?;
    info!("Received webhook: {} ({})", event.event_type, event.id);

    match state.lifecycle.handle_payment_event(&event.classify()).await {
        Ok(_) => Ok(StatusCode::OK),
        Err(
            err @ (OrderError::PaymentMismatch { .. }
            | OrderError::PaymentIncomplete
            | OrderError::NotFound
            | OrderError::Validation(_)),
        ) => {
            warn!(event_id = %event.id, "Webhook acknowledged without an order: {}", err);
            Ok(StatusCode::OK)
        }
        Err(err) => Err(err.into()),
    }
}
