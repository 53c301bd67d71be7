use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bistro_order::OrderError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    RateLimited,
    Order(OrderError),
    Anyhow(anyhow::Error),
}

impl AppError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation", msg),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Rate limit exceeded".to_string(),
            ),
            AppError::Order(err) => order_parts(err),
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                internal()
            }
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "Internal Server Error".to_string(),
    )
}

fn order_parts(err: OrderError) -> (StatusCode, &'static str, String) {
    let message = err.to_string();
    match err {
        OrderError::Validation(_) => (StatusCode::BAD_REQUEST, "validation", message),
        OrderError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", message),
        OrderError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden", message),
        OrderError::NotFound => (StatusCode::NOT_FOUND, "not_found", message),
        OrderError::IllegalTransition(_) => (StatusCode::CONFLICT, "illegal_transition", message),
        OrderError::Conflict => (StatusCode::CONFLICT, "conflict", message),
        OrderError::NotReady => (StatusCode::CONFLICT, "not_ready", message),
        OrderError::WrongMode => (StatusCode::CONFLICT, "wrong_mode", message),
        OrderError::CourierAtCapacity => (StatusCode::CONFLICT, "courier_at_capacity", message),
        OrderError::PaymentMismatch { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "payment_mismatch", message)
        }
        OrderError::PaymentIncomplete => (StatusCode::PAYMENT_REQUIRED, "payment_incomplete", message),
        OrderError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout", message),
        OrderError::Provider(detail) => {
            tracing::error!("Payment provider failure: {}", detail);
            (
                StatusCode::BAD_GATEWAY,
                "provider_error",
                "Payment provider unavailable".to_string(),
            )
        }
        OrderError::Store(detail) => {
            tracing::error!("Store failure: {}", detail);
            internal()
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, error_message) = self.parts();

        let body = Json(json!({
            "error": error_message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        Self::Order(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Anyhow(err)
    }
}
