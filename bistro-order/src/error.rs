use bistro_core::payment::PaymentError;

use crate::transitions::TransitionRejection;

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Order not found")]
    NotFound,

    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    #[error("Order was modified concurrently; re-read it before retrying")]
    Conflict,

    #[error("Order is not ready for delivery")]
    NotReady,

    #[error("Order is not a delivery order")]
    WrongMode,

    #[error("Courier already holds the maximum number of active deliveries")]
    CourierAtCapacity,

    #[error("Payment amount mismatch: expected {expected_cents}, paid {paid_cents}")]
    PaymentMismatch {
        expected_cents: i64,
        paid_cents: i64,
    },

    #[error("Payment has not completed")]
    PaymentIncomplete,

    #[error("Operation timed out")]
    Timeout,

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Storage error: {0}")]
    Store(String),
}

pub type OrderResult<T> = Result<T, OrderError>;

impl From<TransitionRejection> for OrderError {
    fn from(rejection: TransitionRejection) -> Self {
        OrderError::IllegalTransition(rejection.reason.to_string())
    }
}

impl From<PaymentError> for OrderError {
    fn from(err: PaymentError) -> Self {
        OrderError::Provider(err.to_string())
    }
}
