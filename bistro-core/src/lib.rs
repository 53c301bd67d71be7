pub mod identity;
pub mod notification;
pub mod payment;
pub mod signature;

use serde::{Deserialize, Serialize};

/// How an order reaches the customer. Gates which status transitions are legal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentMode {
    Pickup,
    Delivery,
}

impl FulfillmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentMode::Pickup => "pickup",
            FulfillmentMode::Delivery => "delivery",
        }
    }
}

impl std::str::FromStr for FulfillmentMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pickup" => Ok(FulfillmentMode::Pickup),
            "delivery" => Ok(FulfillmentMode::Delivery),
            other => Err(CoreError::ValidationError(format!(
                "unknown fulfillment mode: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Identity verification failed: {0}")]
    IdentityError(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
