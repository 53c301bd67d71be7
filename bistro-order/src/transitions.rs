use crate::models::{FulfillmentMode, OrderStatus};

pub const REASON_ILLEGAL: &str = "illegal transition for this fulfillment mode";
pub const REASON_DELIVERY_ONLY: &str = "delivery-only transition";
pub const REASON_PICKUP_ONLY: &str = "pickup-only transition";

/// Outcome of a legal status request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Requested status equals the current one: nothing to write, nobody to notify.
    NoOp,
    Change { from: OrderStatus, to: OrderStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot move order from {from} to {to}: {reason}")]
pub struct TransitionRejection {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub reason: &'static str,
}

/// Decide whether `from → to` is allowed for an order fulfilled via `mode`.
pub fn validate_transition(
    from: OrderStatus,
    to: OrderStatus,
    mode: FulfillmentMode,
) -> Result<Transition, TransitionRejection> {
    use FulfillmentMode::{Delivery, Pickup};
    use OrderStatus::*;

    if from == to {
        return Ok(Transition::NoOp);
    }

    let reject = |reason| TransitionRejection { from, to, reason };

    match (from, to, mode) {
        (Pending, Confirmed, _)
        | (Confirmed, Preparing, _)
        | (Preparing, Ready, _)
        | (Pending | Confirmed | Preparing, Cancelled, _)
        | (Pending, PaymentFailed, _)
        | (Ready, Delivering, Delivery)
        | (Delivering, Completed, Delivery)
        | (Ready, Completed, Pickup) => Ok(Transition::Change { from, to }),
        (Ready, Delivering, Pickup) | (Delivering, Completed, Pickup) => {
            Err(reject(REASON_DELIVERY_ONLY))
        }
        (Ready, Completed, Delivery) => Err(reject(REASON_PICKUP_ONLY)),
        _ => Err(reject(REASON_ILLEGAL)),
    }
}

/// Whether the customer hears about an order reaching `to` from `from`.
pub fn should_notify(from: OrderStatus, to: OrderStatus) -> bool {
    from != to
        && matches!(
            to,
            OrderStatus::Confirmed
                | OrderStatus::Preparing
                | OrderStatus::Ready
                | OrderStatus::Delivering
                | OrderStatus::Completed
                | OrderStatus::Cancelled
                | OrderStatus::PaymentFailed
        )
}
