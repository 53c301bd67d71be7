use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{OrderError, OrderResult};
use crate::models::{FulfillmentMode, Order, OrderStatus, PaymentStatus};

/// Result of the atomic fetch-or-create keyed by payment reference.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Order),
    Existing(Order),
}

impl CreateOutcome {
    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }

    pub fn order(&self) -> &Order {
        match self {
            CreateOutcome::Created(order) | CreateOutcome::Existing(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            CreateOutcome::Created(order) | CreateOutcome::Existing(order) => order,
        }
    }
}

/// Query filter for listing orders. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub customer_id: Option<String>,
    pub statuses: Vec<OrderStatus>,
    pub fulfillment_mode: Option<FulfillmentMode>,
    pub assigned_courier: Option<String>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.customer_id
            .as_ref()
            .map_or(true, |id| order.customer_id.as_ref() == Some(id))
            && (self.statuses.is_empty() || self.statuses.contains(&order.status))
            && self
                .fulfillment_mode
                .map_or(true, |mode| order.fulfillment_mode == mode)
            && self
                .assigned_courier
                .as_ref()
                .map_or(true, |courier| order.assigned_courier.as_ref() == Some(courier))
    }
}

/// Times a store draws a fresh order number after a clash before giving up
/// with `Conflict`.
pub const ORDER_NUMBER_ATTEMPTS: u32 = 5;

/// Durable order storage. The single owner of mutable order state: every
/// mutation is conditional on the state the caller observed.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert a new order with its items. `Conflict` if its payment reference is taken.
    /// The stored order is returned: its order number differs from the input
    /// when the drawn number was already in use.
    async fn create_order(&self, order: &Order) -> OrderResult<Order>;

    /// Insert `order` unless one with the same payment reference exists, in
    /// which case the stored order is returned untouched. Order number clashes
    /// are resolved as in `create_order`.
    async fn create_or_get_by_reference(&self, order: &Order) -> OrderResult<CreateOutcome>;

    async fn get_order(&self, id: Uuid) -> OrderResult<Option<Order>>;

    async fn get_by_payment_reference(&self, reference: &str) -> OrderResult<Option<Order>>;

    /// Move the order to `next` only if its stored status is still `expected`.
    /// `NotFound` for unknown ids, `Conflict` when the status moved on.
    async fn update_status(
        &self,
        id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
        payment_status: Option<PaymentStatus>,
    ) -> OrderResult<Order>;

    /// `ready → delivering` for `courier_id`, counting the courier's live
    /// deliveries against `capacity` inside the same atomic unit as the write.
    async fn assign_courier(&self, id: Uuid, courier_id: &str, capacity: u32)
        -> OrderResult<Order>;

    /// `delivering → completed`, only for the assigned courier.
    async fn complete_delivery(&self, id: Uuid, courier_id: &str) -> OrderResult<Order>;

    async fn count_active_deliveries(&self, courier_id: &str) -> OrderResult<u32>;

    /// Orders matching `filter`, newest first.
    async fn list_orders(&self, filter: &OrderFilter) -> OrderResult<Vec<Order>>;
}

/// Preconditions for handing an order to a courier, shared by store backends.
pub fn check_assignable(status: OrderStatus, mode: FulfillmentMode) -> OrderResult<()> {
    match status {
        OrderStatus::Ready => {}
        // Somebody else got there first.
        OrderStatus::Delivering => return Err(OrderError::Conflict),
        _ => return Err(OrderError::NotReady),
    }
    if mode != FulfillmentMode::Delivery {
        return Err(OrderError::WrongMode);
    }
    Ok(())
}

/// Preconditions for a courier closing out a delivery.
pub fn check_completable(
    status: OrderStatus,
    assigned_courier: Option<&str>,
    courier_id: &str,
) -> OrderResult<()> {
    if status != OrderStatus::Delivering {
        return Err(OrderError::IllegalTransition(format!(
            "order is {}, not out for delivery",
            status
        )));
    }
    if assigned_courier != Some(courier_id) {
        return Err(OrderError::Forbidden(
            "order is assigned to another courier".to_string(),
        ));
    }
    Ok(())
}
