use bistro_shared::Masked;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::OrderError;

pub use bistro_core::FulfillmentMode;

/// Order status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Delivering,
    Completed,
    Cancelled,
    PaymentFailed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Delivering,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::PaymentFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Delivering => "delivering",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::PaymentFailed => "payment_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::PaymentFailed
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OrderError::Validation(format!("unknown order status: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpaid" => Ok(PaymentStatus::Unpaid),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(OrderError::Validation(format!("unknown payment status: {}", other))),
        }
    }
}

/// How the customer settles the bill.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Paid on pickup or to the courier; order waits in `pending` for the kitchen.
    #[default]
    Cash,
    /// Card taken in person by staff; the order is confirmed immediately.
    Card,
    /// Hosted checkout with the payment provider.
    Online,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Online => "online",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "online" => Ok(PaymentMethod::Online),
            other => Err(OrderError::Validation(format!("unknown payment method: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactInfo {
    pub name: String,
    #[serde(default)]
    pub email: Option<Masked<String>>,
    #[serde(default)]
    pub phone: Option<Masked<String>>,
    #[serde(default)]
    pub address: Option<String>,
}

/// The durable record of a customer's purchase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Option<String>,
    pub contact: ContactInfo,
    pub fulfillment_mode: FulfillmentMode,
    pub payment_method: PaymentMethod,
    pub subtotal_cents: i64,
    pub delivery_fee_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    pub payment_reference: Option<String>,
    pub payment_status: PaymentStatus,
    pub status: OrderStatus,
    pub assigned_courier: Option<String>,
    pub items: Vec<OrderLineItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `Order::create`.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer_id: Option<String>,
    pub contact: ContactInfo,
    pub fulfillment_mode: FulfillmentMode,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub items: Vec<OrderLineItem>,
    pub subtotal_cents: i64,
    pub delivery_fee_cents: i64,
    pub total_cents: i64,
    pub currency: String,
}

impl Order {
    /// Build a new order, enforcing `total = subtotal + delivery fee`.
    pub fn create(
        new: NewOrder,
        status: OrderStatus,
        payment_status: PaymentStatus,
    ) -> Result<Self, OrderError> {
        if new.subtotal_cents < 0 || new.delivery_fee_cents < 0 || new.total_cents < 0 {
            return Err(OrderError::Validation("amounts must not be negative".to_string()));
        }
        if new.subtotal_cents.checked_add(new.delivery_fee_cents) != Some(new.total_cents) {
            return Err(OrderError::Validation(format!(
                "total {} does not equal subtotal {} plus delivery fee {}",
                new.total_cents, new.subtotal_cents, new.delivery_fee_cents
            )));
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        Ok(Self {
            id,
            order_number: generate_order_number(now, &id),
            customer_id: new.customer_id,
            contact: new.contact,
            fulfillment_mode: new.fulfillment_mode,
            payment_method: new.payment_method,
            subtotal_cents: new.subtotal_cents,
            delivery_fee_cents: new.delivery_fee_cents,
            total_cents: new.total_cents,
            currency: new.currency,
            payment_reference: new.payment_reference,
            payment_status,
            status,
            assigned_courier: None,
            items: new.items,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_delivery(&self) -> bool {
        self.fulfillment_mode == FulfillmentMode::Delivery
    }

    /// Draw a new order number for the same creation second. Stores call this
    /// when the number is already taken.
    pub fn renumber(&mut self) {
        self.order_number = generate_order_number(self.created_at, &Uuid::new_v4());
    }

    /// Update order status
    pub fn update_status(&mut self, new_status: OrderStatus) {
        self.status = new_status;
        self.updated_at = Utc::now();
    }
}

/// Human-readable order number: `YYMMDD-HHMMSS-NNNN`. Sorts roughly by creation
/// time; the suffix is random, so stores renumber on a clash.
pub fn generate_order_number(now: DateTime<Utc>, id: &Uuid) -> String {
    format!("{}-{:04}", now.format("%y%m%d-%H%M%S"), id.as_u128() % 10_000)
}

/// Sum of cent amounts, `None` on overflow.
pub fn checked_sum_cents(amounts: impl IntoIterator<Item = i64>) -> Option<i64> {
    amounts
        .into_iter()
        .try_fold(0i64, |total, amount| total.checked_add(amount))
}

/// A single product line within an order. Immutable once the order exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderLineItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub line_total_cents: i64,
    pub note: Option<String>,
}

impl OrderLineItem {
    pub fn new(
        product_id: Uuid,
        variant_id: Option<Uuid>,
        name: String,
        quantity: u32,
        unit_price_cents: i64,
        note: Option<String>,
    ) -> Result<Self, OrderError> {
        if quantity == 0 {
            return Err(OrderError::Validation(format!(
                "quantity for '{}' must be at least 1",
                name
            )));
        }
        if unit_price_cents < 0 {
            return Err(OrderError::Validation(format!(
                "unit price for '{}' must not be negative",
                name
            )));
        }
        let line_total_cents = unit_price_cents
            .checked_mul(i64::from(quantity))
            .ok_or_else(|| {
                OrderError::Validation(format!("line total for '{}' is out of range", name))
            })?;
        Ok(Self {
            id: Uuid::new_v4(),
            product_id,
            variant_id,
            name,
            quantity,
            unit_price_cents,
            line_total_cents,
            note,
        })
    }
}

// ============================================================================
// Cart drafts (checkout and counter orders)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftItem {
    pub product_id: Uuid,
    #[serde(default)]
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    #[serde(default)]
    pub note: Option<String>,
}

/// A customer's cart as submitted at checkout, with client-computed totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDraft {
    pub contact: ContactInfo,
    pub fulfillment_mode: FulfillmentMode,
    #[serde(default)]
    pub payment_method: PaymentMethod,
    pub items: Vec<DraftItem>,
    pub subtotal_cents: i64,
    #[serde(default)]
    pub delivery_fee_cents: i64,
    pub total_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

impl OrderDraft {
    /// Check the draft and turn its lines into order line items.
    pub fn line_items(&self) -> Result<Vec<OrderLineItem>, OrderError> {
        if self.items.is_empty() {
            return Err(OrderError::Validation("order has no items".to_string()));
        }
        if self.contact.name.trim().is_empty() {
            return Err(OrderError::Validation("contact name is required".to_string()));
        }
        if self.fulfillment_mode == FulfillmentMode::Delivery
            && self.contact.address.as_deref().map_or(true, |a| a.trim().is_empty())
        {
            return Err(OrderError::Validation(
                "delivery orders need a delivery address".to_string(),
            ));
        }

        let items = self
            .items
            .iter()
            .map(|item| {
                OrderLineItem::new(
                    item.product_id,
                    item.variant_id,
                    item.name.clone(),
                    item.quantity,
                    item.unit_price_cents,
                    item.note.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let computed = checked_sum_cents(items.iter().map(|item| item.line_total_cents))
            .ok_or_else(|| OrderError::Validation("order subtotal is out of range".to_string()))?;
        if computed != self.subtotal_cents {
            return Err(OrderError::Validation(format!(
                "subtotal {} does not match line items {}",
                self.subtotal_cents, computed
            )));
        }
        if self.subtotal_cents.checked_add(self.delivery_fee_cents) != Some(self.total_cents) {
            return Err(OrderError::Validation(format!(
                "total {} does not equal subtotal {} plus delivery fee {}",
                self.total_cents, self.subtotal_cents, self.delivery_fee_cents
            )));
        }
        Ok(items)
    }

    pub fn into_new_order(
        self,
        customer_id: Option<String>,
        payment_reference: Option<String>,
    ) -> Result<NewOrder, OrderError> {
        let items = self.line_items()?;
        Ok(NewOrder {
            customer_id,
            contact: self.contact,
            fulfillment_mode: self.fulfillment_mode,
            payment_method: self.payment_method,
            payment_reference,
            items,
            subtotal_cents: self.subtotal_cents,
            delivery_fee_cents: self.delivery_fee_cents,
            total_cents: self.total_cents,
            currency: self.currency,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn contact() -> ContactInfo {
        ContactInfo {
            name: "Ada Lovelace".to_string(),
            email: Some(Masked::from("ada@example.com")),
            phone: Some(Masked::from("+15550100")),
            address: Some("12 Analytical Way".to_string()),
        }
    }

    pub fn new_order(mode: FulfillmentMode) -> NewOrder {
        let item = OrderLineItem::new(
            Uuid::new_v4(),
            None,
            "Margherita".to_string(),
            2,
            1200,
            None,
        )
        .unwrap();
        let fee = if mode == FulfillmentMode::Delivery { 350 } else { 0 };
        NewOrder {
            customer_id: Some("customer-1".to_string()),
            contact: contact(),
            fulfillment_mode: mode,
            payment_method: PaymentMethod::Cash,
            payment_reference: None,
            items: vec![item],
            subtotal_cents: 2400,
            delivery_fee_cents: fee,
            total_cents: 2400 + fee,
            currency: "usd".to_string(),
        }
    }

    pub fn order(mode: FulfillmentMode, status: OrderStatus) -> Order {
        Order::create(new_order(mode), status, PaymentStatus::Paid).unwrap()
    }

    pub fn draft(mode: FulfillmentMode) -> OrderDraft {
        let fee = if mode == FulfillmentMode::Delivery { 350 } else { 0 };
        OrderDraft {
            contact: contact(),
            fulfillment_mode: mode,
            payment_method: PaymentMethod::Cash,
            items: vec![DraftItem {
                product_id: Uuid::new_v4(),
                variant_id: None,
                name: "Margherita".to_string(),
                quantity: 2,
                unit_price_cents: 1200,
                note: Some("extra basil".to_string()),
            }],
            subtotal_cents: 2400,
            delivery_fee_cents: fee,
            total_cents: 2400 + fee,
            currency: "usd".to_string(),
        }
    }
}
