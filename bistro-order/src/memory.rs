use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OrderError, OrderResult};
use crate::models::{Order, OrderStatus, PaymentStatus};
use crate::repository::{
    check_assignable, check_completable, CreateOutcome, OrderFilter, OrderRepository,
    ORDER_NUMBER_ATTEMPTS,
};

#[derive(Default)]
struct Inner {
    orders: HashMap<Uuid, Order>,
    by_reference: HashMap<String, Uuid>,
    order_numbers: HashSet<String>,
}

impl Inner {
    fn insert(&mut self, order: &Order) {
        if let Some(reference) = &order.payment_reference {
            self.by_reference.insert(reference.clone(), order.id);
        }
        self.order_numbers.insert(order.order_number.clone());
        self.orders.insert(order.id, order.clone());
    }

    /// Redraw `order`'s number until it is unused.
    fn claim_order_number(&self, order: &mut Order) -> OrderResult<()> {
        let mut attempts = 1;
        while self.order_numbers.contains(&order.order_number) {
            if attempts >= ORDER_NUMBER_ATTEMPTS {
                return Err(OrderError::Conflict);
            }
            order.renumber();
            attempts += 1;
        }
        Ok(())
    }

    fn by_reference(&self, reference: &str) -> Option<&Order> {
        self.by_reference
            .get(reference)
            .and_then(|id| self.orders.get(id))
    }

    fn count_delivering(&self, courier_id: &str) -> u32 {
        let count = self
            .orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::Delivering
                    && o.assigned_courier.as_deref() == Some(courier_id)
            })
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

/// A thread-safe in-memory order store.
///
/// Every mutation runs its checks and its write under one write guard, which
/// gives the same atomicity the Postgres store gets from transactions. Used for
/// tests and for running the API without a database.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    inner: RwLock<Inner>,
    inserts: AtomicUsize,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of orders actually written (not counting create-or-get hits).
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create_order(&self, order: &Order) -> OrderResult<Order> {
        let mut inner = self.inner.write().await;
        if inner.orders.contains_key(&order.id) {
            return Err(OrderError::Conflict);
        }
        if let Some(reference) = &order.payment_reference {
            if inner.by_reference.contains_key(reference) {
                return Err(OrderError::Conflict);
            }
        }
        let mut order = order.clone();
        inner.claim_order_number(&mut order)?;
        inner.insert(&order);
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(order)
    }

    async fn create_or_get_by_reference(&self, order: &Order) -> OrderResult<CreateOutcome> {
        let reference = order.payment_reference.as_deref().ok_or_else(|| {
            OrderError::Validation("order has no payment reference".to_string())
        })?;

        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.by_reference(reference) {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        let mut order = order.clone();
        inner.claim_order_number(&mut order)?;
        inner.insert(&order);
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(CreateOutcome::Created(order))
    }

    async fn get_order(&self, id: Uuid) -> OrderResult<Option<Order>> {
        Ok(self.inner.read().await.orders.get(&id).cloned())
    }

    async fn get_by_payment_reference(&self, reference: &str) -> OrderResult<Option<Order>> {
        Ok(self.inner.read().await.by_reference(reference).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
        payment_status: Option<PaymentStatus>,
    ) -> OrderResult<Order> {
        let mut inner = self.inner.write().await;
        let order = inner.orders.get_mut(&id).ok_or(OrderError::NotFound)?;
        if order.status != expected {
            return Err(OrderError::Conflict);
        }
        order.update_status(next);
        if let Some(payment_status) = payment_status {
            order.payment_status = payment_status;
        }
        Ok(order.clone())
    }

    async fn assign_courier(
        &self,
        id: Uuid,
        courier_id: &str,
        capacity: u32,
    ) -> OrderResult<Order> {
        let mut inner = self.inner.write().await;
        let (status, mode) = {
            let order = inner.orders.get(&id).ok_or(OrderError::NotFound)?;
            (order.status, order.fulfillment_mode)
        };
        check_assignable(status, mode)?;
        if inner.count_delivering(courier_id) >= capacity {
            return Err(OrderError::CourierAtCapacity);
        }

        let order = inner.orders.get_mut(&id).ok_or(OrderError::NotFound)?;
        order.assigned_courier = Some(courier_id.to_string());
        order.update_status(OrderStatus::Delivering);
        Ok(order.clone())
    }

    async fn complete_delivery(&self, id: Uuid, courier_id: &str) -> OrderResult<Order> {
        let mut inner = self.inner.write().await;
        let order = inner.orders.get_mut(&id).ok_or(OrderError::NotFound)?;
        check_completable(order.status, order.assigned_courier.as_deref(), courier_id)?;
        order.update_status(OrderStatus::Completed);
        Ok(order.clone())
    }

    async fn count_active_deliveries(&self, courier_id: &str) -> OrderResult<u32> {
        Ok(self.inner.read().await.count_delivering(courier_id))
    }

    async fn list_orders(&self, filter: &OrderFilter) -> OrderResult<Vec<Order>> {
        let inner = self.inner.read().await;
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|order| filter.matches(order))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }
}
