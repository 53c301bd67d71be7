use bistro_core::identity::{Caller, Role};
use bistro_core::payment::{CheckoutSession, PaymentEvent, PaymentProvider};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assignment::{DeliveryAssignmentManager, DEFAULT_COURIER_CAPACITY};
use crate::error::{OrderError, OrderResult};
use crate::models::{Order, OrderDraft, OrderStatus, PaymentMethod, PaymentStatus};
use crate::notifier::NotificationDispatcher;
use crate::reconciler::{PaymentReconciler, DEFAULT_AMOUNT_TOLERANCE_CENTS};
use crate::repository::{CreateOutcome, OrderFilter, OrderRepository};
use crate::transitions::{validate_transition, Transition};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub courier_capacity: u32,
    pub operation_timeout: Duration,
    pub amount_tolerance_cents: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            courier_capacity: DEFAULT_COURIER_CAPACITY,
            operation_timeout: Duration::from_secs(10),
            amount_tolerance_cents: DEFAULT_AMOUNT_TOLERANCE_CENTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    /// The caller's own orders (couriers: the orders they hold).
    Mine,
    /// Every order. Admin only.
    All,
}

/// Entry point for every order operation the API exposes.
pub struct OrderLifecycle {
    repo: Arc<dyn OrderRepository>,
    reconciler: PaymentReconciler,
    assignments: DeliveryAssignmentManager,
    dispatcher: NotificationDispatcher,
    config: LifecycleConfig,
}

impl OrderLifecycle {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        provider: Arc<dyn PaymentProvider>,
        dispatcher: NotificationDispatcher,
        config: LifecycleConfig,
    ) -> Self {
        let reconciler = PaymentReconciler::new(
            repo.clone(),
            provider,
            dispatcher.clone(),
            config.amount_tolerance_cents,
        );
        let assignments =
            DeliveryAssignmentManager::new(repo.clone(), dispatcher.clone(), config.courier_capacity);
        Self {
            repo,
            reconciler,
            assignments,
            dispatcher,
            config,
        }
    }

    pub fn repository(&self) -> &Arc<dyn OrderRepository> {
        &self.repo
    }

    /// Counter orders: cash is collected on hand-over, card is keyed in by staff.
    pub async fn place_order(&self, caller: &Caller, draft: OrderDraft) -> OrderResult<Order> {
        let (status, payment_status) = match draft.payment_method {
            PaymentMethod::Cash => (OrderStatus::Pending, PaymentStatus::Unpaid),
            PaymentMethod::Card if caller.is_admin() => {
                (OrderStatus::Confirmed, PaymentStatus::Paid)
            }
            PaymentMethod::Card => {
                return Err(OrderError::Forbidden(
                    "card orders are entered by staff".to_string(),
                ))
            }
            PaymentMethod::Online => {
                return Err(OrderError::Validation(
                    "online payments go through checkout".to_string(),
                ))
            }
        };

        let customer_id = match caller.role {
            Role::Customer => caller.subject().map(str::to_string),
            _ => None,
        };
        let order = Order::create(draft.into_new_order(customer_id, None)?, status, payment_status)?;
        let order = self.repo.create_order(&order).await?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            method = order.payment_method.as_str(),
            "Order placed"
        );
        self.dispatcher.notify(&order, OrderStatus::Pending, order.status);
        Ok(order)
    }

    pub async fn begin_checkout(
        &self,
        caller: &Caller,
        draft: &OrderDraft,
    ) -> OrderResult<CheckoutSession> {
        let customer_id = caller.subject().map(str::to_string);
        self.bounded(self.reconciler.begin_checkout(customer_id, draft))
            .await
    }

    pub async fn confirm_payment(&self, reference: &str) -> OrderResult<CreateOutcome> {
        self.bounded(self.reconciler.confirm(reference)).await
    }

    /// Apply a verified provider event. Returns the affected order, if any.
    pub async fn handle_payment_event(&self, event: &PaymentEvent) -> OrderResult<Option<Order>> {
        match event {
            PaymentEvent::SessionPaid { session_id } => {
                let outcome = self.bounded(self.reconciler.confirm(session_id)).await?;
                Ok(Some(outcome.into_order()))
            }
            PaymentEvent::SessionFailed { session_id } => {
                self.bounded(self.reconciler.record_failure(session_id))
                    .await
            }
            PaymentEvent::Ignored { event_type } => {
                debug!(event_type = %event_type, "Ignoring payment event");
                Ok(None)
            }
        }
    }

    /// Staff move an order along. Handing it to a courier goes through the
    /// assignment manager so capacity still holds.
    pub async fn admin_transition(
        &self,
        id: Uuid,
        to: OrderStatus,
        courier_id: Option<&str>,
    ) -> OrderResult<Order> {
        let order = self.load(id).await?;
        let from = match validate_transition(order.status, to, order.fulfillment_mode)? {
            Transition::NoOp => return Ok(order),
            Transition::Change { from, .. } => from,
        };

        if to == OrderStatus::Delivering {
            let courier_id = courier_id.ok_or_else(|| {
                OrderError::Validation("courier_id is required to start a delivery".to_string())
            })?;
            return self.bounded(self.assignments.assign(id, courier_id)).await;
        }

        let payment_status = (to == OrderStatus::PaymentFailed).then_some(PaymentStatus::Failed);
        let updated = self.repo.update_status(id, from, to, payment_status).await?;
        info!(order_id = %id, from = %from, to = %to, "Order status changed");
        self.dispatcher.notify(&updated, from, to);
        Ok(updated)
    }

    /// Couriers may only pick up and drop off delivery orders.
    pub async fn courier_transition(
        &self,
        caller: &Caller,
        id: Uuid,
        to: OrderStatus,
    ) -> OrderResult<Order> {
        if !matches!(to, OrderStatus::Delivering | OrderStatus::Completed) {
            return Err(OrderError::Forbidden(format!(
                "couriers cannot move orders to {}",
                to
            )));
        }
        let courier_id = caller.subject().ok_or(OrderError::Unauthorized)?;

        let order = self.load(id).await?;
        if let Some(holder) = order.assigned_courier.as_deref() {
            if holder != courier_id {
                return Err(OrderError::Forbidden(
                    "order is assigned to another courier".to_string(),
                ));
            }
        }

        if validate_transition(order.status, to, order.fulfillment_mode)? == Transition::NoOp {
            return Ok(order);
        }
        if !order.is_delivery() {
            return Err(OrderError::WrongMode);
        }

        match to {
            OrderStatus::Delivering => {
                self.bounded(self.assignments.assign(id, courier_id))
                    .await
            }
            _ => {
                self.bounded(self.assignments.complete(id, courier_id))
                    .await
            }
        }
    }

    /// Fetch an order the caller is allowed to see. Anything else reads as
    /// missing so order ids cannot be probed.
    pub async fn get_order(&self, caller: &Caller, id: Uuid) -> OrderResult<Order> {
        let order = self.load(id).await?;
        let visible = match caller.role {
            Role::Admin => true,
            Role::Customer => {
                caller.subject().is_some() && order.customer_id.as_deref() == caller.subject()
            }
            Role::Courier => {
                order.is_delivery()
                    && (order.status == OrderStatus::Ready
                        || (caller.subject().is_some()
                            && order.assigned_courier.as_deref() == caller.subject()))
            }
            Role::Guest => false,
        };
        if visible {
            Ok(order)
        } else {
            Err(OrderError::NotFound)
        }
    }

    pub async fn list_orders(&self, caller: &Caller, scope: ListScope) -> OrderResult<Vec<Order>> {
        let subject = caller.subject().ok_or(OrderError::Unauthorized)?;
        let filter = match scope {
            ListScope::All if caller.is_admin() => OrderFilter::default(),
            ListScope::All => {
                return Err(OrderError::Forbidden("listing all orders is admin only".to_string()))
            }
            ListScope::Mine if caller.role == Role::Courier => OrderFilter {
                assigned_courier: Some(subject.to_string()),
                ..Default::default()
            },
            ListScope::Mine => OrderFilter {
                customer_id: Some(subject.to_string()),
                ..Default::default()
            },
        };
        self.repo.list_orders(&filter).await
    }

    pub async fn active_deliveries(&self) -> OrderResult<Vec<Order>> {
        self.assignments.active_deliveries().await
    }

    async fn load(&self, id: Uuid) -> OrderResult<Order> {
        self.repo.get_order(id).await?.ok_or(OrderError::NotFound)
    }

    async fn bounded<T>(&self, operation: impl Future<Output = OrderResult<T>>) -> OrderResult<T> {
        match tokio::time::timeout(self.config.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.config.operation_timeout, "Order operation timed out");
                Err(OrderError::Timeout)
            }
        }
    }
}
