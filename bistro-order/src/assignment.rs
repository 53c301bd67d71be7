use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OrderError, OrderResult};
use crate::models::{FulfillmentMode, Order, OrderStatus};
use crate::notifier::NotificationDispatcher;
use crate::repository::{OrderFilter, OrderRepository};

pub const DEFAULT_COURIER_CAPACITY: u32 = 2;

/// Hands ready delivery orders to couriers without letting any courier hold
/// more than `capacity` live deliveries.
///
/// The capacity check and the write happen inside one store operation, so
/// concurrent requests for the same courier (or the same order) cannot both win.
pub struct DeliveryAssignmentManager {
    repo: Arc<dyn OrderRepository>,
    dispatcher: NotificationDispatcher,
    capacity: u32,
}

impl DeliveryAssignmentManager {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        dispatcher: NotificationDispatcher,
        capacity: u32,
    ) -> Self {
        Self {
            repo,
            dispatcher,
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// `ready → delivering` for `courier_id`.
    pub async fn assign(&self, order_id: Uuid, courier_id: &str) -> OrderResult<Order> {
        match self
            .repo
            .assign_courier(order_id, courier_id, self.capacity)
            .await
        {
            Ok(order) => {
                info!(order_id = %order.id, courier_id = %courier_id, "Courier assigned");
                self.dispatcher
                    .notify(&order, OrderStatus::Ready, OrderStatus::Delivering);
                Ok(order)
            }
            Err(OrderError::CourierAtCapacity) => {
                warn!(
                    order_id = %order_id,
                    courier_id = %courier_id,
                    capacity = self.capacity,
                    "Courier at capacity"
                );
                Err(OrderError::CourierAtCapacity)
            }
            Err(e) => Err(e),
        }
    }

    /// `delivering → completed`, only by the courier holding the order.
    pub async fn complete(&self, order_id: Uuid, courier_id: &str) -> OrderResult<Order> {
        let order = self.repo.complete_delivery(order_id, courier_id).await?;
        info!(order_id = %order.id, courier_id = %courier_id, "Delivery completed");
        self.dispatcher
            .notify(&order, OrderStatus::Delivering, OrderStatus::Completed);
        Ok(order)
    }

    /// Delivery orders waiting for or out with a courier, newest first.
    pub async fn active_deliveries(&self) -> OrderResult<Vec<Order>> {
        self.repo
            .list_orders(&OrderFilter {
                statuses: vec![OrderStatus::Ready, OrderStatus::Delivering],
                fulfillment_mode: Some(FulfillmentMode::Delivery),
                ..Default::default()
            })
            .await
    }

    pub async fn load(&self, courier_id: &str) -> OrderResult<u32> {
        self.repo.count_active_deliveries(courier_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryOrderRepository;
    use crate::models::fixtures;
    use tokio::task::JoinSet;

    fn manager() -> (Arc<InMemoryOrderRepository>, Arc<DeliveryAssignmentManager>) {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let (dispatcher, _rx) = NotificationDispatcher::channel();
        let manager = DeliveryAssignmentManager::new(
            repo.clone(),
            dispatcher,
            DEFAULT_COURIER_CAPACITY,
        );
        (repo, Arc::new(manager))
    }

    async fn ready_order(repo: &InMemoryOrderRepository) -> Order {
        let order = fixtures::order(FulfillmentMode::Delivery, OrderStatus::Ready);
        repo.create_order(&order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_assign_and_complete() {
        let (repo, manager) = manager();
        let order = ready_order(&repo).await;

        let assigned = manager.assign(order.id, "courier-1").await.unwrap();
        assert_eq!(assigned.status, OrderStatus::Delivering);
        assert_eq!(assigned.assigned_courier.as_deref(), Some("courier-1"));
        assert_eq!(manager.load("courier-1").await.unwrap(), 1);

        let done = manager.complete(order.id, "courier-1").await.unwrap();
        assert_eq!(done.status, OrderStatus::Completed);
        assert_eq!(manager.load("courier-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let (repo, manager) = manager();
        for _ in 0..2 {
            let order = ready_order(&repo).await;
            manager.assign(order.id, "courier-1").await.unwrap();
        }

        let third = ready_order(&repo).await;
        assert!(matches!(
            manager.assign(third.id, "courier-1").await,
            Err(OrderError::CourierAtCapacity)
        ));

        let untouched = repo.get_order(third.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, OrderStatus::Ready);
        assert!(untouched.assigned_courier.is_none());

        // Another courier can still take it.
        assert!(manager.assign(third.id, "courier-2").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_assigns_respect_capacity() {
        let (repo, manager) = manager();
        let held = ready_order(&repo).await;
        manager.assign(held.id, "courier-1").await.unwrap();

        let mut tasks = JoinSet::new();
        for _ in 0..6 {
            let order = ready_order(&repo).await;
            let manager = manager.clone();
            tasks.spawn(async move { manager.assign(order.id, "courier-1").await });
        }

        let mut won = 0;
        let mut at_capacity = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => won += 1,
                Err(OrderError::CourierAtCapacity) => at_capacity += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(at_capacity, 5);
        assert_eq!(manager.load("courier-1").await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_couriers_race_for_one_order() {
        let (repo, manager) = manager();
        let order = ready_order(&repo).await;

        let id = order.id;
        let mut tasks = JoinSet::new();
        for courier in ["courier-a", "courier-b"] {
            let manager = manager.clone();
            tasks.spawn(async move { manager.assign(id, courier).await });
        }

        let mut winners = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(order) => winners.push(order.assigned_courier),
                Err(e) => assert!(matches!(e, OrderError::Conflict), "got {e}"),
            }
        }
        assert_eq!(winners.len(), 1);

        let stored = repo.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_courier, winners[0]);
    }

    #[tokio::test]
    async fn test_assign_preconditions() {
        let (repo, manager) = manager();
        let pickup = fixtures::order(FulfillmentMode::Pickup, OrderStatus::Ready);
        let preparing = fixtures::order(FulfillmentMode::Delivery, OrderStatus::Preparing);
        repo.create_order(&pickup).await.unwrap();
        repo.create_order(&preparing).await.unwrap();

        assert!(matches!(
            manager.assign(pickup.id, "courier-1").await,
            Err(OrderError::WrongMode)
        ));
        assert!(matches!(
            manager.assign(preparing.id, "courier-1").await,
            Err(OrderError::NotReady)
        ));
        assert!(matches!(
            manager.assign(Uuid::new_v4(), "courier-1").await,
            Err(OrderError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_only_assigned_courier_completes() {
        let (repo, manager) = manager();
        let order = ready_order(&repo).await;
        manager.assign(order.id, "courier-1").await.unwrap();

        assert!(matches!(
            manager.complete(order.id, "courier-2").await,
            Err(OrderError::Forbidden(_))
        ));
        let stored = repo.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Delivering);
    }

    #[tokio::test]
    async fn test_active_deliveries_lists_ready_and_delivering() {
        let (repo, manager) = manager();
        let waiting = ready_order(&repo).await;
        let out = ready_order(&repo).await;
        manager.assign(out.id, "courier-1").await.unwrap();
        repo.create_order(&fixtures::order(FulfillmentMode::Pickup, OrderStatus::Ready))
            .await
            .unwrap();
        repo.create_order(&fixtures::order(FulfillmentMode::Delivery, OrderStatus::Completed))
            .await
            .unwrap();

        let active = manager.active_deliveries().await.unwrap();
        let ids: Vec<Uuid> = active.iter().map(|o| o.id).collect();
        assert_eq!(active.len(), 2);
        assert!(ids.contains(&waiting.id));
        assert!(ids.contains(&out.id));
    }
}
