use bistro_core::payment::{
    CheckoutItemRef, CheckoutMetadata, CheckoutRequest, CheckoutSession, PaymentProvider,
    PaymentSession, ProviderLineItem, SessionPaymentStatus, DELIVERY_FEE_REFERENCE,
};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{OrderError, OrderResult};
use crate::models::{
    ContactInfo, FulfillmentMode, NewOrder, Order, OrderDraft, OrderLineItem, OrderStatus,
    PaymentMethod, PaymentStatus,
};
use crate::notifier::NotificationDispatcher;
use crate::repository::{CreateOutcome, OrderRepository};

pub const DEFAULT_AMOUNT_TOLERANCE_CENTS: i64 = 1;

/// Turns provider payment confirmations into exactly one order per payment
/// reference.
pub struct PaymentReconciler {
    repo: Arc<dyn OrderRepository>,
    provider: Arc<dyn PaymentProvider>,
    dispatcher: NotificationDispatcher,
    amount_tolerance_cents: i64,
}

impl PaymentReconciler {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        provider: Arc<dyn PaymentProvider>,
        dispatcher: NotificationDispatcher,
        amount_tolerance_cents: i64,
    ) -> Self {
        Self {
            repo,
            provider,
            dispatcher,
            amount_tolerance_cents,
        }
    }

    /// Open a hosted checkout for a cart. The cart's product identities ride
    /// along as metadata so the order can be rebuilt when payment lands.
    pub async fn begin_checkout(
        &self,
        customer_id: Option<String>,
        draft: &OrderDraft,
    ) -> OrderResult<CheckoutSession> {
        draft.line_items()?;

        let mut line_items = Vec::with_capacity(draft.items.len() + 1);
        let mut refs = Vec::with_capacity(draft.items.len());
        for (index, item) in draft.items.iter().enumerate() {
            let key = index.to_string();
            line_items.push(ProviderLineItem {
                reference: Some(key.clone()),
                name: item.name.clone(),
                quantity: item.quantity,
                unit_amount_cents: item.unit_price_cents,
            });
            refs.push(CheckoutItemRef {
                key,
                product_id: item.product_id,
                variant_id: item.variant_id,
                note: item.note.clone(),
            });
        }
        if draft.fulfillment_mode == FulfillmentMode::Delivery && draft.delivery_fee_cents > 0 {
            line_items.push(ProviderLineItem {
                reference: Some(DELIVERY_FEE_REFERENCE.to_string()),
                name: "Delivery Fee".to_string(),
                quantity: 1,
                unit_amount_cents: draft.delivery_fee_cents,
            });
        }

        let request = CheckoutRequest {
            currency: draft.currency.clone(),
            line_items,
            metadata: CheckoutMetadata {
                customer_id,
                contact_name: draft.contact.name.clone(),
                contact_email: draft.contact.email.clone(),
                contact_phone: draft.contact.phone.clone(),
                delivery_address: draft.contact.address.clone(),
                fulfillment_mode: draft.fulfillment_mode,
                delivery_fee_cents: draft.delivery_fee_cents,
                items: refs,
            },
        };

        let session = self.provider.create_checkout_session(&request).await?;
        info!(session_id = %session.id, "Checkout session created");
        Ok(session)
    }

    /// Client-side confirmation after the provider redirects back.
    pub async fn confirm(&self, reference: &str) -> OrderResult<CreateOutcome> {
        if let Some(existing) = self.repo.get_by_payment_reference(reference).await? {
            return Ok(CreateOutcome::Existing(existing));
        }

        let session = self
            .provider
            .retrieve_session(reference)
            .await?
            .ok_or(OrderError::NotFound)?;
        self.reconcile(&session).await
    }

    /// Create the order for a paid session, or return the one that already exists.
    pub async fn reconcile(&self, session: &PaymentSession) -> OrderResult<CreateOutcome> {
        if let Some(existing) = self.repo.get_by_payment_reference(&session.id).await? {
            info!(session_id = %session.id, order_id = %existing.id, "Payment already reconciled");
            return Ok(CreateOutcome::Existing(existing));
        }

        if session.payment_status != SessionPaymentStatus::Paid {
            return Err(OrderError::PaymentIncomplete);
        }

        let order = self.build_order(session)?;

        // The store resolves races between webhook redelivery and client confirmation.
        let outcome = self.repo.create_or_get_by_reference(&order).await?;
        match &outcome {
            CreateOutcome::Created(order) => {
                info!(
                    session_id = %session.id,
                    order_id = %order.id,
                    order_number = %order.order_number,
                    "Order created from payment"
                );
                self.dispatcher
                    .notify(order, OrderStatus::Pending, OrderStatus::Confirmed);
            }
            CreateOutcome::Existing(order) => {
                info!(session_id = %session.id, order_id = %order.id, "Lost creation race; returning existing order");
            }
        }
        Ok(outcome)
    }

    /// The provider gave up on a session. A pending order tied to it fails;
    /// anything else is left alone.
    pub async fn record_failure(&self, reference: &str) -> OrderResult<Option<Order>> {
        let Some(order) = self.repo.get_by_payment_reference(reference).await? else {
            info!(session_id = %reference, "Payment failure for unknown session; nothing to do");
            return Ok(None);
        };
        if order.status != OrderStatus::Pending {
            return Ok(Some(order));
        }

        let updated = self
            .repo
            .update_status(
                order.id,
                OrderStatus::Pending,
                OrderStatus::PaymentFailed,
                Some(PaymentStatus::Failed),
            )
            .await?;
        self.dispatcher
            .notify(&updated, OrderStatus::Pending, OrderStatus::PaymentFailed);
        Ok(Some(updated))
    }

    fn build_order(&self, session: &PaymentSession) -> OrderResult<Order> {
        let metadata = session.metadata.as_ref().ok_or_else(|| {
            error!(session_id = %session.id, "Paid session carries no checkout metadata");
            OrderError::Validation("payment session carries no checkout metadata".to_string())
        })?;

        let (fee_items, charged): (Vec<&ProviderLineItem>, Vec<&ProviderLineItem>) =
            session.line_items.iter().partition(|item| item.is_delivery_fee());

        let delivery_fee_cents = if fee_items.is_empty() {
            Some(metadata.delivery_fee_cents)
        } else {
            charged_cents(&fee_items)
        };
        let (subtotal_cents, delivery_fee_cents, expected_cents) =
            match (charged_cents(&charged), delivery_fee_cents) {
                (Some(subtotal), Some(fee)) => match subtotal.checked_add(fee) {
                    Some(expected) => (subtotal, fee, expected),
                    None => return Err(amounts_out_of_range(&session.id)),
                },
                _ => return Err(amounts_out_of_range(&session.id)),
            };

        if expected_cents.abs_diff(session.amount_total_cents)
            > self.amount_tolerance_cents.unsigned_abs()
        {
            error!(
                session_id = %session.id,
                expected_cents,
                paid_cents = session.amount_total_cents,
                "Payment amount does not match line items"
            );
            return Err(OrderError::PaymentMismatch {
                expected_cents,
                paid_cents: session.amount_total_cents,
            });
        }

        let items: Vec<OrderLineItem> = charged
            .iter()
            .filter_map(|item| resolve_item(&session.id, metadata, item))
            .collect();

        Order::create(
            NewOrder {
                customer_id: metadata.customer_id.clone(),
                contact: ContactInfo {
                    name: metadata.contact_name.clone(),
                    email: metadata.contact_email.clone(),
                    phone: metadata.contact_phone.clone(),
                    address: metadata.delivery_address.clone(),
                },
                fulfillment_mode: metadata.fulfillment_mode,
                payment_method: PaymentMethod::Online,
                payment_reference: Some(session.id.clone()),
                items,
                subtotal_cents,
                delivery_fee_cents,
                total_cents: expected_cents,
                currency: session.currency.clone(),
            },
            OrderStatus::Confirmed,
            PaymentStatus::Paid,
        )
    }
}

fn charged_cents(items: &[&ProviderLineItem]) -> Option<i64> {
    items
        .iter()
        .try_fold(0i64, |total, item| total.checked_add(item.amount_total_cents()?))
}

fn amounts_out_of_range(session_id: &str) -> OrderError {
    error!(session_id = %session_id, "Session line amounts overflow");
    OrderError::Validation("payment session amounts are out of range".to_string())
}

/// Map a charged provider line back to a product. Lines that cannot be
/// resolved are dropped: the customer has paid, so the order goes ahead.
fn resolve_item(
    session_id: &str,
    metadata: &CheckoutMetadata,
    item: &ProviderLineItem,
) -> Option<OrderLineItem> {
    let Some(item_ref) = item
        .reference
        .as_deref()
        .and_then(|key| metadata.find_item(key))
    else {
        warn!(session_id = %session_id, item = %item.name, "Dropping line item with unknown product reference");
        return None;
    };

    match OrderLineItem::new(
        item_ref.product_id,
        item_ref.variant_id,
        item.name.clone(),
        item.quantity,
        item.unit_amount_cents,
        item_ref.note.clone(),
    ) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!(session_id = %session_id, item = %item.name, "Dropping invalid line item: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryOrderRepository;
    use crate::models::fixtures;
    use bistro_core::payment::MockPaymentProvider;
    use bistro_shared::Masked;
    use uuid::Uuid;

    struct Harness {
        repo: Arc<InMemoryOrderRepository>,
        provider: Arc<MockPaymentProvider>,
        reconciler: Arc<PaymentReconciler>,
        rx: tokio::sync::mpsc::UnboundedReceiver<bistro_core::notification::NotificationMessage>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let provider = Arc::new(MockPaymentProvider::new());
        let (dispatcher, rx) = NotificationDispatcher::channel();
        let reconciler = Arc::new(PaymentReconciler::new(
            repo.clone(),
            provider.clone(),
            dispatcher,
            DEFAULT_AMOUNT_TOLERANCE_CENTS,
        ));
        Harness {
            repo,
            provider,
            reconciler,
            rx,
        }
    }

    /// Subtotal 24.00 over two lines plus a 3.50 delivery fee.
    fn paid_session(id: &str, amount_total_cents: i64) -> PaymentSession {
        let product = Uuid::new_v4();
        PaymentSession {
            id: id.to_string(),
            payment_status: SessionPaymentStatus::Paid,
            amount_total_cents,
            currency: "usd".to_string(),
            line_items: vec![
                ProviderLineItem {
                    reference: Some("0".to_string()),
                    name: "Margherita".to_string(),
                    quantity: 2,
                    unit_amount_cents: 900,
                },
                ProviderLineItem {
                    reference: Some("1".to_string()),
                    name: "Tiramisu".to_string(),
                    quantity: 1,
                    unit_amount_cents: 600,
                },
                ProviderLineItem {
                    reference: Some(DELIVERY_FEE_REFERENCE.to_string()),
                    name: "Delivery Fee".to_string(),
                    quantity: 1,
                    unit_amount_cents: 350,
                },
            ],
            metadata: Some(CheckoutMetadata {
                customer_id: Some("customer-1".to_string()),
                contact_name: "Ada".to_string(),
                contact_email: Some(Masked::from("ada@example.com")),
                contact_phone: None,
                delivery_address: Some("12 Analytical Way".to_string()),
                fulfillment_mode: FulfillmentMode::Delivery,
                delivery_fee_cents: 350,
                items: vec![
                    CheckoutItemRef {
                        key: "0".to_string(),
                        product_id: product,
                        variant_id: None,
                        note: Some("well done".to_string()),
                    },
                    CheckoutItemRef {
                        key: "1".to_string(),
                        product_id: Uuid::new_v4(),
                        variant_id: None,
                        note: None,
                    },
                ],
            }),
        }
    }

    #[tokio::test]
    async fn test_paid_session_creates_confirmed_order() {
        let mut h = harness();
        let outcome = h
            .reconciler
            .reconcile(&paid_session("cs_1", 2750))
            .await
            .unwrap();

        assert!(outcome.was_created());
        let order = outcome.into_order();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.payment_status, PaymentStatus::Paid);
        assert_eq!(order.subtotal_cents, 2400);
        assert_eq!(order.delivery_fee_cents, 350);
        assert_eq!(order.total_cents, 2750);
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.items[0].note.as_deref(), Some("well done"));
        assert_eq!(order.payment_reference.as_deref(), Some("cs_1"));

        let message = h.rx.try_recv().unwrap();
        assert_eq!(message.template, "order_confirmed");
    }

    #[tokio::test]
    async fn test_amount_mismatch_creates_nothing() {
        let h = harness();
        let result = h.reconciler.reconcile(&paid_session("cs_2", 2500)).await;

        assert!(matches!(
            result,
            Err(OrderError::PaymentMismatch {
                expected_cents: 2750,
                paid_cents: 2500
            })
        ));
        assert_eq!(h.repo.insert_count(), 0);
        assert!(h.repo.get_by_payment_reference("cs_2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overflowing_session_amounts_are_rejected() {
        let h = harness();
        let mut session = paid_session("cs_big", 2750);
        session.line_items[0].unit_amount_cents = i64::MAX / 2;
        session.line_items[0].quantity = 3;

        let result = h.reconciler.reconcile(&session).await;
        assert!(matches!(result, Err(OrderError::Validation(_))));
        assert_eq!(h.repo.insert_count(), 0);
    }

    #[tokio::test]
    async fn test_rounding_within_tolerance_is_accepted() {
        let h = harness();
        assert!(h.reconciler.reconcile(&paid_session("cs_3", 2749)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unresolved_item_is_dropped_not_fatal() {
        let h = harness();
        let mut session = paid_session("cs_4", 2750);
        session.line_items[1].reference = Some("missing".to_string());

        let order = h.reconciler.reconcile(&session).await.unwrap().into_order();
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].name, "Margherita");
        // Charged amount still stands.
        assert_eq!(order.total_cents, 2750);
    }

    #[tokio::test]
    async fn test_duplicate_reconcile_is_idempotent() {
        let mut h = harness();
        let session = paid_session("cs_5", 2750);

        let first = h.reconciler.reconcile(&session).await.unwrap();
        let second = h.reconciler.reconcile(&session).await.unwrap();

        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.order().id, second.order().id);
        assert_eq!(h.repo.insert_count(), 1);

        // Only the creating call notifies.
        assert!(h.rx.try_recv().is_ok());
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reconcile_creates_one_order() {
        let h = harness();
        let session = paid_session("cs_6", 2750);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let reconciler = h.reconciler.clone();
            let session = session.clone();
            tasks.spawn(async move { reconciler.reconcile(&session).await });
        }

        let mut ids = Vec::new();
        while let Some(result) = tasks.join_next().await {
            ids.push(result.unwrap().unwrap().order().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.repo.insert_count(), 1);
    }

    #[tokio::test]
    async fn test_confirm_unpaid_session() {
        let h = harness();
        let draft = fixtures::draft(FulfillmentMode::Delivery);
        let session = h.reconciler.begin_checkout(None, &draft).await.unwrap();

        let result = h.reconciler.confirm(&session.id).await;
        assert!(matches!(result, Err(OrderError::PaymentIncomplete)));

        assert!(h.provider.mark_paid(&session.id).await);
        let order = h.reconciler.confirm(&session.id).await.unwrap().into_order();
        assert_eq!(order.total_cents, draft.total_cents);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].product_id, draft.items[0].product_id);
        assert_eq!(order.items[0].note.as_deref(), Some("extra basil"));

        let again = h.reconciler.confirm(&session.id).await.unwrap();
        assert!(!again.was_created());
        assert_eq!(again.order().id, order.id);
    }

    #[tokio::test]
    async fn test_confirm_unknown_reference() {
        let h = harness();
        assert!(matches!(
            h.reconciler.confirm("cs_nope").await,
            Err(OrderError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_record_failure_on_pending_order() {
        let mut h = harness();
        let mut pending = fixtures::order(FulfillmentMode::Pickup, OrderStatus::Pending);
        pending.payment_reference = Some("cs_7".to_string());
        pending.payment_status = PaymentStatus::Unpaid;
        h.repo.create_order(&pending).await.unwrap();

        let failed = h.reconciler.record_failure("cs_7").await.unwrap().unwrap();
        assert_eq!(failed.status, OrderStatus::PaymentFailed);
        assert_eq!(failed.payment_status, PaymentStatus::Failed);
        assert_eq!(h.rx.try_recv().unwrap().template, "order_payment_failed");

        assert!(h.reconciler.record_failure("cs_unknown").await.unwrap().is_none());
    }
}
