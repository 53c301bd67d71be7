use async_trait::async_trait;
use bistro_shared::Masked;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::FulfillmentMode;

/// Reference carried by the synthetic line item that charges the delivery fee.
pub const DELIVERY_FEE_REFERENCE: &str = "delivery_fee";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

/// A line item as the payment provider charged it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderLineItem {
    /// Key into `CheckoutMetadata::items`, or `DELIVERY_FEE_REFERENCE`.
    pub reference: Option<String>,
    pub name: String,
    pub quantity: u32,
    pub unit_amount_cents: i64,
}

impl ProviderLineItem {
    /// Unit amount times quantity, `None` on overflow.
    pub fn amount_total_cents(&self) -> Option<i64> {
        self.unit_amount_cents.checked_mul(i64::from(self.quantity))
    }

    pub fn is_delivery_fee(&self) -> bool {
        self.reference.as_deref() == Some(DELIVERY_FEE_REFERENCE)
    }
}

/// Product identity for one cart line, carried through the provider as metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutItemRef {
    pub key: String,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub note: Option<String>,
}

/// Everything needed to rebuild an order once the provider reports payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub customer_id: Option<String>,
    pub contact_name: String,
    pub contact_email: Option<Masked<String>>,
    pub contact_phone: Option<Masked<String>>,
    pub delivery_address: Option<String>,
    pub fulfillment_mode: FulfillmentMode,
    #[serde(default)]
    pub delivery_fee_cents: i64,
    #[serde(default)]
    pub items: Vec<CheckoutItemRef>,
}

impl CheckoutMetadata {
    pub fn find_item(&self, key: &str) -> Option<&CheckoutItemRef> {
        self.items.iter().find(|item| item.key == key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub currency: String,
    pub line_items: Vec<ProviderLineItem>,
    pub metadata: CheckoutMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// A checkout session as retrieved from the provider after the customer paid
/// (or failed to).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    pub id: String,
    pub payment_status: SessionPaymentStatus,
    pub amount_total_cents: i64,
    pub currency: String,
    pub line_items: Vec<ProviderLineItem>,
    pub metadata: Option<CheckoutMetadata>,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("payment provider request failed: {0}")]
    Provider(String),
    #[error("payment provider returned an unreadable response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a hosted checkout session for a cart
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError>;

    /// Retrieve a session with its line items. `None` when the provider does not know it.
    async fn retrieve_session(&self, session_id: &str)
        -> Result<Option<PaymentSession>, PaymentError>;
}

// ============================================================================
// Webhook events
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub object: WebhookObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookObject {
    pub id: String,
    #[serde(default)]
    pub payment_status: Option<String>,
}

/// What a webhook event means for the order lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    SessionPaid { session_id: String },
    SessionFailed { session_id: String },
    Ignored { event_type: String },
}

impl WebhookEvent {
    pub fn classify(&self) -> PaymentEvent {
        let session_id = self.data.object.id.clone();
        match self.event_type.as_str() {
            // Delayed payment methods complete the session before the money arrives.
            "checkout.session.completed" => match self.data.object.payment_status.as_deref() {
                Some("unpaid") => PaymentEvent::Ignored {
                    event_type: self.event_type.clone(),
                },
                _ => PaymentEvent::SessionPaid { session_id },
            },
            "checkout.session.async_payment_succeeded" => PaymentEvent::SessionPaid { session_id },
            "checkout.session.async_payment_failed" | "checkout.session.expired" => {
                PaymentEvent::SessionFailed { session_id }
            }
            other => PaymentEvent::Ignored {
                event_type: other.to_string(),
            },
        }
    }
}

// ============================================================================
// Mock provider
// ============================================================================

/// In-process provider used for local development and tests. Sessions start
/// unpaid; `mark_paid` simulates the customer finishing checkout.
#[derive(Default)]
pub struct MockPaymentProvider {
    sessions: RwLock<HashMap<String, PaymentSession>>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, session: PaymentSession) {
        self.sessions.write().await.insert(session.id.clone(), session);
    }

    pub async fn mark_paid(&self, session_id: &str) -> bool {
        match self.sessions.write().await.get_mut(session_id) {
            Some(session) => {
                session.payment_status = SessionPaymentStatus::Paid;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        let amount_total_cents = request
            .line_items
            .iter()
            .try_fold(0i64, |total, item| {
                total.checked_add(item.amount_total_cents()?)
            })
            .ok_or_else(|| PaymentError::Provider("checkout amount is out of range".to_string()))?;

        let id = format!("cs_mock_{}", Uuid::new_v4().simple());
        let session = PaymentSession {
            id: id.clone(),
            payment_status: SessionPaymentStatus::Unpaid,
            amount_total_cents,
            currency: request.currency.clone(),
            line_items: request.line_items.clone(),
            metadata: Some(request.metadata.clone()),
        };
        self.insert_session(session).await;

        Ok(CheckoutSession {
            url: Some(format!("https://checkout.mock/pay/{}", id)),
            id,
        })
    }

    async fn retrieve_session(
        &self,
        session_id: &str,
    ) -> Result<Option<PaymentSession>, PaymentError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> CheckoutMetadata {
        CheckoutMetadata {
            customer_id: None,
            contact_name: "Ada".to_string(),
            contact_email: Some(Masked::from("ada@example.com")),
            contact_phone: None,
            delivery_address: Some("1 Main St".to_string()),
            fulfillment_mode: FulfillmentMode::Delivery,
            delivery_fee_cents: 350,
            items: vec![],
        }
    }

    fn webhook(event_type: &str, payment_status: Option<&str>) -> WebhookEvent {
        let json = serde_json::json!({
            "id": "evt_1",
            "type": event_type,
            "data": { "object": { "id": "cs_1", "payment_status": payment_status } }
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_webhook_classification() {
        assert_eq!(
            webhook("checkout.session.completed", Some("paid")).classify(),
            PaymentEvent::SessionPaid { session_id: "cs_1".to_string() }
        );
        assert!(matches!(
            webhook("checkout.session.completed", Some("unpaid")).classify(),
            PaymentEvent::Ignored { .. }
        ));
        assert_eq!(
            webhook("checkout.session.expired", None).classify(),
            PaymentEvent::SessionFailed { session_id: "cs_1".to_string() }
        );
        assert!(matches!(
            webhook("customer.created", None).classify(),
            PaymentEvent::Ignored { .. }
        ));
    }

    #[tokio::test]
    async fn test_mock_provider_session_lifecycle() {
        let provider = MockPaymentProvider::new();
        let request = CheckoutRequest {
            currency: "usd".to_string(),
            line_items: vec![
                ProviderLineItem {
                    reference: Some("0".to_string()),
                    name: "Margherita".to_string(),
                    quantity: 2,
                    unit_amount_cents: 1200,
                },
                ProviderLineItem {
                    reference: Some(DELIVERY_FEE_REFERENCE.to_string()),
                    name: "Delivery Fee".to_string(),
                    quantity: 1,
                    unit_amount_cents: 350,
                },
            ],
            metadata: metadata(),
        };

        let created = provider.create_checkout_session(&request).await.unwrap();
        let session = provider.retrieve_session(&created.id).await.unwrap().unwrap();
        assert_eq!(session.payment_status, SessionPaymentStatus::Unpaid);
        assert_eq!(session.amount_total_cents, 2750);
        assert!(session.line_items[1].is_delivery_fee());

        assert!(provider.mark_paid(&created.id).await);
        let session = provider.retrieve_session(&created.id).await.unwrap().unwrap();
        assert_eq!(session.payment_status, SessionPaymentStatus::Paid);

        assert!(provider.retrieve_session("cs_unknown").await.unwrap().is_none());
    }
}
