use async_trait::async_trait;
use bistro_core::payment::{
    CheckoutItemRef, CheckoutMetadata, CheckoutRequest, CheckoutSession, PaymentError,
    PaymentProvider, PaymentSession, ProviderLineItem, SessionPaymentStatus,
};
use bistro_core::FulfillmentMode;
use bistro_shared::Masked;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, warn};

const ITEM_KEY_PREFIX: &str = "item_";

/// Stripe Checkout client. Line items are sent as inline `price_data`; the
/// cart's product identities travel in session metadata, one key per line.
pub struct StripeProvider {
    client: reqwest::Client,
    secret_key: String,
    api_base: String,
    success_url: String,
    cancel_url: String,
}

impl StripeProvider {
    pub fn new(
        secret_key: impl Into<String>,
        api_base: impl Into<String>,
        success_url: impl Into<String>,
        cancel_url: impl Into<String>,
    ) -> Result<Self, PaymentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PaymentError::Provider(e.to_string()))?;

        Ok(Self {
            client,
            secret_key: secret_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
        })
    }

    async fn error_from(response: reqwest::Response) -> PaymentError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, "Stripe request failed: {}", body);
        PaymentError::Provider(format!("stripe returned {}", status))
    }
}

/// Form body for `POST /v1/checkout/sessions`.
fn checkout_form(request: &CheckoutRequest, success_url: &str, cancel_url: &str) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("success_url".to_string(), success_url.to_string()),
        ("cancel_url".to_string(), cancel_url.to_string()),
    ];

    for (i, item) in request.line_items.iter().enumerate() {
        let prefix = format!("line_items[{}]", i);
        form.push((format!("{prefix}[quantity]"), item.quantity.to_string()));
        form.push((format!("{prefix}[price_data][currency]"), request.currency.clone()));
        form.push((
            format!("{prefix}[price_data][unit_amount]"),
            item.unit_amount_cents.to_string(),
        ));
        form.push((format!("{prefix}[price_data][product_data][name]"), item.name.clone()));
        if let Some(reference) = &item.reference {
            form.push((
                format!("{prefix}[price_data][product_data][metadata][reference]"),
                reference.clone(),
            ));
        }
    }

    for (key, value) in metadata_pairs(&request.metadata) {
        form.push((format!("metadata[{}]", key), value));
    }
    form
}

fn metadata_pairs(metadata: &CheckoutMetadata) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("contact_name".to_string(), metadata.contact_name.clone()),
        (
            "fulfillment_mode".to_string(),
            metadata.fulfillment_mode.as_str().to_string(),
        ),
        (
            "delivery_fee_cents".to_string(),
            metadata.delivery_fee_cents.to_string(),
        ),
    ];
    let optional = [
        ("customer_id", metadata.customer_id.clone()),
        (
            "contact_email",
            metadata.contact_email.as_ref().map(|m| m.expose().clone()),
        ),
        (
            "contact_phone",
            metadata.contact_phone.as_ref().map(|m| m.expose().clone()),
        ),
        ("delivery_address", metadata.delivery_address.clone()),
    ];
    pairs.extend(
        optional
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), v))),
    );
    for item in &metadata.items {
        if let Ok(encoded) = serde_json::to_string(item) {
            pairs.push((format!("{}{}", ITEM_KEY_PREFIX, item.key), encoded));
        }
    }
    pairs
}

fn metadata_from_pairs(session_id: &str, pairs: &HashMap<String, String>) -> Option<CheckoutMetadata> {
    let contact_name = pairs.get("contact_name")?.clone();
    let fulfillment_mode = pairs
        .get("fulfillment_mode")?
        .parse::<FulfillmentMode>()
        .ok()?;

    let mut items: Vec<CheckoutItemRef> = pairs
        .iter()
        .filter(|(key, _)| key.starts_with(ITEM_KEY_PREFIX))
        .filter_map(|(key, value)| match serde_json::from_str(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(session_id = %session_id, key = %key, "Unreadable item metadata: {}", e);
                None
            }
        })
        .collect();
    items.sort_by(|a, b| a.key.cmp(&b.key));

    Some(CheckoutMetadata {
        customer_id: pairs.get("customer_id").cloned(),
        contact_name,
        contact_email: pairs.get("contact_email").cloned().map(Masked::new),
        contact_phone: pairs.get("contact_phone").cloned().map(Masked::new),
        delivery_address: pairs.get("delivery_address").cloned(),
        fulfillment_mode,
        delivery_fee_cents: pairs
            .get("delivery_fee_cents")
            .and_then(|fee| fee.parse().ok())
            .unwrap_or(0),
        items,
    })
}

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    url: Option<String>,
    payment_status: SessionPaymentStatus,
    amount_total: Option<i64>,
    currency: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    line_items: Option<StripeList<StripeLineItem>>,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeLineItem {
    #[serde(default)]
    description: Option<String>,
    quantity: Option<u32>,
    amount_total: i64,
    price: Option<StripePrice>,
}

#[derive(Debug, Deserialize)]
struct StripePrice {
    unit_amount: Option<i64>,
    product: Option<StripeProduct>,
}

#[derive(Debug, Deserialize)]
struct StripeProduct {
    name: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl StripeLineItem {
    fn into_provider_item(self) -> ProviderLineItem {
        let quantity = self.quantity.unwrap_or(1).max(1);
        let (unit_amount, product) = match self.price {
            Some(price) => (price.unit_amount, price.product),
            None => (None, None),
        };
        let (name, reference) = match product {
            Some(product) => (product.name, product.metadata.get("reference").cloned()),
            None => (None, None),
        };
        ProviderLineItem {
            reference,
            name: name.or(self.description).unwrap_or_default(),
            quantity,
            unit_amount_cents: unit_amount.unwrap_or(self.amount_total / i64::from(quantity)),
        }
    }
}

impl StripeSession {
    fn into_payment_session(self) -> PaymentSession {
        let metadata = metadata_from_pairs(&self.id, &self.metadata);
        PaymentSession {
            payment_status: self.payment_status,
            amount_total_cents: self.amount_total.unwrap_or(0),
            currency: self.currency.unwrap_or_else(|| "usd".to_string()),
            line_items: self
                .line_items
                .map(|list| {
                    list.data
                        .into_iter()
                        .map(StripeLineItem::into_provider_item)
                        .collect()
                })
                .unwrap_or_default(),
            metadata,
            id: self.id,
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&checkout_form(request, &self.success_url, &self.cancel_url))
            .send()
            .await
            .map_err(|e| PaymentError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let session: StripeSession = response
            .json()
            .await
            .map_err(|e| PaymentError::Decode(e.to_string()))?;
        Ok(CheckoutSession {
            id: session.id,
            url: session.url,
        })
    }

    async fn retrieve_session(
        &self,
        session_id: &str,
    ) -> Result<Option<PaymentSession>, PaymentError> {
        if !session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Ok(None);
        }

        let response = self
            .client
            .get(format!(
                "{}/v1/checkout/sessions/{}?expand%5B%5D=line_items.data.price.product",
                self.api_base, session_id
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| PaymentError::Provider(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let session: StripeSession = response
            .json()
            .await
            .map_err(|e| PaymentError::Decode(e.to_string()))?;
        Ok(Some(session.into_payment_session()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bistro_core::payment::DELIVERY_FEE_REFERENCE;
    use uuid::Uuid;

    fn metadata() -> CheckoutMetadata {
        CheckoutMetadata {
            customer_id: Some("customer-1".to_string()),
            contact_name: "Ada".to_string(),
            contact_email: Some(Masked::from("ada@example.com")),
            contact_phone: None,
            delivery_address: Some("12 Analytical Way".to_string()),
            fulfillment_mode: FulfillmentMode::Delivery,
            delivery_fee_cents: 350,
            items: vec![CheckoutItemRef {
                key: "0".to_string(),
                product_id: Uuid::new_v4(),
                variant_id: None,
                note: Some("no onions".to_string()),
            }],
        }
    }

    #[test]
    fn test_metadata_survives_the_round_trip() {
        let original = metadata();
        let pairs: HashMap<String, String> = metadata_pairs(&original).into_iter().collect();
        assert!(!pairs.contains_key("contact_phone"));

        let restored = metadata_from_pairs("cs_1", &pairs).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_checkout_form_fields() {
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
        let form: HashMap<String, String> = checkout_form(&request, "https://ok", "https://no")
            .into_iter()
            .collect();

        assert_eq!(form["mode"], "payment");
        assert_eq!(form["line_items[0][quantity]"], "2");
        assert_eq!(form["line_items[0][price_data][unit_amount]"], "1200");
        assert_eq!(
            form["line_items[1][price_data][product_data][metadata][reference]"],
            DELIVERY_FEE_REFERENCE
        );
        assert_eq!(form["metadata[fulfillment_mode]"], "delivery");
        assert!(form.contains_key("metadata[item_0]"));
    }

    #[test]
    fn test_expanded_session_decodes() {
        let body = r#"{
            "id": "cs_test_1",
            "url": null,
            "payment_status": "paid",
            "amount_total": 2750,
            "currency": "usd",
            "metadata": {"contact_name": "Ada", "fulfillment_mode": "pickup"},
            "line_items": {"data": [
                {"description": "Margherita", "quantity": 2, "amount_total": 2400,
                 "price": {"unit_amount": 1200, "product": {"name": "Margherita", "metadata": {"reference": "0"}}}},
                {"description": "Delivery Fee", "quantity": 1, "amount_total": 350, "price": null}
            ]}
        }"#;
        let session: StripeSession = serde_json::from_str(body).unwrap();
        let session = session.into_payment_session();

        assert_eq!(session.payment_status, SessionPaymentStatus::Paid);
        assert_eq!(session.line_items[0].reference.as_deref(), Some("0"));
        assert_eq!(session.line_items[0].unit_amount_cents, 1200);
        assert_eq!(session.line_items[1].name, "Delivery Fee");
        assert_eq!(session.line_items[1].unit_amount_cents, 350);
        assert_eq!(
            session.metadata.unwrap().fulfillment_mode,
            FulfillmentMode::Pickup
        );
    }
}
