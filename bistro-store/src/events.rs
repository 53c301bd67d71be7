use async_trait::async_trait;
use bistro_core::notification::{GatewayError, NotificationGateway, NotificationMessage};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{error, info};

/// Publishes notifications to Kafka for the delivery services (mailer, SMS
/// relay) to pick up.
#[derive(Clone)]
pub struct KafkaGateway {
    producer: FutureProducer,
    topic: String,
}

impl KafkaGateway {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }

    pub async fn publish(&self, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(
                    "Sent message to {}/{}: partition {} offset {}",
                    self.topic, key, delivery.partition, delivery.offset
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", self.topic, e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl NotificationGateway for KafkaGateway {
    async fn send(&self, message: &NotificationMessage) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        // Keyed by order so a customer's messages stay in order on one partition.
        self.publish(&message.order_id.to_string(), &payload)
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))
    }
}
