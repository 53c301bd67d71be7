use async_trait::async_trait;
use bistro_shared::Masked;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

/// A rendered customer message, ready for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationMessage {
    pub order_id: Uuid,
    pub channel: Channel,
    pub template: String,
    pub recipient: Masked<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transient; worth retrying.
    #[error("notification gateway unavailable: {0}")]
    Unavailable(String),
    /// Permanent for this message (bad address, unsubscribed, ...).
    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(&self, message: &NotificationMessage) -> Result<(), GatewayError>;
}

/// Gateway that only writes the message to the log. Used when no real gateway
/// is configured.
pub struct LogGateway;

#[async_trait]
impl NotificationGateway for LogGateway {
    async fn send(&self, message: &NotificationMessage) -> Result<(), GatewayError> {
        tracing::info!(
            order_id = %message.order_id,
            channel = ?message.channel,
            template = %message.template,
            "Notification: {}",
            message.subject
        );
        Ok(())
    }
}
