use bistro_core::notification::{Channel, NotificationGateway, NotificationMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{Order, OrderStatus};
use crate::transitions::should_notify;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before attempt `attempt + 1` (attempts are 1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Hands customer notifications to a background worker.
///
/// `notify` never blocks and never fails: the order change it reports is
/// already committed by the time it is called.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<NotificationMessage>,
}

impl NotificationDispatcher {
    pub fn new(tx: mpsc::UnboundedSender<NotificationMessage>) -> Self {
        Self { tx }
    }

    /// Dispatcher plus the receiving end, for wiring a worker (or a test) by hand.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Start a worker delivering through `gateway` and return its dispatcher.
    pub fn spawn(
        gateway: Arc<dyn NotificationGateway>,
        policy: RetryPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (dispatcher, rx) = Self::channel();
        let worker = NotificationWorker::new(rx, gateway, policy);
        (dispatcher, tokio::spawn(worker.run()))
    }

    /// Queue the messages due for `order` moving `from → to`. Returns how many
    /// were queued.
    pub fn notify(&self, order: &Order, from: OrderStatus, to: OrderStatus) -> usize {
        if !should_notify(from, to) {
            return 0;
        }

        let mut queued = 0;
        for message in render_messages(order, to) {
            match self.tx.send(message) {
                Ok(()) => queued += 1,
                Err(_) => {
                    warn!(order_id = %order.id, "Notification worker is gone; dropping message");
                }
            }
        }
        if queued == 0 {
            debug!(order_id = %order.id, status = %to, "No contact channel configured");
        }
        queued
    }
}

fn template_for(order: &Order, status: OrderStatus) -> Option<(&'static str, String, String)> {
    let number = &order.order_number;
    let rendered = match status {
        OrderStatus::Confirmed => (
            "order_confirmed",
            format!("Order {} confirmed", number),
            format!("Thanks {}! We received your order {}.", order.contact.name, number),
        ),
        OrderStatus::Preparing => (
            "order_preparing",
            format!("Order {} is being prepared", number),
            "The kitchen has started on your order.".to_string(),
        ),
        OrderStatus::Ready if order.is_delivery() => (
            "order_ready",
            format!("Order {} is ready", number),
            "Your order is packed and waiting for a courier.".to_string(),
        ),
        OrderStatus::Ready => (
            "order_ready",
            format!("Order {} is ready for pickup", number),
            "Your order is ready. Come and collect it at the counter.".to_string(),
        ),
        OrderStatus::Delivering => (
            "order_delivering",
            format!("Order {} is on its way", number),
            "A courier has picked up your order and is heading to you.".to_string(),
        ),
        OrderStatus::Completed => (
            "order_completed",
            format!("Order {} completed", number),
            "Enjoy your meal!".to_string(),
        ),
        OrderStatus::Cancelled => (
            "order_cancelled",
            format!("Order {} cancelled", number),
            "Your order was cancelled. Contact us if this is unexpected.".to_string(),
        ),
        OrderStatus::PaymentFailed => (
            "order_payment_failed",
            format!("Payment for order {} failed", number),
            "We could not collect payment for your order.".to_string(),
        ),
        OrderStatus::Pending => return None,
    };
    Some(rendered)
}

/// One message per contact channel the order carries.
pub fn render_messages(order: &Order, status: OrderStatus) -> Vec<NotificationMessage> {
    let Some((template, subject, body)) = template_for(order, status) else {
        return Vec::new();
    };

    let channels = [
        (Channel::Email, order.contact.email.as_ref()),
        (Channel::Sms, order.contact.phone.as_ref()),
    ];
    channels
        .into_iter()
        .filter_map(|(channel, recipient)| {
            recipient.map(|recipient| NotificationMessage {
                order_id: order.id,
                channel,
                template: template.to_string(),
                recipient: recipient.clone(),
                subject: subject.clone(),
                body: body.clone(),
            })
        })
        .collect()
}

/// Drains the dispatcher queue. Each message is delivered on its own task so a
/// slow or failing channel does not hold up the others.
pub struct NotificationWorker {
    rx: mpsc::UnboundedReceiver<NotificationMessage>,
    gateway: Arc<dyn NotificationGateway>,
    policy: RetryPolicy,
}

impl NotificationWorker {
    pub fn new(
        rx: mpsc::UnboundedReceiver<NotificationMessage>,
        gateway: Arc<dyn NotificationGateway>,
        policy: RetryPolicy,
    ) -> Self {
        Self { rx, gateway, policy }
    }

    pub async fn run(mut self) {
        info!("Notification worker started");
        while let Some(message) = self.rx.recv().await {
            let gateway = self.gateway.clone();
            let policy = self.policy;
            tokio::spawn(async move {
                deliver(gateway.as_ref(), &message, policy).await;
            });
        }
        info!("Notification worker stopped");
    }
}

/// Send one message, retrying transient gateway failures. Returns whether it
/// was delivered.
pub async fn deliver(
    gateway: &dyn NotificationGateway,
    message: &NotificationMessage,
    policy: RetryPolicy,
) -> bool {
    let mut attempt = 1;
    loop {
        match gateway.send(message).await {
            Ok(()) => {
                debug!(order_id = %message.order_id, channel = ?message.channel, attempt, "Notification sent");
                return true;
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                warn!(
                    order_id = %message.order_id,
                    channel = ?message.channel,
                    attempt,
                    "Notification failed, retrying: {}",
                    e
                );
                tokio::time::sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    order_id = %message.order_id,
                    channel = ?message.channel,
                    attempt,
                    "Notification dropped: {}",
                    e
                );
                return false;
            }
        }
    }
}
