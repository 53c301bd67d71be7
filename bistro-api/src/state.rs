use bistro_order::OrderLifecycle;
use bistro_store::RedisClient;
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct WebhookConfig {
    /// Without a signing secret every webhook is refused.
    pub secret: Option<String>,
    pub tolerance_secs: i64,
}

#[derive(Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: i64,
}

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<OrderLifecycle>,
    pub redis: Option<Arc<RedisClient>>,
    pub auth: AuthConfig,
    pub webhook: WebhookConfig,
    pub rate_limit: RateLimitConfig,
}
