use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    /// No URL means the in-memory store.
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// No URL disables rate limiting.
    pub url: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

fn default_rate_limit() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    /// Only read when built with the `kafka` feature.
    pub brokers: Option<String>,
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: None,
            notification_topic: default_notification_topic(),
        }
    }
}

fn default_notification_topic() -> String {
    "bistro.notifications".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentsConfig {
    /// `mock` or `stripe`.
    #[serde(default = "default_provider")]
    pub provider: String,
    pub stripe_secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_success_url")]
    pub success_url: String,
    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            stripe_secret_key: None,
            webhook_secret: None,
            api_base: default_api_base(),
            success_url: default_success_url(),
            cancel_url: default_cancel_url(),
        }
    }
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_api_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_success_url() -> String {
    "http://localhost:3000/checkout/success?session_id={CHECKOUT_SESSION_ID}".to_string()
}

fn default_cancel_url() -> String {
    "http://localhost:3000/checkout/cancel".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationsConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl NotificationsConfig {
    pub fn retry_policy(&self) -> bistro_order::RetryPolicy {
        bistro_order::RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleSettings {
    #[serde(default = "default_courier_capacity")]
    pub courier_capacity: u32,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_amount_tolerance")]
    pub amount_tolerance_cents: i64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            courier_capacity: default_courier_capacity(),
            operation_timeout_ms: default_operation_timeout_ms(),
            amount_tolerance_cents: default_amount_tolerance(),
        }
    }
}

fn default_courier_capacity() -> u32 {
    bistro_order::assignment::DEFAULT_COURIER_CAPACITY
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_amount_tolerance() -> i64 {
    bistro_order::reconciler::DEFAULT_AMOUNT_TOLERANCE_CENTS
}

impl LifecycleSettings {
    pub fn to_lifecycle_config(&self) -> bistro_order::LifecycleConfig {
        bistro_order::LifecycleConfig {
            courier_capacity: self.courier_capacity,
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            amount_tolerance_cents: self.amount_tolerance_cents,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Developer overrides, never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `BISTRO__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("BISTRO").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let raw = r#"
            [server]
            port = 8080

            [auth]
            jwt_secret = "secret"
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.database.url.is_none());
        assert_eq!(config.payments.provider, "mock");
        assert_eq!(config.lifecycle.courier_capacity, 2);
        assert_eq!(config.lifecycle.amount_tolerance_cents, 1);
        assert_eq!(config.notifications.retry_policy().max_attempts, 5);
        assert_eq!(
            config.lifecycle.to_lifecycle_config().operation_timeout,
            Duration::from_secs(10)
        );
    }
}
