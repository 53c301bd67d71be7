use anyhow::Context;
use bistro_api::{
    app,
    state::{AppState, AuthConfig, RateLimitConfig, WebhookConfig},
};
use bistro_core::notification::NotificationGateway;
use bistro_core::payment::{MockPaymentProvider, PaymentProvider};
use bistro_core::signature::DEFAULT_TOLERANCE_SECS;
use bistro_order::{InMemoryOrderRepository, NotificationDispatcher, OrderLifecycle, OrderRepository};
use bistro_store::app_config::Config;
use bistro_store::{DbClient, PgOrderRepository, RedisClient, StripeProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bistro_api=debug,bistro_order=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Bistro API on port {}", config.server.port);

    // Order store
    let repo: Arc<dyn OrderRepository> = match &config.database.url {
        Some(url) => {
            let db = DbClient::new(url, config.database.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            db.ping().await.context("Postgres is not answering")?;
            db.migrate().await.context("Failed to run migrations")?;
            Arc::new(PgOrderRepository::new(db.pool.clone()))
        }
        None => {
            tracing::warn!("No database configured; orders are kept in memory");
            Arc::new(InMemoryOrderRepository::new())
        }
    };

    // Payment provider
    let provider: Arc<dyn PaymentProvider> = match config.payments.provider.as_str() {
        "stripe" => {
            let key = config
                .payments
                .stripe_secret_key
                .clone()
                .context("payments.stripe_secret_key is required for the stripe provider")?;
            Arc::new(StripeProvider::new(
                key,
                config.payments.api_base.clone(),
                config.payments.success_url.clone(),
                config.payments.cancel_url.clone(),
            )?)
        }
        _ => {
            tracing::warn!("Using the mock payment provider");
            Arc::new(MockPaymentProvider::new())
        }
    };

    // Notifications
    let gateway = notification_gateway(&config)?;
    let (dispatcher, _worker) =
        NotificationDispatcher::spawn(gateway, config.notifications.retry_policy());

    // Redis (rate limiting only)
    let redis = match &config.redis.url {
        Some(url) => Some(Arc::new(
            RedisClient::new(url).await.context("Failed to open Redis client")?,
        )),
        None => None,
    };

    let lifecycle = OrderLifecycle::new(
        repo,
        provider,
        dispatcher,
        config.lifecycle.to_lifecycle_config(),
    );

    let app_state = AppState {
        lifecycle: Arc::new(lifecycle),
        redis,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
        webhook: WebhookConfig {
            secret: config.payments.webhook_secret.clone(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        },
        rate_limit: RateLimitConfig {
            requests_per_minute: config.redis.rate_limit_per_minute,
        },
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(feature = "kafka")]
fn notification_gateway(config: &Config) -> anyhow::Result<Arc<dyn NotificationGateway>> {
    match &config.kafka.brokers {
        Some(brokers) => {
            let gateway = bistro_store::KafkaGateway::new(brokers, config.kafka.notification_topic.clone())
                .context("Failed to create Kafka producer")?;
            Ok(Arc::new(gateway))
        }
        None => Ok(Arc::new(bistro_core::notification::LogGateway)),
    }
}

#[cfg(not(feature = "kafka"))]
fn notification_gateway(config: &Config) -> anyhow::Result<Arc<dyn NotificationGateway>> {
    if config.kafka.brokers.is_some() {
        tracing::warn!("kafka.brokers is set but this build has no Kafka support; logging notifications instead");
    }
    Ok(Arc::new(bistro_core::notification::LogGateway))
}
