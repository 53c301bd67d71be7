use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use bistro_store::redis_repo::rate_limit_key;
use std::net::SocketAddr;

use crate::error::AppError;
use crate::state::AppState;

const WINDOW_SECONDS: i64 = 60;

/// Per-IP fixed window on the payment routes. Disabled without Redis; Redis
/// errors let the request through.
pub async fn limit_payments(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(redis) = state.redis.clone() else {
        return next.run(req).await;
    };

    let connect_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let client = client_ip(req.headers(), connect_ip);
    let key = rate_limit_key("payments", &client);

    match redis
        .check_rate_limit(&key, state.rate_limit.requests_per_minute, WINDOW_SECONDS)
        .await
    {
        Ok(true) => next.run(req).await,
        Ok(false) => AppError::RateLimited.into_response(),
        Err(e) => {
            tracing::warn!("Rate limiter unavailable, failing open: {}", e);
            next.run(req).await
        }
    }
}

/// First `X-Forwarded-For` hop when behind a proxy, else the socket peer.
fn client_ip(headers: &HeaderMap, connect_ip: Option<String>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or(connect_ip)
        .unwrap_or_else(|| "unknown".to_string())
}
