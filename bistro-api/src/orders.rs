use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use bistro_core::identity::Role;
use bistro_order::{ListScope, Order, OrderDraft, OrderStatus};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::{Anyone, Authorized, CourierOrAdmin, SignedIn};
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ListOrdersQuery {
    #[serde(default)]
    pub mine: bool,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub courier_id: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/orders", get(list_orders).post(place_order))
        .route("/v1/orders/active", get(active_deliveries))
        .route("/v1/orders/{id}", get(get_order).patch(update_status))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/orders
/// Counter order paid in cash (or by card, entered by staff)
pub async fn place_order(
    State(state): State<AppState>,
    auth: Authorized<Anyone>,
    Json(draft): Json<OrderDraft>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let order = state.lifecycle.place_order(&auth.caller, draft).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /v1/orders?mine=true | ?admin=true
pub async fn list_orders(
    State(state): State<AppState>,
    auth: Authorized<SignedIn>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    let scope = if query.admin && !query.mine {
        ListScope::All
    } else {
        ListScope::Mine
    };
    let orders = state.lifecycle.list_orders(&auth.caller, scope).await?;
    Ok(Json(orders))
}

/// GET /v1/orders/active
/// Delivery orders waiting for or out with a courier
pub async fn active_deliveries(
    State(state): State<AppState>,
    _auth: Authorized<CourierOrAdmin>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.lifecycle.active_deliveries().await?))
}

/// GET /v1/orders/{id}
pub async fn get_order(
    State(state): State<AppState>,
    auth: Authorized<SignedIn>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.lifecycle.get_order(&auth.caller, id).await?))
}

/// PATCH /v1/orders/{id}
/// Staff drive any legal transition; couriers pick up and drop off.
pub async fn update_status(
    State(state): State<AppState>,
    auth: Authorized<CourierOrAdmin>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<Order>, AppError> {
    let order = match auth.caller.role {
        Role::Admin => {
            state
                .lifecycle
                .admin_transition(id, req.status, req.courier_id.as_deref())
                .await?
        }
        _ => {
            state
                .lifecycle
                .courier_transition(&auth.caller, id, req.status)
                .await?
        }
    };
    Ok(Json(order))
}
