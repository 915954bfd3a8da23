//! Order read and cancel handlers.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use auth::Claims;
use signal_core::types::{Order, OrderSide, OrderStatus};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

/// Order as exposed over the API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    /// Order identifier, also the client order id sent to the broker.
    pub id: Uuid,
    /// Idempotency key of the signal that produced the order.
    pub signal_ref: String,
    pub broker_id: String,
    pub symbol: String,
    /// buy or sell.
    pub side: String,
    /// BUY, SELL or CLOSE.
    pub action: String,
    pub quantity: Decimal,
    pub reference_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    /// pending, submitted, filled, rejected, cancelled or failed.
    pub status: String,
    /// paper or live.
    pub trading_mode: String,
    /// conservative or advanced.
    pub tier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_order_id: Option<String>,
    /// Exposure held against the risk ledger while open (percent of equity).
    pub reserved_exposure_pct: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            signal_ref: order.signal_ref.to_string(),
            broker_id: order.broker_id.clone(),
            symbol: order.symbol.clone(),
            side: match order.side {
                OrderSide::Buy => "buy".to_string(),
                OrderSide::Sell => "sell".to_string(),
            },
            action: order.action.as_str().to_string(),
            quantity: order.quantity,
            reference_price: order.reference_price,
            limit_price: order.limit_price,
            status: order.status.as_str().to_string(),
            trading_mode: order.trading_mode.to_string(),
            tier: order.tier.to_string(),
            broker_order_id: order.broker_order_id.clone(),
            reserved_exposure_pct: order.reserved_exposure_pct,
            fill_price: order.fill_price,
            created_at: order.created_at,
            submitted_at: order.submitted_at,
            terminal_at: order.terminal_at,
            terminal_reason: order.terminal_reason.clone(),
        }
    }
}

/// Order list filters.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OrderQuery {
    /// Only orders in this status.
    pub status: Option<String>,
    /// Maximum rows (default 100, max 1000).
    pub limit: Option<usize>,
}

/// List orders, newest first.
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    tag = "orders",
    params(OrderQuery),
    responses(
        (status = 200, description = "Orders", body = Vec<OrderResponse>),
        (status = 400, description = "Unknown status filter"),
        (status = 401, description = "Unauthorized")
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrderQuery>,
) -> ApiResult<Json<Vec<OrderResponse>>> {
    let status = query
        .status
        .as_deref()
        .map(OrderStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let orders = state.coordinator.orders().list(status, limit).await?;
    Ok(Json(orders.iter().map(OrderResponse::from).collect()))
}

/// Get one order.
#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_id}",
    tag = "orders",
    params(("order_id" = Uuid, Path, description = "Order identifier")),
    responses(
        (status = 200, description = "Order", body = OrderResponse),
        (status = 404, description = "Order not found")
    ),
    security(("bearer_auth" = []))
)]
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderResponse>> {
    let order = state
        .coordinator
        .orders()
        .get(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("order {}", order_id)))?;
    Ok(Json(OrderResponse::from(&order)))
}

/// Cancel a Pending or Submitted order. A fill reported by the broker wins
/// over the cancel.
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_id}/cancel",
    tag = "orders",
    params(("order_id" = Uuid, Path, description = "Order identifier")),
    responses(
        (status = 200, description = "Order cancelled", body = OrderResponse),
        (status = 404, description = "Order not found"),
        (status = 409, description = "Order already filled or terminal"),
        (status = 502, description = "Broker unreachable")
    ),
    security(("bearer_auth" = []))
)]
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderResponse>> {
    let order = state.coordinator.cancel(&claims.sub, order_id).await?;
    Ok(Json(OrderResponse::from(&order)))
}
