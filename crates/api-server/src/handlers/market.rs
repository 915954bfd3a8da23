//! Market price book used by the slippage guard.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use utoipa::ToSchema;

use auth::Claims;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const MAX_QUOTES_PER_REQUEST: usize = 500;

#[derive(Debug, Deserialize, ToSchema)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: Decimal,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PriceUpdateRequest {
    pub prices: Vec<PriceQuote>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ObservedPriceResponse {
    pub symbol: String,
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Record market prices.
#[utoipa::path(
    post,
    path = "/api/v1/market/prices",
    tag = "market",
    request_body = PriceUpdateRequest,
    responses(
        (status = 200, description = "Price book after the update", body = Vec<ObservedPriceResponse>),
        (status = 422, description = "Invalid quote")
    ),
    security(("bearer_auth" = []))
)]
pub async fn record_prices(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<PriceUpdateRequest>,
) -> ApiResult<Json<Vec<ObservedPriceResponse>>> {
    if request.prices.len() > MAX_QUOTES_PER_REQUEST {
        return Err(ApiError::Validation(format!(
            "at most {} quotes per request",
            MAX_QUOTES_PER_REQUEST
        )));
    }

    let mut quotes = Vec::with_capacity(request.prices.len());
    for quote in request.prices {
        let symbol = quote.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(ApiError::Validation("symbol must not be empty".to_string()));
        }
        if quote.price <= Decimal::ZERO {
            return Err(ApiError::Validation(format!(
                "price for {} must be positive",
                symbol
            )));
        }
        quotes.push((symbol, quote.price));
    }

    for (symbol, price) in &quotes {
        state.risk.observe_price(symbol, *price);
    }
    debug!(operator = %claims.sub, count = quotes.len(), "Market prices recorded");

    Ok(price_book(&state))
}

/// Latest observed price per symbol.
#[utoipa::path(
    get,
    path = "/api/v1/market/prices",
    tag = "market",
    responses((status = 200, description = "Price book", body = Vec<ObservedPriceResponse>)),
    security(("bearer_auth" = []))
)]
pub async fn list_prices(State(state): State<Arc<AppState>>) -> Json<Vec<ObservedPriceResponse>> {
    price_book(&state)
}

fn price_book(state: &AppState) -> Json<Vec<ObservedPriceResponse>> {
    let mut prices: Vec<ObservedPriceResponse> = state
        .risk
        .prices()
        .into_iter()
        .map(|(symbol, observed)| ObservedPriceResponse {
            symbol,
            price: observed.price,
            observed_at: observed.observed_at,
        })
        .collect();
    prices.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    Json(prices)
}
