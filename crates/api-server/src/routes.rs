//! API route definitions.

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::handlers::{audit, health, market, mode, orders, risk, signals};
use crate::middleware::{require_admin, require_auth, require_operator};
use crate::state::AppState;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Signal Gate API",
        version = "1.0.0",
        description = "Signal ingestion, mode control and audited order execution"
    ),
    paths(
        health::health_check,
        health::readiness,
        signals::webhook_signal,
        signals::bot_signal,
        signals::manual_signal,
        mode::get_mode,
        mode::pause,
        mode::resume,
        mode::force_conservative,
        mode::unlock_advanced,
        mode::switch_live,
        mode::switch_paper,
        mode::acknowledge_safe_mode,
        orders::list_orders,
        orders::get_order,
        orders::cancel_order,
        risk::get_risk,
        risk::get_metrics,
        audit::query_audit,
        market::record_prices,
        market::list_prices,
    ),
    components(
        schemas(
            crate::error::ErrorResponse,
            health::HealthResponse,
            signals::WebhookSignalRequest,
            signals::ManualSignalRequest,
            signals::SignalResponse,
            mode::ModeResponse,
            mode::UnlockAdvancedRequest,
            mode::SwitchLiveRequest,
            orders::OrderResponse,
            risk::RiskResponse,
            risk::ReservationResponse,
            risk::LimitsResponse,
            risk::CapitalScheduleResponse,
            risk::MetricsResponse,
            audit::AuditEntryResponse,
            audit::AuditPage,
            market::PriceQuote,
            market::PriceUpdateRequest,
            market::ObservedPriceResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "signals", description = "Inbound signals"),
        (name = "mode", description = "Tier, trading mode and pause control"),
        (name = "orders", description = "Order status and cancellation"),
        (name = "risk", description = "Risk ledger and pipeline metrics"),
        (name = "audit", description = "Audit log"),
        (name = "market", description = "Observed market prices"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    // Webhook and bot channels authenticate with the shared secret in the body.
    let public = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness))
        .route("/api-docs/openapi.json", get(openapi_json))
        .route("/webhook/signal", post(signals::webhook_signal))
        .route("/bot/signal", post(signals::bot_signal));

    let viewer = Router::new()
        .route("/api/v1/mode", get(mode::get_mode))
        .route("/api/v1/risk", get(risk::get_risk))
        .route("/api/v1/metrics", get(risk::get_metrics))
        .route("/api/v1/orders", get(orders::list_orders))
        .route("/api/v1/orders/{order_id}", get(orders::get_order))
        .route("/api/v1/audit", get(audit::query_audit))
        .route("/api/v1/market/prices", get(market::list_prices))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    let operator = Router::new()
        .route("/api/v1/signals/manual", post(signals::manual_signal))
        .route("/api/v1/mode/pause", post(mode::pause))
        .route("/api/v1/mode/resume", post(mode::resume))
        .route("/api/v1/mode/force-conservative", post(mode::force_conservative))
        .route("/api/v1/mode/switch-paper", post(mode::switch_paper))
        .route("/api/v1/orders/{order_id}/cancel", post(orders::cancel_order))
        .route("/api/v1/market/prices", post(market::record_prices))
        .route_layer(from_fn(require_operator))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    let admin = Router::new()
        .route("/api/v1/mode/unlock-advanced", post(mode::unlock_advanced))
        .route("/api/v1/mode/switch-live", post(mode::switch_live))
        .route("/api/v1/mode/safe-mode/ack", post(mode::acknowledge_safe_mode))
        .route_layer(from_fn(require_admin))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(viewer)
        .merge(operator)
        .merge(admin)
        .with_state(state)
}
