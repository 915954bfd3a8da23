//! Inbound signal handlers: webhook, bot, and operator-entered signals.
//!
//! The pipeline runs to completion before the response is sent, so the
//! response carries the final decision and the order it produced.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use auth::Claims;
use signal_core::types::{Signal, SignalSource};
use trading_engine::{ExecutionOutcome, ManualSignal, Rejection};

use crate::error::ApiResult;
use crate::handlers::orders::OrderResponse;
use crate::state::AppState;

/// Alert payload posted by an external charting tool or bot.
#[derive(Debug, Deserialize, ToSchema)]
pub struct WebhookSignalRequest {
    /// Shared secret for the channel.
    pub token: String,
    /// Instrument symbol, e.g. AAPL.
    pub symbol: String,
    /// BUY, SELL or CLOSE.
    pub action: String,
    /// Suggested price.
    pub price: Decimal,
    /// Strategy tag, part of the idempotency key.
    pub strategy: String,
    /// Confidence in [0, 1]. Defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Decimal>,
}

/// Operator-entered signal.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ManualSignalRequest {
    pub symbol: String,
    /// BUY, SELL or CLOSE.
    pub action: String,
    pub price: Decimal,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub confidence: Option<Decimal>,
}

/// Decision for one inbound signal.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SignalResponse {
    /// executed, denied, rejected, failed or duplicate.
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    /// Machine-readable reason, e.g. AuthFailure or DailyLossLimit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Pipeline stage that denied the signal (risk, mode or routing).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderResponse>,
}

impl SignalResponse {
    fn rejected(rejection: &Rejection) -> (StatusCode, Self) {
        let (status, decision, key) = match rejection {
            Rejection::AuthFailure => (StatusCode::UNAUTHORIZED, "rejected", None),
            Rejection::Malformed { .. } => (StatusCode::BAD_REQUEST, "rejected", None),
            Rejection::Duplicate { idempotency_key } => {
                (StatusCode::OK, "duplicate", Some(idempotency_key.clone()))
            }
        };
        (
            status,
            Self {
                decision: decision.to_string(),
                idempotency_key: key,
                order_id: None,
                code: Some(rejection.code().to_string()),
                reason: Some(rejection.to_string()),
                stage: Some("ingestion".to_string()),
                order: None,
            },
        )
    }

    fn from_outcome(idempotency_key: String, outcome: &ExecutionOutcome) -> (StatusCode, Self) {
        let mut response = Self {
            decision: String::new(),
            idempotency_key: Some(idempotency_key),
            order_id: outcome.order_id(),
            code: None,
            reason: None,
            stage: None,
            order: outcome.order().map(OrderResponse::from),
        };

        let status = match outcome {
            ExecutionOutcome::Executed { .. } => {
                response.decision = "executed".to_string();
                StatusCode::OK
            }
            ExecutionOutcome::Denied {
                stage,
                code,
                reason,
                ..
            } => {
                response.decision = "denied".to_string();
                response.stage = serde_json::to_value(stage)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string));
                response.code = Some(code.clone());
                response.reason = Some(reason.clone());
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ExecutionOutcome::Rejected { reason, .. } => {
                response.decision = "rejected".to_string();
                response.code = Some("BrokerRejected".to_string());
                response.reason = Some(reason.clone());
                StatusCode::BAD_GATEWAY
            }
            ExecutionOutcome::Failed { reason, .. } => {
                response.decision = "failed".to_string();
                response.code = reason.split(':').next().map(str::to_string);
                response.reason = Some(reason.clone());
                StatusCode::BAD_GATEWAY
            }
            ExecutionOutcome::Duplicate { .. } => {
                response.decision = "duplicate".to_string();
                response.code = Some("Duplicate".to_string());
                StatusCode::OK
            }
        };
        (status, response)
    }
}

/// Receive a webhook alert.
#[utoipa::path(
    post,
    path = "/webhook/signal",
    tag = "signals",
    request_body = WebhookSignalRequest,
    responses(
        (status = 200, description = "Executed, or a duplicate of an earlier signal", body = SignalResponse),
        (status = 400, description = "Malformed payload", body = SignalResponse),
        (status = 401, description = "Invalid shared secret", body = SignalResponse),
        (status = 422, description = "Denied by risk or mode policy", body = SignalResponse),
        (status = 502, description = "Broker rejected the order or retries were exhausted", body = SignalResponse)
    )
)]
pub async fn webhook_signal(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SignalResponse>)> {
    let Json(payload) = payload?;
    let ingested = state.ingestor.ingest(payload, SignalSource::Webhook).await?;
    run_pipeline(&state, ingested).await
}

/// Receive a signal from the trading bot channel.
#[utoipa::path(
    post,
    path = "/bot/signal",
    tag = "signals",
    request_body = WebhookSignalRequest,
    responses(
        (status = 200, description = "Executed, or a duplicate of an earlier signal", body = SignalResponse),
        (status = 400, description = "Malformed payload", body = SignalResponse),
        (status = 401, description = "Invalid shared secret", body = SignalResponse),
        (status = 422, description = "Denied by risk or mode policy", body = SignalResponse),
        (status = 502, description = "Broker rejected the order or retries were exhausted", body = SignalResponse)
    )
)]
pub async fn bot_signal(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SignalResponse>)> {
    let Json(payload) = payload?;
    let ingested = state.ingestor.ingest(payload, SignalSource::Bot).await?;
    run_pipeline(&state, ingested).await
}

/// Submit a signal as an authenticated operator.
#[utoipa::path(
    post,
    path = "/api/v1/signals/manual",
    tag = "signals",
    request_body = ManualSignalRequest,
    responses(
        (status = 200, description = "Executed, or a duplicate of an earlier signal", body = SignalResponse),
        (status = 400, description = "Malformed signal", body = SignalResponse),
        (status = 403, description = "Operator role required"),
        (status = 422, description = "Denied by risk or mode policy", body = SignalResponse),
        (status = 502, description = "Broker rejected the order or retries were exhausted", body = SignalResponse)
    ),
    security(("bearer_auth" = []))
)]
pub async fn manual_signal(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<ManualSignalRequest>,
) -> ApiResult<(StatusCode, Json<SignalResponse>)> {
    info!(operator = %claims.sub, symbol = %request.symbol, action = %request.action, "Manual signal");
    let manual = ManualSignal {
        symbol: request.symbol,
        action: request.action,
        price: request.price,
        strategy: request.strategy,
        confidence: request.confidence,
    };
    let ingested = state.ingestor.ingest_manual(&claims.sub, manual).await?;
    run_pipeline(&state, ingested).await
}

async fn run_pipeline(
    state: &AppState,
    ingested: Result<Signal, Rejection>,
) -> ApiResult<(StatusCode, Json<SignalResponse>)> {
    let signal = match ingested {
        Ok(signal) => signal,
        Err(rejection) => {
            let (status, body) = SignalResponse::rejected(&rejection);
            return Ok((status, Json(body)));
        }
    };

    let key = signal.idempotency_key.to_string();
    let outcome = state.coordinator.execute(signal).await?;
    let (status, body) = SignalResponse::from_outcome(key, &outcome);
    Ok((status, Json(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trading_engine::DenialStage;

    #[test]
    fn test_rejections_map_to_status() {
        let (status, body) = SignalResponse::rejected(&Rejection::AuthFailure);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code.as_deref(), Some("AuthFailure"));

        let (status, body) = SignalResponse::rejected(&Rejection::Duplicate {
            idempotency_key: "k1".to_string(),
        });
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.decision, "duplicate");
        assert_eq!(body.idempotency_key.as_deref(), Some("k1"));
    }

    #[test]
    fn test_denial_carries_stage_and_code() {
        let outcome = ExecutionOutcome::Denied {
            stage: DenialStage::Risk,
            code: "DailyLossLimit".to_string(),
            reason: "daily loss limit reached".to_string(),
            order: None,
        };

        let (status, body) = SignalResponse::from_outcome("k2".to_string(), &outcome);
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.decision, "denied");
        assert_eq!(body.stage.as_deref(), Some("risk"));
        assert_eq!(body.code.as_deref(), Some("DailyLossLimit"));
        assert!(body.order_id.is_none());
    }
}
