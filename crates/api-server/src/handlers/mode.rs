//! Mode controller commands: pause, resume, tier and trading mode changes.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use auth::Claims;
use signal_core::types::{AdvancedStatus, ModeState};

use crate::error::ApiResult;
use crate::state::AppState;

/// Current mode snapshot.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ModeResponse {
    /// Stored tier (conservative or advanced).
    pub tier: String,
    /// Tier in force now; an expired unlock reads as conservative.
    pub effective_tier: String,
    /// locked or active.
    pub advanced_status: String,
    /// paper or live.
    pub trading_mode: String,
    pub paused: bool,
    /// Whether new orders are accepted right now.
    pub accepting_orders: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advanced_unlock_expiry: Option<DateTime<Utc>>,
    pub advanced_capital_pct: Decimal,
    /// Highest capital_pct an unlock may request at the current stage.
    pub capital_ceiling_pct: Decimal,
    /// Reason the system halted, awaiting admin acknowledgement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_mode: Option<String>,
    pub epoch: u64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl ModeResponse {
    fn new(mode: &ModeState, capital_ceiling_pct: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            tier: mode.tier.to_string(),
            effective_tier: mode.effective_tier(now).to_string(),
            advanced_status: match mode.advanced_status(now) {
                AdvancedStatus::Locked => "locked".to_string(),
                AdvancedStatus::Active => "active".to_string(),
            },
            trading_mode: mode.trading_mode.to_string(),
            paused: mode.paused,
            accepting_orders: mode.accepts_new_orders(),
            advanced_unlock_expiry: mode.advanced_unlock_expiry,
            advanced_capital_pct: mode.advanced_capital_pct,
            capital_ceiling_pct,
            safe_mode: mode.safe_mode.clone(),
            epoch: mode.epoch,
            updated_at: mode.updated_at,
            updated_by: mode.updated_by.clone(),
        }
    }
}

/// Unlock request for the advanced tier.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UnlockAdvancedRequest {
    pub secret_phrase: String,
    /// Current six-digit TOTP code.
    pub totp_code: String,
    /// Share of capital (0-100] the advanced tier may deploy.
    pub capital_pct: Decimal,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SwitchLiveRequest {
    pub confirmation_token: String,
}

async fn respond(state: &AppState, mode: ModeState) -> Json<ModeResponse> {
    let ceiling = state.scaler.ceiling().await;
    Json(ModeResponse::new(&mode, ceiling, Utc::now()))
}

/// Get the current mode.
#[utoipa::path(
    get,
    path = "/api/v1/mode",
    tag = "mode",
    responses((status = 200, description = "Current mode", body = ModeResponse)),
    security(("bearer_auth" = []))
)]
pub async fn get_mode(State(state): State<Arc<AppState>>) -> Json<ModeResponse> {
    let mode = state.mode.snapshot();
    respond(&state, mode).await
}

/// Stop new submissions. In-flight broker calls complete.
#[utoipa::path(
    post,
    path = "/api/v1/mode/pause",
    tag = "mode",
    responses((status = 200, description = "Paused", body = ModeResponse)),
    security(("bearer_auth" = []))
)]
pub async fn pause(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<ModeResponse>> {
    let mode = state.mode.pause(&claims.sub).await?;
    Ok(respond(&state, mode).await)
}

/// Resume submissions.
#[utoipa::path(
    post,
    path = "/api/v1/mode/resume",
    tag = "mode",
    responses(
        (status = 200, description = "Resumed", body = ModeResponse),
        (status = 422, description = "Safe mode awaits acknowledgement")
    ),
    security(("bearer_auth" = []))
)]
pub async fn resume(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<ModeResponse>> {
    let mode = state.mode.resume(&claims.sub).await?;
    Ok(respond(&state, mode).await)
}

/// Drop to the conservative tier. Open advanced positions are kept.
#[utoipa::path(
    post,
    path = "/api/v1/mode/force-conservative",
    tag = "mode",
    responses((status = 200, description = "Conservative tier in force", body = ModeResponse)),
    security(("bearer_auth" = []))
)]
pub async fn force_conservative(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<ModeResponse>> {
    let mode = state.mode.force_conservative(&claims.sub).await?;
    Ok(respond(&state, mode).await)
}

/// Unlock the advanced tier with the secret phrase and second factor.
#[utoipa::path(
    post,
    path = "/api/v1/mode/unlock-advanced",
    tag = "mode",
    request_body = UnlockAdvancedRequest,
    responses(
        (status = 200, description = "Advanced tier active", body = ModeResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 409, description = "Locked out after repeated failures"),
        (status = 422, description = "capital_pct above the current ceiling or unlock not permitted")
    ),
    security(("bearer_auth" = []))
)]
pub async fn unlock_advanced(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<UnlockAdvancedRequest>,
) -> ApiResult<Json<ModeResponse>> {
    let mode = state
        .mode
        .unlock_advanced(
            &claims.sub,
            &request.secret_phrase,
            &request.totp_code,
            request.capital_pct,
        )
        .await?;
    Ok(respond(&state, mode).await)
}

/// Switch from paper to live trading.
#[utoipa::path(
    post,
    path = "/api/v1/mode/switch-live",
    tag = "mode",
    request_body = SwitchLiveRequest,
    responses(
        (status = 200, description = "Live trading", body = ModeResponse),
        (status = 401, description = "Invalid confirmation token")
    ),
    security(("bearer_auth" = []))
)]
pub async fn switch_live(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<SwitchLiveRequest>,
) -> ApiResult<Json<ModeResponse>> {
    let mode = state
        .mode
        .switch_live(&claims.sub, &request.confirmation_token)
        .await?;
    Ok(respond(&state, mode).await)
}

/// Switch back to paper trading.
#[utoipa::path(
    post,
    path = "/api/v1/mode/switch-paper",
    tag = "mode",
    responses((status = 200, description = "Paper trading", body = ModeResponse)),
    security(("bearer_auth" = []))
)]
pub async fn switch_paper(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<ModeResponse>> {
    let mode = state.mode.switch_paper(&claims.sub).await?;
    Ok(respond(&state, mode).await)
}

/// Acknowledge safe mode. Trading stays paused until resumed.
#[utoipa::path(
    post,
    path = "/api/v1/mode/safe-mode/ack",
    tag = "mode",
    responses(
        (status = 200, description = "Safe mode cleared", body = ModeResponse),
        (status = 409, description = "Not in safe mode")
    ),
    security(("bearer_auth" = []))
)]
pub async fn acknowledge_safe_mode(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<ModeResponse>> {
    let mode = state.mode.acknowledge_safe_mode(&claims.sub).await?;
    Ok(respond(&state, mode).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use signal_core::types::ExecutionTier;

    #[test]
    fn test_expired_unlock_reads_as_locked() {
        let now = Utc::now();
        let mode = ModeState {
            tier: ExecutionTier::Advanced,
            advanced_unlock_expiry: Some(now - Duration::minutes(1)),
            advanced_capital_pct: Decimal::from(10),
            ..Default::default()
        };

        let response = ModeResponse::new(&mode, Decimal::from(5), now);
        assert_eq!(response.tier, "advanced");
        assert_eq!(response.effective_tier, "conservative");
        assert_eq!(response.advanced_status, "locked");
        assert!(response.accepting_orders);
    }
}
