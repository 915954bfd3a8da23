//! Mode controller: execution tier, trading mode, pause and safe mode.
//!
//! Transitions are serialized behind a write lock. Order dispatch holds a
//! read [`ModePermit`] for the duration of one broker call, so a transition
//! waits for in-flight submissions to finish and every submission happens
//! under the mode it was checked against. Readers that only need to look use
//! [`ModeController::snapshot`], which never touches the lock.

use auth::{
    AttemptStatus, AuditAction, AuditEntry, AuditLogger, CredentialFailure, Decision,
    FailedAttemptTracker, SharedSecret, UnlockCredential, SYSTEM_ACTOR,
};
use chrono::{DateTime, Duration, Utc};
use risk_manager::CapitalScaler;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use signal_core::config::ModeConfig;
use signal_core::db::{keys, load_snapshot, save_snapshot, StateStore};
use signal_core::notify::{EventType, NotificationHub};
use signal_core::types::{ExecutionTier, ModeState, TradingMode};
use signal_core::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, RwLock, RwLockReadGuard};
use tracing::{error, info, warn};

const RESOURCE: &str = "mode";

/// Why the gate refused a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateDenial {
    Paused,
    SafeMode { reason: String },
    ModeMismatch { declared: TradingMode, current: TradingMode },
    /// The order was sized for the advanced tier, which has since locked.
    TierRevoked,
}

impl GateDenial {
    pub fn code(&self) -> &'static str {
        match self {
            GateDenial::Paused => "paused",
            GateDenial::SafeMode { .. } => "safe_mode",
            GateDenial::ModeMismatch { .. } => "mode_mismatch",
            GateDenial::TierRevoked => "tier_revoked",
        }
    }
}

impl fmt::Display for GateDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDenial::Paused => f.write_str("trading is paused"),
            GateDenial::SafeMode { reason } => write!(f, "safe mode: {}", reason),
            GateDenial::ModeMismatch { declared, current } => write!(
                f,
                "order declared {} but trading mode is {}",
                declared, current
            ),
            GateDenial::TierRevoked => f.write_str("advanced tier no longer active"),
        }
    }
}

/// Held while a submission is in flight. Mode transitions wait for it.
pub struct ModePermit<'a> {
    guard: RwLockReadGuard<'a, ModeInner>,
}

impl ModePermit<'_> {
    pub fn state(&self) -> &ModeState {
        &self.guard.state
    }
}

pub enum GateDecision<'a> {
    Open(ModePermit<'a>),
    Closed(GateDenial),
}

struct ModeInner {
    state: ModeState,
    failed_unlocks: FailedAttemptTracker,
}

pub struct ModeController {
    inner: RwLock<ModeInner>,
    snapshot_tx: watch::Sender<ModeState>,
    credential: UnlockCredential,
    live_confirmation: SharedSecret,
    unlock_ttl: Duration,
    scaler: Arc<CapitalScaler>,
    audit: AuditLogger,
    notifier: NotificationHub,
    store: Option<Arc<dyn StateStore>>,
}

impl ModeController {
    pub fn new(
        config: &ModeConfig,
        credential: UnlockCredential,
        scaler: Arc<CapitalScaler>,
        audit: AuditLogger,
        notifier: NotificationHub,
    ) -> Self {
        let state = ModeState::default();
        let (snapshot_tx, _) = watch::channel(state.clone());
        Self {
            inner: RwLock::new(ModeInner {
                state,
                failed_unlocks: FailedAttemptTracker::new(
                    config.max_failed_unlocks,
                    config.failed_unlock_window_secs,
                    config.lockout_secs,
                ),
            }),
            snapshot_tx,
            credential,
            live_confirmation: SharedSecret::new(&config.live_confirmation_token),
            unlock_ttl: Duration::minutes(config.unlock_ttl_minutes),
            scaler,
            audit,
            notifier,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Restore the last persisted mode. Returns true if one existed.
    pub async fn load_state(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(state) = load_snapshot::<ModeState>(store.as_ref(), keys::MODE_STATE).await? else {
            return Ok(false);
        };

        info!(
            tier = %state.tier,
            trading_mode = %state.trading_mode,
            paused = state.paused,
            safe_mode = ?state.safe_mode,
            "Loaded mode state"
        );
        let mut inner = self.inner.write().await;
        inner.state = state.clone();
        self.snapshot_tx.send_replace(state);
        Ok(true)
    }

    /// Point-in-time copy of the mode. Does not wait on transitions.
    pub fn snapshot(&self) -> ModeState {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModeState> {
        self.snapshot_tx.subscribe()
    }

    /// Check that an order declared under `declared_mode` and `declared_tier`
    /// may be submitted now. An open gate holds off transitions until the
    /// permit is dropped.
    pub async fn gate(&self, declared_mode: TradingMode, declared_tier: ExecutionTier) -> GateDecision<'_> {
        let guard = self.inner.read().await;
        let state = &guard.state;

        if let Some(reason) = &state.safe_mode {
            return GateDecision::Closed(GateDenial::SafeMode {
                reason: reason.clone(),
            });
        }
        if state.paused {
            return GateDecision::Closed(GateDenial::Paused);
        }
        if state.trading_mode != declared_mode {
            return GateDecision::Closed(GateDenial::ModeMismatch {
                declared: declared_mode,
                current: state.trading_mode,
            });
        }
        if declared_tier == ExecutionTier::Advanced
            && state.effective_tier(Utc::now()) != ExecutionTier::Advanced
        {
            return GateDecision::Closed(GateDenial::TierRevoked);
        }

        GateDecision::Open(ModePermit { guard })
    }

    /// Activate the advanced tier for `unlock_ttl` with a capital allowance.
    pub async fn unlock_advanced(
        &self,
        actor: &str,
        secret_phrase: &str,
        second_factor: &str,
        capital_pct: Decimal,
    ) -> Result<ModeState> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let inputs = json!({ "capital_pct": capital_pct });

        if let Some(until) = inner.failed_unlocks.locked_until(now) {
            warn!(actor = %actor, until = %until, "Unlock attempt during lockout");
            self.audit_unlock(actor, inputs, Decision::Denied, "locked_out").await?;
            return Err(Error::Conflict(format!(
                "unlock locked out until {}",
                until.to_rfc3339()
            )));
        }

        if let Some(reason) = &inner.state.safe_mode {
            let reason = format!("safe mode active: {}", reason);
            self.audit_unlock(actor, inputs, Decision::Denied, &reason).await?;
            return Err(Error::denied(reason));
        }

        let accepted = match self.credential.verify(secret_phrase, second_factor) {
            Ok(accepted) => {
                inner.failed_unlocks.record_success();
                accepted
            }
            Err(CredentialFailure::NotConfigured) => {
                self.audit_unlock(actor, inputs, Decision::Denied, "not_configured").await?;
                return Err(Error::denied("advanced unlock is not configured"));
            }
            Err(failure @ (CredentialFailure::InvalidCredentials | CredentialFailure::ReplayedCode)) => {
                if failure == CredentialFailure::ReplayedCode {
                    warn!(actor = %actor, "Unlock attempt replayed a used second-factor code");
                }
                let status = inner.failed_unlocks.record_failure(now);
                return Err(self.unlock_failed(actor, inputs, status).await);
            }
        };

        let ceiling = self.scaler.ceiling().await;
        if capital_pct <= Decimal::ZERO || capital_pct > Decimal::ONE_HUNDRED {
            self.audit_unlock(actor, inputs, Decision::Denied, "capital_pct_out_of_range").await?;
            return Err(Error::validation("capital_pct must be in (0, 100]"));
        }
        if capital_pct > ceiling {
            let reason = format!("capital_pct {} above current ceiling {}", capital_pct, ceiling);
            self.audit_unlock(actor, inputs, Decision::Denied, &reason).await?;
            return Err(Error::validation(reason));
        }

        let mut next = inner.state.clone();
        next.tier = ExecutionTier::Advanced;
        next.advanced_unlock_expiry = Some(now + self.unlock_ttl);
        next.advanced_capital_pct = capital_pct;

        self.audit_unlock(actor, inputs, Decision::Succeeded, "unlocked").await?;
        self.credential.consume(accepted);
        self.commit(&mut inner, next, actor, "unlock_advanced").await
    }

    async fn audit_unlock(
        &self,
        actor: &str,
        inputs: serde_json::Value,
        decision: Decision,
        reason: &str,
    ) -> Result<()> {
        self.audit
            .record(
                AuditEntry::builder(AuditAction::UnlockAttempt, RESOURCE)
                    .actor(actor)
                    .inputs(inputs)
                    .decision(decision)
                    .reason(reason)
                    .build(),
            )
            .await?;
        Ok(())
    }

    async fn unlock_failed(&self, actor: &str, inputs: serde_json::Value, status: AttemptStatus) -> Error {
        let (reason, event, error) = match status {
            AttemptStatus::Counting { remaining } => {
                warn!(actor = %actor, remaining, "Unlock attempt with invalid credentials");
                (
                    format!("invalid_credentials ({} attempts remaining)", remaining),
                    EventType::UnlockFailed,
                    Error::Auth {
                        message: "invalid unlock credentials".to_string(),
                    },
                )
            }
            AttemptStatus::LockedOut { until } => {
                error!(actor = %actor, until = %until, "Unlock locked out after repeated failures");
                (
                    format!("invalid_credentials, locked out until {}", until.to_rfc3339()),
                    EventType::UnlockLockout,
                    Error::Conflict(format!("unlock locked out until {}", until.to_rfc3339())),
                )
            }
        };

        if let Err(e) = self.audit_unlock(actor, inputs, Decision::Denied, &reason).await {
            return e;
        }
        self.notifier
            .notify(event, json!({ "actor": actor, "reason": reason }));
        error
    }

    /// Drop to the conservative tier immediately. Open advanced positions are
    /// kept; only new advanced entries stop.
    pub async fn force_conservative(&self, actor: &str) -> Result<ModeState> {
        let mut inner = self.inner.write().await;
        let mut next = inner.state.clone();
        next.tier = ExecutionTier::Conservative;
        next.advanced_unlock_expiry = None;
        next.advanced_capital_pct = Decimal::ZERO;
        self.transition(&mut inner, next, actor, "force_conservative").await
    }

    pub async fn pause(&self, actor: &str) -> Result<ModeState> {
        let mut inner = self.inner.write().await;
        let mut next = inner.state.clone();
        next.paused = true;
        self.transition(&mut inner, next, actor, "pause").await
    }

    /// Resume submissions. Refused while safe mode awaits acknowledgement.
    pub async fn resume(&self, actor: &str) -> Result<ModeState> {
        let mut inner = self.inner.write().await;
        if let Some(reason) = inner.state.safe_mode.clone() {
            self.audit_denied(actor, "resume", "safe mode requires acknowledgement")
                .await?;
            return Err(Error::denied(format!(
                "safe mode requires acknowledgement: {}",
                reason
            )));
        }
        let mut next = inner.state.clone();
        next.paused = false;
        self.transition(&mut inner, next, actor, "resume").await
    }

    /// Paper to live, only with the configured confirmation token.
    pub async fn switch_live(&self, actor: &str, confirmation_token: &str) -> Result<ModeState> {
        let mut inner = self.inner.write().await;
        if inner.state.trading_mode == TradingMode::Live {
            return Ok(inner.state.clone());
        }
        if !self.live_confirmation.verify(confirmation_token) {
            warn!(actor = %actor, "Live switch with invalid confirmation");
            self.audit_denied(actor, "switch_live", "invalid_confirmation").await?;
            return Err(Error::Auth {
                message: "invalid live confirmation token".to_string(),
            });
        }
        let mut next = inner.state.clone();
        next.trading_mode = TradingMode::Live;
        self.transition(&mut inner, next, actor, "switch_live").await
    }

    /// Live to paper. Always permitted.
    pub async fn switch_paper(&self, actor: &str) -> Result<ModeState> {
        let mut inner = self.inner.write().await;
        let mut next = inner.state.clone();
        next.trading_mode = TradingMode::Paper;
        self.transition(&mut inner, next, actor, "switch_paper").await
    }

    /// Halt new submissions until an administrator acknowledges.
    pub async fn enter_safe_mode(&self, reason: &str) -> Result<ModeState> {
        let mut inner = self.inner.write().await;
        let mut next = inner.state.clone();
        next.paused = true;
        next.safe_mode = Some(reason.to_string());

        error!(reason = %reason, "Entering safe mode, submissions halted");
        let state = self
            .transition(&mut inner, next, SYSTEM_ACTOR, "enter_safe_mode")
            .await?;
        self.notifier
            .notify(EventType::SafeModeEntered, json!({ "reason": reason }));
        Ok(state)
    }

    /// Clear safe mode. Trading stays paused until an explicit resume.
    pub async fn acknowledge_safe_mode(&self, actor: &str) -> Result<ModeState> {
        let mut inner = self.inner.write().await;
        let Some(reason) = inner.state.safe_mode.clone() else {
            self.audit_denied(actor, "acknowledge_safe_mode", "not_in_safe_mode").await?;
            return Err(Error::Conflict("not in safe mode".to_string()));
        };

        let mut next = inner.state.clone();
        next.safe_mode = None;

        self.audit
            .record(
                AuditEntry::builder(AuditAction::SafeModeAck, RESOURCE)
                    .actor(actor)
                    .inputs(json!({ "safe_mode_reason": reason }))
                    .decision(Decision::Succeeded)
                    .build(),
            )
            .await?;
        info!(actor = %actor, "Safe mode acknowledged");
        self.commit(&mut inner, next, actor, "acknowledge_safe_mode").await
    }

    /// Relock the advanced tier once its unlock has expired.
    pub async fn expire_if_due(&self, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.state.tier != ExecutionTier::Advanced || !inner.state.unlock_expired(now) {
            return Ok(false);
        }

        let mut next = inner.state.clone();
        next.tier = ExecutionTier::Conservative;
        next.advanced_unlock_expiry = None;
        next.advanced_capital_pct = Decimal::ZERO;
        info!("Advanced unlock expired, relocking");
        self.transition(&mut inner, next, SYSTEM_ACTOR, "unlock_expired")
            .await?;
        Ok(true)
    }

    async fn audit_denied(&self, actor: &str, command: &str, reason: &str) -> Result<()> {
        self.audit
            .record(
                AuditEntry::builder(AuditAction::ModeTransition, RESOURCE)
                    .actor(actor)
                    .inputs(json!({ "command": command }))
                    .decision(Decision::Denied)
                    .reason(reason)
                    .build(),
            )
            .await?;
        Ok(())
    }

    /// Audit then commit a transition.
    async fn transition(
        &self,
        inner: &mut ModeInner,
        next: ModeState,
        actor: &str,
        command: &str,
    ) -> Result<ModeState> {
        self.audit
            .record(
                AuditEntry::builder(AuditAction::ModeTransition, RESOURCE)
                    .actor(actor)
                    .inputs(json!({
                        "command": command,
                        "from": serde_json::to_value(&inner.state).unwrap_or_default(),
                        "to": serde_json::to_value(&next).unwrap_or_default(),
                    }))
                    .decision(Decision::Succeeded)
                    .build(),
            )
            .await?;
        self.commit(inner, next, actor, command).await
    }

    async fn commit(
        &self,
        inner: &mut ModeInner,
        mut next: ModeState,
        actor: &str,
        command: &str,
    ) -> Result<ModeState> {
        next.epoch = inner.state.epoch + 1;
        next.updated_at = Utc::now();
        next.updated_by = actor.to_string();
        inner.state = next.clone();

        if let Some(store) = &self.store {
            if let Err(e) = save_snapshot(store.as_ref(), keys::MODE_STATE, &next).await {
                error!(error = %e, "Failed to persist mode state");
            }
        }
        self.snapshot_tx.send_replace(next.clone());

        info!(
            actor = %actor,
            command = %command,
            tier = %next.tier,
            trading_mode = %next.trading_mode,
            paused = next.paused,
            epoch = next.epoch,
            "Mode transition"
        );
        self.notifier.notify(
            EventType::ModeChanged,
            json!({
                "command": command,
                "actor": actor,
                "state": serde_json::to_value(&next).unwrap_or_default(),
            }),
        );
        Ok(next)
    }
}
