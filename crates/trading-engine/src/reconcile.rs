//! Startup reconciliation of non-terminal orders against the brokers.
//!
//! Runs before new submissions are accepted. A Pending or Submitted order
//! whose broker state cannot be established puts the system into safe mode.

use auth::{AuditAction, Decision};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use signal_core::types::{BrokerVenue, Order, OrderStatus};
use signal_core::{BrokerError, Result};
use std::collections::HashSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::coordinator::ExecutionCoordinator;

/// What reconciliation found and did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub checked: usize,
    /// Orders whose status was brought in line with the broker.
    pub resolved: usize,
    pub unchanged: usize,
    /// Pending orders the broker never received, marked Failed.
    pub never_submitted: usize,
    pub orphan_reservations_released: usize,
    pub mismatches: Vec<String>,
    pub safe_mode: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Broker answers that mean "no such order".
fn is_not_found(e: &BrokerError) -> bool {
    matches!(e, BrokerError::Rejected { .. })
}

impl ExecutionCoordinator {
    /// Reconcile every Pending/Submitted order and the reservation ledger.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let open = self.orders.load_open().await?;
        let mut report = ReconciliationReport {
            checked: open.len(),
            ..Default::default()
        };
        let mut live_ids: HashSet<Uuid> = HashSet::new();

        info!(open_orders = open.len(), "Reconciling open orders with brokers");

        for order in open {
            let id = order.id;
            match self.reconcile_order(order, &mut report).await {
                Some(status) if !status.is_terminal() => {
                    live_ids.insert(id);
                }
                Some(_) => {}
                // Unresolved orders keep their reservation.
                None => {
                    live_ids.insert(id);
                }
            }
        }

        for reservation in self.risk.reservations().await {
            if !live_ids.contains(&reservation.id) && self.risk.release(reservation.id).await {
                warn!(
                    reservation_id = %reservation.id,
                    symbol = %reservation.symbol,
                    "Released reservation with no open order"
                );
                report.orphan_reservations_released += 1;
            }
        }

        report.safe_mode = !report.is_clean();
        report.completed_at = Some(Utc::now());

        let decision = if report.is_clean() {
            Decision::Succeeded
        } else {
            Decision::Failed
        };
        self.audit_system(
            AuditAction::Reconciliation,
            "orders",
            serde_json::to_value(&report)?,
            decision,
        )
        .await?;

        if report.safe_mode {
            let reason = format!(
                "reconciliation found {} mismatch(es): {}",
                report.mismatches.len(),
                report.mismatches.join("; ")
            );
            error!(mismatches = report.mismatches.len(), "Reconciliation failed, entering safe mode");
            self.mode.enter_safe_mode(&reason).await?;
        } else {
            info!(
                checked = report.checked,
                resolved = report.resolved,
                never_submitted = report.never_submitted,
                orphans = report.orphan_reservations_released,
                "Reconciliation complete"
            );
        }

        Ok(report)
    }

    /// Returns the order's status after reconciliation, or None if the
    /// broker state could not be established.
    async fn reconcile_order(
        &self,
        order: Order,
        report: &mut ReconciliationReport,
    ) -> Option<OrderStatus> {
        let broker = match self.brokers.for_order(&order) {
            Ok(broker) => broker,
            Err(e) => {
                report
                    .mismatches
                    .push(format!("order {}: no broker ({})", order.id, e));
                return None;
            }
        };

        let status = match self.call(broker.order_status(order.id)).await {
            Ok(state) => {
                let before = order.status;
                let mut order = order;
                if before == OrderStatus::Pending {
                    // The submission landed before the restart.
                    order.broker_order_id = Some(state.broker_order_id.0.clone());
                    order.transition(OrderStatus::Submitted, None);
                    if let Err(e) = self.orders.upsert(&order).await {
                        error!(error = %e, order_id = %order.id, "Failed to persist reconciled order");
                    }
                }
                let order = self.apply_broker_state(order, state).await;
                if order.status == before {
                    report.unchanged += 1;
                } else {
                    report.resolved += 1;
                }
                order.status
            }
            Err(e) if is_not_found(&e) => match (order.status, broker.venue()) {
                (OrderStatus::Pending, _) => {
                    info!(order_id = %order.id, "Pending order never reached the broker");
                    report.never_submitted += 1;
                    self.finish(order, OrderStatus::Failed, "not submitted before restart".to_string())
                        .await
                        .status
                }
                (_, BrokerVenue::Paper) => {
                    // The simulator keeps no state across restarts.
                    report.resolved += 1;
                    self.finish(order, OrderStatus::Cancelled, "paper session reset".to_string())
                        .await
                        .status
                }
                _ => {
                    report.mismatches.push(format!(
                        "order {} is submitted but unknown to broker {}",
                        order.id, order.broker_id
                    ));
                    return None;
                }
            },
            Err(e) => {
                report.mismatches.push(format!(
                    "order {} status unavailable from {}: {}",
                    order.id, order.broker_id, e
                ));
                return None;
            }
        };

        Some(status)
    }
}
