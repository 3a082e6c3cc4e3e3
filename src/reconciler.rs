//! Reconciler: exchange truth vs strategy store.
//!
//! Runs inside the fill watcher every 5th cycle. Classification is pure;
//! healing is bounded: only aged drift is repaired, in-flight intents are
//! waited out, and no healing path ever touches the exchange side.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::exchange::BybitClient;
use crate::notify::{self, Notifier};
use crate::store::{PositionState, StageRecord, Store};
use crate::types::{ExchangePosition, Money, OrderState, PlanState};

/// Drift must persist this long before auto-healing touches it.
pub const DRIFT_TTL_SEC: i64 = 600;
/// Relative quantity tolerance treated as agreement.
pub const QTY_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileStatus {
    Ok,
    Mismatch { needs_healing: bool },
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub status: ReconcileStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealAction {
    ResetToFlat,
    SyncFromExchange,
    QtySync,
}

fn strategy_is_flat(ps: &PositionState) -> bool {
    ps.side.is_none() || ps.total_qty.is_zero()
}

fn drift_age_sec(ps: &PositionState, now: chrono::DateTime<Utc>) -> i64 {
    ps.state_changed_at
        .map(|at| (now - at).num_seconds())
        .unwrap_or(i64::MAX)
}

/// Pure classification of one (exchange, strategy) observation pair.
/// Either side erroring yields UNKNOWN; the fail-safe is to do nothing.
pub fn classify(
    exchange: Result<&Option<ExchangePosition>, &str>,
    strategy: Result<&PositionState, &str>,
    now: chrono::DateTime<Utc>,
) -> ReconcileReport {
    let (exchange, strategy) = match (exchange, strategy) {
        (Ok(e), Ok(s)) => (e, s),
        (Err(e), _) | (_, Err(e)) => {
            return ReconcileReport {
                status: ReconcileStatus::Unknown,
                detail: format!("data error: {e}"),
            }
        }
    };

    match (exchange, strategy_is_flat(strategy)) {
        (None, true) => ReconcileReport {
            status: ReconcileStatus::Ok,
            detail: "both_flat".to_string(),
        },
        (None, false) => {
            // Exchange flat, strategy thinks it holds. A young in-flight
            // intent may still resolve on its own, so wait.
            let age = drift_age_sec(strategy, now);
            if strategy.plan_state.is_intent() && age < DRIFT_TTL_SEC {
                ReconcileReport {
                    status: ReconcileStatus::Mismatch {
                        needs_healing: false,
                    },
                    detail: format!(
                        "exch_none_plan_{} (intent, age={age}s < {DRIFT_TTL_SEC}s)",
                        strategy.plan_state
                    ),
                }
            } else {
                ReconcileReport {
                    status: ReconcileStatus::Mismatch { needs_healing: true },
                    detail: format!("exch_none_plan_{}", strategy.plan_state),
                }
            }
        }
        (Some(pos), true) => ReconcileReport {
            status: ReconcileStatus::Mismatch { needs_healing: true },
            detail: format!("exch_{}_db_flat qty={}", pos.side, pos.qty),
        },
        (Some(pos), false) => {
            let strat_side = strategy.side.expect("non-flat strategy has side");
            if strat_side != pos.side {
                return ReconcileReport {
                    status: ReconcileStatus::Mismatch { needs_healing: true },
                    detail: format!("side_mismatch: exch={} strat={strat_side}", pos.side),
                };
            }
            let strat_qty = strategy.total_qty.to_f64();
            if strat_qty > 0.0 && ((pos.qty - strat_qty).abs() / strat_qty) < QTY_TOLERANCE {
                ReconcileReport {
                    status: ReconcileStatus::Ok,
                    detail: format!("side_match qty_match: exch={} strat={strat_qty}", pos.qty),
                }
            } else {
                ReconcileReport {
                    status: ReconcileStatus::Mismatch { needs_healing: true },
                    detail: format!("qty_diff: exch={} strat={strat_qty}", pos.qty),
                }
            }
        }
    }
}

/// Decide the healing action for an aged, healing-eligible mismatch.
/// Side mismatches are reported but never auto-healed.
pub fn healing_action(
    exchange: &Option<ExchangePosition>,
    strategy: &PositionState,
    now: chrono::DateTime<Utc>,
) -> Option<HealAction> {
    if drift_age_sec(strategy, now) < DRIFT_TTL_SEC {
        return None;
    }
    match (exchange, strategy_is_flat(strategy)) {
        (None, false) => Some(HealAction::ResetToFlat),
        (Some(_), true) => Some(HealAction::SyncFromExchange),
        (Some(pos), false) if strategy.side == Some(pos.side) => Some(HealAction::QtySync),
        _ => None,
    }
}

/// One reconcile pass: fetch both sides, classify, heal aged drift.
/// Returns the applied action, if any.
pub async fn reconcile_and_heal(
    store: &Store,
    client: &BybitClient,
    notifier: &Notifier,
    symbol: &str,
) -> Result<Option<HealAction>> {
    let now = Utc::now();

    let exchange = match client.fetch_position(symbol).await {
        Ok(pos) => pos,
        Err(e) => {
            warn!("reconcile: exchange fetch failed, UNKNOWN (no-op): {e}");
            return Ok(None);
        }
    };
    let strategy = store
        .get_position_state(symbol)?
        .unwrap_or_else(|| PositionState::flat(symbol));

    let report = classify(Ok(&exchange), Ok(&strategy), now);
    match report.status {
        ReconcileStatus::Mismatch { needs_healing: true } => {}
        _ => return Ok(None),
    }

    let Some(action) = healing_action(&exchange, &strategy, now) else {
        info!("reconcile: drift too fresh or unhealable, waiting ({})", report.detail);
        return Ok(None);
    };

    match action {
        HealAction::ResetToFlat => {
            let mut ps = strategy.clone();
            ps.clear_to_flat();
            store.save_position_state(&ps, true)?;
            let detail = format!("DB→PLAN.NONE (거래소=NONE, {})", report.detail);
            info!("RECONCILE HEAL: {detail}");
            notifier.send(&notify::format_reconcile_heal(&detail)).await;
            audit(store, symbol, "RESET_TO_FLAT", &report.detail);
        }
        HealAction::SyncFromExchange => {
            let pos = exchange.as_ref().expect("sync action requires position");
            let mut ps = PositionState::flat(symbol);
            ps.side = Some(pos.side);
            ps.total_qty = Money::from_f64(pos.qty);
            ps.avg_entry_price = Money::from_f64(pos.entry_price);
            ps.stage = 1;
            ps.stage_consumed_mask = 1;
            ps.next_stage_available = 2;
            ps.order_state = OrderState::Filled;
            ps.plan_state = PlanState::Open;
            ps.filled_qty = Money::from_f64(pos.qty);
            ps.filled_usdt = Money::from_f64(pos.qty * pos.entry_price);
            ps.capital_used_usdt = Money::from_f64(pos.qty * pos.entry_price);
            ps.stages_detail = vec![StageRecord {
                stage: 1,
                price: Money::from_f64(pos.entry_price),
                qty: Money::from_f64(pos.qty),
                pct: 0.0,
                planned_usdt: Money::from_f64(pos.qty * pos.entry_price),
                filled_usdt: Money::from_f64(pos.qty * pos.entry_price),
            }];
            store.save_position_state(&ps, true)?;
            let detail = format!("DB→{} qty={} (거래소 동기화)", pos.side, pos.qty);
            info!("RECONCILE HEAL: {detail}");
            notifier.send(&notify::format_reconcile_heal(&detail)).await;
            audit(store, symbol, "SYNC_TO_EXCHANGE", &report.detail);
        }
        HealAction::QtySync => {
            let pos = exchange.as_ref().expect("qty sync requires position");
            let mut ps = strategy.clone();
            ps.total_qty = Money::from_f64(pos.qty);
            ps.filled_qty = Money::from_f64(pos.qty);
            store.save_position_state(&ps, false)?;
            info!("RECONCILE HEAL: qty synced to {} ({})", pos.qty, report.detail);
            audit(store, symbol, "QTY_SYNC", &report.detail);
        }
    }
    Ok(Some(action))
}

fn audit(store: &Store, symbol: &str, action: &str, detail: &str) {
    let _ = store.insert_proactive_log(
        symbol,
        "RECONCILE_HEAL",
        "action",
        detail,
        &serde_json::json!({ "heal_action": action }),
    );
}
