//! Event-decision engine (EVENT_DECISION mode).
//!
//! A specialized handler for high-frequency actionable events: builds a rich
//! snapshot bundle, asks the deep provider for a structured decision, then
//! pushes the answer through hard safety guards before anything reaches the
//! execution queue. Provider failures collapse to HOLD.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use super::trigger::{EventResult, MIN_ORDER_QTY_BTC};
use crate::exchange::{BybitClient, OpenOrder};
use crate::llm::{
    parse_event_decision_response, DecisionParams, EventDecisionResponse, LlmClient,
};
use crate::notify::{self, Notifier};
use crate::snapshot::MarketSnapshot;
use crate::store::{NewQueueEntry, Store};
use crate::types::{ActionType, EventDecisionAction, ExchangePosition, Money};

pub const REDUCE_RATIO_MAX: f64 = 0.70;
pub const REVERSE_SIZE_RATIO_MAX: f64 = 0.30;
pub const HEDGE_SIZE_RATIO_MAX: f64 = 0.30;
pub const FREEZE_MINUTES_MAX: f64 = 60.0;
pub const ENTRY_FREEZE_POLICY_KEY: &str = "event_entry_freeze";

const DEFAULT_REDUCE_RATIO: f64 = 0.5;
const DEDUP_WINDOW_SEC: i64 = 300;

const EVENT_DECISION_SYSTEM_PROMPT: &str = "You are the risk-event decision \
module of a BTC perpetual trading system. Given the JSON bundle, answer with \
ONE JSON object only: {\"event_class\", \"confidence\", \"action\" (one of \
HOLD | RISK_OFF_REDUCE | HARD_EXIT | FREEZE_NEW_ENTRY | REVERSE | HEDGE), \
\"params\" {reduce_ratio, freeze_minutes, new_sl_type, new_sl_value, \
reverse_size_ratio, hedge_size_ratio}, \"reasoning_short\", \"safety_checks\" \
{orphan_orders_cleanup_required, stop_order_required, reverse_allowed}}.";

/// Outcome of one EVENT_DECISION handling pass.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub action: EventDecisionAction,
    pub original_action: EventDecisionAction,
    pub event_class: String,
    pub guard_reasons: Vec<String>,
    pub queue_ids: Vec<i64>,
    pub fallback_used: bool,
}

/// Apply the hard safety guards to a parsed provider action.
///
/// Order matters: parameter clamps first, then the no-position rule, then
/// the liquidity-stress upgrade. Returns the possibly-rewritten action, the
/// clamped params and human-readable reasons for each rewrite.
pub fn apply_safety_guards(
    action: EventDecisionAction,
    params: &DecisionParams,
    position: Option<&ExchangePosition>,
    snapshot: &MarketSnapshot,
) -> (EventDecisionAction, DecisionParams, Vec<String>) {
    let mut reasons = Vec::new();
    let mut params = params.clone();

    if params.reduce_ratio > REDUCE_RATIO_MAX {
        reasons.push(format!(
            "reduce_ratio clamped {:.2} -> {REDUCE_RATIO_MAX:.2}",
            params.reduce_ratio
        ));
        params.reduce_ratio = REDUCE_RATIO_MAX;
    }
    if params.reverse_size_ratio > REVERSE_SIZE_RATIO_MAX {
        reasons.push(format!(
            "reverse_size_ratio clamped {:.2} -> {REVERSE_SIZE_RATIO_MAX:.2}",
            params.reverse_size_ratio
        ));
        params.reverse_size_ratio = REVERSE_SIZE_RATIO_MAX;
    }
    if params.hedge_size_ratio > HEDGE_SIZE_RATIO_MAX {
        reasons.push(format!(
            "hedge_size_ratio clamped {:.2} -> {HEDGE_SIZE_RATIO_MAX:.2}",
            params.hedge_size_ratio
        ));
        params.hedge_size_ratio = HEDGE_SIZE_RATIO_MAX;
    }
    if params.freeze_minutes > FREEZE_MINUTES_MAX {
        reasons.push(format!(
            "freeze_minutes clamped {:.0} -> {FREEZE_MINUTES_MAX:.0}",
            params.freeze_minutes
        ));
        params.freeze_minutes = FREEZE_MINUTES_MAX;
    }

    let has_position = position.map(|p| p.qty > 0.0).unwrap_or(false);
    let needs_position = matches!(
        action,
        EventDecisionAction::RiskOffReduce
            | EventDecisionAction::HardExit
            | EventDecisionAction::Reverse
            | EventDecisionAction::Hedge
    );
    if needs_position && !has_position {
        reasons.push(format!("no position: {action} -> HOLD"));
        return (EventDecisionAction::Hold, params, reasons);
    }

    if snapshot.liquidity_stressed()
        && matches!(
            action,
            EventDecisionAction::Reverse | EventDecisionAction::Hedge
        )
    {
        reasons.push(format!("liquidity stress: {action} -> HARD_EXIT"));
        return (EventDecisionAction::HardExit, params, reasons);
    }

    (action, params, reasons)
}

/// Map the guarded action onto execution-queue rows.
///
/// Returns the created queue ids and whether a REDUCE was upgraded to
/// FULL_CLOSE because the slice fell below the venue minimum.
pub fn map_action_to_execution(
    store: &Store,
    symbol: &str,
    action: EventDecisionAction,
    params: &DecisionParams,
    position: Option<&ExchangePosition>,
) -> Result<(Vec<i64>, bool)> {
    match action {
        EventDecisionAction::Hold => Ok((Vec::new(), false)),

        EventDecisionAction::FreezeNewEntry => {
            let minutes = if params.freeze_minutes > 0.0 {
                params.freeze_minutes
            } else {
                15.0
            };
            acquire_entry_lock(store, minutes, "event_decision freeze")?;
            Ok((Vec::new(), false))
        }

        EventDecisionAction::RiskOffReduce => {
            let Some(pos) = position else {
                return Ok((Vec::new(), false));
            };
            let direction = pos.side.direction();
            let ratio = if params.reduce_ratio > 0.0 {
                params.reduce_ratio
            } else {
                DEFAULT_REDUCE_RATIO
            };
            let reduce_qty = pos.qty * ratio;

            if reduce_qty < MIN_ORDER_QTY_BTC && pos.qty >= MIN_ORDER_QTY_BTC {
                // Too small to reduce but big enough to close: upgrade.
                let mut entry = NewQueueEntry::new(symbol, ActionType::FullClose, direction);
                entry.target_qty = Some(Money::from_f64(pos.qty));
                entry.source = "event_decision".to_string();
                entry.reason = "reduce_upgraded_to_close".to_string();
                entry.priority = 2;
                entry.meta = json!({"reduce_upgraded_to_close": true, "requested_ratio": ratio});
                let id = enqueue_deduped(store, entry)?;
                return Ok((id.into_iter().collect(), true));
            }

            let mut entry = NewQueueEntry::new(symbol, ActionType::Reduce, direction);
            entry.reduce_pct = Some(ratio * 100.0);
            entry.source = "event_decision".to_string();
            entry.reason = "risk_off_reduce".to_string();
            entry.priority = 2;
            let id = enqueue_deduped(store, entry)?;
            Ok((id.into_iter().collect(), false))
        }

        EventDecisionAction::HardExit => {
            let Some(pos) = position else {
                return Ok((Vec::new(), false));
            };
            let mut entry = NewQueueEntry::new(symbol, ActionType::FullClose, pos.side.direction());
            entry.target_qty = Some(Money::from_f64(pos.qty));
            entry.source = "event_decision".to_string();
            entry.reason = "hard_exit".to_string();
            entry.priority = 1;
            let id = enqueue_deduped(store, entry)?;
            Ok((id.into_iter().collect(), false))
        }

        EventDecisionAction::Reverse => {
            let Some(pos) = position else {
                return Ok((Vec::new(), false));
            };
            let current = pos.side.direction();
            let mut close = NewQueueEntry::new(symbol, ActionType::ReverseClose, current);
            close.target_qty = Some(Money::from_f64(pos.qty));
            close.source = "event_decision".to_string();
            close.reason = "event_reverse".to_string();
            close.priority = 1;
            let Some(close_id) = enqueue_deduped(store, close)? else {
                return Ok((Vec::new(), false));
            };

            let open_qty = if params.reverse_size_ratio > 0.0 {
                pos.qty * params.reverse_size_ratio
            } else {
                pos.qty
            };
            let mut open = NewQueueEntry::new(symbol, ActionType::ReverseOpen, current.opposite());
            open.target_qty = Some(Money::from_f64(open_qty));
            open.source = "event_decision".to_string();
            open.reason = "event_reverse".to_string();
            open.priority = 1;
            open.depends_on = Some(close_id);
            open.meta = json!({"reverse_size_ratio": params.reverse_size_ratio});
            let open_id = store.enqueue(&open)?;
            Ok((vec![close_id, open_id], false))
        }

        EventDecisionAction::Hedge => {
            let Some(pos) = position else {
                return Ok((Vec::new(), false));
            };
            let ratio = if params.hedge_size_ratio > 0.0 {
                params.hedge_size_ratio
            } else {
                0.1
            };
            let mut entry =
                NewQueueEntry::new(symbol, ActionType::Add, pos.side.direction().opposite());
            entry.target_qty = Some(Money::from_f64(pos.qty * ratio));
            entry.source = "event_decision".to_string();
            entry.reason = "event_hedge".to_string();
            entry.priority = 2;
            entry.meta = json!({"hedge": true, "hedge_size_ratio": ratio});
            let id = enqueue_deduped(store, entry)?;
            Ok((id.into_iter().collect(), false))
        }
    }
}

fn enqueue_deduped(store: &Store, entry: NewQueueEntry) -> Result<Option<i64>> {
    if let Some(existing) = store.recent_duplicate_queue_entry(
        &entry.symbol,
        entry.action_type,
        entry.direction,
        DEDUP_WINDOW_SEC,
    )? {
        info!(
            "duplicate {} {} blocked (eq_id={existing} already pending)",
            entry.action_type, entry.direction
        );
        return Ok(None);
    }
    let id = store.enqueue(&entry)?;
    info!("enqueued: {} {} eq_id={id}", entry.action_type, entry.direction);
    Ok(Some(id))
}

// ── Entry freeze lock ────────────────────────────────────────────────

pub fn acquire_entry_lock(store: &Store, minutes: f64, reason: &str) -> Result<()> {
    let until = Utc::now() + chrono::Duration::seconds((minutes * 60.0) as i64);
    store.policy_set(
        ENTRY_FREEZE_POLICY_KEY,
        &json!({
            "active": true,
            "until": until.to_rfc3339(),
            "reason": reason,
        }),
        "event decision entry freeze",
    )?;
    info!("entry freeze acquired: {minutes:.0}min ({reason})");
    Ok(())
}

/// True while an entry freeze is active. Expired locks are cleared lazily.
pub fn entry_frozen(store: &Store) -> bool {
    let Ok(Some(value)) = store.policy_get(ENTRY_FREEZE_POLICY_KEY) else {
        return false;
    };
    if !value["active"].as_bool().unwrap_or(false) {
        return false;
    }
    let until = value["until"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
    match until {
        Some(until) if until > Utc::now() => true,
        _ => {
            let _ = store.policy_set(
                ENTRY_FREEZE_POLICY_KEY,
                &json!({"active": false}),
                "event decision entry freeze",
            );
            false
        }
    }
}

// ── Server-side stop enforcement ─────────────────────────────────────

/// Stop price for the position: explicit provider value, or a 2% default
/// on the adverse side of entry.
pub fn stop_price_for(position: &ExchangePosition, params: &DecisionParams) -> f64 {
    if params.new_sl_value > 0.0 {
        return params.new_sl_value;
    }
    match position.side.dir_sign() {
        s if s > 0.0 => position.entry_price * 0.98,
        _ => position.entry_price * 1.02,
    }
}

/// Synchronize the server-side stop. Any failure produces the distinct
/// HARD STOP SET FAILED operator alert; it never aborts the decision flow.
pub async fn enforce_server_stop(
    client: Option<&BybitClient>,
    notifier: &Notifier,
    symbol: &str,
    position: &ExchangePosition,
    params: &DecisionParams,
) -> bool {
    let stop_price = stop_price_for(position, params);
    let result = match client {
        Some(client) => client
            .set_trading_stop(symbol, stop_price)
            .await
            .map_err(|e| e.to_string()),
        None => Err("exchange client unavailable".to_string()),
    };
    match result {
        Ok(()) => {
            info!("server stop synced @ {stop_price}");
            true
        }
        Err(detail) => {
            warn!("server stop sync failed: {detail}");
            notifier.send(&notify::format_hard_stop_failed(&detail)).await;
            false
        }
    }
}

/// Cancel leftover open orders after a full exit. FAIL-OPEN: errors are
/// logged and ignored.
pub async fn post_execution_cleanup(
    client: Option<&BybitClient>,
    symbol: &str,
    action: EventDecisionAction,
    reduce_upgraded: bool,
) {
    let is_exit = matches!(action, EventDecisionAction::HardExit)
        || (matches!(action, EventDecisionAction::RiskOffReduce) && reduce_upgraded);
    if !is_exit {
        return;
    }
    let Some(client) = client else {
        return;
    };
    match client.fetch_open_orders(symbol).await {
        Ok(orders) => {
            for order in &orders {
                if let Err(e) = client.cancel_order(symbol, &order.order_id).await {
                    warn!("orphan cancel failed for {}: {e}", order.order_id);
                } else {
                    info!("orphan order canceled: {}", order.order_id);
                }
            }
        }
        Err(e) => warn!("orphan cleanup skipped: {e}"),
    }
}

// ── Snapshot bundle ──────────────────────────────────────────────────

/// Rich context packet handed to the provider.
pub fn build_snapshot_bundle(
    store: &Store,
    symbol: &str,
    position: Option<&ExchangePosition>,
    snapshot: &MarketSnapshot,
    event: &EventResult,
    open_orders: &[OpenOrder],
) -> serde_json::Value {
    let recent_execution = store
        .recent_realized_trades(symbol, 5)
        .unwrap_or_default()
        .iter()
        .map(|(pnl, mode)| {
            json!({
                "realized_pnl": pnl.map(|p| p.to_f64()),
                "entry_mode": mode.map(|m| m.as_str()),
            })
        })
        .collect::<Vec<_>>();

    json!({
        "symbol": symbol,
        "position": position,
        "orders": open_orders,
        "microstructure": {
            "spread_ok": snapshot.spread_ok,
            "liquidity_ok": snapshot.liquidity_ok,
            "orderbook_imbalance": snapshot.orderbook_imbalance,
        },
        "snapshot": snapshot,
        "triggers": event.triggers,
        "recent_execution": recent_execution,
        "system_health": {
            "entry_frozen": entry_frozen(store),
        },
        "risk_config": {
            "reduce_ratio_max": REDUCE_RATIO_MAX,
            "reverse_size_ratio_max": REVERSE_SIZE_RATIO_MAX,
            "hedge_size_ratio_max": HEDGE_SIZE_RATIO_MAX,
            "freeze_minutes_max": FREEZE_MINUTES_MAX,
        },
    })
}

// ── Orchestration ────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn handle_event_decision(
    store: &Store,
    llm: &LlmClient,
    client: Option<&BybitClient>,
    notifier: &Notifier,
    symbol: &str,
    event: &EventResult,
    snapshot: &MarketSnapshot,
    position: Option<&ExchangePosition>,
) -> Result<DecisionOutcome> {
    let open_orders = match client {
        Some(c) => c.fetch_open_orders(symbol).await.unwrap_or_default(),
        None => Vec::new(),
    };
    let bundle = build_snapshot_bundle(store, symbol, position, snapshot, event, &open_orders);

    let response: EventDecisionResponse = if llm.is_configured() {
        match llm
            .chat(
                llm.deep_model(),
                EVENT_DECISION_SYSTEM_PROMPT,
                &bundle.to_string(),
            )
            .await
        {
            Ok(text) => parse_event_decision_response(&text),
            Err(e) => {
                warn!("event decision provider failed: {e}");
                EventDecisionResponse::hold_fallback()
            }
        }
    } else {
        EventDecisionResponse::hold_fallback()
    };

    let original_action = response.action;
    let (action, params, guard_reasons) =
        apply_safety_guards(response.action, &response.params, position, snapshot);
    for reason in &guard_reasons {
        info!("event decision guard: {reason}");
    }

    let (queue_ids, reduce_upgraded) =
        map_action_to_execution(store, symbol, action, &params, position)?;

    if response.safety_checks.stop_order_required {
        if let Some(pos) = position {
            enforce_server_stop(client, notifier, symbol, pos, &params).await;
        }
    }

    post_execution_cleanup(client, symbol, action, reduce_upgraded).await;

    let result_json = json!({
        "event_class": response.event_class,
        "original_action": original_action.as_str(),
        "final_action": action.as_str(),
        "guard_reasons": guard_reasons,
        "queue_ids": queue_ids,
        "fallback_used": response.fallback_used,
        "confidence": response.confidence,
    });
    store.insert_event_trigger_log(
        symbol,
        crate::types::EventMode::EventDecision.as_str(),
        &serde_json::to_value(&event.triggers)?,
        &event.event_hash,
        Some(Money::from_f64(snapshot.price)),
        true,
        Some(&result_json),
        event.call_type.as_str(),
        false,
    )?;

    let trigger_names: Vec<String> = event
        .trigger_types()
        .iter()
        .map(|t| t.to_string())
        .collect();
    notifier
        .send(&notify::format_event_post_alert(
            &trigger_names,
            action.as_str(),
        ))
        .await;

    Ok(DecisionOutcome {
        action,
        original_action,
        event_class: response.event_class,
        guard_reasons,
        queue_ids,
        fallback_used: response.fallback_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::testutil::base_snapshot;
    use crate::types::{Direction, PositionSide, QueueStatus};

    fn position(side: PositionSide, qty: f64) -> ExchangePosition {
        ExchangePosition {
            side,
            qty,
            entry_price: 95_000.0,
            mark_price: 95_000.0,
            unrealized_pnl: 0.0,
            leverage: 10.0,
            liquidation_price: 85_000.0,
        }
    }

    #[test]
    fn test_guard_clamps_reduce_ratio() {
        let params = DecisionParams {
            reduce_ratio: 0.9,
            ..Default::default()
        };
        let pos = position(PositionSide::Long, 0.01);
        let (action, params, reasons) = apply_safety_guards(
            EventDecisionAction::RiskOffReduce,
            &params,
            Some(&pos),
            &base_snapshot(),
        );
        assert_eq!(action, EventDecisionAction::RiskOffReduce);
        assert_eq!(params.reduce_ratio, 0.70);
        assert!(reasons.iter().any(|r| r.contains("clamped")));
    }

    #[test]
    fn test_guard_liquidity_stress_forces_hard_exit() {
        // Spec scenario 2: REVERSE under spread_ok=false upgrades to HARD_EXIT.
        let mut snap = base_snapshot();
        snap.spread_ok = false;
        let pos = position(PositionSide::Long, 0.01);
        let params = DecisionParams {
            reverse_size_ratio: 0.2,
            ..Default::default()
        };
        let (action, _, reasons) =
            apply_safety_guards(EventDecisionAction::Reverse, &params, Some(&pos), &snap);
        assert_eq!(action, EventDecisionAction::HardExit);
        assert!(reasons.iter().any(|r| r.contains("liquidity stress")));

        let (action, _, reasons) = apply_safety_guards(
            EventDecisionAction::Hedge,
            &DecisionParams::default(),
            Some(&pos),
            &snap,
        );
        assert_eq!(action, EventDecisionAction::HardExit);
        assert!(reasons.iter().any(|r| r.contains("liquidity stress")));
    }

    #[test]
    fn test_guard_allows_reduce_under_liquidity_stress() {
        let mut snap = base_snapshot();
        snap.liquidity_ok = false;
        let pos = position(PositionSide::Long, 0.01);
        let (action, _, _) = apply_safety_guards(
            EventDecisionAction::RiskOffReduce,
            &DecisionParams {
                reduce_ratio: 0.5,
                ..Default::default()
            },
            Some(&pos),
            &snap,
        );
        assert_eq!(action, EventDecisionAction::RiskOffReduce);
    }

    #[test]
    fn test_guard_no_position_becomes_hold() {
        for action in [
            EventDecisionAction::HardExit,
            EventDecisionAction::Reverse,
            EventDecisionAction::Hedge,
            EventDecisionAction::RiskOffReduce,
        ] {
            let (guarded, _, reasons) = apply_safety_guards(
                action,
                &DecisionParams::default(),
                None,
                &base_snapshot(),
            );
            assert_eq!(guarded, EventDecisionAction::Hold, "{action} with no position");
            assert!(reasons.iter().any(|r| r.contains("no position")));
        }
    }

    #[test]
    fn test_guard_stack_order() {
        let mut snap = base_snapshot();
        snap.spread_ok = false;
        let pos = position(PositionSide::Long, 0.01);
        let params = DecisionParams {
            reduce_ratio: 0.9,
            reverse_size_ratio: 0.5,
            hedge_size_ratio: 0.5,
            freeze_minutes: 120.0,
            ..Default::default()
        };
        let (action, params, reasons) =
            apply_safety_guards(EventDecisionAction::Reverse, &params, Some(&pos), &snap);
        assert_eq!(action, EventDecisionAction::HardExit);
        assert_eq!(params.reduce_ratio, 0.70);
        assert_eq!(params.reverse_size_ratio, 0.30);
        assert_eq!(params.hedge_size_ratio, 0.30);
        assert_eq!(params.freeze_minutes, 60.0);
        assert!(reasons.len() >= 5);
    }

    #[test]
    fn test_map_hold_no_rows() {
        let store = Store::open_in_memory().unwrap();
        let (ids, upgraded) = map_action_to_execution(
            &store,
            "BTC/USDT:USDT",
            EventDecisionAction::Hold,
            &DecisionParams::default(),
            Some(&position(PositionSide::Long, 0.01)),
        )
        .unwrap();
        assert!(ids.is_empty());
        assert!(!upgraded);
        assert_eq!(store.pending_queue_count("BTC/USDT:USDT").unwrap(), 0);
    }

    #[test]
    fn test_map_reduce_to_queue_row() {
        let store = Store::open_in_memory().unwrap();
        let (ids, upgraded) = map_action_to_execution(
            &store,
            "BTC/USDT:USDT",
            EventDecisionAction::RiskOffReduce,
            &DecisionParams {
                reduce_ratio: 0.5,
                ..Default::default()
            },
            Some(&position(PositionSide::Long, 0.01)),
        )
        .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(!upgraded);
        let entry = store.get_queue_entry(ids[0]).unwrap().unwrap();
        assert_eq!(entry.action_type, ActionType::Reduce);
        assert_eq!(entry.reduce_pct, Some(50.0));
        assert_eq!(entry.status, QueueStatus::Pending);
    }

    #[test]
    fn test_map_reduce_upgrade_to_full_close() {
        // Spec scenario 4: 30% of 0.002 BTC = 0.0006 < minQty 0.001 while the
        // position itself is closeable → FULL_CLOSE, tagged.
        let store = Store::open_in_memory().unwrap();
        let (ids, upgraded) = map_action_to_execution(
            &store,
            "BTC/USDT:USDT",
            EventDecisionAction::RiskOffReduce,
            &DecisionParams {
                reduce_ratio: 0.3,
                ..Default::default()
            },
            Some(&position(PositionSide::Long, 0.002)),
        )
        .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(upgraded);
        let entry = store.get_queue_entry(ids[0]).unwrap().unwrap();
        assert_eq!(entry.action_type, ActionType::FullClose);
        assert_eq!(entry.reason, "reduce_upgraded_to_close");
        assert_eq!(entry.meta["reduce_upgraded_to_close"], true);
    }

    #[test]
    fn test_map_hard_exit_full_close() {
        let store = Store::open_in_memory().unwrap();
        let (ids, _) = map_action_to_execution(
            &store,
            "BTC/USDT:USDT",
            EventDecisionAction::HardExit,
            &DecisionParams::default(),
            Some(&position(PositionSide::Long, 0.01)),
        )
        .unwrap();
        assert_eq!(ids.len(), 1);
        let entry = store.get_queue_entry(ids[0]).unwrap().unwrap();
        assert_eq!(entry.action_type, ActionType::FullClose);
        assert_eq!(entry.priority, 1);
    }

    #[test]
    fn test_map_reverse_pair_linked() {
        let store = Store::open_in_memory().unwrap();
        let (ids, _) = map_action_to_execution(
            &store,
            "BTC/USDT:USDT",
            EventDecisionAction::Reverse,
            &DecisionParams {
                reverse_size_ratio: 0.2,
                ..Default::default()
            },
            Some(&position(PositionSide::Long, 0.01)),
        )
        .unwrap();
        assert_eq!(ids.len(), 2);
        let close = store.get_queue_entry(ids[0]).unwrap().unwrap();
        let open = store.get_queue_entry(ids[1]).unwrap().unwrap();
        assert_eq!(close.action_type, ActionType::ReverseClose);
        assert_eq!(close.direction, Direction::Long);
        assert!(close.depends_on.is_none());
        assert_eq!(open.action_type, ActionType::ReverseOpen);
        assert_eq!(open.direction, Direction::Short);
        assert_eq!(open.depends_on, Some(close.id));
    }

    #[test]
    fn test_map_hedge_opposite_add() {
        let store = Store::open_in_memory().unwrap();
        let (ids, _) = map_action_to_execution(
            &store,
            "BTC/USDT:USDT",
            EventDecisionAction::Hedge,
            &DecisionParams {
                hedge_size_ratio: 0.2,
                ..Default::default()
            },
            Some(&position(PositionSide::Long, 0.01)),
        )
        .unwrap();
        assert_eq!(ids.len(), 1);
        let entry = store.get_queue_entry(ids[0]).unwrap().unwrap();
        assert_eq!(entry.action_type, ActionType::Add);
        assert_eq!(entry.direction, Direction::Short);
    }

    #[test]
    fn test_freeze_new_entry_sets_lock_only() {
        let store = Store::open_in_memory().unwrap();
        assert!(!entry_frozen(&store));
        let (ids, _) = map_action_to_execution(
            &store,
            "BTC/USDT:USDT",
            EventDecisionAction::FreezeNewEntry,
            &DecisionParams {
                freeze_minutes: 15.0,
                ..Default::default()
            },
            Some(&position(PositionSide::Long, 0.01)),
        )
        .unwrap();
        assert!(ids.is_empty());
        assert_eq!(store.pending_queue_count("BTC/USDT:USDT").unwrap(), 0);
        assert!(entry_frozen(&store));
    }

    #[test]
    fn test_stop_price_default_and_explicit() {
        let pos = position(PositionSide::Long, 0.01);
        let explicit = DecisionParams {
            new_sl_value: 93_000.0,
            ..Default::default()
        };
        assert_eq!(stop_price_for(&pos, &explicit), 93_000.0);
        let default = stop_price_for(&pos, &DecisionParams::default());
        assert!((default - 95_000.0 * 0.98).abs() < 1e-6);
        let short = position(PositionSide::Short, 0.01);
        let default = stop_price_for(&short, &DecisionParams::default());
        assert!((default - 95_000.0 * 1.02).abs() < 1e-6);
    }
}
