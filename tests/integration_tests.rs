//! Integration tests for the perp-core system.
//!
//! These exercise the decision → queue → fill-settlement pipeline against an
//! in-memory store, end to end, without touching the network.

use chrono::Utc;

use perp_core::compliance::{
    align_price, align_qty, ComplianceLayer, OrderExecType, OrderParams,
};
use perp_core::events::decision::{apply_safety_guards, map_action_to_execution};
use perp_core::events::trigger::{EventTriggerEngine, PrevCycle, TriggerConfig, TriggerType};
use perp_core::exchange::{ExchangeError, MarketInfo};
use perp_core::fill_watcher::{apply_add_fill, apply_entry_fill, exit_realized_pnl};
use perp_core::llm::DecisionParams;
use perp_core::position_manager::{enqueue_action, enqueue_reverse};
use perp_core::snapshot::testutil::base_snapshot;
use perp_core::store::{migrations, NewQueueEntry, PositionState, Store};
use perp_core::types::{
    ActionType, CallType, Direction, EventDecisionAction, EventMode, ExchangePosition, Money,
    PlanState, PositionSide, QueueStatus,
};

const SYMBOL: &str = "BTC/USDT:USDT";

fn long_position(qty: f64) -> ExchangePosition {
    ExchangePosition {
        side: PositionSide::Long,
        qty,
        entry_price: 95_000.0,
        mark_price: 95_000.0,
        unrealized_pnl: 0.0,
        leverage: 10.0,
        liquidation_price: 85_000.0,
    }
}

// =============================================================================
// Scenario 1: flash drop escalates to EVENT_DECISION
// =============================================================================

#[test]
fn test_flash_drop_escalates_to_event_decision() {
    let mut engine = EventTriggerEngine::new(TriggerConfig {
        bundle_window_sec: 0.0,
        event_decision_mode: true,
        daily_deep_call_cap: 30,
    });

    let mut snap = base_snapshot();
    snap.returns.ret_1m = Some(-0.55);

    let result = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
    assert_eq!(result.mode, EventMode::EventDecision);
    assert_eq!(result.call_type, CallType::AutoEmergency);
    assert!(result
        .trigger_types()
        .contains(&TriggerType::PriceSpike1m));
    assert!(!result.event_hash.is_empty());
}

#[test]
fn test_flash_drop_stays_default_without_flag() {
    let mut engine = EventTriggerEngine::new(TriggerConfig {
        bundle_window_sec: 0.0,
        event_decision_mode: false,
        daily_deep_call_cap: 30,
    });
    let mut snap = base_snapshot();
    snap.returns.ret_1m = Some(-0.55);
    let result = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
    assert_eq!(result.mode, EventMode::Default);
}

// =============================================================================
// Scenario 2: liquidity stress upgrades REVERSE to HARD_EXIT
// =============================================================================

#[test]
fn test_liquidity_stress_reverse_becomes_hard_exit() {
    let mut snap = base_snapshot();
    snap.spread_ok = false;
    let pos = long_position(0.01);

    let (action, _, reasons) = apply_safety_guards(
        EventDecisionAction::Reverse,
        &DecisionParams {
            reverse_size_ratio: 0.2,
            ..Default::default()
        },
        Some(&pos),
        &snap,
    );
    assert_eq!(action, EventDecisionAction::HardExit);
    assert!(reasons.iter().any(|r| r.contains("liquidity stress")));

    // The upgraded action maps to a FULL_CLOSE queue row.
    let store = Store::open_in_memory().unwrap();
    let (ids, _) = map_action_to_execution(
        &store,
        SYMBOL,
        action,
        &DecisionParams::default(),
        Some(&pos),
    )
    .unwrap();
    assert_eq!(ids.len(), 1);
    let row = store.get_queue_entry(ids[0]).unwrap().unwrap();
    assert_eq!(row.action_type, ActionType::FullClose);
}

// =============================================================================
// Scenario 3: reverse pair enqueue
// =============================================================================

#[test]
fn test_reverse_pair_rows_are_linked() {
    let store = Store::open_in_memory().unwrap();
    let pos = long_position(0.01);

    let (close_id, open_id) =
        enqueue_reverse(&store, SYMBOL, &pos, "score_reversal", 2, None, false)
            .unwrap()
            .unwrap();

    let close = store.get_queue_entry(close_id).unwrap().unwrap();
    let open = store.get_queue_entry(open_id).unwrap().unwrap();

    assert_eq!(close.action_type, ActionType::ReverseClose);
    assert_eq!(close.direction, Direction::Long);
    assert_eq!(close.priority, 2);
    assert!(close.depends_on.is_none());

    assert_eq!(open.action_type, ActionType::ReverseOpen);
    assert_eq!(open.direction, Direction::Short);
    assert_eq!(open.priority, 2);
    assert_eq!(open.depends_on, Some(close_id));
}

// =============================================================================
// Scenario 4: reduce-below-minimum upgrade
// =============================================================================

#[test]
fn test_reduce_below_min_upgrades_to_full_close() {
    let store = Store::open_in_memory().unwrap();
    // qty=0.002, stepSize/minQty=0.001, reduce 30% → 0.0006 < minQty.
    let mut entry = NewQueueEntry::new(SYMBOL, ActionType::Reduce, Direction::Long);
    entry.reduce_pct = Some(30.0);

    let id = enqueue_action(
        &store,
        SYMBOL,
        ActionType::Reduce,
        Direction::Long,
        entry,
        0.002,
        0.001,
        false,
    )
    .unwrap()
    .unwrap();

    let row = store.get_queue_entry(id).unwrap().unwrap();
    assert_eq!(row.action_type, ActionType::FullClose);
    assert_eq!(row.reason, "reduce_upgraded_to_close");
    assert_eq!(row.meta["reduce_upgraded_to_close"], true);
}

// =============================================================================
// Scenario 5: consecutive-error auto block
// =============================================================================

#[test]
fn test_three_venue_errors_auto_block_fourth_validation() {
    let mut layer = ComplianceLayer::with_defaults(SYMBOL);
    layer.install_market_info(MarketInfo::fallback_btc_usdt());

    for _ in 0..3 {
        let err = ExchangeError::InvalidOrder("qty below the exchange minimum".into());
        let mapped = layer.map_and_record_error(&err);
        assert_eq!(mapped.error_code, 10001);
    }

    let result = layer.validate(&OrderParams {
        side: Direction::Long,
        qty: 0.01,
        price: None,
        order_type: OrderExecType::Market,
        reduce_only: false,
        position_qty: 0.0,
        usdt_value: 0.0,
    });
    assert!(!result.ok);
    assert!(result.reason.contains("auto-blocked"));
    assert!(result.reason.contains("s remaining"));
}

// =============================================================================
// Scenario 6: adaptive combined floor
// =============================================================================

#[test]
fn test_adaptive_combined_penalty_floor() {
    use perp_core::adaptive::{AdaptiveEngine, TradeOutcome};
    use perp_core::types::EntryMode;

    let mut engine = AdaptiveEngine::with_defaults();
    // 12 consecutive MeanRev losses: L1 penalty 0.70 (streak) and L5 penalty
    // 0.75 (mode WR 0% over ≥10 samples).
    let trades: Vec<TradeOutcome> = (0..12)
        .map(|_| TradeOutcome {
            realized_pnl: Some(Money::from_f64(-1.0)),
            entry_mode: Some(EntryMode::MeanRev),
        })
        .collect();

    let result = engine.apply_layers(
        &trades,
        EntryMode::MeanRev,
        "OK",
        true,
        0.0,
        0.0,
        1_000_000.0,
    );
    assert_eq!(result.l1.penalty, 0.70);
    assert_eq!(result.l5.penalty, 0.75);
    // max(0.55, 0.70 × 0.75 = 0.525) = 0.55
    assert_eq!(result.combined_penalty, 0.55);
}

// =============================================================================
// Queue ordering and migration invariants
// =============================================================================

#[test]
fn test_queue_total_order_priority_then_fifo() {
    let store = Store::open_in_memory().unwrap();

    let mut add = NewQueueEntry::new(SYMBOL, ActionType::Add, Direction::Long);
    add.priority = 5;
    let mut close = NewQueueEntry::new(SYMBOL, ActionType::Close, Direction::Long);
    close.priority = 2;
    let mut reduce_a = NewQueueEntry::new(SYMBOL, ActionType::Reduce, Direction::Long);
    reduce_a.priority = 3;
    let mut reduce_b = NewQueueEntry::new(SYMBOL, ActionType::Reduce, Direction::Short);
    reduce_b.priority = 3;

    let add_id = store.enqueue(&add).unwrap();
    let close_id = store.enqueue(&close).unwrap();
    let ra_id = store.enqueue(&reduce_a).unwrap();
    let rb_id = store.enqueue(&reduce_b).unwrap();

    let pending = store.pending_queue_entries(SYMBOL).unwrap();
    let ids: Vec<i64> = pending.iter().map(|e| e.id).collect();
    // priority ASC, then id ASC within the same priority.
    assert_eq!(ids, vec![close_id, ra_id, rb_id, add_id]);
}

#[test]
fn test_migrations_are_idempotent() {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    for _ in 0..3 {
        migrations::run_all(&conn).unwrap();
    }
    let tables: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN
             ('position_state','execution_queue','execution_log','pm_decision_log')",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(tables, 4);
}

#[test]
fn test_align_round_trips() {
    let q = align_qty(0.0123456, 0.001);
    assert_eq!(align_qty(q, 0.001), q);
    let p = align_price(95_123.456, 0.1);
    assert_eq!(align_price(p, 0.1), p);
}

// =============================================================================
// Fill settlement pipeline against the store
// =============================================================================

#[test]
fn test_entry_then_add_then_close_settlement() {
    let store = Store::open_in_memory().unwrap();

    // Entry fill.
    let mut ps = PositionState::flat(SYMBOL);
    apply_entry_fill(
        &mut ps,
        PositionSide::Long,
        0.01,
        95_000.0,
        0.01,
        1,
        10.0,
        0.5,
    );
    store.save_position_state(&ps, true).unwrap();

    let loaded = store.get_position_state(SYMBOL).unwrap().unwrap();
    assert_eq!(loaded.stage, 1);
    assert_eq!(loaded.stage_consumed_mask, 0b1);
    assert_eq!(loaded.stage, loaded.stage_consumed_mask.count_ones());
    assert_eq!(loaded.plan_state, PlanState::Open);

    // ADD fill.
    let mut ps = loaded;
    let (stage, budget) = apply_add_fill(&mut ps, PositionSide::Long, 0.02, 0.01, 96_000.0, 0.5);
    store.save_position_state(&ps, true).unwrap();
    assert_eq!(stage, 2);
    assert_eq!(budget, 20.0);
    assert!(budget <= 70.0, "trade budget must never exceed 70%");

    let loaded = store.get_position_state(SYMBOL).unwrap().unwrap();
    assert_eq!(loaded.stage, 2);
    assert_eq!(loaded.stage, loaded.stage_consumed_mask.count_ones());
    assert_eq!(loaded.stages_detail.len(), 2);

    // Full exit: PnL nets the whole remaining entry fee, state clears.
    let pnl = exit_realized_pnl(
        96_500.0,
        loaded.avg_entry_price.to_f64(),
        loaded.total_qty.to_f64(),
        1.0,
        1.0,
        loaded.accumulated_entry_fee.to_f64(),
    );
    assert!(pnl > 0.0);

    let mut ps = loaded;
    ps.clear_to_flat();
    store.save_position_state(&ps, true).unwrap();

    let cleared = store.get_position_state(SYMBOL).unwrap().unwrap();
    assert!(cleared.side.is_none());
    assert_eq!(cleared.plan_state, PlanState::None);
    assert!(cleared.total_qty.is_zero());
}

#[test]
fn test_queue_status_propagation() {
    let store = Store::open_in_memory().unwrap();
    let entry = NewQueueEntry::new(SYMBOL, ActionType::Reduce, Direction::Long);
    let id = store.enqueue(&entry).unwrap();

    store.set_queue_status(id, QueueStatus::Picked).unwrap();
    assert_eq!(
        store.get_queue_entry(id).unwrap().unwrap().status,
        QueueStatus::Picked
    );
    store.set_queue_status(id, QueueStatus::Filled).unwrap();
    assert_eq!(
        store.get_queue_entry(id).unwrap().unwrap().status,
        QueueStatus::Filled
    );
}

// =============================================================================
// Event-hash dedup round trip
// =============================================================================

#[test]
fn test_event_hash_dedup_and_distinct_pass() {
    let mut engine = EventTriggerEngine::new(TriggerConfig {
        bundle_window_sec: 0.0,
        event_decision_mode: false,
        daily_deep_call_cap: 30,
    });

    let mut snap = base_snapshot();
    snap.returns.ret_1m = Some(-1.5);
    let first = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
    assert_eq!(first.mode, EventMode::Event);

    assert!(!engine.check_event_hash_dedup(&first.event_hash));
    engine.record_event_hash(&first.event_hash);
    assert!(engine.check_event_hash_dedup(&first.event_hash));

    // A different bundle content hashes differently and passes.
    let mut calm = base_snapshot();
    calm.returns.ret_1m = Some(0.0);
    calm.vol_ratio = 2.5;
    let second = engine.evaluate(Some(&calm), &PrevCycle::default(), None);
    assert_eq!(second.mode, EventMode::Event);
    assert_ne!(first.event_hash, second.event_hash);
    assert!(!engine.check_event_hash_dedup(&second.event_hash));
}

// =============================================================================
// Reconciler boundary: intent drift waits, aged drift heals
// =============================================================================

#[test]
fn test_reconciler_wait_vs_heal_boundary() {
    use perp_core::reconciler::{classify, healing_action, HealAction, ReconcileStatus};

    let now = Utc::now();
    let mut fresh = PositionState::flat(SYMBOL);
    fresh.side = Some(PositionSide::Long);
    fresh.total_qty = Money::from_f64(0.01);
    fresh.plan_state = PlanState::Entering;
    fresh.state_changed_at = Some(now - chrono::Duration::seconds(60));

    let report = classify(Ok(&None), Ok(&fresh), now);
    assert_eq!(
        report.status,
        ReconcileStatus::Mismatch {
            needs_healing: false
        },
        "fresh intent drift must wait, not heal"
    );
    assert_eq!(healing_action(&None, &fresh, now), None);

    let mut aged = fresh.clone();
    aged.state_changed_at = Some(now - chrono::Duration::seconds(700));
    let report = classify(Ok(&None), Ok(&aged), now);
    assert_eq!(
        report.status,
        ReconcileStatus::Mismatch { needs_healing: true }
    );
    assert_eq!(
        healing_action(&None, &aged, now),
        Some(HealAction::ResetToFlat)
    );
}
