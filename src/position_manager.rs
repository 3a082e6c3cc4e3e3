//! Position Manager daemon.
//!
//! Adaptive 10-30s control loop: observes the live exchange position, builds
//! a market context, evaluates event triggers, and emits intent records. It
//! NEVER places orders; every action goes through `execution_queue` for the
//! external executor, and every cycle lands in `pm_decision_log`.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::compliance::ComplianceLayer;
use crate::config::Config;
use crate::control::ControlFlags;
use crate::events::decision::handle_event_decision;
use crate::events::trigger::{
    EventResult, EventTriggerEngine, PrevCycle, TriggerConfig, MIN_ORDER_QTY_BTC,
};
use crate::exchange::BybitClient;
use crate::llm::{parse_advisory_response, AdvisoryResponse, LlmClient};
use crate::notify::{self, Notifier};
use crate::safety;
use crate::snapshot::{self, MarketSnapshot};
use crate::store::{DecisionLogEntry, NewQueueEntry, Store};
use crate::types::{
    ActionType, CallType, Direction, EventMode, ExchangePosition, Money, PmAction, PositionSide,
};

pub const LOOP_FAST_SEC: u64 = 10;
pub const LOOP_NORMAL_SEC: u64 = 15;
pub const LOOP_SLOW_SEC: u64 = 30;

const QUEUE_DEDUP_WINDOW_SEC: i64 = 300;
const CONSECUTIVE_HOLD_LIMIT: usize = 3;
const MINI_REDUCE_DEFAULT_PCT: f64 = 25.0;

/// What the loop should do after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Sleep(u64),
    Exit,
}

// ── Score engine ─────────────────────────────────────────────────────

/// Local score computation over the snapshot. The dominant side is whichever
/// cumulative weighted score wins.
#[derive(Debug, Clone)]
pub struct Scores {
    pub long_score: f64,
    pub short_score: f64,
    pub dominant_side: Direction,
    pub total_score: f64,
    pub dynamic_stop_loss_pct: f64,
}

impl Default for Scores {
    fn default() -> Self {
        Scores {
            long_score: 50.0,
            short_score: 50.0,
            dominant_side: Direction::Long,
            total_score: 0.0,
            dynamic_stop_loss_pct: 2.0,
        }
    }
}

pub fn compute_scores(snapshot: &MarketSnapshot) -> Scores {
    let mut long_score: f64 = 50.0;
    let mut short_score: f64 = 50.0;

    if let Some(rsi) = snapshot.rsi_14 {
        if rsi < 30.0 {
            long_score += 15.0;
        } else if rsi < 45.0 {
            long_score += 7.0;
        } else if rsi > 70.0 {
            short_score += 15.0;
        } else if rsi > 55.0 {
            short_score += 7.0;
        }
    }
    if let (Some(tenkan), Some(kijun)) = (snapshot.tenkan, snapshot.kijun) {
        if tenkan > kijun {
            long_score += 10.0;
        } else if tenkan < kijun {
            short_score += 10.0;
        }
    }
    if let (Some(ma50), Some(ma200)) = (snapshot.ma_50, snapshot.ma_200) {
        if ma50 > ma200 {
            long_score += 8.0;
        } else if ma50 < ma200 {
            short_score += 8.0;
        }
    }
    if let Some(kijun) = snapshot.kijun {
        if snapshot.price > kijun {
            long_score += 7.0;
        } else if snapshot.price < kijun {
            short_score += 7.0;
        }
    }
    match snapshot.regime.as_str() {
        "DRIFT_UP" => long_score += 10.0 * snapshot.regime_confidence,
        "DRIFT_DOWN" => short_score += 10.0 * snapshot.regime_confidence,
        "BREAKOUT" => {
            if snapshot.impulse >= 0.0 {
                long_score += 8.0;
            } else {
                short_score += 8.0;
            }
        }
        _ => {}
    }
    long_score = long_score.min(100.0);
    short_score = short_score.min(100.0);

    // Wider stop in expanded-volatility conditions, tighter in quiet ones.
    let dynamic_sl = snapshot
        .atr_pct
        .map(|ap| (ap * 10.0).clamp(1.0, 3.5))
        .unwrap_or(2.0);

    Scores {
        long_score,
        short_score,
        dominant_side: if long_score >= short_score {
            Direction::Long
        } else {
            Direction::Short
        },
        total_score: long_score - short_score,
        dynamic_stop_loss_pct: dynamic_sl,
    }
}

// ── Deterministic decision engine ────────────────────────────────────

/// Context for one deterministic decision.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub position: Option<ExchangePosition>,
    pub price: f64,
    pub scores: Scores,
    pub tenkan: Option<f64>,
    pub kijun: Option<f64>,
    pub rsi: Option<f64>,
    pub ma_50: Option<f64>,
    pub ma_200: Option<f64>,
    pub stage: u32,
    pub budget_used_pct: f64,
}

impl DecisionContext {
    pub fn from_snapshot(
        position: Option<ExchangePosition>,
        snapshot: &MarketSnapshot,
        scores: Scores,
        stage: u32,
        budget_used_pct: f64,
    ) -> Self {
        DecisionContext {
            position,
            price: snapshot.price,
            scores,
            tenkan: snapshot.tenkan,
            kijun: snapshot.kijun,
            rsi: snapshot.rsi_14,
            ma_50: snapshot.ma_50,
            ma_200: snapshot.ma_200,
            stage,
            budget_used_pct,
        }
    }
}

/// Count structural confirmations for a reversal toward `target`: tenkan/
/// kijun cross, RSI extreme, 50/200 MA order, price vs kijun. 0-4.
pub fn structure_confirms(ctx: &DecisionContext, target: Direction) -> u32 {
    let mut confirms = 0;
    match target {
        Direction::Long => {
            if let (Some(t), Some(k)) = (ctx.tenkan, ctx.kijun) {
                if t > k {
                    confirms += 1;
                }
            }
            if ctx.rsi.map(|r| r < 40.0).unwrap_or(false) {
                confirms += 1;
            }
            if let (Some(m50), Some(m200)) = (ctx.ma_50, ctx.ma_200) {
                if m50 > m200 {
                    confirms += 1;
                }
            }
            if let Some(k) = ctx.kijun {
                if ctx.price > 0.0 && ctx.price > k {
                    confirms += 1;
                }
            }
        }
        Direction::Short => {
            if let (Some(t), Some(k)) = (ctx.tenkan, ctx.kijun) {
                if t < k {
                    confirms += 1;
                }
            }
            if ctx.rsi.map(|r| r > 60.0).unwrap_or(false) {
                confirms += 1;
            }
            if let (Some(m50), Some(m200)) = (ctx.ma_50, ctx.ma_200) {
                if m50 < m200 {
                    confirms += 1;
                }
            }
            if let Some(k) = ctx.kijun {
                if ctx.price > 0.0 && ctx.price < k {
                    confirms += 1;
                }
            }
        }
    }
    confirms
}

/// The deterministic DEFAULT-mode decision. Exactly one of HOLD / ADD /
/// REDUCE / CLOSE / REVERSE, with its reason.
pub fn decide(ctx: &DecisionContext) -> (PmAction, String) {
    let Some(position) = &ctx.position else {
        // Entries are owned by the autopilot subsystem.
        return (PmAction::Hold, "no position".to_string());
    };

    let side = position.side;
    let entry = position.entry_price;
    let price = ctx.price;
    let scores = &ctx.scores;

    // Stop-loss first.
    if entry > 0.0 && price > 0.0 {
        let sl_dist = match side {
            PositionSide::Long => (price - entry) / entry * 100.0,
            PositionSide::Short => (entry - price) / entry * 100.0,
        };
        let sl_pct = scores.dynamic_stop_loss_pct;
        if sl_dist <= -sl_pct {
            return (
                PmAction::Close,
                format!("stop_loss hit ({sl_dist:.2}% vs -{sl_pct}%)"),
            );
        }
    }

    // Reversal: opposing dominant side with strong score and structure.
    let own_direction = side.direction();
    let counter = own_direction.opposite();
    let (own_score, counter_score) = match own_direction {
        Direction::Long => (scores.long_score, scores.short_score),
        Direction::Short => (scores.short_score, scores.long_score),
    };
    if scores.dominant_side == counter && counter_score >= 70.0 {
        let confirms = structure_confirms(ctx, counter);
        if confirms >= 3 {
            return (
                PmAction::Reverse,
                format!("strong {counter} reversal (score={counter_score}, confirms={confirms})"),
            );
        }
    }

    // ADD while pyramiding room remains.
    if ctx.stage < safety::MAX_STAGE
        && ctx.budget_used_pct < safety::TRADE_BUDGET_CAP_PCT
        && scores.dominant_side == own_direction
        && own_score >= 65.0
    {
        return (
            PmAction::Add,
            format!("score {own_score} favors {own_direction}, stage={}", ctx.stage),
        );
    }

    // Reduce on strong counter signal.
    if counter_score >= 65.0 && own_score <= 40.0 {
        return (
            PmAction::Reduce,
            format!(
                "counter signal (long={}, short={})",
                scores.long_score, scores.short_score
            ),
        );
    }

    (PmAction::Hold, "no action needed".to_string())
}

// ── Enqueue semantics ────────────────────────────────────────────────

/// Insert one action into the execution queue with the duplicate guard,
/// safety pre-checks and the reduce-below-minimum upgrade applied.
#[allow(clippy::too_many_arguments)]
pub fn enqueue_action(
    store: &Store,
    symbol: &str,
    action_type: ActionType,
    direction: Direction,
    mut entry: NewQueueEntry,
    position_qty: f64,
    min_qty: f64,
    emergency: bool,
) -> Result<Option<i64>> {
    // Duplicate-within-window guard.
    if store
        .recent_duplicate_queue_entry(symbol, action_type, direction, QUEUE_DEDUP_WINDOW_SEC)?
        .is_some()
    {
        info!("duplicate {action_type} {direction} blocked (already pending in queue)");
        return Ok(None);
    }

    // Safety gates: denial drops risk-adding decisions.
    let target_usdt = entry.target_usdt.map(|m| m.to_f64()).unwrap_or(0.0);
    let (ok, reason) = safety::run_all_checks(store, symbol, target_usdt, emergency)?;
    if !ok && matches!(action_type, ActionType::Add | ActionType::Open) {
        warn!("safety block: {reason}");
        return Ok(None);
    }

    // Reduce-below-minimum upgrade: never silently drop the intent.
    if action_type == ActionType::Reduce {
        if let Some(pct) = entry.reduce_pct {
            let reduce_qty = position_qty * pct / 100.0;
            if reduce_qty < min_qty && position_qty >= min_qty {
                info!(
                    "reduce {pct:.0}% of {position_qty} -> {reduce_qty:.4} < minQty {min_qty}, upgraded to FULL_CLOSE"
                );
                entry.action_type = ActionType::FullClose;
                entry.reduce_pct = None;
                entry.target_qty = Some(Money::from_f64(position_qty));
                entry.reason = "reduce_upgraded_to_close".to_string();
                entry.meta["reduce_upgraded_to_close"] = json!(true);
                entry.meta["requested_reduce_pct"] = json!(pct);
                let id = store.enqueue(&entry)?;
                info!("enqueued: FULL_CLOSE {direction} eq_id={id}");
                return Ok(Some(id));
            }
        }
    }

    let id = store.enqueue(&entry)?;
    info!("enqueued: {action_type} {direction} eq_id={id}");
    Ok(Some(id))
}

/// A REVERSE decomposes into a linked CLOSE→OPEN pair; the OPEN depends on
/// the CLOSE's row id so the executor serializes them.
pub fn enqueue_reverse(
    store: &Store,
    symbol: &str,
    position: &ExchangePosition,
    reason: &str,
    priority: i64,
    pm_decision_id: Option<i64>,
    emergency: bool,
) -> Result<Option<(i64, i64)>> {
    let current = position.side.direction();

    let mut close = NewQueueEntry::new(symbol, ActionType::ReverseClose, current);
    close.target_qty = Some(Money::from_f64(position.qty));
    close.reason = reason.to_string();
    close.priority = priority;
    close.pm_decision_id = pm_decision_id;
    let Some(close_id) = enqueue_action(
        store,
        symbol,
        ActionType::ReverseClose,
        current,
        close,
        position.qty,
        MIN_ORDER_QTY_BTC,
        emergency,
    )?
    else {
        return Ok(None);
    };

    let mut open = NewQueueEntry::new(symbol, ActionType::ReverseOpen, current.opposite());
    open.reason = reason.to_string();
    open.priority = priority;
    open.pm_decision_id = pm_decision_id;
    open.depends_on = Some(close_id);
    let open_id = store.enqueue(&open)?;
    info!("enqueued reverse pair: close={close_id} open={open_id}");
    Ok(Some((close_id, open_id)))
}

// ── Daemon ───────────────────────────────────────────────────────────

pub struct PositionManager {
    symbol: String,
    store: Store,
    client: BybitClient,
    notifier: Notifier,
    llm: LlmClient,
    pub triggers: EventTriggerEngine,
    compliance: ComplianceLayer,
    control: ControlFlags,
    prev_cycle: PrevCycle,
    prev_side: Option<PositionSide>,
    recent_actions: Vec<String>,
}

impl PositionManager {
    pub fn new(config: &Config, store: Store, event_decision_mode: bool) -> Self {
        let client = BybitClient::new(
            config.exchange.api_key.clone().unwrap_or_default(),
            config.exchange.api_secret.clone().unwrap_or_default(),
            config.exchange.recv_window_ms,
            config.exchange.http_timeout_sec,
        );
        PositionManager {
            symbol: config.symbol.clone(),
            store,
            client,
            notifier: Notifier::new(&config.telegram),
            llm: LlmClient::new(config.llm.clone()),
            triggers: EventTriggerEngine::new(TriggerConfig {
                event_decision_mode,
                daily_deep_call_cap: config.llm.daily_deep_call_cap,
                ..Default::default()
            }),
            compliance: ComplianceLayer::with_defaults(&config.symbol),
            control: ControlFlags::new(&config.control_dir),
            prev_cycle: PrevCycle::default(),
            prev_side: None,
            recent_actions: Vec::new(),
        }
    }

    fn record_action(&mut self, action: &str) {
        self.recent_actions.push(action.to_string());
        let overflow = self
            .recent_actions
            .len()
            .saturating_sub(CONSECUTIVE_HOLD_LIMIT + 1);
        if overflow > 0 {
            self.recent_actions.drain(0..overflow);
        }
    }

    fn consecutive_hold(&self) -> bool {
        self.recent_actions.len() >= CONSECUTIVE_HOLD_LIMIT
            && self
                .recent_actions
                .iter()
                .rev()
                .take(CONSECUTIVE_HOLD_LIMIT)
                .all(|a| a == "HOLD")
    }

    fn reset_hold_tracker(&mut self, reason: &str) {
        self.recent_actions.clear();
        info!("hold tracker RESET ({reason})");
    }

    /// One position-management cycle. Errors inside are handled; the caller
    /// only sees the next sleep duration or an exit request.
    pub async fn cycle(&mut self) -> CycleOutcome {
        if self.control.kill_switch_active() {
            info!("KILL_SWITCH detected. Exiting.");
            return CycleOutcome::Exit;
        }
        if self.control.paused() {
            return CycleOutcome::Sleep(LOOP_SLOW_SEC);
        }
        match self.run_cycle().await {
            Ok(sleep) => CycleOutcome::Sleep(sleep),
            Err(e) => {
                error!("cycle error: {e:#}");
                CycleOutcome::Sleep(LOOP_SLOW_SEC)
            }
        }
    }

    async fn run_cycle(&mut self) -> Result<u64> {
        // Trading must be switched on.
        if !self.store.trade_switch_enabled()? {
            info!("trade switch off, sleeping");
            return Ok(LOOP_SLOW_SEC);
        }

        // Exchange position is the source of truth.
        let position = match self.client.fetch_position(&self.symbol).await {
            Ok(pos) => pos,
            Err(e) => {
                warn!("position fetch failed: {e}");
                return Ok(LOOP_SLOW_SEC);
            }
        };
        let Some(position) = position else {
            info!("no position, sleeping");
            return Ok(LOOP_SLOW_SEC);
        };

        // Side change resets edge state and the HOLD tracker.
        let current_side = Some(position.side);
        if self.prev_side.is_some() && current_side != self.prev_side {
            let reason = format!(
                "position: {:?}->{:?}",
                self.prev_side.map(|s| s.as_str()),
                current_side.map(|s| s.as_str())
            );
            self.triggers.reset_edge_state(&reason);
            self.reset_hold_tracker(&reason);
        }
        self.prev_side = current_side;

        // Snapshot build; degraded mode continues without it.
        let market_snapshot = match snapshot::build_and_validate(&self.client, &self.symbol).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("snapshot failed: {e} — continuing with DB-only context");
                None
            }
        };

        let scores = market_snapshot
            .as_ref()
            .map(compute_scores)
            .unwrap_or_default();

        // Event trigger evaluation.
        let event = self.triggers.evaluate(
            market_snapshot.as_ref(),
            &self.prev_cycle,
            Some(scores.total_score),
        );

        let sleep = match event.mode {
            EventMode::Emergency => {
                info!(
                    "EMERGENCY: triggers={:?}",
                    event.trigger_types()
                );
                let action = self
                    .handle_emergency(&event, market_snapshot.as_ref(), &position, &scores)
                    .await;
                self.record_action(&action);
                self.triggers
                    .record_analysis_result(&action, &event.trigger_types(), current_side);
                if action != "HOLD" {
                    self.reset_hold_tracker(&format!("emergency action: {action}"));
                }
                LOOP_FAST_SEC
            }
            EventMode::EventDecision => {
                if let Some(snap) = market_snapshot.as_ref() {
                    let outcome = handle_event_decision(
                        &self.store,
                        &self.llm,
                        Some(&self.client),
                        &self.notifier,
                        &self.symbol,
                        &event,
                        snap,
                        Some(&position),
                    )
                    .await?;
                    let action = outcome.action.as_str().to_string();
                    self.record_action(&action);
                    self.triggers.record_analysis_result(
                        &action,
                        &event.trigger_types(),
                        current_side,
                    );
                    if action != "HOLD" {
                        self.reset_hold_tracker(&format!("event decision: {action}"));
                    }
                }
                LOOP_FAST_SEC
            }
            EventMode::Event => {
                self.handle_event(&event, market_snapshot.as_ref(), &position, &scores)
                    .await?;
                LOOP_FAST_SEC
            }
            EventMode::Default => {
                self.handle_default(market_snapshot.as_ref(), &position, &scores)
                    .await?;
                LOOP_NORMAL_SEC
            }
        };

        // Sync strategy state from exchange truth (side/qty/entry only; the
        // fill watcher owns everything else).
        self.sync_position_state(&position)?;

        // Carry forward this cycle's observations.
        self.prev_cycle = PrevCycle {
            total_score: Some(scores.total_score),
            atr_pct: market_snapshot.as_ref().and_then(|s| s.atr_pct),
        };

        Ok(sleep)
    }

    async fn handle_default(
        &mut self,
        market_snapshot: Option<&MarketSnapshot>,
        position: &ExchangePosition,
        scores: &Scores,
    ) -> Result<()> {
        let pos_state = self.store.get_position_state(&self.symbol)?;
        let (stage, budget_used) = pos_state
            .as_ref()
            .map(|ps| (ps.stage, ps.trade_budget_used_pct))
            .unwrap_or((0, 0.0));

        let ctx = match market_snapshot {
            Some(snap) => DecisionContext::from_snapshot(
                Some(position.clone()),
                snap,
                scores.clone(),
                stage,
                budget_used,
            ),
            None => DecisionContext {
                position: Some(position.clone()),
                price: position.mark_price,
                scores: scores.clone(),
                tenkan: None,
                kijun: None,
                rsi: None,
                ma_50: None,
                ma_200: None,
                stage,
                budget_used_pct: budget_used,
            },
        };

        let (mut action, mut reason) = decide(&ctx);
        info!("decision: {action} - {reason}");
        if action != PmAction::Hold {
            self.reset_hold_tracker(&format!("default action: {action}"));
        }

        let dec_id = self.log_decision(&ctx, market_snapshot, action, &reason)?;

        // Defer when a strategy_intent row already queued the same action.
        if action != PmAction::Hold {
            if let Some(pending) = self.store.recent_pending_from_source(
                &self.symbol,
                "strategy_intent",
                QUEUE_DEDUP_WINDOW_SEC,
            )? {
                let pending_as_pm = match pending {
                    ActionType::ReverseClose => Some(PmAction::Reverse),
                    ActionType::Add => Some(PmAction::Add),
                    ActionType::Reduce => Some(PmAction::Reduce),
                    ActionType::Close | ActionType::FullClose => Some(PmAction::Close),
                    _ => None,
                };
                if pending_as_pm == Some(action) {
                    info!("skip {action}: strategy_intent already pending");
                    action = PmAction::Hold;
                    reason = "deferred to strategy_intent".to_string();
                }
            }
        }
        let _ = reason;

        let min_qty = self.compliance.cached_market_info().min_qty;
        match action {
            PmAction::Add => {
                let add_usdt = safety::get_add_slice_usdt(&self.store);
                let direction = position.side.direction();
                let mut entry = NewQueueEntry::new(&self.symbol, ActionType::Add, direction);
                entry.target_usdt = Some(Money::from_f64(add_usdt));
                entry.reason = "score_add".to_string();
                entry.priority = 5;
                entry.pm_decision_id = Some(dec_id);
                enqueue_action(
                    &self.store,
                    &self.symbol,
                    ActionType::Add,
                    direction,
                    entry,
                    position.qty,
                    min_qty,
                    false,
                )?;
            }
            PmAction::Reduce => {
                let direction = position.side.direction();
                let mut entry = NewQueueEntry::new(&self.symbol, ActionType::Reduce, direction);
                entry.reduce_pct = Some(30.0);
                entry.reason = "counter_signal_reduce".to_string();
                entry.priority = 3;
                entry.pm_decision_id = Some(dec_id);
                enqueue_action(
                    &self.store,
                    &self.symbol,
                    ActionType::Reduce,
                    direction,
                    entry,
                    position.qty,
                    min_qty,
                    false,
                )?;
            }
            PmAction::Close => {
                let direction = position.side.direction();
                let mut entry = NewQueueEntry::new(&self.symbol, ActionType::Close, direction);
                entry.target_qty = Some(Money::from_f64(position.qty));
                entry.reason = "stop_loss_close".to_string();
                entry.priority = 2;
                entry.pm_decision_id = Some(dec_id);
                enqueue_action(
                    &self.store,
                    &self.symbol,
                    ActionType::Close,
                    direction,
                    entry,
                    position.qty,
                    min_qty,
                    false,
                )?;
            }
            PmAction::Reverse => {
                enqueue_reverse(
                    &self.store,
                    &self.symbol,
                    position,
                    "score_reversal",
                    2,
                    Some(dec_id),
                    false,
                )?;
            }
            PmAction::Hold => {}
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: &EventResult,
        market_snapshot: Option<&MarketSnapshot>,
        position: &ExchangePosition,
        scores: &Scores,
    ) -> Result<()> {
        let trigger_types = event.trigger_types();
        let trigger_names: Vec<String> = trigger_types.iter().map(|t| t.to_string()).collect();
        let (count, cap) = self.triggers.deep_call_stats();
        info!("EVENT: triggers={trigger_names:?} deep_budget={count}/{cap}");

        // Suppression pre-filters, in order.
        let suppress_reason = if self.triggers.check_event_hash_dedup(&event.event_hash) {
            Some("dedupe")
        } else if self
            .triggers
            .is_hold_repeat(&trigger_types, Some(position.side))
        {
            Some("hold_repeat")
        } else if self.consecutive_hold() {
            Some("consecutive_hold")
        } else {
            None
        };

        if let Some(reason) = suppress_reason {
            info!("EVENT suppressed: reason={reason} triggers={trigger_names:?}");
            self.store.insert_event_trigger_log(
                &self.symbol,
                EventMode::Event.as_str(),
                &serde_json::to_value(&event.triggers)?,
                &event.event_hash,
                market_snapshot.map(|s| Money::from_f64(s.price)),
                false,
                None,
                event.call_type.as_str(),
                reason == "dedupe",
            )?;
            if self.triggers.should_send_telegram_event(&trigger_types) {
                self.notifier
                    .send(&notify::format_event_suppressed(&trigger_names, reason))
                    .await;
            }
            return Ok(());
        }
        self.triggers.record_event_hash(&event.event_hash);

        // Deep vs mini routing under the budget gate.
        let age = market_snapshot
            .map(|s| Utc::now() - s.ts)
            .unwrap_or_else(|| chrono::Duration::seconds(3600));
        let (use_deep, gate_reason) = match market_snapshot {
            Some(snap) => self
                .triggers
                .should_use_deep_analysis(snap, &event.triggers, age),
            None => (false, "no_snapshot".to_string()),
        };

        let action = if use_deep {
            info!("EVENT → deep analysis (gate passed: {gate_reason})");
            self.triggers.record_deep_call();
            self.run_event_advisory(event, market_snapshot, position, scores, false)
                .await?
        } else {
            info!("EVENT → mini analysis (gate denied: {gate_reason})");
            if gate_reason.contains("daily_cap") && !self.triggers.cap_notified_today() {
                self.notifier
                    .send("[EVENT] 심층 분석 일일 상한 초과 → 경량 모델로 대체")
                    .await;
                self.triggers.mark_cap_notified();
            }
            self.run_event_advisory(event, market_snapshot, position, scores, true)
                .await?
        };

        self.record_action(&action);
        self.triggers
            .record_analysis_result(&action, &trigger_types, Some(position.side));
        if action != "HOLD" {
            self.reset_hold_tracker(&format!("event action: {action}"));
        }
        Ok(())
    }

    /// EVENT-path advisory: deep path may emit the full action set, the mini
    /// path is restricted to {HOLD, REDUCE} with a conservative fraction.
    async fn run_event_advisory(
        &mut self,
        event: &EventResult,
        market_snapshot: Option<&MarketSnapshot>,
        position: &ExchangePosition,
        scores: &Scores,
        mini: bool,
    ) -> Result<String> {
        let context = json!({
            "position": position,
            "scores": {
                "long": scores.long_score,
                "short": scores.short_score,
                "dominant": scores.dominant_side.as_str(),
            },
            "snapshot": market_snapshot,
            "triggers": event.triggers,
        });

        let model = if mini {
            self.llm.mini_model().to_string()
        } else {
            self.llm.deep_model().to_string()
        };
        let mut result = if self.llm.is_configured() {
            match self
                .llm
                .chat(
                    &model,
                    "You are the event-analysis module of a BTC perpetual system. \
                     Reply with one JSON object: {\"action\": HOLD|REDUCE|CLOSE|REVERSE, \
                     \"reduce_pct\", \"confidence\", \"reason_bullets\"}.",
                    &context.to_string(),
                )
                .await
            {
                Ok(text) => parse_advisory_response(&text),
                Err(e) => {
                    warn!("event advisory failed: {e}");
                    AdvisoryResponse::hold_fallback()
                }
            }
        } else {
            AdvisoryResponse::aborted("llm not configured")
        };

        let call_type = if mini {
            CallType::AutoMini
        } else {
            event.call_type
        };
        self.store.insert_event_trigger_log(
            &self.symbol,
            event.mode.as_str(),
            &serde_json::to_value(&event.triggers)?,
            &event.event_hash,
            market_snapshot.map(|s| Money::from_f64(s.price)),
            true,
            Some(&serde_json::to_value(&result)?),
            call_type.as_str(),
            false,
        )?;

        if result.aborted || result.fallback_used {
            info!(
                "event analysis skipped: aborted={} fallback={} gate_reason={}",
                result.aborted, result.fallback_used, result.gate_reason
            );
            return Ok("ABORT".to_string());
        }

        // Price-context validation: reject analysis anchored off-market.
        if let (Some(mentioned), Some(snap)) = (result.mentioned_price, market_snapshot) {
            let (ok, why) = snapshot::validate_price_mention(mentioned, snap);
            if !ok {
                warn!("INVALID PRICE CONTEXT - STRATEGY REJECTED: {why}");
                return Ok("HOLD".to_string());
            }
        }

        // Mini-path safety invariant: only HOLD and REDUCE.
        if mini && result.action != "HOLD" && result.action != "REDUCE" {
            info!("mini action {} downgraded to HOLD (safety)", result.action);
            result.action = "HOLD".to_string();
        }

        let min_qty = self.compliance.cached_market_info().min_qty;
        let action = result.action.clone();
        match action.as_str() {
            "REDUCE" => {
                let default_pct = if mini { MINI_REDUCE_DEFAULT_PCT } else { 50.0 };
                let pct = result.reduce_pct.unwrap_or(default_pct);
                let reduce_qty = position.qty * pct / 100.0;
                if reduce_qty < MIN_ORDER_QTY_BTC && position.qty < MIN_ORDER_QTY_BTC {
                    info!("REDUCE blocked: qty {reduce_qty:.4} < min {MIN_ORDER_QTY_BTC}");
                    return Ok("HOLD".to_string());
                }
                let direction = position.side.direction();
                let mut entry = NewQueueEntry::new(&self.symbol, ActionType::Reduce, direction);
                entry.reduce_pct = Some(pct);
                entry.reason = format!(
                    "event_{}",
                    event
                        .trigger_types()
                        .first()
                        .map(|t| t.as_str())
                        .unwrap_or("unknown")
                );
                entry.priority = if mini { 4 } else { 3 };
                enqueue_action(
                    &self.store,
                    &self.symbol,
                    ActionType::Reduce,
                    direction,
                    entry,
                    position.qty,
                    min_qty,
                    false,
                )?;
            }
            "CLOSE" => {
                let direction = position.side.direction();
                let mut entry = NewQueueEntry::new(&self.symbol, ActionType::Close, direction);
                entry.target_qty = Some(Money::from_f64(position.qty));
                entry.reason = "event_close".to_string();
                entry.priority = 2;
                enqueue_action(
                    &self.store,
                    &self.symbol,
                    ActionType::Close,
                    direction,
                    entry,
                    position.qty,
                    min_qty,
                    false,
                )?;
            }
            "REVERSE" => {
                enqueue_reverse(
                    &self.store,
                    &self.symbol,
                    position,
                    "event_reverse",
                    2,
                    None,
                    false,
                )?;
            }
            _ => {}
        }

        let trigger_names: Vec<String> = event
            .trigger_types()
            .iter()
            .map(|t| t.to_string())
            .collect();
        if self.triggers.should_send_telegram_event(&event.trigger_types()) {
            self.notifier
                .send(&notify::format_event_post_alert(&trigger_names, &action))
                .await;
        }
        Ok(action)
    }

    /// EMERGENCY path: synchronous deep analysis with the full context, then
    /// priority ≤ 2 enqueue.
    async fn handle_emergency(
        &mut self,
        event: &EventResult,
        market_snapshot: Option<&MarketSnapshot>,
        position: &ExchangePosition,
        scores: &Scores,
    ) -> String {
        let trigger_type = event
            .trigger_types()
            .first()
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "event_emergency".to_string());
        self.notifier
            .send(&notify::format_emergency_pre_alert(
                &trigger_type,
                "심층 분석 진행 중",
            ))
            .await;

        let context = json!({
            "position": position,
            "scores": {"long": scores.long_score, "short": scores.short_score},
            "snapshot": market_snapshot,
            "trigger": {"type": trigger_type, "detail": event.triggers},
            "news": self.store.recent_news(2, 10).ok(),
        });

        let result = if self.llm.is_configured() {
            match self
                .llm
                .chat(
                    self.llm.deep_model(),
                    "You are the emergency-analysis module of a BTC perpetual system. \
                     Reply with one JSON object: {\"action\": HOLD|REDUCE|CLOSE|REVERSE, \
                     \"reduce_pct\", \"risk_level\", \"confidence\", \"reason_bullets\"}.",
                    &context.to_string(),
                )
                .await
            {
                Ok(text) => parse_advisory_response(&text),
                Err(e) => {
                    warn!("emergency analysis failed: {e}");
                    AdvisoryResponse::hold_fallback()
                }
            }
        } else {
            AdvisoryResponse::hold_fallback()
        };

        let _ = self.store.insert_emergency_log(
            &self.symbol,
            &trigger_type,
            &json!(event.triggers),
            &context,
            &serde_json::to_string(&result).unwrap_or_default(),
            Some(&result.action),
            result.confidence,
            result.fallback_used,
        );

        if result.fallback_used {
            self.notifier
                .send(&notify::format_emergency_post_alert(
                    &trigger_type,
                    "HOLD",
                    &result.reason_bullets,
                ))
                .await;
            return "HOLD".to_string();
        }

        let min_qty = self.compliance.cached_market_info().min_qty;
        let direction = position.side.direction();
        let outcome = match result.action.as_str() {
            "REDUCE" => {
                let pct = result.reduce_pct.unwrap_or(50.0);
                let mut entry = NewQueueEntry::new(&self.symbol, ActionType::Reduce, direction);
                entry.reduce_pct = Some(pct);
                entry.reason = format!("emergency_{trigger_type}");
                entry.priority = 2;
                let _ = enqueue_action(
                    &self.store,
                    &self.symbol,
                    ActionType::Reduce,
                    direction,
                    entry,
                    position.qty,
                    min_qty,
                    true,
                );
                self.triggers.set_emergency_lock();
                "REDUCE"
            }
            "CLOSE" => {
                let mut entry = NewQueueEntry::new(&self.symbol, ActionType::Close, direction);
                entry.target_qty = Some(Money::from_f64(position.qty));
                entry.reason = format!("emergency_{trigger_type}");
                entry.priority = 1;
                let _ = enqueue_action(
                    &self.store,
                    &self.symbol,
                    ActionType::Close,
                    direction,
                    entry,
                    position.qty,
                    min_qty,
                    true,
                );
                self.triggers.set_emergency_lock();
                "CLOSE"
            }
            "REVERSE" => {
                let _ = enqueue_reverse(
                    &self.store,
                    &self.symbol,
                    position,
                    &format!("emergency_{trigger_type}"),
                    1,
                    None,
                    true,
                );
                self.triggers.set_emergency_lock();
                "REVERSE"
            }
            _ => "HOLD",
        };

        self.notifier
            .send(&notify::format_emergency_post_alert(
                &trigger_type,
                outcome,
                &result.reason_bullets,
            ))
            .await;
        outcome.to_string()
    }

    fn log_decision(
        &self,
        ctx: &DecisionContext,
        market_snapshot: Option<&MarketSnapshot>,
        action: PmAction,
        reason: &str,
    ) -> Result<i64> {
        let entry = DecisionLogEntry {
            symbol: self.symbol.clone(),
            position_side: ctx.position.as_ref().map(|p| p.side),
            position_qty: ctx.position.as_ref().map(|p| Money::from_f64(p.qty)),
            avg_entry_price: ctx.position.as_ref().map(|p| Money::from_f64(p.entry_price)),
            stage: Some(ctx.stage),
            current_price: Some(Money::from_f64(ctx.price)),
            long_score: Some(ctx.scores.long_score),
            short_score: Some(ctx.scores.short_score),
            atr_14: market_snapshot.and_then(|s| s.atr_14),
            rsi_14: ctx.rsi,
            poc: market_snapshot.and_then(|s| s.poc).map(Money::from_f64),
            vah: market_snapshot.and_then(|s| s.vah).map(Money::from_f64),
            val: market_snapshot.and_then(|s| s.val).map(Money::from_f64),
            chosen_action: action.as_str().to_string(),
            action_reason: reason.to_string(),
            full_context: json!({
                "position": ctx.position,
                "snapshot": market_snapshot,
                "scores": {
                    "long": ctx.scores.long_score,
                    "short": ctx.scores.short_score,
                    "dominant": ctx.scores.dominant_side.as_str(),
                    "dynamic_sl_pct": ctx.scores.dynamic_stop_loss_pct,
                },
            }),
            model_used: Some("local_score_engine".to_string()),
            model_provider: Some("local".to_string()),
            model_latency_ms: Some(0),
        };
        self.store.insert_decision_log(&entry)
    }

    /// Align strategy position rows with the live exchange position.
    fn sync_position_state(&self, position: &ExchangePosition) -> Result<()> {
        let Some(mut ps) = self.store.get_position_state(&self.symbol)? else {
            return Ok(());
        };
        ps.side = Some(position.side);
        ps.total_qty = Money::from_f64(position.qty);
        ps.avg_entry_price = Money::from_f64(position.entry_price);
        // Track the peak unrealized PnL for the L3 ADD gate.
        if position.entry_price > 0.0 {
            let upnl_pct = match position.side {
                PositionSide::Long => {
                    (position.mark_price - position.entry_price) / position.entry_price * 100.0
                }
                PositionSide::Short => {
                    (position.entry_price - position.mark_price) / position.entry_price * 100.0
                }
            };
            if upnl_pct > ps.peak_upnl_pct {
                ps.peak_upnl_pct = upnl_pct;
            }
        }
        self.store.save_position_state(&ps, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::testutil::base_snapshot;

    fn position(side: PositionSide, qty: f64, entry: f64, mark: f64) -> ExchangePosition {
        ExchangePosition {
            side,
            qty,
            entry_price: entry,
            mark_price: mark,
            unrealized_pnl: 0.0,
            leverage: 10.0,
            liquidation_price: 0.0,
        }
    }

    fn ctx(position: Option<ExchangePosition>, scores: Scores, price: f64) -> DecisionContext {
        DecisionContext {
            position,
            price,
            scores,
            tenkan: Some(price),
            kijun: Some(price),
            rsi: Some(50.0),
            ma_50: Some(price),
            ma_200: Some(price),
            stage: 1,
            budget_used_pct: 10.0,
        }
    }

    #[test]
    fn test_no_position_holds() {
        let (action, reason) = decide(&ctx(None, Scores::default(), 95_000.0));
        assert_eq!(action, PmAction::Hold);
        assert_eq!(reason, "no position");
    }

    #[test]
    fn test_stop_loss_close_first() {
        // Long from 95k, price at 92k: -3.16% < -2% dynamic SL → CLOSE, even
        // with scores that would otherwise say ADD.
        let mut scores = Scores::default();
        scores.long_score = 80.0;
        scores.dominant_side = Direction::Long;
        let pos = position(PositionSide::Long, 0.01, 95_000.0, 92_000.0);
        let (action, reason) = decide(&ctx(Some(pos), scores, 92_000.0));
        assert_eq!(action, PmAction::Close);
        assert!(reason.contains("stop_loss"));
    }

    #[test]
    fn test_reversal_needs_score_and_structure() {
        let mut scores = Scores::default();
        scores.short_score = 75.0;
        scores.long_score = 30.0;
        scores.dominant_side = Direction::Short;
        let pos = position(PositionSide::Long, 0.01, 95_000.0, 95_000.0);

        // Structure confirms SHORT: tenkan<kijun, rsi>60, ma50<ma200, price<kijun.
        let mut c = ctx(Some(pos.clone()), scores.clone(), 94_900.0);
        c.tenkan = Some(94_800.0);
        c.kijun = Some(95_200.0);
        c.rsi = Some(65.0);
        c.ma_50 = Some(94_000.0);
        c.ma_200 = Some(96_000.0);
        let (action, _) = decide(&c);
        assert_eq!(action, PmAction::Reverse);

        // Same scores without structure → falls through to REDUCE.
        let mut c = ctx(Some(pos), scores, 95_000.0);
        c.tenkan = Some(95_200.0);
        c.kijun = Some(95_000.0);
        c.rsi = Some(50.0);
        c.ma_50 = Some(96_000.0);
        c.ma_200 = Some(94_000.0);
        let (action, _) = decide(&c);
        assert_eq!(action, PmAction::Reduce);
    }

    #[test]
    fn test_add_on_aligned_score() {
        let mut scores = Scores::default();
        scores.long_score = 70.0;
        scores.short_score = 40.0;
        scores.dominant_side = Direction::Long;
        let pos = position(PositionSide::Long, 0.01, 95_000.0, 95_100.0);
        let (action, _) = decide(&ctx(Some(pos), scores, 95_100.0));
        assert_eq!(action, PmAction::Add);
    }

    #[test]
    fn test_add_blocked_by_budget() {
        let mut scores = Scores::default();
        scores.long_score = 70.0;
        scores.dominant_side = Direction::Long;
        let pos = position(PositionSide::Long, 0.01, 95_000.0, 95_100.0);
        let mut c = ctx(Some(pos), scores, 95_100.0);
        c.budget_used_pct = 70.0;
        let (action, _) = decide(&c);
        assert_eq!(action, PmAction::Hold);
    }

    #[test]
    fn test_reduce_on_counter_signal() {
        let mut scores = Scores::default();
        scores.long_score = 35.0;
        scores.short_score = 68.0;
        scores.dominant_side = Direction::Short;
        let pos = position(PositionSide::Long, 0.01, 95_000.0, 95_000.0);
        // Keep structure neutral so the reversal branch doesn't fire.
        let mut c = ctx(Some(pos), scores, 95_000.0);
        c.rsi = Some(50.0);
        let (action, _) = decide(&c);
        assert_eq!(action, PmAction::Reduce);
    }

    #[test]
    fn test_structure_confirms_counting() {
        let scores = Scores::default();
        let pos = position(PositionSide::Long, 0.01, 95_000.0, 95_000.0);
        let mut c = ctx(Some(pos), scores, 94_000.0);
        c.tenkan = Some(94_500.0);
        c.kijun = Some(95_500.0); // tenkan < kijun → +1, price < kijun → +1
        c.rsi = Some(65.0); // > 60 → +1
        c.ma_50 = Some(93_000.0);
        c.ma_200 = Some(96_000.0); // ma50 < ma200 → +1
        assert_eq!(structure_confirms(&c, Direction::Short), 4);
        assert_eq!(structure_confirms(&c, Direction::Long), 0);
    }

    #[test]
    fn test_enqueue_reverse_pair_rows() {
        // Spec scenario 3: LONG 0.01 reversal → linked pair at priority 2.
        let store = Store::open_in_memory().unwrap();
        let pos = position(PositionSide::Long, 0.01, 95_000.0, 95_000.0);
        let (close_id, open_id) =
            enqueue_reverse(&store, "BTC/USDT:USDT", &pos, "score_reversal", 2, None, false)
                .unwrap()
                .unwrap();

        let close = store.get_queue_entry(close_id).unwrap().unwrap();
        let open = store.get_queue_entry(open_id).unwrap().unwrap();
        assert_eq!(close.action_type, ActionType::ReverseClose);
        assert!(close.depends_on.is_none());
        assert_eq!(close.priority, 2);
        assert_eq!(open.action_type, ActionType::ReverseOpen);
        assert_eq!(open.depends_on, Some(close_id));
        assert_eq!(open.priority, 2);
        assert_eq!(open.direction, Direction::Short);
    }

    #[test]
    fn test_enqueue_reduce_upgrade_to_full_close() {
        // Spec scenario 4: qty=0.002, 30% → 0.0006 < minQty 0.001 → FULL_CLOSE.
        let store = Store::open_in_memory().unwrap();
        let mut entry = NewQueueEntry::new("BTC/USDT:USDT", ActionType::Reduce, Direction::Long);
        entry.reduce_pct = Some(30.0);
        let id = enqueue_action(
            &store,
            "BTC/USDT:USDT",
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
        assert_eq!(row.target_qty, Some(Money::from_f64(0.002)));
    }

    #[test]
    fn test_enqueue_duplicate_guard() {
        let store = Store::open_in_memory().unwrap();
        let make = || {
            let mut e = NewQueueEntry::new("BTC/USDT:USDT", ActionType::Reduce, Direction::Long);
            e.reduce_pct = Some(30.0);
            e
        };
        let first = enqueue_action(
            &store,
            "BTC/USDT:USDT",
            ActionType::Reduce,
            Direction::Long,
            make(),
            0.01,
            0.001,
            false,
        )
        .unwrap();
        assert!(first.is_some());
        let second = enqueue_action(
            &store,
            "BTC/USDT:USDT",
            ActionType::Reduce,
            Direction::Long,
            make(),
            0.01,
            0.001,
            false,
        )
        .unwrap();
        assert!(second.is_none(), "duplicate within 5 minutes must be blocked");
    }

    #[test]
    fn test_enqueue_add_denied_by_safety() {
        let store = Store::open_in_memory().unwrap();
        store.set_trade_switch(false).unwrap();
        let mut entry = NewQueueEntry::new("BTC/USDT:USDT", ActionType::Add, Direction::Long);
        entry.target_usdt = Some(Money::from_f64(1000.0));
        let id = enqueue_action(
            &store,
            "BTC/USDT:USDT",
            ActionType::Add,
            Direction::Long,
            entry,
            0.01,
            0.001,
            false,
        )
        .unwrap();
        assert!(id.is_none());
    }

    #[test]
    fn test_compute_scores_dominant_side() {
        let mut snap = base_snapshot();
        snap.rsi_14 = Some(25.0);
        snap.tenkan = Some(95_500.0);
        snap.kijun = Some(95_000.0);
        snap.ma_50 = Some(95_500.0);
        snap.ma_200 = Some(94_000.0);
        snap.price = 95_200.0;
        let scores = compute_scores(&snap);
        assert_eq!(scores.dominant_side, Direction::Long);
        assert!(scores.long_score > scores.short_score);
        assert!((1.0..=3.5).contains(&scores.dynamic_stop_loss_pct));
    }
}
