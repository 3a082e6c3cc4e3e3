//! Event trigger engine.
//!
//! Snapshot-driven classifier that decides when a cycle escalates from the
//! cheap deterministic path to analysis. Triggers are rising-edge armed,
//! accumulate into a short bundle window, and the flushed bundle's content
//! hash feeds a 30-minute dedup cache. Price-spike thresholds drop and
//! escalate to EVENT_DECISION when the `ff_event_decision_mode` flag is on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::snapshot::MarketSnapshot;
use crate::types::{CallType, EventMode, PositionSide};

/// Price-spike thresholds (abs return %, per horizon) with the flag off.
pub const SPIKE_THRESHOLDS: [f64; 3] = [1.0, 1.8, 3.0];
/// Lowered thresholds when event-decision mode is armed.
pub const SPIKE_THRESHOLDS_DECISION: [f64; 3] = [0.5, 1.0, 1.5];

pub const VOLUME_SPIKE_RATIO: f64 = 2.0;
pub const ATR_INCREASE_RATIO: f64 = 1.3;
pub const IMPULSE_SPIKE_ABS: f64 = 1.0;

pub const BUNDLE_WINDOW_SEC: f64 = 30.0;
pub const EVENT_HASH_DEDUP_SEC: u64 = 1800;
pub const HOLD_REPEAT_LIMIT: usize = 3;
pub const DEEP_CALL_COOLDOWN_SEC: u64 = 300;
pub const TELEGRAM_THROTTLE_SEC: u64 = 600;
pub const EMERGENCY_LOCK_SEC: u64 = 600;
/// Smallest order the venue accepts; reduce requests below it are pointless.
pub const MIN_ORDER_QTY_BTC: f64 = 0.001;

/// Score jump between cycles treated as an emergency.
const SCORE_JUMP_EMERGENCY: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    PriceSpike1m,
    PriceSpike5m,
    PriceSpike15m,
    VolumeSpike,
    AtrIncrease,
    ImpulseSpike,
    RangePositionExtreme,
    LiquidityStress,
    Whipsaw,
    ScoreJump,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::PriceSpike1m => "price_spike_1m",
            TriggerType::PriceSpike5m => "price_spike_5m",
            TriggerType::PriceSpike15m => "price_spike_15m",
            TriggerType::VolumeSpike => "volume_spike",
            TriggerType::AtrIncrease => "atr_increase",
            TriggerType::ImpulseSpike => "impulse_spike",
            TriggerType::RangePositionExtreme => "range_position_extreme",
            TriggerType::LiquidityStress => "liquidity_stress",
            TriggerType::Whipsaw => "whipsaw",
            TriggerType::ScoreJump => "score_jump",
        }
    }

    pub fn is_price_spike(&self) -> bool {
        matches!(
            self,
            TriggerType::PriceSpike1m | TriggerType::PriceSpike5m | TriggerType::PriceSpike15m
        )
    }

    pub fn is_emergency_class(&self) -> bool {
        matches!(self, TriggerType::Whipsaw | TriggerType::ScoreJump)
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub value: f64,
    pub threshold: f64,
    pub direction: String,
}

#[derive(Debug, Clone)]
pub struct EventResult {
    pub mode: EventMode,
    pub triggers: Vec<Trigger>,
    pub event_hash: String,
    pub call_type: CallType,
}

impl EventResult {
    fn default_mode() -> Self {
        EventResult {
            mode: EventMode::Default,
            triggers: Vec::new(),
            event_hash: String::new(),
            call_type: CallType::Auto,
        }
    }

    pub fn trigger_types(&self) -> Vec<TriggerType> {
        self.triggers.iter().map(|t| t.trigger_type).collect()
    }
}

/// Previous-cycle context carried between evaluations.
#[derive(Debug, Clone, Default)]
pub struct PrevCycle {
    pub total_score: Option<f64>,
    pub atr_pct: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub bundle_window_sec: f64,
    pub event_decision_mode: bool,
    pub daily_deep_call_cap: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            bundle_window_sec: BUNDLE_WINDOW_SEC,
            event_decision_mode: false,
            daily_deep_call_cap: 30,
        }
    }
}

/// Process-local trigger state: edges, bundle, dedup cache, budget counters.
pub struct EventTriggerEngine {
    config: TriggerConfig,
    edge_armed: HashMap<TriggerType, bool>,
    bundle: Vec<Trigger>,
    bundle_first: Option<Instant>,
    dedup_cache: HashMap<String, Instant>,
    /// (trigger-set key, recent actions) for HOLD-repeat suppression.
    result_history: HashMap<String, Vec<String>>,
    deep_calls_today: u32,
    deep_calls_day: Option<chrono::NaiveDate>,
    last_deep_call: Option<Instant>,
    cap_notified_day: Option<chrono::NaiveDate>,
    telegram_sent: HashMap<String, Instant>,
    emergency_lock_at: Option<Instant>,
}

impl EventTriggerEngine {
    pub fn new(config: TriggerConfig) -> Self {
        EventTriggerEngine {
            config,
            edge_armed: HashMap::new(),
            bundle: Vec::new(),
            bundle_first: None,
            dedup_cache: HashMap::new(),
            result_history: HashMap::new(),
            deep_calls_today: 0,
            deep_calls_day: None,
            last_deep_call: None,
            cap_notified_day: None,
            telegram_sent: HashMap::new(),
            emergency_lock_at: None,
        }
    }

    pub fn set_event_decision_mode(&mut self, on: bool) {
        self.config.event_decision_mode = on;
    }

    /// Clear all edges (called on position side change).
    pub fn reset_edge_state(&mut self, reason: &str) {
        self.edge_armed.clear();
        self.bundle.clear();
        self.bundle_first = None;
        info!("trigger edges reset ({reason})");
    }

    /// Evaluate one cycle: detect rising-edge triggers, bundle them, and
    /// classify the flushed bundle into a mode.
    pub fn evaluate(
        &mut self,
        snapshot: Option<&MarketSnapshot>,
        prev: &PrevCycle,
        current_score: Option<f64>,
    ) -> EventResult {
        let Some(snapshot) = snapshot else {
            return EventResult::default_mode();
        };

        let fired = self.detect_triggers(snapshot, prev, current_score);
        if !fired.is_empty() {
            if self.bundle.is_empty() {
                self.bundle_first = Some(Instant::now());
            }
            self.bundle.extend(fired);
        }

        if self.bundle.is_empty() {
            return EventResult::default_mode();
        }

        // Keep accumulating until the window closes.
        if let Some(first) = self.bundle_first {
            if first.elapsed().as_secs_f64() < self.config.bundle_window_sec {
                return EventResult::default_mode();
            }
        }

        let triggers = std::mem::take(&mut self.bundle);
        self.bundle_first = None;
        let event_hash = compute_event_hash(&triggers);

        let has_emergency = triggers.iter().any(|t| t.trigger_type.is_emergency_class());
        let has_price_spike = triggers.iter().any(|t| t.trigger_type.is_price_spike());

        let (mode, call_type) = if has_emergency {
            (EventMode::Emergency, CallType::Emergency)
        } else if self.config.event_decision_mode && has_price_spike {
            (EventMode::EventDecision, CallType::AutoEmergency)
        } else {
            (EventMode::Event, CallType::Auto)
        };

        debug!(
            "trigger bundle flushed: mode={mode} hash={event_hash} triggers={:?}",
            triggers.iter().map(|t| t.trigger_type).collect::<Vec<_>>()
        );

        EventResult {
            mode,
            triggers,
            event_hash,
            call_type,
        }
    }

    fn detect_triggers(
        &mut self,
        snapshot: &MarketSnapshot,
        prev: &PrevCycle,
        current_score: Option<f64>,
    ) -> Vec<Trigger> {
        let mut fired = Vec::new();
        let thresholds = if self.config.event_decision_mode {
            SPIKE_THRESHOLDS_DECISION
        } else {
            SPIKE_THRESHOLDS
        };

        let spikes = [
            (TriggerType::PriceSpike1m, snapshot.returns.ret_1m, thresholds[0]),
            (TriggerType::PriceSpike5m, snapshot.returns.ret_5m, thresholds[1]),
            (TriggerType::PriceSpike15m, snapshot.returns.ret_15m, thresholds[2]),
        ];
        let mut spike_up = false;
        let mut spike_down = false;
        for (tt, ret, threshold) in spikes {
            let Some(ret) = ret else {
                self.disarm(tt);
                continue;
            };
            if ret.abs() >= threshold {
                if ret > 0.0 {
                    spike_up = true;
                } else {
                    spike_down = true;
                }
                self.fire_edge(tt, ret, threshold, direction_of(ret), &mut fired);
            } else {
                self.disarm(tt);
            }
        }

        // Whipsaw: both directions spiking inside one bundle window.
        let bundle_dirs: (bool, bool) = self.bundle.iter().fold((spike_up, spike_down), |acc, t| {
            if t.trigger_type.is_price_spike() {
                match t.direction.as_str() {
                    "up" => (true, acc.1),
                    "down" => (acc.0, true),
                    _ => acc,
                }
            } else {
                acc
            }
        });
        if bundle_dirs.0 && bundle_dirs.1 {
            self.fire_edge(TriggerType::Whipsaw, 0.0, 0.0, "both".to_string(), &mut fired);
        } else {
            self.disarm(TriggerType::Whipsaw);
        }

        // Volume spike.
        if snapshot.vol_ratio >= VOLUME_SPIKE_RATIO {
            self.fire_edge(
                TriggerType::VolumeSpike,
                snapshot.vol_ratio,
                VOLUME_SPIKE_RATIO,
                "up".to_string(),
                &mut fired,
            );
        } else {
            self.disarm(TriggerType::VolumeSpike);
        }

        // ATR expansion cycle-over-cycle.
        if let (Some(now), Some(prev_atr)) = (snapshot.atr_pct, prev.atr_pct) {
            if prev_atr > 0.0 && now / prev_atr >= ATR_INCREASE_RATIO {
                self.fire_edge(
                    TriggerType::AtrIncrease,
                    now / prev_atr,
                    ATR_INCREASE_RATIO,
                    "up".to_string(),
                    &mut fired,
                );
            } else {
                self.disarm(TriggerType::AtrIncrease);
            }
        }

        // Score jump between cycles (emergency-class).
        if let (Some(now), Some(before)) = (current_score, prev.total_score) {
            let jump = (now - before).abs();
            if jump >= SCORE_JUMP_EMERGENCY {
                self.fire_edge(
                    TriggerType::ScoreJump,
                    jump,
                    SCORE_JUMP_EMERGENCY,
                    direction_of(now - before),
                    &mut fired,
                );
            } else {
                self.disarm(TriggerType::ScoreJump);
            }
        }

        // Flag-gated triggers.
        if self.config.event_decision_mode {
            fired.extend(self.check_impulse_spike(snapshot));
            fired.extend(self.check_range_position_extreme(snapshot));
            fired.extend(self.check_liquidity_stress(snapshot));
        }

        fired
    }

    /// impulse |value| >= 1.0 (flag-gated).
    pub fn check_impulse_spike(&mut self, snapshot: &MarketSnapshot) -> Vec<Trigger> {
        let mut fired = Vec::new();
        if snapshot.impulse.abs() >= IMPULSE_SPIKE_ABS {
            self.fire_edge(
                TriggerType::ImpulseSpike,
                snapshot.impulse,
                IMPULSE_SPIKE_ABS,
                direction_of(snapshot.impulse),
                &mut fired,
            );
        } else {
            self.disarm(TriggerType::ImpulseSpike);
        }
        fired
    }

    /// range_pos outside [0, 1] (flag-gated).
    pub fn check_range_position_extreme(&mut self, snapshot: &MarketSnapshot) -> Vec<Trigger> {
        let mut fired = Vec::new();
        match snapshot.range_pos {
            Some(rp) if !(0.0..=1.0).contains(&rp) => {
                let direction = if rp > 1.0 { "up" } else { "down" };
                self.fire_edge(
                    TriggerType::RangePositionExtreme,
                    rp,
                    1.0,
                    direction.to_string(),
                    &mut fired,
                );
            }
            _ => self.disarm(TriggerType::RangePositionExtreme),
        }
        fired
    }

    /// spread_ok=false OR liquidity_ok=false (flag-gated).
    pub fn check_liquidity_stress(&mut self, snapshot: &MarketSnapshot) -> Vec<Trigger> {
        let mut fired = Vec::new();
        if snapshot.liquidity_stressed() {
            self.fire_edge(
                TriggerType::LiquidityStress,
                1.0,
                1.0,
                "stress".to_string(),
                &mut fired,
            );
        } else {
            self.disarm(TriggerType::LiquidityStress);
        }
        fired
    }

    /// Rising-edge arming: an armed trigger cannot refire until it returns
    /// to normal once.
    fn fire_edge(
        &mut self,
        tt: TriggerType,
        value: f64,
        threshold: f64,
        direction: String,
        fired: &mut Vec<Trigger>,
    ) {
        let armed = self.edge_armed.entry(tt).or_insert(false);
        if !*armed {
            *armed = true;
            fired.push(Trigger {
                trigger_type: tt,
                value,
                threshold,
                direction,
            });
        }
    }

    fn disarm(&mut self, tt: TriggerType) {
        self.edge_armed.insert(tt, false);
    }

    // ── Suppression: dedup / hold-repeat ─────────────────────────────

    /// True when the hash was analyzed within the dedup window.
    pub fn check_event_hash_dedup(&mut self, event_hash: &str) -> bool {
        let ttl = Duration::from_secs(EVENT_HASH_DEDUP_SEC);
        self.dedup_cache.retain(|_, at| at.elapsed() < ttl);
        self.dedup_cache.contains_key(event_hash)
    }

    pub fn record_event_hash(&mut self, event_hash: &str) {
        self.dedup_cache
            .insert(event_hash.to_string(), Instant::now());
    }

    fn result_key(trigger_types: &[TriggerType], side: Option<PositionSide>) -> String {
        let mut types: Vec<&str> = trigger_types.iter().map(|t| t.as_str()).collect();
        types.sort_unstable();
        format!(
            "{}|{}",
            types.join(","),
            side.map(|s| s.as_str()).unwrap_or("flat")
        )
    }

    /// True when the last N analyses of this trigger set on this side all
    /// came back HOLD.
    pub fn is_hold_repeat(
        &self,
        trigger_types: &[TriggerType],
        side: Option<PositionSide>,
    ) -> bool {
        let key = Self::result_key(trigger_types, side);
        match self.result_history.get(&key) {
            Some(actions) if actions.len() >= HOLD_REPEAT_LIMIT => actions
                .iter()
                .rev()
                .take(HOLD_REPEAT_LIMIT)
                .all(|a| a == "HOLD"),
            _ => false,
        }
    }

    pub fn record_analysis_result(
        &mut self,
        action: &str,
        trigger_types: &[TriggerType],
        side: Option<PositionSide>,
    ) {
        let key = Self::result_key(trigger_types, side);
        let actions = self.result_history.entry(key).or_default();
        actions.push(action.to_string());
        let overflow = actions.len().saturating_sub(HOLD_REPEAT_LIMIT + 1);
        if overflow > 0 {
            actions.drain(0..overflow);
        }
    }

    // ── Deep-analysis budget gate ────────────────────────────────────

    fn roll_day(&mut self) {
        let today = Utc::now().date_naive();
        if self.deep_calls_day != Some(today) {
            self.deep_calls_day = Some(today);
            self.deep_calls_today = 0;
        }
    }

    /// Route an admitted EVENT to the deep provider or the cheap one.
    /// Returns `(use_deep, gate_reason)`.
    pub fn should_use_deep_analysis(
        &mut self,
        snapshot: &MarketSnapshot,
        triggers: &[Trigger],
        snapshot_age: chrono::Duration,
    ) -> (bool, String) {
        self.roll_day();

        if self.deep_calls_today >= self.config.daily_deep_call_cap {
            return (
                false,
                format!(
                    "daily_cap: {}/{}",
                    self.deep_calls_today, self.config.daily_deep_call_cap
                ),
            );
        }
        if let Some(last) = self.last_deep_call {
            let elapsed = last.elapsed().as_secs();
            if elapsed < DEEP_CALL_COOLDOWN_SEC {
                return (
                    false,
                    format!("cooldown: {elapsed}s < {DEEP_CALL_COOLDOWN_SEC}s"),
                );
            }
        }
        // Trivial trigger sets (volume only) are not worth the expensive path.
        let non_trivial = triggers
            .iter()
            .any(|t| t.trigger_type.is_price_spike() || t.trigger_type == TriggerType::AtrIncrease);
        if !non_trivial {
            return (false, "trivial_triggers".to_string());
        }
        if snapshot_age > chrono::Duration::seconds(60) {
            return (false, format!("stale_snapshot: {}s", snapshot_age.num_seconds()));
        }
        let _ = snapshot;
        (true, "gate_passed".to_string())
    }

    pub fn record_deep_call(&mut self) {
        self.roll_day();
        self.deep_calls_today += 1;
        self.last_deep_call = Some(Instant::now());
    }

    pub fn deep_call_stats(&mut self) -> (u32, u32) {
        self.roll_day();
        (self.deep_calls_today, self.config.daily_deep_call_cap)
    }

    /// Once-a-day notification latch for the budget cap.
    pub fn cap_notified_today(&mut self) -> bool {
        self.cap_notified_day == Some(Utc::now().date_naive())
    }

    pub fn mark_cap_notified(&mut self) {
        self.cap_notified_day = Some(Utc::now().date_naive());
    }

    // ── Telegram throttle / emergency lock ───────────────────────────

    pub fn should_send_telegram_event(&mut self, trigger_types: &[TriggerType]) -> bool {
        let key = Self::result_key(trigger_types, None);
        let throttle = Duration::from_secs(TELEGRAM_THROTTLE_SEC);
        match self.telegram_sent.get(&key) {
            Some(at) if at.elapsed() < throttle => false,
            _ => {
                self.telegram_sent.insert(key, Instant::now());
                true
            }
        }
    }

    pub fn set_emergency_lock(&mut self) {
        self.emergency_lock_at = Some(Instant::now());
    }

    pub fn emergency_locked(&self) -> bool {
        self.emergency_lock_at
            .map(|at| at.elapsed() < Duration::from_secs(EMERGENCY_LOCK_SEC))
            .unwrap_or(false)
    }
}

fn direction_of(value: f64) -> String {
    if value >= 0.0 { "up" } else { "down" }.to_string()
}

/// Content digest of a trigger bundle: stable across ordering.
pub fn compute_event_hash(triggers: &[Trigger]) -> String {
    let mut keys: Vec<String> = triggers
        .iter()
        .map(|t| format!("{}:{}", t.trigger_type, t.direction))
        .collect();
    keys.sort_unstable();
    let digest = Sha256::digest(keys.join("|").as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Snapshot timestamp age against now.
pub fn snapshot_age(snapshot: &MarketSnapshot, now: DateTime<Utc>) -> chrono::Duration {
    now - snapshot.ts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::testutil::base_snapshot;

    fn engine_flushing(event_decision_mode: bool) -> EventTriggerEngine {
        EventTriggerEngine::new(TriggerConfig {
            bundle_window_sec: 0.0,
            event_decision_mode,
            daily_deep_call_cap: 30,
        })
    }

    #[test]
    fn test_flash_drop_event_decision_mode() {
        // Spec scenario 1: ret_1m=-0.55%, flag ON, no other triggers.
        let mut engine = engine_flushing(true);
        let mut snap = base_snapshot();
        snap.returns.ret_1m = Some(-0.55);
        snap.returns.ret_5m = Some(-0.3);
        snap.returns.ret_15m = Some(-0.1);

        let result = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert_eq!(result.mode, EventMode::EventDecision);
        assert_eq!(result.call_type, CallType::AutoEmergency);
        assert!(result.trigger_types().contains(&TriggerType::PriceSpike1m));
    }

    #[test]
    fn test_flag_off_keeps_original_thresholds() {
        // ret_1m=-0.55% with the flag off stays below the 1.0% threshold.
        let mut engine = engine_flushing(false);
        let mut snap = base_snapshot();
        snap.returns.ret_1m = Some(-0.55);
        let result = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert_eq!(result.mode, EventMode::Default);

        // -1.1% crosses it and yields a plain EVENT.
        let mut engine = engine_flushing(false);
        let mut snap = base_snapshot();
        snap.returns.ret_1m = Some(-1.1);
        let result = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert_eq!(result.mode, EventMode::Event);
        assert_eq!(result.call_type, CallType::Auto);
    }

    #[test]
    fn test_flag_off_gated_triggers_silent() {
        let mut engine = engine_flushing(false);
        let mut snap = base_snapshot();
        snap.range_pos = Some(1.5);
        let result = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert_eq!(result.mode, EventMode::Default);
    }

    #[test]
    fn test_liquidity_stress_trigger() {
        let mut engine = engine_flushing(true);
        let mut snap = base_snapshot();
        snap.spread_ok = false;
        snap.liquidity_ok = false;
        snap.returns.ret_1m = Some(-0.6);
        let result = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert_eq!(result.mode, EventMode::EventDecision);
        assert!(result.trigger_types().contains(&TriggerType::LiquidityStress));
    }

    #[test]
    fn test_rising_edge_no_double_fire() {
        // Invariant: a trigger cannot fire in two consecutive cycles without
        // an intervening normal reading.
        let mut engine = engine_flushing(false);
        let mut snap = base_snapshot();
        snap.returns.ret_1m = Some(-1.5);

        let first = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert!(first.trigger_types().contains(&TriggerType::PriceSpike1m));

        let second = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert!(second.triggers.is_empty());

        // Back to normal re-arms the edge.
        let mut calm = base_snapshot();
        calm.returns.ret_1m = Some(0.0);
        engine.evaluate(Some(&calm), &PrevCycle::default(), None);

        let third = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert!(third.trigger_types().contains(&TriggerType::PriceSpike1m));
    }

    #[test]
    fn test_edge_reset_on_side_change() {
        let mut engine = engine_flushing(false);
        let mut snap = base_snapshot();
        snap.returns.ret_1m = Some(-1.5);
        engine.evaluate(Some(&snap), &PrevCycle::default(), None);

        engine.reset_edge_state("position: long->short");
        let again = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert!(again.trigger_types().contains(&TriggerType::PriceSpike1m));
    }

    #[test]
    fn test_volume_spike_trigger() {
        let mut engine = engine_flushing(false);
        let mut snap = base_snapshot();
        snap.vol_ratio = 2.5;
        let result = engine.evaluate(Some(&snap), &PrevCycle::default(), None);
        assert_eq!(result.mode, EventMode::Event);
        assert!(result.trigger_types().contains(&TriggerType::VolumeSpike));
    }

    #[test]
    fn test_score_jump_is_emergency() {
        let mut engine = engine_flushing(false);
        let snap = base_snapshot();
        let prev = PrevCycle {
            total_score: Some(10.0),
            atr_pct: None,
        };
        let result = engine.evaluate(Some(&snap), &prev, Some(75.0));
        assert_eq!(result.mode, EventMode::Emergency);
        assert_eq!(result.call_type, CallType::Emergency);
    }

    #[test]
    fn test_event_hash_dedup() {
        let mut engine = engine_flushing(false);
        let triggers = vec![Trigger {
            trigger_type: TriggerType::PriceSpike1m,
            value: -1.2,
            threshold: 1.0,
            direction: "down".to_string(),
        }];
        let hash = compute_event_hash(&triggers);
        assert!(!engine.check_event_hash_dedup(&hash));
        engine.record_event_hash(&hash);
        assert!(engine.check_event_hash_dedup(&hash));

        // A distinct bundle is not suppressed.
        let other = vec![Trigger {
            trigger_type: TriggerType::VolumeSpike,
            value: 2.2,
            threshold: 2.0,
            direction: "up".to_string(),
        }];
        assert!(!engine.check_event_hash_dedup(&compute_event_hash(&other)));
    }

    #[test]
    fn test_event_hash_order_independent() {
        let a = vec![
            Trigger {
                trigger_type: TriggerType::PriceSpike1m,
                value: -1.0,
                threshold: 1.0,
                direction: "down".into(),
            },
            Trigger {
                trigger_type: TriggerType::VolumeSpike,
                value: 2.0,
                threshold: 2.0,
                direction: "up".into(),
            },
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(compute_event_hash(&a), compute_event_hash(&b));
    }

    #[test]
    fn test_hold_repeat_suppression() {
        let mut engine = engine_flushing(false);
        let types = [TriggerType::PriceSpike1m];
        let side = Some(PositionSide::Long);
        assert!(!engine.is_hold_repeat(&types, side));
        for _ in 0..HOLD_REPEAT_LIMIT {
            engine.record_analysis_result("HOLD", &types, side);
        }
        assert!(engine.is_hold_repeat(&types, side));
        // A different side is tracked separately.
        assert!(!engine.is_hold_repeat(&types, Some(PositionSide::Short)));
        // A non-HOLD breaks the run.
        engine.record_analysis_result("REDUCE", &types, side);
        assert!(!engine.is_hold_repeat(&types, side));
    }

    #[test]
    fn test_budget_gate_daily_cap() {
        let mut engine = EventTriggerEngine::new(TriggerConfig {
            bundle_window_sec: 0.0,
            event_decision_mode: false,
            daily_deep_call_cap: 1,
        });
        let snap = base_snapshot();
        let triggers = vec![Trigger {
            trigger_type: TriggerType::PriceSpike1m,
            value: -1.2,
            threshold: 1.0,
            direction: "down".into(),
        }];
        let (use_deep, _) =
            engine.should_use_deep_analysis(&snap, &triggers, chrono::Duration::seconds(1));
        assert!(use_deep);
        engine.record_deep_call();
        let (use_deep, reason) =
            engine.should_use_deep_analysis(&snap, &triggers, chrono::Duration::seconds(1));
        assert!(!use_deep);
        // Cooldown fires before the cap when both apply.
        assert!(reason.contains("cooldown") || reason.contains("daily_cap"));
    }

    #[test]
    fn test_budget_gate_trivial_triggers() {
        let mut engine = engine_flushing(false);
        let snap = base_snapshot();
        let triggers = vec![Trigger {
            trigger_type: TriggerType::VolumeSpike,
            value: 2.5,
            threshold: 2.0,
            direction: "up".into(),
        }];
        let (use_deep, reason) =
            engine.should_use_deep_analysis(&snap, &triggers, chrono::Duration::seconds(1));
        assert!(!use_deep);
        assert_eq!(reason, "trivial_triggers");
    }

    #[test]
    fn test_telegram_throttle() {
        let mut engine = engine_flushing(false);
        let types = [TriggerType::PriceSpike1m];
        assert!(engine.should_send_telegram_event(&types));
        assert!(!engine.should_send_telegram_event(&types));
    }
}
