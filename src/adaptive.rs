//! Adaptive five-layer defence system.
//!
//! L1 loss-streak filter, L2 mean-reversion protection, L3 ADD gate,
//! L4 health-WARN control, L5 per-mode win-rate tracking. Every layer is
//! FAIL-OPEN (neutral result on missing data) except the L2 MeanRev SHORT
//! conditions, which fail CLOSED by design. State survives restart through
//! the `adaptive_layer_state` table plus a JSON file backup; the store is
//! authoritative on startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::store::Store;
use crate::types::{Direction, EntryMode, Money, PositionSide};

pub const COMBINED_PENALTY_FLOOR: f64 = 0.55;

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub l1_streak_penalty_3: f64,
    pub l1_cooldown_5_sec: f64,
    pub l1_global_wr_trades: usize,
    pub l1_wr_low: f64,
    pub l1_wr_recovery: f64,
    pub l1_relax_consecutive: u32,
    pub l1_threshold_add: i64,
    pub l1_add_conf_min: i64,
    pub anti_paralysis_hours_1: f64,
    pub anti_paralysis_hours_2: f64,
    pub l2_range_pos_short_min: f64,
    pub l2_impulse_hard_block: f64,
    pub l3_peak_upnl_threshold: f64,
    pub l4_warn_tighten_sec: f64,
    pub l4_time_stop_mult: f64,
    pub l5_trades: usize,
    pub l5_min_sample: usize,
    pub l5_wr_low: f64,
    pub l5_wr_recovery: f64,
    pub l5_penalty: f64,
    pub combined_floor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            l1_streak_penalty_3: 0.70,
            l1_cooldown_5_sec: 7200.0,
            l1_global_wr_trades: 20,
            l1_wr_low: 0.35,
            l1_wr_recovery: 0.40,
            l1_relax_consecutive: 3,
            l1_threshold_add: 10,
            l1_add_conf_min: 60,
            anti_paralysis_hours_1: 24.0,
            anti_paralysis_hours_2: 36.0,
            l2_range_pos_short_min: 0.85,
            l2_impulse_hard_block: 1.5,
            l3_peak_upnl_threshold: 0.4,
            l4_warn_tighten_sec: 120.0,
            l4_time_stop_mult: 0.5,
            l5_trades: 50,
            l5_min_sample: 10,
            l5_wr_low: 0.35,
            l5_wr_recovery: 0.40,
            l5_penalty: 0.75,
            combined_floor: COMBINED_PENALTY_FLOOR,
        }
    }
}

/// Persisted adaptive state. Timestamps are unix seconds so the state is
/// meaningful across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptiveState {
    pub global_wr_penalty_active: bool,
    pub mode_wr_penalty: HashMap<String, bool>,
    pub mode_cooldowns: HashMap<String, f64>,
    pub warn_since_ts: f64,
    pub last_trade_ts: f64,
    pub anti_paralysis_stage: u8,
    pub anti_paralysis_reset_ts: f64,
    pub wr_recovery_consecutive: u32,
    pub last_wr_sample: f64,
    pub partial_reset_done: bool,
}

/// One realized trade, newest first in the input slices.
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub realized_pnl: Option<Money>,
    pub entry_mode: Option<EntryMode>,
}

#[derive(Debug, Clone, Default)]
pub struct Layer1Result {
    pub penalty: f64,
    pub cooldown_active: bool,
    pub cooldown_remaining: i64,
    pub global_wr: f64,
    pub global_wr_block: bool,
    pub threshold_add: i64,
    pub add_conf_min: i64,
    pub anti_paralysis_mode: bool,
    pub exploratory_slice_mult: f64,
    pub exploratory_sl_tighten: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Layer2Result {
    pub meanrev_blocked: bool,
    pub block_reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Layer3Result {
    pub add_blocked: bool,
    pub add_reason: String,
}

#[derive(Debug, Clone)]
pub struct Layer4Result {
    pub entry_blocked: bool,
    pub add_blocked: bool,
    pub time_stop_mult: f64,
    pub trailing_sensitive: bool,
    pub warn_duration: f64,
}

impl Default for Layer4Result {
    fn default() -> Self {
        Layer4Result {
            entry_blocked: false,
            add_blocked: false,
            time_stop_mult: 1.0,
            trailing_sensitive: false,
            warn_duration: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Layer5Result {
    pub penalty: f64,
    pub mode_wr: f64,
    pub mode_total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AdaptiveResult {
    pub combined_penalty: f64,
    pub l1: Layer1Result,
    pub l4: Layer4Result,
    pub l5: Layer5Result,
}

/// Inputs for the L2 mean-reversion protection.
#[derive(Debug, Clone, Default)]
pub struct MeanRevContext {
    pub regime_class: String,
    pub range_position: Option<f64>,
    pub price_inside_value_area: Option<bool>,
    pub breakout_confirmed: Option<bool>,
    pub volume_z: Option<f64>,
    pub flow_bias: Option<f64>,
    pub drift_direction: String,
    pub impulse: Option<f64>,
}

pub struct AdaptiveEngine {
    config: AdaptiveConfig,
    pub state: AdaptiveState,
    backup_file: Option<PathBuf>,
}

impl AdaptiveEngine {
    pub fn new(config: AdaptiveConfig) -> Self {
        AdaptiveEngine {
            config,
            state: AdaptiveState::default(),
            backup_file: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AdaptiveConfig::default())
    }

    pub fn with_backup_file(mut self, path: PathBuf) -> Self {
        self.backup_file = Some(path);
        self
    }

    /// Load persisted state: the store wins; the JSON backup fills in when
    /// the table is empty.
    pub fn sync_from_store(&mut self, store: &Store) {
        match store.adaptive_state_get("state") {
            Ok(Some(value)) => {
                if let Ok(state) = serde_json::from_value::<AdaptiveState>(value) {
                    self.state = state;
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("adaptive state load FAIL-OPEN: {e}"),
        }
        if let Some(path) = &self.backup_file {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(state) = serde_json::from_str::<AdaptiveState>(&raw) {
                    self.state = state;
                }
            }
        }
    }

    /// Persist to the store and the JSON backup. Failures are logged only.
    pub fn persist(&self, store: &Store) {
        match serde_json::to_value(&self.state) {
            Ok(value) => {
                if let Err(e) = store.adaptive_state_set("state", &value) {
                    warn!("adaptive state persist FAIL: {e}");
                }
            }
            Err(e) => warn!("adaptive state serialize FAIL: {e}"),
        }
        if let Some(path) = &self.backup_file {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(raw) = serde_json::to_string(&self.state) {
                let _ = std::fs::write(path, raw);
            }
        }
    }

    // ── L1: loss-streak adaptive filter ──────────────────────────────

    fn mode_loss_streak(trades: &[TradeOutcome], entry_mode: EntryMode) -> usize {
        let mut streak = 0;
        for trade in trades {
            if trade.entry_mode != Some(entry_mode) {
                continue;
            }
            match trade.realized_pnl {
                Some(pnl) if pnl.is_negative() => streak += 1,
                _ => break,
            }
        }
        streak
    }

    fn global_wr(trades: &[TradeOutcome], n: usize) -> (f64, usize) {
        let sample: Vec<&TradeOutcome> = trades.iter().take(n).collect();
        let total = sample.len();
        if total == 0 {
            return (0.5, 0);
        }
        let wins = sample
            .iter()
            .filter(|t| t.realized_pnl.map(|p| p > Money::ZERO).unwrap_or(false))
            .count();
        (wins as f64 / total as f64, total)
    }

    pub fn compute_layer1(
        &mut self,
        trades: &[TradeOutcome],
        entry_mode: EntryMode,
        trade_switch_on: bool,
        last_trade_ts: f64,
        switch_off_sec: f64,
        now: f64,
    ) -> Layer1Result {
        let cfg = &self.config;
        let mut result = Layer1Result {
            penalty: 1.0,
            global_wr: 0.5,
            exploratory_slice_mult: 1.0,
            exploratory_sl_tighten: 1.0,
            ..Default::default()
        };

        // 1A. Mode-specific streak.
        let streak = Self::mode_loss_streak(trades, entry_mode);
        let mode_key = entry_mode.as_str().to_string();
        if streak >= 5 {
            let cooldown_until = *self
                .state
                .mode_cooldowns
                .entry(mode_key.clone())
                .or_insert(now + cfg.l1_cooldown_5_sec);
            if now < cooldown_until {
                result.cooldown_active = true;
                result.cooldown_remaining = (cooldown_until - now) as i64;
                result.penalty = cfg.l1_streak_penalty_3;
            } else {
                self.state.mode_cooldowns.remove(&mode_key);
            }
        } else if streak >= 3 {
            result.penalty = cfg.l1_streak_penalty_3;
        } else {
            self.state.mode_cooldowns.remove(&mode_key);
        }

        // 1B + 1C. Global WR with hysteresis: a sub-floor WR activates the
        // penalty immediately; release needs N consecutive improving samples
        // at or above the recovery level.
        let (wr, total) = Self::global_wr(trades, cfg.l1_global_wr_trades);
        result.global_wr = wr;
        if total >= cfg.l1_global_wr_trades {
            if wr < cfg.l1_wr_low {
                self.state.global_wr_penalty_active = true;
                self.state.wr_recovery_consecutive = 0;
            } else if wr >= cfg.l1_wr_recovery {
                if wr > self.state.last_wr_sample {
                    self.state.wr_recovery_consecutive += 1;
                } else {
                    self.state.wr_recovery_consecutive = 0;
                }
                if self.state.wr_recovery_consecutive >= cfg.l1_relax_consecutive {
                    self.state.global_wr_penalty_active = false;
                    self.state.wr_recovery_consecutive = 0;
                    info!(
                        "[L1] WR penalty RELAXED after {} consecutive improvements",
                        cfg.l1_relax_consecutive
                    );
                }
            }
            self.state.last_wr_sample = wr;
        }
        if self.state.global_wr_penalty_active {
            result.global_wr_block = true;
            result.threshold_add = cfg.l1_threshold_add;
            result.add_conf_min = cfg.l1_add_conf_min;
        }

        // 1D. Anti-paralysis.
        self.check_anti_paralysis(
            &mut result,
            trade_switch_on,
            last_trade_ts,
            switch_off_sec,
            now,
        );
        result
    }

    fn check_anti_paralysis(
        &mut self,
        result: &mut Layer1Result,
        trade_switch_on: bool,
        last_trade_ts: f64,
        switch_off_sec: f64,
        now: f64,
    ) {
        let cfg = &self.config;
        if !trade_switch_on || last_trade_ts <= 0.0 {
            return;
        }
        self.state.last_trade_ts = last_trade_ts;
        let effective_no_trade = (now - last_trade_ts) - switch_off_sec;

        if effective_no_trade >= cfg.anti_paralysis_hours_2 * 3600.0 {
            // Full reset.
            if self.state.anti_paralysis_stage < 2 {
                self.state.anti_paralysis_stage = 2;
                self.state.anti_paralysis_reset_ts = now;
                info!("[L1] Anti-Paralysis: FULL RESET (36h no trade)");
            }
            self.state.mode_cooldowns.clear();
            self.state.global_wr_penalty_active = false;
            self.state.mode_wr_penalty.clear();
            self.state.wr_recovery_consecutive = 0;
            result.penalty = 1.0;
            result.cooldown_active = false;
            result.cooldown_remaining = 0;
            result.global_wr_block = false;
            result.threshold_add = 0;
            result.add_conf_min = 0;
        } else if effective_no_trade >= cfg.anti_paralysis_hours_1 * 3600.0 {
            // Partial reset: exploratory entries with half size + tight stop.
            if self.state.anti_paralysis_stage < 1 {
                self.state.anti_paralysis_stage = 1;
                self.state.anti_paralysis_reset_ts = now;
                info!("[L1] Anti-Paralysis: PARTIAL RESET (24h no trade) — exploratory: min_size + tight stop");
            }
            if !self.state.partial_reset_done {
                self.state.wr_recovery_consecutive = 0;
                self.state.partial_reset_done = true;
            }
            self.state.mode_cooldowns.clear();
            result.cooldown_active = false;
            result.cooldown_remaining = 0;
            if result.penalty < 0.85 {
                result.penalty = 0.85;
            }
            if result.global_wr_block {
                result.threshold_add = cfg.l1_threshold_add / 2;
            }
            result.anti_paralysis_mode = true;
            result.exploratory_slice_mult = 0.5;
            result.exploratory_sl_tighten = 0.7;
        } else if self.state.anti_paralysis_stage > 0
            && last_trade_ts > self.state.anti_paralysis_reset_ts
        {
            // A trade happened since the reset; disarm.
            self.state.anti_paralysis_stage = 0;
            self.state.partial_reset_done = false;
        }
    }

    // ── L2: MeanReversion protection ─────────────────────────────────

    /// MeanRev SHORT fails CLOSED on missing features; every other
    /// mode/direction combination fails open.
    pub fn compute_layer2(
        &self,
        entry_mode: EntryMode,
        direction: Direction,
        ctx: &MeanRevContext,
    ) -> Layer2Result {
        let mut result = Layer2Result::default();
        if entry_mode != EntryMode::MeanRev {
            return result;
        }

        // range_pos above the band blocks MeanRev in either direction.
        if let Some(rp) = ctx.range_position {
            if rp > 1.0 {
                result.meanrev_blocked = true;
                result.block_reason =
                    format!("range_pos={rp:.2} > 1.0 → MeanRev blocked, BREAKOUT/TREND priority");
                return result;
            }
        }

        if direction != Direction::Short {
            return result;
        }

        let mut reasons = Vec::new();
        if ctx.regime_class != "STATIC_RANGE" {
            reasons.push(format!("regime={} != STATIC_RANGE", ctx.regime_class));
        }
        match ctx.price_inside_value_area {
            Some(true) => {}
            Some(false) => reasons.push("price_vs_va != INSIDE".to_string()),
            None => reasons.push("price_vs_va=None (fail-closed)".to_string()),
        }
        match ctx.range_position {
            Some(rp) if rp >= self.config.l2_range_pos_short_min => {}
            Some(rp) => reasons.push(format!(
                "range_pos={rp:.2} < {}",
                self.config.l2_range_pos_short_min
            )),
            None => reasons.push("range_pos=None (fail-closed)".to_string()),
        }
        match ctx.breakout_confirmed {
            Some(false) => {}
            Some(true) => reasons.push("breakout_confirmed=True".to_string()),
            None => reasons.push("breakout_confirmed=None (fail-closed)".to_string()),
        }
        match ctx.volume_z {
            Some(z) if z <= 0.0 => {}
            Some(z) => reasons.push(format!("volume_z={z:.2} > 0")),
            None => reasons.push("volume_z=None (fail-closed)".to_string()),
        }
        match ctx.flow_bias {
            Some(b) if b <= 0.0 => {}
            Some(b) => reasons.push(format!("flow_bias={b:.2} > 0")),
            None => reasons.push("flow_bias=None (fail-closed)".to_string()),
        }
        if !reasons.is_empty() {
            result.meanrev_blocked = true;
            result.block_reason = format!("MeanRev SHORT fail: {}", reasons.join("; "));
            return result;
        }

        // Hard-block: counter-trend acceleration.
        let flow_bias = ctx.flow_bias.unwrap_or(0.0);
        let impulse = ctx.impulse.unwrap_or(0.0);
        if ctx.drift_direction == "NONE"
            && flow_bias > 0.0
            && impulse > self.config.l2_impulse_hard_block
        {
            result.meanrev_blocked = true;
            result.block_reason = format!(
                "hard-block: drift=NONE + flow_bias={flow_bias:.2}>0 + impulse={impulse:.2}>{}",
                self.config.l2_impulse_hard_block
            );
        }
        result
    }

    // ── L3: ADD gate ─────────────────────────────────────────────────

    /// ADD is forbidden while under water; in profit it needs either the
    /// peak-uPnL threshold or a confirmed retest.
    pub fn compute_layer3(
        &self,
        pos_side: PositionSide,
        avg_entry: f64,
        current_price: f64,
        peak_upnl_pct: f64,
        retest_confirmed: bool,
    ) -> Layer3Result {
        let mut result = Layer3Result::default();
        if avg_entry <= 0.0 || current_price <= 0.0 {
            return result; // FAIL-OPEN
        }

        let upnl_pct = match pos_side {
            PositionSide::Long => (current_price - avg_entry) / avg_entry * 100.0,
            PositionSide::Short => (avg_entry - current_price) / avg_entry * 100.0,
        };

        if upnl_pct < 0.0 {
            result.add_blocked = true;
            result.add_reason = format!("uPnL={upnl_pct:.2}% < 0 → ADD blocked");
            return result;
        }

        if peak_upnl_pct >= self.config.l3_peak_upnl_threshold || retest_confirmed {
            return result;
        }

        result.add_blocked = true;
        result.add_reason = format!(
            "uPnL={upnl_pct:.2}% > 0 but peak={peak_upnl_pct:.2}% < {}% and retest={retest_confirmed}",
            self.config.l3_peak_upnl_threshold
        );
        result
    }

    // ── L4: health WARN control ──────────────────────────────────────

    pub fn compute_layer4(&mut self, health: &str, now: f64) -> Layer4Result {
        let mut result = Layer4Result::default();
        if health == "WARN" {
            result.entry_blocked = true;
            result.add_blocked = true;
            if self.state.warn_since_ts == 0.0 {
                self.state.warn_since_ts = now;
            }
            let warn_duration = now - self.state.warn_since_ts;
            result.warn_duration = warn_duration;
            if warn_duration >= self.config.l4_warn_tighten_sec {
                result.time_stop_mult = self.config.l4_time_stop_mult;
                result.trailing_sensitive = true;
            }
        } else if self.state.warn_since_ts != 0.0 {
            self.state.warn_since_ts = 0.0;
        }
        result
    }

    // ── L5: per-mode win rate ────────────────────────────────────────

    pub fn compute_layer5(&mut self, trades: &[TradeOutcome], entry_mode: EntryMode) -> Layer5Result {
        let cfg = &self.config;
        let sample: Vec<&TradeOutcome> = trades
            .iter()
            .filter(|t| t.entry_mode == Some(entry_mode))
            .take(cfg.l5_trades)
            .collect();
        let total = sample.len();
        let mut result = Layer5Result {
            penalty: 1.0,
            mode_wr: 0.5,
            mode_total: total,
        };
        if total == 0 {
            return result;
        }
        let wins = sample
            .iter()
            .filter(|t| t.realized_pnl.map(|p| p > Money::ZERO).unwrap_or(false))
            .count();
        let wr = wins as f64 / total as f64;
        result.mode_wr = wr;
        if total < cfg.l5_min_sample {
            return result;
        }

        let key = entry_mode.as_str().to_string();
        if wr < cfg.l5_wr_low {
            self.state.mode_wr_penalty.insert(key.clone(), true);
        } else if wr >= cfg.l5_wr_recovery {
            self.state.mode_wr_penalty.insert(key.clone(), false);
        }
        if self.state.mode_wr_penalty.get(&key).copied().unwrap_or(false) {
            result.penalty = cfg.l5_penalty;
        }
        result
    }

    // ── Orchestrator ─────────────────────────────────────────────────

    /// Compute all score-shaping layers for one decision cycle.
    /// `combined_penalty = max(floor, L1 × L5)`.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_layers(
        &mut self,
        trades: &[TradeOutcome],
        entry_mode: EntryMode,
        health: &str,
        trade_switch_on: bool,
        last_trade_ts: f64,
        switch_off_sec: f64,
        now: f64,
    ) -> AdaptiveResult {
        let l1 = self.compute_layer1(
            trades,
            entry_mode,
            trade_switch_on,
            last_trade_ts,
            switch_off_sec,
            now,
        );
        let l4 = self.compute_layer4(health, now);
        let l5 = self.compute_layer5(trades, entry_mode);

        let combined_penalty = (l1.penalty * l5.penalty).max(self.config.combined_floor);

        let blocks: Vec<&str> = [
            l1.cooldown_active.then_some("L1_cooldown"),
            l1.global_wr_block.then_some("L1_wr"),
            l4.entry_blocked.then_some("L4_warn"),
        ]
        .into_iter()
        .flatten()
        .collect();
        info!(
            "[ADAPTIVE] mode={entry_mode} penalty={combined_penalty:.2} blocks=[{}]",
            blocks.join(", ")
        );

        AdaptiveResult {
            combined_penalty,
            l1,
            l4,
            l5,
        }
    }

    /// Formatted state dump for the operator debug view.
    pub fn debug_state(&self) -> String {
        [
            "── Adaptive Layers ──".to_string(),
            format!(
                "global WR penalty_active: {}",
                if self.state.global_wr_penalty_active { "YES" } else { "NO" }
            ),
            format!("mode WR penalties: {:?}", self.state.mode_wr_penalty),
            format!("cooldowns: {:?}", self.state.mode_cooldowns),
            format!("anti-paralysis stage: {}", self.state.anti_paralysis_stage),
            format!("last_trade: {:.0}", self.state.last_trade_ts),
        ]
        .join("\n")
    }
}
