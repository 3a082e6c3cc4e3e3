//! Proactive risk orchestrator.
//!
//! Predictive counterpart to the reactive thresholds: macro (QQQ/VIX) moves,
//! macro-event windows, score-trend deterioration and stop-loss ETA all
//! produce throttled recommendations. Every check is FAIL-OPEN and nothing
//! here places orders; actions go through the execution queue only.

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::notify::Notifier;
use crate::snapshot::MarketSnapshot;
use crate::store::{NewQueueEntry, Store};
use crate::types::{ActionType, ExchangePosition, PositionSide};

// QQQ change thresholds (%).
pub const QQQ_WARN_30M_PCT: f64 = -0.5;
pub const QQQ_REDUCE_1H_PCT: f64 = -1.0;
pub const QQQ_EMERGENCY_2H_PCT: f64 = -1.5;
// VIX thresholds.
pub const VIX_SPIKE_1H_PCT: f64 = 15.0;
pub const VIX_HIGH_ABSOLUTE: f64 = 30.0;

pub const PRE_EVENT_REDUCE_PCT: f64 = 30.0;
pub const SCORE_RAPID_DROP_THRESHOLD: f64 = 20.0;
pub const SL_ETA_WARN_MINUTES: f64 = 5.0;

pub const ENTRY_VETO_POLICY_KEY: &str = "proactive_entry_veto";
pub const MACRO_EVENT_POLICY_KEY: &str = "macro_event_window";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProactiveKind {
    Reduce,
    TightenSl,
    BlockEntry,
    DeepAnalysis,
    Warn,
}

impl ProactiveKind {
    fn as_str(&self) -> &'static str {
        match self {
            ProactiveKind::Reduce => "REDUCE",
            ProactiveKind::TightenSl => "TIGHTEN_SL",
            ProactiveKind::BlockEntry => "BLOCK_ENTRY",
            ProactiveKind::DeepAnalysis => "DEEP_ANALYSIS",
            ProactiveKind::Warn => "WARN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProactiveAction {
    pub kind: ProactiveKind,
    pub cooldown_key: &'static str,
    pub severity: &'static str,
    pub reason: String,
    pub detail: Value,
    pub reduce_pct: Option<f64>,
    pub block_duration_sec: Option<u64>,
}

fn cooldown_for(key: &str) -> Duration {
    let secs = match key {
        "macro_warn" => 1800,
        "macro_reduce" => 3600,
        "macro_emergency" => 1800,
        "pre_event_reduce" => 7200,
        "pre_event_block" => 600,
        "score_warn" => 1200,
        "sl_eta_warn" => 600,
        "vix_block" => 1800,
        _ => 600,
    };
    Duration::from_secs(secs)
}

pub struct ProactiveManager {
    symbol: String,
    last_action_at: HashMap<&'static str, Instant>,
    /// (unix_ts, total_score) over the last 10 minutes.
    score_history: Vec<(f64, f64)>,
}

impl ProactiveManager {
    pub fn new(symbol: &str) -> Self {
        ProactiveManager {
            symbol: symbol.to_string(),
            last_action_at: HashMap::new(),
            score_history: Vec::new(),
        }
    }

    fn cooled_down(&self, key: &'static str) -> bool {
        match self.last_action_at.get(key) {
            Some(at) => at.elapsed() >= cooldown_for(key),
            None => true,
        }
    }

    fn record_action(&mut self, key: &'static str) {
        self.last_action_at.insert(key, Instant::now());
    }

    // ── 1. Macro risk monitor ────────────────────────────────────────

    pub fn check_macro_risk(
        &mut self,
        store: &Store,
        position: Option<&ExchangePosition>,
    ) -> Vec<ProactiveAction> {
        let mut actions = Vec::new();

        let change = |ago: ChronoDuration| -> Option<f64> {
            match store.macro_price_change("QQQ", ago) {
                Ok(Some((latest, Some(past)))) if past != 0.0 => {
                    Some((latest - past) / past * 100.0)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("macro fetch error (FAIL-OPEN): {e}");
                    None
                }
            }
        };

        if let Some(chg) = change(ChronoDuration::minutes(30)) {
            if chg <= QQQ_WARN_30M_PCT && self.cooled_down("macro_warn") {
                actions.push(ProactiveAction {
                    kind: ProactiveKind::TightenSl,
                    cooldown_key: "macro_warn",
                    severity: "warn",
                    reason: format!("QQQ 30분 {chg:+.2}% 하락 — 손절 30% 조임"),
                    detail: json!({"qqq_chg_30m": chg}),
                    reduce_pct: None,
                    block_duration_sec: None,
                });
            }
        }
        if let Some(chg) = change(ChronoDuration::hours(1)) {
            let has_pos = position.map(|p| p.qty > 0.0).unwrap_or(false);
            if chg <= QQQ_REDUCE_1H_PCT && has_pos && self.cooled_down("macro_reduce") {
                actions.push(ProactiveAction {
                    kind: ProactiveKind::Reduce,
                    cooldown_key: "macro_reduce",
                    severity: "action",
                    reason: format!("QQQ 1시간 {chg:+.2}% — 포지션 30% 축소"),
                    detail: json!({"qqq_chg_1h": chg}),
                    reduce_pct: Some(PRE_EVENT_REDUCE_PCT),
                    block_duration_sec: None,
                });
            }
        }
        if let Some(chg) = change(ChronoDuration::hours(2)) {
            if chg <= QQQ_EMERGENCY_2H_PCT && self.cooled_down("macro_emergency") {
                actions.push(ProactiveAction {
                    kind: ProactiveKind::DeepAnalysis,
                    cooldown_key: "macro_emergency",
                    severity: "emergency",
                    reason: format!("QQQ 2시간 {chg:+.2}% 급락 — 긴급 심층 분석"),
                    detail: json!({"qqq_chg_2h": chg}),
                    reduce_pct: None,
                    block_duration_sec: None,
                });
            }
        }

        // VIX spike / absolute level.
        match store.macro_price_change("VIX", ChronoDuration::hours(1)) {
            Ok(Some((latest, past))) => {
                if let Some(past) = past {
                    if past != 0.0 {
                        let chg = (latest - past) / past * 100.0;
                        if chg >= VIX_SPIKE_1H_PCT && self.cooled_down("vix_block") {
                            actions.push(ProactiveAction {
                                kind: ProactiveKind::BlockEntry,
                                cooldown_key: "vix_block",
                                severity: "warn",
                                reason: format!("VIX 1시간 +{chg:.1}% 급등 — 신규 진입 차단"),
                                detail: json!({"vix_latest": latest, "vix_chg_1h": chg}),
                                reduce_pct: None,
                                block_duration_sec: Some(1800),
                            });
                        }
                    }
                }
                if latest >= VIX_HIGH_ABSOLUTE && self.cooled_down("macro_warn") {
                    actions.push(ProactiveAction {
                        kind: ProactiveKind::Warn,
                        cooldown_key: "macro_warn",
                        severity: "warn",
                        reason: format!("VIX {latest:.1} 고위험 구간 — 주의"),
                        detail: json!({"vix_latest": latest}),
                        reduce_pct: None,
                        block_duration_sec: None,
                    });
                }
            }
            Ok(None) => {}
            Err(e) => warn!("VIX fetch error (FAIL-OPEN): {e}"),
        }

        actions
    }

    // ── 2. Pre-event guard ───────────────────────────────────────────

    pub fn check_pre_event(
        &mut self,
        store: &Store,
        position: Option<&ExchangePosition>,
    ) -> Vec<ProactiveAction> {
        let mut actions = Vec::new();
        let window = match store.policy_get(MACRO_EVENT_POLICY_KEY) {
            Ok(Some(v)) => v,
            Ok(None) => return actions,
            Err(e) => {
                warn!("pre_event check error (FAIL-OPEN): {e}");
                return actions;
            }
        };
        if !window["active"].as_bool().unwrap_or(false) {
            return actions;
        }
        let events = window["events"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|e| e.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        if self.cooled_down("pre_event_block") {
            actions.push(ProactiveAction {
                kind: ProactiveKind::BlockEntry,
                cooldown_key: "pre_event_block",
                severity: "warn",
                reason: format!("매크로 이벤트 ({events}) 윈도우 — 신규 진입 차단"),
                detail: window.clone(),
                reduce_pct: None,
                block_duration_sec: Some(3600),
            });
        }
        let has_pos = position.map(|p| p.qty > 0.0).unwrap_or(false);
        if has_pos && self.cooled_down("pre_event_reduce") {
            actions.push(ProactiveAction {
                kind: ProactiveKind::Reduce,
                cooldown_key: "pre_event_reduce",
                severity: "action",
                reason: format!(
                    "매크로 이벤트 ({events}) 전 — 포지션 {PRE_EVENT_REDUCE_PCT:.0}% 선제 축소"
                ),
                detail: window,
                reduce_pct: Some(PRE_EVENT_REDUCE_PCT),
                block_duration_sec: None,
            });
        }
        actions
    }

    // ── 3. Score trend tracker ───────────────────────────────────────

    pub fn track_score(&mut self, total_score: f64, now: f64) {
        self.score_history.push((now, total_score));
        self.score_history.retain(|(ts, _)| now - ts <= 600.0);
    }

    pub fn check_score_trend(&mut self) -> Vec<ProactiveAction> {
        let mut actions = Vec::new();
        if self.score_history.len() < 3 {
            return actions;
        }
        let (oldest_ts, oldest) = self.score_history[0];
        let Some(&(latest_ts, latest)) = self.score_history.last() else {
            return actions;
        };
        let span = latest_ts - oldest_ts;

        let drop = oldest.abs() - latest.abs();
        if drop >= SCORE_RAPID_DROP_THRESHOLD && span <= 600.0 && self.cooled_down("score_warn") {
            actions.push(ProactiveAction {
                kind: ProactiveKind::TightenSl,
                cooldown_key: "score_warn",
                severity: "warn",
                reason: format!("점수 급락 ({oldest:.0} → {latest:.0}, {span:.0}s) — 손절 조임"),
                detail: json!({"score_drop": drop, "span_sec": span}),
                reduce_pct: None,
                block_duration_sec: None,
            });
            return actions;
        }

        let n = self.score_history.len();
        if n >= 3 {
            let s: Vec<f64> = self.score_history[n - 3..].iter().map(|(_, v)| v.abs()).collect();
            if s[0] > s[1] && s[1] > s[2] && s[0] - s[2] >= 10.0 && self.cooled_down("score_warn") {
                actions.push(ProactiveAction {
                    kind: ProactiveKind::Warn,
                    cooldown_key: "score_warn",
                    severity: "info",
                    reason: format!("점수 3연속 하락 ({:.0}→{:.0}→{:.0})", s[0], s[1], s[2]),
                    detail: json!({"scores": s}),
                    reduce_pct: None,
                    block_duration_sec: None,
                });
            }
        }
        actions
    }

    // ── 4. Stop-loss ETA ─────────────────────────────────────────────

    /// Estimate minutes to the stop level at the current 5-minute momentum;
    /// warn when close.
    pub fn check_sl_eta(
        &mut self,
        position: Option<&ExchangePosition>,
        snapshot: Option<&MarketSnapshot>,
        dynamic_sl_pct: f64,
    ) -> Option<ProactiveAction> {
        let (position, snapshot) = (position?, snapshot?);
        let entry = position.entry_price;
        let price = snapshot.price;
        if entry <= 0.0 || price <= 0.0 {
            return None;
        }
        let ret_5m = snapshot.returns.ret_5m?;

        let (sl_price, dist_to_sl, approaching) = match position.side {
            PositionSide::Long => {
                let sl = entry * (1.0 - dynamic_sl_pct / 100.0);
                (sl, price - sl, ret_5m < 0.0)
            }
            PositionSide::Short => {
                let sl = entry * (1.0 + dynamic_sl_pct / 100.0);
                (sl, sl - price, ret_5m > 0.0)
            }
        };
        if !approaching || dist_to_sl <= 0.0 {
            return None;
        }
        let move_per_min = (ret_5m.abs() / 100.0 * price) / 5.0;
        if move_per_min <= 0.0 {
            return None;
        }
        let eta_min = dist_to_sl / move_per_min;
        if eta_min <= SL_ETA_WARN_MINUTES && self.cooled_down("sl_eta_warn") {
            return Some(ProactiveAction {
                kind: ProactiveKind::Warn,
                cooldown_key: "sl_eta_warn",
                severity: "warn",
                reason: format!("손절 도달 예상 {eta_min:.1}분 — 현재 모멘텀 지속 시"),
                detail: json!({
                    "sl_price": sl_price,
                    "current_price": price,
                    "eta_minutes": eta_min,
                }),
                reduce_pct: None,
                block_duration_sec: None,
            });
        }
        None
    }

    // ── Orchestration ────────────────────────────────────────────────

    pub fn evaluate(
        &mut self,
        store: &Store,
        position: Option<&ExchangePosition>,
        snapshot: Option<&MarketSnapshot>,
        total_score: Option<f64>,
        dynamic_sl_pct: f64,
        now: f64,
    ) -> Vec<ProactiveAction> {
        let mut all = Vec::new();
        all.extend(self.check_macro_risk(store, position));
        all.extend(self.check_pre_event(store, position));
        if let Some(score) = total_score {
            self.track_score(score, now);
        }
        all.extend(self.check_score_trend());
        if let Some(action) = self.check_sl_eta(position, snapshot, dynamic_sl_pct) {
            all.push(action);
        }
        all
    }

    /// Execute recommended actions: enqueue reductions, set vetoes, log and
    /// notify. Cooldowns are recorded here so skipped duplicates stay silent.
    pub async fn execute_actions(
        &mut self,
        store: &Store,
        notifier: &Notifier,
        actions: Vec<ProactiveAction>,
        position: Option<&ExchangePosition>,
    ) -> Result<usize> {
        let mut executed = 0;
        for action in actions {
            self.record_action(action.cooldown_key);
            let _ = store.insert_proactive_log(
                &self.symbol,
                action.kind.as_str(),
                action.severity,
                &action.reason,
                &action.detail,
            );

            match action.kind {
                ProactiveKind::Reduce => {
                    let Some(pos) = position else { continue };
                    let mut entry = NewQueueEntry::new(
                        &self.symbol,
                        ActionType::Reduce,
                        pos.side.direction(),
                    );
                    entry.reduce_pct = action.reduce_pct;
                    entry.source = "proactive".to_string();
                    entry.reason = action.reason.clone();
                    entry.priority = 3;
                    if store
                        .recent_duplicate_queue_entry(
                            &self.symbol,
                            ActionType::Reduce,
                            pos.side.direction(),
                            300,
                        )?
                        .is_none()
                    {
                        store.enqueue(&entry)?;
                        notifier
                            .send(&format!(
                                "[선제 대응] 포지션 {:.0}% 축소\n{}",
                                action.reduce_pct.unwrap_or(PRE_EVENT_REDUCE_PCT),
                                action.reason
                            ))
                            .await;
                    }
                }
                ProactiveKind::BlockEntry => {
                    set_entry_veto(
                        store,
                        &action.reason,
                        action.block_duration_sec.unwrap_or(1800),
                    )?;
                    notifier
                        .send(&format!("[선제 대응] 신규 진입 차단\n{}", action.reason))
                        .await;
                }
                ProactiveKind::TightenSl | ProactiveKind::Warn | ProactiveKind::DeepAnalysis => {
                    notifier.send(&format!("[선제 경고] {}", action.reason)).await;
                }
            }
            executed += 1;
        }
        Ok(executed)
    }
}

// ── Entry veto (persisted for cross-process visibility) ──────────────

pub fn set_entry_veto(store: &Store, reason: &str, duration_sec: u64) -> Result<()> {
    let until = chrono::Utc::now() + ChronoDuration::seconds(duration_sec as i64);
    store.policy_set(
        ENTRY_VETO_POLICY_KEY,
        &json!({
            "active": true,
            "reason": reason,
            "until": until.to_rfc3339(),
        }),
        "proactive manager entry veto",
    )?;
    info!("ENTRY VETO SET: {reason} (duration={duration_sec}s)");
    Ok(())
}

/// FAIL-OPEN: any error reads as "no veto".
pub fn check_entry_veto(store: &Store) -> (bool, String) {
    let Ok(Some(value)) = store.policy_get(ENTRY_VETO_POLICY_KEY) else {
        return (false, String::new());
    };
    if !value["active"].as_bool().unwrap_or(false) {
        return (false, String::new());
    }
    let until = value["until"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
    match until {
        Some(until) if until > chrono::Utc::now() => {
            let remaining = (until.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_seconds();
            let reason = value["reason"].as_str().unwrap_or("proactive veto");
            (true, format!("{reason} ({remaining}s)"))
        }
        _ => {
            let _ = store.policy_set(
                ENTRY_VETO_POLICY_KEY,
                &json!({"active": false}),
                "proactive manager entry veto",
            );
            (false, String::new())
        }
    }
}

pub fn clear_entry_veto(store: &Store) -> Result<()> {
    store.policy_set(
        ENTRY_VETO_POLICY_KEY,
        &json!({"active": false}),
        "proactive manager entry veto",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::testutil::base_snapshot;
    use chrono::Utc;

    fn position(side: PositionSide) -> ExchangePosition {
        ExchangePosition {
            side,
            qty: 0.01,
            entry_price: 95_000.0,
            mark_price: 95_000.0,
            unrealized_pnl: 0.0,
            leverage: 10.0,
            liquidation_price: 0.0,
        }
    }

    #[test]
    fn test_macro_reduce_on_qqq_drop() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        // QQQ down 1.4% over the hour.
        store
            .insert_macro_price("QQQ", now - ChronoDuration::minutes(90), 500.0)
            .unwrap();
        store.insert_macro_price("QQQ", now, 493.0).unwrap();

        let mut mgr = ProactiveManager::new("BTC/USDT:USDT");
        let pos = position(PositionSide::Long);
        let actions = mgr.check_macro_risk(&store, Some(&pos));
        assert!(actions
            .iter()
            .any(|a| a.kind == ProactiveKind::Reduce && a.reduce_pct == Some(30.0)));
    }

    #[test]
    fn test_macro_fail_open_without_data() {
        let store = Store::open_in_memory().unwrap();
        let mut mgr = ProactiveManager::new("BTC/USDT:USDT");
        let actions = mgr.check_macro_risk(&store, None);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_vix_absolute_warning() {
        let store = Store::open_in_memory().unwrap();
        store.insert_macro_price("VIX", Utc::now(), 34.0).unwrap();
        let mut mgr = ProactiveManager::new("BTC/USDT:USDT");
        let actions = mgr.check_macro_risk(&store, None);
        assert!(actions.iter().any(|a| a.kind == ProactiveKind::Warn));
    }

    #[test]
    fn test_score_rapid_drop() {
        let mut mgr = ProactiveManager::new("BTC/USDT:USDT");
        mgr.track_score(60.0, 0.0);
        mgr.track_score(50.0, 100.0);
        mgr.track_score(30.0, 200.0);
        let actions = mgr.check_score_trend();
        assert!(actions.iter().any(|a| a.kind == ProactiveKind::TightenSl));
    }

    #[test]
    fn test_score_trend_needs_history() {
        let mut mgr = ProactiveManager::new("BTC/USDT:USDT");
        mgr.track_score(60.0, 0.0);
        assert!(mgr.check_score_trend().is_empty());
    }

    #[test]
    fn test_sl_eta_warns_when_close() {
        let mut mgr = ProactiveManager::new("BTC/USDT:USDT");
        let pos = position(PositionSide::Long);
        let mut snap = base_snapshot();
        // Price just above the 2% stop with strong downward momentum.
        snap.price = 93_200.0;
        snap.returns.ret_5m = Some(-1.0);
        let action = mgr.check_sl_eta(Some(&pos), Some(&snap), 2.0);
        assert!(action.is_some());

        // Momentum away from the stop: no warning.
        let mut mgr = ProactiveManager::new("BTC/USDT:USDT");
        snap.returns.ret_5m = Some(0.5);
        assert!(mgr.check_sl_eta(Some(&pos), Some(&snap), 2.0).is_none());
    }

    #[test]
    fn test_entry_veto_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert!(!check_entry_veto(&store).0);
        set_entry_veto(&store, "VIX spike", 1800).unwrap();
        let (vetoed, reason) = check_entry_veto(&store);
        assert!(vetoed);
        assert!(reason.contains("VIX spike"));
        clear_entry_veto(&store).unwrap();
        assert!(!check_entry_veto(&store).0);
    }

    #[test]
    fn test_pre_event_guard_window() {
        let store = Store::open_in_memory().unwrap();
        let mut mgr = ProactiveManager::new("BTC/USDT:USDT");
        assert!(mgr.check_pre_event(&store, None).is_empty());

        store
            .policy_set(
                MACRO_EVENT_POLICY_KEY,
                &json!({"active": true, "events": ["FOMC"]}),
                "macro window",
            )
            .unwrap();
        let pos = position(PositionSide::Long);
        let actions = mgr.check_pre_event(&store, Some(&pos));
        assert!(actions.iter().any(|a| a.kind == ProactiveKind::BlockEntry));
        assert!(actions.iter().any(|a| a.kind == ProactiveKind::Reduce));
    }
}
