//! Pre-enqueue safety checks.
//!
//! Every decision that would add risk passes these gates before a queue row
//! is written: daily loss limit, hourly order throttle, total exposure vs the
//! operating capital cap, pyramid stage ceiling, and the event entry freeze.
//! Emergency-mode requests skip the loss/throttle gates but never the
//! exposure cap.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::decision::entry_frozen;
use crate::store::Store;
use crate::types::Money;

pub const SAFETY_LIMITS_POLICY_KEY: &str = "safety_limits";
pub const MAX_STAGE: u32 = 7;
pub const TRADE_BUDGET_CAP_PCT: f64 = 70.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub daily_loss_limit_usdt: f64,
    pub max_orders_per_hour: i64,
    pub operating_cap_usdt: f64,
    pub add_slice_pct: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        SafetyLimits {
            daily_loss_limit_usdt: 200.0,
            max_orders_per_hour: 12,
            operating_cap_usdt: 10_000.0,
            add_slice_pct: 10.0,
        }
    }
}

impl SafetyLimits {
    /// Operator-tunable limits from the policy table, defaults otherwise.
    pub fn load(store: &Store) -> Self {
        store
            .policy_get(SAFETY_LIMITS_POLICY_KEY)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, store: &Store) -> Result<()> {
        store.policy_set(
            SAFETY_LIMITS_POLICY_KEY,
            &serde_json::to_value(self)?,
            "safety limits",
        )
    }

    pub fn add_slice_usdt(&self) -> f64 {
        self.operating_cap_usdt * self.add_slice_pct / 100.0
    }
}

/// Run all safety checks for a risk-adding action of `target_usdt` notional.
/// Returns `(ok, reason)`.
pub fn run_all_checks(
    store: &Store,
    symbol: &str,
    target_usdt: f64,
    emergency: bool,
) -> Result<(bool, String)> {
    let limits = SafetyLimits::load(store);

    if !store.trade_switch_enabled()? {
        return Ok((false, "trade_switch OFF".to_string()));
    }

    if entry_frozen(store) {
        return Ok((false, "entry freeze active".to_string()));
    }

    if !emergency {
        // Daily loss limit.
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);
        let realized_today = store.realized_pnl_since(symbol, midnight)?;
        if realized_today < Money::from_f64(-limits.daily_loss_limit_usdt) {
            return Ok((
                false,
                format!(
                    "daily loss limit: {} < -{}",
                    realized_today.round_dp(2),
                    limits.daily_loss_limit_usdt
                ),
            ));
        }

        // Hourly order throttle.
        let hour_ago = Utc::now() - Duration::hours(1);
        let recent_orders = store.orders_sent_since(symbol, hour_ago)?;
        if recent_orders >= limits.max_orders_per_hour {
            return Ok((
                false,
                format!(
                    "hourly order limit: {recent_orders} >= {}",
                    limits.max_orders_per_hour
                ),
            ));
        }
    }

    // Exposure vs operating cap (applies even in emergencies).
    let capital_used = store
        .get_position_state(symbol)?
        .map(|ps| ps.capital_used_usdt.to_f64())
        .unwrap_or(0.0);
    if capital_used + target_usdt > limits.operating_cap_usdt {
        return Ok((
            false,
            format!(
                "capital cap: {capital_used:.0} + {target_usdt:.0} > {:.0}",
                limits.operating_cap_usdt
            ),
        ));
    }

    // Pyramid stage ceiling.
    if let Some(ps) = store.get_position_state(symbol)? {
        if target_usdt > 0.0 && ps.stage >= MAX_STAGE {
            return Ok((false, format!("max stages reached: {}/{MAX_STAGE}", ps.stage)));
        }
        if target_usdt > 0.0 && ps.trade_budget_used_pct >= TRADE_BUDGET_CAP_PCT {
            return Ok((
                false,
                format!(
                    "trade budget exhausted: {:.0}% >= {TRADE_BUDGET_CAP_PCT:.0}%",
                    ps.trade_budget_used_pct
                ),
            ));
        }
    }

    Ok((true, "ok".to_string()))
}

pub fn get_add_slice_usdt(store: &Store) -> f64 {
    let slice = SafetyLimits::load(store).add_slice_usdt();
    info!("add slice sizing: {slice:.0} USDT");
    slice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PositionState;
    use crate::types::PositionSide;

    #[test]
    fn test_checks_pass_on_clean_state() {
        let store = Store::open_in_memory().unwrap();
        let (ok, reason) = run_all_checks(&store, "BTC/USDT:USDT", 1000.0, false).unwrap();
        assert!(ok, "{reason}");
    }

    #[test]
    fn test_trade_switch_off_blocks() {
        let store = Store::open_in_memory().unwrap();
        store.set_trade_switch(false).unwrap();
        let (ok, reason) = run_all_checks(&store, "BTC/USDT:USDT", 100.0, false).unwrap();
        assert!(!ok);
        assert!(reason.contains("trade_switch"));
    }

    #[test]
    fn test_capital_cap_blocks() {
        let store = Store::open_in_memory().unwrap();
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        ps.side = Some(PositionSide::Long);
        ps.capital_used_usdt = Money::from_f64(9_800.0);
        store.save_position_state(&ps, true).unwrap();

        let (ok, reason) = run_all_checks(&store, "BTC/USDT:USDT", 500.0, false).unwrap();
        assert!(!ok);
        assert!(reason.contains("capital cap"));
        // The cap also binds in emergency mode.
        let (ok, _) = run_all_checks(&store, "BTC/USDT:USDT", 500.0, true).unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_max_stage_blocks_add() {
        let store = Store::open_in_memory().unwrap();
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        ps.side = Some(PositionSide::Long);
        ps.stage = 7;
        store.save_position_state(&ps, true).unwrap();

        let (ok, reason) = run_all_checks(&store, "BTC/USDT:USDT", 100.0, false).unwrap();
        assert!(!ok);
        assert!(reason.contains("max stages"));
    }

    #[test]
    fn test_budget_cap_blocks_add() {
        let store = Store::open_in_memory().unwrap();
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        ps.side = Some(PositionSide::Long);
        ps.stage = 4;
        ps.trade_budget_used_pct = 70.0;
        store.save_position_state(&ps, true).unwrap();

        let (ok, reason) = run_all_checks(&store, "BTC/USDT:USDT", 100.0, false).unwrap();
        assert!(!ok);
        assert!(reason.contains("budget"));
    }

    #[test]
    fn test_limits_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut limits = SafetyLimits::default();
        limits.operating_cap_usdt = 5_000.0;
        limits.save(&store).unwrap();
        let loaded = SafetyLimits::load(&store);
        assert_eq!(loaded.operating_cap_usdt, 5_000.0);
        assert_eq!(loaded.add_slice_usdt(), 500.0);
    }
}
