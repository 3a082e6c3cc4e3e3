//! Fill watcher daemon.
//!
//! 5-second poll loop over execution_log rows in SENT/PARTIALLY_FILLED.
//! Verifies fills against the venue, advances SENT → FILLED → VERIFIED,
//! computes realized PnL net of entry fees, keeps position_state in sync,
//! and embeds the reconciler every 5th cycle. Notifications report verified
//! facts only.

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::control::ControlFlags;
use crate::exchange::{BybitClient, FetchedOrder};
use crate::notify::{self, Notifier};
use crate::position_manager::CycleOutcome;
use crate::reconciler;
use crate::store::{ExecutionLogRow, PositionState, StageRecord, Store};
use crate::types::{
    ExecStatus, Money, OrderState, OrderType, PlanState, PositionSide, QueueStatus,
};

pub const POLL_SEC: u64 = 5;
pub const ORDER_TIMEOUT_SEC: i64 = 60;
pub const POSITION_VERIFY_DELAY_SEC: u64 = 2;
pub const MAX_POLLS_PER_ORDER: i64 = 30;
pub const RECONCILE_EVERY_N_CYCLES: u64 = 5;

/// Equality-to-zero test for close completeness.
pub const QTY_EPSILON: f64 = 1e-9;

const ADD_SLICE_PCT: f64 = 10.0;
const BUDGET_CAP_PCT: f64 = 70.0;

// ── PnL math ─────────────────────────────────────────────────────────

/// Full-exit PnL: gross move minus the exit fee minus the whole remaining
/// accumulated entry fee.
pub fn exit_realized_pnl(
    exit_price: f64,
    entry_price: f64,
    filled_qty: f64,
    dir_sign: f64,
    exit_fee: f64,
    accumulated_entry_fee: f64,
) -> f64 {
    let gross = (exit_price - entry_price) * filled_qty * dir_sign;
    gross - exit_fee.abs() - accumulated_entry_fee
}

/// Partial-exit PnL: the entry fee is charged proportionally to the share of
/// the position being closed. Returns `(pnl, proportional_entry_fee)`.
pub fn reduce_realized_pnl(
    exit_price: f64,
    entry_price: f64,
    filled_qty: f64,
    dir_sign: f64,
    exit_fee: f64,
    accumulated_entry_fee: f64,
    total_qty_before: f64,
) -> (f64, f64) {
    let gross = (exit_price - entry_price) * filled_qty * dir_sign;
    let proportional_fee = if total_qty_before > 0.0 {
        accumulated_entry_fee * (filled_qty / total_qty_before)
    } else {
        0.0
    };
    (gross - exit_fee.abs() - proportional_fee, proportional_fee)
}

// ── position_state mutations ─────────────────────────────────────────

/// Initialize position_state from a verified entry (or reverse-open) fill.
/// `start_stage` consumes stages 1..=start_stage at once.
#[allow(clippy::too_many_arguments)]
pub fn apply_entry_fill(
    ps: &mut PositionState,
    side: PositionSide,
    pos_qty: f64,
    avg_price: f64,
    filled_qty: f64,
    start_stage: u32,
    entry_pct: f64,
    fee: f64,
) {
    let start_stage = start_stage.clamp(1, 7);
    let capital_used = avg_price * filled_qty;
    ps.side = Some(side);
    ps.total_qty = Money::from_f64(pos_qty);
    ps.avg_entry_price = Money::from_f64(avg_price);
    ps.stage = start_stage;
    ps.start_stage_used = start_stage;
    ps.capital_used_usdt = Money::from_f64(capital_used);
    ps.trade_budget_used_pct = entry_pct.min(BUDGET_CAP_PCT);
    ps.next_stage_available = (start_stage + 1).min(7);
    ps.stage_consumed_mask = (1u32 << start_stage) - 1;
    ps.stages_detail = vec![StageRecord {
        stage: start_stage,
        price: Money::from_f64(avg_price),
        qty: Money::from_f64(filled_qty),
        pct: entry_pct,
        planned_usdt: Money::from_f64(capital_used),
        filled_usdt: Money::from_f64(capital_used),
    }];
    ps.accumulated_entry_fee = Money::from_f64(fee.abs());
    ps.order_state = OrderState::Filled;
    ps.plan_state = PlanState::Open;
    ps.filled_qty = Money::from_f64(filled_qty);
    ps.filled_usdt = Money::from_f64(capital_used);
    ps.peak_upnl_pct = 0.0;
}

/// Fold a verified ADD fill into position_state. Returns the new stage and
/// budget-used percentage for the notification.
pub fn apply_add_fill(
    ps: &mut PositionState,
    pos_side: PositionSide,
    pos_qty: f64,
    filled_qty: f64,
    avg_price: f64,
    fee: f64,
) -> (u32, f64) {
    let old_qty = ps.total_qty.to_f64();
    let old_avg = ps.avg_entry_price.to_f64();
    let total = old_qty + filled_qty;
    let new_avg = if total > 0.0 {
        (old_avg * old_qty + avg_price * filled_qty) / total
    } else {
        avg_price
    };

    let new_stage = (ps.stage + 1).min(7);
    ps.side = Some(pos_side);
    ps.total_qty = Money::from_f64(pos_qty);
    ps.avg_entry_price = Money::from_f64(new_avg);
    ps.stage = new_stage;
    ps.stage_consumed_mask |= 1 << (new_stage - 1);
    ps.next_stage_available = (new_stage + 1).min(7);
    ps.trade_budget_used_pct = (ps.trade_budget_used_pct + ADD_SLICE_PCT).min(BUDGET_CAP_PCT);
    ps.capital_used_usdt =
        Money::from_f64(ps.capital_used_usdt.to_f64() + avg_price * filled_qty);
    ps.accumulated_entry_fee =
        Money::from_f64(ps.accumulated_entry_fee.to_f64() + fee.abs());
    ps.stages_detail.push(StageRecord {
        stage: new_stage,
        price: Money::from_f64(avg_price),
        qty: Money::from_f64(filled_qty),
        pct: ADD_SLICE_PCT,
        planned_usdt: Money::from_f64(avg_price * filled_qty),
        filled_usdt: Money::from_f64(avg_price * filled_qty),
    });
    ps.order_state = OrderState::Filled;
    ps.plan_state = PlanState::Open;
    (new_stage, ps.trade_budget_used_pct)
}

/// Fold a verified REDUCE fill into position_state, deducting the
/// proportional entry fee from the accumulator.
pub fn apply_reduce_fill(
    ps: &mut PositionState,
    pos_side: PositionSide,
    pos_qty: f64,
    filled_qty: f64,
    avg_price: f64,
    proportional_entry_fee: f64,
) {
    ps.side = Some(pos_side);
    ps.total_qty = Money::from_f64(pos_qty);
    ps.filled_qty = Money::from_f64(pos_qty);
    ps.capital_used_usdt = Money::from_f64(
        (ps.capital_used_usdt.to_f64() - avg_price * filled_qty).max(0.0),
    );
    ps.accumulated_entry_fee = Money::from_f64(
        (ps.accumulated_entry_fee.to_f64() - proportional_entry_fee).max(0.0),
    );
}

// ── Daemon ───────────────────────────────────────────────────────────

pub struct FillWatcher {
    symbol: String,
    store: Store,
    client: BybitClient,
    notifier: Notifier,
    control: ControlFlags,
    cycle_count: u64,
}

impl FillWatcher {
    pub fn new(config: &Config, store: Store) -> Self {
        let client = BybitClient::new(
            config.exchange.api_key.clone().unwrap_or_default(),
            config.exchange.api_secret.clone().unwrap_or_default(),
            config.exchange.recv_window_ms,
            config.exchange.http_timeout_sec,
        );
        FillWatcher {
            symbol: config.symbol.clone(),
            store,
            client,
            notifier: Notifier::new(&config.telegram),
            control: ControlFlags::new(&config.control_dir),
            cycle_count: 0,
        }
    }

    pub async fn cycle(&mut self) -> CycleOutcome {
        if self.control.kill_switch_active() {
            info!("KILL_SWITCH detected. Exiting.");
            return CycleOutcome::Exit;
        }
        if let Err(e) = self.poll_cycle().await {
            error!("poll cycle error: {e:#}");
        }
        CycleOutcome::Sleep(POLL_SEC)
    }

    async fn poll_cycle(&mut self) -> Result<()> {
        self.cycle_count += 1;
        if self.cycle_count % RECONCILE_EVERY_N_CYCLES == 0 {
            if let Err(e) =
                reconciler::reconcile_and_heal(&self.store, &self.client, &self.notifier, &self.symbol)
                    .await
            {
                warn!("reconcile error: {e:#}");
            }
        }

        let rows = self.store.open_execution_orders()?;
        for row in rows {
            if let Err(e) = self.process_order(&row).await {
                error!("order {} processing error: {e:#}", row.order_id);
            }
        }
        Ok(())
    }

    async fn process_order(&mut self, row: &ExecutionLogRow) -> Result<()> {
        let poll_count = self.store.bump_poll_count(row.id)?;
        if poll_count > MAX_POLLS_PER_ORDER {
            self.handle_timeout(row).await?;
            if let Some(eq_id) = row.execution_queue_id {
                self.store.set_queue_status(eq_id, QueueStatus::Timeout)?;
            }
            return Ok(());
        }

        // Prefer the closed-orders endpoint, fall back to any-order lookup.
        let fetched = match self.client.fetch_closed_order(&row.order_id, &self.symbol).await {
            Ok(order) => order,
            Err(_) => match self.client.fetch_order(&row.order_id, &self.symbol).await {
                Ok(order) => order,
                Err(e) => {
                    warn!("order {} fetch failed on both endpoints: {e}", row.order_id);
                    return Ok(());
                }
            },
        };
        self.store.record_raw_fetch_response(row.id, &fetched.raw)?;

        if fetched.is_canceled() {
            self.handle_canceled(row).await?;
            if let Some(eq_id) = row.execution_queue_id {
                self.store.set_queue_status(eq_id, QueueStatus::Canceled)?;
            }
            return Ok(());
        }

        let filled = fetched.is_closed() || (fetched.filled_qty > 0.0 && !fetched.is_open());
        if filled {
            self.store.mark_execution_filled(
                row.id,
                Money::from_f64(fetched.filled_qty),
                Money::from_f64(fetched.avg_price),
                Money::from_f64(fetched.fee_cost),
                fetched.fee_currency.as_deref(),
            )?;
            if let Some(eq_id) = row.execution_queue_id {
                self.store.set_queue_status(eq_id, QueueStatus::Filled)?;
            }
            self.dispatch_fill(row, &fetched).await?;
            return Ok(());
        }

        if fetched.is_open() && fetched.filled_qty > 0.0 {
            self.store.mark_execution_partial(
                row.id,
                Money::from_f64(fetched.filled_qty),
                Money::from_f64(fetched.avg_price),
            )?;
            return Ok(());
        }

        let elapsed = row
            .order_sent_at
            .map(|at| (Utc::now() - at).num_seconds())
            .unwrap_or(i64::MAX);
        if elapsed > ORDER_TIMEOUT_SEC {
            self.handle_timeout(row).await?;
            if let Some(eq_id) = row.execution_queue_id {
                self.store.set_queue_status(eq_id, QueueStatus::Timeout)?;
            }
        }
        Ok(())
    }

    async fn dispatch_fill(&mut self, row: &ExecutionLogRow, fetched: &FetchedOrder) -> Result<()> {
        match row.order_type {
            OrderType::Open => self.handle_entry_filled(row, fetched).await,
            OrderType::Add => self.handle_add_filled(row, fetched).await,
            OrderType::Reduce => self.handle_reduce_filled(row, fetched).await,
            OrderType::ReverseClose => self.handle_reverse_close_filled(row, fetched).await,
            OrderType::ReverseOpen => self.handle_reverse_open_filled(row, fetched).await,
            _ if row.order_type.is_exit() => self.handle_exit_filled(row, fetched).await,
            other => {
                warn!("fill for unhandled order type {other}");
                Ok(())
            }
        }
    }

    /// Re-fetch the exchange position after the settle delay.
    async fn verified_position(&self) -> (Option<PositionSide>, f64) {
        tokio::time::sleep(std::time::Duration::from_secs(POSITION_VERIFY_DELAY_SEC)).await;
        match self.client.fetch_position(&self.symbol).await {
            Ok(Some(pos)) => (Some(pos.side), pos.qty),
            Ok(None) => (None, 0.0),
            Err(e) => {
                warn!("position verify fetch failed: {e}");
                (None, 0.0)
            }
        }
    }

    fn load_state(&self) -> Result<PositionState> {
        Ok(self
            .store
            .get_position_state(&self.symbol)?
            .unwrap_or_else(|| PositionState::flat(&self.symbol)))
    }

    /// Entry fill: initialize staged position state from the fill and the
    /// originating queue row's meta (start stage, entry percent).
    async fn handle_entry_filled(
        &mut self,
        row: &ExecutionLogRow,
        fetched: &FetchedOrder,
    ) -> Result<()> {
        let (pos_side, pos_qty) = self.verified_position().await;
        self.store.mark_execution_verified(
            row.id,
            pos_side,
            Money::from_f64(pos_qty),
            true,
            None,
        )?;

        let (start_stage, entry_pct) = self.entry_meta(row)?;
        let side = pos_side.unwrap_or(row.direction.position_side());

        let mut ps = self.load_state()?;
        apply_entry_fill(
            &mut ps,
            side,
            pos_qty,
            fetched.avg_price,
            fetched.filled_qty,
            start_stage,
            entry_pct,
            fetched.fee_cost,
        );
        self.store.save_position_state(&ps, true)?;

        self.notifier
            .send(&notify::format_entry_fill(
                row.direction,
                fetched.avg_price,
                fetched.filled_qty,
                start_stage,
                entry_pct,
                ps.next_stage_available,
            ))
            .await;
        info!(
            "ENTRY VERIFIED: {} qty={} price={} start_stage={start_stage}",
            row.direction, fetched.filled_qty, fetched.avg_price
        );
        Ok(())
    }

    fn entry_meta(&self, row: &ExecutionLogRow) -> Result<(u32, f64)> {
        let mut start_stage = 1u32;
        let mut entry_pct = 10.0;
        if let Some(eq_id) = row.execution_queue_id {
            if let Some(entry) = self.store.get_queue_entry(eq_id)? {
                if let Some(s) = entry.meta["start_stage"].as_u64() {
                    start_stage = (s as u32).clamp(1, 7);
                }
                entry_pct = entry.meta["entry_pct"]
                    .as_f64()
                    .unwrap_or(start_stage as f64 * 10.0);
            }
        }
        Ok((start_stage, entry_pct))
    }

    async fn handle_add_filled(
        &mut self,
        row: &ExecutionLogRow,
        fetched: &FetchedOrder,
    ) -> Result<()> {
        let (pos_side, pos_qty) = self.verified_position().await;
        self.store.mark_execution_verified(
            row.id,
            pos_side,
            Money::from_f64(pos_qty),
            true,
            None,
        )?;

        let side = pos_side.unwrap_or(row.direction.position_side());
        let mut ps = self.load_state()?;
        let (new_stage, budget_used) = apply_add_fill(
            &mut ps,
            side,
            pos_qty,
            fetched.filled_qty,
            fetched.avg_price,
            fetched.fee_cost,
        );
        self.store.save_position_state(&ps, true)?;

        self.notifier
            .send(&notify::format_add_fill(
                row.direction,
                fetched.avg_price,
                fetched.filled_qty,
                new_stage,
                budget_used,
            ))
            .await;
        info!(
            "ADD VERIFIED: {} qty={} price={} stage={new_stage} budget={budget_used:.0}%",
            row.direction, fetched.filled_qty, fetched.avg_price
        );
        Ok(())
    }

    async fn handle_reduce_filled(
        &mut self,
        row: &ExecutionLogRow,
        fetched: &FetchedOrder,
    ) -> Result<()> {
        let (pos_side, pos_qty) = self.verified_position().await;

        let mut ps = self.load_state()?;
        let entry_price = ps.avg_entry_price.to_f64();
        let total_before = ps.total_qty.to_f64();
        let acc_fee = ps.accumulated_entry_fee.to_f64();

        let realized = if entry_price > 0.0 {
            let (pnl, proportional_fee) = reduce_realized_pnl(
                fetched.avg_price,
                entry_price,
                fetched.filled_qty,
                row.direction.dir_sign(),
                fetched.fee_cost,
                acc_fee,
                total_before,
            );
            let side = pos_side.unwrap_or(row.direction.position_side());
            apply_reduce_fill(
                &mut ps,
                side,
                pos_qty,
                fetched.filled_qty,
                fetched.avg_price,
                proportional_fee,
            );
            Some(pnl)
        } else {
            None
        };
        self.store.save_position_state(&ps, false)?;
        self.store.mark_execution_verified(
            row.id,
            pos_side,
            Money::from_f64(pos_qty),
            true,
            realized.map(Money::from_f64),
        )?;

        self.notifier
            .send(&notify::format_reduce_fill(
                row.direction,
                fetched.avg_price,
                fetched.filled_qty,
                realized,
                pos_qty,
            ))
            .await;
        info!(
            "REDUCE VERIFIED: {} qty={} price={} pnl={realized:?}",
            row.direction, fetched.filled_qty, fetched.avg_price
        );
        Ok(())
    }

    /// Exit-class fill (CLOSE / FULL_CLOSE / EMERGENCY_CLOSE / STOP_LOSS /
    /// SCHEDULED_CLOSE): verify the position actually reached zero and
    /// settle the whole remaining entry fee into realized PnL.
    async fn handle_exit_filled(
        &mut self,
        row: &ExecutionLogRow,
        fetched: &FetchedOrder,
    ) -> Result<()> {
        let (pos_side, pos_qty) = self.verified_position().await;
        let position_verified = pos_qty < QTY_EPSILON;

        let mut ps = self.load_state()?;
        let entry_price = ps.avg_entry_price.to_f64();
        let acc_fee = ps.accumulated_entry_fee.to_f64();
        let realized = if entry_price > 0.0 {
            Some(exit_realized_pnl(
                fetched.avg_price,
                entry_price,
                fetched.filled_qty,
                row.direction.dir_sign(),
                fetched.fee_cost,
                acc_fee,
            ))
        } else {
            None
        };

        self.store.mark_execution_verified(
            row.id,
            pos_side,
            Money::from_f64(pos_qty),
            position_verified,
            realized.map(Money::from_f64),
        )?;

        if position_verified {
            ps.clear_to_flat();
            self.store.save_position_state(&ps, true)?;
        }

        self.notifier
            .send(&notify::format_exit_fill(
                row.order_type,
                row.direction,
                fetched.avg_price,
                fetched.filled_qty,
                realized,
                position_verified,
                row.close_reason.as_deref(),
            ))
            .await;
        info!(
            "EXIT VERIFIED: {} {} qty={} price={} pnl={realized:?}",
            row.order_type, row.direction, fetched.filled_qty, fetched.avg_price
        );
        Ok(())
    }

    /// Reverse close: same settlement as a full exit; the linked reverse
    /// open row proceeds on its own once this row is FILLED.
    async fn handle_reverse_close_filled(
        &mut self,
        row: &ExecutionLogRow,
        fetched: &FetchedOrder,
    ) -> Result<()> {
        let (pos_side, pos_qty) = self.verified_position().await;
        let position_verified = pos_qty < QTY_EPSILON;

        let mut ps = self.load_state()?;
        let entry_price = ps.avg_entry_price.to_f64();
        let acc_fee = ps.accumulated_entry_fee.to_f64();
        let realized = if entry_price > 0.0 {
            Some(exit_realized_pnl(
                fetched.avg_price,
                entry_price,
                fetched.filled_qty,
                row.direction.dir_sign(),
                fetched.fee_cost,
                acc_fee,
            ))
        } else {
            None
        };

        self.store.mark_execution_verified(
            row.id,
            pos_side,
            Money::from_f64(pos_qty),
            position_verified,
            realized.map(Money::from_f64),
        )?;

        ps.clear_to_flat();
        self.store.save_position_state(&ps, true)?;

        self.notifier
            .send(&notify::format_reverse_close_fill(
                row.direction,
                fetched.avg_price,
                realized,
                position_verified,
            ))
            .await;
        info!(
            "REVERSE_CLOSE VERIFIED: {} qty={} price={} pnl={realized:?}",
            row.direction, fetched.filled_qty, fetched.avg_price
        );
        Ok(())
    }

    /// Reverse open: identical to an entry; the fresh position discards the
    /// pre-reverse fee accumulator and starts at stage 1.
    async fn handle_reverse_open_filled(
        &mut self,
        row: &ExecutionLogRow,
        fetched: &FetchedOrder,
    ) -> Result<()> {
        let (pos_side, pos_qty) = self.verified_position().await;
        self.store.mark_execution_verified(
            row.id,
            pos_side,
            Money::from_f64(pos_qty),
            true,
            None,
        )?;

        let side = pos_side.unwrap_or(row.direction.position_side());
        let mut ps = self.load_state()?;
        apply_entry_fill(
            &mut ps,
            side,
            pos_qty,
            fetched.avg_price,
            fetched.filled_qty,
            1,
            10.0,
            fetched.fee_cost,
        );
        self.store.save_position_state(&ps, true)?;

        self.notifier
            .send(&notify::format_reverse_open_fill(
                row.direction,
                row.direction.opposite(),
                fetched.avg_price,
                fetched.filled_qty,
            ))
            .await;
        info!(
            "REVERSE_OPEN VERIFIED: {} qty={} price={}",
            row.direction, fetched.filled_qty, fetched.avg_price
        );
        Ok(())
    }

    async fn handle_timeout(&mut self, row: &ExecutionLogRow) -> Result<()> {
        self.store
            .mark_execution_terminal(row.id, ExecStatus::Timeout, "order_timeout")?;
        self.store
            .set_order_state(&self.symbol, OrderState::Timeout, None, None)?;
        self.reset_plan_state_by_position().await?;
        self.notifier
            .send(&notify::format_order_timeout(
                row.order_type,
                row.direction,
                &row.order_id,
            ))
            .await;
        info!("TIMEOUT: {} {} order_id={}", row.order_type, row.direction, row.order_id);
        Ok(())
    }

    async fn handle_canceled(&mut self, row: &ExecutionLogRow) -> Result<()> {
        self.store
            .mark_execution_terminal(row.id, ExecStatus::Canceled, "exchange_canceled")?;
        self.store
            .set_order_state(&self.symbol, OrderState::Canceled, None, None)?;
        self.reset_plan_state_by_position().await?;
        self.notifier
            .send(&notify::format_order_canceled(
                row.order_type,
                row.direction,
                &row.order_id,
            ))
            .await;
        info!("CANCELED: {} {} order_id={}", row.order_type, row.direction, row.order_id);
        Ok(())
    }

    /// After a dead order, the plan state depends on whether anything is
    /// still held.
    async fn reset_plan_state_by_position(&self) -> Result<()> {
        let ps = self.load_state()?;
        let has_position = ps.side.is_some() && ps.total_qty.to_f64() > 0.0;
        self.store.set_plan_state(
            &self.symbol,
            if has_position { PlanState::Open } else { PlanState::None },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exit_pnl_long() {
        // Long 0.01 from 95000 out at 96000: gross +10, exit fee 0.5,
        // entry fee 0.4 → 9.1.
        let pnl = exit_realized_pnl(96_000.0, 95_000.0, 0.01, 1.0, 0.5, 0.4);
        assert_relative_eq!(pnl, 9.1, epsilon = 1e-9);
    }

    #[test]
    fn test_exit_pnl_short_sign() {
        // Short profits when price falls.
        let pnl = exit_realized_pnl(94_000.0, 95_000.0, 0.01, -1.0, 0.5, 0.4);
        assert_relative_eq!(pnl, 10.0 - 0.9, epsilon = 1e-9);
        // And loses when it rises.
        let pnl = exit_realized_pnl(96_000.0, 95_000.0, 0.01, -1.0, 0.5, 0.4);
        assert_relative_eq!(pnl, -10.9, epsilon = 1e-9);
    }

    #[test]
    fn test_reduce_pnl_proportional_fee() {
        // Closing half the position charges half the accumulated entry fee.
        let (pnl, fee) = reduce_realized_pnl(96_000.0, 95_000.0, 0.005, 1.0, 0.25, 0.8, 0.01);
        assert_relative_eq!(fee, 0.4, epsilon = 1e-12);
        assert_relative_eq!(pnl, 5.0 - 0.25 - 0.4, epsilon = 1e-9);
    }

    #[test]
    fn test_entry_fill_invariants() {
        // Spec invariant 1: mask bit stage-1 set and stage = popcount(mask).
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        apply_entry_fill(
            &mut ps,
            PositionSide::Long,
            0.012,
            95_000.0,
            0.012,
            1,
            10.0,
            -0.63,
        );
        assert_eq!(ps.stage, 1);
        assert_eq!(ps.stage_consumed_mask, 0b1);
        assert_eq!(ps.stage, ps.stage_consumed_mask.count_ones());
        assert_eq!(ps.plan_state, PlanState::Open);
        assert_eq!(ps.order_state, OrderState::Filled);
        assert_eq!(ps.accumulated_entry_fee, Money::from_f64(0.63));
        assert_eq!(ps.stages_detail.len(), 1);
        assert_eq!(ps.next_stage_available, 2);
    }

    #[test]
    fn test_entry_fill_start_stage_three() {
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        apply_entry_fill(
            &mut ps,
            PositionSide::Short,
            0.03,
            95_000.0,
            0.03,
            3,
            30.0,
            0.5,
        );
        assert_eq!(ps.stage, 3);
        assert_eq!(ps.stage_consumed_mask, 0b111);
        assert_eq!(ps.stage, ps.stage_consumed_mask.count_ones());
        assert_eq!(ps.next_stage_available, 4);
        assert_eq!(ps.trade_budget_used_pct, 30.0);
    }

    #[test]
    fn test_add_fill_weighted_average_and_mask() {
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        apply_entry_fill(&mut ps, PositionSide::Long, 0.01, 95_000.0, 0.01, 1, 10.0, 0.5);

        let (stage, budget) =
            apply_add_fill(&mut ps, PositionSide::Long, 0.02, 0.01, 96_000.0, 0.5);
        assert_eq!(stage, 2);
        assert_eq!(budget, 20.0);
        assert_eq!(ps.stage_consumed_mask, 0b11);
        assert_eq!(ps.stage, ps.stage_consumed_mask.count_ones());
        // Weighted average of equal quantities at 95k and 96k.
        assert_relative_eq!(ps.avg_entry_price.to_f64(), 95_500.0, epsilon = 1e-6);
        assert_eq!(ps.stages_detail.len(), 2);
        assert_relative_eq!(ps.accumulated_entry_fee.to_f64(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_add_budget_capped_at_seventy() {
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        apply_entry_fill(&mut ps, PositionSide::Long, 0.01, 95_000.0, 0.01, 1, 65.0, 0.1);
        let (_, budget) = apply_add_fill(&mut ps, PositionSide::Long, 0.02, 0.01, 95_000.0, 0.1);
        assert_eq!(budget, 70.0, "budget must cap at 70%");
        assert!(ps.trade_budget_used_pct <= 70.0);
    }

    #[test]
    fn test_add_stage_capped_at_seven() {
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        apply_entry_fill(&mut ps, PositionSide::Long, 0.01, 95_000.0, 0.01, 1, 10.0, 0.0);
        for _ in 0..10 {
            apply_add_fill(&mut ps, PositionSide::Long, 0.02, 0.001, 95_000.0, 0.0);
        }
        assert_eq!(ps.stage, 7);
        assert_eq!(ps.next_stage_available, 7);
    }

    #[test]
    fn test_reduce_fill_deducts_proportional_fee() {
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        apply_entry_fill(&mut ps, PositionSide::Long, 0.01, 95_000.0, 0.01, 1, 10.0, 0.8);
        apply_reduce_fill(&mut ps, PositionSide::Long, 0.005, 0.005, 96_000.0, 0.4);
        assert_relative_eq!(ps.accumulated_entry_fee.to_f64(), 0.4, epsilon = 1e-12);
        assert_relative_eq!(ps.total_qty.to_f64(), 0.005, epsilon = 1e-12);
    }

    #[test]
    fn test_clear_to_flat_invariants() {
        // Spec invariant 2: after a verified close, side = ∅ and
        // plan_state = PLAN.NONE.
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        apply_entry_fill(&mut ps, PositionSide::Long, 0.01, 95_000.0, 0.01, 2, 20.0, 0.5);
        ps.clear_to_flat();
        assert!(ps.side.is_none());
        assert_eq!(ps.plan_state, PlanState::None);
        assert_eq!(ps.order_state, OrderState::None);
        assert!(ps.total_qty.is_zero());
        assert_eq!(ps.stage, 0);
        assert_eq!(ps.stage_consumed_mask, 0);
        assert!(ps.accumulated_entry_fee.is_zero());
    }

    #[test]
    fn test_qty_epsilon_close_completeness() {
        assert!(1e-10 < QTY_EPSILON);
        assert!(!(0.001 < QTY_EPSILON));
    }
}
