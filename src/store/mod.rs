//! SQLite-backed strategy store.
//!
//! The store is the only channel of record between daemons. Row structs are
//! loaded whole, mutated in Rust, and written back with full upserts; SQL
//! stays in this module. Monetary columns are TEXT-encoded [`Money`] values.

pub mod migrations;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::types::{
    ActionType, Direction, EntryMode, ExecStatus, JobStatus, Money, OrderState, OrderType,
    PlanState, PositionSide, QueueStatus,
};

fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn text_conversion_err(
    col: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
}

/// Truncate to at most `max_bytes`, backing off to a char boundary so
/// multi-byte (Korean) content never splits mid-character.
fn truncate_utf8(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut idx = max_bytes;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    s.truncate(idx);
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// One filled pyramid stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: u32,
    pub price: Money,
    pub qty: Money,
    pub pct: f64,
    #[serde(default)]
    pub planned_usdt: Money,
    #[serde(default)]
    pub filled_usdt: Money,
}

/// Singleton-per-symbol strategy position state.
#[derive(Debug, Clone)]
pub struct PositionState {
    pub symbol: String,
    pub side: Option<PositionSide>,
    pub total_qty: Money,
    pub avg_entry_price: Money,
    pub stage: u32,
    pub capital_used_usdt: Money,
    pub start_stage_used: u32,
    pub trade_budget_used_pct: f64,
    pub next_stage_available: u32,
    pub stage_consumed_mask: u32,
    pub stages_detail: Vec<StageRecord>,
    pub order_state: OrderState,
    pub plan_state: PlanState,
    pub planned_qty: Money,
    pub filled_qty: Money,
    pub planned_usdt: Money,
    pub sent_usdt: Money,
    pub filled_usdt: Money,
    pub last_order_id: Option<String>,
    pub accumulated_entry_fee: Money,
    pub peak_upnl_pct: f64,
    pub updated_at: Option<DateTime<Utc>>,
    pub state_changed_at: Option<DateTime<Utc>>,
}

impl PositionState {
    pub fn flat(symbol: &str) -> Self {
        PositionState {
            symbol: symbol.to_string(),
            side: None,
            total_qty: Money::ZERO,
            avg_entry_price: Money::ZERO,
            stage: 0,
            capital_used_usdt: Money::ZERO,
            start_stage_used: 0,
            trade_budget_used_pct: 0.0,
            next_stage_available: 1,
            stage_consumed_mask: 0,
            stages_detail: Vec::new(),
            order_state: OrderState::None,
            plan_state: PlanState::None,
            planned_qty: Money::ZERO,
            filled_qty: Money::ZERO,
            planned_usdt: Money::ZERO,
            sent_usdt: Money::ZERO,
            filled_usdt: Money::ZERO,
            last_order_id: None,
            accumulated_entry_fee: Money::ZERO,
            peak_upnl_pct: 0.0,
            updated_at: None,
            state_changed_at: None,
        }
    }

    /// Reset every position-carrying field; keeps the symbol row.
    pub fn clear_to_flat(&mut self) {
        let symbol = self.symbol.clone();
        *self = PositionState::flat(&symbol);
    }
}

/// New execution_queue row.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub symbol: String,
    pub action_type: ActionType,
    pub direction: Direction,
    pub target_qty: Option<Money>,
    pub target_usdt: Option<Money>,
    pub reduce_pct: Option<f64>,
    pub source: String,
    pub reason: String,
    pub priority: i64,
    pub depends_on: Option<i64>,
    pub pm_decision_id: Option<i64>,
    pub emergency_id: Option<i64>,
    pub expire_after_sec: i64,
    pub meta: serde_json::Value,
}

impl NewQueueEntry {
    pub fn new(symbol: &str, action_type: ActionType, direction: Direction) -> Self {
        NewQueueEntry {
            symbol: symbol.to_string(),
            action_type,
            direction,
            target_qty: None,
            target_usdt: None,
            reduce_pct: None,
            source: "position_manager".to_string(),
            reason: String::new(),
            priority: 5,
            depends_on: None,
            pm_decision_id: None,
            emergency_id: None,
            expire_after_sec: 300,
            meta: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub ts: Option<DateTime<Utc>>,
    pub symbol: String,
    pub action_type: ActionType,
    pub direction: Direction,
    pub target_qty: Option<Money>,
    pub target_usdt: Option<Money>,
    pub reduce_pct: Option<f64>,
    pub source: String,
    pub reason: String,
    pub priority: i64,
    pub status: QueueStatus,
    pub depends_on: Option<i64>,
    pub meta: serde_json::Value,
}

/// New execution_log row (written by the external order executor; inserted
/// here for the executor contract and for tests).
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub order_type: OrderType,
    pub direction: Direction,
    pub signal_id: Option<i64>,
    pub decision_id: Option<i64>,
    pub close_reason: Option<String>,
    pub requested_qty: Money,
    pub requested_usdt: Money,
    pub ticker_price: Money,
    pub execution_queue_id: Option<i64>,
    pub entry_mode: Option<EntryMode>,
}

#[derive(Debug, Clone)]
pub struct ExecutionLogRow {
    pub id: i64,
    pub order_id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub direction: Direction,
    pub signal_id: Option<i64>,
    pub decision_id: Option<i64>,
    pub close_reason: Option<String>,
    pub requested_qty: Money,
    pub status: ExecStatus,
    pub filled_qty: Money,
    pub avg_fill_price: Money,
    pub fee: Money,
    pub realized_pnl: Option<Money>,
    pub poll_count: i64,
    pub order_sent_at: Option<DateTime<Utc>>,
    pub execution_queue_id: Option<i64>,
    pub entry_mode: Option<EntryMode>,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionLogEntry {
    pub symbol: String,
    pub position_side: Option<PositionSide>,
    pub position_qty: Option<Money>,
    pub avg_entry_price: Option<Money>,
    pub stage: Option<u32>,
    pub current_price: Option<Money>,
    pub long_score: Option<f64>,
    pub short_score: Option<f64>,
    pub atr_14: Option<f64>,
    pub rsi_14: Option<f64>,
    pub poc: Option<Money>,
    pub vah: Option<Money>,
    pub val: Option<Money>,
    pub chosen_action: String,
    pub action_reason: String,
    pub full_context: serde_json::Value,
    pub model_used: Option<String>,
    pub model_provider: Option<String>,
    pub model_latency_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: i64,
    pub job_name: String,
    pub status: JobStatus,
    pub last_cursor: serde_json::Value,
    pub inserted: i64,
    pub updated: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsRow {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub title: String,
    pub summary: Option<String>,
    pub impact_score: Option<f64>,
    pub allow_for_trading: bool,
}

/// Shared handle over a single SQLite connection (WAL mode).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 30_000)?;
        migrations::run_all(&conn)?;
        info!("store opened: {}", db_path.display());
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_all(&conn)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // ── position_state ───────────────────────────────────────────────

    pub fn get_position_state(&self, symbol: &str) -> Result<Option<PositionState>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, side, total_qty, avg_entry_price, stage, capital_used_usdt,
                    start_stage_used, trade_budget_used_pct, next_stage_available,
                    stage_consumed_mask, stages_detail, order_state, plan_state,
                    planned_qty, filled_qty, planned_usdt, sent_usdt, filled_usdt,
                    last_order_id, accumulated_entry_fee, peak_upnl_pct,
                    updated_at, state_changed_at
             FROM position_state WHERE symbol = ?1",
        )?;
        let row = stmt
            .query_row(params![symbol], Self::map_position_state)
            .optional()?;
        Ok(row)
    }

    fn map_position_state(row: &Row<'_>) -> rusqlite::Result<PositionState> {
        let side: Option<String> = row.get(1)?;
        let order_state: String = row.get(11)?;
        let plan_state: String = row.get(12)?;
        let stages_json: String = row.get(10)?;
        let updated_at: Option<String> = row.get(21)?;
        let state_changed_at: Option<String> = row.get(22)?;
        let side = side
            .map(|s| s.parse().map_err(|e| text_conversion_err(1, e)))
            .transpose()?;
        Ok(PositionState {
            symbol: row.get(0)?,
            side,
            total_qty: row.get(2)?,
            avg_entry_price: row.get(3)?,
            stage: row.get::<_, i64>(4)? as u32,
            capital_used_usdt: row.get(5)?,
            start_stage_used: row.get::<_, i64>(6)? as u32,
            trade_budget_used_pct: row.get(7)?,
            next_stage_available: row.get::<_, i64>(8)? as u32,
            stage_consumed_mask: row.get::<_, i64>(9)? as u32,
            stages_detail: serde_json::from_str(&stages_json).unwrap_or_default(),
            order_state: order_state
                .parse()
                .map_err(|e| text_conversion_err(11, e))?,
            plan_state: plan_state
                .parse()
                .map_err(|e| text_conversion_err(12, e))?,
            planned_qty: row.get(13)?,
            filled_qty: row.get(14)?,
            planned_usdt: row.get(15)?,
            sent_usdt: row.get(16)?,
            filled_usdt: row.get(17)?,
            last_order_id: row.get(18)?,
            accumulated_entry_fee: row.get(19)?,
            peak_upnl_pct: row.get(20)?,
            updated_at: updated_at.as_deref().and_then(parse_ts),
            state_changed_at: state_changed_at.as_deref().and_then(parse_ts),
        })
    }

    /// Full-row upsert; bumps `updated_at`, and `state_changed_at` when
    /// requested (side/plan transitions).
    pub fn save_position_state(&self, ps: &PositionState, state_changed: bool) -> Result<()> {
        let conn = self.lock();
        let stages_json = serde_json::to_string(&ps.stages_detail)?;
        let now = now_ts();
        conn.execute(
            "INSERT INTO position_state
                (symbol, side, total_qty, avg_entry_price, stage, capital_used_usdt,
                 start_stage_used, trade_budget_used_pct, next_stage_available,
                 stage_consumed_mask, stages_detail, order_state, plan_state,
                 planned_qty, filled_qty, planned_usdt, sent_usdt, filled_usdt,
                 last_order_id, accumulated_entry_fee, peak_upnl_pct,
                 updated_at, state_changed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?22)
             ON CONFLICT (symbol) DO UPDATE SET
                side = excluded.side, total_qty = excluded.total_qty,
                avg_entry_price = excluded.avg_entry_price, stage = excluded.stage,
                capital_used_usdt = excluded.capital_used_usdt,
                start_stage_used = excluded.start_stage_used,
                trade_budget_used_pct = excluded.trade_budget_used_pct,
                next_stage_available = excluded.next_stage_available,
                stage_consumed_mask = excluded.stage_consumed_mask,
                stages_detail = excluded.stages_detail,
                order_state = excluded.order_state, plan_state = excluded.plan_state,
                planned_qty = excluded.planned_qty, filled_qty = excluded.filled_qty,
                planned_usdt = excluded.planned_usdt, sent_usdt = excluded.sent_usdt,
                filled_usdt = excluded.filled_usdt, last_order_id = excluded.last_order_id,
                accumulated_entry_fee = excluded.accumulated_entry_fee,
                peak_upnl_pct = excluded.peak_upnl_pct,
                updated_at = excluded.updated_at,
                state_changed_at = CASE WHEN ?23 THEN excluded.updated_at
                                        ELSE position_state.state_changed_at END",
            params![
                ps.symbol,
                ps.side.map(|s| s.as_str()),
                ps.total_qty,
                ps.avg_entry_price,
                ps.stage as i64,
                ps.capital_used_usdt,
                ps.start_stage_used as i64,
                ps.trade_budget_used_pct,
                ps.next_stage_available as i64,
                ps.stage_consumed_mask as i64,
                stages_json,
                ps.order_state.as_str(),
                ps.plan_state.as_str(),
                ps.planned_qty,
                ps.filled_qty,
                ps.planned_usdt,
                ps.sent_usdt,
                ps.filled_usdt,
                ps.last_order_id,
                ps.accumulated_entry_fee,
                ps.peak_upnl_pct,
                now,
                state_changed,
            ],
        )?;
        debug!(
            "position_state saved: {} side={:?} qty={} stage={}",
            ps.symbol,
            ps.side.map(|s| s.as_str()),
            ps.total_qty,
            ps.stage
        );
        Ok(())
    }

    pub fn set_plan_state(&self, symbol: &str, plan: PlanState) -> Result<()> {
        self.lock().execute(
            "UPDATE position_state SET plan_state = ?1, updated_at = ?2 WHERE symbol = ?3",
            params![plan.as_str(), now_ts(), symbol],
        )?;
        Ok(())
    }

    pub fn set_order_state(
        &self,
        symbol: &str,
        order_state: OrderState,
        filled_qty: Option<Money>,
        filled_usdt: Option<Money>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE position_state SET
                order_state = ?1,
                filled_qty = COALESCE(?2, filled_qty),
                filled_usdt = COALESCE(?3, filled_usdt),
                state_changed_at = ?4, updated_at = ?4
             WHERE symbol = ?5",
            params![order_state.as_str(), filled_qty, filled_usdt, now_ts(), symbol],
        )?;
        Ok(())
    }

    // ── execution_queue ──────────────────────────────────────────────

    pub fn enqueue(&self, entry: &NewQueueEntry) -> Result<i64> {
        let conn = self.lock();
        let expire_at = (Utc::now() + Duration::seconds(entry.expire_after_sec))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        conn.execute(
            "INSERT INTO execution_queue
                (symbol, action_type, direction, target_qty, target_usdt, reduce_pct,
                 source, reason, priority, status, expire_at, depends_on,
                 pm_decision_id, emergency_id, meta)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,'PENDING',?10,?11,?12,?13,?14)",
            params![
                entry.symbol,
                entry.action_type.as_str(),
                entry.direction.as_str(),
                entry.target_qty,
                entry.target_usdt,
                entry.reduce_pct,
                entry.source,
                entry.reason,
                entry.priority,
                expire_at,
                entry.depends_on,
                entry.pm_decision_id,
                entry.emergency_id,
                serde_json::to_string(&entry.meta)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Duplicate guard: same action/direction already PENDING or PICKED
    /// within the window.
    pub fn recent_duplicate_queue_entry(
        &self,
        symbol: &str,
        action_type: ActionType,
        direction: Direction,
        within_sec: i64,
    ) -> Result<Option<i64>> {
        let cutoff = (Utc::now() - Duration::seconds(within_sec))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = self.lock();
        let id = conn
            .query_row(
                "SELECT id FROM execution_queue
                 WHERE symbol = ?1 AND action_type = ?2 AND direction = ?3
                   AND status IN ('PENDING', 'PICKED') AND ts >= ?4
                 LIMIT 1",
                params![symbol, action_type.as_str(), direction.as_str(), cutoff],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Most recent PENDING action from a given source within the window
    /// (used for the strategy_intent deferral rule).
    pub fn recent_pending_from_source(
        &self,
        symbol: &str,
        source: &str,
        within_sec: i64,
    ) -> Result<Option<ActionType>> {
        let cutoff = (Utc::now() - Duration::seconds(within_sec))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = self.lock();
        let action: Option<String> = conn
            .query_row(
                "SELECT action_type FROM execution_queue
                 WHERE symbol = ?1 AND source = ?2 AND status = 'PENDING' AND ts >= ?3
                 ORDER BY id DESC LIMIT 1",
                params![symbol, source, cutoff],
                |r| r.get(0),
            )
            .optional()?;
        Ok(action.and_then(|a| a.parse().ok()))
    }

    pub fn set_queue_status(&self, id: i64, status: QueueStatus) -> Result<()> {
        self.lock().execute(
            "UPDATE execution_queue SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn get_queue_entry(&self, id: i64) -> Result<Option<QueueEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ts, symbol, action_type, direction, target_qty, target_usdt,
                    reduce_pct, source, reason, priority, status, depends_on, meta
             FROM execution_queue WHERE id = ?1",
        )?;
        let entry = stmt
            .query_row(params![id], Self::map_queue_entry)
            .optional()?;
        Ok(entry)
    }

    /// Executor ordering: `(priority ASC, id ASC)` over PENDING rows.
    pub fn pending_queue_entries(&self, symbol: &str) -> Result<Vec<QueueEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ts, symbol, action_type, direction, target_qty, target_usdt,
                    reduce_pct, source, reason, priority, status, depends_on, meta
             FROM execution_queue
             WHERE symbol = ?1 AND status = 'PENDING'
             ORDER BY priority ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![symbol], Self::map_queue_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn pending_queue_count(&self, symbol: &str) -> Result<i64> {
        let n = self.lock().query_row(
            "SELECT count(*) FROM execution_queue
             WHERE symbol = ?1 AND status IN ('PENDING', 'PICKED')",
            params![symbol],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    fn map_queue_entry(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
        let ts: Option<String> = row.get(1)?;
        let action: String = row.get(3)?;
        let direction: String = row.get(4)?;
        let status: String = row.get(11)?;
        let meta: String = row.get(13)?;
        Ok(QueueEntry {
            id: row.get(0)?,
            ts: ts.as_deref().and_then(parse_ts),
            symbol: row.get(2)?,
            action_type: action.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            direction: direction.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            target_qty: row.get(5)?,
            target_usdt: row.get(6)?,
            reduce_pct: row.get(7)?,
            source: row.get(8)?,
            reason: row.get(9)?,
            priority: row.get(10)?,
            status: status.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    11,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            depends_on: row.get(12)?,
            meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        })
    }

    // ── execution_log ────────────────────────────────────────────────

    pub fn insert_execution_log(&self, log: &NewExecutionLog) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO execution_log
                (order_id, client_order_id, symbol, order_type, direction, signal_id,
                 decision_id, close_reason, requested_qty, requested_usdt, ticker_price,
                 execution_queue_id, entry_mode)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                log.order_id,
                log.client_order_id,
                log.symbol,
                log.order_type.as_str(),
                log.direction.as_str(),
                log.signal_id,
                log.decision_id,
                log.close_reason,
                log.requested_qty,
                log.requested_usdt,
                log.ticker_price,
                log.execution_queue_id,
                log.entry_mode.map(|m| m.as_str()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Rows still waiting on fill verification, in audit (id) order.
    pub fn open_execution_orders(&self) -> Result<Vec<ExecutionLogRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, order_id, symbol, order_type, direction, signal_id, decision_id,
                    close_reason, requested_qty, status, filled_qty, avg_fill_price, fee,
                    realized_pnl, poll_count, order_sent_at, execution_queue_id, entry_mode
             FROM execution_log
             WHERE status IN ('SENT', 'PARTIALLY_FILLED')
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], Self::map_execution_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_execution_log(&self, id: i64) -> Result<Option<ExecutionLogRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, order_id, symbol, order_type, direction, signal_id, decision_id,
                    close_reason, requested_qty, status, filled_qty, avg_fill_price, fee,
                    realized_pnl, poll_count, order_sent_at, execution_queue_id, entry_mode
             FROM execution_log WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![id], Self::map_execution_log)
            .optional()?;
        Ok(row)
    }

    fn map_execution_log(row: &Row<'_>) -> rusqlite::Result<ExecutionLogRow> {
        let order_type: String = row.get(3)?;
        let direction: String = row.get(4)?;
        let status: String = row.get(9)?;
        let sent_at: Option<String> = row.get(15)?;
        let entry_mode: Option<String> = row.get(17)?;
        Ok(ExecutionLogRow {
            id: row.get(0)?,
            order_id: row.get(1)?,
            symbol: row.get(2)?,
            order_type: order_type.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            direction: direction.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            signal_id: row.get(5)?,
            decision_id: row.get(6)?,
            close_reason: row.get(7)?,
            requested_qty: row.get(8)?,
            status: status.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    9,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            filled_qty: row.get(10)?,
            avg_fill_price: row.get(11)?,
            fee: row.get(12)?,
            realized_pnl: row.get(13)?,
            poll_count: row.get(14)?,
            order_sent_at: sent_at.as_deref().and_then(parse_ts),
            execution_queue_id: row.get(16)?,
            entry_mode: entry_mode.and_then(|m| m.parse().ok()),
        })
    }

    pub fn bump_poll_count(&self, id: i64) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "UPDATE execution_log SET poll_count = poll_count + 1, last_poll_at = ?1
             WHERE id = ?2",
            params![now_ts(), id],
        )?;
        let n = conn.query_row(
            "SELECT poll_count FROM execution_log WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn record_raw_fetch_response(&self, id: i64, raw: &serde_json::Value) -> Result<()> {
        self.lock().execute(
            "UPDATE execution_log SET raw_fetch_response = ?1 WHERE id = ?2",
            params![serde_json::to_string(raw)?, id],
        )?;
        Ok(())
    }

    pub fn mark_execution_filled(
        &self,
        id: i64,
        filled_qty: Money,
        avg_price: Money,
        fee: Money,
        fee_currency: Option<&str>,
    ) -> Result<()> {
        let now = now_ts();
        self.lock().execute(
            "UPDATE execution_log SET
                status = 'FILLED', filled_qty = ?1, avg_fill_price = ?2,
                fee = ?3, fee_currency = ?4,
                first_fill_at = COALESCE(first_fill_at, ?5), last_fill_at = ?5
             WHERE id = ?6",
            params![filled_qty, avg_price, fee, fee_currency, now, id],
        )?;
        Ok(())
    }

    pub fn mark_execution_partial(&self, id: i64, filled_qty: Money, avg_price: Money) -> Result<()> {
        let now = now_ts();
        self.lock().execute(
            "UPDATE execution_log SET
                status = 'PARTIALLY_FILLED', filled_qty = ?1, avg_fill_price = ?2,
                first_fill_at = COALESCE(first_fill_at, ?3)
             WHERE id = ?4",
            params![filled_qty, avg_price, now, id],
        )?;
        Ok(())
    }

    pub fn mark_execution_terminal(
        &self,
        id: i64,
        status: ExecStatus,
        error_detail: &str,
    ) -> Result<()> {
        self.lock().execute(
            "UPDATE execution_log SET status = ?1, error_detail = ?2 WHERE id = ?3",
            params![status.as_str(), error_detail, id],
        )?;
        Ok(())
    }

    pub fn mark_execution_verified(
        &self,
        id: i64,
        pos_side: Option<PositionSide>,
        pos_qty: Money,
        position_verified: bool,
        realized_pnl: Option<Money>,
    ) -> Result<()> {
        self.lock().execute(
            "UPDATE execution_log SET
                status = 'VERIFIED', position_after_side = ?1, position_after_qty = ?2,
                position_verified = ?3, verified_at = ?4, realized_pnl = ?5
             WHERE id = ?6",
            params![
                pos_side.map(|s| s.as_str()),
                pos_qty,
                position_verified,
                now_ts(),
                realized_pnl,
                id
            ],
        )?;
        Ok(())
    }

    /// Realized PnL rows for the adaptive layers, newest first.
    pub fn recent_realized_trades(
        &self,
        symbol: &str,
        limit: i64,
    ) -> Result<Vec<(Option<Money>, Option<EntryMode>)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT realized_pnl, entry_mode FROM execution_log
             WHERE symbol = ?1
               AND order_type IN ('CLOSE', 'FULL_CLOSE', 'REDUCE', 'REVERSE_CLOSE')
               AND status IN ('FILLED', 'VERIFIED')
             ORDER BY last_fill_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![symbol, limit], |r| {
                let pnl: Option<Money> = r.get(0)?;
                let mode: Option<String> = r.get(1)?;
                Ok((pnl, mode.and_then(|m| m.parse::<EntryMode>().ok())))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn last_trade_fill_at(&self, symbol: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let ts: Option<String> = conn
            .query_row(
                "SELECT last_fill_at FROM execution_log
                 WHERE symbol = ?1 AND status IN ('FILLED', 'VERIFIED')
                   AND last_fill_at IS NOT NULL
                 ORDER BY last_fill_at DESC LIMIT 1",
                params![symbol],
                |r| r.get(0),
            )
            .optional()?;
        Ok(ts.as_deref().and_then(parse_ts))
    }

    /// Sum of realized PnL since the given instant (daily-loss safety check).
    pub fn realized_pnl_since(&self, symbol: &str, since: DateTime<Utc>) -> Result<Money> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT realized_pnl FROM execution_log
             WHERE symbol = ?1 AND realized_pnl IS NOT NULL AND last_fill_at >= ?2",
        )?;
        let cutoff = since.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let total = stmt
            .query_map(params![symbol, cutoff], |r| r.get::<_, Option<Money>>(0))?
            .filter_map(|r| r.ok().flatten())
            .sum();
        Ok(total)
    }

    pub fn orders_sent_since(&self, symbol: &str, since: DateTime<Utc>) -> Result<i64> {
        let cutoff = since.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let n = self.lock().query_row(
            "SELECT count(*) FROM execution_log WHERE symbol = ?1 AND order_sent_at >= ?2",
            params![symbol, cutoff],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // ── decision / audit logs ────────────────────────────────────────

    pub fn insert_decision_log(&self, e: &DecisionLogEntry) -> Result<i64> {
        let conn = self.lock();
        let mut context = serde_json::to_string(&e.full_context)?;
        truncate_utf8(&mut context, 10_000);
        conn.execute(
            "INSERT INTO pm_decision_log
                (symbol, position_side, position_qty, avg_entry_price, stage,
                 current_price, long_score, short_score, atr_14, rsi_14, poc, vah, val,
                 chosen_action, action_reason, full_context,
                 model_used, model_provider, model_latency_ms)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
            params![
                e.symbol,
                e.position_side.map(|s| s.as_str()),
                e.position_qty,
                e.avg_entry_price,
                e.stage.map(|s| s as i64),
                e.current_price,
                e.long_score,
                e.short_score,
                e.atr_14,
                e.rsi_14,
                e.poc,
                e.vah,
                e.val,
                e.chosen_action,
                e.action_reason,
                context,
                e.model_used,
                e.model_provider,
                e.model_latency_ms,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_event_trigger_log(
        &self,
        symbol: &str,
        mode: &str,
        triggers: &serde_json::Value,
        event_hash: &str,
        snapshot_price: Option<Money>,
        analysis_called: bool,
        analysis_result: Option<&serde_json::Value>,
        call_type: &str,
        dedup_blocked: bool,
    ) -> Result<i64> {
        let conn = self.lock();
        let mut result_json = analysis_result
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_default();
        truncate_utf8(&mut result_json, 5_000);
        conn.execute(
            "INSERT INTO event_trigger_log
                (symbol, mode, triggers, event_hash, snapshot_price,
                 analysis_called, analysis_result, call_type, dedup_blocked)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                symbol,
                mode,
                serde_json::to_string(triggers)?,
                event_hash,
                snapshot_price,
                analysis_called,
                result_json,
                call_type,
                dedup_blocked,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_emergency_log(
        &self,
        symbol: &str,
        trigger_type: &str,
        trigger_detail: &serde_json::Value,
        context_packet: &serde_json::Value,
        response_raw: &str,
        recommended_action: Option<&str>,
        confidence: Option<f64>,
        fallback_used: bool,
    ) -> Result<i64> {
        let conn = self.lock();
        let mut ctx = serde_json::to_string(context_packet)?;
        truncate_utf8(&mut ctx, 10_000);
        conn.execute(
            "INSERT INTO emergency_analysis_log
                (symbol, trigger_type, trigger_detail, context_packet, response_raw,
                 recommended_action, confidence, fallback_used)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                symbol,
                trigger_type,
                serde_json::to_string(trigger_detail)?,
                ctx,
                response_raw,
                recommended_action,
                confidence,
                fallback_used,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_compliance_event(
        &self,
        symbol: &str,
        event_type: &str,
        order_params: &serde_json::Value,
        compliance_passed: bool,
        reject_reason: Option<&str>,
        exchange_error_code: Option<i64>,
        suggested_fix: Option<&str>,
        detail: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO compliance_log
                (symbol, event_type, order_params, compliance_passed, reject_reason,
                 exchange_error_code, suggested_fix, detail)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                symbol,
                event_type,
                serde_json::to_string(order_params)?,
                compliance_passed,
                reject_reason,
                exchange_error_code,
                suggested_fix,
                serde_json::to_string(detail)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Compliance audit counters over a trailing window: (total, rejections,
    /// auto-corrected, rate-limit events).
    pub fn compliance_counts_since(&self, days: i64) -> Result<(i64, i64, i64, i64)> {
        let cutoff = (Utc::now() - Duration::days(days))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = self.lock();
        let row = conn.query_row(
            "SELECT count(*),
                    count(*) FILTER (WHERE NOT compliance_passed),
                    count(*) FILTER (WHERE event_type = 'AUTO_CORRECTED'),
                    count(*) FILTER (WHERE exchange_error_code = 10006)
             FROM compliance_log WHERE ts >= ?1",
            params![cutoff],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            },
        )?;
        Ok(row)
    }

    pub fn insert_proactive_log(
        &self,
        symbol: &str,
        action_type: &str,
        severity: &str,
        reason: &str,
        detail: &serde_json::Value,
    ) -> Result<()> {
        self.lock().execute(
            "INSERT INTO proactive_log (symbol, action_type, severity, reason, detail)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                symbol,
                action_type,
                severity,
                reason,
                serde_json::to_string(detail)?
            ],
        )?;
        Ok(())
    }

    // ── key/value state ──────────────────────────────────────────────

    pub fn adaptive_state_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM adaptive_layer_state WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
    }

    pub fn adaptive_state_set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.lock().execute(
            "INSERT INTO adaptive_layer_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                 updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, now_ts()],
        )?;
        Ok(())
    }

    pub fn policy_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM operator_policies WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
    }

    pub fn policy_set(&self, key: &str, value: &serde_json::Value, description: &str) -> Result<()> {
        self.lock().execute(
            "INSERT INTO operator_policies (key, value, description, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                 updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, description, now_ts()],
        )?;
        Ok(())
    }

    pub fn trade_switch_enabled(&self) -> Result<bool> {
        let conn = self.lock();
        let enabled: Option<bool> = conn
            .query_row(
                "SELECT enabled FROM trade_switch ORDER BY id DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(enabled.unwrap_or(true))
    }

    pub fn set_trade_switch(&self, enabled: bool) -> Result<()> {
        self.lock().execute(
            "INSERT INTO trade_switch (enabled, updated_at) VALUES (?1, ?2)",
            params![enabled, now_ts()],
        )?;
        Ok(())
    }

    // ── ingestion-side reads ─────────────────────────────────────────

    pub fn recent_news(&self, hours: i64, limit: i64) -> Result<Vec<NewsRow>> {
        let cutoff = (Utc::now() - Duration::hours(hours))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ts, title, summary, impact_score, allow_for_trading
             FROM news WHERE ts >= ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit], |r| {
                let ts: String = r.get(1)?;
                Ok(NewsRow {
                    id: r.get(0)?,
                    ts: parse_ts(&ts).unwrap_or_else(Utc::now),
                    title: r.get(2)?,
                    summary: r.get(3)?,
                    impact_score: r.get(4)?,
                    allow_for_trading: r.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_news(
        &self,
        ts: DateTime<Utc>,
        url: &str,
        title: &str,
        summary: Option<&str>,
        impact_score: Option<f64>,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO news (ts, url, title, summary, impact_score)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (url) DO UPDATE SET title = excluded.title,
                 summary = excluded.summary, impact_score = excluded.impact_score",
            params![
                ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                url,
                title,
                summary,
                impact_score
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest candles, newest first.
    pub fn latest_candles(&self, symbol: &str, tf: &str, limit: i64) -> Result<Vec<crate::types::Candle>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT ts, o, h, l, c, v FROM candles
             WHERE symbol = ?1 AND tf = ?2 ORDER BY ts DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![symbol, tf, limit], |r| {
                let ts: String = r.get(0)?;
                let o: Money = r.get(1)?;
                let h: Money = r.get(2)?;
                let l: Money = r.get(3)?;
                let c: Money = r.get(4)?;
                let v: Money = r.get(5)?;
                Ok(crate::types::Candle {
                    datetime: parse_ts(&ts).unwrap_or_else(Utc::now),
                    open: o.to_f64(),
                    high: h.to_f64(),
                    low: l.to_f64(),
                    close: c.to_f64(),
                    volume: v.to_f64(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn candles_between(
        &self,
        symbol: &str,
        tf: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<crate::types::Candle>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT ts, o, h, l, c, v FROM candles
             WHERE symbol = ?1 AND tf = ?2 AND ts >= ?3 AND ts < ?4
             ORDER BY ts ASC",
        )?;
        let rows = stmt
            .query_map(
                params![
                    symbol,
                    tf,
                    from.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    to.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                ],
                |r| {
                    let ts: String = r.get(0)?;
                    let o: Money = r.get(1)?;
                    let h: Money = r.get(2)?;
                    let l: Money = r.get(3)?;
                    let c: Money = r.get(4)?;
                    let v: Money = r.get(5)?;
                    Ok(crate::types::Candle {
                        datetime: parse_ts(&ts).unwrap_or_else(Utc::now),
                        open: o.to_f64(),
                        high: h.to_f64(),
                        low: l.to_f64(),
                        close: c.to_f64(),
                        volume: v.to_f64(),
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Idempotent candle upsert keyed on (symbol, tf, ts).
    pub fn upsert_candle(&self, symbol: &str, tf: &str, candle: &crate::types::Candle) -> Result<()> {
        self.lock().execute(
            "INSERT INTO candles (symbol, tf, ts, o, h, l, c, v)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT (symbol, tf, ts) DO UPDATE SET
                o = excluded.o, h = excluded.h, l = excluded.l,
                c = excluded.c, v = excluded.v",
            params![
                symbol,
                tf,
                candle
                    .datetime
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                Money::from_f64(candle.open),
                Money::from_f64(candle.high),
                Money::from_f64(candle.low),
                Money::from_f64(candle.close),
                Money::from_f64(candle.volume),
            ],
        )?;
        Ok(())
    }

    /// Latest macro price and the nearest price at-or-before `ago`.
    pub fn macro_price_change(
        &self,
        source: &str,
        ago: Duration,
    ) -> Result<Option<(f64, Option<f64>)>> {
        let conn = self.lock();
        let latest: Option<Money> = conn
            .query_row(
                "SELECT price FROM macro_data WHERE source = ?1 ORDER BY ts DESC LIMIT 1",
                params![source],
                |r| r.get(0),
            )
            .optional()?;
        let Some(latest) = latest else {
            return Ok(None);
        };
        let cutoff = (Utc::now() - ago).to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let past: Option<Money> = conn
            .query_row(
                "SELECT price FROM macro_data WHERE source = ?1 AND ts <= ?2
                 ORDER BY ts DESC LIMIT 1",
                params![source, cutoff],
                |r| r.get(0),
            )
            .optional()?;
        Ok(Some((latest.to_f64(), past.map(|p| p.to_f64()))))
    }

    pub fn insert_macro_price(&self, source: &str, ts: DateTime<Utc>, price: f64) -> Result<()> {
        self.lock().execute(
            "INSERT INTO macro_data (source, ts, price) VALUES (?1, ?2, ?3)",
            params![
                source,
                ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                Money::from_f64(price)
            ],
        )?;
        Ok(())
    }

    // ── backfill jobs ────────────────────────────────────────────────

    pub fn running_job(&self, job_name: &str) -> Result<Option<i64>> {
        let conn = self.lock();
        let id = conn
            .query_row(
                "SELECT id FROM backfill_job_runs
                 WHERE job_name = ?1 AND status = 'RUNNING' LIMIT 1",
                params![job_name],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn start_job(&self, job_name: &str, cursor: &serde_json::Value) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO backfill_job_runs (job_name, status, last_cursor)
             VALUES (?1, 'RUNNING', ?2)",
            params![job_name, serde_json::to_string(cursor)?],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_job_progress(
        &self,
        job_id: i64,
        cursor: &serde_json::Value,
        inserted: i64,
        updated: i64,
        failed: i64,
    ) -> Result<()> {
        self.lock().execute(
            "UPDATE backfill_job_runs SET last_cursor = ?1, inserted = ?2,
                 updated = ?3, failed = ?4
             WHERE id = ?5",
            params![serde_json::to_string(cursor)?, inserted, updated, failed, job_id],
        )?;
        Ok(())
    }

    pub fn finish_job(&self, job_id: i64, status: JobStatus, error: Option<&str>) -> Result<()> {
        self.lock().execute(
            "UPDATE backfill_job_runs SET status = ?1, error = ?2, finished_at = ?3
             WHERE id = ?4",
            params![status.as_str(), error, now_ts(), job_id],
        )?;
        Ok(())
    }

    pub fn last_job_cursor(&self, job_name: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.lock();
        let cursor: Option<String> = conn
            .query_row(
                "SELECT last_cursor FROM backfill_job_runs
                 WHERE job_name = ?1 ORDER BY id DESC LIMIT 1",
                params![job_name],
                |r| r.get(0),
            )
            .optional()?;
        Ok(cursor.and_then(|c| serde_json::from_str(&c).ok()))
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<JobRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_name, status, last_cursor, inserted, updated, failed
             FROM backfill_job_runs WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![job_id], |r| {
                let status: String = r.get(2)?;
                let cursor: String = r.get(3)?;
                Ok(JobRun {
                    id: r.get(0)?,
                    job_name: r.get(1)?,
                    status: status.parse().unwrap_or(JobStatus::Failed),
                    last_cursor: serde_json::from_str(&cursor).unwrap_or(serde_json::Value::Null),
                    inserted: r.get(4)?,
                    updated: r.get(5)?,
                    failed: r.get(6)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// News older than 24 h with no price path yet, ascending by id.
    pub fn news_needing_price_path(&self, after_id: i64, batch: i64) -> Result<Vec<(i64, DateTime<Utc>)>> {
        let cutoff = (Utc::now() - Duration::hours(24))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT n.id, n.ts FROM news n
             LEFT JOIN news_price_path npp ON npp.news_id = n.id
             WHERE n.id > ?1 AND npp.id IS NULL AND n.ts < ?2
             ORDER BY n.id ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![after_id, cutoff, batch], |r| {
                let ts: String = r.get(1)?;
                Ok((r.get::<_, i64>(0)?, parse_ts(&ts).unwrap_or_else(Utc::now)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_news_price_path(
        &self,
        news_id: i64,
        ts_news: DateTime<Utc>,
        btc_price_at: Money,
        price_source_tf: &str,
        max_drawdown_24h: f64,
        max_runup_24h: f64,
        end_ret_24h: f64,
        end_state_24h: &str,
        path_class: &str,
        recovery_minutes: Option<i64>,
    ) -> Result<()> {
        self.lock().execute(
            "INSERT INTO news_price_path
                (news_id, ts_news, btc_price_at, price_source_tf, max_drawdown_24h,
                 max_runup_24h, end_ret_24h, end_state_24h, path_class, recovery_minutes)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
             ON CONFLICT (news_id) DO UPDATE SET
                btc_price_at = excluded.btc_price_at,
                price_source_tf = excluded.price_source_tf,
                max_drawdown_24h = excluded.max_drawdown_24h,
                max_runup_24h = excluded.max_runup_24h,
                end_ret_24h = excluded.end_ret_24h,
                end_state_24h = excluded.end_state_24h,
                path_class = excluded.path_class,
                recovery_minutes = excluded.recovery_minutes,
                computed_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')",
            params![
                news_id,
                ts_news.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                btc_price_at,
                price_source_tf,
                max_drawdown_24h,
                max_runup_24h,
                end_ret_24h,
                end_state_24h,
                path_class,
                recovery_minutes,
            ],
        )?;
        Ok(())
    }

    pub fn news_price_path_count(&self) -> Result<i64> {
        let n = self
            .lock()
            .query_row("SELECT count(*) FROM news_price_path", [], |r| r.get(0))?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_state_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_position_state("BTC/USDT:USDT").unwrap().is_none());

        let mut ps = PositionState::flat("BTC/USDT:USDT");
        ps.side = Some(PositionSide::Long);
        ps.total_qty = Money::from_f64(0.013);
        ps.avg_entry_price = Money::from_f64(95000.5);
        ps.stage = 2;
        ps.stage_consumed_mask = 0b11;
        ps.trade_budget_used_pct = 20.0;
        ps.plan_state = PlanState::Open;
        ps.stages_detail = vec![StageRecord {
            stage: 1,
            price: Money::from_f64(95000.5),
            qty: Money::from_f64(0.013),
            pct: 10.0,
            planned_usdt: Money::from_f64(1235.0),
            filled_usdt: Money::from_f64(1235.0),
        }];
        store.save_position_state(&ps, true).unwrap();

        let loaded = store.get_position_state("BTC/USDT:USDT").unwrap().unwrap();
        assert_eq!(loaded.side, Some(PositionSide::Long));
        assert_eq!(loaded.total_qty, Money::from_f64(0.013));
        assert_eq!(loaded.stage, 2);
        assert_eq!(loaded.stage_consumed_mask, 0b11);
        assert_eq!(loaded.plan_state, PlanState::Open);
        assert_eq!(loaded.stages_detail.len(), 1);
        assert!(loaded.state_changed_at.is_some());
    }

    #[test]
    fn test_queue_total_order() {
        let store = Store::open_in_memory().unwrap();
        let sym = "BTC/USDT:USDT";
        let mut add = NewQueueEntry::new(sym, ActionType::Add, Direction::Long);
        add.priority = 5;
        let mut close = NewQueueEntry::new(sym, ActionType::Close, Direction::Long);
        close.priority = 2;
        let mut reduce = NewQueueEntry::new(sym, ActionType::Reduce, Direction::Long);
        reduce.priority = 3;

        store.enqueue(&add).unwrap();
        store.enqueue(&close).unwrap();
        store.enqueue(&reduce).unwrap();

        let pending = store.pending_queue_entries(sym).unwrap();
        let actions: Vec<ActionType> = pending.iter().map(|e| e.action_type).collect();
        assert_eq!(
            actions,
            vec![ActionType::Close, ActionType::Reduce, ActionType::Add]
        );
    }

    #[test]
    fn test_duplicate_queue_guard() {
        let store = Store::open_in_memory().unwrap();
        let sym = "BTC/USDT:USDT";
        let e = NewQueueEntry::new(sym, ActionType::Reduce, Direction::Long);
        let id = store.enqueue(&e).unwrap();
        assert_eq!(
            store
                .recent_duplicate_queue_entry(sym, ActionType::Reduce, Direction::Long, 300)
                .unwrap(),
            Some(id)
        );
        // Terminal status clears the guard.
        store.set_queue_status(id, QueueStatus::Filled).unwrap();
        assert!(store
            .recent_duplicate_queue_entry(sym, ActionType::Reduce, Direction::Long, 300)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_adaptive_state_kv() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.adaptive_state_get("mode_cooldowns").unwrap().is_none());
        store
            .adaptive_state_set("mode_cooldowns", &serde_json::json!({"MeanRev": 123.0}))
            .unwrap();
        let v = store.adaptive_state_get("mode_cooldowns").unwrap().unwrap();
        assert_eq!(v["MeanRev"], 123.0);
        // overwrite
        store
            .adaptive_state_set("mode_cooldowns", &serde_json::json!({}))
            .unwrap();
        let v = store.adaptive_state_get("mode_cooldowns").unwrap().unwrap();
        assert!(v.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_job_run_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.running_job("news_path").unwrap().is_none());
        let id = store
            .start_job("news_path", &serde_json::json!({"last_news_id": 0}))
            .unwrap();
        assert_eq!(store.running_job("news_path").unwrap(), Some(id));
        store
            .update_job_progress(id, &serde_json::json!({"last_news_id": 42}), 10, 2, 1)
            .unwrap();
        store.finish_job(id, JobStatus::Completed, None).unwrap();
        assert!(store.running_job("news_path").unwrap().is_none());
        let cursor = store.last_job_cursor("news_path").unwrap().unwrap();
        assert_eq!(cursor["last_news_id"], 42);
    }

    #[test]
    fn test_candle_upsert_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let candle = crate::types::Candle {
            datetime: Utc::now(),
            open: 95000.0,
            high: 95100.0,
            low: 94900.0,
            close: 95050.0,
            volume: 12.5,
        };
        store.upsert_candle("BTC/USDT:USDT", "1m", &candle).unwrap();
        store.upsert_candle("BTC/USDT:USDT", "1m", &candle).unwrap();
        assert_eq!(store.latest_candles("BTC/USDT:USDT", "1m", 10).unwrap().len(), 1);
    }
}
