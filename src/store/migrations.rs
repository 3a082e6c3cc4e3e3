//! Idempotent schema creation.
//!
//! Every `ensure_*` function is safe to call any number of times; daemons
//! call [`run_all`] at startup so whichever process boots first creates the
//! schema and later boots are no-ops.

use rusqlite::Connection;

pub fn run_all(conn: &Connection) -> rusqlite::Result<()> {
    ensure_position_state(conn)?;
    ensure_execution_queue(conn)?;
    ensure_execution_log(conn)?;
    ensure_pm_decision_log(conn)?;
    ensure_event_trigger_log(conn)?;
    ensure_emergency_analysis_log(conn)?;
    ensure_compliance_log(conn)?;
    ensure_proactive_log(conn)?;
    ensure_adaptive_layer_state(conn)?;
    ensure_trade_switch(conn)?;
    ensure_policies(conn)?;
    ensure_news(conn)?;
    ensure_candles(conn)?;
    ensure_macro_data(conn)?;
    ensure_news_price_path(conn)?;
    ensure_backfill_job_runs(conn)?;
    Ok(())
}

pub fn ensure_position_state(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS position_state (
            symbol TEXT PRIMARY KEY,
            side TEXT,
            total_qty TEXT NOT NULL DEFAULT '0',
            avg_entry_price TEXT NOT NULL DEFAULT '0',
            stage INTEGER NOT NULL DEFAULT 0,
            capital_used_usdt TEXT NOT NULL DEFAULT '0',
            start_stage_used INTEGER NOT NULL DEFAULT 0,
            trade_budget_used_pct REAL NOT NULL DEFAULT 0,
            next_stage_available INTEGER NOT NULL DEFAULT 1,
            stage_consumed_mask INTEGER NOT NULL DEFAULT 0,
            stages_detail TEXT NOT NULL DEFAULT '[]',
            order_state TEXT NOT NULL DEFAULT 'NONE',
            plan_state TEXT NOT NULL DEFAULT 'PLAN.NONE',
            planned_qty TEXT NOT NULL DEFAULT '0',
            filled_qty TEXT NOT NULL DEFAULT '0',
            planned_usdt TEXT NOT NULL DEFAULT '0',
            sent_usdt TEXT NOT NULL DEFAULT '0',
            filled_usdt TEXT NOT NULL DEFAULT '0',
            last_order_id TEXT,
            accumulated_entry_fee TEXT NOT NULL DEFAULT '0',
            peak_upnl_pct REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            state_changed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );",
    )
}

pub fn ensure_execution_queue(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS execution_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            symbol TEXT NOT NULL,
            action_type TEXT NOT NULL,
            direction TEXT NOT NULL,
            target_qty TEXT,
            target_usdt TEXT,
            reduce_pct REAL,
            source TEXT NOT NULL DEFAULT 'position_manager',
            reason TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 5,
            status TEXT NOT NULL DEFAULT 'PENDING',
            expire_at TEXT,
            depends_on INTEGER REFERENCES execution_queue(id),
            pm_decision_id INTEGER,
            emergency_id INTEGER,
            meta TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_eq_status ON execution_queue(symbol, status);
        CREATE INDEX IF NOT EXISTS idx_eq_order ON execution_queue(priority, id);",
    )
}

pub fn ensure_execution_log(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS execution_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id TEXT NOT NULL,
            client_order_id TEXT,
            symbol TEXT NOT NULL,
            order_type TEXT NOT NULL,
            direction TEXT NOT NULL,
            signal_id INTEGER,
            decision_id INTEGER,
            close_reason TEXT,
            requested_qty TEXT NOT NULL DEFAULT '0',
            requested_usdt TEXT NOT NULL DEFAULT '0',
            ticker_price TEXT NOT NULL DEFAULT '0',
            status TEXT NOT NULL DEFAULT 'SENT',
            filled_qty TEXT NOT NULL DEFAULT '0',
            avg_fill_price TEXT NOT NULL DEFAULT '0',
            fee TEXT NOT NULL DEFAULT '0',
            fee_currency TEXT,
            realized_pnl TEXT,
            position_after_side TEXT,
            position_after_qty TEXT NOT NULL DEFAULT '0',
            position_verified INTEGER NOT NULL DEFAULT 0,
            verified_at TEXT,
            poll_count INTEGER NOT NULL DEFAULT 0,
            last_poll_at TEXT,
            order_sent_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            first_fill_at TEXT,
            last_fill_at TEXT,
            raw_fetch_response TEXT,
            error_detail TEXT,
            source_queue TEXT,
            execution_queue_id INTEGER REFERENCES execution_queue(id),
            entry_mode TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_el_status ON execution_log(status);
        CREATE INDEX IF NOT EXISTS idx_el_symbol_fill ON execution_log(symbol, last_fill_at);",
    )
}

pub fn ensure_pm_decision_log(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pm_decision_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            symbol TEXT NOT NULL,
            position_side TEXT,
            position_qty TEXT,
            avg_entry_price TEXT,
            stage INTEGER,
            current_price TEXT,
            long_score REAL,
            short_score REAL,
            atr_14 REAL,
            rsi_14 REAL,
            poc TEXT,
            vah TEXT,
            val TEXT,
            chosen_action TEXT NOT NULL,
            action_reason TEXT,
            full_context TEXT,
            model_used TEXT,
            model_provider TEXT,
            model_latency_ms INTEGER
        );",
    )
}

pub fn ensure_event_trigger_log(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS event_trigger_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            symbol TEXT NOT NULL,
            mode TEXT NOT NULL,
            triggers TEXT NOT NULL DEFAULT '[]',
            event_hash TEXT,
            snapshot_ts TEXT,
            snapshot_price TEXT,
            analysis_called INTEGER NOT NULL DEFAULT 0,
            analysis_result TEXT,
            call_type TEXT,
            dedup_blocked INTEGER NOT NULL DEFAULT 0
        );",
    )
}

pub fn ensure_emergency_analysis_log(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS emergency_analysis_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            symbol TEXT NOT NULL,
            trigger_type TEXT NOT NULL,
            trigger_detail TEXT NOT NULL DEFAULT '{}',
            context_packet TEXT,
            response_raw TEXT,
            risk_level TEXT,
            recommended_action TEXT,
            confidence REAL,
            reason_bullets TEXT NOT NULL DEFAULT '[]',
            ttl_seconds INTEGER,
            api_latency_ms INTEGER,
            fallback_used INTEGER NOT NULL DEFAULT 0
        );",
    )
}

pub fn ensure_compliance_log(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS compliance_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            symbol TEXT NOT NULL,
            event_type TEXT NOT NULL,
            order_params TEXT NOT NULL DEFAULT '{}',
            compliance_passed INTEGER NOT NULL,
            reject_reason TEXT,
            exchange_error_code INTEGER,
            suggested_fix TEXT,
            emergency_flag INTEGER NOT NULL DEFAULT 0,
            detail TEXT NOT NULL DEFAULT '{}'
        );",
    )
}

pub fn ensure_proactive_log(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS proactive_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            symbol TEXT NOT NULL,
            action_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            reason TEXT NOT NULL,
            detail TEXT NOT NULL DEFAULT '{}'
        );",
    )
}

pub fn ensure_adaptive_layer_state(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS adaptive_layer_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );",
    )
}

pub fn ensure_trade_switch(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS trade_switch (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            enabled INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );",
    )
}

pub fn ensure_policies(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS operator_policies (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            description TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );",
    )
}

pub fn ensure_news(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS news (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            url TEXT UNIQUE,
            title TEXT NOT NULL,
            summary TEXT,
            impact_score REAL,
            allow_for_trading INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_news_ts ON news(ts);",
    )
}

pub fn ensure_candles(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS candles (
            symbol TEXT NOT NULL,
            tf TEXT NOT NULL,
            ts TEXT NOT NULL,
            o TEXT NOT NULL,
            h TEXT NOT NULL,
            l TEXT NOT NULL,
            c TEXT NOT NULL,
            v TEXT NOT NULL,
            PRIMARY KEY (symbol, tf, ts)
        );",
    )
}

pub fn ensure_macro_data(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS macro_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            ts TEXT NOT NULL,
            price TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_macro_source_ts ON macro_data(source, ts);",
    )
}

pub fn ensure_news_price_path(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS news_price_path (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            news_id INTEGER NOT NULL UNIQUE REFERENCES news(id),
            ts_news TEXT NOT NULL,
            btc_price_at TEXT,
            price_source_tf TEXT,
            max_drawdown_24h REAL,
            max_runup_24h REAL,
            end_ret_24h REAL,
            end_state_24h TEXT,
            path_class TEXT,
            recovery_minutes INTEGER,
            computed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );",
    )
}

pub fn ensure_backfill_job_runs(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS backfill_job_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'RUNNING',
            last_cursor TEXT NOT NULL DEFAULT '{}',
            inserted INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            started_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            finished_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_bjr_name ON backfill_job_runs(job_name, id);",
    )
}
