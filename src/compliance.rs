//! Exchange Compliance Layer (ECL).
//!
//! Pre-order validation plus venue error mapping. Exchange rules outrank
//! risk rules which outrank strategy logic; even EMERGENCY orders must pass.
//!
//! Pipeline (short-circuit on first denial):
//!   rate limit → consecutive-error block → stepSize alignment → minQty →
//!   minNotional → tickSize alignment → reduce-only integrity.
//!
//! Two independent guards run on top:
//!   - consecutive-error auto-block: 3 errors on the symbol → 300 s block,
//!     reset on any success;
//!   - protection mode: 3 errors inside a 120 s rolling window → 300 s in
//!     which OPEN/ADD are blocked and risk-reducing actions stay allowed.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::exchange::{BybitClient, ExchangeError, MarketInfo};
use crate::types::{ActionType, Direction};

pub const RATE_LIMIT_SEC: f64 = 1.0;
pub const CONSECUTIVE_ERROR_THRESHOLD: u32 = 3;
pub const CONSECUTIVE_ERROR_BLOCK_SEC: u64 = 300;
pub const PROTECTION_MODE_WINDOW_SEC: u64 = 120;
pub const PROTECTION_MODE_THRESHOLD: usize = 3;
pub const PROTECTION_MODE_DURATION_SEC: u64 = 300;
pub const MARKET_INFO_TTL_SEC: u64 = 600;
const DUPLICATE_PRICE_WINDOW_SEC: f64 = 5.0;

/// Error codes that trigger an immediate market-info refresh.
pub const REFRESH_TRIGGER_CODES: [i64; 6] = [10001, 10003, 10004, 10006, 130021, 130074];

/// Codes the caller may retry once after realigning parameters.
pub const AUTO_CORRECTABLE_CODES: [i64; 2] = [10003, 10004];

pub fn should_refresh_on_error(code: i64) -> bool {
    REFRESH_TRIGGER_CODES.contains(&code)
}

pub fn is_auto_correctable(code: i64) -> bool {
    AUTO_CORRECTABLE_CODES.contains(&code)
}

// ── Alignment helpers ────────────────────────────────────────────────

/// Count decimal places in a step value (0.001 → 3).
pub fn step_decimals(step: f64) -> u32 {
    let s = format!("{step:.10}");
    let trimmed = s.trim_end_matches('0');
    match trimmed.split_once('.') {
        Some((_, frac)) => frac.len() as u32,
        None => 0,
    }
}

fn round_dp(value: f64, dp: u32) -> f64 {
    let factor = 10f64.powi(dp as i32);
    (value * factor).round() / factor
}

/// Align quantity to the step size, rounding DOWN to the nearest step.
pub fn align_qty(qty: f64, step_size: f64) -> f64 {
    if step_size <= 0.0 {
        return qty;
    }
    let aligned = (qty / step_size).floor() * step_size;
    round_dp(aligned, step_decimals(step_size))
}

/// Align price to the tick size, rounding to the nearest tick.
pub fn align_price(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    let aligned = (price / tick_size).round() * tick_size;
    round_dp(aligned, step_decimals(tick_size))
}

// ── Order params / result ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderExecType {
    Market,
    Limit,
}

#[derive(Debug, Clone)]
pub struct OrderParams {
    pub side: Direction,
    pub qty: f64,
    pub price: Option<f64>,
    pub order_type: OrderExecType,
    pub reduce_only: bool,
    /// Current position quantity, for reduce-only capping.
    pub position_qty: f64,
    /// Notional value in USDT, 0 when unknown.
    pub usdt_value: f64,
}

#[derive(Debug, Clone)]
pub struct ComplianceResult {
    pub ok: bool,
    pub reason: String,
    pub corrected_qty: Option<f64>,
    pub corrected_price: Option<f64>,
    pub was_corrected: bool,
    pub reject_reason: Option<String>,
    pub suggested_fix: Option<String>,
}

impl ComplianceResult {
    fn approved(qty: f64, price: Option<f64>, was_corrected: bool) -> Self {
        ComplianceResult {
            ok: true,
            reason: "compliance passed".to_string(),
            corrected_qty: Some(qty),
            corrected_price: price,
            was_corrected,
            reject_reason: None,
            suggested_fix: None,
        }
    }

    fn denied(reason: String, reject_reason: &str, suggested_fix: String) -> Self {
        ComplianceResult {
            ok: false,
            reason,
            corrected_qty: None,
            corrected_price: None,
            was_corrected: false,
            reject_reason: Some(reject_reason.to_string()),
            suggested_fix: Some(suggested_fix),
        }
    }
}

// ── Error code mapping ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedError {
    pub error_code: i64,
    pub category: &'static str,
    pub severity: &'static str,
    pub korean_message: &'static str,
    pub reason_detail: &'static str,
    pub suggested_fix: &'static str,
    pub raw_message: String,
}

/// Fixed Bybit error-code table with Korean operator messages.
pub fn map_bybit_error(error_code: i64, raw_message: &str) -> MappedError {
    let (category, severity, korean_message, reason_detail, suggested_fix) = match error_code {
        10001 => (
            "ORDER_SIZE",
            "HIGH",
            "최소 주문 수량 미달",
            "주문 수량이 거래소 최소 요구량보다 작음",
            "최소 0.001 BTC 이상으로 조정 필요",
        ),
        10002 => (
            "ORDER_SIZE",
            "HIGH",
            "주문 금액(minNotional) 미달",
            "주문의 총 가치가 최소 요구 금액 미만",
            "주문 금액을 최소 5 USDT 이상으로 조정",
        ),
        10003 => (
            "PRICE_FORMAT",
            "MEDIUM",
            "가격 단위(tickSize) 오류",
            "주문 가격이 tickSize 배수가 아님",
            "가격을 tickSize 단위로 정렬 후 재시도",
        ),
        10004 => (
            "QTY_FORMAT",
            "MEDIUM",
            "수량 단위(stepSize) 오류",
            "주문 수량이 stepSize 배수가 아님",
            "수량을 stepSize 단위로 정렬 후 재시도",
        ),
        10006 => (
            "RATE_LIMIT",
            "HIGH",
            "API 호출 과다 (Rate Limit)",
            "초당 API 호출 한도 초과",
            "잠시 대기 후 재시도 (최소 1초 간격)",
        ),
        110001 => (
            "MARGIN",
            "CRITICAL",
            "증거금 부족",
            "주문 실행에 필요한 증거금이 부족",
            "포지션 크기 축소 또는 추가 증거금 입금 필요",
        ),
        110043 => (
            "POSITION_LOGIC",
            "HIGH",
            "리듀스 전용 조건 위반",
            "현재 보유 수량보다 많은 reduce 주문",
            "reduce 수량을 보유 수량 이하로 조정",
        ),
        130021 => (
            "POSITION_MODE",
            "HIGH",
            "포지션 모드 불일치",
            "isolated/cross 모드 설정이 현재 포지션과 충돌",
            "포지션 모드 확인 후 일치시킨 뒤 재시도",
        ),
        130074 => (
            "LEVERAGE",
            "HIGH",
            "레버리지 한도 초과",
            "설정 가능한 최대 레버리지를 초과",
            "레버리지를 허용 범위 이내로 조정",
        ),
        110006 => (
            "POSITION_LOGIC",
            "MEDIUM",
            "포지션 없음",
            "청산/축소할 포지션이 존재하지 않음",
            "현재 포지션 상태 확인 후 재시도",
        ),
        20001 => (
            "PARAM_ERROR",
            "MEDIUM",
            "주문 파라미터 오류",
            "잘못된 주문 파라미터가 포함됨",
            "주문 파라미터 (수량, 가격, 방향) 확인",
        ),
        _ => (
            "UNKNOWN",
            "MEDIUM",
            "거래소 주문 오류",
            "알 수 없는 거래소 오류",
            "로그 확인 후 수동 조치 필요",
        ),
    };
    MappedError {
        error_code,
        category,
        severity,
        korean_message,
        reason_detail,
        suggested_fix,
        raw_message: raw_message.to_string(),
    }
}

// ── Compliance layer state ───────────────────────────────────────────

#[derive(Debug, Clone)]
struct ErrorStreak {
    count: u32,
    blocked_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct ProtectionState {
    active: bool,
    expires_at: Option<Instant>,
    reason: String,
    /// Rolling error window: (observed_at, error_code).
    error_history: Vec<(Instant, i64)>,
}

#[derive(Debug, Clone)]
pub struct ComplianceConfig {
    pub rate_limit_sec: f64,
    pub consecutive_error_threshold: u32,
    pub consecutive_error_block_sec: u64,
    pub protection_window_sec: u64,
    pub protection_threshold: usize,
    pub protection_duration_sec: u64,
    pub market_info_ttl_sec: u64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        ComplianceConfig {
            rate_limit_sec: RATE_LIMIT_SEC,
            consecutive_error_threshold: CONSECUTIVE_ERROR_THRESHOLD,
            consecutive_error_block_sec: CONSECUTIVE_ERROR_BLOCK_SEC,
            protection_window_sec: PROTECTION_MODE_WINDOW_SEC,
            protection_threshold: PROTECTION_MODE_THRESHOLD,
            protection_duration_sec: PROTECTION_MODE_DURATION_SEC,
            market_info_ttl_sec: MARKET_INFO_TTL_SEC,
        }
    }
}

/// Process-local compliance state for one daemon. Every validation outcome
/// is stamped with the current `markets_version`/`markets_hash` so forensics
/// can pin behavior to a rule snapshot.
pub struct ComplianceLayer {
    symbol: String,
    config: ComplianceConfig,
    market_info: Option<MarketInfo>,
    market_info_loaded_at: Option<Instant>,
    markets_version: u64,
    markets_hash: String,
    last_order_at: HashMap<String, Instant>,
    last_order_price: HashMap<String, (f64, Direction, Instant)>,
    consecutive_errors: HashMap<String, ErrorStreak>,
    protection: ProtectionState,
}

impl ComplianceLayer {
    pub fn new(symbol: &str, config: ComplianceConfig) -> Self {
        ComplianceLayer {
            symbol: symbol.to_string(),
            config,
            market_info: None,
            market_info_loaded_at: None,
            markets_version: 0,
            markets_hash: String::new(),
            last_order_at: HashMap::new(),
            last_order_price: HashMap::new(),
            consecutive_errors: HashMap::new(),
            protection: ProtectionState::default(),
        }
    }

    pub fn with_defaults(symbol: &str) -> Self {
        Self::new(symbol, ComplianceConfig::default())
    }

    // ── Market info cache ────────────────────────────────────────────

    fn compute_markets_hash(info: &MarketInfo) -> String {
        let raw = format!(
            "{}|{}|{}|{}|{}",
            info.min_qty, info.step_size, info.tick_size, info.min_notional, info.max_qty
        );
        let digest = Sha256::digest(raw.as_bytes());
        hex::encode(digest)[..12].to_string()
    }

    /// Install freshly-fetched market info; bumps version, detects changes.
    pub fn install_market_info(&mut self, info: MarketInfo) {
        let new_hash = Self::compute_markets_hash(&info);
        if !self.markets_hash.is_empty() && new_hash != self.markets_hash {
            warn!(
                "MARKET RULES CHANGED: hash {} -> {}",
                self.markets_hash, new_hash
            );
        }
        self.markets_hash = new_hash;
        self.markets_version += 1;
        info!(
            "market info loaded (v{}): minQty={} stepSize={} tickSize={} minNotional={} hash={}",
            self.markets_version,
            info.min_qty,
            info.step_size,
            info.tick_size,
            info.min_notional,
            self.markets_hash
        );
        self.market_info = Some(info);
        self.market_info_loaded_at = Some(Instant::now());
    }

    fn market_info_stale(&self) -> bool {
        match self.market_info_loaded_at {
            None => true,
            Some(at) => at.elapsed() >= Duration::from_secs(self.config.market_info_ttl_sec),
        }
    }

    /// Refresh the cached market info from the venue when the TTL expired.
    /// Falls back to the BTC/USDT defaults when the endpoint is unreachable.
    pub async fn ensure_market_info(&mut self, client: &BybitClient) -> MarketInfo {
        if !self.market_info_stale() {
            if let Some(info) = &self.market_info {
                return info.clone();
            }
        }
        match client.fetch_market_info(&self.symbol).await {
            Ok(info) => {
                self.install_market_info(info.clone());
                info
            }
            Err(e) => {
                warn!("market info load error: {e}");
                let fallback = MarketInfo::fallback_btc_usdt();
                if self.market_info.is_none() {
                    self.market_info = Some(fallback.clone());
                    self.market_info_loaded_at = Some(Instant::now());
                }
                self.market_info.clone().unwrap_or(fallback)
            }
        }
    }

    /// Drop the cache and refetch immediately (specific error codes).
    pub async fn force_refresh_market_info(
        &mut self,
        client: &BybitClient,
        reason: &str,
    ) -> MarketInfo {
        info!("FORCE REFRESH market info: {}", if reason.is_empty() { "manual" } else { reason });
        self.market_info_loaded_at = None;
        self.ensure_market_info(client).await
    }

    pub fn markets_version(&self) -> (u64, &str) {
        (self.markets_version, &self.markets_hash)
    }

    pub fn cached_market_info(&self) -> MarketInfo {
        self.market_info
            .clone()
            .unwrap_or_else(MarketInfo::fallback_btc_usdt)
    }

    // ── Rate limit tracking ──────────────────────────────────────────

    pub fn check_rate_limit(&self) -> (bool, String) {
        match self.last_order_at.get(&self.symbol) {
            Some(last) => {
                let elapsed = last.elapsed().as_secs_f64();
                if elapsed < self.config.rate_limit_sec {
                    (
                        false,
                        format!(
                            "rate limit: {elapsed:.1}s < {}s minimum",
                            self.config.rate_limit_sec
                        ),
                    )
                } else {
                    (true, "ok".to_string())
                }
            }
            None => (true, "ok".to_string()),
        }
    }

    /// Record that an order was sent (rate limit + duplicate detection).
    pub fn record_order_sent(&mut self, price: Option<f64>, side: Option<Direction>) {
        let now = Instant::now();
        self.last_order_at.insert(self.symbol.clone(), now);
        if let (Some(price), Some(side)) = (price, side) {
            self.last_order_price
                .insert(self.symbol.clone(), (price, side, now));
        }
    }

    /// Cancel/reorder detection: same price+side within 5 s.
    pub fn check_duplicate_price_order(&self, price: f64, side: Direction) -> (bool, String) {
        if let Some((last_price, last_side, at)) = self.last_order_price.get(&self.symbol) {
            if *last_price == price && *last_side == side {
                let elapsed = at.elapsed().as_secs_f64();
                if elapsed < DUPLICATE_PRICE_WINDOW_SEC {
                    return (
                        false,
                        format!("duplicate price order: {side} @ {price} sent {elapsed:.1}s ago"),
                    );
                }
            }
        }
        (true, "ok".to_string())
    }

    // ── Consecutive-error tracking ───────────────────────────────────

    fn check_error_block(&mut self) -> (bool, String) {
        let Some(streak) = self.consecutive_errors.get(&self.symbol) else {
            return (true, "ok".to_string());
        };
        if let Some(until) = streak.blocked_until {
            let now = Instant::now();
            if now < until {
                let remaining = (until - now).as_secs();
                return (
                    false,
                    format!(
                        "auto-blocked: {} consecutive errors ({remaining}s remaining)",
                        streak.count
                    ),
                );
            }
            // Block expired.
            self.consecutive_errors.remove(&self.symbol);
        }
        (true, "ok".to_string())
    }

    /// Record a venue error: drives both the auto-block streak and the
    /// protection-mode window.
    pub fn record_error(&mut self, error_code: i64) {
        let streak = self
            .consecutive_errors
            .entry(self.symbol.clone())
            .or_insert(ErrorStreak {
                count: 0,
                blocked_until: None,
            });
        streak.count += 1;
        if streak.count >= self.config.consecutive_error_threshold {
            streak.blocked_until = Some(
                Instant::now() + Duration::from_secs(self.config.consecutive_error_block_sec),
            );
            warn!(
                "AUTO-BLOCK: {} blocked for {}s after {} consecutive errors",
                self.symbol, self.config.consecutive_error_block_sec, streak.count
            );
        }
        if error_code != 0 {
            self.record_protection_error(error_code);
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors.remove(&self.symbol);
    }

    // ── Protection mode ──────────────────────────────────────────────

    fn record_protection_error(&mut self, error_code: i64) {
        let now = Instant::now();
        self.protection.error_history.push((now, error_code));
        let window = Duration::from_secs(self.config.protection_window_sec);
        self.protection
            .error_history
            .retain(|(at, _)| now.duration_since(*at) <= window);
        if self.protection.error_history.len() >= self.config.protection_threshold {
            self.activate_protection_mode();
        }
    }

    fn activate_protection_mode(&mut self) {
        let recent: Vec<i64> = self
            .protection
            .error_history
            .iter()
            .rev()
            .take(5)
            .map(|(_, code)| *code)
            .collect();
        let reason = format!("연속 에러 감지: {recent:?}");
        self.protection.active = true;
        self.protection.expires_at =
            Some(Instant::now() + Duration::from_secs(self.config.protection_duration_sec));
        self.protection.reason = reason.clone();
        warn!("PROTECTION MODE ACTIVATED: {reason} — OPEN/ADD 차단, REDUCE/CLOSE 허용");
    }

    fn check_protection_mode(&mut self) -> (bool, String) {
        if !self.protection.active {
            return (false, String::new());
        }
        let now = Instant::now();
        match self.protection.expires_at {
            Some(expires) if now >= expires => {
                self.protection.active = false;
                self.protection.reason.clear();
                info!("PROTECTION MODE expired — normal operations resumed");
                (false, String::new())
            }
            Some(expires) => {
                let remaining = (expires - now).as_secs();
                (
                    true,
                    format!("보호 모드 활성: {} ({remaining}s 남음)", self.protection.reason),
                )
            }
            None => (false, String::new()),
        }
    }

    /// The only protection-mode interface an executor consults before
    /// risk-increasing actions.
    pub fn check_protection_mode_for_action(&mut self, action: ActionType) -> (bool, String) {
        let (active, reason) = self.check_protection_mode();
        if !active {
            return (true, "ok".to_string());
        }
        if action.is_risk_reducing() {
            info!("protection mode: {action} ALLOWED (risk-reducing)");
            return (true, "ok".to_string());
        }
        (false, format!("보호 모드 — {action} 차단: {reason}"))
    }

    pub fn protection_mode_active(&mut self) -> bool {
        self.check_protection_mode().0
    }

    /// Korean protection-mode report, or None while inactive.
    pub fn format_protection_report(&mut self) -> Option<String> {
        let (active, reason) = self.check_protection_mode();
        if !active {
            return None;
        }
        let mut counts: Vec<(&'static str, usize)> = Vec::new();
        for (_, code) in self.protection.error_history.iter().rev().take(10) {
            let msg = map_bybit_error(*code, "").korean_message;
            match counts.iter_mut().find(|(m, _)| *m == msg) {
                Some((_, n)) => *n += 1,
                None => counts.push((msg, 1)),
            }
        }
        let remaining = self
            .protection
            .expires_at
            .map(|e| e.saturating_duration_since(Instant::now()).as_secs())
            .unwrap_or(0);

        let mut lines = vec![
            "🛡️ 보호 모드 자동 보고".to_string(),
            format!("원인: {reason}"),
            String::new(),
            "최근 오류:".to_string(),
        ];
        for (msg, n) in counts {
            lines.push(format!("  • {msg}: {n}건"));
        }
        lines.push(format!("\n⏱️ 자동 해제까지 {remaining}초"));
        lines.push("ℹ️ REDUCE/CLOSE는 계속 허용됩니다.".to_string());
        Some(lines.join("\n"))
    }

    // ── Pre-order validation ─────────────────────────────────────────

    /// Main validation entry point. Applies the rule pipeline against the
    /// cached market info and returns either an approval (possibly with
    /// corrected qty/price) or a structured denial.
    pub fn validate(&mut self, params: &OrderParams) -> ComplianceResult {
        let info = self.cached_market_info();

        let mut corrected_qty = params.qty;
        let mut corrected_price = params.price;
        let mut was_corrected = false;

        // Rate limit.
        let (ok, reason) = self.check_rate_limit();
        if !ok {
            return ComplianceResult::denied(
                reason,
                "API 호출 과다 (Rate Limit)",
                "1초 이상 간격을 두고 재시도".to_string(),
            );
        }

        // Consecutive-error auto-block.
        let (ok, reason) = self.check_error_block();
        if !ok {
            return ComplianceResult::denied(
                reason,
                "연속 에러로 자동 차단",
                format!("{}초 후 자동 해제", self.config.consecutive_error_block_sec),
            );
        }

        // stepSize alignment (correction, not denial).
        let aligned_qty = align_qty(corrected_qty, info.step_size);
        if aligned_qty != corrected_qty {
            info!(
                "qty aligned: {corrected_qty} -> {aligned_qty} (stepSize={})",
                info.step_size
            );
            corrected_qty = aligned_qty;
            was_corrected = true;
        }

        // minQty.
        if corrected_qty < info.min_qty {
            return ComplianceResult::denied(
                format!("qty {corrected_qty} < minQty {}", info.min_qty),
                "최소 주문 수량 미달",
                format!("최소 {} BTC 이상으로 조정 필요", info.min_qty),
            );
        }

        // minNotional (only when the notional is known).
        if params.usdt_value > 0.0 && params.usdt_value < info.min_notional {
            return ComplianceResult::denied(
                format!(
                    "notional {:.2} < minNotional {}",
                    params.usdt_value, info.min_notional
                ),
                "주문 금액(minNotional) 미달",
                format!("최소 {} USDT 이상으로 조정 필요", info.min_notional),
            );
        }

        // tickSize alignment for limit orders.
        if let Some(price) = corrected_price {
            if price > 0.0 {
                let aligned_price = align_price(price, info.tick_size);
                if aligned_price != price {
                    info!(
                        "price aligned: {price} -> {aligned_price} (tickSize={})",
                        info.tick_size
                    );
                    corrected_price = Some(aligned_price);
                    was_corrected = true;
                }
            }
        }

        // Reduce-only integrity.
        if params.reduce_only && params.position_qty > 0.0 && corrected_qty > params.position_qty {
            corrected_qty = align_qty(params.position_qty, info.step_size);
            was_corrected = true;
            info!("reduce-only qty capped to position qty: {corrected_qty}");
            if corrected_qty < info.min_qty {
                return ComplianceResult::denied(
                    format!("reduce qty {corrected_qty} < minQty after capping to position"),
                    "리듀스 전용 조건 위반",
                    "현재 보유 수량이 최소 주문 단위 미만".to_string(),
                );
            }
        }

        if was_corrected {
            info!("compliance corrected: qty={corrected_qty} price={corrected_price:?}");
        }

        ComplianceResult::approved(corrected_qty, corrected_price, was_corrected)
    }

    /// Leverage / margin-mode consistency check. Informational only: it is
    /// fetched and reported, never blocking.
    pub async fn leverage_margin_info(&self, client: &BybitClient) -> (bool, serde_json::Value) {
        match client.fetch_position(&self.symbol).await {
            Ok(Some(pos)) => (
                true,
                serde_json::json!({
                    "leverage": pos.leverage,
                    "liquidation_price": pos.liquidation_price,
                }),
            ),
            Ok(None) => (true, serde_json::json!({ "leverage": 0.0 })),
            Err(e) => {
                warn!("leverage/margin check failed (informational): {e}");
                (false, serde_json::json!({ "error": e.to_string() }))
            }
        }
    }

    /// Map a venue error into the structured table entry and feed the error
    /// trackers.
    pub fn map_and_record_error(&mut self, err: &ExchangeError) -> MappedError {
        let (code, raw) = crate::exchange::extract_error_code(err);
        self.record_error(code);
        map_bybit_error(code, &raw)
    }

    /// Forensic detail block appended to every compliance_log row.
    pub fn forensic_detail(&mut self) -> serde_json::Value {
        let protection_active = self.protection_mode_active();
        let mut detail = serde_json::json!({
            "markets_version": self.markets_version,
            "markets_hash": self.markets_hash,
        });
        if protection_active {
            detail["protection_mode_active"] = serde_json::Value::Bool(true);
        }
        detail
    }
}

// ── Telegram formatting ──────────────────────────────────────────────

/// Korean rejection message for a mapped venue error.
pub fn format_rejection(error: &MappedError, debug: bool) -> String {
    let mut lines = vec![
        "❌ 주문 거부".to_string(),
        format!("사유: {}", error.korean_message),
    ];
    if !error.suggested_fix.is_empty() {
        lines.push(format!("해결: {}", error.suggested_fix));
    }
    if error.error_code != 0 {
        lines.push(format!("(에러코드: {})", error.error_code));
    }
    if debug {
        if !error.raw_message.is_empty() {
            let preview: String = error.raw_message.chars().take(200).collect();
            lines.push(format!("\n[DEBUG] {preview}"));
        }
        lines.push(format!(
            "[DEBUG] category={} severity={}",
            error.category, error.severity
        ));
    }
    lines.join("\n")
}

/// Korean rejection message for a pre-order compliance denial.
pub fn format_compliance_rejection(result: &ComplianceResult) -> String {
    let mut lines = vec![
        "❌ 주문 거부".to_string(),
        format!(
            "사유: {}",
            result.reject_reason.as_deref().unwrap_or(&result.reason)
        ),
    ];
    if let Some(fix) = &result.suggested_fix {
        lines.push(format!("해결: {fix}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_with_info() -> ComplianceLayer {
        let mut layer = ComplianceLayer::with_defaults("BTC/USDT:USDT");
        layer.install_market_info(MarketInfo::fallback_btc_usdt());
        layer
    }

    fn order(qty: f64) -> OrderParams {
        OrderParams {
            side: Direction::Long,
            qty,
            price: None,
            order_type: OrderExecType::Market,
            reduce_only: false,
            position_qty: 0.0,
            usdt_value: 0.0,
        }
    }

    #[test]
    fn test_align_idempotent() {
        let q = align_qty(0.0123456, 0.001);
        assert_eq!(align_qty(q, 0.001), q);
        let p = align_price(95123.4567, 0.1);
        assert_eq!(align_price(p, 0.1), p);
    }

    #[test]
    fn test_align_qty_rounds_down() {
        assert_eq!(align_qty(0.0019, 0.001), 0.001);
        assert_eq!(align_qty(0.0029, 0.001), 0.002);
    }

    #[test]
    fn test_step_decimals() {
        assert_eq!(step_decimals(0.001), 3);
        assert_eq!(step_decimals(0.1), 1);
        assert_eq!(step_decimals(1.0), 0);
    }

    #[test]
    fn test_min_qty_boundary() {
        let mut layer = layer_with_info();
        // Exactly minQty is accepted.
        let result = layer.validate(&order(0.001));
        assert!(result.ok);
        assert_eq!(result.corrected_qty, Some(0.001));
        // One step-epsilon below is denied (floored to 0 < minQty).
        let result = layer.validate(&order(0.0009));
        assert!(!result.ok);
        assert_eq!(result.reject_reason.as_deref(), Some("최소 주문 수량 미달"));
    }

    #[test]
    fn test_min_notional_denial() {
        let mut layer = layer_with_info();
        let mut params = order(0.001);
        params.usdt_value = 3.0;
        let result = layer.validate(&params);
        assert!(!result.ok);
        assert!(result.reason.contains("minNotional"));
    }

    #[test]
    fn test_step_alignment_is_correction() {
        let mut layer = layer_with_info();
        let result = layer.validate(&order(0.0123456));
        assert!(result.ok);
        assert!(result.was_corrected);
        assert_eq!(result.corrected_qty, Some(0.012));
    }

    #[test]
    fn test_tick_alignment_limit_order() {
        let mut layer = layer_with_info();
        let mut params = order(0.01);
        params.order_type = OrderExecType::Limit;
        params.price = Some(95123.456);
        let result = layer.validate(&params);
        assert!(result.ok);
        assert!(result.was_corrected);
        assert_eq!(result.corrected_price, Some(95123.5));
    }

    #[test]
    fn test_reduce_only_capped_to_position() {
        let mut layer = layer_with_info();
        let mut params = order(0.05);
        params.reduce_only = true;
        params.position_qty = 0.012;
        let result = layer.validate(&params);
        assert!(result.ok);
        assert_eq!(result.corrected_qty, Some(0.012));
        assert!(result.was_corrected);
    }

    #[test]
    fn test_reduce_only_capped_below_min_denied() {
        let mut layer = layer_with_info();
        let mut params = order(0.05);
        params.reduce_only = true;
        params.position_qty = 0.0004;
        // Cap lands below minQty after alignment.
        let result = layer.validate(&params);
        assert!(!result.ok);
        assert_eq!(result.reject_reason.as_deref(), Some("리듀스 전용 조건 위반"));
    }

    #[test]
    fn test_rate_limit_blocks_immediate_reorder() {
        let mut layer = layer_with_info();
        layer.record_order_sent(None, None);
        let result = layer.validate(&order(0.01));
        assert!(!result.ok);
        assert!(result.reason.contains("rate limit"));
    }

    #[test]
    fn test_consecutive_error_auto_block() {
        let mut layer = layer_with_info();
        for _ in 0..3 {
            layer.record_error(10001);
        }
        let result = layer.validate(&order(0.01));
        assert!(!result.ok);
        assert!(result.reason.contains("auto-blocked"));
        assert!(result.reason.contains("s remaining"));

        // A success resets the streak.
        layer.record_success();
        // Protection mode is independent and may still veto OPEN; the basic
        // pipeline itself passes again.
        let (ok, _) = layer.check_rate_limit();
        assert!(ok);
    }

    #[test]
    fn test_protection_mode_partition() {
        let mut layer = layer_with_info();
        for _ in 0..3 {
            layer.record_error(10006);
        }
        assert!(layer.protection_mode_active());
        let (allowed, _) = layer.check_protection_mode_for_action(ActionType::Open);
        assert!(!allowed);
        let (allowed, _) = layer.check_protection_mode_for_action(ActionType::Add);
        assert!(!allowed);
        for action in [
            ActionType::Reduce,
            ActionType::Close,
            ActionType::FullClose,
            ActionType::ReverseClose,
        ] {
            let (allowed, _) = layer.check_protection_mode_for_action(action);
            assert!(allowed, "{action} must stay allowed under protection mode");
        }
        assert!(layer.format_protection_report().unwrap().contains("보호 모드"));
    }

    #[test]
    fn test_duplicate_price_detection() {
        let mut layer = layer_with_info();
        layer.record_order_sent(Some(95000.0), Some(Direction::Long));
        let (ok, reason) = layer.check_duplicate_price_order(95000.0, Direction::Long);
        assert!(!ok);
        assert!(reason.contains("duplicate price order"));
        let (ok, _) = layer.check_duplicate_price_order(95000.5, Direction::Long);
        assert!(ok);
    }

    #[test]
    fn test_markets_hash_tracks_rules() {
        let mut layer = ComplianceLayer::with_defaults("BTC/USDT:USDT");
        layer.install_market_info(MarketInfo::fallback_btc_usdt());
        let (v1, h1) = layer.markets_version();
        let h1 = h1.to_string();
        assert_eq!(v1, 1);
        assert_eq!(h1.len(), 12);

        let mut changed = MarketInfo::fallback_btc_usdt();
        changed.min_qty = 0.002;
        layer.install_market_info(changed);
        let (v2, h2) = layer.markets_version();
        assert_eq!(v2, 2);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_error_map_and_correctable_sets() {
        assert_eq!(map_bybit_error(110001, "").severity, "CRITICAL");
        assert_eq!(map_bybit_error(99999, "").category, "UNKNOWN");
        assert!(is_auto_correctable(10003));
        assert!(is_auto_correctable(10004));
        assert!(!is_auto_correctable(110001));
        assert!(should_refresh_on_error(130021));
        assert!(!should_refresh_on_error(110043));
    }

    #[test]
    fn test_scenario_consecutive_error_block_message() {
        // Spec scenario: three denials with code 10001, then the fourth
        // validation reports the auto-block with remaining seconds.
        let mut layer = layer_with_info();
        for _ in 0..3 {
            let err = ExchangeError::InvalidOrder("qty below minimum".into());
            let mapped = layer.map_and_record_error(&err);
            assert_eq!(mapped.error_code, 10001);
        }
        let result = layer.validate(&order(0.01));
        assert!(!result.ok);
        assert!(result.reason.contains("auto-blocked"));
    }
}
