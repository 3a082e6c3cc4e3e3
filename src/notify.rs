//! Operator notifications.
//!
//! Telegram transport plus the Korean output contract: a phrase-then-word
//! substitution pass runs before every send, and a residual English ratio
//! above 20% (outside the abbreviation whitelist) logs a warning.

use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::warn;

use crate::config::TelegramConfig;
use crate::types::{Direction, OrderType, PositionSide};

const ENGLISH_RATIO_WARN: f64 = 0.2;

/// Abbreviations allowed to stay English in operator-facing text.
fn allowed_english() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            // Coins / currencies
            "BTC", "ETH", "USDT", "USD", "KRW", "SOL", "XRP", "DOGE",
            // Trade actions
            "LONG", "SHORT", "HOLD", "ADD", "REDUCE", "CLOSE", "REVERSE", "OPEN", "SKIPPED",
            "ABORT", "ENTRY", "POSSIBLE",
            // Indicators
            "RSI", "ATR", "BB", "MA", "EMA", "SMA", "MACD", "VWAP", "OBV", "POC", "VAH", "VAL",
            "KST", "UTC",
            // Scores / labels
            "TECH", "POS", "REGIME", "NEWS", "TOP", "SCORE", "STAGE", "NET", "DEFAULT", "EVENT",
            "WATCHLIST",
            // News categories
            "MACRO", "MARKET", "REGULATION", "BULLISH", "BEARISH", "NEUTRAL", "EXTREME",
            // Services
            "ON", "OFF", "OK", "N/A", "GPT", "AI", "API", "CLAUDE", "BYBIT", "ANTHROPIC",
            "OPENAI",
            // Macro calendar
            "SEC", "ETF", "CPI", "FOMC", "FED", "BOJ", "NFP", "PCE", "DXY", "QQQ", "SPX", "GDP",
            "PPI",
            // News sources
            "REUTERS", "COINDESK", "COINTELEGRAPH", "BLOOMBERG", "DECRYPT", "THEBLOCK",
            // Model name tokens
            "OPUS", "SONNET", "HAIKU", "MINI",
        ]
        .into_iter()
        .collect()
    })
}

/// Multi-word phrases replaced first (safe substring match).
const PHRASE_EN_TO_KR: &[(&str, &str)] = &[
    ("Stop-Loss", "손절"),
    ("stop loss", "손절"),
    ("Stop Loss", "손절"),
    ("Take Profit", "익절"),
    ("take profit", "익절"),
    ("Risk Level", "위험도"),
    ("risk level", "위험도"),
    ("No position", "포지션 없음"),
    ("no position", "포지션 없음"),
];

/// Single words replaced on word boundaries, longest first.
const WORD_EN_TO_KR: &[(&str, &str)] = &[
    ("Recommendation", "권고"),
    ("recommendation", "권고"),
    ("Confidence", "확신도"),
    ("confidence", "확신도"),
    ("Completed", "완료"),
    ("completed", "완료"),
    ("Analysis", "분석"),
    ("analysis", "분석"),
    ("Position", "포지션"),
    ("position", "포지션"),
    ("Inactive", "비활성"),
    ("inactive", "비활성"),
    ("Warning", "경고"),
    ("warning", "경고"),
    ("Trigger", "트리거"),
    ("trigger", "트리거"),
    ("Current", "현재"),
    ("current", "현재"),
    ("Pending", "대기 중"),
    ("pending", "대기 중"),
    ("Success", "성공"),
    ("success", "성공"),
    ("Summary", "요약"),
    ("summary", "요약"),
    ("Signal", "신호"),
    ("signal", "신호"),
    ("Active", "활성"),
    ("active", "활성"),
    ("Failed", "실패"),
    ("failed", "실패"),
    ("Action", "조치"),
    ("action", "조치"),
    ("Reason", "근거"),
    ("reason", "근거"),
    ("Error", "오류"),
    ("error", "오류"),
    ("Entry", "진입"),
    ("entry", "진입"),
];

/// Fraction of 3+ letter alphabetic words that are English outside the
/// whitelist. Fewer than 3 such words is treated as safe.
pub fn detect_english_ratio(text: &str) -> f64 {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphabetic() {
            current.push(ch);
        } else if !current.is_empty() {
            if current.len() >= 3 {
                words.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.len() >= 3 {
        words.push(current);
    }
    if words.len() < 3 {
        return 0.0;
    }
    let allowed = allowed_english();
    let english = words
        .iter()
        .filter(|w| !allowed.contains(w.to_uppercase().as_str()))
        .count();
    english as f64 / words.len() as f64
}

fn replace_word_bounded(text: &str, from: &str, to: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(from) {
        let end = pos + from.len();
        let before_ok = pos == 0 || !rest.as_bytes()[pos - 1].is_ascii_alphanumeric();
        let after_ok = end >= rest.len() || !rest.as_bytes()[end].is_ascii_alphanumeric();
        result.push_str(&rest[..pos]);
        if before_ok && after_ok {
            result.push_str(to);
        } else {
            result.push_str(from);
        }
        rest = &rest[end..];
    }
    result.push_str(rest);
    result
}

/// Pre-send filter: phrase substitutions, then bounded word substitutions,
/// then the residual-English warning.
pub fn korean_output_guard(text: &str) -> String {
    let mut result = text.to_string();
    for (en, kr) in PHRASE_EN_TO_KR {
        result = result.replace(en, kr);
    }
    for (en, kr) in WORD_EN_TO_KR {
        result = replace_word_bounded(&result, en, kr);
    }
    let ratio = detect_english_ratio(&result);
    if ratio > ENGLISH_RATIO_WARN {
        let preview: String = result.chars().take(80).collect();
        warn!("LANGUAGE_WARNING: english_ratio={ratio:.2} text_preview={preview:?}");
    }
    result
}

/// Debug footer carrying routing metadata, shown only in debug mode.
#[derive(Debug, Clone, Default)]
pub struct FooterMeta {
    pub intent_name: String,
    pub route: String,
    pub provider: String,
    pub call_type: Option<String>,
    pub latency_ms: Option<i64>,
    pub model: Option<String>,
}

pub fn debug_footer(meta: &FooterMeta, debug_on: bool) -> String {
    if !debug_on {
        return String::new();
    }
    let mut parts = Vec::new();
    if !meta.intent_name.is_empty() {
        parts.push(format!("intent={}", meta.intent_name));
    }
    if !meta.route.is_empty() {
        parts.push(format!("route={}", meta.route));
    }
    if !meta.provider.is_empty() {
        parts.push(format!("provider={}", meta.provider));
    }
    if let Some(ct) = &meta.call_type {
        parts.push(format!("call_type={ct}"));
    }
    if let Some(latency) = meta.latency_ms {
        parts.push(format!("latency={latency}ms"));
    }
    if let Some(model) = &meta.model {
        parts.push(format!("model={model}"));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("\n─\n{}", parts.join(" | "))
    }
}

// ── Fill notifications ───────────────────────────────────────────────

fn fmt_qty(qty: f64) -> String {
    format!("{qty:.4}")
}

fn fmt_price(price: f64) -> String {
    format!("{price:.1}")
}

fn fmt_pnl(pnl: Option<f64>) -> String {
    match pnl {
        Some(p) => format!("{p:+.4} USDT"),
        None => "계산 불가".to_string(),
    }
}

pub fn format_entry_fill(
    direction: Direction,
    avg_price: f64,
    filled_qty: f64,
    start_stage: u32,
    entry_pct: f64,
    next_stage: u32,
) -> String {
    format!(
        "🟢 진입 체결 확인\n방향: {direction}\n체결가: {}\n수량: {} BTC\n시작 단계: {start_stage} ({entry_pct:.0}%)\n다음 단계: {next_stage}",
        fmt_price(avg_price),
        fmt_qty(filled_qty),
    )
}

pub fn format_exit_fill(
    order_type: OrderType,
    direction: Direction,
    avg_price: f64,
    filled_qty: f64,
    realized_pnl: Option<f64>,
    position_verified: bool,
    close_reason: Option<&str>,
) -> String {
    let verified = if position_verified {
        "✅ 포지션 정리 완료"
    } else {
        "⚠️ 잔여 포지션 확인 필요"
    };
    let mut lines = vec![
        format!("🔴 청산 체결 ({order_type})"),
        format!("방향: {direction}"),
        format!("체결가: {}", fmt_price(avg_price)),
        format!("수량: {} BTC", fmt_qty(filled_qty)),
        format!("실현 손익: {}", fmt_pnl(realized_pnl)),
        verified.to_string(),
    ];
    if let Some(reason) = close_reason {
        if !reason.is_empty() {
            lines.push(format!("사유: {reason}"));
        }
    }
    lines.join("\n")
}

pub fn format_add_fill(
    direction: Direction,
    avg_price: f64,
    filled_qty: f64,
    new_stage: u32,
    budget_used_pct: f64,
) -> String {
    format!(
        "➕ 추가 진입 체결\n방향: {direction}\n체결가: {}\n수량: {} BTC\n단계: {new_stage}/7\n예산 사용: {budget_used_pct:.0}% (잔여 {:.0}%)",
        fmt_price(avg_price),
        fmt_qty(filled_qty),
        70.0 - budget_used_pct,
    )
}

pub fn format_reduce_fill(
    direction: Direction,
    avg_price: f64,
    filled_qty: f64,
    realized_pnl: Option<f64>,
    remaining_qty: f64,
) -> String {
    format!(
        "➖ 부분 청산 체결\n방향: {direction}\n체결가: {}\n수량: {} BTC\n실현 손익: {}\n잔여 수량: {} BTC",
        fmt_price(avg_price),
        fmt_qty(filled_qty),
        fmt_pnl(realized_pnl),
        fmt_qty(remaining_qty),
    )
}

pub fn format_reverse_close_fill(
    direction: Direction,
    avg_price: f64,
    realized_pnl: Option<f64>,
    position_verified: bool,
) -> String {
    format!(
        "🔄 리버스 1단계 (청산) 체결\n기존 방향: {direction}\n체결가: {}\n실현 손익: {}\n{}",
        fmt_price(avg_price),
        fmt_pnl(realized_pnl),
        if position_verified {
            "포지션 0 확인 — 반대 진입 대기"
        } else {
            "⚠️ 잔여 포지션 확인 필요"
        },
    )
}

pub fn format_reverse_open_fill(
    direction: Direction,
    from_side: Direction,
    avg_price: f64,
    filled_qty: f64,
) -> String {
    format!(
        "🔄 리버스 2단계 (진입) 체결\n{from_side} → {direction} 전환 완료\n체결가: {}\n수량: {} BTC\n단계 1 재시작",
        fmt_price(avg_price),
        fmt_qty(filled_qty),
    )
}

pub fn format_order_timeout(order_type: OrderType, direction: Direction, order_id: &str) -> String {
    format!(
        "⏱️ 주문 시간 초과\n유형: {order_type} {direction}\n주문 ID: {order_id}\n자동 재시도하지 않습니다."
    )
}

pub fn format_order_canceled(order_type: OrderType, direction: Direction, order_id: &str) -> String {
    format!("🚫 주문 취소됨\n유형: {order_type} {direction}\n주문 ID: {order_id}")
}

pub fn format_reconcile_heal(detail: &str) -> String {
    format!("⚠ RECONCILE 자동복구: {detail}")
}

pub fn format_emergency_pre_alert(trigger_type: &str, detail: &str) -> String {
    format!("🚨 긴급 분석 시작\n트리거: {trigger_type}\n{detail}")
}

pub fn format_emergency_post_alert(trigger_type: &str, action: &str, bullets: &[String]) -> String {
    let mut lines = vec![
        format!("🚨 긴급 분석 결과: {action}"),
        format!("트리거: {trigger_type}"),
    ];
    for b in bullets.iter().take(3) {
        lines.push(format!("  • {b}"));
    }
    lines.join("\n")
}

pub fn format_event_pre_alert(trigger_types: &[String], mode: &str) -> String {
    format!("📡 이벤트 감지 ({mode})\n트리거: {}", trigger_types.join(", "))
}

pub fn format_event_post_alert(trigger_types: &[String], action: &str) -> String {
    format!(
        "📡 이벤트 분석 결과: {action}\n트리거: {}",
        trigger_types.join(", ")
    )
}

pub fn format_event_suppressed(trigger_types: &[String], reason: &str) -> String {
    format!(
        "📡 이벤트 분석 생략 (사유: {reason})\n트리거: {}",
        trigger_types.join(", ")
    )
}

pub fn format_hard_stop_failed(detail: &str) -> String {
    format!("🚨 HARD STOP SET FAILED\n서버 손절 동기화 실패: {detail}\n수동 확인 필요")
}

/// Position side label for mixed contexts.
pub fn side_label(side: Option<PositionSide>) -> &'static str {
    match side {
        Some(PositionSide::Long) => "LONG",
        Some(PositionSide::Short) => "SHORT",
        None => "없음",
    }
}

// ── Telegram transport ───────────────────────────────────────────────

/// Telegram sender. Missing credentials turn every send into a logged no-op
/// so daemons keep running in local-only mode.
#[derive(Debug, Clone)]
pub struct Notifier {
    token: Option<String>,
    chat_id: i64,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(config: &TelegramConfig) -> Self {
        Notifier {
            token: config.bot_token.clone(),
            chat_id: config.allowed_chat_id,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn disabled() -> Self {
        Notifier {
            token: None,
            chat_id: 0,
            http: reqwest::Client::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some() && self.chat_id != 0
    }

    /// Send through the Korean guard; failures are logged, never propagated.
    pub async fn send(&self, text: &str) {
        let (Some(token), true) = (&self.token, self.chat_id != 0) else {
            return;
        };
        let guarded = korean_output_guard(text);
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let result = self
            .http
            .post(&url)
            .form(&[
                ("chat_id", self.chat_id.to_string()),
                ("text", guarded),
                ("disable_web_page_preview", "true".to_string()),
            ])
            .send()
            .await;
        if let Err(e) = result {
            warn!("telegram send failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phrase_then_word_substitution() {
        let out = korean_output_guard("Stop Loss hit, Entry blocked");
        assert!(out.contains("손절"));
        assert!(out.contains("진입"));
        assert!(!out.contains("Stop Loss"));
        assert!(!out.contains("Entry"));
    }

    #[test]
    fn test_word_boundary_respected() {
        // "Entryway" must not be partially replaced.
        let out = replace_word_bounded("Entryway Entry", "Entry", "진입");
        assert_eq!(out, "Entryway 진입");
    }

    #[test]
    fn test_english_ratio_whitelist() {
        // All whitelisted → ratio 0.
        assert_eq!(detect_english_ratio("BTC RSI ATR FOMC"), 0.0);
        // Mostly English prose → high ratio.
        let ratio = detect_english_ratio("the quick brown fox jumps over everything");
        assert!(ratio > 0.9);
        // Korean text with a couple of allowed tokens stays at 0.
        assert_eq!(detect_english_ratio("현재 BTC 포지션은 LONG 입니다"), 0.0);
    }

    #[test]
    fn test_english_ratio_too_few_words() {
        assert_eq!(detect_english_ratio("ok go"), 0.0);
    }

    #[test]
    fn test_debug_footer_gated() {
        let meta = FooterMeta {
            intent_name: "status".into(),
            route: "local".into(),
            provider: "local".into(),
            ..Default::default()
        };
        assert_eq!(debug_footer(&meta, false), "");
        let footer = debug_footer(&meta, true);
        assert!(footer.contains("intent=status"));
        assert!(footer.contains("route=local"));
    }

    #[test]
    fn test_fill_formats_are_korean() {
        let entry = format_entry_fill(Direction::Long, 95000.0, 0.012, 1, 10.0, 2);
        assert!(entry.contains("진입 체결"));
        let exit = format_exit_fill(
            OrderType::Close,
            Direction::Long,
            95500.0,
            0.012,
            Some(5.4),
            true,
            Some("stop_loss"),
        );
        assert!(exit.contains("정리 완료"));
        let timeout = format_order_timeout(OrderType::Add, Direction::Short, "abc");
        assert!(timeout.contains("시간 초과"));
    }

    #[test]
    fn test_hard_stop_alert_marker() {
        let alert = format_hard_stop_failed("exchange timeout");
        assert!(alert.contains("HARD STOP SET FAILED"));
    }
}
