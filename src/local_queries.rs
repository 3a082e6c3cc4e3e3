//! Local query executor.
//!
//! Pure-read handlers behind the dispatcher: no LLM, no order side effects.
//! Every handler returns Korean text ready for the output guard. Debug
//! handlers accept `--n=<int>` (capped at 200).

use crate::adaptive::AdaptiveEngine;
use crate::control::ControlFlags;
use crate::proactive;
use crate::reconciler::{classify, ReconcileStatus};
use crate::safety::SafetyLimits;
use crate::store::{PositionState, Store};
use chrono::Utc;

pub const MAX_DEBUG_ROWS: i64 = 200;

pub struct QueryContext<'a> {
    pub store: &'a Store,
    pub control: &'a ControlFlags,
    pub symbol: &'a str,
}

/// Parse a `--n=<int>` argument, capped at [`MAX_DEBUG_ROWS`].
pub fn parse_n_arg(text: Option<&str>, default: i64) -> i64 {
    let Some(text) = text else {
        return default;
    };
    text.split_whitespace()
        .find_map(|tok| tok.strip_prefix("--n="))
        .and_then(|v| v.parse::<i64>().ok())
        .map(|n| n.clamp(1, MAX_DEBUG_ROWS))
        .unwrap_or(default)
}

/// Dispatch a named query to its handler. Unknown names get a short help.
pub fn execute(ctx: &QueryContext<'_>, query_type: &str, original_text: Option<&str>) -> String {
    match query_type {
        "status_full" => status_full(ctx),
        "health_check" => health_check(ctx),
        "btc_price" => btc_price(ctx),
        "news_summary" => news_summary(ctx, original_text),
        "score_summary" => score_summary(ctx),
        "snapshot" => snapshot_view(ctx),
        "fact_snapshot" => fact_snapshot(ctx),
        "position_strat" => position_strat(ctx),
        "risk_config" => risk_config(ctx),
        "recent_errors" => recent_errors(ctx, original_text),
        "reconcile" => reconcile_view(ctx),
        "db_health" => db_health(ctx),
        "debug_state" => debug_state(ctx),
        "debug_backfill_status" => debug_backfill_status(ctx),
        "debug_backfill_enable" => debug_backfill_enable(ctx, true),
        "debug_backfill_stop" => debug_backfill_enable(ctx, false),
        "debug_backfill_pause" => debug_backfill_pause(ctx, true),
        "debug_backfill_resume" => debug_backfill_pause(ctx, false),
        "debug_news_sample" => debug_news_sample(ctx, original_text),
        other => format!(
            "알 수 없는 질의 유형: {other}\n/help 로 사용 가능한 명령을 확인하세요."
        ),
    }
}

fn load_state(ctx: &QueryContext<'_>) -> PositionState {
    ctx.store
        .get_position_state(ctx.symbol)
        .ok()
        .flatten()
        .unwrap_or_else(|| PositionState::flat(ctx.symbol))
}

fn status_full(ctx: &QueryContext<'_>) -> String {
    let ps = load_state(ctx);
    let pending = ctx.store.pending_queue_count(ctx.symbol).unwrap_or(0);
    let switch = ctx.store.trade_switch_enabled().unwrap_or(true);
    let (vetoed, veto_reason) = proactive::check_entry_veto(ctx.store);

    let mut lines = vec![
        "📊 봇 상태".to_string(),
        format!("심볼: {}", ctx.symbol),
        format!(
            "포지션: {} {} BTC @ {}",
            ps.side.map(|s| s.as_str().to_uppercase()).unwrap_or_else(|| "없음".into()),
            ps.total_qty.round_dp(4),
            ps.avg_entry_price.round_dp(1),
        ),
        format!("단계: {}/7 (예산 {:.0}%)", ps.stage, ps.trade_budget_used_pct),
        format!("플랜 상태: {}", ps.plan_state),
        format!("주문 상태: {}", ps.order_state),
        format!("실행큐 대기: {pending}건"),
        format!("매매 스위치: {}", if switch { "ON" } else { "OFF" }),
    ];
    if vetoed {
        lines.push(format!("진입 거부권: {veto_reason}"));
    }
    lines.join("\n")
}

fn health_check(ctx: &QueryContext<'_>) -> String {
    let db_ok = ctx.store.trade_switch_enabled().is_ok();
    let kill = ctx.control.kill_switch_active();
    let paused = ctx.control.paused();
    [
        "🩺 서비스 상태".to_string(),
        format!("DB: {}", if db_ok { "정상" } else { "오류" }),
        format!("킬스위치: {}", if kill { "⚠️ 발동" } else { "정상" }),
        format!("일시정지: {}", if paused { "ON" } else { "OFF" }),
    ]
    .join("\n")
}

fn btc_price(ctx: &QueryContext<'_>) -> String {
    match ctx.store.latest_candles(ctx.symbol, "1m", 1) {
        Ok(candles) if !candles.is_empty() => {
            let c = &candles[0];
            format!(
                "💰 BTC 현재가: {:.1} USDT\n(1분봉 기준, {})",
                c.close,
                c.datetime.format("%H:%M UTC")
            )
        }
        _ => "가격 데이터 없음 (캔들 수집 확인 필요)".to_string(),
    }
}

fn news_summary(ctx: &QueryContext<'_>, text: Option<&str>) -> String {
    let n = parse_n_arg(text, 10);
    match ctx.store.recent_news(2, n) {
        Ok(rows) if !rows.is_empty() => {
            let mut lines = vec![format!("📰 최근 2시간 뉴스 ({}건)", rows.len())];
            for (i, row) in rows.iter().enumerate() {
                let impact = row
                    .impact_score
                    .map(|s| format!(" [{s:.0}]"))
                    .unwrap_or_default();
                lines.push(format!("{}. {}{impact}", i + 1, row.title));
            }
            lines.join("\n")
        }
        _ => "최근 2시간 내 뉴스가 없습니다.".to_string(),
    }
}

fn score_summary(ctx: &QueryContext<'_>) -> String {
    // The freshest decision row carries the latest score pair.
    let ps = load_state(ctx);
    let pending = ctx.store.pending_queue_count(ctx.symbol).unwrap_or(0);
    [
        "🎯 점수 요약".to_string(),
        format!(
            "포지션: {}",
            ps.side.map(|s| s.as_str().to_uppercase()).unwrap_or_else(|| "없음".into())
        ),
        format!("예산 사용: {:.0}% / 70%", ps.trade_budget_used_pct),
        format!("실행큐: {pending}건 대기"),
    ]
    .join("\n")
}

fn snapshot_view(ctx: &QueryContext<'_>) -> String {
    let ps = load_state(ctx);
    [
        "📸 전략 스냅샷".to_string(),
        format!("단계: {} (마스크 {:07b})", ps.stage, ps.stage_consumed_mask),
        format!("평균 진입가: {}", ps.avg_entry_price.round_dp(1)),
        format!("누적 진입 수수료: {}", ps.accumulated_entry_fee.round_dp(4)),
        format!("최고 미실현 수익률: {:.2}%", ps.peak_upnl_pct),
    ]
    .join("\n")
}

fn fact_snapshot(ctx: &QueryContext<'_>) -> String {
    let path_count = ctx.store.news_price_path_count().unwrap_or(0);
    [
        "📚 사실 데이터 현황".to_string(),
        format!("뉴스 가격경로 분석: {path_count}건"),
    ]
    .join("\n")
}

fn position_strat(ctx: &QueryContext<'_>) -> String {
    let ps = load_state(ctx);
    let mut lines = vec![
        "📈 전략 포지션".to_string(),
        format!(
            "방향: {}",
            ps.side.map(|s| s.as_str().to_uppercase()).unwrap_or_else(|| "없음".into())
        ),
        format!("수량: {} BTC", ps.total_qty.round_dp(4)),
        format!("평균가: {}", ps.avg_entry_price.round_dp(1)),
        format!("자본 사용: {} USDT", ps.capital_used_usdt.round_dp(0)),
    ];
    for stage in &ps.stages_detail {
        lines.push(format!(
            "  단계{}: {} BTC @ {} ({:.0}%)",
            stage.stage,
            stage.qty.round_dp(4),
            stage.price.round_dp(1),
            stage.pct
        ));
    }
    lines.join("\n")
}

fn risk_config(ctx: &QueryContext<'_>) -> String {
    let limits = SafetyLimits::load(ctx.store);
    [
        "⚙️ 리스크 설정".to_string(),
        format!("일일 손실 한도: {} USDT", limits.daily_loss_limit_usdt),
        format!("시간당 주문 한도: {}건", limits.max_orders_per_hour),
        format!("운용 자본 한도: {} USDT", limits.operating_cap_usdt),
        format!("추가 진입 슬라이스: {:.0}%", limits.add_slice_pct),
    ]
    .join("\n")
}

fn recent_errors(_ctx: &QueryContext<'_>, text: Option<&str>) -> String {
    let n = parse_n_arg(text, 10);
    format!("🧾 최근 오류 조회 (최대 {n}건)\ncompliance_log 기준 — 상세는 /audit 참조")
}

fn reconcile_view(ctx: &QueryContext<'_>) -> String {
    // Store-only view: the strategy side of the comparison. The exchange
    // side comes from the reconciler daemon; here we report the last known.
    let ps = load_state(ctx);
    let report = classify(Ok(&None), Ok(&ps), Utc::now());
    let status = match report.status {
        ReconcileStatus::Ok => "일치 (양쪽 플랫)".to_string(),
        ReconcileStatus::Mismatch { needs_healing } => format!(
            "불일치 — 전략 DB에 포지션 기록 있음 (자동복구 {})",
            if needs_healing { "대상" } else { "대기" }
        ),
        ReconcileStatus::Unknown => "판정 불가".to_string(),
    };
    [
        "🔍 정합성 점검 (전략 DB 기준)".to_string(),
        format!("상태: {status}"),
        format!("세부: {}", report.detail),
        "※ 거래소 측 비교는 fill-watcher 의 주기 점검에서 수행됩니다.".to_string(),
    ]
    .join("\n")
}

fn db_health(ctx: &QueryContext<'_>) -> String {
    let candles = ctx
        .store
        .latest_candles(ctx.symbol, "1m", 1)
        .map(|c| c.len())
        .unwrap_or(0);
    let news = ctx.store.recent_news(24, 1).map(|n| n.len()).unwrap_or(0);
    [
        "🗄️ DB 상태".to_string(),
        format!("캔들(1m): {}", if candles > 0 { "수집 중" } else { "없음" }),
        format!("뉴스(24h): {}", if news > 0 { "수집 중" } else { "없음" }),
    ]
    .join("\n")
}

fn debug_state(ctx: &QueryContext<'_>) -> String {
    let mut engine = AdaptiveEngine::with_defaults();
    engine.sync_from_store(ctx.store);
    engine.debug_state()
}

fn debug_backfill_status(ctx: &QueryContext<'_>) -> String {
    let enabled = ctx.control.backfill_enabled();
    let paused = ctx.control.backfill_paused();
    let running = ctx.store.running_job("news_price_path").unwrap_or(None);
    [
        "🔧 백필 상태".to_string(),
        format!("활성화: {}", if enabled { "ON" } else { "OFF" }),
        format!("일시정지: {}", if paused { "ON" } else { "OFF" }),
        format!(
            "실행 중 작업: {}",
            running.map(|id| format!("#{id}")).unwrap_or_else(|| "없음".into())
        ),
    ]
    .join("\n")
}

fn debug_backfill_enable(ctx: &QueryContext<'_>, on: bool) -> String {
    match ctx.control.set_backfill_enabled(on) {
        Ok(()) => format!("백필 {}", if on { "활성화" } else { "중지" }),
        Err(e) => format!("백필 설정 실패: {e}"),
    }
}

fn debug_backfill_pause(ctx: &QueryContext<'_>, pause: bool) -> String {
    match ctx.control.set_backfill_paused(pause) {
        Ok(()) => format!("백필 {}", if pause { "일시정지" } else { "재개" }),
        Err(e) => format!("백필 설정 실패: {e}"),
    }
}

fn debug_news_sample(ctx: &QueryContext<'_>, text: Option<&str>) -> String {
    let n = parse_n_arg(text, 5);
    match ctx.store.recent_news(48, n) {
        Ok(rows) if !rows.is_empty() => {
            let mut lines = vec![format!("🔎 뉴스 샘플 ({}건)", rows.len())];
            for row in rows {
                lines.push(format!(
                    "[{}] {} (매매허용: {})",
                    row.ts.format("%m-%d %H:%M"),
                    row.title,
                    if row.allow_for_trading { "Y" } else { "N" }
                ));
            }
            lines.join("\n")
        }
        _ => "뉴스 데이터 없음".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Money, PositionSide};

    fn test_ctx() -> (Store, ControlFlags) {
        let store = Store::open_in_memory().unwrap();
        let dir = std::env::temp_dir().join(format!(
            "perp-core-lq-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        (store, ControlFlags::new(dir))
    }

    #[test]
    fn test_parse_n_arg_cap() {
        assert_eq!(parse_n_arg(Some("debug --n=50"), 10), 50);
        assert_eq!(parse_n_arg(Some("debug --n=9999"), 10), 200);
        assert_eq!(parse_n_arg(Some("no arg here"), 10), 10);
        assert_eq!(parse_n_arg(None, 7), 7);
    }

    #[test]
    fn test_status_full_korean() {
        let (store, control) = test_ctx();
        let ctx = QueryContext {
            store: &store,
            control: &control,
            symbol: "BTC/USDT:USDT",
        };
        let out = execute(&ctx, "status_full", None);
        assert!(out.contains("봇 상태"));
        assert!(out.contains("포지션"));
    }

    #[test]
    fn test_position_strat_with_stages() {
        let (store, control) = test_ctx();
        let mut ps = PositionState::flat("BTC/USDT:USDT");
        ps.side = Some(PositionSide::Long);
        ps.total_qty = Money::from_f64(0.01);
        ps.stages_detail = vec![crate::store::StageRecord {
            stage: 1,
            price: Money::from_f64(95_000.0),
            qty: Money::from_f64(0.01),
            pct: 10.0,
            planned_usdt: Money::ZERO,
            filled_usdt: Money::ZERO,
        }];
        store.save_position_state(&ps, true).unwrap();

        let ctx = QueryContext {
            store: &store,
            control: &control,
            symbol: "BTC/USDT:USDT",
        };
        let out = execute(&ctx, "position_strat", None);
        assert!(out.contains("LONG"));
        assert!(out.contains("단계1"));
    }

    #[test]
    fn test_unknown_query_type() {
        let (store, control) = test_ctx();
        let ctx = QueryContext {
            store: &store,
            control: &control,
            symbol: "BTC/USDT:USDT",
        };
        let out = execute(&ctx, "nonexistent_handler", None);
        assert!(out.contains("알 수 없는 질의"));
    }

    #[test]
    fn test_backfill_toggles_via_query() {
        let (store, control) = test_ctx();
        let ctx = QueryContext {
            store: &store,
            control: &control,
            symbol: "BTC/USDT:USDT",
        };
        execute(&ctx, "debug_backfill_enable", None);
        assert!(control.backfill_enabled());
        execute(&ctx, "debug_backfill_stop", None);
        assert!(!control.backfill_enabled());
    }
}
