//! Command dispatcher daemon.
//!
//! Polls Telegram getUpdates, acknowledges offsets, and routes messages:
//! explicit slash commands first (zero LLM cost), then the budget-gated
//! intent classifier, then local queries / directives / the advisory path.
//! The dispatcher never enqueues orders; `/force` only bypasses the
//! advisory cooldown.

use anyhow::Result;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::ControlFlags;
use crate::llm::LlmClient;
use crate::local_queries::{self, QueryContext};
use crate::notify::{self, debug_footer, FooterMeta, Notifier};
use crate::router::{keyword_fallback, Intent, IntentRouter, Route};
use crate::safety::SafetyLimits;
use crate::store::Store;

pub const POLL_TIMEOUT_SEC: u64 = 20;
pub const WATCH_KEYWORDS_POLICY_KEY: &str = "watch_keywords";
pub const RISK_MODE_POLICY_KEY: &str = "risk_mode";

pub const HELP_TEXT: &str = "🦅 운영 콘솔\n\
━━━━━━━━━━━━━━━━━━━━━━\n\
📌 명령어\n\
  /help      도움말\n\
  /status    봇 상태\n\
  /health    서비스 상태\n\
  /audit     시스템 감사\n\
  /risk MODE 리스크 모드 (conservative/normal/aggressive)\n\
  /keywords  워치 키워드 목록/관리\n\
  /force     쿨다운 무시 + 강제 전략 분석\n\
  /debug     디버그 모드 토글 (on/off)\n\
\n\
💬 자연어 예시\n\
  상태 보여줘\n\
  BTC 지금 얼마야?\n\
  최근 30분 뉴스\n\
  오늘 매매전략 잡아줘\n\
  키워드에 trump 추가해\n\
  리스크 보수적으로 바꿔";

pub struct Dispatcher {
    symbol: String,
    store: Store,
    control: ControlFlags,
    router: IntentRouter,
    llm: LlmClient,
    notifier: Notifier,
    http: reqwest::Client,
    bot_token: Option<String>,
    allowed_chat_id: i64,
    offset_file: PathBuf,
}

impl Dispatcher {
    pub fn new(config: &Config, store: Store) -> Self {
        let llm = LlmClient::new(config.llm.clone());
        Dispatcher {
            symbol: config.symbol.clone(),
            store,
            control: ControlFlags::new(&config.control_dir),
            router: IntentRouter::new(llm.clone()),
            llm,
            notifier: Notifier::new(&config.telegram),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(POLL_TIMEOUT_SEC + 10))
                .build()
                .unwrap_or_default(),
            bot_token: config.telegram.bot_token.clone(),
            allowed_chat_id: config.telegram.allowed_chat_id,
            offset_file: config.telegram.offset_file.clone(),
        }
    }

    // ── Offset file ──────────────────────────────────────────────────

    fn read_offset(&self) -> i64 {
        std::fs::read_to_string(&self.offset_file)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|v| v["last_update_id"].as_i64())
            .unwrap_or(0)
    }

    fn write_offset(&self, last_update_id: i64) {
        if let Some(parent) = self.offset_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(
            &self.offset_file,
            json!({ "last_update_id": last_update_id }).to_string(),
        );
    }

    // ── Poll loop body ───────────────────────────────────────────────

    /// One getUpdates pass. Returns false when Telegram is not configured
    /// (the caller should idle).
    pub async fn poll_once(&mut self) -> Result<bool> {
        let Some(token) = self.bot_token.clone() else {
            return Ok(false);
        };
        if self.allowed_chat_id == 0 {
            return Ok(false);
        }

        let last_id = self.read_offset();
        let url = format!(
            "https://api.telegram.org/bot{token}/getUpdates?offset={}&timeout={POLL_TIMEOUT_SEC}",
            last_id + 1
        );
        let resp: Value = self.http.get(&url).send().await?.json().await?;
        if !resp["ok"].as_bool().unwrap_or(false) {
            warn!("getUpdates failed: {resp}");
            return Ok(true);
        }

        let mut max_update_id = last_id;
        for update in resp["result"].as_array().cloned().unwrap_or_default() {
            let update_id = update["update_id"].as_i64().unwrap_or(0);
            max_update_id = max_update_id.max(update_id);

            let message = if update["message"].is_object() {
                &update["message"]
            } else {
                &update["edited_message"]
            };
            let chat_id = message["chat"]["id"].as_i64().unwrap_or(0);
            let text = message["text"].as_str().unwrap_or("").trim().to_string();
            if chat_id != self.allowed_chat_id || text.is_empty() {
                continue;
            }

            let reply = self.handle_command(&text).await;
            self.notifier.send(&reply).await;
        }

        if max_update_id > last_id {
            self.write_offset(max_update_id);
        }
        Ok(true)
    }

    // ── Command routing ──────────────────────────────────────────────

    fn query_ctx(&self) -> QueryContext<'_> {
        QueryContext {
            store: &self.store,
            control: &self.control,
            symbol: &self.symbol,
        }
    }

    fn footer(&self, intent: &str, route: &str, provider: &str) -> String {
        debug_footer(
            &FooterMeta {
                intent_name: intent.to_string(),
                route: route.to_string(),
                provider: provider.to_string(),
                ..Default::default()
            },
            self.control.debug_mode_on(),
        )
    }

    pub async fn handle_command(&mut self, text: &str) -> String {
        let t = text.trim();

        // 1. Direct commands, zero classifier cost.
        if t == "/help" || t == "help" {
            return format!("{HELP_TEXT}{}", self.footer("help", "direct", "local"));
        }
        if t == "/health" || t == "health" {
            let out = local_queries::execute(&self.query_ctx(), "health_check", None);
            return format!("{out}{}", self.footer("health", "local", "local"));
        }
        if t == "/status" || t == "status" {
            let out = local_queries::execute(&self.query_ctx(), "status_full", None);
            return format!("{out}{}", self.footer("status", "local", "local"));
        }

        // 1b. Directive commands.
        if t == "/audit" || t == "audit" {
            let out = self.directive_audit();
            return format!("{out}{}", self.footer("audit", "local", "local"));
        }
        if let Some(mode) = t.strip_prefix("/risk ") {
            let out = self.directive_risk_mode(mode.trim());
            return format!("{out}{}", self.footer("risk", "local", "local"));
        }
        if t.starts_with("/keywords") {
            let args = t["/keywords".len()..].trim();
            let out = self.directive_keywords(args);
            return format!("{out}{}", self.footer("keywords", "local", "local"));
        }

        // 1c. Debug toggle.
        if t == "/debug on" {
            return match self.control.set_debug_mode(true) {
                Ok(()) => "디버그 모드: ON".to_string(),
                Err(e) => format!("디버그 모드 설정 실패: {e}"),
            };
        }
        if t == "/debug off" {
            return match self.control.set_debug_mode(false) {
                Ok(()) => "디버그 모드: OFF".to_string(),
                Err(e) => format!("디버그 모드 설정 실패: {e}"),
            };
        }
        if t == "/debug" {
            let state = if self.control.debug_mode_on() { "ON" } else { "OFF" };
            return format!("디버그 모드: {state}\n사용법: /debug on 또는 /debug off");
        }

        // 1d. /force: cooldown bypass, deep provider, no fallback.
        if t == "/force" || t.starts_with("/force ") {
            let force_text = t.strip_prefix("/force").unwrap_or("").trim();
            let force_text = if force_text.is_empty() {
                "지금 BTC 전략 분석해줘"
            } else {
                force_text
            };
            let preview: String = force_text.chars().take(50).collect();
            info!("/force command: call_type=USER text={preview}");
            let (reply, provider) = self.advisory(force_text, true).await;
            return format!("{reply}{}", self.footer("force_strategy", "advisory", &provider));
        }

        // 2. Intent classification.
        let intent = self.router.classify(t).await;

        // 3. Cooldown: advisory routes bypass the dedup.
        if intent.cooldown_hit && intent.route != Route::Advisory {
            return "⏳ 동일 요청이 최근에 처리되었습니다. 잠시 후 다시 시도해주세요.".to_string();
        }

        match intent.route {
            Route::Local => {
                // News requests are upgraded to the advisory path for
                // fresh analysis over the stored rows.
                if intent.intent == "news" {
                    let (reply, provider) = self.advisory(t, false).await;
                    return format!("{reply}{}", self.footer(&intent.intent, "advisory", &provider));
                }
                let out = local_queries::execute(
                    &self.query_ctx(),
                    &intent.local_query_type,
                    Some(t),
                );
                format!("{out}{}", self.footer(&intent.intent, "local", "local"))
            }
            Route::Directive => {
                let out = self.handle_directive(&intent, t);
                format!("{out}{}", self.footer("directive", "local", "local"))
            }
            Route::Advisory => {
                let (reply, provider) = self.advisory(t, true).await;
                format!("{reply}{}", self.footer(&intent.intent, "advisory", &provider))
            }
            Route::None => format!(
                "무엇을 도와드릴까요?\n예시: 상태, 뉴스, 포지션, BTC 가격, 전략 분석, 에러 확인\n/help 로 전체 목록을 볼 수 있습니다.{}",
                self.footer("none", "none", "local")
            ),
        }
    }

    // ── Advisory path ────────────────────────────────────────────────

    /// Advisory analysis. With `no_fallback` (strategy routes and /force),
    /// a denied gate aborts instead of degrading to the cheap provider.
    async fn advisory(&mut self, text: &str, no_fallback: bool) -> (String, String) {
        if !self.llm.is_configured() {
            if no_fallback {
                return (
                    "⛔ 분석 제공자 미설정 — 전략 분석을 수행할 수 없습니다.".to_string(),
                    "none".to_string(),
                );
            }
            let out = local_queries::execute(&self.query_ctx(), "status_full", Some(text));
            return (out, "local".to_string());
        }

        let context = json!({
            "question": text,
            "position": self
                .store
                .get_position_state(&self.symbol)
                .ok()
                .flatten()
                .map(|ps| json!({
                    "side": ps.side.map(|s| s.as_str()),
                    "qty": ps.total_qty.to_string(),
                    "avg_entry": ps.avg_entry_price.to_string(),
                    "stage": ps.stage,
                })),
            "recent_news": self
                .store
                .recent_news(2, 5)
                .unwrap_or_default()
                .iter()
                .map(|n| n.title.clone())
                .collect::<Vec<_>>(),
        });

        let (model, provider) = if no_fallback {
            (self.llm.deep_model().to_string(), "deep".to_string())
        } else {
            (self.llm.mini_model().to_string(), "mini".to_string())
        };

        match self
            .llm
            .chat(
                &model,
                "You are the advisory module of a BTC perpetual trading console. \
                 Answer the operator's question in KOREAN, concisely, grounded in \
                 the provided JSON context. Never instruct order placement directly.",
                &context.to_string(),
            )
            .await
        {
            Ok(reply) => (notify::korean_output_guard(&reply), provider),
            Err(e) => {
                warn!("advisory call failed: {e}");
                if no_fallback {
                    (
                        "⛔ 분석 요청이 거부되었거나 실패했습니다. 잠시 후 다시 시도해주세요."
                            .to_string(),
                        provider,
                    )
                } else {
                    let out = local_queries::execute(&self.query_ctx(), "status_full", Some(text));
                    (out, "local".to_string())
                }
            }
        }
    }

    // ── Directives ───────────────────────────────────────────────────

    fn handle_directive(&self, intent: &Intent, text: &str) -> String {
        match intent.directive_type.as_str() {
            "RISK_MODE" => {
                // Pull the mode word out of the free text.
                let mode = if text.contains("보수") || text.contains("conservative") {
                    "conservative"
                } else if text.contains("공격") || text.contains("aggressive") {
                    "aggressive"
                } else {
                    "normal"
                };
                self.directive_risk_mode(mode)
            }
            "WATCH_KEYWORDS" => self.directive_keywords(text),
            "AUDIT" => self.directive_audit(),
            other => format!("지원하지 않는 지시: {other}"),
        }
    }

    fn directive_risk_mode(&self, mode: &str) -> String {
        let limits = match mode {
            "conservative" => SafetyLimits {
                daily_loss_limit_usdt: 100.0,
                max_orders_per_hour: 6,
                operating_cap_usdt: 5_000.0,
                add_slice_pct: 5.0,
            },
            "aggressive" => SafetyLimits {
                daily_loss_limit_usdt: 400.0,
                max_orders_per_hour: 20,
                operating_cap_usdt: 15_000.0,
                add_slice_pct: 15.0,
            },
            "normal" => SafetyLimits::default(),
            other => {
                return format!(
                    "알 수 없는 리스크 모드: {other}\n사용법: /risk conservative|normal|aggressive"
                )
            }
        };
        if let Err(e) = limits.save(&self.store) {
            return format!("리스크 모드 설정 실패: {e}");
        }
        let _ = self.store.policy_set(
            RISK_MODE_POLICY_KEY,
            &json!({ "mode": mode }),
            "operator risk mode",
        );
        format!(
            "✅ 리스크 모드 변경: {mode}\n일일 손실 한도 {} USDT / 자본 한도 {} USDT / 슬라이스 {:.0}%",
            limits.daily_loss_limit_usdt, limits.operating_cap_usdt, limits.add_slice_pct
        )
    }

    fn directive_keywords(&self, args: &str) -> String {
        let mut keywords: Vec<String> = self
            .store
            .policy_get(WATCH_KEYWORDS_POLICY_KEY)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| {
                vec!["SEC".to_string(), "ETF".to_string(), "FOMC".to_string()]
            });

        let args = args.trim();
        let lowered = args.to_lowercase();
        let response = if args.is_empty() || lowered == "list" {
            format!("🔑 워치 키워드 ({}개)\n{}", keywords.len(), keywords.join(", "))
        } else if let Some(word) = lowered
            .strip_prefix("add ")
            .or_else(|| args.strip_prefix("추가 "))
        {
            let word = word.trim().to_string();
            if keywords.iter().any(|k| k.eq_ignore_ascii_case(&word)) {
                format!("이미 등록된 키워드: {word}")
            } else {
                keywords.push(word.clone());
                format!("✅ 키워드 추가: {word}")
            }
        } else if let Some(word) = lowered
            .strip_prefix("remove ")
            .or_else(|| args.strip_prefix("삭제 "))
        {
            let word = word.trim();
            let before = keywords.len();
            keywords.retain(|k| !k.eq_ignore_ascii_case(word));
            if keywords.len() < before {
                format!("✅ 키워드 삭제: {word}")
            } else {
                format!("등록되지 않은 키워드: {word}")
            }
        } else {
            // Free-form: "키워드에 trump 추가해" needs the token before 추가.
            let token = args
                .split_whitespace()
                .find(|tok| !tok.contains("키워드") && !tok.contains("추가") && !tok.contains('에'));
            match token {
                Some(word) => {
                    let word = word.to_string();
                    if keywords.iter().any(|k| k.eq_ignore_ascii_case(&word)) {
                        format!("이미 등록된 키워드: {word}")
                    } else {
                        keywords.push(word.clone());
                        format!("✅ 키워드 추가: {word}")
                    }
                }
                None => "사용법: /keywords [add|remove] <단어>".to_string(),
            }
        };

        let _ = self.store.policy_set(
            WATCH_KEYWORDS_POLICY_KEY,
            &serde_json::to_value(&keywords).unwrap_or(Value::Null),
            "news watch keywords",
        );
        response
    }

    fn directive_audit(&self) -> String {
        let (total, rejections, auto_corrected, rate_limited) =
            self.store.compliance_counts_since(10).unwrap_or((0, 0, 0, 0));
        let rate = if total > 0 {
            rejections as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        [
            "📋 거래소 규정 준수 감사 (최근 10일)".to_string(),
            format!("총 주문 시도: {total}건"),
            format!("거부: {rejections}건 (거부율 {rate:.1}%)"),
            format!("자동 보정: {auto_corrected}건"),
            format!("레이트리밋 이벤트: {rate_limited}건"),
        ]
        .join("\n")
    }
}

/// Keyword fallback exposed for poller-less environments (tests, CLI).
pub fn classify_offline(text: &str) -> Intent {
    keyword_fallback(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_dispatcher() -> Dispatcher {
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
        std::env::remove_var("OPENAI_API_KEY");
        let mut config = Config::from_env();
        config.control_dir = std::env::temp_dir().join(format!(
            "perp-core-disp-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&config.control_dir);
        config.telegram.offset_file = config.control_dir.join("offset.json");
        Dispatcher::new(&config, Store::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_help_command() {
        let mut d = test_dispatcher();
        let out = d.handle_command("/help").await;
        assert!(out.contains("명령어"));
        assert!(out.contains("/status"));
    }

    #[tokio::test]
    async fn test_status_command_local() {
        let mut d = test_dispatcher();
        let out = d.handle_command("/status").await;
        assert!(out.contains("봇 상태"));
    }

    #[tokio::test]
    async fn test_debug_toggle() {
        let mut d = test_dispatcher();
        assert!(d.handle_command("/debug on").await.contains("ON"));
        assert!(d.control.debug_mode_on());
        assert!(d.handle_command("/debug off").await.contains("OFF"));
        assert!(!d.control.debug_mode_on());
    }

    #[tokio::test]
    async fn test_debug_footer_only_in_debug_mode() {
        let mut d = test_dispatcher();
        let out = d.handle_command("/status").await;
        assert!(!out.contains("intent="));
        d.control.set_debug_mode(true).unwrap();
        let out = d.handle_command("/status").await;
        assert!(out.contains("intent=status"));
        assert!(out.contains("route=local"));
    }

    #[tokio::test]
    async fn test_risk_mode_directive() {
        let mut d = test_dispatcher();
        let out = d.handle_command("/risk conservative").await;
        assert!(out.contains("conservative"));
        let limits = SafetyLimits::load(&d.store);
        assert_eq!(limits.operating_cap_usdt, 5_000.0);

        let out = d.handle_command("/risk banana").await;
        assert!(out.contains("알 수 없는 리스크 모드"));
    }

    #[tokio::test]
    async fn test_keywords_directive() {
        let mut d = test_dispatcher();
        let out = d.handle_command("/keywords").await;
        assert!(out.contains("워치 키워드"));
        let out = d.handle_command("/keywords add trump").await;
        assert!(out.contains("추가: trump"));
        let out = d.handle_command("/keywords").await;
        assert!(out.contains("trump"));
        let out = d.handle_command("/keywords remove trump").await;
        assert!(out.contains("삭제: trump"));
    }

    #[tokio::test]
    async fn test_natural_language_falls_back_to_keywords() {
        // Without LLM credentials the classifier uses the keyword fallback.
        let mut d = test_dispatcher();
        let out = d.handle_command("상태 보여줘").await;
        assert!(out.contains("봇 상태"));
    }

    #[tokio::test]
    async fn test_force_without_llm_aborts() {
        let mut d = test_dispatcher();
        let out = d.handle_command("/force").await;
        assert!(out.contains("분석"));
    }

    #[tokio::test]
    async fn test_unknown_text_gets_usage_hint() {
        let mut d = test_dispatcher();
        let out = d.handle_command("블라블라블라").await;
        assert!(out.contains("무엇을 도와드릴까요"));
    }

    #[test]
    fn test_offset_roundtrip() {
        let d = test_dispatcher();
        assert_eq!(d.read_offset(), 0);
        d.write_offset(42);
        assert_eq!(d.read_offset(), 42);
    }
}
