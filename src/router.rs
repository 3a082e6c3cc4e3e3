//! Natural-language intent router.
//!
//! Classifies operator messages into local queries, advisory requests,
//! directives, or nothing. The LLM classifier sits behind a daily budget and
//! a per-message cooldown; the keyword fallback keeps the console usable
//! when the budget is exhausted or the provider is down.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::llm::LlmClient;

pub const CLASSIFIER_DAILY_BUDGET: u32 = 200;
pub const DUPLICATE_COOLDOWN_SEC: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Local,
    Advisory,
    Directive,
    None,
}

#[derive(Debug, Clone)]
pub struct Intent {
    pub route: Route,
    pub intent: String,
    pub local_query_type: String,
    pub directive_type: String,
    pub used_fallback: bool,
    pub budget_exceeded: bool,
    pub cooldown_hit: bool,
}

impl Intent {
    fn none() -> Self {
        Intent {
            route: Route::None,
            intent: "other".to_string(),
            local_query_type: String::new(),
            directive_type: String::new(),
            used_fallback: false,
            budget_exceeded: false,
            cooldown_hit: false,
        }
    }

    fn local(intent: &str, query_type: &str) -> Self {
        Intent {
            route: Route::Local,
            intent: intent.to_string(),
            local_query_type: query_type.to_string(),
            ..Intent::none()
        }
    }

    fn advisory(intent: &str) -> Self {
        Intent {
            route: Route::Advisory,
            intent: intent.to_string(),
            ..Intent::none()
        }
    }

    fn directive(dtype: &str) -> Self {
        Intent {
            route: Route::Directive,
            intent: "directive".to_string(),
            directive_type: dtype.to_string(),
            ..Intent::none()
        }
    }
}

/// Zero-cost keyword classification; also the fallback when the LLM path is
/// denied or fails.
pub fn keyword_fallback(text: &str) -> Intent {
    let t = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| t.contains(w));

    let mut intent = if has(&["리스크", "risk"]) && has(&["바꿔", "변경", "모드", "mode"]) {
        Intent::directive("RISK_MODE")
    } else if has(&["키워드", "keyword"]) {
        Intent::directive("WATCH_KEYWORDS")
    } else if has(&["감사", "audit", "점검"]) {
        Intent::directive("AUDIT")
    } else if has(&["전략", "분석해", "방향성", "어떻게 해야"]) {
        Intent::advisory("strategy")
    } else if has(&["뉴스", "news"]) {
        Intent::local("news", "news_summary")
    } else if has(&["얼마", "가격", "price", "시세"]) {
        Intent::local("price", "btc_price")
    } else if has(&["점수", "score"]) {
        Intent::local("score", "score_summary")
    } else if has(&["스냅샷", "snapshot"]) {
        Intent::local("snapshot", "snapshot")
    } else if has(&["포지션", "position"]) {
        Intent::local("position", "position_strat")
    } else if has(&["정합", "reconcile", "동기화"]) {
        Intent::local("reconcile", "reconcile")
    } else if has(&["에러", "오류", "error"]) {
        Intent::local("errors", "recent_errors")
    } else if has(&["상태", "status", "현황"]) {
        Intent::local("status", "status_full")
    } else {
        Intent::none()
    };
    intent.used_fallback = true;
    intent
}

pub struct IntentRouter {
    llm: LlmClient,
    calls_today: u32,
    calls_day: Option<chrono::NaiveDate>,
    recent_messages: HashMap<String, Instant>,
}

impl IntentRouter {
    pub fn new(llm: LlmClient) -> Self {
        IntentRouter {
            llm,
            calls_today: 0,
            calls_day: None,
            recent_messages: HashMap::new(),
        }
    }

    fn roll_day(&mut self) {
        let today = Utc::now().date_naive();
        if self.calls_day != Some(today) {
            self.calls_day = Some(today);
            self.calls_today = 0;
        }
    }

    fn check_cooldown(&mut self, text: &str) -> bool {
        let key = text.trim().to_lowercase();
        let window = Duration::from_secs(DUPLICATE_COOLDOWN_SEC);
        self.recent_messages.retain(|_, at| at.elapsed() < window);
        if self.recent_messages.contains_key(&key) {
            return true;
        }
        self.recent_messages.insert(key, Instant::now());
        false
    }

    /// Classify a message. The cooldown flag is advisory: advisory-route
    /// requests bypass it at the call site.
    pub async fn classify(&mut self, text: &str) -> Intent {
        let cooldown_hit = self.check_cooldown(text);
        self.roll_day();

        if !self.llm.is_configured() || self.calls_today >= CLASSIFIER_DAILY_BUDGET {
            let mut intent = keyword_fallback(text);
            intent.budget_exceeded = self.calls_today >= CLASSIFIER_DAILY_BUDGET;
            intent.cooldown_hit = cooldown_hit;
            return intent;
        }

        self.calls_today += 1;
        let system = "Classify a Korean trading-console message. Reply with one JSON \
            object: {\"route\": \"local\"|\"advisory\"|\"directive\"|\"none\", \
            \"intent\": string, \"local_query_type\": string, \"directive_type\": string}. \
            local_query_type is one of: status_full, health_check, btc_price, \
            news_summary, score_summary, snapshot, fact_snapshot, position_strat, \
            position_exch, orders_exch, account_exch, risk_config, recent_errors, \
            reconcile, db_health. directive_type is one of: RISK_MODE, \
            WATCH_KEYWORDS, AUDIT.";

        match self.llm.chat(self.llm.mini_model(), system, text).await {
            Ok(reply) => match parse_intent(&reply) {
                Some(mut intent) => {
                    intent.cooldown_hit = cooldown_hit;
                    info!(
                        "intent={} route={:?} local_qtype={}",
                        intent.intent, intent.route, intent.local_query_type
                    );
                    intent
                }
                None => {
                    warn!("intent parse failed, keyword fallback");
                    let mut intent = keyword_fallback(text);
                    intent.cooldown_hit = cooldown_hit;
                    intent
                }
            },
            Err(e) => {
                warn!("intent classifier failed: {e}");
                let mut intent = keyword_fallback(text);
                intent.cooldown_hit = cooldown_hit;
                intent
            }
        }
    }
}

fn parse_intent(reply: &str) -> Option<Intent> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    let json: serde_json::Value = serde_json::from_str(&reply[start..=end]).ok()?;
    let route = match json["route"].as_str()? {
        "local" => Route::Local,
        "advisory" | "claude" => Route::Advisory,
        "directive" => Route::Directive,
        _ => Route::None,
    };
    Some(Intent {
        route,
        intent: json["intent"].as_str().unwrap_or("other").to_string(),
        local_query_type: json["local_query_type"].as_str().unwrap_or("").to_string(),
        directive_type: json["directive_type"].as_str().unwrap_or("").to_string(),
        used_fallback: false,
        budget_exceeded: false,
        cooldown_hit: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_fallback_routes() {
        assert_eq!(keyword_fallback("상태 보여줘").route, Route::Local);
        assert_eq!(keyword_fallback("상태 보여줘").local_query_type, "status_full");
        assert_eq!(keyword_fallback("BTC 지금 얼마야?").local_query_type, "btc_price");
        assert_eq!(keyword_fallback("최근 30분 뉴스").local_query_type, "news_summary");
        assert_eq!(keyword_fallback("오늘 매매전략 잡아줘").route, Route::Advisory);
        assert_eq!(keyword_fallback("리스크 보수적으로 바꿔").route, Route::Directive);
        assert_eq!(
            keyword_fallback("리스크 보수적으로 바꿔").directive_type,
            "RISK_MODE"
        );
        assert_eq!(keyword_fallback("키워드에 trump 추가해").directive_type, "WATCH_KEYWORDS");
        assert_eq!(keyword_fallback("완전 무관한 소리").route, Route::None);
    }

    #[test]
    fn test_parse_intent_json() {
        let intent = parse_intent(
            r#"{"route": "local", "intent": "status", "local_query_type": "status_full", "directive_type": ""}"#,
        )
        .unwrap();
        assert_eq!(intent.route, Route::Local);
        assert_eq!(intent.local_query_type, "status_full");
        assert!(parse_intent("not json").is_none());
    }

    #[test]
    fn test_parse_intent_unknown_route_is_none() {
        let intent = parse_intent(r#"{"route": "banana", "intent": "x"}"#).unwrap();
        assert_eq!(intent.route, Route::None);
    }
}
