//! Analysis provider gate.
//!
//! The LLM providers live behind this module: callers get either a parsed,
//! clamped, structured analysis or an explicit fallback marker. Malformed
//! provider output NEVER propagates as an error into a decision path; it
//! parses to `{action: HOLD, fallback_used: true}`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::LlmConfig;
use crate::types::EventDecisionAction;

/// Parsed event-decision analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDecisionResponse {
    pub event_class: String,
    pub confidence: f64,
    pub action: EventDecisionAction,
    pub params: DecisionParams,
    pub reasoning_short: String,
    pub safety_checks: SafetyChecks,
    pub fallback_used: bool,
    #[serde(default)]
    pub api_latency_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionParams {
    #[serde(default)]
    pub reduce_ratio: f64,
    #[serde(default)]
    pub freeze_minutes: f64,
    #[serde(default)]
    pub new_sl_type: String,
    #[serde(default)]
    pub new_sl_value: f64,
    #[serde(default)]
    pub reverse_size_ratio: f64,
    #[serde(default)]
    pub hedge_size_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyChecks {
    #[serde(default)]
    pub orphan_orders_cleanup_required: bool,
    #[serde(default)]
    pub stop_order_required: bool,
    #[serde(default)]
    pub reverse_allowed: bool,
}

impl EventDecisionResponse {
    /// The safe default every failure path collapses to.
    pub fn hold_fallback() -> Self {
        EventDecisionResponse {
            event_class: String::new(),
            confidence: 0.0,
            action: EventDecisionAction::Hold,
            params: DecisionParams::default(),
            reasoning_short: String::new(),
            safety_checks: SafetyChecks::default(),
            fallback_used: true,
            api_latency_ms: 0,
        }
    }
}

/// Parse a provider response into an [`EventDecisionResponse`].
///
/// Accepts raw JSON, ```json fenced blocks, and JSON embedded in prose
/// (first `{` to last `}`). Any parse failure or out-of-set action returns
/// the HOLD fallback. Numeric params are clamped to their legal ranges.
pub fn parse_event_decision_response(text: &str) -> EventDecisionResponse {
    let Some(json) = extract_json(text) else {
        return EventDecisionResponse::hold_fallback();
    };

    let Some(action_str) = json["action"].as_str() else {
        return EventDecisionResponse::hold_fallback();
    };
    let Ok(action) = action_str.parse::<EventDecisionAction>() else {
        warn!("event decision action out of set: {action_str}");
        return EventDecisionResponse::hold_fallback();
    };

    let params = &json["params"];
    EventDecisionResponse {
        event_class: json["event_class"].as_str().unwrap_or("").to_string(),
        confidence: clamp01(json["confidence"].as_f64().unwrap_or(0.0)),
        action,
        params: DecisionParams {
            reduce_ratio: clamp01(params["reduce_ratio"].as_f64().unwrap_or(0.0)),
            freeze_minutes: params["freeze_minutes"].as_f64().unwrap_or(0.0).clamp(0.0, 60.0),
            new_sl_type: params["new_sl_type"].as_str().unwrap_or("").to_string(),
            new_sl_value: params["new_sl_value"].as_f64().unwrap_or(0.0).max(0.0),
            reverse_size_ratio: clamp01(params["reverse_size_ratio"].as_f64().unwrap_or(0.0)),
            hedge_size_ratio: clamp01(params["hedge_size_ratio"].as_f64().unwrap_or(0.0)),
        },
        reasoning_short: json["reasoning_short"].as_str().unwrap_or("").to_string(),
        safety_checks: serde_json::from_value(json["safety_checks"].clone()).unwrap_or_default(),
        fallback_used: false,
        api_latency_ms: json["api_latency_ms"].as_i64().unwrap_or(0),
    }
}

/// Parsed advisory/emergency analysis (deep or mini path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryResponse {
    pub action: String,
    #[serde(default)]
    pub reduce_pct: Option<f64>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reason_bullets: Vec<String>,
    #[serde(default)]
    pub mentioned_price: Option<f64>,
    pub fallback_used: bool,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub gate_reason: String,
}

impl AdvisoryResponse {
    pub fn hold_fallback() -> Self {
        AdvisoryResponse {
            action: "HOLD".to_string(),
            reduce_pct: None,
            risk_level: None,
            confidence: None,
            reason_bullets: Vec::new(),
            mentioned_price: None,
            fallback_used: true,
            aborted: false,
            gate_reason: String::new(),
        }
    }

    /// Gate-denied marker: the caller must not act on this.
    pub fn aborted(reason: &str) -> Self {
        AdvisoryResponse {
            aborted: true,
            gate_reason: reason.to_string(),
            ..Self::hold_fallback()
        }
    }
}

pub fn parse_advisory_response(text: &str) -> AdvisoryResponse {
    let Some(json) = extract_json(text) else {
        return AdvisoryResponse::hold_fallback();
    };
    let action = json["action"]
        .as_str()
        .or_else(|| json["recommended_action"].as_str())
        .unwrap_or("HOLD")
        .to_string();
    AdvisoryResponse {
        action,
        reduce_pct: json["reduce_pct"].as_f64().map(|p| p.clamp(0.0, 100.0)),
        risk_level: json["risk_level"].as_str().map(str::to_string),
        confidence: json["confidence"].as_f64().map(clamp01),
        reason_bullets: json["reason_bullets"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|b| b.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        mentioned_price: json["price"]
            .as_f64()
            .or_else(|| json["entry_price"].as_f64())
            .or_else(|| json["target_price"].as_f64()),
        fallback_used: false,
        aborted: false,
        gate_reason: String::new(),
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Pull a JSON object out of a possibly fenced / prose-wrapped response.
fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Fenced block first.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(after[..end].trim()) {
                if v.is_object() {
                    return Some(v);
                }
            }
        }
    }

    // Direct parse.
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    // Brace-window fallback: first '{' to last '}'.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

/// Thin OpenAI-compatible chat client. Missing credentials never error out
/// to callers as panics; `chat` returns Err and the caller falls back.
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
    base_url: String,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.call_timeout_sec))
            .build()
            .unwrap_or_default();
        LlmClient {
            config,
            http,
            base_url: "https://api.openai.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    pub fn deep_model(&self) -> &str {
        &self.config.model
    }

    pub fn mini_model(&self) -> &str {
        &self.config.mini_model
    }

    /// One chat completion; returns the assistant text.
    pub async fn chat(&self, model: &str, system: &str, user: &str) -> Result<String> {
        let Some(api_key) = &self.config.api_key else {
            anyhow::bail!("llm credentials missing (local-only mode)");
        };
        let started = std::time::Instant::now();
        let body = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.2,
        });
        let resp: Value = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        let content = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no content in llm response"))?
            .to_string();
        info!(
            "llm call: model={model} latency={}ms chars={}",
            started.elapsed().as_millis(),
            content.len()
        );
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_response_holds() {
        let r = parse_event_decision_response("");
        assert_eq!(r.action, EventDecisionAction::Hold);
        assert!(r.fallback_used);
    }

    #[test]
    fn test_non_json_holds() {
        let r = parse_event_decision_response("this is not json at all");
        assert_eq!(r.action, EventDecisionAction::Hold);
        assert!(r.fallback_used);
    }

    #[test]
    fn test_invalid_action_holds() {
        let r = parse_event_decision_response(
            r#"{"event_class":"FLASH_DROP","confidence":0.8,"action":"INVALID_ACTION","params":{}}"#,
        );
        assert_eq!(r.action, EventDecisionAction::Hold);
        assert!(r.fallback_used);
    }

    #[test]
    fn test_valid_json_parsed() {
        let r = parse_event_decision_response(
            r#"{
                "event_class": "FLASH_DROP",
                "confidence": 0.85,
                "action": "RISK_OFF_REDUCE",
                "params": {"reduce_ratio": 0.5, "freeze_minutes": 10,
                           "new_sl_type": "ATR_TRAIL", "new_sl_value": 93000,
                           "reverse_size_ratio": 0, "hedge_size_ratio": 0},
                "reasoning_short": "Flash drop, reduce risk",
                "safety_checks": {"orphan_orders_cleanup_required": false,
                                  "stop_order_required": true,
                                  "reverse_allowed": false}
            }"#,
        );
        assert_eq!(r.action, EventDecisionAction::RiskOffReduce);
        assert_eq!(r.event_class, "FLASH_DROP");
        assert_eq!(r.confidence, 0.85);
        assert_eq!(r.params.reduce_ratio, 0.5);
        assert!(r.safety_checks.stop_order_required);
        assert!(!r.fallback_used);
    }

    #[test]
    fn test_markdown_wrapped_json() {
        let text = "```json\n{\"event_class\":\"BREAKOUT\",\"confidence\":0.7,\"action\":\"HOLD\",\"params\":{},\"reasoning_short\":\"ok\",\"safety_checks\":{}}\n```";
        let r = parse_event_decision_response(text);
        assert_eq!(r.action, EventDecisionAction::Hold);
        assert_eq!(r.event_class, "BREAKOUT");
        assert!(!r.fallback_used);
    }

    #[test]
    fn test_prose_prefix_brace_fallback() {
        let text = "Here is my analysis:\n\n{\"event_class\":\"FAKEOUT\",\"confidence\":0.3,\"action\":\"HOLD\",\"params\":{},\"reasoning_short\":\"noise\",\"safety_checks\":{}}";
        let r = parse_event_decision_response(text);
        assert_eq!(r.event_class, "FAKEOUT");
        assert!(!r.fallback_used);
    }

    #[test]
    fn test_param_clamping() {
        let r = parse_event_decision_response(
            r#"{
                "event_class": "FLASH_DROP",
                "confidence": 1.5,
                "action": "RISK_OFF_REDUCE",
                "params": {"reduce_ratio": 2.0, "freeze_minutes": 120,
                           "reverse_size_ratio": 5, "hedge_size_ratio": -1},
                "reasoning_short": "test",
                "safety_checks": {}
            }"#,
        );
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.params.reduce_ratio, 1.0);
        assert_eq!(r.params.freeze_minutes, 60.0);
        assert_eq!(r.params.reverse_size_ratio, 1.0);
        assert_eq!(r.params.hedge_size_ratio, 0.0);
    }

    #[test]
    fn test_advisory_recommended_action_alias() {
        let r = parse_advisory_response(
            r#"{"recommended_action": "REDUCE", "reduce_pct": 140, "reason_bullets": ["a", "b"]}"#,
        );
        assert_eq!(r.action, "REDUCE");
        assert_eq!(r.reduce_pct, Some(100.0));
        assert_eq!(r.reason_bullets.len(), 2);
    }

    #[test]
    fn test_advisory_abort_marker() {
        let r = AdvisoryResponse::aborted("daily_cap");
        assert!(r.aborted);
        assert_eq!(r.action, "HOLD");
        assert_eq!(r.gate_reason, "daily_cap");
    }
}
