//! Configuration management
//!
//! All configuration comes from environment variables (a `.env` file is
//! loaded if present) with documented defaults. Missing exchange or Telegram
//! credentials degrade the process to local-only mode instead of failing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Literal value LIVE_TRADING must carry before any live action is armed.
pub const LIVE_TRADING_ARM_PHRASE: &str = "YES_I_UNDERSTAND";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub symbol: String,
    pub exchange: ExchangeConfig,
    pub db_path: PathBuf,
    /// Directory holding the filesystem toggles (KILL_SWITCH, pause files).
    pub control_dir: PathBuf,
    pub telegram: TelegramConfig,
    pub llm: LlmConfig,
    pub live_trading: bool,
    pub news_poll_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    /// Per-request receive window in ms, sent with every signed call.
    pub recv_window_ms: u64,
    pub http_timeout_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    pub allowed_chat_id: i64,
    pub offset_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub mini_model: String,
    pub daily_deep_call_cap: u32,
    pub call_timeout_sec: u64,
}

impl Config {
    /// Load configuration from the environment. Never fails on missing
    /// credentials; those states are reported by the `has_*` accessors.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());

        Config {
            symbol: env_or("SYMBOL", "BTC/USDT:USDT"),
            exchange: ExchangeConfig {
                api_key: std::env::var("BYBIT_API_KEY").ok().filter(|s| !s.is_empty()),
                api_secret: std::env::var("BYBIT_SECRET").ok().filter(|s| !s.is_empty()),
                recv_window_ms: env_parse("BYBIT_RECV_WINDOW_MS", 10_000),
                http_timeout_sec: env_parse("EXCHANGE_HTTP_TIMEOUT_SEC", 15),
            },
            db_path: PathBuf::from(env_or("DB_PATH", "state/perp_core.db")),
            control_dir: PathBuf::from(env_or("CONTROL_DIR", "control")),
            telegram: TelegramConfig {
                bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                    .ok()
                    .filter(|s| !s.is_empty()),
                allowed_chat_id: env_parse("TELEGRAM_ALLOWED_CHAT_ID", 0),
                offset_file: PathBuf::from(env_or(
                    "TELEGRAM_OFFSET_FILE",
                    &format!("{home}/.perp-core/telegram/update-offset.json"),
                )),
            },
            llm: LlmConfig {
                api_key: std::env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty()),
                model: env_or("OPENAI_MODEL", "gpt-4o"),
                mini_model: env_or("OPENAI_MINI_MODEL", "gpt-4o-mini"),
                daily_deep_call_cap: env_parse("LLM_DAILY_DEEP_CAP", 30),
                call_timeout_sec: env_parse("LLM_CALL_TIMEOUT_SEC", 30),
            },
            live_trading: std::env::var("LIVE_TRADING")
                .map(|v| v == LIVE_TRADING_ARM_PHRASE)
                .unwrap_or(false),
            news_poll_sec: env_parse("NEWS_POLL_SEC", 60),
        }
    }

    pub fn has_exchange_credentials(&self) -> bool {
        self.exchange.api_key.is_some() && self.exchange.api_secret.is_some()
    }

    pub fn has_telegram(&self) -> bool {
        self.telegram.bot_token.is_some() && self.telegram.allowed_chat_id != 0
    }

    pub fn has_llm(&self) -> bool {
        self.llm.api_key.is_some()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_trading_requires_exact_phrase() {
        std::env::set_var("LIVE_TRADING", "yes");
        let cfg = Config::from_env();
        assert!(!cfg.live_trading);

        std::env::set_var("LIVE_TRADING", LIVE_TRADING_ARM_PHRASE);
        let cfg = Config::from_env();
        assert!(cfg.live_trading);
        std::env::remove_var("LIVE_TRADING");
    }

    #[test]
    fn test_defaults_without_credentials() {
        std::env::remove_var("BYBIT_API_KEY");
        std::env::remove_var("BYBIT_SECRET");
        let cfg = Config::from_env();
        assert_eq!(cfg.symbol, "BTC/USDT:USDT");
        assert!(!cfg.has_exchange_credentials());
    }
}
