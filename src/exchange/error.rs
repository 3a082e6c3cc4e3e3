//! Exchange error taxonomy and venue error-code extraction.
//!
//! The compliance layer needs a numeric Bybit code no matter how the error
//! surfaced: a structured `retCode` in a response body, a `bybit NNNNN` text
//! pattern, or a typed transport/validation error mapped heuristically.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

/// Best-effort extraction of a numeric venue error code.
/// Returns `(code, raw_message)`; code 0 means no code could be determined.
pub fn extract_error_code(err: &ExchangeError) -> (i64, String) {
    let msg = err.to_string();

    if let Some(code) = find_ret_code(&msg) {
        return (code, msg);
    }
    if let Some(code) = find_bybit_pattern(&msg) {
        return (code, msg);
    }

    let lower = msg.to_lowercase();
    let code = match err {
        ExchangeError::Exchange { code, .. } if *code != 0 => *code,
        ExchangeError::InsufficientFunds(_) => 110001,
        ExchangeError::InvalidOrder(_) => {
            if lower.contains("reduce") {
                110043
            } else if lower.contains("qty") || lower.contains("quantity") {
                10001
            } else if lower.contains("price") {
                10003
            } else {
                20001
            }
        }
        ExchangeError::RateLimitExceeded(_) => 10006,
        ExchangeError::Exchange { .. } => {
            if lower.contains("leverage") {
                130074
            } else if lower.contains("margin") || lower.contains("mode") {
                130021
            } else if lower.contains("position") && lower.contains("not") {
                110006
            } else {
                0
            }
        }
        _ => 0,
    };

    (code, msg)
}

/// Find `"retCode": NNN` inside a message that embeds a JSON body.
fn find_ret_code(msg: &str) -> Option<i64> {
    let idx = msg.find("\"retCode\"")?;
    let rest = &msg[idx + "\"retCode\"".len()..];
    let rest = rest.trim_start_matches([':', ' ', '\t']);
    parse_leading_int(rest).filter(|&c| c != 0)
}

/// Find the ccxt-style `bybit NNNNN` pattern (case-insensitive).
fn find_bybit_pattern(msg: &str) -> Option<i64> {
    let lower = msg.to_lowercase();
    let mut search_from = 0;
    while let Some(rel) = lower[search_from..].find("bybit") {
        let after = search_from + rel + "bybit".len();
        let rest = lower[after..].trim_start();
        if let Some(code) = parse_leading_int(rest) {
            return Some(code);
        }
        search_from = after;
    }
    None
}

fn parse_leading_int(s: &str) -> Option<i64> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ret_code_extraction() {
        let e = ExchangeError::Exchange {
            code: 0,
            message: r#"bybit {"retCode": 110043, "retMsg": "reduce-only rule violated"}"#.into(),
        };
        let (code, msg) = extract_error_code(&e);
        assert_eq!(code, 110043);
        assert!(msg.contains("retCode"));
    }

    #[test]
    fn test_bybit_text_pattern() {
        let e = ExchangeError::Transport("request failed: bybit 10006 too many visits".into());
        assert_eq!(extract_error_code(&e).0, 10006);
    }

    #[test]
    fn test_typed_variant_mapping() {
        assert_eq!(
            extract_error_code(&ExchangeError::InsufficientFunds("margin".into())).0,
            110001
        );
        assert_eq!(
            extract_error_code(&ExchangeError::InvalidOrder("reduceOnly violated".into())).0,
            110043
        );
        assert_eq!(
            extract_error_code(&ExchangeError::InvalidOrder("bad qty step".into())).0,
            10001
        );
        assert_eq!(
            extract_error_code(&ExchangeError::InvalidOrder("price off tick".into())).0,
            10003
        );
        assert_eq!(
            extract_error_code(&ExchangeError::InvalidOrder("something else".into())).0,
            20001
        );
        assert_eq!(
            extract_error_code(&ExchangeError::RateLimitExceeded("slow down".into())).0,
            10006
        );
    }

    #[test]
    fn test_exchange_keyword_mapping() {
        let leverage = ExchangeError::Exchange {
            code: 0,
            message: "leverage exceeds allowed range".into(),
        };
        assert_eq!(extract_error_code(&leverage).0, 130074);

        let margin = ExchangeError::Exchange {
            code: 0,
            message: "margin mode conflict".into(),
        };
        assert_eq!(extract_error_code(&margin).0, 130021);

        let no_pos = ExchangeError::Exchange {
            code: 0,
            message: "position is not found".into(),
        };
        assert_eq!(extract_error_code(&no_pos).0, 110006);
    }

    #[test]
    fn test_unknown_yields_zero() {
        let e = ExchangeError::Parse("garbage".into());
        assert_eq!(extract_error_code(&e).0, 0);
    }
}
