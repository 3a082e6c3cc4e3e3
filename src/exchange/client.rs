//! Bybit v5 REST client for the USDT perpetual surface.
//!
//! Read-heavy client: positions, orders, ticker, OHLCV, funding, balance,
//! order book, instrument rules. Order placement belongs to the external
//! executor; this crate only validates and watches.

use anyhow::Result;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use super::error::ExchangeError;
use super::types::{Balance, FetchedOrder, MarketInfo, OpenOrder, OrderBook, OrderBookSide, Ticker};
use crate::types::{Candle, ExchangePosition, PositionSide};

type HmacSha256 = Hmac<Sha256>;

const API_BASE_URL: &str = "https://api.bybit.com";

/// Map the internal symbol notation (`BTC/USDT:USDT`) to the venue symbol
/// (`BTCUSDT`).
pub fn venue_symbol(symbol: &str) -> String {
    symbol
        .split(':')
        .next()
        .unwrap_or(symbol)
        .replace('/', "")
}

#[derive(Debug, Clone)]
pub struct BybitClient {
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    base_url: String,
    client: reqwest::Client,
}

impl BybitClient {
    pub fn new(api_key: String, api_secret: String, recv_window_ms: u64, timeout_sec: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .unwrap_or_default();
        BybitClient {
            api_key,
            api_secret,
            recv_window_ms,
            base_url: API_BASE_URL.to_string(),
            client,
        }
    }

    /// Point the client at a different host (tests, testnet).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn sign(&self, timestamp_ms: i64, query: &str) -> String {
        let payload = format!(
            "{}{}{}{}",
            timestamp_ms, self.api_key, self.recv_window_ms, query
        );
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get(&self, path: &str, query: &str, signed: bool) -> Result<Value, ExchangeError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut req = self.client.get(&url);
        if signed {
            let ts = Utc::now().timestamp_millis();
            req = req
                .header("X-BAPI-API-KEY", &self.api_key)
                .header("X-BAPI-TIMESTAMP", ts.to_string())
                .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
                .header("X-BAPI-SIGN", self.sign(ts, query));
        }

        let resp = req.send().await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;

        let ret_code = body["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            let message = body["retMsg"].as_str().unwrap_or("").to_string();
            if ret_code == 10006 {
                return Err(ExchangeError::RateLimitExceeded(message));
            }
            return Err(ExchangeError::Exchange {
                code: ret_code,
                message,
            });
        }
        Ok(body)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ExchangeError> {
        let body_str = serde_json::to_string(body)
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let ts = Utc::now().timestamp_millis();
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", self.sign(ts, &body_str))
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await?;
        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let ret_code = parsed["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            let message = parsed["retMsg"].as_str().unwrap_or("").to_string();
            if ret_code == 10006 {
                return Err(ExchangeError::RateLimitExceeded(message));
            }
            return Err(ExchangeError::Exchange {
                code: ret_code,
                message,
            });
        }
        Ok(parsed)
    }

    /// Set/replace the server-side stop loss on the open position.
    pub async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: f64,
    ) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": venue_symbol(symbol),
            "stopLoss": format!("{stop_loss}"),
            "positionIdx": 0,
        });
        self.post("/v5/position/trading-stop", &body).await?;
        Ok(())
    }

    /// Cancel one open order (orphan cleanup after full exits).
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": venue_symbol(symbol),
            "orderId": order_id,
        });
        self.post("/v5/order/cancel", &body).await?;
        Ok(())
    }

    /// Live position for the symbol, or None when flat.
    pub async fn fetch_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        let query = format!("category=linear&symbol={}", venue_symbol(symbol));
        let body = self.get("/v5/position/list", &query, true).await?;

        let list = body["result"]["list"].as_array().cloned().unwrap_or_default();
        for p in list {
            let qty: f64 = str_f64(&p["size"]);
            if qty <= 0.0 {
                continue;
            }
            let side = match p["side"].as_str() {
                Some("Buy") => PositionSide::Long,
                Some("Sell") => PositionSide::Short,
                _ => continue,
            };
            return Ok(Some(ExchangePosition {
                side,
                qty,
                entry_price: str_f64(&p["avgPrice"]),
                mark_price: str_f64(&p["markPrice"]),
                unrealized_pnl: str_f64(&p["unrealisedPnl"]),
                leverage: str_f64(&p["leverage"]),
                liquidation_price: str_f64(&p["liqPrice"]),
            }));
        }
        Ok(None)
    }

    pub async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let query = format!("category=linear&symbol={}", venue_symbol(symbol));
        let body = self.get("/v5/market/tickers", &query, false).await?;
        let t = body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| ExchangeError::Parse("empty ticker list".into()))?;
        Ok(Ticker {
            symbol: t["symbol"].as_str().unwrap_or_default().to_string(),
            last_price: str_f64(&t["lastPrice"]),
            bid: str_f64(&t["bid1Price"]),
            ask: str_f64(&t["ask1Price"]),
            volume_24h: str_f64(&t["volume24h"]),
        })
    }

    /// OHLCV, oldest first. `interval` uses venue notation (1, 5, 15, 60, D).
    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}&interval={}&limit={}",
            venue_symbol(symbol),
            interval,
            limit
        );
        let body = self.get("/v5/market/kline", &query, false).await?;
        let mut candles: Vec<Candle> = body["result"]["list"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|row| {
                let arr = row.as_array()?;
                let ts_ms: i64 = arr.first().and_then(|v| v.as_str())?.parse().ok()?;
                Some(Candle {
                    datetime: chrono::DateTime::from_timestamp_millis(ts_ms)?,
                    open: str_f64(arr.get(1)?),
                    high: str_f64(arr.get(2)?),
                    low: str_f64(arr.get(3)?),
                    close: str_f64(arr.get(4)?),
                    volume: str_f64(arr.get(5)?),
                })
            })
            .collect();
        // Venue returns newest first.
        candles.reverse();
        Ok(candles)
    }

    /// Closed/historical order lookup (preferred by the fill watcher).
    pub async fn fetch_closed_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<FetchedOrder, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}&orderId={}",
            venue_symbol(symbol),
            order_id
        );
        let body = self.get("/v5/order/history", &query, true).await?;
        parse_order(&body, order_id)
    }

    /// Realtime (any-state) order lookup, the fallback path.
    pub async fn fetch_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<FetchedOrder, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}&orderId={}",
            venue_symbol(symbol),
            order_id
        );
        let body = self.get("/v5/order/realtime", &query, true).await?;
        parse_order(&body, order_id)
    }

    pub async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}&openOnly=0",
            venue_symbol(symbol)
        );
        let body = self.get("/v5/order/realtime", &query, true).await?;
        let orders = body["result"]["list"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|o| OpenOrder {
                order_id: o["orderId"].as_str().unwrap_or_default().to_string(),
                side: o["side"].as_str().unwrap_or_default().to_lowercase(),
                order_type: o["orderType"].as_str().unwrap_or_default().to_lowercase(),
                price: str_f64(&o["price"]),
                qty: str_f64(&o["qty"]),
                filled_qty: str_f64(&o["cumExecQty"]),
                reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
            })
            .collect();
        Ok(orders)
    }

    pub async fn fetch_funding_rate(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}&limit=1",
            venue_symbol(symbol)
        );
        let body = self.get("/v5/market/funding/history", &query, false).await?;
        Ok(body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .map(|r| str_f64(&r["fundingRate"]))
            .unwrap_or(0.0))
    }

    pub async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        let body = self
            .get("/v5/account/wallet-balance", "accountType=UNIFIED", true)
            .await?;
        let coin = body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .and_then(|acct| acct["coin"].as_array())
            .and_then(|coins| {
                coins
                    .iter()
                    .find(|c| c["coin"].as_str() == Some("USDT"))
                    .cloned()
            });
        let Some(coin) = coin else {
            return Ok(Balance {
                total: 0.0,
                free: 0.0,
                used: 0.0,
            });
        };
        let total = str_f64(&coin["walletBalance"]);
        let free = str_f64(&coin["availableToWithdraw"]);
        Ok(Balance {
            total,
            free,
            used: (total - free).max(0.0),
        })
    }

    pub async fn fetch_order_book(&self, symbol: &str, depth: u32) -> Result<OrderBook, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}&limit={}",
            venue_symbol(symbol),
            depth
        );
        let body = self.get("/v5/market/orderbook", &query, false).await?;
        let parse_side = |v: &Value| -> Vec<OrderBookSide> {
            v.as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .filter_map(|level| {
                    let arr = level.as_array()?;
                    Some(OrderBookSide {
                        price: str_f64(arr.first()?),
                        qty: str_f64(arr.get(1)?),
                    })
                })
                .collect()
        };
        Ok(OrderBook {
            bids: parse_side(&body["result"]["b"]),
            asks: parse_side(&body["result"]["a"]),
        })
    }

    /// Venue trading rules for the symbol.
    pub async fn fetch_market_info(&self, symbol: &str) -> Result<MarketInfo, ExchangeError> {
        let query = format!(
            "category=linear&symbol={}",
            venue_symbol(symbol)
        );
        let body = self.get("/v5/market/instruments-info", &query, false).await?;
        let inst = body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| ExchangeError::Parse("empty instruments list".into()))?;
        let lot = &inst["lotSizeFilter"];
        let price = &inst["priceFilter"];
        let info = MarketInfo {
            min_qty: str_or(&lot["minOrderQty"], 0.001),
            max_qty: str_or(&lot["maxOrderQty"], 100.0),
            step_size: str_or(&lot["qtyStep"], 0.001),
            min_price: str_or(&price["minPrice"], 0.5),
            max_price: str_or(&price["maxPrice"], 999_999.0),
            tick_size: str_or(&price["tickSize"], 0.1),
            min_notional: str_or(&lot["minNotionalValue"], 5.0),
            contract_size: 1.0,
        };
        debug!(
            "market info fetched: minQty={} stepSize={} tickSize={}",
            info.min_qty, info.step_size, info.tick_size
        );
        Ok(info)
    }
}

fn parse_order(body: &Value, order_id: &str) -> Result<FetchedOrder, ExchangeError> {
    let order = body["result"]["list"]
        .as_array()
        .and_then(|l| l.iter().find(|o| o["orderId"].as_str() == Some(order_id)))
        .ok_or_else(|| ExchangeError::Parse(format!("order {order_id} not in response")))?;

    let status = normalize_order_status(order["orderStatus"].as_str().unwrap_or(""));
    Ok(FetchedOrder {
        order_id: order_id.to_string(),
        status,
        filled_qty: str_f64(&order["cumExecQty"]),
        avg_price: str_f64(&order["avgPrice"]),
        fee_cost: str_f64(&order["cumExecFee"]),
        fee_currency: Some("USDT".to_string()),
        raw: order.clone(),
    })
}

/// Collapse the venue's order status vocabulary to open/closed/canceled/rejected.
pub fn normalize_order_status(venue_status: &str) -> String {
    match venue_status {
        "New" | "PartiallyFilled" | "Untriggered" | "Created" => "open",
        "Filled" => "closed",
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => "canceled",
        "Rejected" => "rejected",
        other => {
            debug!("unknown venue order status: {other}");
            "open"
        }
    }
    .to_string()
}

fn str_f64(v: &Value) -> f64 {
    match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn str_or(v: &Value, default: f64) -> f64 {
    let parsed = str_f64(v);
    if parsed == 0.0 {
        default
    } else {
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_symbol_mapping() {
        assert_eq!(venue_symbol("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(venue_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn test_normalize_order_status() {
        assert_eq!(normalize_order_status("Filled"), "closed");
        assert_eq!(normalize_order_status("New"), "open");
        assert_eq!(normalize_order_status("PartiallyFilled"), "open");
        assert_eq!(normalize_order_status("Cancelled"), "canceled");
        assert_eq!(normalize_order_status("Rejected"), "rejected");
    }

    #[test]
    fn test_parse_order_from_body() {
        let body = serde_json::json!({
            "retCode": 0,
            "result": {"list": [{
                "orderId": "abc-1",
                "orderStatus": "Filled",
                "cumExecQty": "0.012",
                "avgPrice": "95123.5",
                "cumExecFee": "0.63"
            }]}
        });
        let order = parse_order(&body, "abc-1").unwrap();
        assert!(order.is_closed());
        assert!((order.filled_qty - 0.012).abs() < 1e-12);
        assert!((order.avg_price - 95123.5).abs() < 1e-9);
    }
}
