//! Wire-facing exchange types, normalized from the Bybit v5 payloads.

use serde::{Deserialize, Serialize};

/// Per-symbol venue trading rules, cached by the compliance layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub tick_size: f64,
    pub min_notional: f64,
    pub contract_size: f64,
}

impl MarketInfo {
    /// Venue defaults for BTC/USDT:USDT, used when the rules endpoint is
    /// unreachable.
    pub fn fallback_btc_usdt() -> Self {
        MarketInfo {
            min_qty: 0.001,
            max_qty: 100.0,
            step_size: 0.001,
            min_price: 0.5,
            max_price: 999_999.0,
            tick_size: 0.1,
            min_notional: 5.0,
            contract_size: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
}

impl Ticker {
    pub fn spread_pct(&self) -> f64 {
        if self.bid <= 0.0 || self.ask <= 0.0 {
            return 0.0;
        }
        (self.ask - self.bid) / self.bid * 100.0
    }
}

/// Normalized order fetch result used by the fill watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedOrder {
    pub order_id: String,
    /// Normalized status: open / closed / canceled / rejected.
    pub status: String,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub fee_cost: f64,
    pub fee_currency: Option<String>,
    pub raw: serde_json::Value,
}

impl FetchedOrder {
    pub fn is_open(&self) -> bool {
        self.status == "open"
    }

    pub fn is_canceled(&self) -> bool {
        self.status == "canceled"
    }

    pub fn is_closed(&self) -> bool {
        self.status == "closed" || self.status == "filled"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: String,
    pub order_type: String,
    pub price: f64,
    pub qty: f64,
    pub filled_qty: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub total: f64,
    pub free: f64,
    pub used: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSide {
    pub price: f64,
    pub qty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<OrderBookSide>,
    pub asks: Vec<OrderBookSide>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Bid/ask volume imbalance in [-1, 1] over the top `depth` levels.
    pub fn imbalance(&self, depth: usize) -> f64 {
        let bid_vol: f64 = self.bids.iter().take(depth).map(|l| l.qty).sum();
        let ask_vol: f64 = self.asks.iter().take(depth).map(|l| l.qty).sum();
        let total = bid_vol + ask_vol;
        if total <= 0.0 {
            0.0
        } else {
            (bid_vol - ask_vol) / total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_spread() {
        let t = Ticker {
            symbol: "BTCUSDT".into(),
            last_price: 95000.0,
            bid: 95000.0,
            ask: 95009.5,
            volume_24h: 100.0,
        };
        assert!((t.spread_pct() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_orderbook_imbalance() {
        let ob = OrderBook {
            bids: vec![OrderBookSide { price: 100.0, qty: 3.0 }],
            asks: vec![OrderBookSide { price: 101.0, qty: 1.0 }],
        };
        assert!((ob.imbalance(5) - 0.5).abs() < 1e-9);
    }
}
