//! Point-in-time market snapshot.
//!
//! The snapshot is the single observation record consumed by the event
//! trigger engine and the analysis paths. Validation is FAIL-CLOSED: a
//! snapshot with a non-positive price or missing essential indicators is
//! rejected and the caller falls back to DB-only context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::exchange::{BybitClient, ExchangeError, OrderBook, Ticker};
use crate::indicators;
use crate::types::Candle;

const SPREAD_OK_MAX_PCT: f64 = 0.05;
const LIQUIDITY_OK_MIN_NOTIONAL: f64 = 500_000.0;
const PRICE_MENTION_TOLERANCE_PCT: f64 = 2.0;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid snapshot: {0}")]
    Invalid(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Returns {
    pub ret_1m: Option<f64>,
    pub ret_5m: Option<f64>,
    pub ret_15m: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub ts: DateTime<Utc>,
    pub price: f64,
    pub returns: Returns,

    pub rsi_14: Option<f64>,
    pub atr_14: Option<f64>,
    /// ATR as percent of price.
    pub atr_pct: Option<f64>,

    pub bb_mid: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_lower: Option<f64>,
    pub tenkan: Option<f64>,
    pub kijun: Option<f64>,
    pub ma_50: Option<f64>,
    pub ma_200: Option<f64>,

    pub vol_last: Option<f64>,
    pub vol_ma20: Option<f64>,
    /// vol_last / vol_ma20.
    pub vol_ratio: f64,
    pub volume_z: Option<f64>,

    pub poc: Option<f64>,
    pub vah: Option<f64>,
    pub val: Option<f64>,
    /// Position of price inside the value area: 0 at VAL, 1 at VAH.
    pub range_pos: Option<f64>,

    pub impulse: f64,
    pub orderbook_imbalance: f64,
    pub spread_ok: bool,
    pub liquidity_ok: bool,

    pub regime: String,
    pub regime_confidence: f64,
    pub breakout: bool,
}

impl MarketSnapshot {
    /// FAIL-CLOSED validation: decision paths abort on an invalid snapshot.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.price <= 0.0 {
            return Err(SnapshotError::Invalid(format!(
                "price {} <= 0",
                self.price
            )));
        }
        if self.atr_14.is_none() {
            return Err(SnapshotError::Invalid("atr_14 missing".into()));
        }
        if self.rsi_14.is_none() {
            return Err(SnapshotError::Invalid("rsi_14 missing".into()));
        }
        if self.returns.ret_1m.is_none() {
            return Err(SnapshotError::Invalid("ret_1m missing".into()));
        }
        Ok(())
    }

    pub fn liquidity_stressed(&self) -> bool {
        !self.spread_ok || !self.liquidity_ok
    }
}

/// Reject analysis output that references a price far from observed reality.
pub fn validate_price_mention(mentioned: f64, snapshot: &MarketSnapshot) -> (bool, String) {
    if mentioned <= 0.0 || snapshot.price <= 0.0 {
        return (false, "non-positive price".to_string());
    }
    let diff_pct = ((mentioned - snapshot.price) / snapshot.price * 100.0).abs();
    if diff_pct > PRICE_MENTION_TOLERANCE_PCT {
        return (
            false,
            format!(
                "mentioned price {mentioned} deviates {diff_pct:.2}% from snapshot {}",
                snapshot.price
            ),
        );
    }
    (true, "ok".to_string())
}

/// Fetch inputs and build a validated snapshot.
pub async fn build_and_validate(
    client: &BybitClient,
    symbol: &str,
) -> Result<MarketSnapshot, SnapshotError> {
    let ticker = client.fetch_ticker(symbol).await?;
    let candles = client.fetch_ohlcv(symbol, "1", 240).await?;
    let order_book = client.fetch_order_book(symbol, 25).await.ok();

    let snapshot = compute_snapshot(&ticker, &candles, order_book.as_ref(), Utc::now())?;
    snapshot.validate()?;
    Ok(snapshot)
}

/// Pure snapshot computation over pre-fetched inputs.
pub fn compute_snapshot(
    ticker: &Ticker,
    candles: &[Candle],
    order_book: Option<&OrderBook>,
    ts: DateTime<Utc>,
) -> Result<MarketSnapshot, SnapshotError> {
    if candles.len() < 30 {
        return Err(SnapshotError::InsufficientData(format!(
            "{} candles < 30 required",
            candles.len()
        )));
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let n = closes.len();
    let price = if ticker.last_price > 0.0 {
        ticker.last_price
    } else {
        closes[n - 1]
    };

    let ret_over = |bars: usize| -> Option<f64> {
        if n > bars && closes[n - 1 - bars] > 0.0 {
            Some((closes[n - 1] - closes[n - 1 - bars]) / closes[n - 1 - bars] * 100.0)
        } else {
            None
        }
    };
    let returns = Returns {
        ret_1m: ret_over(1),
        ret_5m: ret_over(5),
        ret_15m: ret_over(15),
    };

    let rsi_series = indicators::rsi(&closes, 14);
    let atr_series = indicators::atr(&highs, &lows, &closes, 14);
    let (bb_up, bb_mid, bb_dn) = indicators::bollinger_bands(&closes, 20, 2.0);
    let (tenkan, kijun) = indicators::ichimoku(&highs, &lows);
    let ma_50 = indicators::sma(&closes, 50);
    let ma_200 = indicators::sma(&closes, 200);
    let vol_ma20 = indicators::sma(&volumes, 20);

    let last = |series: &[Option<f64>]| series.last().copied().flatten();

    let atr_14 = last(&atr_series);
    let atr_pct = atr_14.map(|a| a / price * 100.0);
    let vol_last = volumes.last().copied();
    let vol_ma = last(&vol_ma20);
    let vol_ratio = match (vol_last, vol_ma) {
        (Some(v), Some(ma)) if ma > 0.0 => v / ma,
        _ => 1.0,
    };

    // Volume z-score over the trailing 20 bars.
    let volume_z = vol_ma.and_then(|ma| {
        if n < 20 {
            return None;
        }
        let window = &volumes[n - 20..];
        let variance = window.iter().map(|v| (v - ma).powi(2)).sum::<f64>() / 20.0;
        let std = variance.sqrt();
        if std > 0.0 {
            vol_last.map(|v| (v - ma) / std)
        } else {
            Some(0.0)
        }
    });

    let profile = indicators::volume_profile(&highs, &lows, &closes, &volumes, 48);
    let (poc, vah, val) = match profile {
        Some(p) => (Some(p.poc), Some(p.vah), Some(p.val)),
        None => (None, None, None),
    };
    let range_pos = match (vah, val) {
        (Some(vah), Some(val)) if vah > val => Some((price - val) / (vah - val)),
        _ => None,
    };

    // Impulse: how abnormal the last 1m move is relative to ATR.
    let impulse = match (returns.ret_1m, atr_pct) {
        (Some(r), Some(ap)) if ap > 0.0 => r / ap,
        _ => 0.0,
    };

    let (spread_ok, liquidity_ok, imbalance) = match order_book {
        Some(ob) => {
            let spread_ok = ticker.spread_pct() <= SPREAD_OK_MAX_PCT;
            let depth_notional: f64 = ob
                .bids
                .iter()
                .chain(ob.asks.iter())
                .take(10)
                .map(|l| l.price * l.qty)
                .sum();
            (
                spread_ok,
                depth_notional >= LIQUIDITY_OK_MIN_NOTIONAL,
                ob.imbalance(5),
            )
        }
        None => (true, true, 0.0),
    };

    let (regime, regime_confidence, breakout) =
        classify_regime(price, &closes, last(&bb_up), last(&bb_dn));

    let snapshot = MarketSnapshot {
        ts,
        price,
        returns,
        rsi_14: last(&rsi_series),
        atr_14,
        atr_pct,
        bb_mid: last(&bb_mid),
        bb_upper: last(&bb_up),
        bb_lower: last(&bb_dn),
        tenkan: last(&tenkan),
        kijun: last(&kijun),
        ma_50: last(&ma_50),
        ma_200: last(&ma_200),
        vol_last,
        vol_ma20: vol_ma,
        vol_ratio,
        volume_z,
        poc,
        vah,
        val,
        range_pos,
        impulse,
        orderbook_imbalance: imbalance,
        spread_ok,
        liquidity_ok,
        regime,
        regime_confidence,
        breakout,
    };
    debug!(
        "snapshot built: price={} ret_1m={:?} regime={} vol_ratio={:.2}",
        snapshot.price, snapshot.returns.ret_1m, snapshot.regime, snapshot.vol_ratio
    );
    Ok(snapshot)
}

/// Coarse regime classification over the trailing hour of 1m closes.
fn classify_regime(
    price: f64,
    closes: &[f64],
    bb_upper: Option<f64>,
    bb_lower: Option<f64>,
) -> (String, f64, bool) {
    let n = closes.len();
    let window = &closes[n.saturating_sub(60)..];
    let first = window[0];
    let drift_pct = if first > 0.0 {
        (window[window.len() - 1] - first) / first * 100.0
    } else {
        0.0
    };

    let breakout = match (bb_upper, bb_lower) {
        (Some(up), Some(dn)) => price > up || price < dn,
        _ => false,
    };

    if breakout {
        return ("BREAKOUT".to_string(), 0.8, true);
    }
    if drift_pct.abs() < 0.3 {
        let confidence = 1.0 - drift_pct.abs() / 0.3;
        return ("STATIC_RANGE".to_string(), 0.5 + confidence * 0.4, false);
    }
    let regime = if drift_pct > 0.0 { "DRIFT_UP" } else { "DRIFT_DOWN" };
    let confidence = (drift_pct.abs() / 1.5).min(1.0) * 0.5 + 0.4;
    (regime.to_string(), confidence, false)
}

/// Test support: canned snapshots for engine tests and scenario fixtures.
pub mod testutil {
    use super::*;

    /// Snapshot with sensible defaults for engine tests.
    pub fn base_snapshot() -> MarketSnapshot {
        MarketSnapshot {
            ts: Utc::now(),
            price: 95_000.0,
            returns: Returns {
                ret_1m: Some(0.0),
                ret_5m: Some(0.0),
                ret_15m: Some(0.0),
            },
            rsi_14: Some(50.0),
            atr_14: Some(150.0),
            atr_pct: Some(0.15),
            bb_mid: Some(95_000.0),
            bb_upper: Some(96_000.0),
            bb_lower: Some(94_000.0),
            tenkan: Some(95_000.0),
            kijun: Some(95_000.0),
            ma_50: Some(95_000.0),
            ma_200: Some(95_000.0),
            vol_last: Some(100.0),
            vol_ma20: Some(100.0),
            vol_ratio: 1.0,
            volume_z: Some(0.0),
            poc: Some(95_000.0),
            vah: Some(95_500.0),
            val: Some(94_500.0),
            range_pos: Some(0.5),
            impulse: 0.0,
            orderbook_imbalance: 0.0,
            spread_ok: true,
            liquidity_ok: true,
            regime: "STATIC_RANGE".to_string(),
            regime_confidence: 0.8,
            breakout: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_candles(count: usize, price: f64) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle {
                datetime: Utc::now() - chrono::Duration::minutes((count - i) as i64),
                open: price,
                high: price + 10.0,
                low: price - 10.0,
                close: price,
                volume: 100.0,
            })
            .collect()
    }

    fn ticker(price: f64) -> Ticker {
        Ticker {
            symbol: "BTCUSDT".into(),
            last_price: price,
            bid: price - 0.5,
            ask: price + 0.5,
            volume_24h: 1000.0,
        }
    }

    #[test]
    fn test_compute_snapshot_valid() {
        let candles = flat_candles(240, 95_000.0);
        let snap = compute_snapshot(&ticker(95_000.0), &candles, None, Utc::now()).unwrap();
        assert!(snap.validate().is_ok());
        assert_eq!(snap.returns.ret_1m, Some(0.0));
        assert_eq!(snap.regime, "STATIC_RANGE");
    }

    #[test]
    fn test_insufficient_candles_rejected() {
        let candles = flat_candles(10, 95_000.0);
        let err = compute_snapshot(&ticker(95_000.0), &candles, None, Utc::now()).unwrap_err();
        assert!(matches!(err, SnapshotError::InsufficientData(_)));
    }

    #[test]
    fn test_zero_price_fails_closed() {
        let mut snap = testutil::base_snapshot();
        snap.price = 0.0;
        assert!(snap.validate().is_err());
    }

    #[test]
    fn test_missing_essential_indicator_fails_closed() {
        let mut snap = testutil::base_snapshot();
        snap.atr_14 = None;
        assert!(snap.validate().is_err());
        let mut snap = testutil::base_snapshot();
        snap.returns.ret_1m = None;
        assert!(snap.validate().is_err());
    }

    #[test]
    fn test_price_mention_validation() {
        let snap = testutil::base_snapshot();
        let (ok, _) = validate_price_mention(95_100.0, &snap);
        assert!(ok);
        let (ok, reason) = validate_price_mention(80_000.0, &snap);
        assert!(!ok);
        assert!(reason.contains("deviates"));
    }

    #[test]
    fn test_liquidity_stress_flag() {
        let mut snap = testutil::base_snapshot();
        assert!(!snap.liquidity_stressed());
        snap.spread_ok = false;
        assert!(snap.liquidity_stressed());
        snap.spread_ok = true;
        snap.liquidity_ok = false;
        assert!(snap.liquidity_stressed());
    }
}
