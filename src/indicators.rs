//! Technical indicators powered by the `ta` crate
//!
//! Wrappers around `ta` for the indicator set the snapshot builder needs.
//! Series functions return `Vec<Option<f64>>` aligned with the input, `None`
//! until the warmup period is filled. Ichimoku and the volume profile have
//! no `ta` counterpart and are computed directly.

use ta::indicators::{
    AverageTrueRange, BollingerBands as TaBB, ExponentialMovingAverage, RelativeStrengthIndex,
    SimpleMovingAverage,
};
use ta::{DataItem, Next};

/// Type alias for band indicators (upper, middle, lower)
pub type BandOutput = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

/// Create a DataItem from OHLCV data for use with ta indicators
pub fn make_data_item(open: f64, high: f64, low: f64, close: f64, volume: f64) -> DataItem {
    DataItem::builder()
        .open(open)
        .high(high)
        .low(low)
        .close(close)
        .volume(volume)
        .build()
        .unwrap()
}

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match SimpleMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let sma_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(sma_val));
        } else {
            result.push(None);
        }
    }
    result
}

/// Calculate Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match ExponentialMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let ema_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(ema_val));
        } else {
            result.push(None);
        }
    }
    result
}

/// Calculate RSI (Relative Strength Index)
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let rsi_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(rsi_val));
        } else {
            result.push(None);
        }
    }
    result
}

/// Calculate Average True Range (ATR)
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 || high.len() != low.len() || high.len() != close.len() {
        return vec![];
    }

    let mut indicator = match AverageTrueRange::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; high.len()],
    };

    let mut result = Vec::with_capacity(high.len());
    for i in 0..high.len() {
        let item = make_data_item(close[i], high[i], low[i], close[i], 0.0);
        let atr_val = indicator.next(&item);
        if i + 1 >= period {
            result.push(Some(atr_val));
        } else {
            result.push(None);
        }
    }
    result
}

/// Calculate Bollinger Bands: (upper, middle, lower)
pub fn bollinger_bands(values: &[f64], period: usize, num_std: f64) -> BandOutput {
    if values.is_empty() || period == 0 {
        return (vec![], vec![], vec![]);
    }

    let mut indicator = match TaBB::new(period, num_std) {
        Ok(i) => i,
        Err(_) => {
            return (
                vec![None; values.len()],
                vec![None; values.len()],
                vec![None; values.len()],
            )
        }
    };

    let mut upper = Vec::with_capacity(values.len());
    let mut middle = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let bb = indicator.next(value);
        if i + 1 >= period {
            upper.push(Some(bb.upper));
            middle.push(Some(bb.average));
            lower.push(Some(bb.lower));
        } else {
            upper.push(None);
            middle.push(None);
            lower.push(None);
        }
    }

    (upper, middle, lower)
}

/// Ichimoku conversion/base lines: (tenkan, kijun). Not in the ta crate.
/// tenkan = 9-period midpoint, kijun = 26-period midpoint.
pub fn ichimoku(high: &[f64], low: &[f64]) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    (midpoint(high, low, 9), midpoint(high, low, 26))
}

fn midpoint(high: &[f64], low: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(high.len());
    for i in 0..high.len() {
        if i + 1 < period {
            result.push(None);
        } else {
            let h = high[i + 1 - period..=i]
                .iter()
                .cloned()
                .fold(f64::MIN, f64::max);
            let l = low[i + 1 - period..=i]
                .iter()
                .cloned()
                .fold(f64::MAX, f64::min);
            result.push(Some((h + l) / 2.0));
        }
    }
    result
}

/// Volume profile over the candle window: point of control plus the value
/// area bounds covering ~70% of traded volume around it. Not in the ta crate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeProfile {
    pub poc: f64,
    pub vah: f64,
    pub val: f64,
}

pub fn volume_profile(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    volume: &[f64],
    bins: usize,
) -> Option<VolumeProfile> {
    if close.is_empty() || bins == 0 {
        return None;
    }
    let max_price = high.iter().cloned().fold(f64::MIN, f64::max);
    let min_price = low.iter().cloned().fold(f64::MAX, f64::min);
    if !(max_price > min_price) {
        return Some(VolumeProfile {
            poc: close[close.len() - 1],
            vah: max_price,
            val: min_price,
        });
    }

    let bin_size = (max_price - min_price) / bins as f64;
    let mut hist = vec![0.0f64; bins];
    for i in 0..close.len() {
        // Attribute each candle's volume to its typical price bin.
        let typical = (high[i] + low[i] + close[i]) / 3.0;
        let idx = (((typical - min_price) / bin_size) as usize).min(bins - 1);
        hist[idx] += volume[i];
    }

    let total: f64 = hist.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let poc_idx = hist
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?
        .0;

    // Expand the value area around the POC until 70% of volume is covered.
    let target = total * 0.70;
    let mut covered = hist[poc_idx];
    let (mut lo, mut hi) = (poc_idx, poc_idx);
    while covered < target && (lo > 0 || hi + 1 < bins) {
        let below = if lo > 0 { hist[lo - 1] } else { -1.0 };
        let above = if hi + 1 < bins { hist[hi + 1] } else { -1.0 };
        if above >= below {
            hi += 1;
            covered += hist[hi];
        } else {
            lo -= 1;
            covered += hist[lo];
        }
    }

    let bin_mid = |idx: usize| min_price + (idx as f64 + 0.5) * bin_size;
    Some(VolumeProfile {
        poc: bin_mid(poc_idx),
        vah: bin_mid(hi),
        val: bin_mid(lo),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sma_basic() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&values, 3);
        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_relative_eq!(result[2].unwrap(), 2.0);
        assert_relative_eq!(result[4].unwrap(), 4.0);
    }

    #[test]
    fn test_ema_warmup_and_tracking() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let result = ema(&values, 3);
        assert_eq!(result.len(), values.len());
        assert_eq!(result[1], None);
        assert!(result[2].is_some());
        // EMA tracks a rising series upward and stays below the last value.
        let last = result[5].unwrap();
        assert!(last > result[3].unwrap());
        assert!(last < 6.0);
    }

    #[test]
    fn test_rsi_uptrend_saturates_high() {
        let values: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let result = rsi(&values, 14);
        let last = result.last().unwrap().unwrap();
        assert!(last > 90.0, "steady uptrend should saturate RSI, got {last}");
    }

    #[test]
    fn test_rsi_range() {
        let values: Vec<f64> = (0..60)
            .map(|i| 100.0 + ((i * 7919) % 13) as f64 - 6.0)
            .collect();
        for v in rsi(&values, 14).into_iter().flatten() {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn test_atr_positive_after_warmup() {
        let high = vec![10.0, 11.0, 12.0, 11.5, 12.0];
        let low = vec![9.0, 10.0, 11.0, 10.5, 11.0];
        let close = vec![9.5, 10.5, 11.5, 11.0, 11.5];
        let result = atr(&high, &low, &close, 3);
        assert_eq!(result[1], None);
        let atr_val = result[2].unwrap();
        assert!(atr_val > 0.0);
    }

    #[test]
    fn test_bollinger_band_ordering() {
        let values: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let (up, mid, dn) = bollinger_bands(&values, 20, 2.0);
        assert_eq!(up[10], None);
        let (u, m, d) = (up[29].unwrap(), mid[29].unwrap(), dn[29].unwrap());
        assert!(d < m && m < u);
    }

    #[test]
    fn test_ichimoku_midpoints() {
        let high: Vec<f64> = (0..30).map(|i| 110.0 + i as f64).collect();
        let low: Vec<f64> = (0..30).map(|i| 90.0 + i as f64).collect();
        let (tenkan, kijun) = ichimoku(&high, &low);
        assert_eq!(tenkan[7], None);
        // Window [21..=29]: high max 139, low min 111 → midpoint 125.
        assert_relative_eq!(tenkan[29].unwrap(), 125.0);
        // Window [4..=29]: high max 139, low min 94 → midpoint 116.5.
        assert_relative_eq!(kijun[29].unwrap(), 116.5);
    }

    #[test]
    fn test_volume_profile_poc_at_heavy_bin() {
        // Concentrate volume at ~100, with a tail to 110.
        let mut high = vec![101.0; 20];
        let mut low = vec![99.0; 20];
        let mut close = vec![100.0; 20];
        let mut volume = vec![10.0; 20];
        high.extend(vec![111.0; 5]);
        low.extend(vec![109.0; 5]);
        close.extend(vec![110.0; 5]);
        volume.extend(vec![1.0; 5]);

        let vp = volume_profile(&high, &low, &close, &volume, 24).unwrap();
        assert!(vp.poc < 105.0, "POC should land in the heavy cluster");
        assert!(vp.val <= vp.poc && vp.poc <= vp.vah);
    }
}
