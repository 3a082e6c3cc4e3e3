//! Recoverable batch jobs.
//!
//! The news price-path job walks news rows older than 24 hours and computes
//! how price travelled after each item: max drawdown/run-up, the 24h end
//! state and a coarse path class. Exclusivity is triple-gated (pidfile +
//! RUNNING row + enable flag); progress persists through `last_cursor` so a
//! stopped run resumes where it left off.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::control::ControlFlags;
use crate::store::Store;
use crate::types::{JobStatus, Money};

pub const JOB_NAME: &str = "news_price_path";
pub const PIDFILE_NAME: &str = "backfill_news_path.pid";
pub const BATCH_SIZE: i64 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct PricePath {
    pub btc_price_at: f64,
    pub price_source_tf: String,
    pub max_drawdown_24h: f64,
    pub max_runup_24h: f64,
    pub end_ret_24h: f64,
    pub end_state_24h: String,
    pub path_class: String,
    pub recovery_minutes: Option<i64>,
}

/// Classify the 24h end state from the end return.
pub fn classify_end_state(end_ret_24h: f64) -> &'static str {
    if end_ret_24h >= 0.5 {
        "UP"
    } else if end_ret_24h <= -0.5 {
        "DOWN"
    } else {
        "FLAT"
    }
}

/// Coarse shape of the 24h path after the news.
pub fn classify_path_class(max_drawdown: f64, max_runup: f64, end_ret: f64) -> &'static str {
    if max_drawdown <= -1.0 && end_ret >= -0.2 {
        "SPIKE_RECOVER"
    } else if max_drawdown <= -1.0 && end_ret < -1.0 {
        "DOWN_CONTINUE"
    } else if max_runup >= 1.0 && end_ret >= 1.0 {
        "UP_TREND"
    } else if max_runup >= 1.0 && end_ret < 0.2 {
        "FADE"
    } else {
        "NOISE"
    }
}

/// Compute the 24h price path for one news timestamp from stored candles.
/// Returns None when no usable price data brackets the window.
pub fn compute_price_path(
    store: &Store,
    symbol: &str,
    ts_news: DateTime<Utc>,
) -> Result<Option<PricePath>> {
    // Price source preference: 1m, then 5m, then 1h.
    let mut source_tf = None;
    let mut candles = Vec::new();
    for tf in ["1m", "5m", "1h"] {
        let window = store.candles_between(symbol, tf, ts_news, ts_news + Duration::hours(24))?;
        if window.len() >= 2 {
            source_tf = Some(tf);
            candles = window;
            break;
        }
    }
    let Some(tf) = source_tf else {
        return Ok(None);
    };

    let price_at = candles[0].open;
    if price_at <= 0.0 {
        return Ok(None);
    }

    let mut max_drawdown = 0.0f64;
    let mut max_runup = 0.0f64;
    let mut drawdown_at: Option<DateTime<Utc>> = None;
    let mut recovery_minutes = None;

    for candle in &candles {
        let low_ret = (candle.low - price_at) / price_at * 100.0;
        let high_ret = (candle.high - price_at) / price_at * 100.0;
        if low_ret < max_drawdown {
            max_drawdown = low_ret;
            drawdown_at = Some(candle.datetime);
            recovery_minutes = None;
        }
        if high_ret > max_runup {
            max_runup = high_ret;
        }
        // First close back at/above the news price after the deepest dip.
        if let Some(dd_at) = drawdown_at {
            if recovery_minutes.is_none() && candle.datetime > dd_at && candle.close >= price_at {
                recovery_minutes = Some((candle.datetime - ts_news).num_minutes());
            }
        }
    }

    let end_price = candles.last().map(|c| c.close).unwrap_or(price_at);
    let end_ret = (end_price - price_at) / price_at * 100.0;

    Ok(Some(PricePath {
        btc_price_at: price_at,
        price_source_tf: tf.to_string(),
        max_drawdown_24h: max_drawdown,
        max_runup_24h: max_runup,
        end_ret_24h: end_ret,
        end_state_24h: classify_end_state(end_ret).to_string(),
        path_class: classify_path_class(max_drawdown, max_runup, end_ret).to_string(),
        recovery_minutes,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct BackfillSummary {
    pub inserted: i64,
    pub skipped: i64,
    pub failed: i64,
    pub stopped: bool,
}

/// Run the news price-path backfill until exhausted or stopped.
pub async fn run_news_price_path(
    store: &Store,
    control: &ControlFlags,
    symbol: &str,
    resume: bool,
) -> Result<BackfillSummary> {
    // Triple exclusivity gate: feature flag, pidfile, RUNNING row.
    if !control.backfill_enabled() {
        anyhow::bail!("backfill disabled (enable flag missing)");
    }
    if !control.acquire_pidfile(PIDFILE_NAME)? {
        anyhow::bail!("another backfill process holds the pidfile");
    }
    if store.running_job(JOB_NAME)?.is_some() {
        control.release_pidfile(PIDFILE_NAME);
        anyhow::bail!("a RUNNING job row already exists for {JOB_NAME}");
    }

    let mut last_id: i64 = 0;
    if resume {
        if let Some(cursor) = store.last_job_cursor(JOB_NAME)? {
            last_id = cursor["last_news_id"].as_i64().unwrap_or(0);
            info!("resuming from news_id > {last_id}");
        }
    }

    let job_id = store.start_job(JOB_NAME, &json!({ "last_news_id": last_id }))?;
    let mut summary = BackfillSummary::default();

    let outcome: Result<()> = async {
        loop {
            if control.backfill_stop_requested() {
                info!("STOP signal received");
                summary.stopped = true;
                return Ok(());
            }
            while control.backfill_paused() {
                if control.backfill_stop_requested() {
                    summary.stopped = true;
                    return Ok(());
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }

            let rows = store.news_needing_price_path(last_id, BATCH_SIZE)?;
            if rows.is_empty() {
                info!("no more news needing path analysis");
                return Ok(());
            }

            for (news_id, ts_news) in rows {
                last_id = news_id;
                match compute_price_path(store, symbol, ts_news) {
                    Ok(Some(path)) => {
                        store.upsert_news_price_path(
                            news_id,
                            ts_news,
                            Money::from_f64(path.btc_price_at),
                            &path.price_source_tf,
                            path.max_drawdown_24h,
                            path.max_runup_24h,
                            path.end_ret_24h,
                            &path.end_state_24h,
                            &path.path_class,
                            path.recovery_minutes,
                        )?;
                        summary.inserted += 1;
                    }
                    Ok(None) => summary.skipped += 1,
                    Err(e) => {
                        warn!("path compute failed for news {news_id}: {e}");
                        summary.failed += 1;
                    }
                }
            }

            store.update_job_progress(
                job_id,
                &json!({ "last_news_id": last_id }),
                summary.inserted,
                summary.skipped,
                summary.failed,
            )?;
        }
    }
    .await;

    store.update_job_progress(
        job_id,
        &json!({ "last_news_id": last_id }),
        summary.inserted,
        summary.skipped,
        summary.failed,
    )?;
    match &outcome {
        Ok(()) if summary.stopped => {
            store.finish_job(job_id, JobStatus::Partial, Some("stopped_by_user"))?
        }
        Ok(()) => store.finish_job(job_id, JobStatus::Completed, None)?,
        Err(e) => store.finish_job(job_id, JobStatus::Failed, Some(&e.to_string()))?,
    }
    control.release_pidfile(PIDFILE_NAME);
    outcome?;

    info!(
        "backfill done: inserted={} skipped={} failed={} stopped={}",
        summary.inserted, summary.skipped, summary.failed, summary.stopped
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;

    const SYMBOL: &str = "BTC/USDT:USDT";

    fn seed_candles(store: &Store, start: DateTime<Utc>, minutes: i64, prices: impl Fn(i64) -> f64) {
        for i in 0..minutes {
            let p = prices(i);
            let candle = Candle {
                datetime: start + Duration::minutes(i),
                open: p,
                high: p + 20.0,
                low: p - 20.0,
                close: p,
                volume: 10.0,
            };
            store.upsert_candle(SYMBOL, "1m", &candle).unwrap();
        }
    }

    fn temp_control() -> ControlFlags {
        let dir = std::env::temp_dir().join(format!(
            "perp-core-backfill-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        ControlFlags::new(dir)
    }

    #[test]
    fn test_path_classifications() {
        assert_eq!(classify_end_state(1.2), "UP");
        assert_eq!(classify_end_state(-1.2), "DOWN");
        assert_eq!(classify_end_state(0.1), "FLAT");
        assert_eq!(classify_path_class(-2.0, 0.3, 0.1), "SPIKE_RECOVER");
        assert_eq!(classify_path_class(-2.5, 0.1, -2.0), "DOWN_CONTINUE");
        assert_eq!(classify_path_class(-0.2, 2.0, 1.5), "UP_TREND");
        assert_eq!(classify_path_class(-0.2, 1.5, 0.0), "FADE");
        assert_eq!(classify_path_class(-0.3, 0.4, 0.1), "NOISE");
    }

    #[test]
    fn test_compute_price_path_drop_and_recover() {
        let store = Store::open_in_memory().unwrap();
        let ts_news = Utc::now() - Duration::hours(30);
        // Drop 2% over the first hour, recover by hour three, flat after.
        seed_candles(&store, ts_news, 24 * 60, |i| {
            let base = 95_000.0;
            if i < 60 {
                base - (i as f64 / 60.0) * 1_900.0
            } else if i < 180 {
                base - 1_900.0 + ((i - 60) as f64 / 120.0) * 1_900.0
            } else {
                base + 50.0
            }
        });

        let path = compute_price_path(&store, SYMBOL, ts_news).unwrap().unwrap();
        assert_eq!(path.price_source_tf, "1m");
        assert!(path.max_drawdown_24h < -1.5, "dd={}", path.max_drawdown_24h);
        assert!(path.end_ret_24h > -0.2);
        assert_eq!(path.path_class, "SPIKE_RECOVER");
        assert!(path.recovery_minutes.is_some());
    }

    #[test]
    fn test_compute_price_path_without_data() {
        let store = Store::open_in_memory().unwrap();
        let result = compute_price_path(&store, SYMBOL, Utc::now() - Duration::hours(30)).unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_run_requires_enable_flag() {
        let store = Store::open_in_memory().unwrap();
        let control = temp_control();
        let err = run_news_price_path(&store, &control, SYMBOL, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_run_processes_and_completes() {
        let store = Store::open_in_memory().unwrap();
        let control = temp_control();
        control.set_backfill_enabled(true).unwrap();

        let ts_news = Utc::now() - Duration::hours(30);
        seed_candles(&store, ts_news, 24 * 60, |_| 95_000.0);
        store
            .insert_news(ts_news, "https://example.com/a", "BTC steady", None, None)
            .unwrap();
        // Too-recent news must be ignored.
        store
            .insert_news(
                Utc::now() - Duration::hours(1),
                "https://example.com/b",
                "fresh news",
                None,
                None,
            )
            .unwrap();

        let summary = run_news_price_path(&store, &control, SYMBOL, false)
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert!(!summary.stopped);
        assert_eq!(store.news_price_path_count().unwrap(), 1);
        assert!(store.running_job(JOB_NAME).unwrap().is_none());

        // Idempotent: a second run finds nothing new.
        let summary = run_news_price_path(&store, &control, SYMBOL, true)
            .await
            .unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(store.news_price_path_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_flag_yields_partial() {
        let store = Store::open_in_memory().unwrap();
        let control = temp_control();
        control.set_backfill_enabled(true).unwrap();
        control.set_backfill_stop(true).unwrap();

        let ts_news = Utc::now() - Duration::hours(30);
        store
            .insert_news(ts_news, "https://example.com/c", "stopped run", None, None)
            .unwrap();

        let summary = run_news_price_path(&store, &control, SYMBOL, false)
            .await
            .unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.inserted, 0);
        // The job row records PARTIAL.
        let cursor = store.last_job_cursor(JOB_NAME).unwrap();
        assert!(cursor.is_some());
    }
}
