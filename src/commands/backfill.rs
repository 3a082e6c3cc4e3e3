//! Backfill job runner.

use anyhow::{bail, Context, Result};
use tracing::info;

use perp_core::backfill;
use perp_core::config::Config;
use perp_core::control::ControlFlags;
use perp_core::store::Store;

pub async fn run(job: &str, resume: bool) -> Result<()> {
    info!("=== BACKFILL START: {job} ===");
    let config = Config::from_env();
    let store = Store::open(&config.db_path).context("Failed to open store")?;
    let control = ControlFlags::new(&config.control_dir);

    match job {
        backfill::JOB_NAME => {
            let summary =
                backfill::run_news_price_path(&store, &control, &config.symbol, resume).await?;
            info!(
                "job finished: inserted={} skipped={} failed={} stopped={}",
                summary.inserted, summary.skipped, summary.failed, summary.stopped
            );
            Ok(())
        }
        other => bail!("unknown job: {other}"),
    }
}
