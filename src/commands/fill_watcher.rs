//! Fill watcher daemon runner.

use anyhow::{Context, Result};
use tracing::{info, warn};

use perp_core::config::Config;
use perp_core::fill_watcher::FillWatcher;
use perp_core::position_manager::CycleOutcome;
use perp_core::store::Store;

pub async fn run() -> Result<()> {
    info!("=== FILL WATCHER START ===");
    let config = Config::from_env();
    if !config.has_exchange_credentials() {
        warn!("exchange credentials missing — fill verification will fail until configured");
    }

    let store = Store::open(&config.db_path).context("Failed to open store")?;
    let mut watcher = FillWatcher::new(&config, store);

    loop {
        match watcher.cycle().await {
            CycleOutcome::Sleep(secs) => {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            }
            CycleOutcome::Exit => return Ok(()),
        }
    }
}
