//! Position manager daemon runner.

use anyhow::{Context, Result};
use tracing::{info, warn};

use perp_core::config::Config;
use perp_core::position_manager::{CycleOutcome, PositionManager};
use perp_core::store::Store;

pub async fn run(event_decision_mode: bool) -> Result<()> {
    info!("=== POSITION MANAGER START ===");
    let config = Config::from_env();
    if !config.has_exchange_credentials() {
        warn!("exchange credentials missing — running in local-only mode");
    }
    if !config.live_trading {
        warn!("LIVE_TRADING not armed — decisions are recorded, executor stays passive");
    }

    let store = Store::open(&config.db_path).context("Failed to open store")?;
    let mut manager = PositionManager::new(&config, store, event_decision_mode);

    loop {
        match manager.cycle().await {
            CycleOutcome::Sleep(secs) => {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            }
            CycleOutcome::Exit => return Ok(()),
        }
    }
}
