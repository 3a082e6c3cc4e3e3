//! Telegram dispatcher daemon runner.

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use perp_core::config::Config;
use perp_core::control::ControlFlags;
use perp_core::dispatcher::Dispatcher;
use perp_core::store::Store;

pub async fn run() -> Result<()> {
    info!("=== DISPATCHER START ===");
    let config = Config::from_env();
    if !config.has_telegram() {
        warn!("telegram credentials missing — dispatcher idles in local-only mode");
    }

    let store = Store::open(&config.db_path).context("Failed to open store")?;
    let control = ControlFlags::new(&config.control_dir);
    let mut dispatcher = Dispatcher::new(&config, store);

    loop {
        if control.kill_switch_active() {
            info!("KILL_SWITCH detected. Exiting.");
            return Ok(());
        }
        match dispatcher.poll_once().await {
            Ok(true) => {
                // getUpdates long-poll already paced us; short breather only.
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
            Ok(false) => {
                // Not configured: idle slowly so the process stays alive for
                // when credentials appear.
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
            Err(e) => {
                error!("poll error: {e:#}");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    }
}
