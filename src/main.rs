//! perp-core - main entry point
//!
//! One binary, four long-lived daemons:
//! - position-manager: adaptive decision loop
//! - fill-watcher: order fill verification + reconciler
//! - dispatcher: Telegram operator console
//! - backfill: recoverable batch jobs (news price path)

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "perp-core")]
#[command(about = "Execution and decision core for a BTC/USDT perpetual trading system", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the position manager daemon (10-30s adaptive loop)
    PositionManager {
        /// Enable the event-decision mode feature flag
        #[arg(long)]
        event_decision_mode: bool,
    },

    /// Run the fill watcher daemon (5s poll + reconciler)
    FillWatcher,

    /// Run the Telegram command dispatcher
    Dispatcher,

    /// Run a backfill batch job
    Backfill {
        /// Job name
        #[arg(long, default_value = "news_price_path")]
        job: String,

        /// Resume from the last persisted cursor
        #[arg(long)]
        resume: bool,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::PositionManager { .. } => "position_manager",
        Commands::FillWatcher => "fill_watcher",
        Commands::Dispatcher => "dispatcher",
        Commands::Backfill { .. } => "backfill",
    };
    setup_logging(cli.verbose, command_name)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match cli.command {
            Commands::PositionManager {
                event_decision_mode,
            } => commands::position_manager::run(event_decision_mode).await,
            Commands::FillWatcher => commands::fill_watcher::run().await,
            Commands::Dispatcher => commands::dispatcher::run().await,
            Commands::Backfill { job, resume } => commands::backfill::run(&job, resume).await,
        }
    })
}
