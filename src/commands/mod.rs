//! Daemon runners behind the CLI subcommands.

pub mod backfill;
pub mod dispatcher;
pub mod fill_watcher;
pub mod position_manager;
