//! perp-core
//!
//! Execution and decision core of an automated BTC/USDT perpetual trading
//! system: position manager, fill watcher with embedded reconciler, exchange
//! compliance layer, event trigger/decision engines, adaptive defence
//! layers, operator command dispatcher, and recoverable backfill jobs.

pub mod adaptive;
pub mod backfill;
pub mod compliance;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod events;
pub mod exchange;
pub mod fill_watcher;
pub mod indicators;
pub mod llm;
pub mod local_queries;
pub mod notify;
pub mod position_manager;
pub mod proactive;
pub mod reconciler;
pub mod router;
pub mod safety;
pub mod snapshot;
pub mod store;
pub mod types;

pub use config::Config;
pub use store::Store;
pub use types::*;
