//! Exchange access: Bybit v5 REST client, wire types, error taxonomy.

pub mod client;
pub mod error;
pub mod types;

pub use client::{venue_symbol, BybitClient};
pub use error::{extract_error_code, ExchangeError};
pub use types::{Balance, FetchedOrder, MarketInfo, OpenOrder, OrderBook, Ticker};
