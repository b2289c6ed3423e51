//! Coin economy and forecast-resolution ledger.
//!
//! Balances only ever move through [`ledger::service::CoinLedger`], inside a
//! single SQLite transaction per operation. One-time and periodic bonuses are
//! deduplicated by a unique index, not by a read-then-insert check.

pub mod bonus;
pub mod config;
pub mod error;
pub mod forecast;
pub mod leaderboard;
pub mod ledger;
pub mod monitoring;

pub use error::{CoinError, CoinResult};
