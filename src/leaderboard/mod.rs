//! Read-only ranking over accounts that have resolved at least one forecast.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::LeaderboardConfig;
use crate::error::CoinResult;
use crate::ledger::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankBy {
    Accuracy,
    TotalForecasts,
    LifetimeEarned,
}

impl RankBy {
    /// Primary key, then the remaining keys in priority order, then the
    /// account id so that every tie resolves the same way.
    fn order_clause(&self) -> &'static str {
        match self {
            RankBy::Accuracy => {
                "forecast_accuracy DESC, total_forecasts DESC, lifetime_earned DESC, account_id ASC"
            }
            RankBy::TotalForecasts => {
                "total_forecasts DESC, lifetime_earned DESC, forecast_accuracy DESC, account_id ASC"
            }
            RankBy::LifetimeEarned => {
                "lifetime_earned DESC, forecast_accuracy DESC, total_forecasts DESC, account_id ASC"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub account_id: String,
    pub forecast_accuracy: f64,
    pub total_forecasts: i64,
    pub won_forecasts: i64,
    pub lifetime_earned: i64,
}

pub struct LeaderboardService {
    store: Arc<LedgerStore>,
    config: LeaderboardConfig,
}

impl LeaderboardService {
    /// `store` may point at a read replica; nothing here writes.
    pub fn new(store: Arc<LedgerStore>, config: LeaderboardConfig) -> Self {
        Self { store, config }
    }

    pub fn query(&self, rank_by: RankBy, limit: usize) -> CoinResult<Vec<LeaderboardEntry>> {
        let limit = limit.max(1).min(self.config.max_entries.max(1));
        let accounts = self
            .store
            .read(|tx| tx.ranked_accounts(rank_by.order_clause(), limit))?;

        Ok(accounts
            .into_iter()
            .enumerate()
            .map(|(idx, account)| LeaderboardEntry {
                rank: idx + 1,
                account_id: account.account_id,
                forecast_accuracy: account.forecast_accuracy.unwrap_or(0.0),
                total_forecasts: account.total_forecasts,
                won_forecasts: account.won_forecasts,
                lifetime_earned: account.lifetime_earned,
            })
            .collect())
    }
}
