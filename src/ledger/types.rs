use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoinError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    WelcomeBonus,
    DailyLogin,
    AccuracyBonus,
    ForecastStake,
    ForecastPayout,
    ForecastCancelled,
    Purchase,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 7] = [
        TransactionKind::WelcomeBonus,
        TransactionKind::DailyLogin,
        TransactionKind::AccuracyBonus,
        TransactionKind::ForecastStake,
        TransactionKind::ForecastPayout,
        TransactionKind::ForecastCancelled,
        TransactionKind::Purchase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::WelcomeBonus => "WELCOME_BONUS",
            TransactionKind::DailyLogin => "DAILY_LOGIN",
            TransactionKind::AccuracyBonus => "ACCURACY_BONUS",
            TransactionKind::ForecastStake => "FORECAST_STAKE",
            TransactionKind::ForecastPayout => "FORECAST_PAYOUT",
            TransactionKind::ForecastCancelled => "FORECAST_CANCELLED",
            TransactionKind::Purchase => "PURCHASE",
        }
    }

    /// Debit kinds go through `spend`, everything else through `grant`.
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionKind::ForecastStake)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown transaction kind: {}", s))
    }
}

/// Structured metadata attached to a transaction. Each variant belongs to
/// one or more kinds and carries the value the uniqueness key is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionMeta {
    DailyLogin { day: NaiveDate },
    AccuracyMilestone { milestone: u8 },
    Purchase { payment_ref: String },
    Forecast { forecast_id: i64 },
}

const WELCOME_KEY: &str = "once";

/// Storage uniqueness key for a (kind, metadata) pair.
///
/// `None` means the kind may repeat freely. Kinds that must be unique reject
/// metadata of the wrong shape rather than silently writing an unkeyed row.
pub fn grant_key(
    kind: TransactionKind,
    meta: Option<&TransactionMeta>,
) -> Result<Option<String>, CoinError> {
    match (kind, meta) {
        (TransactionKind::WelcomeBonus, _) => Ok(Some(WELCOME_KEY.to_string())),
        (TransactionKind::DailyLogin, Some(TransactionMeta::DailyLogin { day })) => {
            Ok(Some(day.format("%Y-%m-%d").to_string()))
        }
        (TransactionKind::DailyLogin, _) => Err(CoinError::MissingMetadata {
            kind,
            expected: "daily_login",
        }),
        (
            TransactionKind::AccuracyBonus,
            Some(TransactionMeta::AccuracyMilestone { milestone }),
        ) => Ok(Some(milestone.to_string())),
        (TransactionKind::AccuracyBonus, _) => Err(CoinError::MissingMetadata {
            kind,
            expected: "accuracy_milestone",
        }),
        (TransactionKind::Purchase, Some(TransactionMeta::Purchase { payment_ref })) => {
            Ok(Some(payment_ref.clone()))
        }
        (
            TransactionKind::ForecastStake
            | TransactionKind::ForecastPayout
            | TransactionKind::ForecastCancelled,
            Some(TransactionMeta::Forecast { forecast_id }),
        ) => Ok(Some(forecast_id.to_string())),
        (TransactionKind::Purchase, Some(_)) => Err(CoinError::MissingMetadata {
            kind,
            expected: "purchase",
        }),
        (_, Some(_)) => Err(CoinError::MissingMetadata {
            kind,
            expected: "forecast",
        }),
        (_, None) => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub account_id: String,
    pub balance: i64,
    pub lifetime_earned: i64,
    pub forecast_accuracy: Option<f64>,
    pub total_forecasts: i64,
    pub won_forecasts: i64,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn lost_forecasts(&self) -> i64 {
        self.total_forecasts - self.won_forecasts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub account_id: String,
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: Option<String>,
    pub metadata: Option<TransactionMeta>,
    pub created_at: DateTime<Utc>,
}

/// A ledger entry waiting to be appended. `amount` is signed.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: String,
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: Option<String>,
    pub metadata: Option<TransactionMeta>,
}

/// Result of a committed grant or spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub new_balance: i64,
    pub transaction_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub limit: usize,
    /// Opaque cursor returned by a previous page.
    pub cursor: Option<i64>,
    pub kind: Option<TransactionKind>,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub transactions: Vec<Transaction>,
    pub next_cursor: Option<i64>,
}

/// Cached columns vs. values recomputed from the transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub account_id: String,
    pub cached_balance: i64,
    pub ledger_balance: i64,
    pub cached_lifetime_earned: i64,
    pub ledger_lifetime_earned: i64,
    pub transaction_count: i64,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.cached_balance == self.ledger_balance
            && self.cached_lifetime_earned == self.ledger_lifetime_earned
    }
}
