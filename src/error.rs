use chrono::NaiveDate;
use rusqlite::ErrorCode;

use crate::forecast::types::ForecastStatus;
use crate::ledger::types::TransactionKind;

pub type CoinResult<T> = Result<T, CoinError>;

#[derive(Debug, thiserror::Error)]
pub enum CoinError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Forecast not found: {0}")]
    ForecastNotFound(i64),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient balance: need {needed} coins, have {available}")]
    InsufficientBalance { needed: i64, available: i64 },

    #[error("Forecast {forecast_id} is {status}, expected PENDING")]
    InvalidState {
        forecast_id: i64,
        status: ForecastStatus,
    },

    #[error("{kind} already granted")]
    AlreadyGranted { kind: TransactionKind },

    #[error("Storage conflict, retry the operation")]
    StorageConflict,

    #[error("{kind} cannot be used for a {operation}")]
    KindMismatch {
        kind: TransactionKind,
        operation: &'static str,
    },

    #[error("{kind} requires {expected} metadata")]
    MissingMetadata {
        kind: TransactionKind,
        expected: &'static str,
    },

    #[error("Daily login for {claimed} cannot be recorded on {today}")]
    DayMismatch { claimed: NaiveDate, today: NaiveDate },

    #[error("Target not accepting forecasts: {0}")]
    TargetUnavailable(String),

    #[error("Staking window closed for target {0}")]
    StakingClosed(String),

    #[error("Forecast {0} window has not closed yet")]
    WindowStillOpen(i64),

    #[error("Database error: {0}")]
    Storage(#[source] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl CoinError {
    /// Only lock contention is worth retrying; every other outcome is stable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoinError::StorageConflict)
    }
}

impl From<rusqlite::Error> for CoinError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                CoinError::StorageConflict
            }
            _ => CoinError::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_conflict() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err = CoinError::from(busy);
        assert!(matches!(err, CoinError::StorageConflict));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_stable_errors_not_retryable() {
        let err = CoinError::InsufficientBalance {
            needed: 150,
            available: 100,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Insufficient balance: need 150 coins, have 100");
    }
}
