//! SQLite-backed ledger store: accounts, the append-only transaction log and
//! forecasts, all in one database so a single transaction can touch them
//! together. Holds no business rules.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    ffi, params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{CoinError, CoinResult};
use crate::forecast::types::{Forecast, ForecastStatus, NewForecast, Settlement};
use crate::ledger::types::{
    grant_key, Account, NewTransaction, Receipt, Transaction, TransactionMeta,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    account_id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    lifetime_earned INTEGER NOT NULL DEFAULT 0,
    forecast_accuracy REAL,
    total_forecasts INTEGER NOT NULL DEFAULT 0,
    won_forecasts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS coin_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL REFERENCES accounts(account_id),
    amount INTEGER NOT NULL CHECK (amount <> 0),
    kind TEXT NOT NULL,
    description TEXT,
    metadata TEXT,
    grant_key TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_coin_transactions_grant_key
    ON coin_transactions(account_id, kind, grant_key)
    WHERE grant_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_coin_transactions_account
    ON coin_transactions(account_id, id DESC);

CREATE TRIGGER IF NOT EXISTS coin_transactions_no_update
BEFORE UPDATE ON coin_transactions
BEGIN
    SELECT RAISE(ABORT, 'coin_transactions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS coin_transactions_no_delete
BEFORE DELETE ON coin_transactions
BEGIN
    SELECT RAISE(ABORT, 'coin_transactions is append-only');
END;

CREATE TABLE IF NOT EXISTS forecasts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL REFERENCES accounts(account_id),
    target_id TEXT NOT NULL,
    position TEXT NOT NULL,
    target_value INTEGER NOT NULL,
    coins_staked INTEGER NOT NULL CHECK (coins_staked > 0),
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    actual_value INTEGER,
    coins_payout INTEGER,
    cancel_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_forecasts_status_window ON forecasts(status, window_end);
CREATE INDEX IF NOT EXISTS idx_forecasts_account ON forecasts(account_id, id DESC);
"#;

const ACCOUNT_COLUMNS: &str = "account_id, balance, lifetime_earned, forecast_accuracy, \
     total_forecasts, won_forecasts, created_at";

const TRANSACTION_COLUMNS: &str =
    "id, account_id, amount, kind, description, metadata, created_at";

const FORECAST_COLUMNS: &str = "id, account_id, target_id, position, target_value, \
     coins_staked, window_start, window_end, status, created_at, resolved_at, \
     actual_value, coins_payout, cancel_reason";

pub struct LedgerStore {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl LedgerStore {
    /// Open (or create) the ledger database and make sure the schema exists.
    pub fn open(db_path: impl Into<PathBuf>, busy_timeout: Duration) -> CoinResult<Self> {
        let store = Self {
            db_path: db_path.into(),
            busy_timeout,
        };

        if let Some(parent) = Path::new(&store.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = store.connect()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        debug!("Ledger store ready at {:?} (journal_mode={})", store.db_path, mode);

        Ok(store)
    }

    fn connect(&self) -> CoinResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    /// Run `f` inside a write transaction that holds the database write lock
    /// from the first statement. Commits on `Ok`, rolls back on `Err`.
    pub fn write<T, F>(&self, f: F) -> CoinResult<T>
    where
        F: FnOnce(&StoreTx<'_>) -> CoinResult<T>,
    {
        self.run(TransactionBehavior::Immediate, f)
    }

    /// Run `f` against a consistent read snapshot.
    pub fn read<T, F>(&self, f: F) -> CoinResult<T>
    where
        F: FnOnce(&StoreTx<'_>) -> CoinResult<T>,
    {
        self.run(TransactionBehavior::Deferred, f)
    }

    fn run<T, F>(&self, behavior: TransactionBehavior, f: F) -> CoinResult<T>
    where
        F: FnOnce(&StoreTx<'_>) -> CoinResult<T>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(behavior)?;
        let store_tx = StoreTx { tx };
        let value = f(&store_tx)?;
        store_tx.tx.commit()?;
        Ok(value)
    }
}

/// Primitive operations available inside a store transaction.
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl StoreTx<'_> {
    /// Create the account row if missing. Returns true when it was created.
    pub fn ensure_account(&self, account_id: &str, now: DateTime<Utc>) -> CoinResult<bool> {
        let inserted = self.tx.execute(
            "INSERT OR IGNORE INTO accounts (account_id, created_at) VALUES (?1, ?2)",
            params![account_id, ts(now)],
        )?;
        Ok(inserted == 1)
    }

    pub fn account(&self, account_id: &str) -> CoinResult<Option<Account>> {
        let account = self
            .tx
            .query_row(
                &format!("SELECT {} FROM accounts WHERE account_id = ?1", ACCOUNT_COLUMNS),
                params![account_id],
                map_account,
            )
            .optional()?;
        Ok(account)
    }

    pub fn balance(&self, account_id: &str) -> CoinResult<i64> {
        self.tx
            .query_row(
                "SELECT balance FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CoinError::AccountNotFound(account_id.to_string()))
    }

    pub fn account_ids(&self) -> CoinResult<Vec<String>> {
        let mut stmt = self
            .tx
            .prepare("SELECT account_id FROM accounts ORDER BY account_id")?;
        let ids = stmt.query_map([], |row| row.get(0))?;
        Ok(ids.collect::<Result<Vec<_>, _>>()?)
    }

    /// Insert a transaction and move the cached balance by the same amount.
    ///
    /// A duplicate uniqueness key surfaces as `AlreadyGranted` and leaves the
    /// account untouched. A daily login row must belong to the UTC day of
    /// `now`, the timestamp it is written with.
    pub fn append(&self, entry: &NewTransaction, now: DateTime<Utc>) -> CoinResult<Receipt> {
        let account = self
            .account(&entry.account_id)?
            .ok_or_else(|| CoinError::AccountNotFound(entry.account_id.clone()))?;

        let new_balance = account.balance.checked_add(entry.amount);
        let new_earned = account.lifetime_earned.checked_add(entry.amount.max(0));
        let (new_balance, new_earned) = match (new_balance, new_earned) {
            (Some(balance), Some(earned)) => (balance, earned),
            _ => {
                return Err(CoinError::InvalidAmount(format!(
                    "{} coins would overflow the balance of {}",
                    entry.amount, entry.account_id
                )))
            }
        };

        if let Some(TransactionMeta::DailyLogin { day }) = &entry.metadata {
            let today = now.date_naive();
            if *day != today {
                return Err(CoinError::DayMismatch {
                    claimed: *day,
                    today,
                });
            }
        }

        let key = grant_key(entry.kind, entry.metadata.as_ref())?;
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let insert = self.tx.execute(
            "INSERT INTO coin_transactions
             (account_id, amount, kind, description, metadata, grant_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.account_id,
                entry.amount,
                entry.kind.as_str(),
                entry.description,
                metadata,
                key,
                ts(now),
            ],
        );
        match insert {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation
                    && err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                return Err(CoinError::AlreadyGranted { kind: entry.kind });
            }
            Err(e) => return Err(e.into()),
        }
        let transaction_id = self.tx.last_insert_rowid();

        self.tx.execute(
            "UPDATE accounts
             SET balance = ?1,
                 lifetime_earned = ?2
             WHERE account_id = ?3",
            params![new_balance, new_earned, entry.account_id],
        )?;

        Ok(Receipt {
            new_balance,
            transaction_id,
        })
    }

    /// Newest-first page of an account's transactions, strictly older than
    /// `cursor` when given. Fetches up to `limit` rows.
    pub fn transactions(
        &self,
        account_id: &str,
        cursor: Option<i64>,
        kind: Option<&str>,
        limit: usize,
    ) -> CoinResult<Vec<Transaction>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM coin_transactions
             WHERE account_id = ?1
               AND (?2 IS NULL OR id < ?2)
               AND (?3 IS NULL OR kind = ?3)
             ORDER BY id DESC
             LIMIT ?4",
            TRANSACTION_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![account_id, cursor, kind, limit as i64],
            map_transaction,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// (sum of amounts, sum of credits, row count) straight from the log.
    pub fn ledger_totals(&self, account_id: &str) -> CoinResult<(i64, i64, i64)> {
        let totals = self.tx.query_row(
            "SELECT COALESCE(SUM(amount), 0),
                    COALESCE(SUM(CASE WHEN amount > 0 THEN amount ELSE 0 END), 0),
                    COUNT(*)
             FROM coin_transactions
             WHERE account_id = ?1",
            params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(totals)
    }

    pub fn insert_forecast(&self, forecast: &NewForecast, now: DateTime<Utc>) -> CoinResult<i64> {
        self.tx.execute(
            "INSERT INTO forecasts
             (account_id, target_id, position, target_value, coins_staked,
              window_start, window_end, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', ?8)",
            params![
                forecast.account_id,
                forecast.target_id,
                forecast.position.as_str(),
                forecast.target_value,
                forecast.coins_staked,
                ts(forecast.window_start),
                ts(forecast.window_end),
                ts(now),
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn forecast(&self, forecast_id: i64) -> CoinResult<Option<Forecast>> {
        let forecast = self
            .tx
            .query_row(
                &format!("SELECT {} FROM forecasts WHERE id = ?1", FORECAST_COLUMNS),
                params![forecast_id],
                map_forecast,
            )
            .optional()?;
        Ok(forecast)
    }

    /// Move a PENDING forecast to its terminal state. Returns false when the
    /// row was no longer PENDING.
    pub fn settle_forecast(&self, forecast_id: i64, settlement: &Settlement) -> CoinResult<bool> {
        let updated = self.tx.execute(
            "UPDATE forecasts
             SET status = ?1, actual_value = ?2, coins_payout = ?3,
                 cancel_reason = ?4, resolved_at = ?5
             WHERE id = ?6 AND status = 'PENDING'",
            params![
                settlement.status.as_str(),
                settlement.actual_value,
                settlement.coins_payout,
                settlement.cancel_reason,
                ts(settlement.resolved_at),
                forecast_id,
            ],
        )?;
        Ok(updated == 1)
    }

    /// (won, lost) over every resolved forecast of the account.
    pub fn resolved_counts(&self, account_id: &str) -> CoinResult<(i64, i64)> {
        let counts = self.tx.query_row(
            "SELECT COALESCE(SUM(CASE WHEN status = 'WON' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'LOST' THEN 1 ELSE 0 END), 0)
             FROM forecasts
             WHERE account_id = ?1",
            params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }

    pub fn update_forecast_stats(
        &self,
        account_id: &str,
        total: i64,
        won: i64,
        accuracy: Option<f64>,
    ) -> CoinResult<()> {
        let updated = self.tx.execute(
            "UPDATE accounts
             SET total_forecasts = ?1, won_forecasts = ?2, forecast_accuracy = ?3
             WHERE account_id = ?4",
            params![total, won, accuracy, account_id],
        )?;
        if updated == 0 {
            return Err(CoinError::AccountNotFound(account_id.to_string()));
        }
        Ok(())
    }

    /// PENDING forecasts whose window closed at or before `now`, oldest first.
    pub fn forecasts_due(&self, now: DateTime<Utc>, limit: usize) -> CoinResult<Vec<Forecast>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM forecasts
             WHERE status = 'PENDING' AND window_end <= ?1
             ORDER BY window_end ASC, id ASC
             LIMIT ?2",
            FORECAST_COLUMNS
        ))?;
        let rows = stmt.query_map(params![ts(now), limit as i64], map_forecast)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn forecasts_for(
        &self,
        account_id: &str,
        status: Option<ForecastStatus>,
    ) -> CoinResult<Vec<Forecast>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM forecasts
             WHERE account_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY id DESC",
            FORECAST_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![account_id, status.map(|s| s.as_str())],
            map_forecast,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Accounts with at least one resolved forecast, ordered by `order_by`.
    /// `order_by` must be a fixed clause owned by the caller, never user input.
    pub fn ranked_accounts(&self, order_by: &'static str, limit: usize) -> CoinResult<Vec<Account>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM accounts
             WHERE total_forecasts > 0
             ORDER BY {}
             LIMIT ?1",
            ACCOUNT_COLUMNS, order_by
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_account)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &Connection {
        &self.tx
    }
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_err(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn parse_text<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        conversion_err(
            idx,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })
}

fn map_account(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        account_id: row.get(0)?,
        balance: row.get(1)?,
        lifetime_earned: row.get(2)?,
        forecast_accuracy: row.get(3)?,
        total_forecasts: row.get(4)?,
        won_forecasts: row.get(5)?,
        created_at: parse_ts(row, 6)?,
    })
}

fn map_transaction(row: &Row) -> rusqlite::Result<Transaction> {
    let metadata: Option<String> = row.get(5)?;
    let metadata = metadata
        .map(|json| serde_json::from_str(&json).map_err(|e| conversion_err(5, e)))
        .transpose()?;

    Ok(Transaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        kind: parse_text(row, 3)?,
        description: row.get(4)?,
        metadata,
        created_at: parse_ts(row, 6)?,
    })
}

fn map_forecast(row: &Row) -> rusqlite::Result<Forecast> {
    Ok(Forecast {
        id: row.get(0)?,
        account_id: row.get(1)?,
        target_id: row.get(2)?,
        position: parse_text(row, 3)?,
        target_value: row.get(4)?,
        coins_staked: row.get(5)?,
        window_start: parse_ts(row, 6)?,
        window_end: parse_ts(row, 7)?,
        status: parse_text(row, 8)?,
        created_at: parse_ts(row, 9)?,
        resolved_at: parse_opt_ts(row, 10)?,
        actual_value: row.get(11)?,
        coins_payout: row.get(12)?,
        cancel_reason: row.get(13)?,
    })
}
