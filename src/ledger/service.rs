use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::error::{CoinError, CoinResult};
use crate::ledger::store::{LedgerStore, StoreTx};
use crate::ledger::types::{
    Account, AuditReport, HistoryPage, HistoryQuery, NewTransaction, Receipt, TransactionKind,
    TransactionMeta,
};

/// A credit or debit request. `amount` is the unsigned magnitude; the
/// direction comes from the operation it is handed to.
#[derive(Debug, Clone)]
pub struct Entry {
    pub account_id: String,
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: Option<String>,
    pub metadata: Option<TransactionMeta>,
}

impl Entry {
    pub fn new(account_id: &str, amount: i64, kind: TransactionKind) -> Self {
        Self {
            account_id: account_id.to_string(),
            amount,
            kind,
            description: None,
            metadata: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_meta(mut self, metadata: TransactionMeta) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn signed(&self, sign: i64) -> NewTransaction {
        NewTransaction {
            account_id: self.account_id.clone(),
            amount: sign * self.amount,
            kind: self.kind,
            description: self.description.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Credit inside an open store transaction.
pub(crate) fn grant_in(tx: &StoreTx<'_>, entry: &Entry, now: DateTime<Utc>) -> CoinResult<Receipt> {
    if entry.amount <= 0 {
        return Err(CoinError::InvalidAmount(format!(
            "grant amount must be positive, got {}",
            entry.amount
        )));
    }
    if entry.kind.is_debit() {
        return Err(CoinError::KindMismatch {
            kind: entry.kind,
            operation: "grant",
        });
    }
    tx.append(&entry.signed(1), now)
}

/// Debit inside an open store transaction. The balance read and the debit
/// share the transaction's write lock, so no other writer can interleave.
pub(crate) fn spend_in(tx: &StoreTx<'_>, entry: &Entry, now: DateTime<Utc>) -> CoinResult<Receipt> {
    if entry.amount <= 0 {
        return Err(CoinError::InvalidAmount(format!(
            "spend amount must be positive, got {}",
            entry.amount
        )));
    }
    if !entry.kind.is_debit() {
        return Err(CoinError::KindMismatch {
            kind: entry.kind,
            operation: "spend",
        });
    }

    let available = tx.balance(&entry.account_id)?;
    if available < entry.amount {
        return Err(CoinError::InsufficientBalance {
            needed: entry.amount,
            available,
        });
    }
    tx.append(&entry.signed(-1), now)
}

/// The only component allowed to move coins.
#[derive(Clone)]
pub struct CoinLedger {
    store: Arc<LedgerStore>,
    config: LedgerConfig,
}

impl CoinLedger {
    pub fn new(store: Arc<LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub(crate) fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Run `f` in a write transaction, retrying the whole transaction on
    /// storage conflicts up to the configured bound.
    pub(crate) fn transact<T, F>(&self, operation: &str, f: F) -> CoinResult<T>
    where
        F: Fn(&StoreTx<'_>) -> CoinResult<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            match self.store.write(&f) {
                Err(err) if err.is_retryable() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    warn!(
                        "{} hit a storage conflict, retry {}/{}",
                        operation, attempt, self.config.max_conflict_retries
                    );
                    std::thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
                }
                other => return other,
            }
        }
    }

    /// Create the account if it does not exist yet. Returns true on creation.
    pub fn open_account(&self, account_id: &str) -> CoinResult<bool> {
        let created = self.transact("open_account", |tx| tx.ensure_account(account_id, Utc::now()))?;
        if created {
            info!("Opened coin account {}", account_id);
        }
        Ok(created)
    }

    pub fn account(&self, account_id: &str) -> CoinResult<Account> {
        self.store
            .read(|tx| tx.account(account_id))?
            .ok_or_else(|| CoinError::AccountNotFound(account_id.to_string()))
    }

    /// Credit an account. Kinds with a uniqueness key fail with
    /// `AlreadyGranted` instead of writing a second row.
    pub fn grant(
        &self,
        account_id: &str,
        amount: i64,
        kind: TransactionKind,
        description: Option<&str>,
        metadata: Option<TransactionMeta>,
    ) -> CoinResult<Receipt> {
        let entry = build_entry(account_id, amount, kind, description, metadata);
        let result = self.transact("grant", |tx| grant_in(tx, &entry, Utc::now()));
        log_outcome("Granted", &entry, &result);
        result
    }

    /// Debit an account. Rejected with `InsufficientBalance` and no
    /// transaction when the balance does not cover `amount`.
    pub fn spend(
        &self,
        account_id: &str,
        amount: i64,
        kind: TransactionKind,
        description: Option<&str>,
        metadata: Option<TransactionMeta>,
    ) -> CoinResult<Receipt> {
        let entry = build_entry(account_id, amount, kind, description, metadata);
        let result = self.transact("spend", |tx| spend_in(tx, &entry, Utc::now()));
        log_outcome("Spent", &entry, &result);
        result
    }

    pub fn refund(
        &self,
        account_id: &str,
        amount: i64,
        description: Option<&str>,
    ) -> CoinResult<Receipt> {
        self.grant(
            account_id,
            amount,
            TransactionKind::ForecastCancelled,
            description,
            None,
        )
    }

    /// Entry point for the payment webhook once a purchase is confirmed.
    /// Redelivery of the same `payment_ref` yields `AlreadyGranted`.
    pub fn credit_purchase(
        &self,
        account_id: &str,
        coins: i64,
        payment_ref: &str,
    ) -> CoinResult<Receipt> {
        self.grant(
            account_id,
            coins,
            TransactionKind::Purchase,
            Some("Coin purchase"),
            Some(TransactionMeta::Purchase {
                payment_ref: payment_ref.to_string(),
            }),
        )
    }

    pub fn balance_of(&self, account_id: &str) -> CoinResult<i64> {
        self.store.read(|tx| tx.balance(account_id))
    }

    /// Newest-first page of transactions. The cursor is the id of the last
    /// row of the previous page, so concurrent inserts never shift a page.
    pub fn history(&self, account_id: &str, query: &HistoryQuery) -> CoinResult<HistoryPage> {
        let limit = match query.limit {
            0 => self.config.history_page_max,
            n => n.min(self.config.history_page_max),
        };

        self.store.read(|tx| {
            tx.balance(account_id)?;
            let mut transactions = tx.transactions(
                account_id,
                query.cursor,
                query.kind.map(|k| k.as_str()),
                limit + 1,
            )?;

            let next_cursor = if transactions.len() > limit {
                transactions.truncate(limit);
                transactions.last().map(|t| t.id)
            } else {
                None
            };

            Ok(HistoryPage {
                transactions,
                next_cursor,
            })
        })
    }

    /// Recompute balance and lifetime earnings from the log and compare them
    /// with the cached account columns.
    pub fn audit(&self, account_id: &str) -> CoinResult<AuditReport> {
        self.store.read(|tx| audit_in(tx, account_id))
    }

    pub fn audit_all(&self) -> CoinResult<Vec<AuditReport>> {
        self.store.read(|tx| {
            tx.account_ids()?
                .iter()
                .map(|account_id| audit_in(tx, account_id))
                .collect()
        })
    }
}

fn audit_in(tx: &StoreTx<'_>, account_id: &str) -> CoinResult<AuditReport> {
    let account = tx
        .account(account_id)?
        .ok_or_else(|| CoinError::AccountNotFound(account_id.to_string()))?;
    let (ledger_balance, ledger_lifetime_earned, transaction_count) =
        tx.ledger_totals(account_id)?;

    Ok(AuditReport {
        account_id: account_id.to_string(),
        cached_balance: account.balance,
        ledger_balance,
        cached_lifetime_earned: account.lifetime_earned,
        ledger_lifetime_earned,
        transaction_count,
    })
}

fn build_entry(
    account_id: &str,
    amount: i64,
    kind: TransactionKind,
    description: Option<&str>,
    metadata: Option<TransactionMeta>,
) -> Entry {
    Entry {
        account_id: account_id.to_string(),
        amount,
        kind,
        description: description.map(str::to_string),
        metadata,
    }
}

fn log_outcome(verb: &str, entry: &Entry, result: &CoinResult<Receipt>) {
    match result {
        Ok(receipt) => info!(
            "{} {} coins ({}) for {}: balance {} (tx {})",
            verb,
            entry.amount,
            entry.kind,
            entry.account_id,
            receipt.new_balance,
            receipt.transaction_id
        ),
        Err(CoinError::AlreadyGranted { kind }) => {
            debug!("{} already granted to {}", kind, entry.account_id)
        }
        Err(err) => warn!(
            "{} {} coins ({}) for {} rejected: {}",
            verb, entry.amount, entry.kind, entry.account_id, err
        ),
    }
}
