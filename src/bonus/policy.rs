use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};

use crate::config::{BonusConfig, Milestone};
use crate::error::{CoinError, CoinResult};
use crate::ledger::service::{grant_in, CoinLedger, Entry};
use crate::ledger::store::StoreTx;
use crate::ledger::types::{Receipt, TransactionKind, TransactionMeta};

/// Outcome of a bonus claim. A repeated claim is a success with no credit,
/// so client retries are safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BonusOutcome {
    Granted { amount: i64, receipt: Receipt },
    AlreadyClaimed { balance: i64 },
}

impl BonusOutcome {
    pub fn credited(&self) -> i64 {
        match self {
            BonusOutcome::Granted { amount, .. } => *amount,
            BonusOutcome::AlreadyClaimed { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MilestoneGrant {
    pub milestone: Milestone,
    pub receipt: Receipt,
}

/// won / (won + lost) * 100, absent until something has resolved.
pub fn accuracy(won: i64, lost: i64) -> Option<f64> {
    let resolved = won + lost;
    if resolved <= 0 {
        return None;
    }
    Some(won as f64 * 100.0 / resolved as f64)
}

/// The UTC calendar day a daily-login claim at `now` counts towards.
pub fn login_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// Milestones the accuracy currently meets, highest first.
pub fn qualifying_milestones(milestones: &[Milestone], accuracy: f64) -> Vec<Milestone> {
    let mut met: Vec<Milestone> = milestones
        .iter()
        .copied()
        .filter(|m| accuracy >= f64::from(m.threshold))
        .collect();
    met.sort_by(|a, b| b.threshold.cmp(&a.threshold));
    met
}

/// Grant the highest qualifying milestone that has not been granted yet, if
/// any. At most one milestone is granted per call; lower rungs already
/// passed are not back-filled by the same call.
///
/// The per-milestone uniqueness key makes the storage layer the judge of
/// "already granted", so this is safe under concurrent resolutions.
pub(crate) fn grant_milestone_in(
    tx: &StoreTx<'_>,
    milestones: &[Milestone],
    account_id: &str,
    accuracy: f64,
    now: DateTime<Utc>,
) -> CoinResult<Option<MilestoneGrant>> {
    for milestone in qualifying_milestones(milestones, accuracy) {
        let entry = Entry::new(account_id, milestone.amount, TransactionKind::AccuracyBonus)
            .describe(format!("{}% forecast accuracy milestone", milestone.threshold))
            .with_meta(TransactionMeta::AccuracyMilestone {
                milestone: milestone.threshold,
            });

        match grant_in(tx, &entry, now) {
            Ok(receipt) => {
                info!(
                    "Accuracy milestone {}% reached by {} ({:.1}%): +{} coins",
                    milestone.threshold, account_id, accuracy, milestone.amount
                );
                return Ok(Some(MilestoneGrant { milestone, receipt }));
            }
            Err(CoinError::AlreadyGranted { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

pub struct BonusPolicy {
    ledger: CoinLedger,
    config: BonusConfig,
}

impl BonusPolicy {
    pub fn new(ledger: CoinLedger, config: BonusConfig) -> Self {
        Self { ledger, config }
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.config.milestones
    }

    /// Open the account if needed and grant the welcome bonus, in one
    /// transaction. Safe to call on every authenticated action.
    pub fn on_first_action(&self, account_id: &str) -> CoinResult<BonusOutcome> {
        let entry = Entry::new(
            account_id,
            self.config.initial_balance,
            TransactionKind::WelcomeBonus,
        )
        .describe("Welcome bonus");

        let now = Utc::now();
        self.claim(account_id, &entry, now, |tx| {
            if tx.ensure_account(account_id, now)? {
                info!("Opened coin account {}", account_id);
            }
            Ok(())
        })
    }

    /// Grant the daily login bonus for the UTC day containing `now`. The row
    /// is written with `now`, so the day it counts towards is the day it
    /// carries.
    pub fn claim_daily_login(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> CoinResult<BonusOutcome> {
        let day = login_day(now);
        let entry = Entry::new(
            account_id,
            self.config.daily_login_amount,
            TransactionKind::DailyLogin,
        )
        .describe(format!("Daily login {}", day))
        .with_meta(TransactionMeta::DailyLogin { day });

        self.claim(account_id, &entry, now, |_| Ok(()))
    }

    /// Run the milestone check for an account's current stored accuracy.
    /// Resolutions already do this; this entry point serves backfills.
    pub fn check_accuracy_milestones(&self, account_id: &str) -> CoinResult<Option<MilestoneGrant>> {
        let milestones = &self.config.milestones;
        self.ledger.transact("accuracy_milestone", |tx| {
            let account = tx
                .account(account_id)?
                .ok_or_else(|| CoinError::AccountNotFound(account_id.to_string()))?;
            match account.forecast_accuracy {
                Some(accuracy) => {
                    grant_milestone_in(tx, milestones, account_id, accuracy, Utc::now())
                }
                None => Ok(None),
            }
        })
    }

    fn claim<P>(
        &self,
        account_id: &str,
        entry: &Entry,
        now: DateTime<Utc>,
        prepare: P,
    ) -> CoinResult<BonusOutcome>
    where
        P: Fn(&StoreTx<'_>) -> CoinResult<()>,
    {
        let result = self.ledger.transact("bonus", |tx| {
            prepare(tx)?;
            match grant_in(tx, entry, now) {
                Ok(receipt) => Ok(BonusOutcome::Granted {
                    amount: entry.amount,
                    receipt,
                }),
                Err(CoinError::AlreadyGranted { .. }) => Ok(BonusOutcome::AlreadyClaimed {
                    balance: tx.balance(account_id)?,
                }),
                Err(e) => Err(e),
            }
        })?;

        match &result {
            BonusOutcome::Granted { amount, receipt } => info!(
                "{} of {} coins granted to {}: balance {}",
                entry.kind, amount, account_id, receipt.new_balance
            ),
            BonusOutcome::AlreadyClaimed { .. } => {
                debug!("{} already claimed by {}", entry.kind, account_id)
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::ledger::store::LedgerStore;
    use crate::ledger::types::HistoryQuery;
    use chrono::TimeZone;
    use futures::future::join_all;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn temp_policy() -> (TempDir, CoinLedger, BonusPolicy) {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::open(dir.path().join("ledger.db"), Duration::from_secs(10)).unwrap();
        let ledger = CoinLedger::new(Arc::new(store), LedgerConfig::default());
        let policy = BonusPolicy::new(ledger.clone(), BonusConfig::default());
        (dir, ledger, policy)
    }

    fn count_kind(ledger: &CoinLedger, account_id: &str, kind: TransactionKind) -> usize {
        ledger
            .history(
                account_id,
                &HistoryQuery {
                    kind: Some(kind),
                    ..Default::default()
                },
            )
            .unwrap()
            .transactions
            .len()
    }

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(0, 0), None);
        assert_eq!(accuracy(7, 3), Some(70.0));
        assert_eq!(accuracy(3, 1), Some(75.0));
        assert_eq!(accuracy(0, 4), Some(0.0));
    }

    #[test]
    fn test_qualifying_milestones_descending() {
        let table = BonusConfig::default().milestones;
        let met: Vec<u8> = qualifying_milestones(&table, 72.5)
            .iter()
            .map(|m| m.threshold)
            .collect();
        assert_eq!(met, vec![70, 60, 50]);
        assert!(qualifying_milestones(&table, 49.9).is_empty());
    }

    #[test]
    fn test_login_day_is_utc() {
        let late = Utc.with_ymd_and_hms(2026, 10, 19, 23, 59, 59).unwrap();
        assert_eq!(login_day(late), NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
    }

    #[test]
    fn test_welcome_bonus_once() {
        let (_dir, ledger, policy) = temp_policy();

        let first = policy.on_first_action("alice").unwrap();
        assert_eq!(first.credited(), 100);
        let second = policy.on_first_action("alice").unwrap();
        assert_eq!(second, BonusOutcome::AlreadyClaimed { balance: 100 });

        assert_eq!(ledger.balance_of("alice").unwrap(), 100);
        assert_eq!(count_kind(&ledger, "alice", TransactionKind::WelcomeBonus), 1);
    }

    #[test]
    fn test_daily_login_once_per_utc_day() {
        let (_dir, ledger, policy) = temp_policy();
        policy.on_first_action("bob").unwrap();

        let morning = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2026, 10, 19, 23, 30, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2026, 10, 20, 0, 5, 0).unwrap();

        assert_eq!(policy.claim_daily_login("bob", morning).unwrap().credited(), 5);
        assert_eq!(policy.claim_daily_login("bob", night).unwrap().credited(), 0);
        assert_eq!(policy.claim_daily_login("bob", next_day).unwrap().credited(), 5);

        assert_eq!(count_kind(&ledger, "bob", TransactionKind::DailyLogin), 2);
        assert_eq!(ledger.balance_of("bob").unwrap(), 110);
    }

    #[test]
    fn test_daily_login_rows_carry_their_own_day() {
        let (_dir, ledger, policy) = temp_policy();
        policy.on_first_action("gary").unwrap();

        let now = Utc::now();
        for back in 0..3 {
            let at = now - chrono::Duration::days(back);
            assert_eq!(policy.claim_daily_login("gary", at).unwrap().credited(), 5);
        }

        // A backdated day written at the current instant is refused.
        for back in [10, 11] {
            let claimed = now.date_naive() - chrono::Days::new(back);
            let result = ledger.grant(
                "gary",
                5,
                TransactionKind::DailyLogin,
                None,
                Some(TransactionMeta::DailyLogin { day: claimed }),
            );
            assert!(matches!(result, Err(CoinError::DayMismatch { .. })));
        }

        let rows = ledger
            .history(
                "gary",
                &HistoryQuery {
                    kind: Some(TransactionKind::DailyLogin),
                    ..Default::default()
                },
            )
            .unwrap()
            .transactions;
        assert_eq!(rows.len(), 3);
        let mut days = Vec::new();
        for row in &rows {
            let day = row.created_at.date_naive();
            assert_eq!(row.metadata, Some(TransactionMeta::DailyLogin { day }));
            days.push(day);
        }
        days.dedup();
        assert_eq!(days.len(), 3);
        assert_eq!(ledger.balance_of("gary").unwrap(), 115);
    }

    #[test]
    fn test_daily_login_requires_account() {
        let (_dir, _ledger, policy) = temp_policy();
        let result = policy.claim_daily_login("ghost", Utc::now());
        assert!(matches!(result, Err(CoinError::AccountNotFound(_))));
    }

    #[test]
    fn test_milestone_grants_only_highest_new_rung() {
        let (_dir, ledger, policy) = temp_policy();
        policy.on_first_action("carol").unwrap();
        let table = policy.milestones().to_vec();

        // 0/0 -> 7 won / 3 lost in one step.
        let grant = ledger
            .transact("test", |tx| grant_milestone_in(tx, &table, "carol", 70.0, Utc::now()))
            .unwrap()
            .unwrap();
        assert_eq!(grant.milestone.threshold, 70);
        assert_eq!(grant.receipt.new_balance, 200);
        assert_eq!(count_kind(&ledger, "carol", TransactionKind::AccuracyBonus), 1);

        // The same accuracy again picks the next ungranted rung down.
        let again = ledger
            .transact("test", |tx| grant_milestone_in(tx, &table, "carol", 70.0, Utc::now()))
            .unwrap()
            .unwrap();
        assert_eq!(again.milestone.threshold, 60);
    }

    #[test]
    fn test_milestone_jump_to_ninety_five() {
        let (_dir, ledger, policy) = temp_policy();
        policy.on_first_action("dave").unwrap();
        let table = policy.milestones().to_vec();

        let grant = ledger
            .transact("test", |tx| grant_milestone_in(tx, &table, "dave", 95.0, Utc::now()))
            .unwrap()
            .unwrap();
        assert_eq!(grant.milestone.threshold, 90);
        assert_eq!(grant.milestone.amount, 500);
        assert_eq!(ledger.balance_of("dave").unwrap(), 600);
    }

    #[test]
    fn test_no_milestone_below_lowest_threshold() {
        let (_dir, ledger, policy) = temp_policy();
        policy.on_first_action("erin").unwrap();
        let table = policy.milestones().to_vec();

        let grant = ledger
            .transact("test", |tx| grant_milestone_in(tx, &table, "erin", 40.0, Utc::now()))
            .unwrap();
        assert!(grant.is_none());
        assert_eq!(policy.check_accuracy_milestones("erin").unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_daily_claims_grant_once() {
        let (_dir, ledger, policy) = temp_policy();
        policy.on_first_action("frank").unwrap();
        let policy = Arc::new(policy);
        let now = Utc::now();

        let tasks = (0..8).map(|_| {
            let policy = policy.clone();
            tokio::task::spawn_blocking(move || policy.claim_daily_login("frank", now))
        });
        let credited: i64 = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().credited())
            .sum();

        assert_eq!(credited, 5);
        assert_eq!(count_kind(&ledger, "frank", TransactionKind::DailyLogin), 1);
        assert_eq!(ledger.balance_of("frank").unwrap(), 105);
    }
}
