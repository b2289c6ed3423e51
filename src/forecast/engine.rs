use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::bonus::policy::{accuracy, grant_milestone_in, MilestoneGrant};
use crate::config::{ForecastConfig, Milestone};
use crate::error::{CoinError, CoinResult};
use crate::forecast::targets::ForecastTargets;
use crate::forecast::types::{
    Forecast, ForecastStatus, NewForecast, PlaceForecast, Settlement,
};
use crate::ledger::service::{grant_in, spend_in, CoinLedger, Entry};
use crate::ledger::store::StoreTx;
use crate::ledger::types::{Receipt, TransactionKind, TransactionMeta};

/// Everything a WON/LOST resolution changed.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub forecast: Forecast,
    pub payout: Option<Receipt>,
    pub accuracy: Option<f64>,
    pub milestone: Option<MilestoneGrant>,
}

/// Owns the forecast lifecycle: PENDING -> WON | LOST | CANCELLED.
pub struct ForecastEngine {
    ledger: CoinLedger,
    targets: Arc<dyn ForecastTargets>,
    config: ForecastConfig,
    milestones: Vec<Milestone>,
}

impl ForecastEngine {
    pub fn new(
        ledger: CoinLedger,
        targets: Arc<dyn ForecastTargets>,
        config: ForecastConfig,
        milestones: Vec<Milestone>,
    ) -> Self {
        Self {
            ledger,
            targets,
            config,
            milestones,
        }
    }

    /// Place a forecast and escrow its stake. The forecast row and the stake
    /// debit commit together or not at all.
    pub fn place(&self, request: &PlaceForecast, now: DateTime<Utc>) -> CoinResult<Forecast> {
        // 1. Stake bounds
        if request.coins_staked < self.config.min_stake
            || request.coins_staked > self.config.max_stake
        {
            return Err(CoinError::InvalidAmount(format!(
                "stake {} outside [{}, {}]",
                request.coins_staked, self.config.min_stake, self.config.max_stake
            )));
        }

        // 2. Target and window
        let target = self
            .targets
            .lookup(&request.target_id)
            .filter(|t| t.accepts_forecasts)
            .ok_or_else(|| CoinError::TargetUnavailable(request.target_id.clone()))?;
        if !target.staking_open(now) {
            return Err(CoinError::StakingClosed(request.target_id.clone()));
        }

        let new_forecast = NewForecast {
            account_id: request.account_id.clone(),
            target_id: request.target_id.clone(),
            position: request.position,
            target_value: request.target_value,
            coins_staked: request.coins_staked,
            window_start: target.window_start,
            window_end: target.window_end,
        };

        // 3. Forecast row + stake debit
        let forecast = self.ledger.transact("place_forecast", |tx| {
            tx.balance(&new_forecast.account_id)?;
            let forecast_id = tx.insert_forecast(&new_forecast, now)?;

            let stake = Entry::new(
                &new_forecast.account_id,
                new_forecast.coins_staked,
                TransactionKind::ForecastStake,
            )
            .describe(format!("Stake on {}", new_forecast.target_id))
            .with_meta(TransactionMeta::Forecast { forecast_id });
            spend_in(tx, &stake, now)?;

            load(tx, forecast_id)
        })?;

        info!(
            "Forecast {} placed by {}: {} {} on {} ({} coins)",
            forecast.id,
            forecast.account_id,
            forecast.position.as_str(),
            forecast.target_value,
            forecast.target_id,
            forecast.coins_staked
        );
        Ok(forecast)
    }

    /// Resolve a PENDING forecast once its window has closed. The outcome is
    /// decided from the recorded position against `actual_value`.
    pub fn resolve(
        &self,
        forecast_id: i64,
        actual_value: i64,
        now: DateTime<Utc>,
    ) -> CoinResult<Resolution> {
        let resolution = self.ledger.transact("resolve_forecast", |tx| {
            let forecast = load_pending(tx, forecast_id)?;
            if now < forecast.window_end {
                return Err(CoinError::WindowStillOpen(forecast_id));
            }

            let won = forecast.position.wins(forecast.target_value, actual_value);
            let payout = if won {
                let amount = forecast.coins_staked * self.config.win_multiplier;
                let entry = Entry::new(&forecast.account_id, amount, TransactionKind::ForecastPayout)
                    .describe(format!("Forecast {} won", forecast_id))
                    .with_meta(TransactionMeta::Forecast { forecast_id });
                Some(grant_in(tx, &entry, now)?)
            } else {
                None
            };

            let settlement = Settlement {
                status: if won {
                    ForecastStatus::Won
                } else {
                    ForecastStatus::Lost
                },
                actual_value: Some(actual_value),
                coins_payout: payout.map(|_| forecast.coins_staked * self.config.win_multiplier),
                cancel_reason: None,
                resolved_at: now,
            };
            settle(tx, &forecast, &settlement)?;

            // Accuracy over every resolved forecast of the account.
            let (won_count, lost_count) = tx.resolved_counts(&forecast.account_id)?;
            let accuracy = accuracy(won_count, lost_count);
            tx.update_forecast_stats(&forecast.account_id, won_count + lost_count, won_count, accuracy)?;

            let milestone = match accuracy {
                Some(value) => {
                    grant_milestone_in(tx, &self.milestones, &forecast.account_id, value, now)?
                }
                None => None,
            };

            Ok(Resolution {
                forecast: load(tx, forecast_id)?,
                payout,
                accuracy,
                milestone,
            })
        })?;

        info!(
            "Forecast {} resolved {} (actual {}, payout {:?}, accuracy {:?})",
            forecast_id,
            resolution.forecast.status,
            actual_value,
            resolution.forecast.coins_payout,
            resolution.accuracy
        );
        Ok(resolution)
    }

    /// Cancel a PENDING forecast for operational reasons and refund the stake.
    pub fn cancel(&self, forecast_id: i64, reason: &str, now: DateTime<Utc>) -> CoinResult<Forecast> {
        let forecast = self.ledger.transact("cancel_forecast", |tx| {
            let forecast = load_pending(tx, forecast_id)?;

            let refund = Entry::new(
                &forecast.account_id,
                forecast.coins_staked,
                TransactionKind::ForecastCancelled,
            )
            .describe(format!("Forecast {} cancelled: {}", forecast_id, reason))
            .with_meta(TransactionMeta::Forecast { forecast_id });
            grant_in(tx, &refund, now)?;

            let settlement = Settlement {
                status: ForecastStatus::Cancelled,
                actual_value: None,
                coins_payout: None,
                cancel_reason: Some(reason.to_string()),
                resolved_at: now,
            };
            settle(tx, &forecast, &settlement)?;
            load(tx, forecast_id)
        })?;

        info!(
            "Forecast {} cancelled ({}), refunded {} coins to {}",
            forecast_id, reason, forecast.coins_staked, forecast.account_id
        );
        Ok(forecast)
    }

    pub fn forecast(&self, forecast_id: i64) -> CoinResult<Forecast> {
        self.ledger.store().read(|tx| load(tx, forecast_id))
    }

    /// PENDING forecasts the resolution job should pick up, oldest window first.
    pub fn due_for_resolution(&self, now: DateTime<Utc>, limit: usize) -> CoinResult<Vec<Forecast>> {
        self.ledger.store().read(|tx| tx.forecasts_due(now, limit))
    }

    pub fn forecasts_for(
        &self,
        account_id: &str,
        status: Option<ForecastStatus>,
    ) -> CoinResult<Vec<Forecast>> {
        self.ledger.store().read(|tx| tx.forecasts_for(account_id, status))
    }
}

fn load(tx: &StoreTx<'_>, forecast_id: i64) -> CoinResult<Forecast> {
    tx.forecast(forecast_id)?
        .ok_or(CoinError::ForecastNotFound(forecast_id))
}

fn load_pending(tx: &StoreTx<'_>, forecast_id: i64) -> CoinResult<Forecast> {
    let forecast = load(tx, forecast_id)?;
    if forecast.status.is_terminal() {
        return Err(CoinError::InvalidState {
            forecast_id,
            status: forecast.status,
        });
    }
    Ok(forecast)
}

fn settle(tx: &StoreTx<'_>, forecast: &Forecast, settlement: &Settlement) -> CoinResult<()> {
    if !tx.settle_forecast(forecast.id, settlement)? {
        return Err(CoinError::InvalidState {
            forecast_id: forecast.id,
            status: forecast.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonus::policy::BonusPolicy;
    use crate::config::{BonusConfig, LedgerConfig};
    use crate::forecast::targets::{ForecastTarget, InMemoryTargets};
    use crate::forecast::types::Position;
    use crate::ledger::store::LedgerStore;
    use crate::ledger::types::HistoryQuery;
    use chrono::Duration;
    use futures::future::join_all;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ledger: CoinLedger,
        bonus: BonusPolicy,
        targets: Arc<InMemoryTargets>,
        engine: Arc<ForecastEngine>,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store =
                LedgerStore::open(dir.path().join("ledger.db"), std::time::Duration::from_secs(10))
                    .unwrap();
            let ledger = CoinLedger::new(Arc::new(store), LedgerConfig::default());
            let bonus_config = BonusConfig::default();
            let bonus = BonusPolicy::new(ledger.clone(), bonus_config.clone());

            let now = Utc::now();
            let targets = Arc::new(InMemoryTargets::new());
            targets.upsert(ForecastTarget {
                target_id: "founder-1".to_string(),
                accepts_forecasts: true,
                window_start: now - Duration::days(1),
                window_end: now + Duration::days(1),
            });

            let engine = ForecastEngine::new(
                ledger.clone(),
                targets.clone(),
                ForecastConfig::default(),
                bonus_config.milestones,
            );

            Self {
                _dir: dir,
                ledger,
                bonus,
                targets,
                engine: Arc::new(engine),
                now,
            }
        }

        fn after_window(&self) -> DateTime<Utc> {
            self.now + Duration::days(2)
        }

        fn account(&self, account_id: &str) {
            self.bonus.on_first_action(account_id).unwrap();
        }

        fn place(&self, account_id: &str, position: Position, stake: i64) -> CoinResult<Forecast> {
            self.engine.place(
                &PlaceForecast {
                    account_id: account_id.to_string(),
                    target_id: "founder-1".to_string(),
                    position,
                    target_value: 10_000,
                    coins_staked: stake,
                },
                self.now,
            )
        }

        fn transaction_count(&self, account_id: &str) -> usize {
            self.ledger
                .history(account_id, &HistoryQuery::default())
                .unwrap()
                .transactions
                .len()
        }
    }

    #[test]
    fn test_place_escrows_stake() {
        let fx = Fixture::new();
        fx.account("alice");

        let forecast = fx.place("alice", Position::Long, 10).unwrap();
        assert_eq!(forecast.status, ForecastStatus::Pending);
        assert_eq!(forecast.coins_staked, 10);
        assert_eq!(fx.ledger.balance_of("alice").unwrap(), 90);

        let page = fx.ledger.history("alice", &HistoryQuery::default()).unwrap();
        assert_eq!(page.transactions[0].kind, TransactionKind::ForecastStake);
        assert_eq!(page.transactions[0].amount, -10);
        assert_eq!(
            page.transactions[0].metadata,
            Some(TransactionMeta::Forecast {
                forecast_id: forecast.id
            })
        );
    }

    #[test]
    fn test_place_without_funds_leaves_no_trace() {
        let fx = Fixture::new();
        fx.account("bob");
        fx.place("bob", Position::Long, 100).unwrap();

        let result = fx.place("bob", Position::Short, 50);
        assert!(matches!(result, Err(CoinError::InsufficientBalance { .. })));
        assert_eq!(fx.ledger.balance_of("bob").unwrap(), 0);
        assert_eq!(fx.engine.forecasts_for("bob", None).unwrap().len(), 1);
        assert_eq!(fx.transaction_count("bob"), 2);
    }

    #[test]
    fn test_place_validations() {
        let fx = Fixture::new();
        fx.account("carol");

        assert!(matches!(
            fx.place("carol", Position::Long, 9),
            Err(CoinError::InvalidAmount(_))
        ));
        assert!(matches!(
            fx.place("carol", Position::Long, 101),
            Err(CoinError::InvalidAmount(_))
        ));
        assert!(matches!(
            fx.place("ghost", Position::Long, 10),
            Err(CoinError::AccountNotFound(_))
        ));

        let late = fx.engine.place(
            &PlaceForecast {
                account_id: "carol".to_string(),
                target_id: "founder-1".to_string(),
                position: Position::Long,
                target_value: 1,
                coins_staked: 10,
            },
            fx.after_window(),
        );
        assert!(matches!(late, Err(CoinError::StakingClosed(_))));

        fx.targets.close("founder-1");
        assert!(matches!(
            fx.place("carol", Position::Long, 10),
            Err(CoinError::TargetUnavailable(_))
        ));
        assert_eq!(fx.ledger.balance_of("carol").unwrap(), 100);
        assert!(fx.engine.forecasts_for("carol", None).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_won_pays_double() {
        let fx = Fixture::new();
        fx.account("dave");
        let forecast = fx.place("dave", Position::Long, 10).unwrap();

        let resolution = fx.engine.resolve(forecast.id, 12_000, fx.after_window()).unwrap();
        assert_eq!(resolution.forecast.status, ForecastStatus::Won);
        assert_eq!(resolution.forecast.actual_value, Some(12_000));
        assert_eq!(resolution.forecast.coins_payout, Some(20));
        assert!(resolution.forecast.resolved_at.is_some());
        assert_eq!(resolution.payout.unwrap().new_balance, 110);
        assert_eq!(resolution.accuracy, Some(100.0));

        // First resolution at 100% reaches the top milestone only.
        let milestone = resolution.milestone.unwrap();
        assert_eq!(milestone.milestone.threshold, 90);
        assert_eq!(fx.ledger.balance_of("dave").unwrap(), 610);

        let account = fx.ledger.account("dave").unwrap();
        assert_eq!(account.total_forecasts, 1);
        assert_eq!(account.won_forecasts, 1);
        assert!(fx.ledger.audit("dave").unwrap().is_consistent());
    }

    #[test]
    fn test_resolve_lost_keeps_stake() {
        let fx = Fixture::new();
        fx.account("erin");
        let forecast = fx.place("erin", Position::Long, 40).unwrap();
        let before = fx.transaction_count("erin");

        let resolution = fx.engine.resolve(forecast.id, 9_999, fx.after_window()).unwrap();
        assert_eq!(resolution.forecast.status, ForecastStatus::Lost);
        assert!(resolution.payout.is_none());
        assert_eq!(resolution.forecast.coins_payout, None);
        assert_eq!(resolution.accuracy, Some(0.0));
        assert!(resolution.milestone.is_none());
        assert_eq!(fx.ledger.balance_of("erin").unwrap(), 60);
        assert_eq!(fx.transaction_count("erin"), before);
    }

    #[test]
    fn test_short_position_outcome() {
        let fx = Fixture::new();
        fx.account("frank");
        let forecast = fx.place("frank", Position::Short, 20).unwrap();

        let resolution = fx.engine.resolve(forecast.id, 5_000, fx.after_window()).unwrap();
        assert_eq!(resolution.forecast.status, ForecastStatus::Won);
        assert_eq!(resolution.forecast.coins_payout, Some(40));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let fx = Fixture::new();
        fx.account("gina");
        let won = fx.place("gina", Position::Long, 10).unwrap();
        let cancelled = fx.place("gina", Position::Long, 10).unwrap();

        fx.engine.resolve(won.id, 20_000, fx.after_window()).unwrap();
        fx.engine.cancel(cancelled.id, "target withdrew", fx.now).unwrap();
        let count = fx.transaction_count("gina");
        let balance = fx.ledger.balance_of("gina").unwrap();

        assert!(matches!(
            fx.engine.resolve(won.id, 0, fx.after_window()),
            Err(CoinError::InvalidState {
                status: ForecastStatus::Won,
                ..
            })
        ));
        assert!(matches!(
            fx.engine.cancel(won.id, "late", fx.after_window()),
            Err(CoinError::InvalidState { .. })
        ));
        assert!(matches!(
            fx.engine.resolve(cancelled.id, 20_000, fx.after_window()),
            Err(CoinError::InvalidState {
                status: ForecastStatus::Cancelled,
                ..
            })
        ));
        assert_eq!(fx.transaction_count("gina"), count);
        assert_eq!(fx.ledger.balance_of("gina").unwrap(), balance);
    }

    #[test]
    fn test_cancel_refunds_stake() {
        let fx = Fixture::new();
        fx.account("hank");
        let forecast = fx.place("hank", Position::Long, 30).unwrap();
        assert_eq!(fx.ledger.balance_of("hank").unwrap(), 70);

        let cancelled = fx.engine.cancel(forecast.id, "data unavailable", fx.now).unwrap();
        assert_eq!(cancelled.status, ForecastStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("data unavailable"));
        assert_eq!(fx.ledger.balance_of("hank").unwrap(), 100);

        // Cancellation does not count towards accuracy.
        let account = fx.ledger.account("hank").unwrap();
        assert_eq!(account.total_forecasts, 0);
        assert_eq!(account.forecast_accuracy, None);
    }

    #[test]
    fn test_resolve_before_window_end() {
        let fx = Fixture::new();
        fx.account("ivy");
        let forecast = fx.place("ivy", Position::Long, 10).unwrap();

        assert!(matches!(
            fx.engine.resolve(forecast.id, 1, fx.now),
            Err(CoinError::WindowStillOpen(_))
        ));
        assert_eq!(fx.engine.forecast(forecast.id).unwrap().status, ForecastStatus::Pending);
        assert!(matches!(
            fx.engine.resolve(9_999, 1, fx.after_window()),
            Err(CoinError::ForecastNotFound(9_999))
        ));
    }

    #[test]
    fn test_due_for_resolution() {
        let fx = Fixture::new();
        fx.account("jack");
        let first = fx.place("jack", Position::Long, 10).unwrap();
        let second = fx.place("jack", Position::Short, 10).unwrap();

        assert!(fx.engine.due_for_resolution(fx.now, 10).unwrap().is_empty());

        let due = fx.engine.due_for_resolution(fx.after_window(), 10).unwrap();
        let ids: Vec<i64> = due.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);

        fx.engine.resolve(first.id, 0, fx.after_window()).unwrap();
        let due = fx.engine.due_for_resolution(fx.after_window(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(
            fx.engine
                .forecasts_for("jack", Some(ForecastStatus::Lost))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_accuracy_tracks_all_resolved_forecasts() {
        let fx = Fixture::new();
        fx.account("kate");
        fx.ledger.credit_purchase("kate", 1_000, "pi_kate").unwrap();

        let outcomes = [true, false, true, true];
        for won in outcomes {
            let forecast = fx.place("kate", Position::Long, 10).unwrap();
            let actual = if won { 10_000 } else { 0 };
            fx.engine.resolve(forecast.id, actual, fx.after_window()).unwrap();
        }

        let account = fx.ledger.account("kate").unwrap();
        assert_eq!(account.total_forecasts, 4);
        assert_eq!(account.won_forecasts, 3);
        assert_eq!(account.lost_forecasts(), 1);
        assert_eq!(account.forecast_accuracy, Some(75.0));
        assert!(fx.ledger.audit("kate").unwrap().is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolution_pays_once() {
        let fx = Fixture::new();
        fx.account("liam");
        let forecast = fx.place("liam", Position::Long, 50).unwrap();
        let at = fx.after_window();

        let tasks = (0..6).map(|_| {
            let engine = fx.engine.clone();
            let id = forecast.id;
            tokio::task::spawn_blocking(move || engine.resolve(id, 20_000, at))
        });
        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let resolved = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(resolved, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, CoinError::InvalidState { .. })));

        let payouts = fx
            .ledger
            .history(
                "liam",
                &HistoryQuery {
                    kind: Some(TransactionKind::ForecastPayout),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(payouts.transactions.len(), 1);
        assert!(fx.ledger.audit("liam").unwrap().is_consistent());
    }
}
