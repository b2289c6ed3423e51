use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use coin_ledger::config::{Config, EnvConfig};
use coin_ledger::ledger::service::CoinLedger;
use coin_ledger::ledger::store::LedgerStore;
use coin_ledger::leaderboard::{LeaderboardService, RankBy};
use coin_ledger::monitoring::audit_log::AuditCsvLogger;

const DUE_PREVIEW: usize = 20;
const LEADERBOARD_PREVIEW: usize = 10;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Coin ledger maintenance starting...");

    // Load configuration
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "coins.toml".to_string());
    let mut config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        tracing::warn!("{} not found, using defaults", config_path);
        Config::default()
    };
    config.apply_env(&EnvConfig::load()?);

    tracing::info!("Database: {}", config.system.database_path);
    tracing::info!(
        "Stake bounds: [{}, {}], win multiplier {}x",
        config.forecast.min_stake,
        config.forecast.max_stake,
        config.forecast.win_multiplier
    );

    // SQLite work is blocking; keep it off the async workers.
    let mismatches = tokio::task::spawn_blocking(move || run_maintenance(&config))
        .await
        .context("maintenance task panicked")??;

    if mismatches > 0 {
        anyhow::bail!("ledger audit found {} inconsistent accounts", mismatches);
    }

    tracing::info!("✅ Ledger consistent");
    Ok(())
}

/// Audit every account and report what the resolution job has pending.
/// Returns the number of accounts whose cached columns disagree with the log.
fn run_maintenance(config: &Config) -> Result<usize> {
    let store = Arc::new(
        LedgerStore::open(&config.system.database_path, config.system.busy_timeout())
            .with_context(|| format!("Failed to open ledger: {}", config.system.database_path))?,
    );
    let ledger = CoinLedger::new(store.clone(), config.ledger.clone());

    let csv = if config.monitoring.csv_logging {
        Some(AuditCsvLogger::new(config.monitoring.csv_log_path.clone())?)
    } else {
        None
    };

    // 1. Balance == sum(transactions) for every account
    let reports = ledger.audit_all()?;
    let mut mismatches = 0;
    for report in &reports {
        if !report.is_consistent() {
            mismatches += 1;
            tracing::error!(
                "🔴 Ledger mismatch for {}: cached balance {} vs log {}, cached earned {} vs log {}",
                report.account_id,
                report.cached_balance,
                report.ledger_balance,
                report.cached_lifetime_earned,
                report.ledger_lifetime_earned
            );
        }
        if let Some(csv) = &csv {
            csv.log_report(report)?;
        }
    }
    tracing::info!("Audited {} accounts, {} mismatches", reports.len(), mismatches);
    if let Some(csv) = &csv {
        csv.log_event(&format!("audited {} accounts", reports.len()))?;
    }

    // 2. Forecasts waiting on the resolution job
    let due = store.read(|tx| tx.forecasts_due(Utc::now(), DUE_PREVIEW))?;
    tracing::info!("Forecasts due for resolution: {}", due.len());
    for forecast in &due {
        tracing::info!(
            "Due: forecast={} account={} target={} stake={} window_end={}",
            forecast.id,
            forecast.account_id,
            forecast.target_id,
            forecast.coins_staked,
            forecast.window_end.to_rfc3339()
        );
    }

    // 3. Leaderboard snapshot
    let leaderboard = LeaderboardService::new(store, config.leaderboard.clone());
    for entry in leaderboard.query(RankBy::Accuracy, LEADERBOARD_PREVIEW)? {
        tracing::info!(
            "#{} {} accuracy={:.1}% forecasts={} earned={}",
            entry.rank,
            entry.account_id,
            entry.forecast_accuracy,
            entry.total_forecasts,
            entry.lifetime_earned
        );
    }

    Ok(mismatches)
}
