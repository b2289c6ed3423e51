use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub bonus: BonusConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub leaderboard: LeaderboardConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl SystemConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Extra attempts after a `StorageConflict` before giving up.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
    #[serde(default = "default_history_page_max")]
    pub history_page_max: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
            history_page_max: default_history_page_max(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Milestone {
    pub threshold: u8,
    pub amount: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BonusConfig {
    #[serde(default = "default_initial_balance")]
    pub initial_balance: i64,
    #[serde(default = "default_daily_login_amount")]
    pub daily_login_amount: i64,
    #[serde(default = "default_milestones")]
    pub milestones: Vec<Milestone>,
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            daily_login_amount: default_daily_login_amount(),
            milestones: default_milestones(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_min_stake")]
    pub min_stake: i64,
    #[serde(default = "default_max_stake")]
    pub max_stake: i64,
    #[serde(default = "default_win_multiplier")]
    pub win_multiplier: i64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            min_stake: default_min_stake(),
            max_stake: default_max_stake(),
            win_multiplier: default_win_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub csv_logging: bool,
    #[serde(default = "default_csv_log_path")]
    pub csv_log_path: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            csv_logging: false,
            csv_log_path: default_csv_log_path(),
        }
    }
}

fn default_database_path() -> String { "coins.db".to_string() }
fn default_busy_timeout_ms() -> u64 { 5_000 }
fn default_max_conflict_retries() -> u32 { 3 }
fn default_history_page_max() -> usize { 100 }
fn default_initial_balance() -> i64 { 100 }
fn default_daily_login_amount() -> i64 { 5 }
fn default_min_stake() -> i64 { 10 }
fn default_max_stake() -> i64 { 100 }
fn default_win_multiplier() -> i64 { 2 }
fn default_max_entries() -> usize { 50 }
fn default_csv_log_path() -> String { "ledger_audit.csv".to_string() }

fn default_milestones() -> Vec<Milestone> {
    vec![
        Milestone { threshold: 50, amount: 25 },
        Milestone { threshold: 60, amount: 50 },
        Milestone { threshold: 70, amount: 100 },
        Milestone { threshold: 80, amount: 200 },
        Milestone { threshold: 90, amount: 500 },
    ]
}

/// Environment overrides, read after `.env` is loaded.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub database_path: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(path) = &env.database_path {
            self.system.database_path = path.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bonus = &self.bonus;
        if bonus.initial_balance <= 0 || bonus.daily_login_amount <= 0 {
            anyhow::bail!("bonus amounts must be positive");
        }
        for milestone in &bonus.milestones {
            if milestone.threshold == 0 || milestone.threshold > 100 || milestone.amount <= 0 {
                anyhow::bail!(
                    "invalid milestone {}% -> {} coins",
                    milestone.threshold,
                    milestone.amount
                );
            }
        }
        for pair in bonus.milestones.windows(2) {
            if pair[1].threshold <= pair[0].threshold || pair[1].amount <= pair[0].amount {
                anyhow::bail!("milestones must be strictly increasing in threshold and amount");
            }
        }

        let forecast = &self.forecast;
        if forecast.min_stake <= 0 || forecast.max_stake < forecast.min_stake {
            anyhow::bail!(
                "invalid stake bounds [{}, {}]",
                forecast.min_stake,
                forecast.max_stake
            );
        }
        if forecast.win_multiplier < 1 {
            anyhow::bail!("win_multiplier must be at least 1");
        }
        if self.ledger.history_page_max == 0 || self.leaderboard.max_entries == 0 {
            anyhow::bail!("page sizes must be positive");
        }
        Ok(())
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: std::env::var("COIN_LEDGER_DB").ok(),
        })
    }
}
