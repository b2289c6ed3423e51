use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Position {
    Long,
    Short,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Long => "LONG",
            Position::Short => "SHORT",
        }
    }

    /// LONG wins at or above the target, SHORT strictly below it.
    pub fn wins(&self, target_value: i64, actual_value: i64) -> bool {
        match self {
            Position::Long => actual_value >= target_value,
            Position::Short => actual_value < target_value,
        }
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Position::Long),
            "SHORT" => Ok(Position::Short),
            other => Err(format!("unknown position: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForecastStatus {
    Pending,
    Won,
    Lost,
    Cancelled,
}

impl ForecastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastStatus::Pending => "PENDING",
            ForecastStatus::Won => "WON",
            ForecastStatus::Lost => "LOST",
            ForecastStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ForecastStatus::Pending)
    }
}

impl fmt::Display for ForecastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForecastStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ForecastStatus::Pending),
            "WON" => Ok(ForecastStatus::Won),
            "LOST" => Ok(ForecastStatus::Lost),
            "CANCELLED" => Ok(ForecastStatus::Cancelled),
            other => Err(format!("unknown forecast status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub id: i64,
    pub account_id: String,
    pub target_id: String,
    pub position: Position,
    pub target_value: i64,
    pub coins_staked: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: ForecastStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub actual_value: Option<i64>,
    pub coins_payout: Option<i64>,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewForecast {
    pub account_id: String,
    pub target_id: String,
    pub position: Position,
    pub target_value: i64,
    pub coins_staked: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Caller-facing request to place a forecast. The window comes from the target.
#[derive(Debug, Clone)]
pub struct PlaceForecast {
    pub account_id: String,
    pub target_id: String,
    pub position: Position,
    pub target_value: i64,
    pub coins_staked: i64,
}

/// Terminal write applied to a PENDING forecast row.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub status: ForecastStatus,
    pub actual_value: Option<i64>,
    pub coins_payout: Option<i64>,
    pub cancel_reason: Option<String>,
    pub resolved_at: DateTime<Utc>,
}
