use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// A forecastable entity as seen by the staking flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForecastTarget {
    pub target_id: String,
    pub accepts_forecasts: bool,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl ForecastTarget {
    /// Staking is open for `window_start <= now < window_end`.
    pub fn staking_open(&self, now: DateTime<Utc>) -> bool {
        self.window_start <= now && now < self.window_end
    }
}

/// Lookup seam for whatever owns targets (profiles, founder earnings feeds).
pub trait ForecastTargets: Send + Sync {
    fn lookup(&self, target_id: &str) -> Option<ForecastTarget>;
}

/// Concurrent in-memory directory the surrounding application keeps current.
#[derive(Default)]
pub struct InMemoryTargets {
    targets: DashMap<String, ForecastTarget>,
}

impl InMemoryTargets {
    pub fn new() -> Self {
        Self {
            targets: DashMap::new(),
        }
    }

    pub fn upsert(&self, target: ForecastTarget) {
        self.targets.insert(target.target_id.clone(), target);
    }

    /// Stop accepting new forecasts on a target (withdrawal, missing data).
    pub fn close(&self, target_id: &str) -> bool {
        match self.targets.get_mut(target_id) {
            Some(mut target) => {
                target.accepts_forecasts = false;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, target_id: &str) -> Option<ForecastTarget> {
        self.targets.remove(target_id).map(|(_, target)| target)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl ForecastTargets for InMemoryTargets {
    fn lookup(&self, target_id: &str) -> Option<ForecastTarget> {
        self.targets.get(target_id).map(|entry| entry.clone())
    }
}
