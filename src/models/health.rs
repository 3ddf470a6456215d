//! Health classification derived from heartbeat age.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ThresholdConfig;

/// Liveness bucket, ordered by severity.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Heard from recently.
    #[default]
    Active,
    /// Quiet for longer than the stale threshold.
    Stale,
    /// Quiet long enough to need attention.
    Warning,
    /// Quiet long enough to be presumed hung.
    Stuck,
}

impl HealthState {
    /// Storage / wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Warning => "warning",
            Self::Stuck => "stuck",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "stale" => Some(Self::Stale),
            "warning" => Some(Self::Warning),
            "stuck" => Some(Self::Stuck),
            _ => None,
        }
    }

    /// Whether this bucket is surfaced as needing attention.
    #[must_use]
    pub fn needs_attention(self) -> bool {
        self >= Self::Warning
    }
}

/// Classify silence of `elapsed_minutes` against the configured thresholds.
#[must_use]
pub fn classify_minutes(elapsed_minutes: i64, thresholds: &ThresholdConfig) -> HealthState {
    let Ok(elapsed) = u64::try_from(elapsed_minutes) else {
        // Heartbeat in the future (clock skew) counts as fresh.
        return HealthState::Active;
    };
    if elapsed >= thresholds.stuck {
        HealthState::Stuck
    } else if elapsed >= thresholds.warning {
        HealthState::Warning
    } else if elapsed >= thresholds.stale {
        HealthState::Stale
    } else {
        HealthState::Active
    }
}

/// Classify an agent whose last heartbeat was at `last_heartbeat`.
#[must_use]
pub fn classify(
    now: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    thresholds: &ThresholdConfig,
) -> HealthState {
    classify_minutes((now - last_heartbeat).num_minutes(), thresholds)
}

/// Number of live agents per health bucket.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthCounts {
    /// Agents in `active`.
    pub active: usize,
    /// Agents in `stale`.
    pub stale: usize,
    /// Agents in `warning`.
    pub warning: usize,
    /// Agents in `stuck`.
    pub stuck: usize,
}

impl HealthCounts {
    /// Count one agent in `state`.
    pub fn record(&mut self, state: HealthState) {
        match state {
            HealthState::Active => self.active += 1,
            HealthState::Stale => self.stale += 1,
            HealthState::Warning => self.warning += 1,
            HealthState::Stuck => self.stuck += 1,
        }
    }

    /// Total number of agents counted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.active + self.stale + self.warning + self.stuck
    }
}
