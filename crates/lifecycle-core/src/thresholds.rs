//! Rule thresholds for the three lifecycle domains.
//!
//! Every boundary used by the classifiers lives here as a named default so a
//! deployment can override it from the engine config file without touching
//! rule code.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ── Shared constants ──────────────────────────────────────────────────────────

/// Days after creation during which a subject counts as new.
pub const DEFAULT_NEW_WINDOW_DAYS: i64 = 30;

/// A new subject stays new while it has fewer qualifying events than this.
pub const DEFAULT_NEW_MAX_QUALIFYING: u64 = 3;

/// A qualifying event at most this many days old keeps a subject active.
pub const DEFAULT_ACTIVE_WINDOW_DAYS: i64 = 30;

/// Last day (inclusive) of the dormant band; one day later is churned.
pub const DEFAULT_DORMANT_WINDOW_DAYS: i64 = 60;

/// Trailing window used for seat utilization and adoption breadth.
pub const DEFAULT_UTILIZATION_WINDOW_DAYS: i64 = 30;

// ── Recency thresholds ────────────────────────────────────────────────────────

/// Day boundaries for the recency-driven domains (platform and product).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecencyThresholds {
    pub new_window_days: i64,
    /// Only used by the platform domain.
    pub new_max_qualifying: u64,
    pub active_window_days: i64,
    pub dormant_window_days: i64,
}

impl Default for RecencyThresholds {
    fn default() -> Self {
        Self {
            new_window_days: DEFAULT_NEW_WINDOW_DAYS,
            new_max_qualifying: DEFAULT_NEW_MAX_QUALIFYING,
            active_window_days: DEFAULT_ACTIVE_WINDOW_DAYS,
            dormant_window_days: DEFAULT_DORMANT_WINDOW_DAYS,
        }
    }
}

impl RecencyThresholds {
    /// First day of the dormant band (`active_window_days + 1`).
    pub fn dormant_offset_days(&self) -> i64 {
        self.active_window_days + 1
    }

    /// First day of the churned band (`dormant_window_days + 1`).
    pub fn churn_offset_days(&self) -> i64 {
        self.dormant_window_days + 1
    }

    pub fn validate(&self, label: &str) -> Result<()> {
        if self.new_window_days < 0 || self.active_window_days < 0 {
            return Err(EngineError::Config(format!(
                "{label}: window lengths must not be negative"
            )));
        }
        if self.dormant_window_days <= self.active_window_days {
            return Err(EngineError::Config(format!(
                "{label}: dormant_window_days ({}) must exceed active_window_days ({})",
                self.dormant_window_days, self.active_window_days
            )));
        }
        Ok(())
    }
}

// ── Account thresholds ────────────────────────────────────────────────────────

/// Utilization percentages and day counts for the account rule set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountThresholds {
    pub utilization_window_days: i64,
    pub new_paid_window_days: i64,
    pub new_paid_min_utilization_pct: f64,
    pub expanding_min_utilization_pct: f64,
    /// Active users must exceed this share of seats to count as expanding.
    pub expanding_min_active_share_pct: f64,
    pub active_min_utilization_pct: f64,
    pub contracting_min_utilization_pct: f64,
    /// Below this utilization an account is at risk regardless of renewal.
    pub at_risk_max_utilization_pct: f64,
    /// Below this utilization an account close to renewal is at risk.
    pub renewal_at_risk_utilization_pct: f64,
    pub renewal_window_days: i64,
    /// Days past the renewal date after which the account is churned.
    pub overdue_churn_days: i64,
}

impl Default for AccountThresholds {
    fn default() -> Self {
        Self {
            utilization_window_days: DEFAULT_UTILIZATION_WINDOW_DAYS,
            new_paid_window_days: 90,
            new_paid_min_utilization_pct: 20.0,
            expanding_min_utilization_pct: 70.0,
            expanding_min_active_share_pct: 60.0,
            active_min_utilization_pct: 40.0,
            contracting_min_utilization_pct: 20.0,
            at_risk_max_utilization_pct: 30.0,
            renewal_at_risk_utilization_pct: 50.0,
            renewal_window_days: 30,
            overdue_churn_days: 61,
        }
    }
}

impl AccountThresholds {
    pub fn validate(&self) -> Result<()> {
        let ordered = self.contracting_min_utilization_pct <= self.active_min_utilization_pct
            && self.active_min_utilization_pct <= self.expanding_min_utilization_pct;
        if !ordered {
            return Err(EngineError::Config(
                "account: utilization bands must satisfy contracting <= active <= expanding"
                    .to_string(),
            ));
        }
        if self.utilization_window_days <= 0 {
            return Err(EngineError::Config(
                "account: utilization_window_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Health weights ────────────────────────────────────────────────────────────

/// Weights of the four components of the 0–100 account health score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub utilization: f64,
    pub adoption: f64,
    pub recent_activity: f64,
    pub contract: f64,
    /// Adoption breadth counted toward the score is capped at this many
    /// products.
    pub adoption_cap: u32,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            utilization: 25.0,
            adoption: 25.0,
            recent_activity: 25.0,
            contract: 25.0,
            adoption_cap: 5,
        }
    }
}

impl HealthWeights {
    pub fn total(&self) -> f64 {
        self.utilization + self.adoption + self.recent_activity + self.contract
    }

    pub fn validate(&self) -> Result<()> {
        if (self.total() - 100.0).abs() > 1e-6 {
            return Err(EngineError::Config(format!(
                "health weights must sum to 100, got {}",
                self.total()
            )));
        }
        if self.adoption_cap == 0 {
            return Err(EngineError::Config(
                "health adoption_cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
