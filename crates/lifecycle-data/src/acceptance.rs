//! Operational acceptance checks: freshness and input contract compliance.

use chrono::{DateTime, Utc};
use lifecycle_core::calculations::round2;
use lifecycle_core::config::ValidationConfig;
use lifecycle_core::diagnostics::{ContractSummary, FreshnessResult};
use lifecycle_core::error::{EngineError, Result};
use lifecycle_core::models::Event;
use serde::Serialize;
use tracing::{info, warn};

/// Age of the newest accepted event at `as_of`, against `max_hours`.
///
/// An empty log fails the check.
pub fn check_freshness(events: &[Event], as_of: DateTime<Utc>, max_hours: i64) -> FreshnessResult {
    let newest = events.iter().map(|e| e.timestamp).max();
    let age_seconds = newest.map(|t| (as_of - t).num_seconds());
    let passed = age_seconds.is_some_and(|age| age <= max_hours * 3600);
    let age_hours = age_seconds.map(|age| round2(age as f64 / 3600.0));
    FreshnessResult {
        newest_event_at: newest,
        age_hours,
        max_hours,
        passed,
    }
}

/// Fail with [`EngineError::InputContract`] when compliance is under the
/// configured floor.
pub fn check_compliance(contract: &ContractSummary, validation: &ValidationConfig) -> Result<()> {
    if contract.compliance_ratio() < validation.compliance_floor {
        return Err(EngineError::InputContract {
            compliance_pct: contract.compliance_pct(),
            floor_pct: round2(validation.compliance_floor * 100.0),
            excluded: contract.excluded(),
            total: contract.total_records,
        });
    }
    Ok(())
}

/// Outcome of `check` mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptanceReport {
    pub as_of: DateTime<Utc>,
    pub freshness: FreshnessResult,
    pub compliance_pct: f64,
    pub compliance_floor_pct: f64,
    pub compliance_passed: bool,
    pub contract: ContractSummary,
}

impl AcceptanceReport {
    pub fn passed(&self) -> bool {
        self.freshness.passed && self.compliance_passed
    }
}

/// Run both checks without failing on either.
pub fn run_acceptance(
    events: &[Event],
    contract: &ContractSummary,
    validation: &ValidationConfig,
    as_of: DateTime<Utc>,
) -> AcceptanceReport {
    let freshness = check_freshness(events, as_of, validation.freshness_max_hours);
    let compliance = check_compliance(contract, validation);
    if let Err(e) = &compliance {
        warn!("{}", e);
    }
    if !freshness.passed {
        warn!(
            "Freshness check failed: newest event {:?} is {:?} hours old (max {})",
            freshness.newest_event_at, freshness.age_hours, freshness.max_hours
        );
    }

    let report = AcceptanceReport {
        as_of,
        freshness,
        compliance_pct: contract.compliance_pct(),
        compliance_floor_pct: round2(validation.compliance_floor * 100.0),
        compliance_passed: compliance.is_ok(),
        contract: contract.clone(),
    };
    info!(
        "Acceptance: freshness {}, compliance {:.2}% ({})",
        if report.freshness.passed { "ok" } else { "failed" },
        report.compliance_pct,
        if report.compliance_passed { "ok" } else { "failed" }
    );
    report
}
