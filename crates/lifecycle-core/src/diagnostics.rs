//! Per-run diagnostics report.
//!
//! Non-fatal problems are collected here instead of aborting the run. The
//! report is written next to the output tables, so everything in it is kept
//! in a deterministic order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calculations::{percent, ratio};

/// Reason an event record failed the input contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    InvalidJson,
    MissingField,
    BadTimestamp,
    TimestampOutOfRange,
    BadEntityType,
    BadLocation,
    BadEventType,
    DuplicateEventId,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationReason::InvalidJson => "invalid_json",
            ViolationReason::MissingField => "missing_field",
            ViolationReason::BadTimestamp => "bad_timestamp",
            ViolationReason::TimestampOutOfRange => "timestamp_out_of_range",
            ViolationReason::BadEntityType => "bad_entity_type",
            ViolationReason::BadLocation => "bad_location",
            ViolationReason::BadEventType => "bad_event_type",
            ViolationReason::DuplicateEventId => "duplicate_event_id",
        };
        f.write_str(s)
    }
}

/// Category of a non-fatal diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MissingUser,
    MissingAccount,
    ZeroSeats,
    InvalidTaxonomy,
    UnknownProduct,
    UnattributedProductEvent,
    FreshnessBreach,
    OutOfOrderEvent,
}

/// One non-fatal problem found during a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub subject: String,
    pub detail: String,
}

/// Input-contract outcome for the event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractSummary {
    pub total_records: u64,
    pub valid_records: u64,
    pub excluded_by_reason: BTreeMap<ViolationReason, u64>,
}

impl ContractSummary {
    pub fn record_violation(&mut self, reason: ViolationReason) {
        self.total_records += 1;
        *self.excluded_by_reason.entry(reason).or_insert(0) += 1;
    }

    pub fn record_valid(&mut self) {
        self.total_records += 1;
        self.valid_records += 1;
    }

    pub fn excluded(&self) -> u64 {
        self.total_records - self.valid_records
    }

    /// Unrounded share of records that passed, in `[0, 1]`. An empty log
    /// counts as fully compliant.
    pub fn compliance_ratio(&self) -> f64 {
        ratio(self.valid_records as f64, self.total_records as f64).unwrap_or(1.0)
    }

    /// [`Self::compliance_ratio`] as a percentage rounded for reporting.
    /// Compare against floors with the unrounded ratio.
    pub fn compliance_pct(&self) -> f64 {
        percent(self.valid_records as f64, self.total_records as f64).unwrap_or(100.0)
    }

    pub fn merge(&mut self, other: &ContractSummary) {
        self.total_records += other.total_records;
        self.valid_records += other.valid_records;
        for (reason, count) in &other.excluded_by_reason {
            *self.excluded_by_reason.entry(*reason).or_insert(0) += count;
        }
    }
}

/// Result of the freshness acceptance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessResult {
    pub newest_event_at: Option<DateTime<Utc>>,
    /// Age of the newest event at the as-of instant, in hours.
    pub age_hours: Option<f64>,
    pub max_hours: i64,
    pub passed: bool,
}

/// Everything a run wants to tell the operator without failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub contract: ContractSummary,
    pub compliance_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freshness: Option<FreshnessResult>,
    /// Occurrences per kind, including repeats collapsed out of `entries`.
    pub counts_by_kind: BTreeMap<DiagnosticKind, u64>,
    pub entries: BTreeSet<Diagnostic>,
}

impl DiagnosticsReport {
    pub fn new(contract: ContractSummary) -> Self {
        let compliance_pct = contract.compliance_pct();
        Self {
            contract,
            compliance_pct,
            ..Default::default()
        }
    }

    /// Record a diagnostic. Identical entries are kept once but counted
    /// every time.
    pub fn push(&mut self, kind: DiagnosticKind, subject: impl Into<String>, detail: impl Into<String>) {
        *self.counts_by_kind.entry(kind).or_insert(0) += 1;
        self.entries.insert(Diagnostic {
            kind,
            subject: subject.into(),
            detail: detail.into(),
        });
    }

    pub fn count(&self, kind: DiagnosticKind) -> u64 {
        self.counts_by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Fold another report's diagnostics into this one. Contract figures are
    /// left alone.
    pub fn absorb(&mut self, other: DiagnosticsReport) {
        for (kind, count) in other.counts_by_kind {
            *self.counts_by_kind.entry(kind).or_insert(0) += count;
        }
        self.entries.extend(other.entries);
    }

    pub fn is_clean(&self) -> bool {
        self.entries.is_empty() && self.contract.excluded() == 0
    }
}
