//! Session-scoped funnel analysis.
//!
//! Events are grouped by (entity, session, day). Within a group, step `k` is
//! reached by the first matching event at or after the moment step `k - 1`
//! was reached, so progression follows timestamp order.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use lifecycle_core::calculations::{percent, ratio, round4};
use lifecycle_core::config::FunnelConfig;
use lifecycle_core::models::{Event, Grain};
use lifecycle_core::time_utils::DayBucketer;
use serde::Serialize;
use tracing::debug;

use crate::aggregator::{MetricHorizon, HORIZON_PERIOD};

/// Per-group progress through one funnel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelRecord {
    pub funnel: String,
    pub entity_id: String,
    pub session_id: Option<String>,
    pub date: NaiveDate,
    /// Bit `k` set when step `k` (0-based) was reached.
    pub steps_bitset: u64,
    pub steps_reached: u32,
    pub steps: u32,
    pub completion_rate: f64,
}

impl FunnelRecord {
    pub fn reached(&self, step: usize) -> bool {
        step < 64 && self.steps_bitset & (1u64 << step) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelStepSummary {
    /// 1-based step position.
    pub step: u32,
    pub name: String,
    /// Distinct entities reaching this step.
    pub entities: u64,
    pub conversion_from_previous_pct: Option<f64>,
    pub conversion_from_first_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelSummaryRow {
    pub as_of_date: NaiveDate,
    pub funnel: String,
    /// `"YYYY-MM-DD"` for daily rows, `"18mo"` for the horizon-wide row.
    pub period: String,
    pub grain: Grain,
    pub steps: Vec<FunnelStepSummary>,
    /// Last step over first step.
    pub overall_conversion_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FunnelTables {
    pub records: Vec<FunnelRecord>,
    pub summary: Vec<FunnelSummaryRow>,
}

impl FunnelTables {
    fn extend(&mut self, other: FunnelTables) {
        self.records.extend(other.records);
        self.summary.extend(other.summary);
    }
}

/// Analyse every configured funnel over the detail horizon.
pub fn analyze_funnels(
    events: &[Event],
    funnels: &[FunnelConfig],
    horizon: &MetricHorizon,
    bucketer: &DayBucketer,
) -> FunnelTables {
    let mut tables = FunnelTables::default();
    for funnel in funnels {
        tables.extend(analyze_funnel(events, funnel, horizon, bucketer));
    }
    tables
}

type GroupKey<'a> = (&'a str, Option<&'a str>, NaiveDate);

pub fn analyze_funnel(
    events: &[Event],
    funnel: &FunnelConfig,
    horizon: &MetricHorizon,
    bucketer: &DayBucketer,
) -> FunnelTables {
    let step_count = funnel.steps.len().min(64);
    let relevant: HashSet<&str> = funnel
        .steps
        .iter()
        .take(step_count)
        .flat_map(|s| s.event_types.iter().map(String::as_str))
        .collect();

    // (next step, bitset) per group; events arrive in timestamp order.
    let mut groups: BTreeMap<GroupKey<'_>, (usize, u64)> = BTreeMap::new();
    for event in events {
        if !relevant.contains(event.event_type.as_str()) {
            continue;
        }
        let date = bucketer.day_of(event.timestamp);
        if date < horizon.detail_start || date > horizon.as_of_date {
            continue;
        }
        let key = (event.entity_id.as_str(), event.session_id.as_deref(), date);
        let (next, bits) = groups.entry(key).or_insert((0, 0));
        if *next < step_count
            && funnel.steps[*next]
                .event_types
                .iter()
                .any(|t| *t == event.event_type)
        {
            *bits |= 1u64 << *next;
            *next += 1;
        }
    }

    let days: Vec<NaiveDate> = horizon
        .spine
        .days()
        .iter()
        .copied()
        .filter(|d| *d >= horizon.detail_start)
        .collect();
    let mut daily: BTreeMap<NaiveDate, Vec<HashSet<&str>>> = days
        .iter()
        .map(|d| (*d, vec![HashSet::new(); step_count]))
        .collect();
    let mut overall: Vec<HashSet<&str>> = vec![HashSet::new(); step_count];

    let mut records = Vec::with_capacity(groups.len());
    for ((entity, session, date), (reached, bits)) in groups {
        for step in 0..reached {
            if let Some(sets) = daily.get_mut(&date) {
                sets[step].insert(entity);
            }
            overall[step].insert(entity);
        }
        records.push(FunnelRecord {
            funnel: funnel.name.clone(),
            entity_id: entity.to_string(),
            session_id: session.map(str::to_string),
            date,
            steps_bitset: bits,
            steps_reached: reached as u32,
            steps: step_count as u32,
            completion_rate: ratio(reached as f64, step_count as f64)
                .map(round4)
                .unwrap_or(0.0),
        });
    }

    let mut summary: Vec<FunnelSummaryRow> = daily
        .iter()
        .map(|(date, sets)| {
            summarize(funnel, horizon, date.to_string(), Grain::Daily, sets)
        })
        .collect();
    summary.push(summarize(
        funnel,
        horizon,
        HORIZON_PERIOD.to_string(),
        Grain::EighteenMonth,
        &overall,
    ));
    summary.sort_by(|a, b| a.period.cmp(&b.period));

    debug!(
        "Funnel {}: {} groups over {} days",
        funnel.name,
        records.len(),
        days.len()
    );
    FunnelTables { records, summary }
}

fn summarize(
    funnel: &FunnelConfig,
    horizon: &MetricHorizon,
    period: String,
    grain: Grain,
    reached: &[HashSet<&str>],
) -> FunnelSummaryRow {
    let counts: Vec<f64> = reached.iter().map(|s| s.len() as f64).collect();
    let first = counts.first().copied().unwrap_or(0.0);
    let steps = funnel
        .steps
        .iter()
        .zip(&counts)
        .enumerate()
        .map(|(k, (step, &count))| FunnelStepSummary {
            step: k as u32 + 1,
            name: step.name.clone(),
            entities: count as u64,
            conversion_from_previous_pct: k
                .checked_sub(1)
                .and_then(|prev| percent(count, counts[prev])),
            conversion_from_first_pct: percent(count, first),
        })
        .collect();
    let last = counts.last().copied().unwrap_or(0.0);

    FunnelSummaryRow {
        as_of_date: horizon.as_of_date,
        funnel: funnel.name.clone(),
        period,
        grain,
        steps,
        overall_conversion_pct: percent(last, first),
    }
}
