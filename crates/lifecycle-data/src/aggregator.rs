//! Windowed metrics over the calendar spine.
//!
//! [`DailyBase`] reduces the event log to dense per-day figures once. The
//! three dashboard scopes (overall, segment, activity) are derived from it
//! and from the events independently of each other.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, Duration, NaiveDate};
use lifecycle_core::calculations::{rank_desc, rolling_averages, rolling_sums, share_pct, Growth};
use lifecycle_core::calendar::CalendarSpine;
use lifecycle_core::config::MetricsConfig;
use lifecycle_core::error::Result;
use lifecycle_core::models::{EntityType, Event, Grain, Location};
use lifecycle_core::time_utils::{month_end, month_key, months_back, DayBucketer};
use serde::Serialize;
use tracing::debug;

use crate::directory::EntityDirectory;

/// Segment key used when reference data is missing.
pub const UNKNOWN_SEGMENT: &str = "unknown";

// ── Horizon ───────────────────────────────────────────────────────────────────

/// Date ranges covered by one run's metrics.
#[derive(Debug, Clone)]
pub struct MetricHorizon {
    pub as_of_date: NaiveDate,
    /// First day of the segment and activity scopes (month-aligned).
    pub detail_start: NaiveDate,
    /// First day reported in the overall scope.
    pub overall_start: NaiveDate,
    /// Dense spine from the earliest reported day minus lookback to
    /// `as_of_date`.
    pub spine: CalendarSpine,
}

impl MetricHorizon {
    pub fn new(as_of_date: NaiveDate, metrics: &MetricsConfig) -> Result<Self> {
        let detail_start = months_back(as_of_date, metrics.detail_months.saturating_sub(1));
        let overall_start = as_of_date - Duration::days(i64::from(metrics.overall_days) - 1);
        let spine_start =
            detail_start.min(overall_start) - Duration::days(i64::from(metrics.lookback_days()));
        let spine = CalendarSpine::generate(spine_start, as_of_date)?;
        spine.ensure_covers(spine_start, as_of_date)?;
        Ok(Self {
            as_of_date,
            detail_start,
            overall_start,
            spine,
        })
    }

    /// Spine indices of `start..=as_of_date`.
    fn reported_indices(&self, start: NaiveDate) -> std::ops::Range<usize> {
        let first = self.spine.index_of(start).unwrap_or(0);
        first..self.spine.len()
    }

    /// Month starts of the detail horizon, oldest first.
    pub fn months(&self) -> Vec<NaiveDate> {
        let mut months = Vec::new();
        let mut m = self.detail_start;
        while m <= self.as_of_date {
            months.push(m);
            match m.checked_add_months(chrono::Months::new(1)) {
                Some(next) => m = next,
                None => break,
            }
        }
        months
    }
}

// ── Daily base ────────────────────────────────────────────────────────────────

/// Per-day count and distinct-entity count for one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySeries {
    pub counts: Vec<u64>,
    pub distinct_entities: Vec<u64>,
}

impl KeySeries {
    fn zeroed(len: usize) -> Self {
        Self {
            counts: vec![0; len],
            distinct_entities: vec![0; len],
        }
    }
}

/// Dense per-day aggregates, one slot per spine day.
#[derive(Debug, Clone, Default)]
pub struct DailyBase {
    /// Distinct users with any event.
    pub dau: Vec<u64>,
    /// Distinct users over the trailing short window.
    pub wau: Vec<u64>,
    /// Distinct users over the trailing long window.
    pub mau: Vec<u64>,
    /// Distinct entities of any type with any event.
    pub active_entities: Vec<u64>,
    pub qualifying_users: Vec<u64>,
    pub events: Vec<u64>,
    pub qualifying_events: Vec<u64>,
    /// Distinct (entity, session) pairs.
    pub sessions: Vec<u64>,
    pub event_types: BTreeMap<String, KeySeries>,
    pub locations: BTreeMap<String, KeySeries>,
}

impl DailyBase {
    pub fn build(
        events: &[Event],
        horizon: &MetricHorizon,
        bucketer: &DayBucketer,
        metrics: &MetricsConfig,
    ) -> Self {
        let n = horizon.spine.len();
        let mut base = DailyBase {
            dau: vec![0; n],
            active_entities: vec![0; n],
            qualifying_users: vec![0; n],
            events: vec![0; n],
            qualifying_events: vec![0; n],
            sessions: vec![0; n],
            locations: Location::ALL
                .iter()
                .map(|l| (l.as_str().to_string(), KeySeries::zeroed(n)))
                .collect(),
            ..Default::default()
        };

        let mut user_days: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut day_users: HashSet<(usize, &str)> = HashSet::new();
        let mut day_entities: HashSet<(usize, EntityType, &str)> = HashSet::new();
        let mut day_qualifying: HashSet<(usize, &str)> = HashSet::new();
        let mut day_sessions: HashSet<(usize, &str, &str)> = HashSet::new();
        let mut type_entities: HashSet<(usize, &str, &str)> = HashSet::new();
        let mut location_entities: HashSet<(usize, Location, &str)> = HashSet::new();

        let mut skipped = 0u64;
        for event in events {
            let Some(idx) = horizon.spine.index_of(bucketer.day_of(event.timestamp)) else {
                skipped += 1;
                continue;
            };
            let entity = event.entity_id.as_str();

            base.events[idx] += 1;
            if event.is_qualifying_event {
                base.qualifying_events[idx] += 1;
            }
            if day_entities.insert((idx, event.entity_type, entity)) {
                base.active_entities[idx] += 1;
            }
            if let Some(session) = event.session_id.as_deref() {
                if day_sessions.insert((idx, entity, session)) {
                    base.sessions[idx] += 1;
                }
            }
            if event.entity_type == EntityType::User {
                if day_users.insert((idx, entity)) {
                    base.dau[idx] += 1;
                    user_days.entry(entity).or_default().push(idx);
                }
                if event.is_qualifying_event && day_qualifying.insert((idx, entity)) {
                    base.qualifying_users[idx] += 1;
                }
            }

            let series = base
                .event_types
                .entry(event.event_type.clone())
                .or_insert_with(|| KeySeries::zeroed(n));
            series.counts[idx] += 1;
            if type_entities.insert((idx, event.event_type.as_str(), entity)) {
                series.distinct_entities[idx] += 1;
            }

            if let Some(series) = base.locations.get_mut(event.location.as_str()) {
                series.counts[idx] += 1;
                if location_entities.insert((idx, event.location, entity)) {
                    series.distinct_entities[idx] += 1;
                }
            }
        }

        base.wau = trailing_distinct(&user_days, metrics.short_window_days as usize, n);
        base.mau = trailing_distinct(&user_days, metrics.long_window_days as usize, n);

        debug!(
            "Daily base over {} spine days ({} events outside the horizon)",
            n, skipped
        );
        base
    }
}

/// Distinct subjects active in the trailing `len` days, for every day.
///
/// Each subject contributes +1 over the union of `[d, d + len)` for its
/// active days `d`, so overlapping frames are never double counted.
fn trailing_distinct(days_by_subject: &HashMap<&str, Vec<usize>>, len: usize, n: usize) -> Vec<u64> {
    let mut diff = vec![0i64; n + 1];
    for days in days_by_subject.values() {
        let mut sorted = days.clone();
        sorted.sort_unstable();
        sorted.dedup();
        let mut covered_until = 0usize;
        for d in sorted {
            let start = d.max(covered_until);
            let end = (d + len).min(n);
            if start < end {
                diff[start] += 1;
                diff[end] -= 1;
            }
            covered_until = covered_until.max(end);
        }
    }
    let mut out = Vec::with_capacity(n);
    let mut running = 0i64;
    for delta in diff.iter().take(n) {
        running += delta;
        out.push(running.max(0) as u64);
    }
    out
}

fn as_f64(values: &[u64]) -> Vec<f64> {
    values.iter().map(|&v| v as f64).collect()
}

// ── Overall scope ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallMetricsRow {
    pub as_of_date: NaiveDate,
    pub date: NaiveDate,
    pub grain: Grain,
    pub dau: u64,
    pub wau: u64,
    pub mau: u64,
    pub active_entities: u64,
    pub qualifying_users: u64,
    pub events: u64,
    pub qualifying_events: u64,
    pub sessions: u64,
    pub dau_avg_7d: f64,
    pub dau_avg_30d: f64,
    pub events_sum_7d: u64,
    pub events_sum_30d: u64,
    pub dau_wow: Growth,
    pub dau_mom: Growth,
    /// DAU / MAU in percent.
    pub stickiness_pct: Option<f64>,
}

pub fn overall_metrics(
    base: &DailyBase,
    horizon: &MetricHorizon,
    metrics: &MetricsConfig,
) -> Vec<OverallMetricsRow> {
    let short = metrics.short_window_days as usize;
    let long = metrics.long_window_days as usize;
    let dau = as_f64(&base.dau);
    let events = as_f64(&base.events);
    let avg_short = rolling_averages(&dau, short);
    let avg_long = rolling_averages(&dau, long);
    let sum_short = rolling_sums(&events, short);
    let sum_long = rolling_sums(&events, long);

    horizon
        .reported_indices(horizon.overall_start)
        .map(|i| OverallMetricsRow {
            as_of_date: horizon.as_of_date,
            date: horizon.spine.days()[i],
            grain: Grain::Daily,
            dau: base.dau[i],
            wau: base.wau[i],
            mau: base.mau[i],
            active_entities: base.active_entities[i],
            qualifying_users: base.qualifying_users[i],
            events: base.events[i],
            qualifying_events: base.qualifying_events[i],
            sessions: base.sessions[i],
            dau_avg_7d: avg_short[i],
            dau_avg_30d: avg_long[i],
            events_sum_7d: sum_short[i] as u64,
            events_sum_30d: sum_long[i] as u64,
            dau_wow: Growth::at(&dau, i, metrics.wow_lag_days),
            dau_mom: Growth::at(&dau, i, metrics.mom_lag_days),
            stickiness_pct: share_pct(base.dau[i] as f64, base.mau[i] as f64),
        })
        .collect()
}

// ── Activity scope ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityMetricsRow {
    pub as_of_date: NaiveDate,
    pub date: NaiveDate,
    pub grain: Grain,
    /// `"event_type"` or `"location"`.
    pub dimension: &'static str,
    pub key: String,
    pub count: u64,
    pub distinct_entities: u64,
    pub sum_7d: u64,
    pub sum_30d: u64,
    /// Week-over-week growth of the 7-day sum.
    pub sum_7d_wow: Growth,
    /// Rank among keys of the dimension that day (count desc, key asc).
    pub rank: u32,
    pub share_pct: Option<f64>,
}

pub fn activity_metrics(
    base: &DailyBase,
    horizon: &MetricHorizon,
    metrics: &MetricsConfig,
) -> Vec<ActivityMetricsRow> {
    let mut rows = Vec::new();
    for (dimension, series) in [("event_type", &base.event_types), ("location", &base.locations)] {
        rows.extend(activity_dimension(dimension, series, horizon, metrics));
    }
    rows.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.dimension.cmp(b.dimension))
            .then_with(|| a.key.cmp(&b.key))
    });
    rows
}

fn activity_dimension(
    dimension: &'static str,
    series: &BTreeMap<String, KeySeries>,
    horizon: &MetricHorizon,
    metrics: &MetricsConfig,
) -> Vec<ActivityMetricsRow> {
    struct Derived<'a> {
        key: &'a str,
        series: &'a KeySeries,
        sum_short: Vec<f64>,
        sum_long: Vec<f64>,
    }

    let derived: Vec<Derived<'_>> = series
        .iter()
        .map(|(key, s)| {
            let counts = as_f64(&s.counts);
            Derived {
                key: key.as_str(),
                series: s,
                sum_short: rolling_sums(&counts, metrics.short_window_days as usize),
                sum_long: rolling_sums(&counts, metrics.long_window_days as usize),
            }
        })
        .collect();

    let mut rows = Vec::new();
    for i in horizon.reported_indices(horizon.detail_start) {
        let day_total: u64 = derived.iter().map(|d| d.series.counts[i]).sum();
        let entries: Vec<(&str, f64)> = derived
            .iter()
            .map(|d| (d.key, d.series.counts[i] as f64))
            .collect();
        let ranks = rank_desc(&entries);

        for (d, rank) in derived.iter().zip(ranks) {
            let count = d.series.counts[i];
            rows.push(ActivityMetricsRow {
                as_of_date: horizon.as_of_date,
                date: horizon.spine.days()[i],
                grain: Grain::Daily,
                dimension,
                key: d.key.to_string(),
                count,
                distinct_entities: d.series.distinct_entities[i],
                sum_7d: d.sum_short[i] as u64,
                sum_30d: d.sum_long[i] as u64,
                sum_7d_wow: Growth::at(&d.sum_short, i, metrics.wow_lag_days),
                rank,
                share_pct: share_pct(count as f64, day_total as f64),
            });
        }
    }
    rows
}

// ── Segment scope ─────────────────────────────────────────────────────────────

/// Segment period label for the horizon-wide rows.
pub const HORIZON_PERIOD: &str = "18mo";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentMetricsRow {
    pub as_of_date: NaiveDate,
    /// `"YYYY-MM"` for month rows, `"18mo"` for the horizon-wide row.
    pub period: String,
    pub grain: Grain,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    /// `"geography"`, `"account_type"` or `"tenure_bucket"`.
    pub dimension: &'static str,
    pub segment_key: String,
    pub active_users: u64,
    pub events: u64,
    pub qualifying_events: u64,
    /// Rank by active users within the period and dimension.
    pub rank: u32,
    pub share_pct: Option<f64>,
    /// Month-over-month growth of active users; absent on horizon rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mom_growth: Option<Growth>,
}

/// Tenure bucket for a user `days` old.
pub fn tenure_bucket(days: i64) -> &'static str {
    match days {
        i64::MIN..=30 => "0-30d",
        31..=90 => "31-90d",
        91..=180 => "91-180d",
        181..=365 => "181-365d",
        _ => "365d+",
    }
}

#[derive(Default)]
struct SegmentAcc<'a> {
    users: HashSet<&'a str>,
    events: u64,
    qualifying_events: u64,
}

/// `None` period means the horizon-wide row.
type SegmentKey = (Option<usize>, &'static str, String);

pub fn segment_metrics(
    events: &[Event],
    directory: &EntityDirectory,
    horizon: &MetricHorizon,
    bucketer: &DayBucketer,
) -> Vec<SegmentMetricsRow> {
    let months = horizon.months();
    let period_end = |period: Option<usize>| -> NaiveDate {
        match period {
            Some(p) => month_end(months[p]).min(horizon.as_of_date),
            None => horizon.as_of_date,
        }
    };
    let month_index = |day: NaiveDate| -> Option<usize> {
        let first = months.first()?;
        let offset = (day.year() - first.year()) * 12 + day.month() as i32 - first.month() as i32;
        usize::try_from(offset).ok().filter(|&i| i < months.len())
    };

    let mut acc: BTreeMap<SegmentKey, SegmentAcc<'_>> = BTreeMap::new();

    for event in events.iter().filter(|e| e.entity_type == EntityType::User) {
        let day = bucketer.day_of(event.timestamp);
        if day < horizon.detail_start || day > horizon.as_of_date {
            continue;
        }
        let Some(month) = month_index(day) else {
            continue;
        };
        let user = directory.user(&event.entity_id);
        let geography = user
            .and_then(|u| u.country.as_deref())
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(UNKNOWN_SEGMENT)
            .to_string();
        let account_type = user
            .and_then(|u| directory.account(&u.account_id))
            .map(|a| a.account_type.clone())
            .unwrap_or_else(|| UNKNOWN_SEGMENT.to_string());

        for period in [Some(month), None] {
            let tenure = match user {
                Some(u) => {
                    let age = (period_end(period) - bucketer.day_of(u.created_at)).num_days();
                    tenure_bucket(age).to_string()
                }
                None => UNKNOWN_SEGMENT.to_string(),
            };
            for (dimension, key) in [
                ("geography", geography.clone()),
                ("account_type", account_type.clone()),
                ("tenure_bucket", tenure),
            ] {
                let slot = acc.entry((period, dimension, key)).or_default();
                slot.users.insert(event.entity_id.as_str());
                slot.events += 1;
                if event.is_qualifying_event {
                    slot.qualifying_events += 1;
                }
            }
        }
    }

    // Group by (period, dimension) for rank and share.
    let mut groups: BTreeMap<(Option<usize>, &'static str), Vec<(&String, &SegmentAcc<'_>)>> =
        BTreeMap::new();
    for ((period, dimension, key), slot) in &acc {
        groups.entry((*period, *dimension)).or_default().push((key, slot));
    }

    let mut rows = Vec::new();
    for ((period, dimension), members) in groups {
        let total: f64 = members.iter().map(|(_, s)| s.users.len() as f64).sum();
        let entries: Vec<(&String, f64)> = members
            .iter()
            .map(|(k, s)| (*k, s.users.len() as f64))
            .collect();
        let ranks = rank_desc(&entries);

        for ((key, slot), rank) in members.into_iter().zip(ranks) {
            let active_users = slot.users.len() as u64;
            let (label, grain, start, mom_growth) = match period {
                Some(p) => {
                    let lag_value = p.checked_sub(1).map(|prev| {
                        acc.get(&(Some(prev), dimension, key.clone()))
                            .map(|s| s.users.len() as f64)
                            .unwrap_or(0.0)
                    });
                    (
                        month_key(months[p]),
                        Grain::Month,
                        months[p],
                        Some(Growth::compute(active_users as f64, 1, lag_value)),
                    )
                }
                None => (
                    HORIZON_PERIOD.to_string(),
                    Grain::EighteenMonth,
                    horizon.detail_start,
                    None,
                ),
            };
            rows.push(SegmentMetricsRow {
                as_of_date: horizon.as_of_date,
                period: label,
                grain,
                period_start: start,
                period_end: period_end(period),
                dimension,
                segment_key: key.clone(),
                active_users,
                events: slot.events,
                qualifying_events: slot.qualifying_events,
                rank,
                share_pct: share_pct(active_users as f64, total),
                mom_growth,
            });
        }
    }

    rows.sort_by(|a, b| {
        a.period
            .cmp(&b.period)
            .then_with(|| a.dimension.cmp(b.dimension))
            .then_with(|| a.segment_key.cmp(&b.segment_key))
    });
    rows
}
