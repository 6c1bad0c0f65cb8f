//! Per-subject activity counters.
//!
//! Both the batch classifier and the incremental state fold events into the
//! same [`ActivityCounters`], so the two code paths derive identical lifecycle
//! inputs from identical event histories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::SubjectCounters;
use crate::time_utils::days_between;

/// Running summary of one subject's event history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityCounters {
    pub events: u64,
    pub qualifying_events: u64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub first_qualifying_at: Option<DateTime<Utc>>,
    pub last_qualifying_at: Option<DateTime<Utc>>,
    pub first_activation_at: Option<DateTime<Utc>>,
    /// First qualifying event after the most recent gap longer than the
    /// active window.
    pub active_run_start: Option<DateTime<Utc>>,
}

impl ActivityCounters {
    /// Fold one event into the counters.
    ///
    /// Events must arrive in timestamp order. Returns `false`, leaving the
    /// counters untouched, for an event older than the last one observed.
    pub fn observe(
        &mut self,
        timestamp: DateTime<Utc>,
        qualifying: bool,
        activation: bool,
        active_window_days: i64,
    ) -> bool {
        if let Some(last) = self.last_event_at {
            if timestamp < last {
                return false;
            }
        }

        self.events += 1;
        self.first_event_at.get_or_insert(timestamp);
        self.last_event_at = Some(timestamp);

        if activation {
            self.first_activation_at.get_or_insert(timestamp);
        }

        if qualifying {
            let continues_run = self
                .last_qualifying_at
                .is_some_and(|prev| days_between(prev, timestamp) <= active_window_days);
            if !continues_run {
                self.active_run_start = Some(timestamp);
            }
            self.qualifying_events += 1;
            self.first_qualifying_at.get_or_insert(timestamp);
            self.last_qualifying_at = Some(timestamp);
        }

        true
    }

    /// Combine another subject's counters into a group summary.
    ///
    /// The result is only meaningful for totals and first/last instants;
    /// the active run start is taken from the more recent run.
    pub fn merge(&mut self, other: &ActivityCounters) {
        fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
            match (a, b) {
                (Some(x), Some(y)) => Some(x.min(y)),
                (x, y) => x.or(y),
            }
        }
        fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
            a.max(b)
        }

        self.events += other.events;
        self.qualifying_events += other.qualifying_events;
        self.first_event_at = earliest(self.first_event_at, other.first_event_at);
        self.last_event_at = latest(self.last_event_at, other.last_event_at);
        self.first_qualifying_at = earliest(self.first_qualifying_at, other.first_qualifying_at);
        self.last_qualifying_at = latest(self.last_qualifying_at, other.last_qualifying_at);
        self.first_activation_at = earliest(self.first_activation_at, other.first_activation_at);
        self.active_run_start = latest(self.active_run_start, other.active_run_start);
    }

    pub fn has_events(&self) -> bool {
        self.events > 0
    }

    /// Whole days since the last qualifying event, as of `as_of`.
    pub fn days_since_last_qualifying(&self, as_of: DateTime<Utc>) -> Option<i64> {
        self.last_qualifying_at.map(|t| days_between(t, as_of))
    }

    /// `true` when a qualifying event happened at most `window_days` ago.
    pub fn qualified_within(&self, as_of: DateTime<Utc>, window_days: i64) -> bool {
        self.days_since_last_qualifying(as_of)
            .is_some_and(|d| (0..=window_days).contains(&d))
    }

    /// Output counters for a lifecycle row.
    pub fn to_subject_counters(&self, as_of: DateTime<Utc>) -> SubjectCounters {
        SubjectCounters {
            events: self.events,
            qualifying_events: self.qualifying_events,
            first_event_at: self.first_event_at,
            days_since_last_qualifying: self.days_since_last_qualifying(as_of),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_observe_tracks_first_and_last() {
        let mut c = ActivityCounters::default();
        assert!(c.observe(t0(), false, false, 30));
        assert!(c.observe(t0() + Duration::days(2), true, false, 30));
        assert!(c.observe(t0() + Duration::days(5), true, true, 30));

        assert_eq!(c.events, 3);
        assert_eq!(c.qualifying_events, 2);
        assert_eq!(c.first_event_at, Some(t0()));
        assert_eq!(c.first_qualifying_at, Some(t0() + Duration::days(2)));
        assert_eq!(c.last_qualifying_at, Some(t0() + Duration::days(5)));
        assert_eq!(c.first_activation_at, Some(t0() + Duration::days(5)));
    }

    #[test]
    fn test_observe_rejects_out_of_order() {
        let mut c = ActivityCounters::default();
        assert!(c.observe(t0() + Duration::days(1), true, false, 30));
        let before = c.clone();
        assert!(!c.observe(t0(), true, false, 30));
        assert_eq!(c, before);
    }

    #[test]
    fn test_active_run_restarts_after_gap() {
        let mut c = ActivityCounters::default();
        c.observe(t0(), true, false, 30);
        c.observe(t0() + Duration::days(30), true, false, 30);
        assert_eq!(c.active_run_start, Some(t0()));

        // 31 days after the previous qualifying event breaks the run.
        let restart = t0() + Duration::days(61);
        c.observe(restart, true, false, 30);
        assert_eq!(c.active_run_start, Some(restart));
    }

    #[test]
    fn test_non_qualifying_events_do_not_touch_run() {
        let mut c = ActivityCounters::default();
        c.observe(t0(), false, false, 30);
        assert!(c.active_run_start.is_none());
        assert!(c.has_events());
        assert!(c.days_since_last_qualifying(t0()).is_none());
    }

    #[test]
    fn test_qualified_within_bounds() {
        let mut c = ActivityCounters::default();
        c.observe(t0(), true, false, 30);
        assert!(c.qualified_within(t0() + Duration::days(30), 30));
        assert!(!c.qualified_within(t0() + Duration::days(31), 30));
    }

    #[test]
    fn test_merge_combines_totals_and_bounds() {
        let mut a = ActivityCounters::default();
        a.observe(t0() + Duration::days(3), true, false, 30);
        let mut b = ActivityCounters::default();
        b.observe(t0(), false, false, 30);
        b.observe(t0() + Duration::days(9), true, false, 30);

        let mut group = ActivityCounters::default();
        group.merge(&a);
        group.merge(&b);
        assert_eq!(group.events, 3);
        assert_eq!(group.qualifying_events, 2);
        assert_eq!(group.first_event_at, Some(t0()));
        assert_eq!(group.last_qualifying_at, Some(t0() + Duration::days(9)));
    }

    #[test]
    fn test_subject_counters_projection() {
        let mut c = ActivityCounters::default();
        c.observe(t0(), true, false, 30);
        let sc = c.to_subject_counters(t0() + Duration::days(10));
        assert_eq!(sc.events, 1);
        assert_eq!(sc.qualifying_events, 1);
        assert_eq!(sc.days_since_last_qualifying, Some(10));
    }
}
