//! Platform lifecycle: one row per user.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use lifecycle_core::counters::ActivityCounters;
use lifecycle_core::diagnostics::{DiagnosticKind, DiagnosticsReport};
use lifecycle_core::models::{LifecycleRecord, LifecycleState, PlatformState};
use lifecycle_core::thresholds::RecencyThresholds;
use lifecycle_core::time_utils::days_between;

use super::{to_record, unknown_at, Classification, Rule, RuleSet};
use crate::directory::EntityDirectory;
use crate::enrich::ActivityIndex;

/// Inputs the platform rules look at.
#[derive(Debug, Clone, Copy)]
pub struct PlatformContext<'a> {
    pub as_of: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub counters: &'a ActivityCounters,
    pub thresholds: RecencyThresholds,
}

impl PlatformContext<'_> {
    fn days_since_created(&self) -> i64 {
        days_between(self.created_at, self.as_of)
    }

    fn days_since_qualifying(&self) -> Option<i64> {
        self.counters.days_since_last_qualifying(self.as_of)
    }

    fn last_qualifying_plus(&self, days: i64) -> DateTime<Utc> {
        self.counters
            .last_qualifying_at
            .map(|t| t + Duration::days(days))
            .unwrap_or(self.as_of)
    }
}

/// The platform rule set, in priority order.
pub fn platform_rules<'a>() -> RuleSet<PlatformContext<'a>, PlatformState> {
    RuleSet::new(vec![
        Rule {
            name: "no_activity",
            state: PlatformState::zero_activity_default(),
            applies: |c| !c.counters.has_events(),
            since: |c| c.created_at,
        },
        Rule {
            name: "new",
            state: PlatformState::New,
            applies: |c| {
                c.days_since_created() <= c.thresholds.new_window_days
                    && c.counters.qualifying_events < c.thresholds.new_max_qualifying
            },
            since: |c| c.created_at,
        },
        Rule {
            name: "active",
            state: PlatformState::Active,
            applies: |c| {
                c.days_since_qualifying()
                    .is_some_and(|d| d <= c.thresholds.active_window_days)
            },
            since: |c| c.counters.active_run_start.unwrap_or(c.as_of),
        },
        Rule {
            name: "dormant",
            state: PlatformState::Dormant,
            applies: |c| {
                c.days_since_qualifying().is_some_and(|d| {
                    d > c.thresholds.active_window_days && d <= c.thresholds.dormant_window_days
                })
            },
            since: |c| c.last_qualifying_plus(c.thresholds.dormant_offset_days()),
        },
        Rule {
            name: "churned_inactive",
            state: PlatformState::Churned,
            applies: |c| {
                c.days_since_qualifying()
                    .is_some_and(|d| d > c.thresholds.dormant_window_days)
            },
            since: |c| c.last_qualifying_plus(c.thresholds.churn_offset_days()),
        },
        Rule {
            name: "churned_never_activated",
            state: PlatformState::Churned,
            applies: |_| true,
            since: |c| c.created_at + Duration::days(c.thresholds.dormant_offset_days()),
        },
    ])
}

/// Evaluate the platform rules for one user.
pub fn classify_user<'a>(
    rules: &RuleSet<PlatformContext<'a>, PlatformState>,
    ctx: &PlatformContext<'a>,
) -> Classification<PlatformState> {
    rules.evaluate(ctx).unwrap_or_else(|| unknown_at(ctx.as_of))
}

/// Classify every directory user plus every user id seen in the event log.
///
/// Users missing from the directory are `unknown`, with a diagnostic.
pub fn classify_platform(
    directory: &EntityDirectory,
    index: &ActivityIndex,
    thresholds: &RecencyThresholds,
    as_of: DateTime<Utc>,
    diagnostics: &mut DiagnosticsReport,
) -> Vec<LifecycleRecord<PlatformState>> {
    let rules = platform_rules();
    let empty = ActivityCounters::default();

    let subjects: BTreeSet<&str> = directory
        .users()
        .map(|u| u.user_id.as_str())
        .chain(index.users.keys().map(String::as_str))
        .collect();

    subjects
        .into_iter()
        .map(|user_id| {
            let counters = index.user(user_id).unwrap_or(&empty);
            let classification = match directory.user(user_id) {
                Some(user) => classify_user(
                    &rules,
                    &PlatformContext {
                        as_of,
                        created_at: user.created_at,
                        counters,
                        thresholds: *thresholds,
                    },
                ),
                None => {
                    diagnostics.push(
                        DiagnosticKind::MissingUser,
                        user_id,
                        "user appears in the event log but not in the directory",
                    );
                    unknown_at(as_of)
                }
            };
            to_record(user_id, None, classification, counters, as_of, None)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lifecycle_core::models::{EntityType, Event, Location, User};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    fn counters_with(qualifying_days_ago: &[i64]) -> ActivityCounters {
        let mut c = ActivityCounters::default();
        let mut days: Vec<i64> = qualifying_days_ago.to_vec();
        days.sort_by(|a, b| b.cmp(a));
        for d in days {
            c.observe(as_of() - Duration::days(d), true, false, 30);
        }
        c
    }

    fn classify(created_days_ago: i64, counters: &ActivityCounters) -> Classification<PlatformState> {
        let ctx = PlatformContext {
            as_of: as_of(),
            created_at: as_of() - Duration::days(created_days_ago),
            counters,
            thresholds: RecencyThresholds::default(),
        };
        classify_user(&platform_rules(), &ctx)
    }

    #[test]
    fn test_dormant_since_offset_from_last_event() {
        let counters = counters_with(&[35]);
        let c = classify(40, &counters);
        assert_eq!(c.state, PlatformState::Dormant);
        assert_eq!(c.since, as_of() - Duration::days(35) + Duration::days(31));
    }

    #[test]
    fn test_zero_events_is_new() {
        let counters = ActivityCounters::default();
        assert_eq!(classify(5, &counters).state, PlatformState::New);
        let c = classify(400, &counters);
        assert_eq!(c.state, PlatformState::New);
        assert_eq!(c.rule, "no_activity");
    }

    #[test]
    fn test_new_until_three_qualifying_events() {
        assert_eq!(classify(10, &counters_with(&[1, 2])).state, PlatformState::New);
        let c = classify(10, &counters_with(&[1, 2, 3]));
        assert_eq!(c.state, PlatformState::Active);
        assert_eq!(c.since, as_of() - Duration::days(3));
    }

    #[test]
    fn test_recency_bands() {
        assert_eq!(classify(100, &counters_with(&[30])).state, PlatformState::Active);
        assert_eq!(classify(100, &counters_with(&[31])).state, PlatformState::Dormant);
        assert_eq!(classify(100, &counters_with(&[60])).state, PlatformState::Dormant);
        let churned = classify(100, &counters_with(&[61]));
        assert_eq!(churned.state, PlatformState::Churned);
        assert_eq!(churned.since, as_of() - Duration::days(61) + Duration::days(61));
    }

    #[test]
    fn test_never_qualified_past_new_window_is_churned() {
        let mut counters = ActivityCounters::default();
        counters.observe(as_of() - Duration::days(20), false, false, 30);
        let c = classify(45, &counters);
        assert_eq!(c.state, PlatformState::Churned);
        assert_eq!(c.rule, "churned_never_activated");
        assert_eq!(c.since, as_of() - Duration::days(45) + Duration::days(31));
    }

    #[test]
    fn test_active_since_is_start_of_current_run() {
        // Gap of 40 days between 100 and 60 days ago breaks the run.
        let c = classify(200, &counters_with(&[100, 60, 40, 10]));
        assert_eq!(c.state, PlatformState::Active);
        assert_eq!(c.since, as_of() - Duration::days(60));
    }

    #[test]
    fn test_45_days_is_never_active_and_churned() {
        let counters = counters_with(&[45]);
        let ctx = PlatformContext {
            as_of: as_of(),
            created_at: as_of() - Duration::days(100),
            counters: &counters,
            thresholds: RecencyThresholds::default(),
        };
        let matching = platform_rules().matching_rules(&ctx);
        assert!(!matching.contains(&"active"));
        assert!(!matching.contains(&"churned_inactive"));
        assert_eq!(classify_user(&platform_rules(), &ctx).state, PlatformState::Dormant);
    }

    #[test]
    fn test_classify_platform_marks_missing_users_unknown() {
        let mut diags = DiagnosticsReport::default();
        let user = User {
            user_id: "u1".to_string(),
            account_id: "a1".to_string(),
            country: None,
            created_at: as_of() - Duration::days(10),
        };
        let dir = EntityDirectory::build(vec![user], vec![], vec![], &mut diags).unwrap();
        let ghost = Event {
            event_id: "e1".to_string(),
            entity_id: "ghost".to_string(),
            entity_type: EntityType::User,
            event_type: "user_login".to_string(),
            timestamp: as_of() - Duration::days(1),
            location: Location::Api,
            session_id: None,
            product_id: None,
            is_qualifying_event: true,
            is_activation_event: false,
            metadata: BTreeMap::new(),
        };
        let config = lifecycle_core::config::EngineConfig::default();
        let index = ActivityIndex::build(&[ghost], &dir, &config, &mut diags);
        let rows = classify_platform(&dir, &index, &config.platform, as_of(), &mut diags);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].subject_id, "ghost");
        assert_eq!(rows[0].state, PlatformState::Unknown);
        assert_eq!(rows[0].state_since, as_of());
        assert_eq!(rows[1].state, PlatformState::New);
        assert_eq!(diags.count(DiagnosticKind::MissingUser), 1);
    }

    proptest! {
        #[test]
        fn prop_exactly_one_known_state(
            created_days_ago in 0i64..800,
            offsets in proptest::collection::vec(0i64..800, 0..6),
            non_qualifying in proptest::bool::ANY,
        ) {
            let mut counters = ActivityCounters::default();
            let mut days = offsets.clone();
            days.sort_by(|a, b| b.cmp(a));
            for d in days {
                counters.observe(as_of() - Duration::days(d), !non_qualifying, false, 30);
            }
            let c = classify(created_days_ago, &counters);
            prop_assert!(PlatformState::variants().contains(&c.state));
            prop_assert_ne!(c.state, PlatformState::Unknown);
            prop_assert!(c.since <= as_of() || c.rule == "no_activity" || c.rule == "new");
        }

        #[test]
        fn prop_recency_bands_are_disjoint(days_ago in 0i64..400) {
            let counters = counters_with(&[days_ago]);
            let ctx = PlatformContext {
                as_of: as_of(),
                created_at: as_of() - Duration::days(1000),
                counters: &counters,
                thresholds: RecencyThresholds::default(),
            };
            let matching = platform_rules().matching_rules(&ctx);
            let recency = matching
                .iter()
                .filter(|r| ["active", "dormant", "churned_inactive"].contains(*r))
                .count();
            prop_assert_eq!(recency, 1);
        }
    }
}
