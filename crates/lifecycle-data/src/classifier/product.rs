//! Product lifecycle: one row per indexed (user, product) pair.
//!
//! Only pairs with at least one attributed event are indexed. Any other pair
//! is `never_adopted` by definition and has no row.

use chrono::{DateTime, Duration, Utc};
use lifecycle_core::counters::ActivityCounters;
use lifecycle_core::diagnostics::{DiagnosticKind, DiagnosticsReport};
use lifecycle_core::models::{LifecycleRecord, LifecycleState, ProductState};
use lifecycle_core::thresholds::RecencyThresholds;
use lifecycle_core::time_utils::days_between;

use super::{to_record, unknown_at, Classification, Rule, RuleSet};
use crate::directory::EntityDirectory;
use crate::enrich::ActivityIndex;

#[derive(Debug, Clone, Copy)]
pub struct ProductContext<'a> {
    pub as_of: DateTime<Utc>,
    pub counters: &'a ActivityCounters,
    pub thresholds: RecencyThresholds,
}

impl ProductContext<'_> {
    fn first_access(&self) -> DateTime<Utc> {
        self.counters.first_event_at.unwrap_or(self.as_of)
    }

    fn days_since_first_access(&self) -> i64 {
        days_between(self.first_access(), self.as_of)
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

/// The product rule set, in priority order.
pub fn product_rules<'a>() -> RuleSet<ProductContext<'a>, ProductState> {
    RuleSet::new(vec![
        Rule {
            name: "never_adopted",
            state: ProductState::zero_activity_default(),
            applies: |c| !c.counters.has_events(),
            since: |c| c.as_of,
        },
        Rule {
            name: "new_to_product",
            state: ProductState::NewToProduct,
            // An activation that has not yet produced a qualifying event
            // keeps the pair new.
            applies: |c| {
                c.days_since_first_access() <= c.thresholds.new_window_days
                    && (c.counters.first_activation_at.is_none()
                        || c.counters.qualifying_events == 0)
            },
            since: |c| c.first_access(),
        },
        Rule {
            name: "active_in_product",
            state: ProductState::ActiveInProduct,
            applies: |c| {
                c.days_since_qualifying()
                    .is_some_and(|d| d <= c.thresholds.active_window_days)
            },
            since: |c| c.counters.active_run_start.unwrap_or(c.as_of),
        },
        Rule {
            name: "dormant_in_product",
            state: ProductState::DormantInProduct,
            applies: |c| {
                c.days_since_qualifying().is_some_and(|d| {
                    d > c.thresholds.active_window_days && d <= c.thresholds.dormant_window_days
                })
            },
            since: |c| c.last_qualifying_plus(c.thresholds.dormant_offset_days()),
        },
        Rule {
            name: "churned_from_product",
            state: ProductState::ChurnedFromProduct,
            applies: |c| {
                c.days_since_qualifying()
                    .is_some_and(|d| d > c.thresholds.dormant_window_days)
            },
            since: |c| c.last_qualifying_plus(c.thresholds.churn_offset_days()),
        },
        Rule {
            name: "churned_never_activated",
            state: ProductState::ChurnedFromProduct,
            applies: |_| true,
            since: |c| c.first_access() + Duration::days(c.thresholds.dormant_offset_days()),
        },
    ])
}

pub fn classify_pair<'a>(
    rules: &RuleSet<ProductContext<'a>, ProductState>,
    ctx: &ProductContext<'a>,
) -> Classification<ProductState> {
    rules.evaluate(ctx).unwrap_or_else(|| unknown_at(ctx.as_of))
}

/// Look up one (user, product) pair through the index.
///
/// Unindexed pairs resolve to `never_adopted` without touching the rule set.
pub fn classify_product_pair(
    index: &ActivityIndex,
    user_id: &str,
    product_id: &str,
    thresholds: &RecencyThresholds,
    as_of: DateTime<Utc>,
) -> Classification<ProductState> {
    match index.user_product(user_id, product_id) {
        Some(counters) => classify_pair(
            &product_rules(),
            &ProductContext {
                as_of,
                counters,
                thresholds: *thresholds,
            },
        ),
        None => Classification {
            state: ProductState::NeverAdopted,
            since: as_of,
            rule: "never_adopted",
        },
    }
}

/// Classify every indexed pair. Pairs whose user is missing from the
/// directory are `unknown`.
pub fn classify_products(
    directory: &EntityDirectory,
    index: &ActivityIndex,
    thresholds: &RecencyThresholds,
    as_of: DateTime<Utc>,
    diagnostics: &mut DiagnosticsReport,
) -> Vec<LifecycleRecord<ProductState>> {
    let rules = product_rules();
    let mut rows = Vec::with_capacity(index.pair_count());

    for (user_id, product_id, counters) in index.pairs() {
        let classification = if directory.user(user_id).is_some() {
            classify_pair(
                &rules,
                &ProductContext {
                    as_of,
                    counters,
                    thresholds: *thresholds,
                },
            )
        } else {
            diagnostics.push(
                DiagnosticKind::MissingUser,
                user_id,
                format!("product activity on {product_id} from a user not in the directory"),
            );
            unknown_at(as_of)
        };
        rows.push(to_record(user_id, Some(product_id), classification, counters, as_of, None));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    fn classify(counters: &ActivityCounters) -> Classification<ProductState> {
        classify_pair(
            &product_rules(),
            &ProductContext {
                as_of: as_of(),
                counters,
                thresholds: RecencyThresholds::default(),
            },
        )
    }

    fn observe(c: &mut ActivityCounters, days_ago: i64, qualifying: bool, activation: bool) {
        c.observe(as_of() - Duration::days(days_ago), qualifying, activation, 30);
    }

    #[test]
    fn test_first_access_without_activation_is_new() {
        let mut c = ActivityCounters::default();
        observe(&mut c, 12, false, false);
        observe(&mut c, 5, true, false);
        let result = classify(&c);
        assert_eq!(result.state, ProductState::NewToProduct);
        assert_eq!(result.since, as_of() - Duration::days(12));
    }

    #[test]
    fn test_activated_and_qualifying_is_active() {
        let mut c = ActivityCounters::default();
        observe(&mut c, 12, true, true);
        observe(&mut c, 2, true, false);
        let result = classify(&c);
        assert_eq!(result.state, ProductState::ActiveInProduct);
        assert_eq!(result.since, as_of() - Duration::days(12));
    }

    #[test]
    fn test_dormant_and_churned_bands() {
        let mut c = ActivityCounters::default();
        observe(&mut c, 45, true, true);
        let result = classify(&c);
        assert_eq!(result.state, ProductState::DormantInProduct);
        assert_eq!(result.since, as_of() - Duration::days(45) + Duration::days(31));

        let mut c = ActivityCounters::default();
        observe(&mut c, 61, true, true);
        assert_eq!(classify(&c).state, ProductState::ChurnedFromProduct);
    }

    #[test]
    fn test_never_activated_past_window_is_churned() {
        let mut c = ActivityCounters::default();
        observe(&mut c, 40, false, false);
        let result = classify(&c);
        assert_eq!(result.state, ProductState::ChurnedFromProduct);
        assert_eq!(result.rule, "churned_never_activated");
        assert_eq!(result.since, as_of() - Duration::days(40) + Duration::days(31));
    }

    #[test]
    fn test_unindexed_pair_is_never_adopted() {
        let index = ActivityIndex::default();
        let result = classify_product_pair(
            &index,
            "u1",
            "editor",
            &RecencyThresholds::default(),
            as_of(),
        );
        assert_eq!(result.state, ProductState::NeverAdopted);
    }

    proptest! {
        #[test]
        fn prop_every_pair_gets_one_known_state(
            history in proptest::collection::vec((0i64..400, proptest::bool::ANY, proptest::bool::ANY), 1..6),
        ) {
            let mut sorted = history.clone();
            sorted.sort_by(|a, b| b.0.cmp(&a.0));
            let mut c = ActivityCounters::default();
            for (days_ago, qualifying, activation) in sorted {
                observe(&mut c, days_ago, qualifying, activation);
            }
            let result = classify(&c);
            prop_assert!(ProductState::variants().contains(&result.state));
            prop_assert_ne!(result.state, ProductState::Unknown);
            prop_assert_ne!(result.state, ProductState::NeverAdopted);
            prop_assert!(result.since <= as_of());
        }
    }
}
