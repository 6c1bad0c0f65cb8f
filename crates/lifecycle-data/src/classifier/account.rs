//! Account lifecycle: seat utilization, contract status and health.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Duration, Utc};
use lifecycle_core::calculations::{ratio, round2};
use lifecycle_core::counters::ActivityCounters;
use lifecycle_core::diagnostics::{DiagnosticKind, DiagnosticsReport};
use lifecycle_core::models::{Account, AccountMetrics, AccountState, LifecycleRecord, LifecycleState};
use lifecycle_core::thresholds::{AccountThresholds, HealthWeights};
use lifecycle_core::time_utils::days_between;

use super::{to_record, unknown_at, Classification, Rule, RuleSet};
use crate::directory::EntityDirectory;
use crate::enrich::ActivityIndex;

/// Inputs the account rules look at.
#[derive(Debug, Clone, Copy)]
pub struct AccountContext<'a> {
    pub as_of: DateTime<Utc>,
    pub account: &'a Account,
    /// Any event by the account or its users.
    pub has_activity: bool,
    /// Active users over licensed seats, in percent.
    pub utilization_pct: f64,
    /// Share of seats held by active users, in percent.
    pub active_share_pct: f64,
    pub thresholds: AccountThresholds,
}

impl AccountContext<'_> {
    fn is_paid(&self) -> bool {
        self.account.first_payment_at.is_some()
    }

    fn past_renewal(&self) -> bool {
        self.account.renewals_completed >= 1
    }

    fn days_since_payment(&self) -> Option<i64> {
        self.account
            .first_payment_at
            .map(|t| days_between(t, self.as_of))
    }

    /// Whole days until the renewal date; negative once it has passed.
    fn days_to_renewal(&self) -> Option<i64> {
        self.account
            .renewal_date
            .map(|r| days_between(self.as_of, r))
    }

    fn days_overdue(&self) -> Option<i64> {
        self.account
            .renewal_date
            .map(|r| days_between(r, self.as_of))
    }

    /// Start of the trailing utilization window, never before first payment.
    fn window_start(&self) -> DateTime<Utc> {
        let start = self.as_of - Duration::days(self.thresholds.utilization_window_days);
        match self.account.first_payment_at {
            Some(paid) if paid > start => paid,
            _ => start,
        }
    }

    fn trial_start(&self) -> DateTime<Utc> {
        self.account
            .trial_started_at
            .unwrap_or(self.account.created_at)
    }
}

/// The account rule set, in priority order.
pub fn account_rules<'a>() -> RuleSet<AccountContext<'a>, AccountState> {
    RuleSet::new(vec![
        Rule {
            name: "no_activity",
            state: AccountState::zero_activity_default(),
            applies: |c| !c.has_activity,
            since: |c| c.trial_start(),
        },
        Rule {
            name: "trial",
            state: AccountState::Trial,
            applies: |c| !c.is_paid() && c.account.trial_ends_at.map_or(true, |end| end >= c.as_of),
            since: |c| c.trial_start(),
        },
        Rule {
            name: "churned_trial_expired",
            state: AccountState::Churned,
            applies: |c| !c.is_paid(),
            since: |c| c.account.trial_ends_at.unwrap_or(c.as_of),
        },
        // A lapsed contract outranks any utilization band.
        Rule {
            name: "churned_overdue",
            state: AccountState::Churned,
            applies: |c| {
                c.days_overdue()
                    .is_some_and(|d| d >= c.thresholds.overdue_churn_days)
            },
            since: |c| {
                c.account
                    .renewal_date
                    .map(|r| r + Duration::days(c.thresholds.overdue_churn_days))
                    .unwrap_or(c.as_of)
            },
        },
        Rule {
            name: "new_paid",
            state: AccountState::NewPaid,
            applies: |c| {
                c.days_since_payment()
                    .is_some_and(|d| d <= c.thresholds.new_paid_window_days)
                    && c.utilization_pct >= c.thresholds.new_paid_min_utilization_pct
            },
            since: |c| c.account.first_payment_at.unwrap_or(c.as_of),
        },
        Rule {
            name: "expanding",
            state: AccountState::Expanding,
            applies: |c| {
                c.utilization_pct >= c.thresholds.expanding_min_utilization_pct
                    && c.active_share_pct > c.thresholds.expanding_min_active_share_pct
            },
            since: |c| c.window_start(),
        },
        Rule {
            name: "active",
            state: AccountState::Active,
            applies: |c| c.utilization_pct >= c.thresholds.active_min_utilization_pct,
            since: |c| c.window_start(),
        },
        Rule {
            name: "contracting",
            state: AccountState::Contracting,
            applies: |c| {
                c.utilization_pct >= c.thresholds.contracting_min_utilization_pct
                    && c.utilization_pct < c.thresholds.active_min_utilization_pct
                    && c.past_renewal()
            },
            since: |c| c.window_start(),
        },
        Rule {
            name: "at_risk_low_utilization",
            state: AccountState::AtRisk,
            applies: |c| c.utilization_pct < c.thresholds.at_risk_max_utilization_pct,
            since: |c| c.window_start(),
        },
        Rule {
            name: "at_risk_near_renewal",
            state: AccountState::AtRisk,
            applies: |c| {
                c.utilization_pct < c.thresholds.renewal_at_risk_utilization_pct
                    && c.days_to_renewal()
                        .is_some_and(|d| (0..=c.thresholds.renewal_window_days).contains(&d))
            },
            since: |c| {
                c.account
                    .renewal_date
                    .map(|r| r - Duration::days(c.thresholds.renewal_window_days))
                    .unwrap_or(c.as_of)
            },
        },
        Rule {
            name: "at_risk",
            state: AccountState::AtRisk,
            applies: |_| true,
            since: |c| c.window_start(),
        },
    ])
}

pub fn classify_account<'a>(
    rules: &RuleSet<AccountContext<'a>, AccountState>,
    ctx: &AccountContext<'a>,
) -> Classification<AccountState> {
    rules.evaluate(ctx).unwrap_or_else(|| unknown_at(ctx.as_of))
}

// ── Metrics ───────────────────────────────────────────────────────────────────

/// Activity roll-up for one account's users.
#[derive(Debug, Clone, Default)]
pub struct AccountActivity {
    pub counters: ActivityCounters,
    pub active_users: u32,
    pub adoption_breadth: u32,
    pub recent_activity: bool,
}

/// Roll up the activity of `account_id`'s users and of the account entity
/// itself.
pub fn account_activity(
    account_id: &str,
    directory: &EntityDirectory,
    index: &ActivityIndex,
    window_days: i64,
    as_of: DateTime<Utc>,
) -> AccountActivity {
    let mut activity = AccountActivity::default();
    let mut products: HashSet<&str> = HashSet::new();

    for user_id in directory.users_of(account_id) {
        if let Some(counters) = index.user(user_id) {
            activity.counters.merge(counters);
            if counters.qualified_within(as_of, window_days) {
                activity.active_users += 1;
            }
        }
        if let Some(user_products) = index.user_products.get(user_id) {
            for (product_id, counters) in user_products {
                if counters.qualified_within(as_of, window_days) {
                    products.insert(product_id.as_str());
                }
            }
        }
    }
    if let Some(own) = index.account_entities.get(account_id) {
        activity.counters.merge(own);
    }

    activity.adoption_breadth = products.len() as u32;
    activity.recent_activity = activity.active_users > 0
        || index
            .account_entities
            .get(account_id)
            .is_some_and(|c| c.qualified_within(as_of, window_days));
    activity
}

/// 0–100 health score, rounded to two decimals.
pub fn health_score(
    utilization_pct: Option<f64>,
    adoption_breadth: u32,
    recent_activity: bool,
    overdue: bool,
    weights: &HealthWeights,
) -> f64 {
    let utilization = utilization_pct.map(|u| (u / 100.0).clamp(0.0, 1.0)).unwrap_or(0.0);
    let cap = weights.adoption_cap.max(1);
    let adoption = adoption_breadth.min(cap) as f64 / cap as f64;
    let recent = if recent_activity { 1.0 } else { 0.0 };
    let contract = if overdue { 0.0 } else { 1.0 };
    round2(
        weights.utilization * utilization
            + weights.adoption * adoption
            + weights.recent_activity * recent
            + weights.contract * contract,
    )
}

/// Active users over licensed seats in percent, unrounded. `None` for zero
/// seats.
pub fn utilization_pct(active_users: u32, total_seats: u32) -> Option<f64> {
    ratio(f64::from(active_users) * 100.0, f64::from(total_seats))
}

fn account_metrics(
    account: &Account,
    activity: &AccountActivity,
    weights: &HealthWeights,
    as_of: DateTime<Utc>,
) -> AccountMetrics {
    let utilization_pct = utilization_pct(activity.active_users, account.total_seats).map(round2);
    let overdue = account.renewal_date.is_some_and(|r| r < as_of);
    AccountMetrics {
        total_seats: account.total_seats,
        active_users_30d: activity.active_users,
        utilization_pct,
        adoption_breadth: activity.adoption_breadth,
        days_to_renewal: account.renewal_date.map(|r| days_between(as_of, r)),
        health_score: health_score(
            utilization_pct,
            activity.adoption_breadth,
            activity.recent_activity,
            overdue,
            weights,
        ),
    }
}

// ── Domain driver ─────────────────────────────────────────────────────────────

/// Classify every directory account plus accounts referenced by users but
/// missing from the directory.
pub fn classify_accounts(
    directory: &EntityDirectory,
    index: &ActivityIndex,
    thresholds: &AccountThresholds,
    weights: &HealthWeights,
    as_of: DateTime<Utc>,
    diagnostics: &mut DiagnosticsReport,
) -> Vec<LifecycleRecord<AccountState>> {
    let rules = account_rules();

    let subjects: BTreeSet<&str> = directory
        .accounts()
        .map(|a| a.account_id.as_str())
        .chain(directory.referenced_account_ids())
        .collect();

    subjects
        .into_iter()
        .map(|account_id| {
            let activity = account_activity(
                account_id,
                directory,
                index,
                thresholds.utilization_window_days,
                as_of,
            );

            let Some(account) = directory.account(account_id) else {
                // Already reported when the directory was indexed.
                return to_record(
                    account_id,
                    None,
                    unknown_at(as_of),
                    &activity.counters,
                    as_of,
                    None,
                );
            };

            let metrics = account_metrics(account, &activity, weights, as_of);
            // Rules compare the unrounded figure; the row reports it rounded.
            let classification = match utilization_pct(activity.active_users, account.total_seats) {
                Some(utilization_pct) => classify_account(
                    &rules,
                    &AccountContext {
                        as_of,
                        account,
                        has_activity: activity.counters.has_events(),
                        utilization_pct,
                        active_share_pct: utilization_pct,
                        thresholds: *thresholds,
                    },
                ),
                None => {
                    diagnostics.push(
                        DiagnosticKind::ZeroSeats,
                        account_id,
                        "account has no licensed seats; utilization is undefined",
                    );
                    unknown_at(as_of)
                }
            };

            to_record(
                account_id,
                None,
                classification,
                &activity.counters,
                as_of,
                Some(metrics),
            )
        })
        .collect()
}
