//! Lifecycle state classification.
//!
//! Each domain is an ordered [`RuleSet`] of `(predicate, state, since)`
//! entries evaluated top to bottom; the first matching rule decides. Every
//! rule set ends in a catch-all, so evaluation is total. Subjects with missing
//! reference data never reach a rule set: they are classified `unknown`
//! before evaluation.

pub mod account;
pub mod platform;
pub mod product;

use chrono::{DateTime, Utc};
use lifecycle_core::counters::ActivityCounters;
use lifecycle_core::models::{AccountMetrics, LifecycleRecord, LifecycleState};

pub use account::{classify_accounts, AccountContext};
pub use platform::{classify_platform, PlatformContext};
pub use product::{classify_product_pair, classify_products, ProductContext};

/// One entry of an ordered rule set.
pub struct Rule<C, S> {
    /// Stable rule name, written to the output row.
    pub name: &'static str,
    pub state: S,
    pub applies: fn(&C) -> bool,
    /// Instant the state began holding, given that the rule matched.
    pub since: fn(&C) -> DateTime<Utc>,
}

/// Result of evaluating a rule set for one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification<S> {
    pub state: S,
    pub since: DateTime<Utc>,
    pub rule: &'static str,
}

/// Priority-ordered rules for one lifecycle domain.
pub struct RuleSet<C, S: LifecycleState> {
    rules: Vec<Rule<C, S>>,
}

impl<C, S: LifecycleState> RuleSet<C, S> {
    pub fn new(rules: Vec<Rule<C, S>>) -> Self {
        Self { rules }
    }

    /// First matching rule, or `None` if no rule applies.
    ///
    /// The shipped rule sets end in a catch-all, so `None` only happens for
    /// hand-built sets.
    pub fn evaluate(&self, ctx: &C) -> Option<Classification<S>> {
        self.rules.iter().find(|r| (r.applies)(ctx)).map(|r| Classification {
            state: r.state,
            since: (r.since)(ctx),
            rule: r.name,
        })
    }

    /// Names of every rule whose predicate holds, in priority order.
    pub fn matching_rules(&self, ctx: &C) -> Vec<&'static str> {
        self.rules
            .iter()
            .filter(|r| (r.applies)(ctx))
            .map(|r| r.name)
            .collect()
    }

    pub fn rules(&self) -> &[Rule<C, S>] {
        &self.rules
    }
}

/// Name used on rows classified `unknown` for missing reference data.
pub const MISSING_REFERENCE_RULE: &str = "missing_reference_data";

/// Classification for a subject whose reference data is missing.
pub fn unknown_at<S: LifecycleState>(as_of: DateTime<Utc>) -> Classification<S> {
    Classification {
        state: S::unknown(),
        since: as_of,
        rule: MISSING_REFERENCE_RULE,
    }
}

/// Assemble an output row.
pub(crate) fn to_record<S: LifecycleState>(
    subject_id: &str,
    product_id: Option<&str>,
    classification: Classification<S>,
    counters: &ActivityCounters,
    as_of: DateTime<Utc>,
    account: Option<AccountMetrics>,
) -> LifecycleRecord<S> {
    LifecycleRecord {
        subject_id: subject_id.to_string(),
        domain: S::DOMAIN,
        product_id: product_id.map(str::to_string),
        state: classification.state,
        state_since: classification.since,
        rule: classification.rule,
        last_qualifying_event_at: counters.last_qualifying_at,
        counters: counters.to_subject_counters(as_of),
        account,
    }
}
