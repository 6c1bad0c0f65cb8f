//! Enriched view of the event log.
//!
//! [`ActivityIndex`] folds events into per-subject counters, once per run:
//! one entry per user for the platform domain, one per (user, product) pair
//! that has at least one attributed event for the product domain, and one
//! per account-entity emitter. Pairs with no events are never materialised.

use std::collections::BTreeMap;

use lifecycle_core::config::EngineConfig;
use lifecycle_core::counters::ActivityCounters;
use lifecycle_core::diagnostics::{DiagnosticKind, DiagnosticsReport};
use lifecycle_core::models::{EntityType, Event};
use serde::{Deserialize, Serialize};

use crate::directory::{EntityDirectory, ProductResolution};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityIndex {
    /// user_id → counters over all of the user's events.
    pub users: BTreeMap<String, ActivityCounters>,
    /// user_id → product_id → counters over events rolled up to that
    /// tier=product node.
    pub user_products: BTreeMap<String, BTreeMap<String, ActivityCounters>>,
    /// account_id → counters over events emitted by the account itself.
    pub account_entities: BTreeMap<String, ActivityCounters>,
}

impl ActivityIndex {
    /// Build the index from timestamp-ordered events.
    pub fn build(
        events: &[Event],
        directory: &EntityDirectory,
        config: &EngineConfig,
        diagnostics: &mut DiagnosticsReport,
    ) -> Self {
        let mut index = Self::default();
        for event in events {
            index.observe(event, directory, config, diagnostics);
        }
        index
    }

    /// Fold one event in. Returns `false` when the event is older than what
    /// the affected counters have already seen.
    pub fn observe(
        &mut self,
        event: &Event,
        directory: &EntityDirectory,
        config: &EngineConfig,
        diagnostics: &mut DiagnosticsReport,
    ) -> bool {
        match event.entity_type {
            EntityType::User => self.observe_user(event, directory, config, diagnostics),
            EntityType::Account => self
                .account_entities
                .entry(event.entity_id.clone())
                .or_default()
                .observe(
                    event.timestamp,
                    event.is_qualifying_event,
                    event.is_activation_event,
                    config.account.utilization_window_days,
                ),
            EntityType::System | EntityType::Admin => true,
        }
    }

    fn observe_user(
        &mut self,
        event: &Event,
        directory: &EntityDirectory,
        config: &EngineConfig,
        diagnostics: &mut DiagnosticsReport,
    ) -> bool {
        let user_id = &event.entity_id;
        let in_order = self.users.entry(user_id.clone()).or_default().observe(
            event.timestamp,
            event.is_qualifying_event,
            event.is_activation_event,
            config.platform.active_window_days,
        );
        if !in_order {
            return false;
        }

        let Some(raw_product) = event.product_id.as_deref() else {
            return true;
        };
        let product_id = match directory.resolve_product(raw_product) {
            ProductResolution::Product(id) => id,
            ProductResolution::Family => {
                diagnostics.push(
                    DiagnosticKind::UnattributedProductEvent,
                    raw_product,
                    "family-level event is not tracked per product",
                );
                return true;
            }
            ProductResolution::Invalid => {
                diagnostics.push(
                    DiagnosticKind::UnattributedProductEvent,
                    raw_product,
                    "product node is not part of a valid taxonomy chain",
                );
                return true;
            }
            ProductResolution::Unknown => {
                diagnostics.push(DiagnosticKind::UnknownProduct, raw_product, "not in directory");
                return true;
            }
        };

        self.user_products
            .entry(user_id.clone())
            .or_default()
            .entry(product_id.to_string())
            .or_default()
            .observe(
                event.timestamp,
                event.is_qualifying_event,
                event.is_activation_event,
                config.product.active_window_days,
            )
    }

    pub fn user(&self, user_id: &str) -> Option<&ActivityCounters> {
        self.users.get(user_id)
    }

    /// Counters for one (user, product) pair; `None` for unindexed pairs.
    pub fn user_product(&self, user_id: &str, product_id: &str) -> Option<&ActivityCounters> {
        self.user_products.get(user_id)?.get(product_id)
    }

    /// Every indexed pair, ordered by user then product.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str, &ActivityCounters)> {
        self.user_products.iter().flat_map(|(user, products)| {
            products
                .iter()
                .map(move |(product, counters)| (user.as_str(), product.as_str(), counters))
        })
    }

    pub fn pair_count(&self) -> usize {
        self.user_products.values().map(BTreeMap::len).sum()
    }
}
