//! Single-threaded analysis pipeline.
//!
//! [`AnalysisInput`] is the immutable snapshot of one run: validated events,
//! the entity directory, the per-subject activity index and the metric
//! horizon, all bound to a single as-of instant. Each table is a pure function
//! of the snapshot, so the runtime crate can evaluate them on separate
//! workers and get the same result as [`run_analysis`].

use std::path::Path;

use chrono::{DateTime, Utc};
use lifecycle_core::config::EngineConfig;
use lifecycle_core::diagnostics::{DiagnosticKind, DiagnosticsReport};
use lifecycle_core::error::Result;
use lifecycle_core::models::{AccountState, Event, LifecycleRecord, PlatformState, ProductState};
use lifecycle_core::time_utils::DayBucketer;
use tracing::{info, warn};

use crate::acceptance::{check_compliance, check_freshness};
use crate::aggregator::{
    activity_metrics, overall_metrics, segment_metrics, ActivityMetricsRow, DailyBase,
    MetricHorizon, OverallMetricsRow, SegmentMetricsRow,
};
use crate::classifier::{classify_accounts, classify_platform, classify_products};
use crate::directory::EntityDirectory;
use crate::enrich::ActivityIndex;
use crate::funnel::{analyze_funnels, FunnelTables};
use crate::reader::{load_events, EventContract, LoadedEvents};

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Everything one run reads. Never mutated once built.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub as_of: DateTime<Utc>,
    pub config: EngineConfig,
    pub bucketer: DayBucketer,
    pub loaded: LoadedEvents,
    pub directory: EntityDirectory,
    pub index: ActivityIndex,
    pub horizon: MetricHorizon,
    /// Diagnostics raised while loading and indexing.
    pub diagnostics: DiagnosticsReport,
}

/// Load the event log and directory for `as_of`.
///
/// Fails when compliance drops under the configured floor.
pub fn load_inputs(
    events_path: &Path,
    directory_path: &Path,
    config: &EngineConfig,
    as_of: DateTime<Utc>,
) -> Result<(LoadedEvents, EntityDirectory, DiagnosticsReport)> {
    let bucketer = config.bucketer();
    let contract = EventContract::new(bucketer, &config.validation, as_of)?;
    let loaded = load_events(events_path, &contract)?;
    check_compliance(&loaded.contract, &config.validation)?;

    let mut diagnostics = DiagnosticsReport::new(loaded.contract.clone());
    let directory = EntityDirectory::load(directory_path, &mut diagnostics)?;
    info!(
        "Loaded {} events from {} files ({:.2}% compliant)",
        loaded.events.len(),
        loaded.files,
        diagnostics.compliance_pct
    );
    Ok((loaded, directory, diagnostics))
}

impl AnalysisInput {
    /// Load inputs and build the activity index in one pass.
    pub fn load(
        events_path: &Path,
        directory_path: &Path,
        config: EngineConfig,
        as_of: DateTime<Utc>,
    ) -> Result<Self> {
        let (loaded, directory, mut diagnostics) =
            load_inputs(events_path, directory_path, &config, as_of)?;
        let index = ActivityIndex::build(&loaded.events, &directory, &config, &mut diagnostics);
        Self::assemble(loaded, directory, index, config, as_of, diagnostics)
    }

    /// Bind already-built parts into a snapshot. Incremental mode uses this
    /// with an index folded forward from persisted state.
    pub fn assemble(
        loaded: LoadedEvents,
        directory: EntityDirectory,
        index: ActivityIndex,
        config: EngineConfig,
        as_of: DateTime<Utc>,
        mut diagnostics: DiagnosticsReport,
    ) -> Result<Self> {
        let bucketer = config.bucketer();
        let horizon = MetricHorizon::new(bucketer.day_of(as_of), &config.metrics)?;

        let freshness = check_freshness(&loaded.events, as_of, config.validation.freshness_max_hours);
        if !freshness.passed {
            warn!(
                "Newest event is older than {} hours at {}",
                freshness.max_hours, as_of
            );
            diagnostics.push(
                DiagnosticKind::FreshnessBreach,
                "event_log",
                match freshness.age_hours {
                    Some(age) => format!("newest event is {age:.2} hours old"),
                    None => "no events".to_string(),
                },
            );
        }
        diagnostics.freshness = Some(freshness);

        Ok(Self {
            as_of,
            config,
            bucketer,
            loaded,
            directory,
            index,
            horizon,
            diagnostics,
        })
    }

    pub fn events(&self) -> &[Event] {
        &self.loaded.events
    }

    // ── Lifecycle domains ─────────────────────────────────────────────────────

    pub fn platform_lifecycle(&self) -> (Vec<LifecycleRecord<PlatformState>>, DiagnosticsReport) {
        let mut diags = DiagnosticsReport::default();
        let rows = classify_platform(
            &self.directory,
            &self.index,
            &self.config.platform,
            self.as_of,
            &mut diags,
        );
        (rows, diags)
    }

    pub fn account_lifecycle(&self) -> (Vec<LifecycleRecord<AccountState>>, DiagnosticsReport) {
        let mut diags = DiagnosticsReport::default();
        let rows = classify_accounts(
            &self.directory,
            &self.index,
            &self.config.account,
            &self.config.health,
            self.as_of,
            &mut diags,
        );
        (rows, diags)
    }

    pub fn product_lifecycle(&self) -> (Vec<LifecycleRecord<ProductState>>, DiagnosticsReport) {
        let mut diags = DiagnosticsReport::default();
        let rows = classify_products(
            &self.directory,
            &self.index,
            &self.config.product,
            self.as_of,
            &mut diags,
        );
        (rows, diags)
    }

    // ── Metric scopes ─────────────────────────────────────────────────────────

    pub fn daily_base(&self) -> DailyBase {
        DailyBase::build(self.events(), &self.horizon, &self.bucketer, &self.config.metrics)
    }

    pub fn overall_metrics(&self, base: &DailyBase) -> Vec<OverallMetricsRow> {
        overall_metrics(base, &self.horizon, &self.config.metrics)
    }

    pub fn activity_metrics(&self, base: &DailyBase) -> Vec<ActivityMetricsRow> {
        activity_metrics(base, &self.horizon, &self.config.metrics)
    }

    pub fn segment_metrics(&self) -> Vec<SegmentMetricsRow> {
        segment_metrics(self.events(), &self.directory, &self.horizon, &self.bucketer)
    }

    pub fn funnels(&self) -> FunnelTables {
        analyze_funnels(self.events(), &self.config.funnels, &self.horizon, &self.bucketer)
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

/// Every table one run produces.
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub as_of: DateTime<Utc>,
    pub platform: Vec<LifecycleRecord<PlatformState>>,
    pub account: Vec<LifecycleRecord<AccountState>>,
    pub product: Vec<LifecycleRecord<ProductState>>,
    pub overall: Vec<OverallMetricsRow>,
    pub segments: Vec<SegmentMetricsRow>,
    pub activity: Vec<ActivityMetricsRow>,
    pub funnels: FunnelTables,
    pub diagnostics: DiagnosticsReport,
}

/// Compute every table on the calling thread.
pub fn run_analysis(input: &AnalysisInput) -> AnalysisOutput {
    let mut diagnostics = input.diagnostics.clone();

    let (platform, d) = input.platform_lifecycle();
    diagnostics.absorb(d);
    let (account, d) = input.account_lifecycle();
    diagnostics.absorb(d);
    let (product, d) = input.product_lifecycle();
    diagnostics.absorb(d);

    let base = input.daily_base();
    let output = AnalysisOutput {
        as_of: input.as_of,
        platform,
        account,
        product,
        overall: input.overall_metrics(&base),
        segments: input.segment_metrics(),
        activity: input.activity_metrics(&base),
        funnels: input.funnels(),
        diagnostics,
    };
    info!(
        "Analysis complete: {} users, {} accounts, {} product pairs",
        output.platform.len(),
        output.account.len(),
        output.product.len()
    );
    output
}
