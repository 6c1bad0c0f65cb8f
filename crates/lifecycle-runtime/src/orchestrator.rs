//! Parallel run orchestrator.
//!
//! Wraps one [`AnalysisInput`] snapshot in an `Arc` and evaluates the three
//! lifecycle domains, the metric scopes and the funnels on separate blocking
//! workers. Results are joined before anything is published, and dropping the
//! run future (Ctrl-C) stops the publish before its final swap, so the
//! previous outputs stay authoritative.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lifecycle_core::error::{EngineError, Result};
use lifecycle_core::settings::RunMode;
use lifecycle_data::analysis::{AnalysisInput, AnalysisOutput};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::publisher::Publisher;

// ── Public types ──────────────────────────────────────────────────────────────

/// Row counts of a published run, for the final log line.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub published_to: PathBuf,
    pub platform_rows: usize,
    pub account_rows: usize,
    pub product_rows: usize,
    pub metric_rows: usize,
    pub diagnostics: usize,
}

// ── RunOrchestrator ───────────────────────────────────────────────────────────

pub struct RunOrchestrator {
    input: Arc<AnalysisInput>,
}

impl RunOrchestrator {
    pub fn new(input: AnalysisInput) -> Self {
        Self {
            input: Arc::new(input),
        }
    }

    pub fn input(&self) -> &AnalysisInput {
        &self.input
    }

    /// Evaluate every table on blocking workers and join the results.
    pub async fn run(&self) -> Result<AnalysisOutput> {
        let platform = self.spawn(|i| i.platform_lifecycle());
        let account = self.spawn(|i| i.account_lifecycle());
        let product = self.spawn(|i| i.product_lifecycle());
        let segments = self.spawn(|i| i.segment_metrics());
        let funnels = self.spawn(|i| i.funnels());
        let base = self.spawn(|i| i.daily_base());

        let base = Arc::new(join(base, "daily_base").await?);
        let overall = {
            let (input, base) = (Arc::clone(&self.input), Arc::clone(&base));
            tokio::task::spawn_blocking(move || input.overall_metrics(&base))
        };
        let activity = {
            let (input, base) = (Arc::clone(&self.input), Arc::clone(&base));
            tokio::task::spawn_blocking(move || input.activity_metrics(&base))
        };

        let mut diagnostics = self.input.diagnostics.clone();
        let (platform, d) = join(platform, "platform").await?;
        diagnostics.absorb(d);
        let (account, d) = join(account, "account").await?;
        diagnostics.absorb(d);
        let (product, d) = join(product, "product").await?;
        diagnostics.absorb(d);

        let output = AnalysisOutput {
            as_of: self.input.as_of,
            platform,
            account,
            product,
            overall: join(overall, "overall").await?,
            segments: join(segments, "segment").await?,
            activity: join(activity, "activity").await?,
            funnels: join(funnels, "funnel").await?,
            diagnostics,
        };
        debug!("All workers joined");
        Ok(output)
    }

    /// Run, then publish under `publisher` on a blocking worker.
    pub async fn run_and_publish(&self, publisher: Publisher, mode: RunMode) -> Result<RunSummary> {
        let output = self.run().await?;
        let as_of_date = self.input.horizon.as_of_date;

        let summary = RunSummary {
            published_to: publisher.target_dir(as_of_date),
            platform_rows: output.platform.len(),
            account_rows: output.account.len(),
            product_rows: output.product.len(),
            metric_rows: output.overall.len() + output.segments.len() + output.activity.len(),
            diagnostics: output.diagnostics.entries.len(),
        };

        // Dropping this future flags the blocking publish, which then stops
        // before swapping the new directory in.
        let cancelled = Arc::new(AtomicBool::new(false));
        let guard = CancelOnDrop::new(Arc::clone(&cancelled));
        let handle = tokio::task::spawn_blocking(move || {
            publisher.publish_unless_cancelled(&output, as_of_date, mode.as_str(), &cancelled)
        });
        join(handle, "publish").await??;
        guard.disarm();

        info!(
            "Run complete: {} users, {} accounts, {} product pairs, {} metric rows, {} diagnostics",
            summary.platform_rows,
            summary.account_rows,
            summary.product_rows,
            summary.metric_rows,
            summary.diagnostics
        );
        Ok(summary)
    }

    fn spawn<T, F>(&self, f: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&AnalysisInput) -> T + Send + 'static,
    {
        let input = Arc::clone(&self.input);
        tokio::task::spawn_blocking(move || f(&input))
    }
}

/// Sets the flag when dropped unless disarmed first.
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

async fn join<T>(handle: JoinHandle<T>, worker: &str) -> Result<T> {
    handle.await.map_err(|e| {
        if e.is_cancelled() {
            EngineError::Cancelled(format!("{worker} worker cancelled"))
        } else {
            EngineError::Other(anyhow::anyhow!("{worker} worker failed: {e}"))
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{LIFECYCLE_PLATFORM, MANIFEST, OVERALL_METRICS};
    use crate::test_support::{as_of, write_directory, write_events};
    use lifecycle_core::config::EngineConfig;
    use lifecycle_data::analysis::run_analysis;
    use tempfile::TempDir;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.metrics.detail_months = 2;
        config
    }

    fn load(tmp: &TempDir) -> AnalysisInput {
        let events = write_events(
            tmp.path(),
            "part-0.jsonl",
            &[("e1", "u1", 40), ("e2", "u1", 3), ("e3", "u2", 35), ("e4", "u3", 0)],
        );
        let directory = write_directory(tmp.path());
        AnalysisInput::load(&events, &directory, config(), as_of()).unwrap()
    }

    #[tokio::test]
    async fn test_parallel_run_matches_sequential() {
        let tmp = TempDir::new().unwrap();
        let input = load(&tmp);
        let sequential = run_analysis(&input);

        let orchestrator = RunOrchestrator::new(input);
        let parallel = orchestrator.run().await.unwrap();

        assert_eq!(parallel.platform, sequential.platform);
        assert_eq!(parallel.account, sequential.account);
        assert_eq!(parallel.product, sequential.product);
        assert_eq!(parallel.overall, sequential.overall);
        assert_eq!(parallel.segments, sequential.segments);
        assert_eq!(parallel.activity, sequential.activity);
        assert_eq!(parallel.funnels, sequential.funnels);
        assert_eq!(parallel.diagnostics, sequential.diagnostics);
    }

    #[tokio::test]
    async fn test_identical_runs_publish_identical_bytes() {
        let tmp = TempDir::new().unwrap();
        let out_a = tmp.path().join("out-a");
        let out_b = tmp.path().join("out-b");

        let first = RunOrchestrator::new(load(&tmp))
            .run_and_publish(Publisher::new(&out_a), RunMode::Batch)
            .await
            .unwrap();
        let second = RunOrchestrator::new(load(&tmp))
            .run_and_publish(Publisher::new(&out_b), RunMode::Batch)
            .await
            .unwrap();
        assert_eq!(first.platform_rows, 3);

        let mut names: Vec<String> = std::fs::read_dir(&first.published_to)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert!(names.contains(&OVERALL_METRICS.to_string()));
        assert!(names.contains(&LIFECYCLE_PLATFORM.to_string()));
        assert!(names.contains(&MANIFEST.to_string()));
        for name in names {
            let a = std::fs::read(first.published_to.join(&name)).unwrap();
            let b = std::fs::read(second.published_to.join(&name)).unwrap();
            assert_eq!(a, b, "{name} differs between runs");
        }
    }

    #[test]
    fn test_cancel_guard_flags_only_when_dropped_armed() {
        let flag = Arc::new(AtomicBool::new(false));
        CancelOnDrop::new(Arc::clone(&flag)).disarm();
        assert!(!flag.load(Ordering::SeqCst));

        drop(CancelOnDrop::new(Arc::clone(&flag)));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_run_publishes_nothing() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let orchestrator = RunOrchestrator::new(load(&tmp));

        // The run is polled once, then dropped while its workers are busy.
        tokio::select! {
            biased;
            _ = orchestrator.run_and_publish(Publisher::new(&out), RunMode::Batch) => {}
            _ = std::future::ready(()) => {}
        }
        assert!(!out.join("as_of=2024-06-30").exists());
    }
}
