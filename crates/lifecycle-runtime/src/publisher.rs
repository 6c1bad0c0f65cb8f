//! Atomic publication of a run's output tables.
//!
//! Tables are written into a hidden staging directory next to the target and
//! swapped into place with renames. A run that fails or is cancelled before
//! the swap leaves the previous `as_of=<date>` directory untouched.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use lifecycle_core::error::{EngineError, Result};
use lifecycle_data::analysis::AnalysisOutput;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const OVERALL_METRICS: &str = "overall_metrics.jsonl";
pub const SEGMENT_METRICS: &str = "segment_metrics.jsonl";
pub const ACTIVITY_METRICS: &str = "activity_metrics.jsonl";
pub const LIFECYCLE_PLATFORM: &str = "lifecycle_platform.jsonl";
pub const LIFECYCLE_ACCOUNT: &str = "lifecycle_account.jsonl";
pub const LIFECYCLE_PRODUCT: &str = "lifecycle_product.jsonl";
pub const FUNNEL_RECORDS: &str = "funnel_records.jsonl";
pub const FUNNEL_SUMMARY: &str = "funnel_summary.jsonl";
pub const DIAGNOSTICS: &str = "diagnostics.json";
pub const MANIFEST: &str = "manifest.json";

const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// Written last into every published directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub as_of: DateTime<Utc>,
    pub as_of_date: NaiveDate,
    pub mode: String,
    pub engine_version: String,
    /// File name → row count.
    pub tables: BTreeMap<String, usize>,
}

/// Name of the published directory for one as-of date.
pub fn partition_name(as_of_date: NaiveDate) -> String {
    format!("as_of={}", as_of_date.format("%Y-%m-%d"))
}

pub struct Publisher {
    root: PathBuf,
}

impl Publisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target_dir(&self, as_of_date: NaiveDate) -> PathBuf {
        self.root.join(partition_name(as_of_date))
    }

    /// Write every table of `output` and swap it in as
    /// `<root>/as_of=<as_of_date>`. Returns the published directory.
    pub fn publish(&self, output: &AnalysisOutput, as_of_date: NaiveDate, mode: &str) -> Result<PathBuf> {
        self.publish_unless_cancelled(output, as_of_date, mode, &AtomicBool::new(false))
    }

    /// Like [`Publisher::publish`], but gives up with
    /// [`EngineError::Cancelled`] if `cancelled` is set before the swap
    /// starts. Once the swap has started it runs to completion.
    pub fn publish_unless_cancelled(
        &self,
        output: &AnalysisOutput,
        as_of_date: NaiveDate,
        mode: &str,
        cancelled: &AtomicBool,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).map_err(|e| self.publish_error(&self.root, e))?;
        self.clean_stale()?;

        let partition = partition_name(as_of_date);
        let staging = self
            .root
            .join(format!("{STAGING_PREFIX}{partition}-{}", std::process::id()));
        fs::create_dir_all(&staging).map_err(|e| self.publish_error(&staging, e))?;

        if let Err(e) = self.write_tables(&staging, output, as_of_date, mode) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        if cancelled.load(Ordering::SeqCst) {
            let _ = fs::remove_dir_all(&staging);
            return Err(EngineError::Cancelled(format!("publish of {partition} cancelled")));
        }

        let target = self.target_dir(as_of_date);
        self.swap_into_place(&staging, &target, &partition)?;
        info!("Published {} to {}", partition, target.display());
        Ok(target)
    }

    fn write_tables(
        &self,
        dir: &Path,
        output: &AnalysisOutput,
        as_of_date: NaiveDate,
        mode: &str,
    ) -> Result<()> {
        let mut tables = BTreeMap::new();
        tables.insert(OVERALL_METRICS.to_string(), write_jsonl(dir, OVERALL_METRICS, &output.overall)?);
        tables.insert(SEGMENT_METRICS.to_string(), write_jsonl(dir, SEGMENT_METRICS, &output.segments)?);
        tables.insert(ACTIVITY_METRICS.to_string(), write_jsonl(dir, ACTIVITY_METRICS, &output.activity)?);
        tables.insert(LIFECYCLE_PLATFORM.to_string(), write_jsonl(dir, LIFECYCLE_PLATFORM, &output.platform)?);
        tables.insert(LIFECYCLE_ACCOUNT.to_string(), write_jsonl(dir, LIFECYCLE_ACCOUNT, &output.account)?);
        tables.insert(LIFECYCLE_PRODUCT.to_string(), write_jsonl(dir, LIFECYCLE_PRODUCT, &output.product)?);
        tables.insert(
            FUNNEL_RECORDS.to_string(),
            write_jsonl(dir, FUNNEL_RECORDS, &output.funnels.records)?,
        );
        tables.insert(
            FUNNEL_SUMMARY.to_string(),
            write_jsonl(dir, FUNNEL_SUMMARY, &output.funnels.summary)?,
        );
        write_json(dir, DIAGNOSTICS, &output.diagnostics)?;

        let manifest = Manifest {
            as_of: output.as_of,
            as_of_date,
            mode: mode.to_string(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            tables,
        };
        write_json(dir, MANIFEST, &manifest)
    }

    /// Rename `staging` to `target`, retiring any previous `target` first and
    /// restoring it if the final rename fails.
    fn swap_into_place(&self, staging: &Path, target: &Path, partition: &str) -> Result<()> {
        let retired = self
            .root
            .join(format!("{RETIRED_PREFIX}{partition}-{}", std::process::id()));
        let had_previous = target.exists();
        if had_previous {
            fs::rename(target, &retired).map_err(|e| self.publish_error(target, e))?;
        }

        if let Err(e) = fs::rename(staging, target) {
            if had_previous {
                if let Err(restore) = fs::rename(&retired, target) {
                    warn!("Could not restore {}: {}", target.display(), restore);
                }
            }
            let _ = fs::remove_dir_all(staging);
            return Err(self.publish_error(target, e));
        }

        if had_previous {
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!("Could not remove retired output {}: {}", retired.display(), e);
            }
        }
        Ok(())
    }

    /// Remove staging directories left by crashed runs. A retired directory
    /// whose partition is missing is put back; otherwise it is removed.
    pub fn clean_stale(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.publish_error(&self.root, e)),
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if name.starts_with(STAGING_PREFIX) {
                debug!("Removing stale staging directory {}", path.display());
                fs::remove_dir_all(&path).map_err(|e| self.publish_error(&path, e))?;
            } else if let Some(rest) = name.strip_prefix(RETIRED_PREFIX) {
                let partition = rest.rsplit_once('-').map_or(rest, |(p, _)| p);
                let target = self.root.join(partition);
                if target.exists() {
                    fs::remove_dir_all(&path).map_err(|e| self.publish_error(&path, e))?;
                } else {
                    warn!("Restoring {} from an interrupted publish", partition);
                    fs::rename(&path, &target).map_err(|e| self.publish_error(&target, e))?;
                }
            }
        }
        Ok(())
    }

    fn publish_error(&self, path: &Path, e: std::io::Error) -> EngineError {
        EngineError::Publish {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    }
}

/// Write `rows` as JSON lines. Returns the row count.
fn write_jsonl<T: Serialize>(dir: &Path, name: &str, rows: &[T]) -> Result<usize> {
    let path = dir.join(name);
    let file = File::create(&path).map_err(|e| EngineError::Publish {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(rows.len())
}

fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let path = dir.join(name);
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    fs::write(&path, content).map_err(|e| EngineError::Publish {
        path,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lifecycle_core::diagnostics::DiagnosticsReport;
    use lifecycle_data::funnel::FunnelTables;
    use tempfile::TempDir;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    fn empty_output() -> AnalysisOutput {
        AnalysisOutput {
            as_of: as_of(),
            platform: vec![],
            account: vec![],
            product: vec![],
            overall: vec![],
            segments: vec![],
            activity: vec![],
            funnels: FunnelTables::default(),
            diagnostics: DiagnosticsReport::default(),
        }
    }

    #[test]
    fn test_publish_writes_every_table_and_manifest() {
        let tmp = TempDir::new().unwrap();
        let publisher = Publisher::new(tmp.path().join("out"));
        let dir = publisher.publish(&empty_output(), date(), "batch").unwrap();

        assert_eq!(dir, tmp.path().join("out").join("as_of=2024-06-30"));
        for name in [
            OVERALL_METRICS,
            SEGMENT_METRICS,
            ACTIVITY_METRICS,
            LIFECYCLE_PLATFORM,
            LIFECYCLE_ACCOUNT,
            LIFECYCLE_PRODUCT,
            FUNNEL_RECORDS,
            FUNNEL_SUMMARY,
            DIAGNOSTICS,
            MANIFEST,
        ] {
            assert!(dir.join(name).is_file(), "missing {name}");
        }

        let manifest: Manifest =
            serde_json::from_str(&fs::read_to_string(dir.join(MANIFEST)).unwrap()).unwrap();
        assert_eq!(manifest.as_of, as_of());
        assert_eq!(manifest.mode, "batch");
        assert_eq!(manifest.tables.len(), 8);
    }

    #[test]
    fn test_republish_replaces_previous_output() {
        let tmp = TempDir::new().unwrap();
        let publisher = Publisher::new(tmp.path());
        let dir = publisher.publish(&empty_output(), date(), "batch").unwrap();
        fs::write(dir.join("leftover.txt"), "old").unwrap();

        publisher.publish(&empty_output(), date(), "incremental").unwrap();
        assert!(!dir.join("leftover.txt").exists());

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["as_of=2024-06-30".to_string()]);
    }

    #[test]
    fn test_cancelled_publish_keeps_previous_output() {
        let tmp = TempDir::new().unwrap();
        let publisher = Publisher::new(tmp.path());
        let dir = publisher.publish(&empty_output(), date(), "batch").unwrap();
        fs::write(dir.join("marker.txt"), "previous").unwrap();

        let err = publisher
            .publish_unless_cancelled(&empty_output(), date(), "batch", &AtomicBool::new(true))
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)));
        assert!(dir.join("marker.txt").is_file());

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["as_of=2024-06-30".to_string()]);
    }

    #[test]
    fn test_stale_staging_is_removed_and_retired_restored() {
        let tmp = TempDir::new().unwrap();
        let stale = tmp.path().join(".staging-as_of=2024-06-29-999");
        fs::create_dir_all(&stale).unwrap();
        let retired = tmp.path().join(".retired-as_of=2024-06-28-999");
        fs::create_dir_all(&retired).unwrap();
        fs::write(retired.join(MANIFEST), "{}").unwrap();

        let publisher = Publisher::new(tmp.path());
        publisher.clean_stale().unwrap();

        assert!(!stale.exists());
        assert!(!retired.exists());
        assert!(tmp.path().join("as_of=2024-06-28").join(MANIFEST).is_file());
    }
}
