//! Incremental mode: fold only new events into a persisted activity index.
//!
//! The state file holds the per-subject counters from the previous run, the
//! newest event timestamp folded (the watermark) and how many events were at
//! or before it. Lifecycle tables are then produced by the same rule sets as
//! batch mode; metric scopes and funnels are recomputed from the full log.
//!
//! The state is rebuilt from scratch when it is missing, when the
//! configuration or directory changed, or when the log holds events at or
//! before the watermark that were never folded.

use std::path::Path;

use chrono::{DateTime, Utc};
use lifecycle_core::config::EngineConfig;
use lifecycle_core::diagnostics::{DiagnosticKind, DiagnosticsReport};
use lifecycle_core::error::{EngineError, Result};
use lifecycle_data::analysis::{load_inputs, AnalysisInput};
use lifecycle_data::directory::EntityDirectory;
use lifecycle_data::enrich::ActivityIndex;
use lifecycle_data::reader::LoadedEvents;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const STATE_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalState {
    pub version: u32,
    /// Newest event timestamp folded into `index`.
    pub watermark: Option<DateTime<Utc>>,
    /// Number of events at or before `watermark` when it was set.
    pub events_folded: u64,
    pub config: EngineConfig,
    /// Hex SHA-256 of the directory document.
    pub directory_digest: String,
    pub index: ActivityIndex,
}

impl IncrementalState {
    /// Read the state file. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(EngineError::FileRead {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let state: Self = serde_json::from_str(&content)?;
        if state.version != STATE_VERSION {
            warn!(
                "Ignoring incremental state version {} (expected {})",
                state.version, STATE_VERSION
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Write the state, via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved incremental state to {}", path.display());
        Ok(())
    }
}

/// Why the state was rebuilt rather than folded forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    NoState,
    ConfigChanged,
    DirectoryChanged,
    OutOfOrderEvents,
}

/// A snapshot ready for the orchestrator plus the state to persist once the
/// run has published.
pub struct IncrementalRun {
    pub input: AnalysisInput,
    pub state: IncrementalState,
    pub rebuilt: Option<RebuildReason>,
    /// Events folded into the index during this run.
    pub folded: usize,
}

/// SHA-256 of the directory document, hex encoded. Stable across builds.
pub fn directory_digest(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let bytes = std::fs::read(path).map_err(|source| EngineError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Load inputs and fold new events into the persisted index at `state_path`.
pub fn prepare_incremental(
    events_path: &Path,
    directory_path: &Path,
    config: EngineConfig,
    as_of: DateTime<Utc>,
    state_path: &Path,
) -> Result<IncrementalRun> {
    let (loaded, directory, mut diagnostics) =
        load_inputs(events_path, directory_path, &config, as_of)?;
    let digest = directory_digest(directory_path)?;
    let previous = IncrementalState::load(state_path)?;

    let (index, rebuilt, folded) = match previous {
        None => rebuild(&loaded, &directory, &config, &mut diagnostics, RebuildReason::NoState),
        Some(state) if state.config != config => {
            rebuild(&loaded, &directory, &config, &mut diagnostics, RebuildReason::ConfigChanged)
        }
        Some(state) if state.directory_digest != digest => {
            rebuild(&loaded, &directory, &config, &mut diagnostics, RebuildReason::DirectoryChanged)
        }
        Some(state) => {
            let at_or_before = state
                .watermark
                .map_or(0, |w| loaded.events.iter().filter(|e| e.timestamp <= w).count() as u64);
            if at_or_before != state.events_folded {
                diagnostics.push(
                    DiagnosticKind::OutOfOrderEvent,
                    "event_log",
                    format!(
                        "{} events at or before watermark {:?}, {} folded",
                        at_or_before, state.watermark, state.events_folded
                    ),
                );
                rebuild(&loaded, &directory, &config, &mut diagnostics, RebuildReason::OutOfOrderEvents)
            } else {
                let mut index = state.index;
                let mut folded = 0usize;
                for event in loaded
                    .events
                    .iter()
                    .filter(|e| state.watermark.map_or(true, |w| e.timestamp > w))
                {
                    index.observe(event, &directory, &config, &mut diagnostics);
                    folded += 1;
                }
                (index, None, folded)
            }
        }
    };

    let state = IncrementalState {
        version: STATE_VERSION,
        watermark: loaded.events.iter().map(|e| e.timestamp).max(),
        events_folded: loaded.events.len() as u64,
        config: config.clone(),
        directory_digest: digest,
        index: index.clone(),
    };
    info!(
        "Incremental: {} events folded{}",
        folded,
        match rebuilt {
            Some(reason) => format!(" (rebuilt: {reason:?})"),
            None => String::new(),
        }
    );

    let input = AnalysisInput::assemble(loaded, directory, index, config, as_of, diagnostics)?;
    Ok(IncrementalRun {
        input,
        state,
        rebuilt,
        folded,
    })
}

fn rebuild(
    loaded: &LoadedEvents,
    directory: &EntityDirectory,
    config: &EngineConfig,
    diagnostics: &mut DiagnosticsReport,
    reason: RebuildReason,
) -> (ActivityIndex, Option<RebuildReason>, usize) {
    let index = ActivityIndex::build(&loaded.events, directory, config, diagnostics);
    (index, Some(reason), loaded.events.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{as_of, write_directory, write_events};
    use chrono::Duration;
    use lifecycle_data::analysis::run_analysis;
    use tempfile::TempDir;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.metrics.detail_months = 2;
        config
    }

    #[test]
    fn test_first_run_builds_state() {
        let tmp = TempDir::new().unwrap();
        let events = write_events(tmp.path(), "part-0.jsonl", &[("e1", "u1", 10), ("e2", "u2", 3)]);
        let directory = write_directory(tmp.path());
        let state_path = tmp.path().join("state.json");

        let run = prepare_incremental(&events, &directory, config(), as_of(), &state_path).unwrap();
        assert_eq!(run.rebuilt, Some(RebuildReason::NoState));
        assert_eq!(run.folded, 2);
        assert_eq!(run.state.events_folded, 2);

        run.state.save(&state_path).unwrap();
        let reloaded = IncrementalState::load(&state_path).unwrap().unwrap();
        assert_eq!(reloaded, run.state);
    }

    #[test]
    fn test_new_events_fold_forward_and_match_batch() {
        let tmp = TempDir::new().unwrap();
        let directory = write_directory(tmp.path());
        let state_path = tmp.path().join("state.json");
        let events = write_events(
            tmp.path(),
            "part-0.jsonl",
            &[("e1", "u1", 50), ("e2", "u2", 40), ("e3", "u1", 33)],
        );

        let earlier = as_of() - Duration::days(30);
        let first = prepare_incremental(&events, &directory, config(), earlier, &state_path).unwrap();
        first.state.save(&state_path).unwrap();

        write_events(tmp.path(), "part-1.jsonl", &[("e4", "u1", 5), ("e5", "u3", 1)]);
        let second = prepare_incremental(&events, &directory, config(), as_of(), &state_path).unwrap();
        assert_eq!(second.rebuilt, None);
        assert_eq!(second.folded, 2);

        let batch = AnalysisInput::load(&events, &directory, config(), as_of()).unwrap();
        assert_eq!(second.input.index, batch.index);

        let inc = run_analysis(&second.input);
        let full = run_analysis(&batch);
        assert_eq!(inc.platform, full.platform);
        assert_eq!(inc.account, full.account);
        assert_eq!(inc.product, full.product);
        assert_eq!(inc.overall, full.overall);
    }

    #[test]
    fn test_out_of_order_event_forces_rebuild() {
        let tmp = TempDir::new().unwrap();
        let directory = write_directory(tmp.path());
        let state_path = tmp.path().join("state.json");
        let events = write_events(tmp.path(), "part-0.jsonl", &[("e1", "u1", 10), ("e2", "u1", 2)]);

        let first = prepare_incremental(&events, &directory, config(), as_of(), &state_path).unwrap();
        first.state.save(&state_path).unwrap();

        // Older than the watermark, never folded.
        write_events(tmp.path(), "part-1.jsonl", &[("e0", "u2", 20)]);
        let second = prepare_incremental(&events, &directory, config(), as_of(), &state_path).unwrap();
        assert_eq!(second.rebuilt, Some(RebuildReason::OutOfOrderEvents));
        assert_eq!(second.input.diagnostics.count(DiagnosticKind::OutOfOrderEvent), 1);

        let batch = AnalysisInput::load(&events, &directory, config(), as_of()).unwrap();
        assert_eq!(second.input.index, batch.index);
    }

    #[test]
    fn test_directory_digest_is_fixed_sha256() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("directory.json");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            directory_digest(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_directory_change_forces_rebuild() {
        let tmp = TempDir::new().unwrap();
        let directory = write_directory(tmp.path());
        let state_path = tmp.path().join("state.json");
        let events = write_events(tmp.path(), "part-0.jsonl", &[("e1", "u1", 10)]);

        let first = prepare_incremental(&events, &directory, config(), as_of(), &state_path).unwrap();
        first.state.save(&state_path).unwrap();

        let mut content = std::fs::read_to_string(&directory).unwrap();
        content.push('\n');
        std::fs::write(&directory, content).unwrap();
        let second = prepare_incremental(&events, &directory, config(), as_of(), &state_path).unwrap();
        assert_eq!(second.rebuilt, Some(RebuildReason::DirectoryChanged));
    }

    #[test]
    fn test_config_change_forces_rebuild() {
        let tmp = TempDir::new().unwrap();
        let directory = write_directory(tmp.path());
        let state_path = tmp.path().join("state.json");
        let events = write_events(tmp.path(), "part-0.jsonl", &[("e1", "u1", 10)]);

        let first = prepare_incremental(&events, &directory, config(), as_of(), &state_path).unwrap();
        first.state.save(&state_path).unwrap();

        let mut changed = config();
        changed.platform.active_window_days = 14;
        let second = prepare_incremental(&events, &directory, changed, as_of(), &state_path).unwrap();
        assert_eq!(second.rebuilt, Some(RebuildReason::ConfigChanged));
    }
}
