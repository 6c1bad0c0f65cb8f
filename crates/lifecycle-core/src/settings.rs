use clap::Parser;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::time_utils::DayBucketer;

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Lifecycle classification and windowed metrics over an event log
#[derive(Parser, Debug, Clone)]
#[command(
    name = "lifecycle-engine",
    about = "Lifecycle classification and windowed metrics over an event log",
    version
)]
pub struct Settings {
    /// Event log: a .jsonl file or a directory of them
    #[arg(long)]
    pub events: PathBuf,

    /// Entity directory JSON (users, accounts, products)
    #[arg(long)]
    pub directory: PathBuf,

    /// Output root (defaults to ~/.lifecycle-engine/output)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// As-of instant (RFC 3339 or "YYYY-MM-DD HH:MM:SS"); defaults to now
    #[arg(long)]
    pub as_of: Option<String>,

    /// Engine configuration file (JSON)
    #[arg(long, env = "LIFECYCLE_ENGINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run mode
    #[arg(long, default_value = "batch", value_parser = ["batch", "incremental", "check"])]
    pub mode: String,

    /// Incremental state file (defaults to <output>/state.json)
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Reporting timezone; overrides the config file
    #[arg(long)]
    pub timezone: Option<String>,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    pub log_level: String,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

/// What a run does once inputs are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Full recomputation and publish.
    Batch,
    /// Fold new events into persisted counters, then publish.
    Incremental,
    /// Acceptance checks only; nothing is published.
    Check,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Batch => "batch",
            RunMode::Incremental => "incremental",
            RunMode::Check => "check",
        }
    }
}

// ── Settings impl ──────────────────────────────────────────────────────────────

impl Settings {
    /// Parse CLI arguments from the process and apply `--debug`.
    pub fn load() -> Self {
        Self::load_from_args(std::env::args_os().collect())
    }

    /// Same as [`Settings::load`] with an explicit argument list.
    pub fn load_from_args(args: Vec<std::ffi::OsString>) -> Self {
        let mut settings = Settings::parse_from(args);
        // --debug overrides log level.
        if settings.debug {
            settings.log_level = "DEBUG".to_string();
        }
        settings
    }

    pub fn run_mode(&self) -> RunMode {
        match self.mode.as_str() {
            "incremental" => RunMode::Incremental,
            "check" => RunMode::Check,
            _ => RunMode::Batch,
        }
    }

    /// Resolve the as-of instant: the `--as-of` value when given, otherwise
    /// `now`. This is the only place the wall clock enters a run.
    pub fn resolve_as_of(&self, bucketer: &DayBucketer, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match &self.as_of {
            Some(raw) => bucketer
                .parse_timestamp(raw)
                .ok_or_else(|| EngineError::TimestampParse(raw.clone())),
            None => Ok(now),
        }
    }

    /// Output root, falling back to `~/.lifecycle-engine/output`.
    pub fn output_dir(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(default_output_dir)
    }

    /// Incremental state file, falling back to `<output>/state.json`.
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.output_dir().join("state.json"))
    }
}

/// `~/.lifecycle-engine/output`, or `./.lifecycle-engine/output` without a
/// home directory.
pub fn default_output_dir() -> PathBuf {
    default_output_dir_in(&dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
}

/// Default output directory rooted at `base_dir` (used for testing).
pub fn default_output_dir_in(base_dir: &Path) -> PathBuf {
    base_dir.join(".lifecycle-engine").join("output")
}

// ── Tests ──────────────────────────────────────────────────────────────────────
