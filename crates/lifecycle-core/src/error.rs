use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

/// All errors produced by the lifecycle engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A file could not be opened or read from disk.
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document could not be parsed.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// A timestamp string did not match any recognised format.
    #[error("Invalid timestamp format: {0}")]
    TimestampParse(String),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The entity directory is structurally unusable.
    #[error("Invalid entity directory: {0}")]
    DirectoryInvalid(String),

    /// Too many input records failed the input contract.
    #[error("Input contract compliance {compliance_pct:.2}% is below the {floor_pct:.2}% floor ({excluded} of {total} records excluded)")]
    InputContract {
        compliance_pct: f64,
        floor_pct: f64,
        excluded: u64,
        total: u64,
    },

    /// The calendar spine does not cover the requested horizon.
    #[error("Calendar spine gap: {missing} is not covered by {start}..={end}")]
    AggregationGap {
        missing: NaiveDate,
        start: NaiveDate,
        end: NaiveDate,
    },

    /// Output tables could not be swapped into place.
    #[error("Failed to publish outputs to {path}: {reason}")]
    Publish { path: PathBuf, reason: String },

    /// The run was cancelled before publication.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Pass-through for any raw I/O error that does not carry a path.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for errors from third-party crates via `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias used throughout the engine crates.
pub type Result<T> = std::result::Result<T, EngineError>;
