//! Event log discovery, loading and input-contract enforcement.
//!
//! Reads JSON-lines event files and converts every record that passes the
//! input contract into an [`Event`]. Failing records are excluded and counted
//! by reason; they never abort the load.

use std::collections::{BTreeMap, HashSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lifecycle_core::config::ValidationConfig;
use lifecycle_core::diagnostics::{ContractSummary, ViolationReason};
use lifecycle_core::error::{EngineError, Result};
use lifecycle_core::models::{EntityType, Event, Location};
use lifecycle_core::time_utils::DayBucketer;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

/// Naming convention every `event_type` must follow.
const EVENT_TYPE_PATTERN: &str = "^[a-z][a-z0-9_]*$";

// ── Contract ──────────────────────────────────────────────────────────────────

/// Input contract for event records, bound to one run's as-of instant.
#[derive(Debug, Clone)]
pub struct EventContract {
    bucketer: DayBucketer,
    min_timestamp: DateTime<Utc>,
    as_of: DateTime<Utc>,
    event_type_re: Regex,
}

impl EventContract {
    pub fn new(
        bucketer: DayBucketer,
        validation: &ValidationConfig,
        as_of: DateTime<Utc>,
    ) -> Result<Self> {
        let event_type_re = Regex::new(EVENT_TYPE_PATTERN)
            .map_err(|e| EngineError::Config(format!("event type pattern: {e}")))?;
        Ok(Self {
            bucketer,
            min_timestamp: validation.min_event_instant(),
            as_of,
            event_type_re,
        })
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    /// Validate one raw record.
    ///
    /// `fallback_id` is used when the record carries no `event_id`. Duplicate
    /// ids are not checked here; see [`load_events`].
    pub fn validate(&self, data: &Value, fallback_id: String) -> std::result::Result<Event, ViolationReason> {
        let Some(obj) = data.as_object() else {
            return Err(ViolationReason::InvalidJson);
        };

        let entity_id = required_str(obj.get("entity_id"))?;
        let entity_type_raw = required_str(obj.get("entity_type"))?;
        let event_type = required_str(obj.get("event_type"))?;
        let location_raw = required_str(obj.get("location"))?;
        let ts_value = obj.get("timestamp").filter(|v| !v.is_null());
        let Some(ts_value) = ts_value else {
            return Err(ViolationReason::MissingField);
        };

        let timestamp = self
            .bucketer
            .parse_value(ts_value)
            .ok_or(ViolationReason::BadTimestamp)?;
        if timestamp < self.min_timestamp || timestamp > self.as_of {
            return Err(ViolationReason::TimestampOutOfRange);
        }

        let entity_type: EntityType = entity_type_raw
            .parse()
            .map_err(|_| ViolationReason::BadEntityType)?;
        let location: Location = location_raw
            .parse()
            .map_err(|_| ViolationReason::BadLocation)?;
        if !self.event_type_re.is_match(&event_type) {
            return Err(ViolationReason::BadEventType);
        }

        let event_id = optional_str(obj.get("event_id")).unwrap_or(fallback_id);

        Ok(Event {
            event_id,
            entity_id,
            entity_type,
            event_type,
            timestamp,
            location,
            session_id: optional_str(obj.get("session_id")),
            product_id: optional_str(obj.get("product_id")),
            is_qualifying_event: flag(obj.get("is_qualifying_event")),
            is_activation_event: flag(obj.get("is_activation_event")),
            metadata: metadata_map(obj.get("metadata")),
        })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Events that passed the contract plus the contract tally.
#[derive(Debug, Clone, Default)]
pub struct LoadedEvents {
    /// Sorted by `(timestamp, event_id)`.
    pub events: Vec<Event>,
    pub contract: ContractSummary,
    pub files: usize,
}

/// Find all `.jsonl` files under `data_path`, sorted by path.
///
/// A path naming a single file is returned as-is.
pub fn find_jsonl_files(data_path: &Path) -> Vec<PathBuf> {
    if !data_path.exists() {
        warn!("Data path does not exist: {}", data_path.display());
        return Vec::new();
    }
    if data_path.is_file() {
        return vec![data_path.to_path_buf()];
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(data_path)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .map(|ext| ext == "jsonl")
                    .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}

/// Load every event file under `data_path` through `contract`.
///
/// Duplicate event ids keep their first accepted occurrence, in file-path
/// then line order. A missing path is an error; an empty directory is not.
pub fn load_events(data_path: &Path, contract: &EventContract) -> Result<LoadedEvents> {
    if !data_path.exists() {
        return Err(EngineError::FileRead {
            path: data_path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "event log not found"),
        });
    }

    let files = find_jsonl_files(data_path);
    if files.is_empty() {
        warn!("No JSONL files found in {}", data_path.display());
    }

    let mut loaded = LoadedEvents {
        files: files.len(),
        ..Default::default()
    };
    let mut seen_ids: HashSet<String> = HashSet::new();

    for file_path in &files {
        let label = file_label(data_path, file_path);
        process_single_file(file_path, &label, contract, &mut seen_ids, &mut loaded)?;
    }

    loaded
        .events
        .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.event_id.cmp(&b.event_id)));

    debug!(
        "Loaded {} events from {} files ({} excluded)",
        loaded.events.len(),
        files.len(),
        loaded.contract.excluded()
    );

    Ok(loaded)
}

// ── Internal helpers ──────────────────────────────────────────────────────────

/// Stable name for `file_path` used in fallback event ids: its path below
/// `data_path` with `/` separators, or the file name when `data_path` is the
/// file itself.
fn file_label(data_path: &Path, file_path: &Path) -> String {
    let relative = file_path.strip_prefix(data_path).unwrap_or(file_path);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.display().to_string())
    } else {
        parts.join("/")
    }
}

fn process_single_file(
    file_path: &Path,
    file_label: &str,
    contract: &EventContract,
    seen_ids: &mut HashSet<String>,
    loaded: &mut LoadedEvents,
) -> Result<()> {
    let file = std::fs::File::open(file_path).map_err(|source| EngineError::FileRead {
        path: file_path.to_path_buf(),
        source,
    })?;
    let reader = std::io::BufReader::new(file);

    let mut accepted = 0u64;
    let mut excluded = 0u64;

    for (idx, line_result) in reader.lines().enumerate() {
        let line = line_result.map_err(|source| EngineError::FileRead {
            path: file_path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<Value>(trimmed) {
            Ok(data) => contract.validate(&data, format!("{}:{}", file_label, idx + 1)),
            Err(e) => {
                debug!("Failed to parse JSON line {} in {}: {}", idx + 1, file_path.display(), e);
                Err(ViolationReason::InvalidJson)
            }
        };

        match outcome {
            Ok(event) if seen_ids.contains(&event.event_id) => {
                loaded.contract.record_violation(ViolationReason::DuplicateEventId);
                excluded += 1;
            }
            Ok(event) => {
                seen_ids.insert(event.event_id.clone());
                loaded.contract.record_valid();
                loaded.events.push(event);
                accepted += 1;
            }
            Err(reason) => {
                loaded.contract.record_violation(reason);
                excluded += 1;
            }
        }
    }

    debug!(
        "File {}: {} accepted, {} excluded",
        file_path.display(),
        accepted,
        excluded
    );
    Ok(())
}

/// Non-blank string field, or [`ViolationReason::MissingField`].
fn required_str(value: Option<&Value>) -> std::result::Result<String, ViolationReason> {
    optional_str(value).ok_or(ViolationReason::MissingField)
}

fn optional_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Boolean flag; accepts JSON booleans, 0/1 and `"true"`/`"false"`.
fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
        _ => false,
    }
}

/// Flatten `metadata` (an object, or an object encoded as a JSON string)
/// into string values.
fn metadata_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let parsed;
    let obj = match value {
        Some(Value::Object(map)) => map,
        Some(Value::String(s)) => {
            parsed = serde_json::from_str::<Value>(s).ok();
            match parsed.as_ref().and_then(|v| v.as_object()) {
                Some(map) => map,
                None => return BTreeMap::new(),
            }
        }
        _ => return BTreeMap::new(),
    };

    obj.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::TempDir;

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    fn contract() -> EventContract {
        EventContract::new(DayBucketer::utc(), &ValidationConfig::default(), as_of()).unwrap()
    }

    fn write_jsonl(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    fn sample_event(id: &str, ts: &str) -> Value {
        serde_json::json!({
            "event_id": id,
            "entity_id": "u_1",
            "entity_type": "user",
            "event_type": "project_create",
            "timestamp": ts,
            "location": "web_app",
            "session_id": "s_1",
            "is_qualifying_event": true,
            "metadata": "{\"account_id\": \"acc_1\", \"duration_seconds\": 42}",
        })
    }

    // ── validate ──────────────────────────────────────────────────────────────

    #[test]
    fn test_validate_accepts_well_formed_record() {
        let event = contract()
            .validate(&sample_event("e1", "2024-06-01T10:00:00Z"), "f:1".into())
            .unwrap();
        assert_eq!(event.event_id, "e1");
        assert_eq!(event.entity_type, EntityType::User);
        assert_eq!(event.location, Location::WebApp);
        assert!(event.is_qualifying_event);
        assert!(!event.is_activation_event);
        assert_eq!(event.metadata.get("account_id").map(String::as_str), Some("acc_1"));
        assert_eq!(event.metadata.get("duration_seconds").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_validate_reasons() {
        let c = contract();
        let cases: Vec<(&str, Value, ViolationReason)> = vec![
            ("entity_id", Value::Null, ViolationReason::MissingField),
            ("location", serde_json::json!("  "), ViolationReason::MissingField),
            ("timestamp", serde_json::json!("soon"), ViolationReason::BadTimestamp),
            ("timestamp", serde_json::json!("2019-12-31T23:59:59Z"), ViolationReason::TimestampOutOfRange),
            ("timestamp", serde_json::json!("2024-07-01T00:00:00Z"), ViolationReason::TimestampOutOfRange),
            ("entity_type", serde_json::json!("robot"), ViolationReason::BadEntityType),
            ("location", serde_json::json!("kiosk"), ViolationReason::BadLocation),
            ("event_type", serde_json::json!("ProjectCreate"), ViolationReason::BadEventType),
        ];
        for (field, value, expected) in cases {
            let mut record = sample_event("e1", "2024-06-01T10:00:00Z");
            record[field] = value;
            assert_eq!(
                c.validate(&record, "f:1".into()).unwrap_err(),
                expected,
                "field {field}"
            );
        }
    }

    #[test]
    fn test_validate_missing_event_id_uses_fallback() {
        let mut record = sample_event("e1", "2024-06-01T10:00:00Z");
        record.as_object_mut().unwrap().remove("event_id");
        let event = contract().validate(&record, "events.jsonl:7".into()).unwrap();
        assert_eq!(event.event_id, "events.jsonl:7");
    }

    #[test]
    fn test_validate_accepts_account_entity() {
        let mut record = sample_event("e1", "2024-06-01T10:00:00Z");
        record["entity_type"] = serde_json::json!("account");
        assert!(contract().validate(&record, "f:1".into()).is_ok());
    }

    // ── find_jsonl_files ──────────────────────────────────────────────────────

    #[test]
    fn test_find_jsonl_files_sorted_and_recursive() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("2024-06");
        std::fs::create_dir_all(&sub).unwrap();
        write_jsonl(dir.path(), "c.jsonl", &["x"]);
        write_jsonl(dir.path(), "a.jsonl", &["x"]);
        write_jsonl(&sub, "b.jsonl", &["x"]);
        write_jsonl(dir.path(), "notes.txt", &["x"]);

        let files = find_jsonl_files(dir.path());
        assert_eq!(files.len(), 3);
        let mut sorted = files.clone();
        sorted.sort();
        assert_eq!(files, sorted);
    }

    #[test]
    fn test_find_jsonl_files_single_file() {
        let dir = TempDir::new().unwrap();
        let path = write_jsonl(dir.path(), "events.jsonl", &["x"]);
        assert_eq!(find_jsonl_files(&path), vec![path]);
    }

    // ── load_events ───────────────────────────────────────────────────────────

    #[test]
    fn test_load_events_counts_and_dedups() {
        let dir = TempDir::new().unwrap();
        let e1 = sample_event("e1", "2024-06-02T10:00:00Z").to_string();
        let e2 = sample_event("e2", "2024-06-01T10:00:00Z").to_string();
        let dup = sample_event("e1", "2024-06-03T10:00:00Z").to_string();
        write_jsonl(dir.path(), "events.jsonl", &[&e1, "{not json", "", &e2, &dup]);

        let loaded = load_events(dir.path(), &contract()).unwrap();
        assert_eq!(loaded.files, 1);
        assert_eq!(loaded.events.len(), 2);
        // Sorted by timestamp.
        assert_eq!(loaded.events[0].event_id, "e2");
        assert_eq!(loaded.contract.total_records, 4);
        assert_eq!(loaded.contract.excluded_by_reason[&ViolationReason::InvalidJson], 1);
        assert_eq!(loaded.contract.excluded_by_reason[&ViolationReason::DuplicateEventId], 1);
    }

    #[test]
    fn test_fallback_ids_differ_across_partitions() {
        let dir = TempDir::new().unwrap();
        let mut record = sample_event("unused", "2024-06-01T10:00:00Z");
        record.as_object_mut().unwrap().remove("event_id");
        let line = record.to_string();
        for month in ["2024-05", "2024-06"] {
            let sub = dir.path().join(month);
            std::fs::create_dir_all(&sub).unwrap();
            write_jsonl(&sub, "part-0.jsonl", &[&line]);
        }

        let loaded = load_events(dir.path(), &contract()).unwrap();
        assert_eq!(loaded.events.len(), 2);
        assert!(loaded.contract.excluded_by_reason.is_empty());
        let ids: Vec<&str> = loaded.events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["2024-05/part-0.jsonl:1", "2024-06/part-0.jsonl:1"]);
    }

    #[test]
    fn test_fallback_id_for_single_file_uses_file_name() {
        let dir = TempDir::new().unwrap();
        let mut record = sample_event("unused", "2024-06-01T10:00:00Z");
        record.as_object_mut().unwrap().remove("event_id");
        let path = write_jsonl(dir.path(), "events.jsonl", &[&record.to_string()]);

        let loaded = load_events(&path, &contract()).unwrap();
        assert_eq!(loaded.events[0].event_id, "events.jsonl:1");
    }

    #[test]
    fn test_load_events_missing_path_is_error() {
        let err = load_events(Path::new("/tmp/no-such-event-log-xyz"), &contract()).unwrap_err();
        assert!(matches!(err, EngineError::FileRead { .. }));
    }

    #[test]
    fn test_load_events_empty_directory() {
        let dir = TempDir::new().unwrap();
        let loaded = load_events(dir.path(), &contract()).unwrap();
        assert!(loaded.events.is_empty());
        assert_eq!(loaded.contract.compliance_pct(), 100.0);
    }
}
