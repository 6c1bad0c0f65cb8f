//! Runtime layer for the lifecycle engine.
//!
//! Runs one analysis snapshot on parallel workers, publishes the resulting
//! tables atomically, and keeps the persisted state for incremental mode.

pub mod incremental;
pub mod orchestrator;
pub mod publisher;

pub use lifecycle_core as core;
pub use lifecycle_data as data;

#[cfg(test)]
pub(crate) mod test_support {
    use std::fmt::Write as _;
    use std::path::{Path, PathBuf};

    use chrono::{DateTime, Duration, TimeZone, Utc};

    pub fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    const DIRECTORY: &str = r#"{
        "users": [
            {"user_id": "u1", "account_id": "a1", "country": "US", "created_at": "2024-01-01T00:00:00Z"},
            {"user_id": "u2", "account_id": "a1", "country": "DE", "created_at": "2024-05-21T00:00:00Z"},
            {"user_id": "u3", "account_id": "a2", "created_at": "2024-06-25T00:00:00Z"}
        ],
        "accounts": [
            {"account_id": "a1", "account_type": "enterprise", "created_at": "2023-01-01T00:00:00Z",
             "total_seats": 4, "first_payment_at": "2023-02-01T00:00:00Z",
             "renewal_date": "2025-02-01T00:00:00Z", "renewals_completed": 1},
            {"account_id": "a2", "account_type": "team", "created_at": "2024-06-20T00:00:00Z",
             "total_seats": 2, "trial_started_at": "2024-06-20T00:00:00Z",
             "trial_ends_at": "2024-07-04T00:00:00Z", "renewals_completed": 0}
        ],
        "products": [
            {"product_id": "fam_video", "name": "Video", "tier": "family"},
            {"product_id": "prod_editor", "name": "Editor", "tier": "product", "parent_id": "fam_video"}
        ]
    }"#;

    pub fn write_directory(dir: &Path) -> PathBuf {
        let path = dir.join("directory.json");
        std::fs::write(&path, DIRECTORY).unwrap();
        path
    }

    /// Write `(event_id, user_id, days_before_as_of)` rows into
    /// `<dir>/events/<file>` and return the events directory.
    pub fn write_events(dir: &Path, file: &str, rows: &[(&str, &str, i64)]) -> PathBuf {
        let events = dir.join("events");
        std::fs::create_dir_all(&events).unwrap();
        let mut log = String::new();
        for (id, user, days) in rows {
            let ts = as_of() - Duration::days(*days);
            let _ = writeln!(
                log,
                r#"{{"event_id":"{id}","entity_id":"{user}","entity_type":"user","event_type":"video_create","timestamp":"{}","location":"web_app","session_id":"s-{user}","product_id":"prod_editor","is_qualifying_event":true}}"#,
                ts.to_rfc3339()
            );
        }
        std::fs::write(events.join(file), log).unwrap();
        events
    }
}
