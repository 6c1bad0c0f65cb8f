use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use tracing::warn;

// ── DayBucketer ───────────────────────────────────────────────────────────────

/// Maps UTC instants onto calendar days of the reporting timezone, and parses
/// event timestamps that may lack an explicit offset.
#[derive(Debug, Clone, Copy)]
pub struct DayBucketer {
    tz: Tz,
}

impl DayBucketer {
    /// Create a bucketer for the given IANA timezone name.
    ///
    /// An unrecognised name falls back to UTC with a warning; configuration
    /// validation rejects such names before a run starts.
    pub fn new(tz_name: &str) -> Self {
        let tz = tz_name.parse::<Tz>().unwrap_or_else(|_| {
            warn!(
                "DayBucketer: unrecognised timezone \"{}\", falling back to UTC",
                tz_name
            );
            Tz::UTC
        });
        Self { tz }
    }

    pub fn utc() -> Self {
        Self { tz: Tz::UTC }
    }

    /// Validate that `tz_name` is a recognised IANA timezone identifier.
    pub fn validate_timezone(tz_name: &str) -> bool {
        tz_name.parse::<Tz>().is_ok()
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Calendar day `ts` falls on in the reporting timezone.
    pub fn day_of(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.tz).date_naive()
    }

    /// Parse a JSON timestamp value.
    ///
    /// Handles RFC 3339 strings (with `Z` or an offset), naive
    /// `YYYY-MM-DD[T ]HH:MM:SS[.f]` strings interpreted in the reporting
    /// timezone, and integer or float Unix seconds. Returns `None` for
    /// anything else, including `null`.
    pub fn parse_value(&self, value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::String(s) => self.parse_timestamp(s),
            Value::Number(n) => {
                if let Some(secs) = n.as_i64() {
                    DateTime::from_timestamp(secs, 0)
                } else if let Some(f) = n.as_f64() {
                    let secs = f.trunc() as i64;
                    let nanos = (f.fract() * 1_000_000_000.0).round() as u32;
                    DateTime::from_timestamp(secs, nanos)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Parse a timestamp string. See [`DayBucketer::parse_value`].
    pub fn parse_timestamp(&self, s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        let normalised = if let Some(stripped) = s.strip_suffix('Z') {
            format!("{}+00:00", stripped)
        } else {
            s.to_string()
        };

        if let Ok(dt) = DateTime::parse_from_rfc3339(&normalised) {
            return Some(dt.with_timezone(&Utc));
        }

        const FMTS: &[&str] = &[
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%d %H:%M:%S",
        ];
        for fmt in FMTS {
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
                // Ambiguous local times (DST fall-back) resolve to the earlier
                // instant; non-existent ones are rejected.
                return self
                    .tz
                    .from_local_datetime(&naive)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc));
            }
        }

        None
    }
}

impl Default for DayBucketer {
    fn default() -> Self {
        Self::utc()
    }
}

// ── Day arithmetic ────────────────────────────────────────────────────────────

/// Whole elapsed days from `earlier` to `as_of`, floored.
///
/// Negative when `earlier` lies after `as_of`.
pub fn days_between(earlier: DateTime<Utc>, as_of: DateTime<Utc>) -> i64 {
    let secs = (as_of - earlier).num_seconds();
    secs.div_euclid(86_400)
}

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the month `months` before the month containing `date`.
pub fn months_back(date: NaiveDate, months: u32) -> NaiveDate {
    month_start(date)
        .checked_sub_months(Months::new(months))
        .unwrap_or(NaiveDate::MIN)
}

/// `"YYYY-MM"` key of the month containing `date`.
pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

/// Last day of the month containing `date`.
pub fn month_end(date: NaiveDate) -> NaiveDate {
    month_start(date)
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Timelike};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // ── validate_timezone ────────────────────────────────────────────────────

    #[test]
    fn test_validate_timezone() {
        assert!(DayBucketer::validate_timezone("America/New_York"));
        assert!(DayBucketer::validate_timezone("UTC"));
        assert!(!DayBucketer::validate_timezone("Mars/Olympus"));
        assert!(!DayBucketer::validate_timezone(""));
    }

    #[test]
    fn test_new_invalid_timezone_falls_back_to_utc() {
        let b = DayBucketer::new("Invalid/Timezone");
        assert_eq!(b.timezone(), Tz::UTC);
    }

    // ── parse ────────────────────────────────────────────────────────────────

    #[test]
    fn test_parse_timestamp_z_suffix() {
        let dt = DayBucketer::utc()
            .parse_timestamp("2024-01-15T10:30:00Z")
            .unwrap();
        assert_eq!(dt.hour(), 10);
        assert_eq!(dt.minute(), 30);
    }

    #[test]
    fn test_parse_timestamp_with_offset() {
        let dt = DayBucketer::utc()
            .parse_timestamp("2024-01-15T12:00:00+02:00")
            .unwrap();
        assert_eq!(dt.hour(), 10);
    }

    #[test]
    fn test_parse_naive_uses_reporting_timezone() {
        let b = DayBucketer::new("Europe/Berlin");
        let dt = b.parse_timestamp("2024-01-15 12:00:00").unwrap();
        // Berlin is UTC+1 in winter.
        assert_eq!(dt.hour(), 11);
    }

    #[test]
    fn test_parse_value_unix_seconds() {
        let dt = DayBucketer::utc()
            .parse_value(&serde_json::json!(1_705_314_600))
            .unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }

    #[test]
    fn test_parse_value_rejects_null_and_garbage() {
        let b = DayBucketer::utc();
        assert!(b.parse_value(&Value::Null).is_none());
        assert!(b.parse_value(&serde_json::json!("not-a-date")).is_none());
        assert!(b.parse_value(&serde_json::json!(true)).is_none());
    }

    // ── day_of ───────────────────────────────────────────────────────────────

    #[test]
    fn test_day_of_shifts_with_timezone() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap();
        assert_eq!(DayBucketer::utc().day_of(ts), ymd(2024, 6, 1));
        // 02:00 UTC is still May 31st in New York.
        assert_eq!(
            DayBucketer::new("America/New_York").day_of(ts),
            ymd(2024, 5, 31)
        );
    }

    // ── days_between ─────────────────────────────────────────────────────────

    #[test]
    fn test_days_between_floors_partial_days() {
        let as_of = Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap();
        assert_eq!(days_between(as_of - Duration::hours(23), as_of), 0);
        assert_eq!(days_between(as_of - Duration::hours(24), as_of), 1);
        assert_eq!(days_between(as_of - Duration::hours(30 * 24 + 23), as_of), 30);
        assert_eq!(days_between(as_of + Duration::hours(1), as_of), -1);
    }

    // ── month helpers ────────────────────────────────────────────────────────

    #[test]
    fn test_months_back_and_keys() {
        let d = ymd(2024, 3, 31);
        assert_eq!(month_start(d), ymd(2024, 3, 1));
        assert_eq!(months_back(d, 2), ymd(2024, 1, 1));
        assert_eq!(months_back(d, 17), ymd(2022, 10, 1));
        assert_eq!(month_key(d), "2024-03");
        assert_eq!(month_end(ymd(2024, 2, 10)), ymd(2024, 2, 29));
    }
}
