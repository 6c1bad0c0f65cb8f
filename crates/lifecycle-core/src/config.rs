//! Engine configuration file.
//!
//! Everything a deployment may tune lives in one JSON document. Missing
//! sections and fields fall back to their defaults, so an empty `{}` file is
//! a valid configuration.

use std::path::Path;

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::thresholds::{AccountThresholds, HealthWeights, RecencyThresholds};
use crate::time_utils::DayBucketer;

// ── Metric horizons ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Number of trailing spine dates reported in the overall scope.
    pub overall_days: u32,
    /// Calendar months covered by the segment and activity scopes.
    pub detail_months: u32,
    /// Short rolling frame (days).
    pub short_window_days: u32,
    /// Long rolling frame (days).
    pub long_window_days: u32,
    /// Lag for week-over-week growth.
    pub wow_lag_days: u32,
    /// Lag for month-over-month growth.
    pub mom_lag_days: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            overall_days: 90,
            detail_months: 18,
            short_window_days: 7,
            long_window_days: 30,
            wow_lag_days: 7,
            mom_lag_days: 30,
        }
    }
}

impl MetricsConfig {
    /// Extra days the spine must reach back so the first reported day has a
    /// complete trailing frame and a growth lag value.
    pub fn lookback_days(&self) -> u32 {
        let frame = self.long_window_days.saturating_sub(1);
        frame.max(self.mom_lag_days + self.short_window_days.saturating_sub(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.short_window_days == 0 || self.long_window_days == 0 {
            return Err(EngineError::Config(
                "metrics: rolling windows must be at least one day".to_string(),
            ));
        }
        if self.detail_months == 0 || self.overall_days == 0 {
            return Err(EngineError::Config(
                "metrics: horizons must be at least one period".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Input validation ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Fraction of records that must pass the input contract (0–1).
    pub compliance_floor: f64,
    /// Maximum age of the newest event for the freshness check.
    pub freshness_max_hours: i64,
    /// Earliest accepted event date.
    pub min_event_date: NaiveDate,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            compliance_floor: 0.95,
            freshness_max_hours: 2,
            min_event_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default(),
        }
    }
}

impl ValidationConfig {
    /// `min_event_date` as a UTC instant at midnight.
    pub fn min_event_instant(&self) -> chrono::DateTime<Utc> {
        Utc.from_utc_datetime(&self.min_event_date.and_hms_opt(0, 0, 0).unwrap_or_default())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.compliance_floor) {
            return Err(EngineError::Config(format!(
                "validation: compliance_floor must be within 0..=1, got {}",
                self.compliance_floor
            )));
        }
        Ok(())
    }
}

// ── Funnels ───────────────────────────────────────────────────────────────────

/// One named step of a funnel, reached by any of its event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStepConfig {
    pub name: String,
    pub event_types: Vec<String>,
}

/// An ordered workflow whose step-to-step conversion is measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelConfig {
    pub name: String,
    pub steps: Vec<FunnelStepConfig>,
}

/// Maximum number of steps a funnel may have (one bit per step).
pub const MAX_FUNNEL_STEPS: usize = 64;

impl FunnelConfig {
    /// The workflow produced by a typical content-creation session:
    /// login, create a project, create a video, upload it.
    pub fn content_creation() -> Self {
        let step = |name: &str, event_type: &str| FunnelStepConfig {
            name: name.to_string(),
            event_types: vec![event_type.to_string()],
        };
        Self {
            name: "content_creation".to_string(),
            steps: vec![
                step("login", "user_login"),
                step("create_project", "project_create"),
                step("create_video", "video_create"),
                step("upload_video", "video_upload"),
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(EngineError::Config(format!(
                "funnel {}: at least one step is required",
                self.name
            )));
        }
        if self.steps.len() > MAX_FUNNEL_STEPS {
            return Err(EngineError::Config(format!(
                "funnel {}: {} steps exceed the limit of {}",
                self.name,
                self.steps.len(),
                MAX_FUNNEL_STEPS
            )));
        }
        if let Some(step) = self.steps.iter().find(|s| s.event_types.is_empty()) {
            return Err(EngineError::Config(format!(
                "funnel {}: step {} maps to no event types",
                self.name, step.name
            )));
        }
        Ok(())
    }
}

// ── EngineConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// IANA timezone used to bucket events into calendar days.
    pub timezone: String,
    pub platform: RecencyThresholds,
    pub product: RecencyThresholds,
    pub account: AccountThresholds,
    pub health: HealthWeights,
    pub metrics: MetricsConfig,
    pub validation: ValidationConfig,
    pub funnels: Vec<FunnelConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            platform: RecencyThresholds::default(),
            product: RecencyThresholds::default(),
            account: AccountThresholds::default(),
            health: HealthWeights::default(),
            metrics: MetricsConfig::default(),
            validation: ValidationConfig::default(),
            funnels: vec![FunnelConfig::content_creation()],
        }
    }
}

impl EngineConfig {
    /// Load and validate a configuration file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, otherwise return the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !DayBucketer::validate_timezone(&self.timezone) {
            return Err(EngineError::Config(format!(
                "unknown timezone {}",
                self.timezone
            )));
        }
        self.platform.validate("platform")?;
        self.product.validate("product")?;
        self.account.validate()?;
        self.health.validate()?;
        self.metrics.validate()?;
        self.validation.validate()?;
        for funnel in &self.funnels {
            funnel.validate()?;
        }
        Ok(())
    }

    /// Day bucketer for the configured reporting timezone.
    pub fn bucketer(&self) -> DayBucketer {
        DayBucketer::new(&self.timezone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.funnels.len(), 1);
        assert_eq!(config.funnels[0].steps.len(), 4);
    }

    #[test]
    fn test_empty_json_yields_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_from_file_overrides_fields() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"timezone": "Europe/Berlin", "metrics": {"overall_days": 30}}"#,
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.timezone, "Europe/Berlin");
        assert_eq!(config.metrics.overall_days, 30);
        assert_eq!(config.metrics.detail_months, 18);
    }

    #[test]
    fn test_load_rejects_unknown_timezone() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("engine.json");
        std::fs::write(&path, r#"{"timezone": "Mars/Olympus"}"#).unwrap();
        let err = EngineConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Mars/Olympus"));
    }

    #[test]
    fn test_load_missing_file_is_file_read_error() {
        let err = EngineConfig::load_from(Path::new("/tmp/does-not-exist-engine.json"))
            .unwrap_err();
        assert!(matches!(err, EngineError::FileRead { .. }));
    }

    #[test]
    fn test_funnel_without_steps_is_rejected() {
        let funnel = FunnelConfig {
            name: "empty".to_string(),
            steps: vec![],
        };
        assert!(funnel.validate().is_err());
    }

    #[test]
    fn test_lookback_covers_long_window_and_growth() {
        let m = MetricsConfig::default();
        // 30-day lag on a 7-day sum reaches back 36 days.
        assert_eq!(m.lookback_days(), 36);
    }

    #[test]
    fn test_compliance_floor_range() {
        let v = ValidationConfig {
            compliance_floor: 1.5,
            ..Default::default()
        };
        assert!(v.validate().is_err());
    }
}
