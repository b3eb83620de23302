//! Construction-time configuration for the ejection core
//!
//! Every section deserializes with defaults for missing fields, so a JSON file
//! only needs to carry the values it overrides.

use crate::error::{EjectorError, Result};
use crate::reliability::DEFAULT_HISTORY_CAPACITY;
use ioutrack::SortConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Camera lens fitted to the line; selects the allowed center drift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LensType {
    /// Narrow field of view
    #[default]
    #[serde(rename = "12mm")]
    Narrow12mm,
    /// Wide field of view
    #[serde(rename = "8mm")]
    Wide8mm,
}

impl LensType {
    /// Center tolerance in pixels
    pub fn center_tolerance(&self) -> f32 {
        match self {
            LensType::Narrow12mm => 5.0,
            LensType::Wide8mm => 8.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 1024,
        }
    }
}

/// Trigger zone as fractions of the image height
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub trigger_top_ratio: f32,
    pub trigger_bottom_ratio: f32,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            trigger_top_ratio: 0.375,
            trigger_bottom_ratio: 0.625,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Frames a lifecycle record survives without a sighting
    pub tracking_timeout_frames: u32,
    /// Drift threshold = lens center tolerance x this
    pub drift_multiplier: f32,
    /// Maximum center distance when recovering confidence/class from raw detections
    pub fallback_match_distance_px: f32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tracking_timeout_frames: 15,
            drift_multiplier: 2.0,
            fallback_match_distance_px: 50.0,
        }
    }
}

/// Object tracker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_age: u32,
    pub min_hits: u32,
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 15,
            min_hits: 3,
            iou_threshold: 0.3,
        }
    }
}

impl TrackerConfig {
    pub fn to_sort_config(&self) -> SortConfig {
        SortConfig {
            max_age: self.max_age,
            min_hits: self.min_hits,
            iou_threshold: self.iou_threshold,
            ..SortConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// A pending command older than this is failed
    pub ack_timeout_ms: u64,
    /// Upper bound on a single outbound write
    pub send_timeout_ms: u64,
    /// Acknowledged and failed command records kept for inspection
    pub history_capacity: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 200,
            send_timeout_ms: 5,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Warn when the acknowledged share of sent commands drops below this (0..1)
    pub min_success_rate: f32,
    pub stats_interval_frames: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            min_success_rate: 0.95,
            stats_interval_frames: 100,
        }
    }
}

/// Line operating presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Default,
    /// Fast conveyor: shorter timeout, narrower trigger zone
    HighSpeed,
    /// Slow conveyor: longer timeout, wider trigger zone
    LowSpeed,
    /// Higher confidence, narrow zone, tight drift
    Strict,
    /// Lower confidence, wide zone, loose drift
    Permissive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EjectorConfig {
    pub image: ImageConfig,
    pub lens: LensType,
    pub zone: ZoneConfig,
    pub confidence_threshold: f32,
    pub tracking: TrackingConfig,
    pub tracker: TrackerConfig,
    pub command: CommandConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for EjectorConfig {
    fn default() -> Self {
        Self {
            image: ImageConfig::default(),
            lens: LensType::default(),
            zone: ZoneConfig::default(),
            confidence_threshold: 0.75,
            tracking: TrackingConfig::default(),
            tracker: TrackerConfig::default(),
            command: CommandConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl EjectorConfig {
    /// Preset for an operating scenario on the given lens
    pub fn for_scenario(scenario: Scenario, lens: LensType) -> Self {
        let mut config = Self {
            lens,
            ..Self::default()
        };

        match scenario {
            Scenario::Default => {}
            Scenario::HighSpeed => {
                config.tracking.tracking_timeout_frames = 10;
                config.zone.trigger_top_ratio = 0.40;
                config.zone.trigger_bottom_ratio = 0.60;
            }
            Scenario::LowSpeed => {
                config.tracking.tracking_timeout_frames = 20;
                config.zone.trigger_top_ratio = 0.35;
                config.zone.trigger_bottom_ratio = 0.65;
            }
            Scenario::Strict => {
                config.confidence_threshold = 0.85;
                config.zone.trigger_top_ratio = 0.425;
                config.zone.trigger_bottom_ratio = 0.575;
                config.tracking.drift_multiplier = 1.5;
            }
            Scenario::Permissive => {
                config.confidence_threshold = 0.65;
                config.zone.trigger_top_ratio = 0.35;
                config.zone.trigger_bottom_ratio = 0.65;
                config.tracking.drift_multiplier = 2.5;
            }
        }

        log::info!("Using {:?} scenario with {:?} lens", scenario, lens);
        config
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        log::info!("Saved configuration to {}", path.display());
        Ok(())
    }

    pub fn center_tolerance(&self) -> f32 {
        self.lens.center_tolerance()
    }

    /// Largest allowed center displacement between consecutive sightings
    pub fn drift_threshold(&self) -> f32 {
        self.center_tolerance() * self.tracking.drift_multiplier
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.width == 0 || self.image.height == 0 {
            return Err(EjectorError::config(format!(
                "image dimensions must be positive, got {}x{}",
                self.image.width, self.image.height
            )));
        }

        let (top, bottom) = (self.zone.trigger_top_ratio, self.zone.trigger_bottom_ratio);
        if !(0.0..=1.0).contains(&top) || !(0.0..=1.0).contains(&bottom) || top > bottom {
            return Err(EjectorError::config(format!(
                "trigger zone ratios must satisfy 0 <= top <= bottom <= 1, got {} / {}",
                top, bottom
            )));
        }

        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(EjectorError::config(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }

        let multiplier = self.tracking.drift_multiplier;
        if multiplier.is_nan() || multiplier <= 0.0 {
            return Err(EjectorError::config("drift_multiplier must be positive"));
        }

        let fallback = self.tracking.fallback_match_distance_px;
        if fallback.is_nan() || fallback < 0.0 {
            return Err(EjectorError::config(
                "fallback_match_distance_px must be non-negative",
            ));
        }

        if !(0.0..=1.0).contains(&self.tracker.iou_threshold) {
            return Err(EjectorError::config(format!(
                "iou_threshold must be in [0, 1], got {}",
                self.tracker.iou_threshold
            )));
        }

        if self.tracker.min_hits == 0 {
            return Err(EjectorError::config("min_hits must be at least 1"));
        }

        if self.command.ack_timeout_ms == 0 {
            return Err(EjectorError::config("ack_timeout_ms must be positive"));
        }

        if !(0.0..=1.0).contains(&self.monitoring.min_success_rate) {
            return Err(EjectorError::config(format!(
                "min_success_rate must be in [0, 1], got {}",
                self.monitoring.min_success_rate
            )));
        }

        if self.monitoring.stats_interval_frames == 0 {
            return Err(EjectorError::config("stats_interval_frames must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_defaults() {
        let config = EjectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.image.width, 1280);
        assert_eq!(config.image.height, 1024);
        assert_eq!(config.lens, LensType::Narrow12mm);
        assert_eq!(config.tracker.max_age, 15);
        assert_eq!(config.command.ack_timeout_ms, 200);
        assert_eq!(config.command.history_capacity, 1000);
        assert_abs_diff_eq!(config.drift_threshold(), 10.0);
    }

    #[test]
    fn test_lens_tolerance() {
        assert_eq!(LensType::Narrow12mm.center_tolerance(), 5.0);
        assert_eq!(LensType::Wide8mm.center_tolerance(), 8.0);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EjectorConfig::from_json_str(
            r#"{"lens": "8mm", "zone": {"trigger_top_ratio": 0.4}, "confidence_threshold": 0.8}"#,
        )
        .unwrap();

        assert_eq!(config.lens, LensType::Wide8mm);
        assert_abs_diff_eq!(config.zone.trigger_top_ratio, 0.4);
        assert_abs_diff_eq!(config.zone.trigger_bottom_ratio, 0.625);
        assert_abs_diff_eq!(config.confidence_threshold, 0.8);
        assert_eq!(config.tracking.tracking_timeout_frames, 15);
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(matches!(
            EjectorConfig::from_json_str(r#"{"lens": "35mm"}"#),
            Err(EjectorError::SerializationError(_))
        ));
        assert!(matches!(
            EjectorConfig::from_json_str(
                r#"{"zone": {"trigger_top_ratio": 0.7, "trigger_bottom_ratio": 0.3}}"#
            ),
            Err(EjectorError::ConfigError(_))
        ));
        assert!(EjectorConfig::from_json_str(r#"{"confidence_threshold": 1.5}"#).is_err());
    }

    #[test]
    fn test_scenarios() {
        let high = EjectorConfig::for_scenario(Scenario::HighSpeed, LensType::Narrow12mm);
        assert_eq!(high.tracking.tracking_timeout_frames, 10);
        assert_abs_diff_eq!(high.zone.trigger_top_ratio, 0.40);

        let low = EjectorConfig::for_scenario(Scenario::LowSpeed, LensType::Wide8mm);
        assert_eq!(low.tracking.tracking_timeout_frames, 20);
        assert_eq!(low.lens, LensType::Wide8mm);

        let strict = EjectorConfig::for_scenario(Scenario::Strict, LensType::Narrow12mm);
        assert_abs_diff_eq!(strict.confidence_threshold, 0.85);
        assert_abs_diff_eq!(strict.drift_threshold(), 7.5);

        let permissive = EjectorConfig::for_scenario(Scenario::Permissive, LensType::Wide8mm);
        assert_abs_diff_eq!(permissive.drift_threshold(), 20.0);

        for config in [high, low, strict, permissive] {
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("ejector-config-{}.json", std::process::id()));
        let config = EjectorConfig::for_scenario(Scenario::Strict, LensType::Wide8mm);

        config.save(&path).unwrap();
        let loaded = EjectorConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            EjectorConfig::load("/nonexistent/ejector.json"),
            Err(EjectorError::IoError(_))
        ));
    }
}
