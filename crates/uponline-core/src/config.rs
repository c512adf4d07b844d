//! Configuration management for uponline
//!
//! Every threshold the scoring, propagation and validation components use is
//! a named field here; nothing downstream hardcodes a policy number. Sources
//! are layered as defaults, then a YAML file, then `UPONLINE_*` environment
//! variables.

use crate::types::RiskLevel;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the risk engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Rack risk scoring
    pub scoring: ScoringConfig,

    /// Cluster health aggregation
    pub health: HealthConfig,

    /// Job risk propagation
    pub propagation: PropagationConfig,

    /// Active risk list
    pub risks: RiskListConfig,

    /// Telemetry ingestion
    pub ingest: IngestConfig,

    /// Snapshot store
    pub snapshot: SnapshotConfig,

    /// Change validation
    pub validator: ValidatorConfig,

    /// Logging
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var("UPONLINE_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            for path in &["./uponline.yaml", "/etc/uponline/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("UPONLINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        tracing::debug!("Loaded engine configuration");

        Ok(parsed)
    }

    /// Load configuration from a specific YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let parsed: Self = serde_yaml::from_str(&content)?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Serialize configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.scoring.validate()?;
        self.health.validate()?;
        self.risks.validate()?;
        self.ingest.validate()?;
        self.snapshot.validate()?;
        self.validator.validate()?;

        Ok(())
    }
}

/// Configuration for rack risk scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Sub-score weights
    pub weights: ScoringWeights,

    /// Hard inlet temperature ceiling in °C
    pub thermal_ceiling_c: f64,

    /// Inlet temperature treated as zero thermal risk in °C
    pub thermal_floor_c: f64,

    /// Fraction of the floor-to-ceiling range where the thermal curve steepens
    pub knee_fraction: f64,

    /// Thermal sub-score reached at the knee
    pub knee_score: f64,

    /// Minimum overall score for a rack above the ceiling
    pub ceiling_breach_floor: u8,

    /// Number of recent samples used for the volatility sub-score
    pub window_size: usize,

    /// Inlet temperature standard deviation (°C) scored as full volatility
    pub temp_stddev_full_scale: f64,

    /// Power coefficient of variation scored as full volatility
    pub power_cv_full_scale: f64,

    /// Rack scores freeze and are flagged stale after this long without telemetry
    pub staleness_threshold: Duration,

    /// Score change below which the trend is reported as stable
    pub trend_epsilon: u8,

    /// Score thresholds for the None/Low/Medium/High buckets
    pub buckets: RiskBuckets,

    /// Effective capacity factor for degraded CRAH units and power units
    pub degraded_unit_factor: f64,
}

/// Weights for the rack sub-scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Weight for thermal headroom
    pub thermal: f64,

    /// Weight for PDU load
    pub power: f64,

    /// Weight for recent reading variance
    pub volatility: f64,
}

/// Score thresholds for categorical risk levels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskBuckets {
    pub low: u8,
    pub medium: u8,
    pub high: u8,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            thermal_ceiling_c: 38.0,
            thermal_floor_c: 18.0,
            knee_fraction: 0.8,
            knee_score: 40.0,
            ceiling_breach_floor: 60,
            window_size: 12,
            temp_stddev_full_scale: 2.0,
            power_cv_full_scale: 0.15,
            staleness_threshold: Duration::from_secs(300),
            trend_epsilon: 2,
            buckets: RiskBuckets::default(),
            degraded_unit_factor: 0.75,
        }
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            thermal: 0.5,
            power: 0.3,
            volatility: 0.2,
        }
    }
}

impl Default for RiskBuckets {
    fn default() -> Self {
        Self {
            low: 10,
            medium: 30,
            high: 60,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        if w.thermal < 0.0 || w.power < 0.0 || w.volatility < 0.0 {
            return Err(crate::Error::config("scoring weights must be non-negative"));
        }

        let total_weight = w.thermal + w.power + w.volatility;
        if (total_weight - 1.0).abs() > 0.01 {
            return Err(crate::Error::config(format!(
                "scoring weights should sum to 1.0, got {}",
                total_weight
            )));
        }

        if self.thermal_ceiling_c <= self.thermal_floor_c {
            return Err(crate::Error::config(
                "thermal_ceiling_c must be above thermal_floor_c",
            ));
        }

        if !(0.0..1.0).contains(&self.knee_fraction) || self.knee_fraction == 0.0 {
            return Err(crate::Error::config("knee_fraction must be in (0, 1)"));
        }

        if !(0.0..=100.0).contains(&self.knee_score) {
            return Err(crate::Error::config("knee_score must be in [0, 100]"));
        }

        if self.window_size == 0 {
            return Err(crate::Error::config("window_size must be greater than zero"));
        }

        if self.temp_stddev_full_scale <= 0.0 || self.power_cv_full_scale <= 0.0 {
            return Err(crate::Error::config("volatility full scales must be positive"));
        }

        if self.staleness_threshold.is_zero() {
            return Err(crate::Error::config(
                "staleness_threshold must be greater than zero",
            ));
        }

        let b = &self.buckets;
        if !(b.low < b.medium && b.medium < b.high && b.high <= 100) {
            return Err(crate::Error::config(
                "risk buckets must be strictly increasing and at most 100",
            ));
        }

        if !(0.0..=1.0).contains(&self.degraded_unit_factor) {
            return Err(crate::Error::config("degraded_unit_factor must be in [0, 1]"));
        }

        Ok(())
    }
}

/// Per-GPU-model temperature thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuThresholds {
    /// Temperature counted as a thermal anomaly (node Warning)
    pub anomaly_temp_c: f64,

    /// Temperature at which the node is Critical
    pub critical_temp_c: f64,
}

/// Configuration for cluster health aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Thresholds keyed by GPU model name
    pub gpu_models: HashMap<String, GpuThresholds>,

    /// Thresholds for models not listed above
    pub default_thresholds: GpuThresholds,

    /// NVLink health percentage below which a node is Warning
    pub nvlink_warn_pct: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let mut gpu_models = HashMap::new();
        gpu_models.insert(
            "H100 SXM".to_string(),
            GpuThresholds {
                anomaly_temp_c: 80.0,
                critical_temp_c: 90.0,
            },
        );
        gpu_models.insert(
            "A100 80GB".to_string(),
            GpuThresholds {
                anomaly_temp_c: 78.0,
                critical_temp_c: 88.0,
            },
        );

        Self {
            gpu_models,
            default_thresholds: GpuThresholds {
                anomaly_temp_c: 80.0,
                critical_temp_c: 90.0,
            },
            nvlink_warn_pct: 95.0,
        }
    }
}

impl HealthConfig {
    /// Thresholds for a GPU model, falling back to the defaults
    pub fn thresholds_for(&self, gpu_model: &str) -> &GpuThresholds {
        self.gpu_models
            .get(gpu_model)
            .unwrap_or(&self.default_thresholds)
    }

    pub fn validate(&self) -> Result<()> {
        for (model, t) in self
            .gpu_models
            .iter()
            .map(|(m, t)| (m.as_str(), t))
            .chain(std::iter::once(("default", &self.default_thresholds)))
        {
            if t.anomaly_temp_c >= t.critical_temp_c {
                return Err(crate::Error::config(format!(
                    "anomaly_temp_c must be below critical_temp_c for {}",
                    model
                )));
            }
        }

        if !(0.0..=100.0).contains(&self.nvlink_warn_pct) {
            return Err(crate::Error::config("nvlink_warn_pct must be in [0, 100]"));
        }

        Ok(())
    }
}

/// Configuration for job risk propagation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Racks at or above this level count all their job GPUs as affected
    pub affected_min_level: RiskLevel,

    /// Slowdown multipliers per worst-rack level
    pub multipliers: SlowdownMultipliers,
}

/// Slowdown scaling by the worst contributing rack's level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowdownMultipliers {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl SlowdownMultipliers {
    pub fn for_level(&self, level: RiskLevel) -> f64 {
        match level {
            RiskLevel::None => 0.0,
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
        }
    }
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            affected_min_level: RiskLevel::Medium,
            multipliers: SlowdownMultipliers {
                low: 1.0,
                medium: 2.0,
                high: 3.0,
            },
        }
    }
}

/// Severity thresholds for the active risk list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskListConfig {
    /// Minimum score listed at all (Info)
    pub info: u8,

    /// Minimum score listed as Warning
    pub warning: u8,

    /// Minimum score listed as Critical
    pub critical: u8,
}

impl Default for RiskListConfig {
    fn default() -> Self {
        Self {
            info: 30,
            warning: 50,
            critical: 75,
        }
    }
}

impl RiskListConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.info < self.warning && self.warning < self.critical && self.critical <= 100) {
            return Err(crate::Error::config(
                "risk list thresholds must be strictly increasing and at most 100",
            ));
        }
        Ok(())
    }
}

/// Accepted physical range for one metric kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Accepted ranges for every metric kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricRanges {
    pub inlet_temperature_c: ValueRange,
    pub power_draw_kw: ValueRange,
    pub gpu_temperature_c: ValueRange,
    pub percent: ValueRange,
    pub xid_errors: ValueRange,
    pub supply_temperature_c: ValueRange,
}

impl Default for MetricRanges {
    fn default() -> Self {
        Self {
            inlet_temperature_c: ValueRange::new(-10.0, 80.0),
            power_draw_kw: ValueRange::new(0.0, 200.0),
            gpu_temperature_c: ValueRange::new(0.0, 130.0),
            percent: ValueRange::new(0.0, 100.0),
            xid_errors: ValueRange::new(0.0, 1.0e6),
            supply_temperature_c: ValueRange::new(0.0, 50.0),
        }
    }
}

/// Configuration for telemetry ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Accepted physical ranges
    pub ranges: MetricRanges,

    /// Bounded queue capacity per entity stream
    pub queue_capacity: usize,

    /// Maximum time a producer waits for queue space
    pub enqueue_timeout: Duration,

    /// Interval of the staleness sweep
    pub stale_sweep_interval: Duration,

    /// Coalescing delay between snapshot publishes
    pub publish_debounce: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ranges: MetricRanges::default(),
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_millis(100),
            stale_sweep_interval: Duration::from_secs(30),
            publish_debounce: Duration::from_millis(50),
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(crate::Error::config("queue_capacity must be greater than zero"));
        }
        if self.stale_sweep_interval.is_zero() {
            return Err(crate::Error::config(
                "stale_sweep_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Configuration for the snapshot store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Number of past versions kept readable
    pub history: usize,

    /// Persist each published snapshot to the file backend
    pub persist: bool,

    /// Directory for persisted snapshots
    pub persist_path: Option<PathBuf>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            history: 16,
            persist: false,
            persist_path: None,
        }
    }
}

impl SnapshotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history == 0 {
            return Err(crate::Error::config("snapshot history must be greater than zero"));
        }
        if self.persist && self.persist_path.is_none() {
            return Err(crate::Error::config(
                "persist_path required when persistence is enabled",
            ));
        }
        Ok(())
    }
}

/// Configuration for change validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// PDU headroom below this percentage of capacity is a Warning
    pub power_warn_headroom_pct: f64,

    /// Cooling zone margin below this percentage is a Warning
    pub cooling_warn_margin_pct: f64,

    /// N+1 redundancy margin below this percentage is a Warning
    pub redundancy_warn_pct: f64,

    /// Projected inlet rise per kW of added heat, before zone pressure
    pub inlet_rise_per_kw: f64,

    /// Baseline load per hour of day (UTC) as a fraction of current load
    pub hourly_baseline: Vec<f64>,

    /// How far ahead the safer-window scan looks
    pub lookahead_hours: u32,

    /// Time budget for simulation and window scan
    pub time_budget: Duration,

    /// Commit attempts before surfacing a concurrent modification
    pub max_commit_retries: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            power_warn_headroom_pct: 10.0,
            cooling_warn_margin_pct: 15.0,
            redundancy_warn_pct: 10.0,
            inlet_rise_per_kw: 0.85,
            hourly_baseline: vec![
                0.86, 0.84, 0.82, 0.82, 0.82, 0.84, 0.88, 0.92, 0.96, 0.98, 1.0, 1.0, 1.0, 1.0,
                1.0, 1.0, 0.98, 0.97, 0.96, 0.95, 0.93, 0.91, 0.89, 0.87,
            ],
            lookahead_hours: 48,
            time_budget: Duration::from_millis(250),
            max_commit_retries: 3,
        }
    }
}

impl ValidatorConfig {
    /// Baseline load factor for an hour of day
    pub fn baseline_for_hour(&self, hour: u32) -> f64 {
        self.hourly_baseline
            .get(hour as usize % 24)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hourly_baseline.len() != 24 {
            return Err(crate::Error::config(format!(
                "hourly_baseline must have 24 entries, got {}",
                self.hourly_baseline.len()
            )));
        }
        if self.hourly_baseline.iter().any(|f| !f.is_finite() || *f < 0.0) {
            return Err(crate::Error::config(
                "hourly_baseline factors must be finite and non-negative",
            ));
        }
        if self.inlet_rise_per_kw < 0.0 {
            return Err(crate::Error::config("inlet_rise_per_kw must be non-negative"));
        }
        if self.time_budget.is_zero() {
            return Err(crate::Error::config("time_budget must be greater than zero"));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter used when RUST_LOG is unset
    pub level: String,

    /// Output format: "text" or "json"
    pub format: String,

    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scoring.thermal_ceiling_c, 38.0);
        assert_eq!(config.scoring.buckets.high, 60);
        assert_eq!(config.validator.hourly_baseline.len(), 24);
    }

    #[test]
    fn test_scoring_weights_default() {
        let w = ScoringWeights::default();
        assert!((w.thermal + w.power + w.volatility - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.scoring.weights.thermal = 0.9;
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.scoring.thermal_floor_c = 40.0;
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.scoring.buckets.medium = 70;
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.validator.hourly_baseline.pop();
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.snapshot.persist = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gpu_threshold_lookup() {
        let health = HealthConfig::default();
        assert_eq!(health.thresholds_for("A100 80GB").anomaly_temp_c, 78.0);
        assert_eq!(health.thresholds_for("B200").anomaly_temp_c, 80.0);
    }

    #[test]
    fn test_partial_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "scoring:\n  thermal_ceiling_c: 40.0\nvalidator:\n  lookahead_hours: 12\n"
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scoring.thermal_ceiling_c, 40.0);
        assert_eq!(config.scoring.window_size, 12);
        assert_eq!(config.validator.lookahead_hours, 12);
    }

    #[test]
    fn test_yaml_roundtrip_of_defaults() {
        let yaml = EngineConfig::default().to_yaml().unwrap();
        let parsed: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }
}
