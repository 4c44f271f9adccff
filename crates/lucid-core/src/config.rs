use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::domain::{minutes, US_PER_DAY, US_PER_HOUR, US_PER_SEC};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),
}

// ============================================================================
// Detection settings (externally owned, read-only to the engine)
// ============================================================================

/// Trades detection recall for false-positive suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Lenient,
    Balanced,
    Strict,
}

impl Default for Strictness {
    fn default() -> Self {
        Self::Balanced
    }
}

impl Strictness {
    pub const ALL: [Strictness; 3] = [Strictness::Lenient, Strictness::Balanced, Strictness::Strict];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strictness::Lenient => "lenient",
            Strictness::Balanced => "balanced",
            Strictness::Strict => "strict",
        }
    }
}

impl std::str::FromStr for Strictness {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(Strictness::Lenient),
            "balanced" => Ok(Strictness::Balanced),
            "strict" => Ok(Strictness::Strict),
            other => Err(ConfigError::Validation(format!(
                "unknown strictness '{}'",
                other
            ))),
        }
    }
}

/// How the external start/stop collaborator decides monitoring begins.
/// Carried through settings; the engine itself does not interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoMode {
    MotionOnly,
    Hybrid,
    HealthKitOnly,
}

impl Default for AutoMode {
    fn default() -> Self {
        Self::Hybrid
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub strictness: Strictness,
    pub use_hrv: bool,
    pub use_respiratory_rate: bool,
    pub require_stillness: bool,
    /// Minutes of continuous stillness required (min 1)
    pub stillness_minutes: f32,
    pub auto_mode: AutoMode,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            strictness: Strictness::Balanced,
            use_hrv: true,
            use_respiratory_rate: true,
            require_stillness: true,
            stillness_minutes: 10.0,
            auto_mode: AutoMode::Hybrid,
        }
    }
}

impl DetectionSettings {
    pub const MIN_STILLNESS_MINUTES: f32 = 1.0;

    /// Clamp out-of-range values instead of rejecting them; settings come
    /// from a UI and must never stop evaluation.
    pub fn sanitized(mut self) -> Self {
        if !self.stillness_minutes.is_finite() || self.stillness_minutes < Self::MIN_STILLNESS_MINUTES {
            log::warn!(
                "stillness_minutes={} below minimum, clamping to {}",
                self.stillness_minutes,
                Self::MIN_STILLNESS_MINUTES
            );
            self.stillness_minutes = Self::MIN_STILLNESS_MINUTES;
        }
        self
    }
}

// ============================================================================
// Engine tunables
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub windows: WindowConfig,
    pub heart_rate: HeartRateConfig,
    pub support: SupportConfig,
    pub prediction: PredictionConfig,
    pub refresh: RefreshConfig,
    pub evaluation: EvaluationConfig,
    pub display: DisplayConfig,
}

/// Session windowing. The three gaps are distinct on purpose: they apply
/// to signals of different precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Stage sample retention (minutes)
    pub stage_lookback_min: i64,
    /// A window is fresh if its latest sample ended within this horizon
    pub freshness_min: i64,
    /// Gap that splits two sleep sessions
    pub session_merge_gap_min: i64,
    /// Gap that splits two REM windows within a session
    pub rem_merge_gap_min: i64,
    /// An explicit REM sample is "current" if it ended within this grace
    pub explicit_grace_min: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            stage_lookback_min: 12 * 60,
            freshness_min: 45,
            session_merge_gap_min: 30,
            rem_merge_gap_min: 5,
            explicit_grace_min: 10,
        }
    }
}

impl WindowConfig {
    pub fn stage_lookback_us(&self) -> i64 {
        minutes(self.stage_lookback_min)
    }
    pub fn freshness_us(&self) -> i64 {
        minutes(self.freshness_min)
    }
    pub fn session_merge_gap_us(&self) -> i64 {
        minutes(self.session_merge_gap_min)
    }
    pub fn rem_merge_gap_us(&self) -> i64 {
        minutes(self.rem_merge_gap_min)
    }
    pub fn explicit_grace_us(&self) -> i64 {
        minutes(self.explicit_grace_min)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartRateConfig {
    /// Heart-rate sample retention (minutes)
    pub lookback_min: i64,
    /// Baseline window intersected with the sleep window (minutes)
    pub baseline_lookback_min: i64,
    /// Minimum overlapping samples for a dynamic band
    pub min_samples: usize,
    pub default_lower_bpm: f32,
    pub default_upper_bpm: f32,
    /// Band extends this far below the median
    pub below_median_bpm: f32,
    /// Band extends this far above the median (REM skews upward)
    pub above_median_bpm: f32,
    pub floor_bpm: f32,
    pub ceiling_bpm: f32,
    /// The latest reading must be this recent to count as "current"
    pub current_recency_min: i64,
}

impl Default for HeartRateConfig {
    fn default() -> Self {
        Self {
            lookback_min: 8 * 60,
            baseline_lookback_min: 120,
            min_samples: 10,
            default_lower_bpm: 45.0,
            default_upper_bpm: 70.0,
            below_median_bpm: 10.0,
            above_median_bpm: 15.0,
            floor_bpm: 40.0,
            ceiling_bpm: 90.0,
            current_recency_min: 10,
        }
    }
}

impl HeartRateConfig {
    pub fn lookback_us(&self) -> i64 {
        minutes(self.lookback_min)
    }
    pub fn baseline_lookback_us(&self) -> i64 {
        minutes(self.baseline_lookback_min)
    }
    pub fn current_recency_us(&self) -> i64 {
        minutes(self.current_recency_min)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupportConfig {
    /// Recency window for HRV / respiration; also their retention horizon
    pub recency_min: i64,
    pub hrv_min_ms: f32,
    pub hrv_max_ms: f32,
    pub resp_min_bpm: f32,
    pub resp_max_bpm: f32,
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            recency_min: 30,
            hrv_min_ms: 20.0,
            hrv_max_ms: 120.0,
            resp_min_bpm: 8.0,
            resp_max_bpm: 20.0,
        }
    }
}

impl SupportConfig {
    pub fn recency_us(&self) -> i64 {
        minutes(self.recency_min)
    }
}

/// Plausible bounds and built-in defaults for the REM timing model (minutes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub latency_bounds_min: [i64; 2],
    pub cycle_bounds_min: [i64; 2],
    pub duration_bounds_min: [i64; 2],
    pub default_cycle_min: i64,
    pub default_duration_min: i64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            latency_bounds_min: [40, 160],
            cycle_bounds_min: [70, 120],
            duration_bounds_min: [10, 40],
            default_cycle_min: 90,
            default_duration_min: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_hours: i64,
    pub history_days: i64,
    pub fetch_timeout_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            history_days: 14,
            fetch_timeout_secs: 20,
        }
    }
}

impl RefreshConfig {
    pub fn interval_us(&self) -> i64 {
        self.interval_hours * US_PER_HOUR
    }
    pub fn history_span_us(&self) -> i64 {
        self.history_days * US_PER_DAY
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Sample arrivals re-evaluate at most this often (seconds)
    pub min_interval_secs: i64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 5,
        }
    }
}

impl EvaluationConfig {
    pub fn min_interval_us(&self) -> i64 {
        self.min_interval_secs * US_PER_SEC
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Fixed offset applied when rendering clock times
    pub utc_offset_minutes: i32,
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if it exists)
    /// 3. Built-in defaults (lowest priority)
    pub fn load_layered(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = EngineConfig::default();

        if let Some(path) = path {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides. Variables are prefixed with
    /// `LUCID_`, e.g. `LUCID_WINDOWS_FRESHNESS_MIN=60`.
    pub(crate) fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn parse_env<T: std::str::FromStr>(name: &str, slot: &mut T) -> Result<(), ConfigError> {
            if let Ok(val) = std::env::var(name) {
                *slot = val
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Validation(format!("Invalid {}", name)))?;
            }
            Ok(())
        }

        parse_env("LUCID_WINDOWS_FRESHNESS_MIN", &mut self.windows.freshness_min)?;
        parse_env(
            "LUCID_WINDOWS_SESSION_MERGE_GAP_MIN",
            &mut self.windows.session_merge_gap_min,
        )?;
        parse_env("LUCID_WINDOWS_REM_MERGE_GAP_MIN", &mut self.windows.rem_merge_gap_min)?;
        parse_env("LUCID_WINDOWS_EXPLICIT_GRACE_MIN", &mut self.windows.explicit_grace_min)?;
        parse_env("LUCID_HEART_RATE_MIN_SAMPLES", &mut self.heart_rate.min_samples)?;
        parse_env("LUCID_SUPPORT_RECENCY_MIN", &mut self.support.recency_min)?;
        parse_env("LUCID_REFRESH_INTERVAL_HOURS", &mut self.refresh.interval_hours)?;
        parse_env("LUCID_REFRESH_HISTORY_DAYS", &mut self.refresh.history_days)?;
        parse_env(
            "LUCID_REFRESH_FETCH_TIMEOUT_SECS",
            &mut self.refresh.fetch_timeout_secs,
        )?;
        parse_env(
            "LUCID_EVALUATION_MIN_INTERVAL_SECS",
            &mut self.evaluation.min_interval_secs,
        )?;
        parse_env(
            "LUCID_DISPLAY_UTC_OFFSET_MINUTES",
            &mut self.display.utc_offset_minutes,
        )?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Validation(msg.to_string()))
        }

        let w = &self.windows;
        if w.stage_lookback_min <= 0 || w.freshness_min <= 0 {
            return invalid("windows.stage_lookback_min and freshness_min must be positive");
        }
        if w.session_merge_gap_min < 0 || w.rem_merge_gap_min < 0 || w.explicit_grace_min < 0 {
            return invalid("windows gaps must be non-negative");
        }

        let hr = &self.heart_rate;
        if hr.lookback_min <= 0 || hr.baseline_lookback_min <= 0 {
            return invalid("heart_rate lookbacks must be positive");
        }
        if hr.default_lower_bpm >= hr.default_upper_bpm {
            return invalid("heart_rate.default_lower_bpm must be < default_upper_bpm");
        }
        if hr.floor_bpm >= hr.ceiling_bpm {
            return invalid("heart_rate.floor_bpm must be < ceiling_bpm");
        }
        if hr.below_median_bpm < 0.0 || hr.above_median_bpm < 0.0 {
            return invalid("heart_rate band offsets must be non-negative");
        }

        let s = &self.support;
        if s.recency_min <= 0 {
            return invalid("support.recency_min must be positive");
        }
        if s.hrv_min_ms >= s.hrv_max_ms || s.resp_min_bpm >= s.resp_max_bpm {
            return invalid("support bands must have min < max");
        }

        let p = &self.prediction;
        for (name, b) in [
            ("latency", p.latency_bounds_min),
            ("cycle", p.cycle_bounds_min),
            ("duration", p.duration_bounds_min),
        ] {
            if b[0] <= 0 || b[0] > b[1] {
                return Err(ConfigError::Validation(format!(
                    "prediction.{}_bounds_min must satisfy 0 < lo <= hi",
                    name
                )));
            }
        }
        if p.default_duration_min >= p.default_cycle_min {
            return invalid("prediction.default_duration_min must be < default_cycle_min");
        }

        let r = &self.refresh;
        if r.interval_hours <= 0 || r.history_days <= 0 || r.fetch_timeout_secs == 0 {
            return invalid("refresh values must be positive");
        }

        if self.evaluation.min_interval_secs < 0 {
            return invalid("evaluation.min_interval_secs must be non-negative");
        }
        if self.display.utc_offset_minutes.abs() > 18 * 60 {
            return invalid("display.utc_offset_minutes must be within +/-18h");
        }

        Ok(())
    }

    /// Export configuration to TOML string
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = self
            .to_toml_string()
            .map_err(|e| ConfigError::Validation(format!("TOML serialization error: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }
}
