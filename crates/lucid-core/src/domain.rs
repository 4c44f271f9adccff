//! Core domain types: timestamps, externally sourced samples, derived
//! windows and the per-tick evaluation result.
//!
//! All timestamps are microseconds since the Unix epoch (`*_us`), all
//! durations are microseconds as well.

use serde::{Deserialize, Serialize};

// ============================================================================
// Time helpers
// ============================================================================

pub const US_PER_SEC: i64 = 1_000_000;
pub const US_PER_MIN: i64 = 60 * US_PER_SEC;
pub const US_PER_HOUR: i64 = 60 * US_PER_MIN;
pub const US_PER_DAY: i64 = 24 * US_PER_HOUR;

/// Minutes to microseconds.
#[inline]
pub const fn minutes(m: i64) -> i64 {
    m * US_PER_MIN
}

/// Fractional minutes to microseconds (used for settings expressed as `f32`).
#[inline]
pub fn minutes_f32(m: f32) -> i64 {
    (m as f64 * US_PER_MIN as f64).round() as i64
}

/// Elapsed time with saturating subtraction.
/// If clocks go backwards (now < last), returns 0 instead of a negative span.
#[inline]
pub fn elapsed_us(now_us: i64, last_us: i64) -> i64 {
    if now_us >= last_us {
        now_us - last_us
    } else {
        0
    }
}

/// Elapsed time in fractional minutes, saturating at zero.
#[inline]
pub fn elapsed_min(now_us: i64, last_us: i64) -> f32 {
    elapsed_us(now_us, last_us) as f32 / US_PER_MIN as f32
}

// ============================================================================
// Samples
// ============================================================================

/// Anything with a `[start, end]` extent on the timeline.
pub trait Timed {
    fn start_us(&self) -> i64;
    fn end_us(&self) -> i64;

    /// True if `[start, end]` intersects `[from_us, to_us]`.
    #[inline]
    fn overlaps(&self, from_us: i64, to_us: i64) -> bool {
        self.start_us() <= to_us && self.end_us() >= from_us
    }
}

/// Sleep stage as reported by the data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepStage {
    InBed,
    AsleepUnspecified,
    AsleepCore,
    AsleepDeep,
    AsleepRem,
}

impl SleepStage {
    pub fn is_rem(self) -> bool {
        matches!(self, SleepStage::AsleepRem)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageSample {
    pub start_us: i64,
    pub end_us: i64,
    pub stage: SleepStage,
}

impl StageSample {
    pub fn new(start_us: i64, end_us: i64, stage: SleepStage) -> Self {
        Self {
            start_us,
            end_us: end_us.max(start_us),
            stage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub start_us: i64,
    pub end_us: i64,
    pub bpm: f32,
}

impl HeartRateSample {
    pub fn new(start_us: i64, end_us: i64, bpm: f32) -> Self {
        Self {
            start_us,
            end_us: end_us.max(start_us),
            bpm,
        }
    }

    /// Point-in-time reading.
    pub fn at(ts_us: i64, bpm: f32) -> Self {
        Self::new(ts_us, ts_us, bpm)
    }
}

/// Which auxiliary signal a [`SupportSample`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportKind {
    /// Heart-rate variability (SDNN/RMSSD) in milliseconds
    HrvMs,
    /// Respiratory rate in breaths per minute
    RespBpm,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SupportSample {
    pub start_us: i64,
    pub end_us: i64,
    pub value: f32,
    pub kind: SupportKind,
}

impl SupportSample {
    pub fn new(start_us: i64, end_us: i64, value: f32, kind: SupportKind) -> Self {
        Self {
            start_us,
            end_us: end_us.max(start_us),
            value,
            kind,
        }
    }

    pub fn hrv(ts_us: i64, ms: f32) -> Self {
        Self::new(ts_us, ts_us, ms, SupportKind::HrvMs)
    }

    pub fn resp(ts_us: i64, breaths_per_min: f32) -> Self {
        Self::new(ts_us, ts_us, breaths_per_min, SupportKind::RespBpm)
    }
}

macro_rules! impl_timed {
    ($($t:ty),*) => {
        $(impl Timed for $t {
            #[inline]
            fn start_us(&self) -> i64 {
                self.start_us
            }
            #[inline]
            fn end_us(&self) -> i64 {
                self.end_us
            }
        })*
    };
}

impl_timed!(StageSample, HeartRateSample, SupportSample);

/// Motion-stillness state, derived externally from the accelerometer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StillnessState {
    pub is_still: bool,
    pub still_minutes: f32,
    pub moving_minutes: f32,
}

impl StillnessState {
    /// Onset of the current still period, if the wearer is still.
    pub fn onset_us(&self, now_us: i64) -> Option<i64> {
        if self.is_still && self.still_minutes > 0.0 {
            Some(now_us - minutes_f32(self.still_minutes))
        } else {
            None
        }
    }

    /// True if the wearer has been still for at least `required_minutes`.
    pub fn satisfies(&self, required_minutes: f32) -> bool {
        self.is_still && self.still_minutes >= required_minutes
    }
}

// ============================================================================
// Windows
// ============================================================================

/// The canonical "currently asleep" interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepWindow {
    pub start_us: i64,
    pub end_us: i64,
}

impl SleepWindow {
    /// Builds a window, swapping bounds if they arrive reversed.
    pub fn new(start_us: i64, end_us: i64) -> Self {
        if start_us <= end_us {
            Self { start_us, end_us }
        } else {
            Self {
                start_us: end_us,
                end_us: start_us,
            }
        }
    }

    pub fn duration_us(&self) -> i64 {
        self.end_us - self.start_us
    }
}

impl Timed for SleepWindow {
    fn start_us(&self) -> i64 {
        self.start_us
    }
    fn end_us(&self) -> i64 {
        self.end_us
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemSource {
    /// Backed by an OS-reported REM stage sample
    Explicit,
    /// Projected from the calibrated cycle model
    Inferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemWindow {
    pub start_us: i64,
    pub end_us: i64,
    pub source: RemSource,
}

impl RemWindow {
    pub fn duration_us(&self) -> i64 {
        self.end_us - self.start_us
    }
}

impl Timed for RemWindow {
    fn start_us(&self) -> i64 {
        self.start_us
    }
    fn end_us(&self) -> i64 {
        self.end_us
    }
}

// ============================================================================
// Output
// ============================================================================

/// Per-tick decision. Transient: recomputed on every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemEvaluationResult {
    pub is_rem: bool,
    pub description: String,
    pub window_start_us: Option<i64>,
    pub window_end_us: Option<i64>,
}

impl RemEvaluationResult {
    /// A negative result with no window attached.
    pub fn negative(description: impl Into<String>) -> Self {
        Self {
            is_rem: false,
            description: description.into(),
            window_start_us: None,
            window_end_us: None,
        }
    }

    pub fn with_window(is_rem: bool, description: impl Into<String>, window: &RemWindow) -> Self {
        Self {
            is_rem,
            description: description.into(),
            window_start_us: Some(window.start_us),
            window_end_us: Some(window.end_us),
        }
    }
}

/// History entry emitted by the transition logger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_us: i64,
    pub note: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_saturates() {
        assert_eq!(elapsed_us(10, 20), 0);
        assert_eq!(elapsed_us(20, 10), 10);
        assert!((elapsed_min(minutes(90), 0) - 90.0).abs() < 1e-4);
    }

    #[test]
    fn test_sleep_window_ordering() {
        let w = SleepWindow::new(100, 50);
        assert!(w.start_us <= w.end_us);
        assert_eq!(w.duration_us(), 50);
    }

    #[test]
    fn test_stillness_onset() {
        let s = StillnessState {
            is_still: true,
            still_minutes: 12.0,
            moving_minutes: 0.0,
        };
        assert_eq!(s.onset_us(minutes(60)), Some(minutes(48)));
        assert!(s.satisfies(10.0));
        assert!(!s.satisfies(15.0));

        let moving = StillnessState::default();
        assert_eq!(moving.onset_us(minutes(60)), None);
        assert!(!moving.satisfies(1.0));
    }

    #[test]
    fn test_sample_serde_stage_names() {
        let s = StageSample::new(0, 10, SleepStage::AsleepRem);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("asleep_rem"));
        let back: StageSample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
