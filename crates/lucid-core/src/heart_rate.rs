//! Dynamic plausible heart-rate band.
//!
//! The band is centred on the median bpm of the last two hours of the
//! sleep window and is intentionally asymmetric: REM tachycardia skews
//! upward more than downward.

use serde::Serialize;

use crate::config::HeartRateConfig;
use crate::domain::{HeartRateSample, SleepWindow, Timed};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeartRateRange {
    pub lower_bpm: f32,
    pub upper_bpm: f32,
    /// Band centre: the sample median clamped to the plausible limits.
    /// `None` when the static default band is used.
    pub median_bpm: Option<f32>,
    pub sample_count: usize,
}

impl HeartRateRange {
    pub fn contains(&self, bpm: f32) -> bool {
        bpm >= self.lower_bpm && bpm <= self.upper_bpm
    }

    pub fn is_dynamic(&self) -> bool {
        self.median_bpm.is_some()
    }
}

/// Median of a non-empty slice; `None` if empty. Sorts in place.
pub(crate) fn median_f32(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        Some(values[n / 2])
    } else {
        Some((values[n / 2 - 1] + values[n / 2]) / 2.0)
    }
}

#[derive(Debug, Clone)]
pub struct HeartRateRangeEstimator {
    config: HeartRateConfig,
}

impl HeartRateRangeEstimator {
    pub fn new(config: HeartRateConfig) -> Self {
        Self { config }
    }

    pub fn default_range(&self) -> HeartRateRange {
        HeartRateRange {
            lower_bpm: self.config.default_lower_bpm,
            upper_bpm: self.config.default_upper_bpm,
            median_bpm: None,
            sample_count: 0,
        }
    }

    /// Band from samples overlapping `[max(window.start, now - 2h), min(window.end, now)]`.
    pub fn estimate(
        &self,
        samples: &[HeartRateSample],
        window: &SleepWindow,
        now_us: i64,
    ) -> HeartRateRange {
        let from = window
            .start_us
            .max(now_us - self.config.baseline_lookback_us());
        let to = window.end_us.min(now_us);
        if from > to {
            return self.default_range();
        }

        let mut bpms: Vec<f32> = samples
            .iter()
            .filter(|s| s.overlaps(from, to) && s.bpm.is_finite() && s.bpm > 0.0)
            .map(|s| s.bpm)
            .collect();
        let count = bpms.len();
        if count < self.config.min_samples {
            log::trace!(
                "Only {} HR samples (< {}), using default band",
                count,
                self.config.min_samples
            );
            return HeartRateRange {
                sample_count: count,
                ..self.default_range()
            };
        }

        let Some(median) = median_f32(&mut bpms) else {
            return self.default_range();
        };
        let floor = self.config.floor_bpm;
        let ceiling = self.config.ceiling_bpm;
        let centre = median.clamp(floor, ceiling);

        HeartRateRange {
            lower_bpm: (centre - self.config.below_median_bpm).max(floor),
            upper_bpm: (centre + self.config.above_median_bpm).min(ceiling),
            median_bpm: Some(centre),
            sample_count: count,
        }
    }

    /// Most recent reading, if it ended within the recency horizon.
    pub fn current_bpm(&self, samples: &[HeartRateSample], now_us: i64) -> Option<f32> {
        let horizon = now_us - self.config.current_recency_us();
        samples
            .iter()
            .filter(|s| s.end_us >= horizon && s.start_us <= now_us && s.bpm.is_finite())
            .max_by_key(|s| s.end_us)
            .map(|s| s.bpm)
    }
}
