//! Historical self-calibration of REM timing.
//!
//! A [`PredictionModel`] (latency to first REM, cycle length, REM
//! duration) is rebuilt from up to two weeks of stage history and used to
//! project the current-or-previous REM window when no explicit REM stage
//! is available.

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, PredictionConfig};
use crate::domain::{minutes, RemSource, RemWindow, SleepWindow, StageSample};
use crate::session::{merge_spans, Span};

/// Calibrated REM timing. Durations in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionModel {
    pub rem_latency_us: i64,
    pub rem_cycle_us: i64,
    pub rem_duration_us: i64,
    /// Sessions that contributed at least one REM window
    pub source_nights: usize,
    /// Total REM windows observed
    pub source_windows: usize,
}

impl Default for PredictionModel {
    fn default() -> Self {
        Self::builtin(&PredictionConfig::default())
    }
}

impl PredictionModel {
    /// Built-in model: latency = cycle - duration.
    pub fn builtin(config: &PredictionConfig) -> Self {
        let cycle = minutes(config.default_cycle_min);
        let duration = minutes(config.default_duration_min);
        Self {
            rem_latency_us: cycle - duration,
            rem_cycle_us: cycle,
            rem_duration_us: duration,
            source_nights: 0,
            source_windows: 0,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.source_windows > 0
    }

    /// Clamp every duration to its plausible range.
    pub fn clamped(mut self, config: &PredictionConfig) -> Self {
        let clamp = |v: i64, b: [i64; 2]| v.clamp(minutes(b[0]), minutes(b[1]));
        self.rem_latency_us = clamp(self.rem_latency_us, config.latency_bounds_min);
        self.rem_cycle_us = clamp(self.rem_cycle_us, config.cycle_bounds_min);
        self.rem_duration_us = clamp(self.rem_duration_us, config.duration_bounds_min);
        self
    }

    /// Rebuild from stage history. Pure and deterministic: the same
    /// history and previous model always yield the same result.
    ///
    /// Returns `previous` unchanged when no session contains a REM window.
    /// A metric with no observations (e.g. no session had two windows, so
    /// no cycle) keeps its previous value.
    pub fn rebuild(history: &[StageSample], previous: &PredictionModel, config: &EngineConfig) -> Self {
        let stats = collect_rem_stats(history, config);
        if stats.windows == 0 {
            log::debug!("No REM windows in {} history samples, keeping model", history.len());
            return *previous;
        }

        let mut latencies = stats.latencies;
        let mut cycles = stats.cycles;
        let mut durations = stats.durations;

        let model = PredictionModel {
            rem_latency_us: median_i64(&mut latencies).unwrap_or(previous.rem_latency_us),
            rem_cycle_us: median_i64(&mut cycles).unwrap_or(previous.rem_cycle_us),
            rem_duration_us: median_i64(&mut durations).unwrap_or(previous.rem_duration_us),
            source_nights: stats.nights,
            source_windows: stats.windows,
        };
        model.clamped(&config.prediction)
    }
}

#[derive(Debug, Default)]
struct RemStats {
    latencies: Vec<i64>,
    cycles: Vec<i64>,
    durations: Vec<i64>,
    nights: usize,
    windows: usize,
}

fn collect_rem_stats(history: &[StageSample], config: &EngineConfig) -> RemStats {
    let sessions = merge_spans(history, config.windows.session_merge_gap_us());
    let mut stats = RemStats::default();

    for session in &sessions {
        let rem_in_session = history
            .iter()
            .filter(|s| s.stage.is_rem() && within(session, s.start_us));
        let windows = merge_spans(rem_in_session, config.windows.rem_merge_gap_us());
        let Some(first) = windows.first() else {
            continue;
        };

        stats.nights += 1;
        stats.windows += windows.len();
        stats.latencies.push(first.start_us - session.start_us);
        stats
            .durations
            .extend(windows.iter().map(|w| w.end_us - w.start_us));
        stats
            .cycles
            .extend(windows.windows(2).map(|pair| pair[1].start_us - pair[0].start_us));
    }
    stats
}

#[inline]
fn within(span: &Span, ts_us: i64) -> bool {
    span.start_us <= ts_us && ts_us <= span.end_us
}

/// Median of integer durations; mean of the two middles for even counts.
fn median_i64(values: &mut [i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let n = values.len();
    if n % 2 == 1 {
        Some(values[n / 2])
    } else {
        Some((values[n / 2 - 1] + values[n / 2]) / 2)
    }
}

/// Where "now" sits relative to a predicted window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PredictionPhase {
    /// Now is before the first projected window
    Upcoming,
    /// Now lies inside the window
    Active,
    /// The window already closed; the next one has not opened yet
    Passed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PredictedWindow {
    pub window: RemWindow,
    pub phase: PredictionPhase,
    /// Zero-based cycle index
    pub cycle_index: i64,
}

/// Projects REM windows from a sleep window start.
#[derive(Debug, Clone, Copy)]
pub struct RemWindowPredictor<'a> {
    model: &'a PredictionModel,
}

impl<'a> RemWindowPredictor<'a> {
    pub fn new(model: &'a PredictionModel) -> Self {
        Self { model }
    }

    /// Window `k` starts at `start + latency + k * cycle`. The latest
    /// window whose start is not after `now` is selected, so a window that
    /// has closed stays visible until the next one opens. Before the first
    /// window opens, the first window is returned as upcoming.
    pub fn predict(&self, sleep: &SleepWindow, now_us: i64) -> PredictedWindow {
        let latency = self.model.rem_latency_us.max(0);
        let cycle = self.model.rem_cycle_us.max(1);
        let duration = self.model.rem_duration_us.max(0);

        let first_start = sleep.start_us + latency;
        let k = if now_us < first_start {
            0
        } else {
            (now_us - first_start) / cycle
        };
        let start = first_start + k * cycle;
        let window = RemWindow {
            start_us: start,
            end_us: start + duration,
            source: RemSource::Inferred,
        };
        let phase = if now_us < window.start_us {
            PredictionPhase::Upcoming
        } else if now_us <= window.end_us {
            PredictionPhase::Active
        } else {
            PredictionPhase::Passed
        };
        PredictedWindow {
            window,
            phase,
            cycle_index: k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SleepStage, US_PER_DAY};
    use proptest::prelude::*;

    fn sample(start_min: i64, end_min: i64, stage: SleepStage) -> StageSample {
        StageSample::new(minutes(start_min), minutes(end_min), stage)
    }

    /// One night: core from `offset`, REM blocks at the given minute offsets.
    fn night(offset_min: i64, rem: &[(i64, i64)]) -> Vec<StageSample> {
        let mut v = vec![sample(offset_min, offset_min + 480, SleepStage::AsleepCore)];
        v.extend(
            rem.iter()
                .map(|&(s, e)| sample(offset_min + s, offset_min + e, SleepStage::AsleepRem)),
        );
        v
    }

    #[test]
    fn test_builtin_defaults() {
        let m = PredictionModel::default();
        assert_eq!(m.rem_cycle_us, minutes(90));
        assert_eq!(m.rem_duration_us, minutes(20));
        assert_eq!(m.rem_latency_us, minutes(70));
        assert!(!m.is_calibrated());
    }

    #[test]
    fn test_rebuild_medians() {
        let config = EngineConfig::default();
        let day = US_PER_DAY / minutes(1);
        let mut history = night(0, &[(80, 100), (180, 205), (280, 310)]);
        history.extend(night(day, &[(90, 105), (190, 215)]));
        history.extend(night(2 * day, &[(100, 120)]));

        let m = PredictionModel::rebuild(&history, &PredictionModel::default(), &config);
        // latencies 80, 90, 100
        assert_eq!(m.rem_latency_us, minutes(90));
        // cycles 100, 100, 100
        assert_eq!(m.rem_cycle_us, minutes(100));
        // durations 20, 25, 30, 15, 25, 20 -> sorted 15,20,20,25,25,30 -> 22.5
        assert_eq!(m.rem_duration_us, minutes(45) / 2);
        assert_eq!(m.source_nights, 3);
        assert_eq!(m.source_windows, 6);
    }

    #[test]
    fn test_rem_fragments_merge_within_gap() {
        let config = EngineConfig::default();
        let history = night(0, &[(80, 90), (94, 100)]);
        let m = PredictionModel::rebuild(&history, &PredictionModel::default(), &config);
        assert_eq!(m.source_windows, 1);
        assert_eq!(m.rem_duration_us, minutes(20));
        // No cycle observed: previous cycle kept.
        assert_eq!(m.rem_cycle_us, minutes(90));
    }

    #[test]
    fn test_no_rem_keeps_previous() {
        let config = EngineConfig::default();
        let previous = PredictionModel {
            rem_latency_us: minutes(100),
            rem_cycle_us: minutes(95),
            rem_duration_us: minutes(25),
            source_nights: 4,
            source_windows: 9,
        };
        let history = night(0, &[]);
        assert_eq!(PredictionModel::rebuild(&history, &previous, &config), previous);
        assert_eq!(PredictionModel::rebuild(&[], &previous, &config), previous);
    }

    #[test]
    fn test_rebuild_idempotent() {
        let config = EngineConfig::default();
        let history = night(0, &[(70, 95), (160, 180), (255, 290)]);
        let a = PredictionModel::rebuild(&history, &PredictionModel::default(), &config);
        let b = PredictionModel::rebuild(&history, &PredictionModel::default(), &config);
        assert_eq!(a, b);
        // Feeding the result back in changes nothing either.
        let c = PredictionModel::rebuild(&history, &a, &config);
        assert_eq!(a, c);
    }

    #[test]
    fn test_extremes_clamped() {
        let config = EngineConfig::default();
        let history = night(0, &[(5, 6), (300, 400)]);
        let m = PredictionModel::rebuild(&history, &PredictionModel::default(), &config);
        assert_eq!(m.rem_latency_us, minutes(40));
        assert_eq!(m.rem_cycle_us, minutes(120));
        // durations 1 and 100 -> 50 -> clamped to 40
        assert_eq!(m.rem_duration_us, minutes(40));
    }

    #[test]
    fn test_predict_passed_window() {
        // Sleep 23:00, now 00:45 (105 min), default model.
        let model = PredictionModel::default();
        let sleep = SleepWindow::new(0, minutes(105));
        let p = RemWindowPredictor::new(&model).predict(&sleep, minutes(105));
        assert_eq!(p.window.start_us, minutes(70));
        assert_eq!(p.window.end_us, minutes(90));
        assert_eq!(p.phase, PredictionPhase::Passed);
        assert_eq!(p.window.source, RemSource::Inferred);
    }

    #[test]
    fn test_predict_active_and_upcoming() {
        let model = PredictionModel::default();
        let predictor = RemWindowPredictor::new(&model);
        let sleep = SleepWindow::new(0, minutes(400));

        let p = predictor.predict(&sleep, minutes(30));
        assert_eq!(p.phase, PredictionPhase::Upcoming);
        assert_eq!(p.window.start_us, minutes(70));

        let p = predictor.predict(&sleep, minutes(170));
        assert_eq!(p.phase, PredictionPhase::Active);
        assert_eq!(p.cycle_index, 1);
        assert_eq!(p.window.start_us, minutes(160));
    }

    #[test]
    fn test_predict_exactly_at_cycle_boundary() {
        let model = PredictionModel::default();
        let sleep = SleepWindow::new(0, minutes(400));
        let p = RemWindowPredictor::new(&model).predict(&sleep, minutes(250));
        assert_eq!(p.cycle_index, 2);
        assert_eq!(p.phase, PredictionPhase::Active);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_model_always_within_bounds(
            rem in proptest::collection::vec((0i64..2000, 0i64..600), 1..12)
        ) {
            let config = EngineConfig::default();
            let rem: Vec<(i64, i64)> = rem.into_iter().map(|(s, d)| (s, s + d)).collect();
            let mut history = vec![sample(0, 3000, SleepStage::AsleepCore)];
            history.extend(rem.iter().map(|&(s, e)| sample(s, e, SleepStage::AsleepRem)));
            let m = PredictionModel::rebuild(&history, &PredictionModel::default(), &config);
            prop_assert!(m.rem_latency_us >= minutes(40) && m.rem_latency_us <= minutes(160));
            prop_assert!(m.rem_cycle_us >= minutes(70) && m.rem_cycle_us <= minutes(120));
            prop_assert!(m.rem_duration_us >= minutes(10) && m.rem_duration_us <= minutes(40));
        }

        #[test]
        fn prop_inferred_window_duration_bounded(now_min in 0i64..900) {
            let model = PredictionModel::default();
            let sleep = SleepWindow::new(0, minutes(now_min));
            let p = RemWindowPredictor::new(&model).predict(&sleep, minutes(now_min));
            prop_assert!(p.window.duration_us() >= minutes(10));
            prop_assert!(p.window.duration_us() <= minutes(40));
            prop_assert!(p.window.start_us <= minutes(now_min) || p.phase == PredictionPhase::Upcoming);
        }
    }
}
