//! The evaluation pipeline.
//!
//! ```text
//! samples -> SignalAggregator -> SessionWindowResolver -> SleepWindow
//!         -> explicit REM stage | RemWindowPredictor (inferred)
//!         -> HeartRateRangeEstimator + SupportSignalEvaluator
//!         -> DetectionGate -> RemEvaluationResult
//!         -> TransitionLogger -> HistorySink
//!         -> observers
//! ```
//!
//! Single writer: every mutation goes through `&mut self`, driven by
//! sample arrival and ticks. Only the model refresh runs elsewhere, and it
//! communicates through the shared [`ModelSlot`].

use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::aggregator::{BufferCounts, SignalAggregator};
use crate::clock::Clock;
use crate::config::{DetectionSettings, EngineConfig};
use crate::domain::{
    elapsed_min, elapsed_us, HeartRateSample, LogEntry, RemEvaluationResult, RemSource, RemWindow,
    SleepWindow, StageSample, StillnessState, SupportSample, Timed,
};
use crate::format::ClockFormatter;
use crate::gate::{DetectionGate, GateInputs, GatePath};
use crate::heart_rate::HeartRateRangeEstimator;
use crate::predictor::{PredictionModel, PredictionPhase, RemWindowPredictor};
use crate::refresh::{HistorySource, ModelRefresher, ModelSlot};
use crate::session::{merge_spans, ResolutionInput, SessionWindowResolver};
use crate::sink::{HistorySink, NullHistorySink, ResultObserver};
use crate::support::SupportSignalEvaluator;
use crate::transition::TransitionLogger;

pub const STATUS_NOT_MONITORING: &str = "Not monitoring";
pub const STATUS_NOT_STILL: &str = "Not still enough for sleep";
pub const STATUS_NO_SLEEP: &str = "No sleep start detected";

/// Diagnostic snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub monitoring: bool,
    pub session_generation: u64,
    pub model_generation: u64,
    pub refresh_in_flight: bool,
    pub buffers: BufferCounts,
    pub model: PredictionModel,
    pub settings: DetectionSettings,
    pub last_result: Option<RemEvaluationResult>,
}

pub struct SleepPhaseEngine {
    config: Arc<EngineConfig>,
    settings: DetectionSettings,
    clock: Arc<dyn Clock>,
    signals: SignalAggregator,
    resolver: SessionWindowResolver,
    hr_estimator: HeartRateRangeEstimator,
    support: SupportSignalEvaluator,
    model: Arc<ModelSlot>,
    refresher: Option<ModelRefresher>,
    transitions: TransitionLogger,
    formatter: ClockFormatter,
    observers: Vec<Box<dyn ResultObserver>>,
    history: Box<dyn HistorySink>,
    stillness: StillnessState,
    stillness_onset_us: Option<i64>,
    session_start_us: Option<i64>,
    monitoring: bool,
    session_generation: u64,
    last_eval_us: Option<i64>,
    last_result: Option<RemEvaluationResult>,
}

impl SleepPhaseEngine {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let formatter = ClockFormatter::with_offset_minutes(config.display.utc_offset_minutes);
        let model = Arc::new(ModelSlot::new(PredictionModel::builtin(&config.prediction)));
        Self {
            signals: SignalAggregator::new(&config),
            resolver: SessionWindowResolver::new(&config.windows),
            hr_estimator: HeartRateRangeEstimator::new(config.heart_rate.clone()),
            support: SupportSignalEvaluator::new(config.support.clone()),
            transitions: TransitionLogger::new(formatter),
            formatter,
            config: Arc::new(config),
            settings: DetectionSettings::default(),
            clock,
            model,
            refresher: None,
            observers: Vec::new(),
            history: Box::new(NullHistorySink),
            stillness: StillnessState::default(),
            stillness_onset_us: None,
            session_start_us: None,
            monitoring: false,
            session_generation: 0,
            last_eval_us: None,
            last_result: None,
        }
    }

    /// Enable periodic calibration from `source`, spawned on `runtime`.
    pub fn with_history_source(mut self, source: Arc<dyn HistorySource>, runtime: Handle) -> Self {
        self.refresher = Some(ModelRefresher::new(
            source,
            runtime,
            Arc::clone(&self.model),
            Arc::clone(&self.config),
        ));
        self
    }

    pub fn with_settings(mut self, settings: DetectionSettings) -> Self {
        self.settings = settings.sanitized();
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn ResultObserver>) {
        self.observers.push(observer);
    }

    pub fn set_history_sink(&mut self, sink: Box<dyn HistorySink>) {
        self.history = sink;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: DetectionSettings) {
        self.settings = settings.sanitized();
        log::debug!("Detection settings updated: {:?}", self.settings);
    }

    pub fn prediction_model(&self) -> PredictionModel {
        self.model.model()
    }

    /// Shared model slot, for callers that drive refreshes themselves.
    pub fn model_slot(&self) -> Arc<ModelSlot> {
        Arc::clone(&self.model)
    }

    pub fn refresher_mut(&mut self) -> Option<&mut ModelRefresher> {
        self.refresher.as_mut()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin monitoring. Idempotent: a second call is a no-op.
    pub fn start(&mut self, session_start_us: Option<i64>) {
        if self.monitoring {
            log::debug!("start() ignored: already monitoring");
            return;
        }
        let now = self.clock.now_us();
        self.signals.clear();
        self.transitions.reset();
        self.stillness = StillnessState::default();
        self.stillness_onset_us = None;
        self.session_start_us = session_start_us;
        self.last_eval_us = None;
        self.last_result = None;
        self.session_generation += 1;
        self.monitoring = true;

        if let Some(refresher) = self.refresher.as_mut() {
            refresher.maybe_refresh(now);
        }
        log::info!(
            "Monitoring started (session {}, start={:?})",
            self.session_generation,
            session_start_us
        );
    }

    /// Stop monitoring. Idempotent. Cancels any in-flight refresh and
    /// discards all sample buffers; the prediction model is kept.
    pub fn stop(&mut self) {
        if !self.monitoring {
            log::debug!("stop() ignored: not monitoring");
            return;
        }
        if let Some(refresher) = self.refresher.as_mut() {
            if refresher.in_flight() {
                refresher.reset_schedule();
            }
            refresher.cancel();
        }

        // Close an open REM window so history stays paired.
        let closing = self
            .transitions
            .observe(&RemEvaluationResult::negative(STATUS_NOT_MONITORING));
        self.persist(closing);

        self.monitoring = false;
        self.signals.clear();
        self.transitions.reset();
        self.stillness = StillnessState::default();
        self.stillness_onset_us = None;
        self.session_start_us = None;
        self.last_eval_us = None;
        self.last_result = None;
        self.session_generation += 1;
        log::info!("Monitoring stopped");
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    pub fn ingest_stage(&mut self, sample: StageSample) -> Option<RemEvaluationResult> {
        if !self.accepting("stage") {
            return None;
        }
        let now = self.clock.now_us();
        self.signals.ingest_stage(sample, now);
        self.on_sample(now)
    }

    pub fn ingest_heart_rate(&mut self, sample: HeartRateSample) -> Option<RemEvaluationResult> {
        if !self.accepting("heart rate") {
            return None;
        }
        let now = self.clock.now_us();
        self.signals.ingest_heart_rate(sample, now);
        self.on_sample(now)
    }

    pub fn ingest_support(&mut self, sample: SupportSample) -> Option<RemEvaluationResult> {
        if !self.accepting("support") {
            return None;
        }
        let now = self.clock.now_us();
        self.signals.ingest_support(sample, now);
        self.on_sample(now)
    }

    pub fn update_stillness(&mut self, state: StillnessState) {
        self.stillness = state;
    }

    /// Explicit stillness onset; overrides the onset derived from
    /// [`StillnessState::still_minutes`]. `None` clears the override.
    pub fn set_stillness_onset(&mut self, onset_us: Option<i64>) {
        self.stillness_onset_us = onset_us;
    }

    fn accepting(&self, kind: &str) -> bool {
        if !self.monitoring {
            log::trace!("Ignoring {} sample: not monitoring", kind);
        }
        self.monitoring
    }

    /// Re-evaluate on sample arrival, at most once per minimum interval.
    /// A clock that stepped backwards makes the next sample due.
    fn on_sample(&mut self, now_us: i64) -> Option<RemEvaluationResult> {
        let due = match self.last_eval_us {
            None => true,
            Some(last) if now_us < last => true,
            Some(last) => elapsed_us(now_us, last) >= self.config.evaluation.min_interval_us(),
        };
        due.then(|| self.evaluate())
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// External timer tick. Same as [`Self::evaluate`] while monitoring.
    pub fn tick(&mut self) -> Option<RemEvaluationResult> {
        self.monitoring.then(|| self.evaluate())
    }

    /// Run the full pipeline. Never fails: uncertainty degrades to a
    /// negative result with a descriptive status.
    pub fn evaluate(&mut self) -> RemEvaluationResult {
        let now = self.clock.now_us();
        if !self.monitoring {
            return RemEvaluationResult::negative(STATUS_NOT_MONITORING);
        }

        self.signals.prune_all(now);
        if let Some(refresher) = self.refresher.as_mut() {
            refresher.maybe_refresh(now);
        }

        let result = self.compute(now);
        self.last_eval_us = Some(now);

        let entries = self.transitions.observe(&result);
        self.persist(entries);
        for observer in self.observers.iter_mut() {
            observer.on_result(&result);
        }
        self.last_result = Some(result.clone());
        result
    }

    fn persist(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            if let Err(e) = self.history.record(&entry) {
                log::warn!("Failed to record history entry '{}': {}", entry.note, e);
            }
        }
    }

    fn compute(&self, now_us: i64) -> RemEvaluationResult {
        if DetectionGate::stillness_blocks(&self.settings, &self.stillness) {
            return RemEvaluationResult::negative(STATUS_NOT_STILL);
        }

        let onset = self
            .stillness_onset_us
            .or_else(|| self.stillness.onset_us(now_us));
        let input = ResolutionInput {
            stages: self.signals.stage.samples(),
            session_start_us: self.session_start_us,
            stillness_onset_us: onset,
            now_us,
        };
        let Some(resolved) = self.resolver.resolve(&input) else {
            return RemEvaluationResult::negative(STATUS_NO_SLEEP);
        };
        let sleep = resolved.window;

        let candidate = match self.explicit_candidate(&sleep, now_us) {
            Some(window) => window,
            None => {
                let model = self.model.model();
                let predicted = RemWindowPredictor::new(&model).predict(&sleep, now_us);
                let interval = self.interval(&predicted.window);
                match predicted.phase {
                    PredictionPhase::Active => predicted.window,
                    PredictionPhase::Upcoming => {
                        return RemEvaluationResult::with_window(
                            false,
                            format!("Next REM window expected: {}", interval),
                            &predicted.window,
                        )
                    }
                    PredictionPhase::Passed => {
                        return RemEvaluationResult::with_window(
                            false,
                            format!("REM window passed: {}", interval),
                            &predicted.window,
                        )
                    }
                }
            }
        };

        let hr_samples = self.signals.heart_rate.samples();
        let range = self.hr_estimator.estimate(hr_samples, &sleep, now_us);
        let current_bpm = self.hr_estimator.current_bpm(hr_samples, now_us);
        let hr_in_range = current_bpm.map_or(false, |bpm| range.contains(bpm));

        let support = self.support.evaluate(
            self.signals.hrv.samples(),
            self.signals.respiratory.samples(),
            &self.settings,
            now_us,
        );
        let inputs = GateInputs::new(hr_in_range, &support);
        let path = GatePath::from(candidate.source);
        let pass = DetectionGate::decide(path, self.settings.strictness, inputs);

        log::debug!(
            "{:?} window {} ({:.0} min into {:?} sleep): strictness={} bpm={:?} band=[{:.0}, {:.0}]{} support={:?} -> {}",
            path,
            self.interval(&candidate),
            elapsed_min(now_us, sleep.start_us),
            resolved.origin,
            self.settings.strictness.as_str(),
            current_bpm,
            range.lower_bpm,
            range.upper_bpm,
            if range.is_dynamic() { "" } else { " (default)" },
            support,
            pass
        );

        let interval = self.interval(&candidate);
        let description = match (path, pass) {
            (GatePath::Explicit, true) => format!("Detected REM window: {}", interval),
            (GatePath::Inferred, true) => format!("Predicted REM window: {}", interval),
            (GatePath::Explicit, false) => {
                format!("REM window found but signals not supportive: {}", interval)
            }
            (GatePath::Inferred, false) => {
                format!("Predicted REM window not confirmed by signals: {}", interval)
            }
        };
        RemEvaluationResult::with_window(pass, description, &candidate)
    }

    /// Latest REM stage window overlapping the sleep window that ended
    /// within the grace period.
    fn explicit_candidate(&self, sleep: &SleepWindow, now_us: i64) -> Option<RemWindow> {
        let grace = self.config.windows.explicit_grace_us();
        let rem = self
            .signals
            .stage
            .samples()
            .iter()
            .filter(|s| s.stage.is_rem());
        merge_spans(rem, self.config.windows.rem_merge_gap_us())
            .into_iter()
            .filter(|span| span.overlaps(sleep.start_us, sleep.end_us))
            .filter(|span| span.end_us >= now_us - grace && span.start_us <= now_us)
            .max_by_key(|span| span.end_us)
            .map(|span| RemWindow {
                start_us: span.start_us,
                end_us: span.end_us,
                source: RemSource::Explicit,
            })
    }

    fn interval(&self, window: &RemWindow) -> String {
        self.formatter.interval(window.start_us, window.end_us)
    }

    pub fn last_result(&self) -> Option<&RemEvaluationResult> {
        self.last_result.as_ref()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            monitoring: self.monitoring,
            session_generation: self.session_generation,
            model_generation: self.model.generation(),
            refresh_in_flight: self.refresher.as_ref().map_or(false, |r| r.in_flight()),
            buffers: self.signals.counts(),
            model: self.model.model(),
            settings: self.settings.clone(),
            last_result: self.last_result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{minutes, SleepStage};
    use crate::sink::MemoryHistorySink;

    fn engine(clock: Arc<ManualClock>) -> SleepPhaseEngine {
        SleepPhaseEngine::new(EngineConfig::default(), clock).with_settings(DetectionSettings {
            require_stillness: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_not_monitoring() {
        let clock = Arc::new(ManualClock::new(0));
        let mut e = engine(clock);
        assert_eq!(e.evaluate().description, STATUS_NOT_MONITORING);
        assert!(e.tick().is_none());
        assert!(e.ingest_heart_rate(HeartRateSample::at(0, 60.0)).is_none());
        assert_eq!(e.status().buffers, BufferCounts::default());
    }

    #[test]
    fn test_no_window() {
        let clock = Arc::new(ManualClock::new(minutes(60)));
        let mut e = engine(clock);
        e.start(None);
        let r = e.evaluate();
        assert!(!r.is_rem);
        assert_eq!(r.description, STATUS_NO_SLEEP);
        assert!(r.window_start_us.is_none());
    }

    #[test]
    fn test_start_stop_idempotent() {
        let clock = Arc::new(ManualClock::new(minutes(60)));
        let mut e = engine(clock);
        e.start(Some(0));
        e.ingest_heart_rate(HeartRateSample::at(minutes(59), 55.0));
        e.start(Some(minutes(30)));
        assert_eq!(e.status().buffers.heart_rate, 1);
        assert_eq!(e.status().session_generation, 1);
        e.stop();
        e.stop();
        assert!(!e.is_monitoring());
        assert_eq!(e.status().session_generation, 2);
        assert_eq!(e.status().buffers, BufferCounts::default());
    }

    #[test]
    fn test_sample_throttle() {
        let clock = Arc::new(ManualClock::new(minutes(60)));
        let mut e = engine(Arc::clone(&clock));
        e.start(Some(0));
        assert!(e.ingest_heart_rate(HeartRateSample::at(minutes(59), 55.0)).is_some());
        clock.advance(1_000_000);
        assert!(e.ingest_heart_rate(HeartRateSample::at(minutes(60), 55.0)).is_none());
        clock.advance(5_000_000);
        assert!(e.ingest_heart_rate(HeartRateSample::at(minutes(60), 55.0)).is_some());
    }

    #[test]
    fn test_sample_throttle_after_clock_steps_back() {
        let clock = Arc::new(ManualClock::new(minutes(60)));
        let mut e = engine(Arc::clone(&clock));
        e.start(Some(0));
        assert!(e.ingest_heart_rate(HeartRateSample::at(minutes(59), 55.0)).is_some());
        clock.set(minutes(50));
        assert!(e.ingest_heart_rate(HeartRateSample::at(minutes(50), 55.0)).is_some());
        clock.advance(1_000_000);
        assert!(e.ingest_heart_rate(HeartRateSample::at(minutes(50), 55.0)).is_none());
    }

    #[test]
    fn test_stop_closes_open_window() {
        let clock = Arc::new(ManualClock::new(minutes(100)));
        let mut e = SleepPhaseEngine::new(EngineConfig::default(), clock.clone()).with_settings(
            DetectionSettings {
                require_stillness: false,
                strictness: crate::config::Strictness::Lenient,
                ..Default::default()
            },
        );
        let sink = MemoryHistorySink::new();
        e.set_history_sink(Box::new(sink.clone()));
        e.start(None);
        e.ingest_stage(StageSample::new(0, minutes(90), SleepStage::AsleepCore));
        e.ingest_stage(StageSample::new(minutes(90), minutes(100), SleepStage::AsleepRem));
        assert!(e.evaluate().is_rem);
        e.stop();
        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].timestamp_us, minutes(100));
    }

    #[test]
    fn test_observers_notified_in_order() {
        use parking_lot::Mutex;
        let clock = Arc::new(ManualClock::new(minutes(60)));
        let mut e = engine(clock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["cue", "ui"] {
            let seen = Arc::clone(&seen);
            e.add_observer(Box::new(move |_: &RemEvaluationResult| seen.lock().push(tag)));
        }
        e.start(None);
        e.evaluate();
        assert_eq!(*seen.lock(), vec!["cue", "ui"]);
    }
}
