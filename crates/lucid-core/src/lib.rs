//! Lucid core: sleep-phase inference from wearable signals.
//!
//! Estimates whether the wearer is currently in REM sleep and gates
//! lucid-dream cues on that estimate. Explicit REM stage labels are used
//! when the device reports them; otherwise REM windows are projected from
//! a model calibrated on past nights. Both paths pass through a
//! strictness-dependent gate over heart-rate and support signals.
//!
//! The crate holds no platform code. Samples, stillness and time are
//! injected; results leave through observers and a history sink.

#![allow(clippy::new_without_default)]
#![allow(clippy::manual_clamp)]

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod format;
pub mod gate;
pub mod heart_rate;
pub mod predictor;
pub mod refresh; // Background model calibration
pub mod session;
pub mod sink;
pub mod support;
pub mod transition;

// ============================================================================
// CURATED PUBLIC API EXPORTS
// ============================================================================

// Domain types
pub use domain::{
    elapsed_min, elapsed_us, minutes, HeartRateSample, LogEntry, RemEvaluationResult, RemSource,
    RemWindow, SleepStage, SleepWindow, StageSample, StillnessState, SupportKind, SupportSample,
    Timed,
};

// Configuration
pub use config::{AutoMode, ConfigError, DetectionSettings, EngineConfig, Strictness};

// Engine (high-level orchestrator)
pub use engine::{EngineStatus, SleepPhaseEngine};

// Pipeline stages
pub use aggregator::{BufferCounts, SampleBuffer, SignalAggregator};
pub use gate::{DetectionGate, GateInputs, GatePath};
pub use heart_rate::{HeartRateRange, HeartRateRangeEstimator};
pub use predictor::{PredictedWindow, PredictionModel, PredictionPhase, RemWindowPredictor};
pub use session::{ResolutionStrategy, ResolvedWindow, SessionWindowResolver, WindowOrigin};
pub use support::{SupportAssessment, SupportSignalEvaluator};
pub use transition::TransitionLogger;

// Time, output and calibration
pub use clock::{Clock, ManualClock, SystemClock};
pub use format::ClockFormatter;
pub use refresh::{HistoryError, HistorySource, ModelRefresher, ModelSlot, StaticHistorySource};
pub use sink::{
    ChannelObserver, HistorySink, JsonlHistorySink, MemoryHistorySink, NullHistorySink,
    ResultObserver, SinkError,
};
