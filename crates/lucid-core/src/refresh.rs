//! Background rebuild of the REM timing model.
//!
//! Fetching history is the only blocking I/O in the engine, so it runs as
//! an independent tokio task. The hot evaluation path only ever reads the
//! current model from a [`ModelSlot`].
//!
//! ```text
//! Evaluation path             Refresh task
//!     |                            |
//!     | maybe_refresh() -------->  | fetch (with timeout)
//!     | read model                 | rebuild
//!     |                            | swap if generation unchanged
//!     | stop(): invalidate+abort   |
//! ```
//!
//! A refresh that started before `stop()` and completes after it sees a
//! newer generation and discards its result.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::domain::{elapsed_us, StageSample};
use crate::predictor::PredictionModel;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history fetch failed: {0}")]
    Fetch(String),
    #[error("history fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("refresh superseded (generation {started} != {current})")]
    Cancelled { started: u64, current: u64 },
}

/// Source of historical stage samples (e.g. a health data store).
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_stage_history(
        &self,
        from_us: i64,
        to_us: i64,
    ) -> Result<Vec<StageSample>, HistoryError>;
}

/// Serves a fixed list of samples, filtered to the requested range.
#[derive(Debug, Clone, Default)]
pub struct StaticHistorySource {
    samples: Vec<StageSample>,
}

impl StaticHistorySource {
    pub fn new(samples: Vec<StageSample>) -> Self {
        Self { samples }
    }
}

#[async_trait]
impl HistorySource for StaticHistorySource {
    async fn fetch_stage_history(
        &self,
        from_us: i64,
        to_us: i64,
    ) -> Result<Vec<StageSample>, HistoryError> {
        Ok(self
            .samples
            .iter()
            .filter(|s| s.end_us >= from_us && s.start_us <= to_us)
            .copied()
            .collect())
    }
}

#[derive(Debug)]
struct SlotState {
    model: PredictionModel,
    generation: u64,
}

/// Shared, atomically swapped model.
#[derive(Debug)]
pub struct ModelSlot {
    state: RwLock<SlotState>,
}

impl ModelSlot {
    pub fn new(model: PredictionModel) -> Self {
        Self {
            state: RwLock::new(SlotState {
                model,
                generation: 0,
            }),
        }
    }

    pub fn model(&self) -> PredictionModel {
        self.state.read().model
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Make every in-flight refresh stale. Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        let mut state = self.state.write();
        state.generation += 1;
        state.generation
    }

    /// Rebuild from a copy of the current model, then swap it in unless
    /// the slot moved on to a newer generation since `started`. Readers
    /// are only blocked for the check and swap.
    pub fn apply<F>(&self, started: u64, rebuild: F) -> Result<PredictionModel, HistoryError>
    where
        F: FnOnce(&PredictionModel) -> PredictionModel,
    {
        let previous = self.model();
        let model = rebuild(&previous);

        let mut state = self.state.write();
        if state.generation != started {
            return Err(HistoryError::Cancelled {
                started,
                current: state.generation,
            });
        }
        state.model = model;
        Ok(model)
    }
}

impl Default for ModelSlot {
    fn default() -> Self {
        Self::new(PredictionModel::default())
    }
}

/// Schedules model rebuilds on a tokio runtime.
pub struct ModelRefresher {
    source: Arc<dyn HistorySource>,
    runtime: Handle,
    slot: Arc<ModelSlot>,
    config: Arc<EngineConfig>,
    timeout: Duration,
    task: Option<JoinHandle<()>>,
    last_attempt_us: Option<i64>,
}

impl ModelRefresher {
    pub fn new(
        source: Arc<dyn HistorySource>,
        runtime: Handle,
        slot: Arc<ModelSlot>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let timeout = Duration::from_secs(config.refresh.fetch_timeout_secs);
        Self {
            source,
            runtime,
            slot,
            config,
            timeout,
            task: None,
            last_attempt_us: None,
        }
    }

    /// Override the fetch timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn slot(&self) -> &Arc<ModelSlot> {
        &self.slot
    }

    pub fn in_flight(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Due if never attempted, or the refresh interval has elapsed.
    pub fn is_due(&self, now_us: i64) -> bool {
        match self.last_attempt_us {
            None => true,
            Some(last) => elapsed_us(now_us, last) >= self.config.refresh.interval_us(),
        }
    }

    /// Spawn a refresh if one is due and none is running.
    pub fn maybe_refresh(&mut self, now_us: i64) -> bool {
        if !self.is_due(now_us) || self.in_flight() {
            return false;
        }
        self.spawn(now_us);
        true
    }

    /// Spawn a refresh unless one is already running.
    pub fn refresh_now(&mut self, now_us: i64) -> bool {
        if self.in_flight() {
            return false;
        }
        self.spawn(now_us);
        true
    }

    fn spawn(&mut self, now_us: i64) {
        self.last_attempt_us = Some(now_us);
        let started = self.slot.generation();
        let from_us = now_us - self.config.refresh.history_span_us();
        let source = Arc::clone(&self.source);
        let slot = Arc::clone(&self.slot);
        let config = Arc::clone(&self.config);
        let timeout = self.timeout;

        log::debug!("Spawning model refresh (generation {})", started);
        self.task = Some(self.runtime.spawn(async move {
            let fetched = tokio::time::timeout(timeout, source.fetch_stage_history(from_us, now_us))
                .await
                .unwrap_or(Err(HistoryError::Timeout(timeout)));

            let outcome = fetched.and_then(|history| {
                slot.apply(started, |previous| {
                    PredictionModel::rebuild(&history, previous, &config)
                })
            });

            match outcome {
                Ok(model) => log::info!(
                    "Prediction model refreshed: latency={}min cycle={}min duration={}min ({} nights, {} windows)",
                    model.rem_latency_us / 60_000_000,
                    model.rem_cycle_us / 60_000_000,
                    model.rem_duration_us / 60_000_000,
                    model.source_nights,
                    model.source_windows
                ),
                Err(e @ HistoryError::Cancelled { .. }) => {
                    log::debug!("Discarding refresh result: {}", e)
                }
                Err(e) => log::warn!("Model refresh failed, keeping previous model: {}", e),
            }
        }));
    }

    /// Invalidate and abort any in-flight refresh. Synchronous.
    pub fn cancel(&mut self) {
        let generation = self.slot.invalidate();
        if let Some(task) = self.task.take() {
            task.abort();
            log::debug!("Aborted in-flight model refresh (now generation {})", generation);
        }
    }

    /// Forget the last attempt so the next check is due immediately.
    pub fn reset_schedule(&mut self) {
        self.last_attempt_us = None;
    }

    /// Wait for the current refresh task, if any.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log::warn!("Model refresh task panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for ModelRefresher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
