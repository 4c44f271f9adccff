//! Session windowing: derives the canonical "currently asleep" window.
//!
//! Stage samples are unioned into sessions separated by gaps larger than
//! the session merge gap; the latest session is the primary candidate.
//! When stage data is stale or absent, the later of the monitoring
//! session start and the stillness onset (paired with "now") forms the
//! fallback candidate. An ordered list of [`ResolutionStrategy`] picks
//! between them; the first strategy that yields a window wins.

use serde::Serialize;

use crate::config::WindowConfig;
use crate::domain::{SleepWindow, StageSample, Timed};

/// A merged `[start, end]` span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start_us: i64,
    pub end_us: i64,
}

impl Timed for Span {
    fn start_us(&self) -> i64 {
        self.start_us
    }
    fn end_us(&self) -> i64 {
        self.end_us
    }
}

/// Union intervals whose separation does not exceed `gap_us`.
///
/// Input order does not matter; output is sorted by start. A sample
/// starts a new span only if its start exceeds the running span's end by
/// more than the gap.
pub fn merge_spans<'a, T, I>(samples: I, gap_us: i64) -> Vec<Span>
where
    T: Timed + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut raw: Vec<Span> = samples
        .into_iter()
        .map(|s| Span {
            start_us: s.start_us().min(s.end_us()),
            end_us: s.end_us().max(s.start_us()),
        })
        .collect();
    raw.sort_by_key(|s| (s.start_us, s.end_us));

    let mut merged: Vec<Span> = Vec::with_capacity(raw.len());
    for span in raw {
        match merged.last_mut() {
            Some(current) if span.start_us <= current.end_us.saturating_add(gap_us) => {
                current.end_us = current.end_us.max(span.end_us);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// Where a resolved window came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WindowOrigin {
    /// Latest stage session, recent enough to trust
    FreshStages,
    /// Session start / stillness onset, open-ended at now
    Fallback,
    /// Latest stage session, kept although stale
    StaleStages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedWindow {
    pub window: SleepWindow,
    pub origin: WindowOrigin,
}

impl ResolvedWindow {
    pub fn is_fresh(&self) -> bool {
        matches!(self.origin, WindowOrigin::FreshStages | WindowOrigin::Fallback)
    }
}

/// Inputs available to the resolver on one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionInput<'a> {
    pub stages: &'a [StageSample],
    pub session_start_us: Option<i64>,
    pub stillness_onset_us: Option<i64>,
    pub now_us: i64,
}

/// Candidates computed once and shared by every strategy.
#[derive(Debug, Clone, Copy)]
pub struct Candidates {
    pub primary: Option<SleepWindow>,
    pub primary_fresh: bool,
    pub fallback: Option<SleepWindow>,
}

/// One step of the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionStrategy {
    /// Use the stage session when it is fresh
    FreshPrimary,
    /// Use the fallback window when there is no stage session, or when
    /// it begins after the stage session ended (a newer sleep attempt)
    NewerFallback,
    /// Keep the stage session even though it is stale
    StalePrimary,
}

impl ResolutionStrategy {
    pub const DEFAULT_ORDER: [ResolutionStrategy; 3] = [
        ResolutionStrategy::FreshPrimary,
        ResolutionStrategy::NewerFallback,
        ResolutionStrategy::StalePrimary,
    ];

    pub fn attempt(&self, c: &Candidates) -> Option<ResolvedWindow> {
        match self {
            ResolutionStrategy::FreshPrimary => c
                .primary
                .filter(|_| c.primary_fresh)
                .map(|window| ResolvedWindow {
                    window,
                    origin: WindowOrigin::FreshStages,
                }),
            ResolutionStrategy::NewerFallback => {
                let fallback = c.fallback?;
                let newer = match c.primary {
                    None => true,
                    Some(primary) => fallback.start_us > primary.end_us,
                };
                newer.then_some(ResolvedWindow {
                    window: fallback,
                    origin: WindowOrigin::Fallback,
                })
            }
            ResolutionStrategy::StalePrimary => c.primary.map(|window| ResolvedWindow {
                window,
                origin: WindowOrigin::StaleStages,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionWindowResolver {
    merge_gap_us: i64,
    freshness_us: i64,
    strategies: Vec<ResolutionStrategy>,
}

impl SessionWindowResolver {
    pub fn new(config: &WindowConfig) -> Self {
        Self::with_strategies(config, ResolutionStrategy::DEFAULT_ORDER.to_vec())
    }

    pub fn with_strategies(config: &WindowConfig, strategies: Vec<ResolutionStrategy>) -> Self {
        Self {
            merge_gap_us: config.session_merge_gap_us(),
            freshness_us: config.freshness_us(),
            strategies,
        }
    }

    /// All sessions in chronological order.
    pub fn sessions(&self, stages: &[StageSample]) -> Vec<Span> {
        merge_spans(stages, self.merge_gap_us)
    }

    /// Most recent stage session, if any.
    pub fn latest_session(&self, stages: &[StageSample]) -> Option<SleepWindow> {
        self.sessions(stages)
            .last()
            .map(|s| SleepWindow::new(s.start_us, s.end_us))
    }

    /// Fresh if the latest contributing sample ended within the horizon.
    pub fn is_fresh(&self, window: &SleepWindow, now_us: i64) -> bool {
        now_us - window.end_us <= self.freshness_us
    }

    pub fn candidates(&self, input: &ResolutionInput<'_>) -> Candidates {
        let primary = self.latest_session(input.stages);
        let primary_fresh = primary
            .map(|w| self.is_fresh(&w, input.now_us))
            .unwrap_or(false);

        let fallback_start = match (input.session_start_us, input.stillness_onset_us) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let fallback = fallback_start
            .map(|start| SleepWindow::new(start.min(input.now_us), input.now_us));

        Candidates {
            primary,
            primary_fresh,
            fallback,
        }
    }

    /// Resolve the current sleep window. `None` means "cannot evaluate yet".
    pub fn resolve(&self, input: &ResolutionInput<'_>) -> Option<ResolvedWindow> {
        let candidates = self.candidates(input);
        let resolved = self
            .strategies
            .iter()
            .find_map(|strategy| strategy.attempt(&candidates));
        if let Some(r) = &resolved {
            log::trace!(
                "Resolved sleep window {:?} [{}, {}]",
                r.origin,
                r.window.start_us,
                r.window.end_us
            );
        }
        resolved
    }
}
