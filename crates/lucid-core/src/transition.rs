//! Idempotent REM start/end event emission.
//!
//! A window's identity is its start/end quantized to whole minutes. Each
//! identity produces at most one "REM detected" and one "REM ended" entry,
//! however many evaluations observe it. Entry timestamps are the window's
//! own bounds, never the time the entry was written. A window that keeps
//! its start minute but ends later is the same REM period growing, not a
//! new one.

use std::collections::HashSet;

use crate::domain::{LogEntry, RemEvaluationResult, US_PER_MIN};
use crate::format::ClockFormatter;

/// Minute-quantized window identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId {
    pub start_min: i64,
    pub end_min: i64,
}

impl WindowId {
    pub fn from_bounds(start_us: i64, end_us: i64) -> Self {
        Self {
            start_min: start_us.div_euclid(US_PER_MIN),
            end_min: end_us.div_euclid(US_PER_MIN),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveWindow {
    id: WindowId,
    start_us: i64,
    end_us: i64,
}

#[derive(Debug, Default)]
pub struct TransitionLogger {
    detected: HashSet<WindowId>,
    ended: HashSet<WindowId>,
    active: Option<ActiveWindow>,
    formatter: ClockFormatter,
}

impl TransitionLogger {
    pub fn new(formatter: ClockFormatter) -> Self {
        Self {
            formatter,
            ..Default::default()
        }
    }

    /// Feed one evaluation; returns the entries to persist (0, 1 or 2).
    pub fn observe(&mut self, result: &RemEvaluationResult) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        let window = match (result.window_start_us, result.window_end_us) {
            (Some(s), Some(e)) => Some((WindowId::from_bounds(s, e), s, e)),
            _ => None,
        };

        if result.is_rem {
            let Some((id, start_us, end_us)) = window else {
                return entries;
            };
            if let Some(active) = self.active.as_mut() {
                if active.id == id {
                    return entries;
                }
                // Same start minute: the window grew as more of it arrived.
                if active.id.start_min == id.start_min {
                    log::trace!("REM window {:?} extended to {:?}", active.id, id);
                    self.detected.insert(id);
                    active.id = id;
                    active.end_us = end_us;
                    return entries;
                }
            }
            // A different window superseding the active one closes it first.
            if let Some(active) = self.active {
                self.close(active, &mut entries);
            }
            if self.detected.insert(id) {
                entries.push(LogEntry {
                    timestamp_us: start_us,
                    note: format!("REM detected: {}", self.formatter.interval(start_us, end_us)),
                });
                log::debug!("REM detected {:?}", id);
            }
            if !self.ended.contains(&id) {
                self.active = Some(ActiveWindow {
                    id,
                    start_us,
                    end_us,
                });
            }
        } else if let Some(active) = self.active {
            self.close(active, &mut entries);
        }
        entries
    }

    fn close(&mut self, active: ActiveWindow, entries: &mut Vec<LogEntry>) {
        self.active = None;
        if self.ended.insert(active.id) {
            entries.push(LogEntry {
                timestamp_us: active.end_us,
                note: format!(
                    "REM ended: {}",
                    self.formatter.interval(active.start_us, active.end_us)
                ),
            });
            log::debug!("REM ended {:?}", active.id);
        }
    }

    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    /// Forget every identity (monitoring stopped).
    pub fn reset(&mut self) {
        self.detected.clear();
        self.ended.clear();
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{minutes, RemSource, RemWindow};
    use proptest::prelude::*;

    fn rem(start_min: i64, end_min: i64) -> RemWindow {
        RemWindow {
            start_us: minutes(start_min),
            end_us: minutes(end_min),
            source: RemSource::Explicit,
        }
    }

    fn positive(w: &RemWindow) -> RemEvaluationResult {
        RemEvaluationResult::with_window(true, "Detected REM window", w)
    }

    fn negative_with(w: &RemWindow) -> RemEvaluationResult {
        RemEvaluationResult::with_window(false, "REM window passed", w)
    }

    #[test]
    fn test_single_window_lifecycle() {
        let mut logger = TransitionLogger::default();
        let w = rem(90, 110);

        let first = logger.observe(&positive(&w));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].timestamp_us, minutes(90));
        assert_eq!(first[0].note, "REM detected: 1:30 AM \u{2013} 1:50 AM");

        assert!(logger.observe(&positive(&w)).is_empty());
        assert!(logger.observe(&positive(&w)).is_empty());

        let end = logger.observe(&negative_with(&w));
        assert_eq!(end.len(), 1);
        assert_eq!(end[0].timestamp_us, minutes(110));
        assert!(end[0].note.starts_with("REM ended: "));

        assert!(logger.observe(&negative_with(&w)).is_empty());
        assert!(logger.observe(&RemEvaluationResult::negative("No sleep start detected")).is_empty());
    }

    #[test]
    fn test_flapping_same_window_is_idempotent() {
        let mut logger = TransitionLogger::default();
        let w = rem(90, 110);
        let mut total = Vec::new();
        for i in 0..10 {
            let r = if i % 2 == 0 { positive(&w) } else { negative_with(&w) };
            total.extend(logger.observe(&r));
        }
        assert_eq!(total.len(), 2);
    }

    #[test]
    fn test_sub_minute_jitter_same_identity() {
        let mut logger = TransitionLogger::default();
        let a = rem(90, 110);
        let mut b = a;
        b.start_us += 20 * 1_000_000;
        assert_eq!(logger.observe(&positive(&a)).len(), 1);
        assert!(logger.observe(&positive(&b)).is_empty());
    }

    #[test]
    fn test_new_window_closes_previous() {
        let mut logger = TransitionLogger::default();
        assert_eq!(logger.observe(&positive(&rem(90, 110))).len(), 1);
        let entries = logger.observe(&positive(&rem(200, 220)));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp_us, minutes(110));
        assert!(entries[0].note.starts_with("REM ended"));
        assert!(entries[1].note.starts_with("REM detected"));
        assert!(logger.has_active());
    }

    #[test]
    fn test_growing_window_logged_once() {
        let mut logger = TransitionLogger::default();
        let mut entries = Vec::new();
        for end in [95, 100, 105, 110] {
            entries.extend(logger.observe(&positive(&rem(90, end))));
        }
        entries.extend(logger.observe(&negative_with(&rem(90, 110))));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp_us, minutes(90));
        assert_eq!(entries[1].note, "REM ended: 1:30 AM \u{2013} 1:50 AM");
        assert_eq!(entries[1].timestamp_us, minutes(110));
        assert!(logger.observe(&positive(&rem(90, 110))).is_empty());
    }

    #[test]
    fn test_negative_without_active_emits_nothing() {
        let mut logger = TransitionLogger::default();
        assert!(logger.observe(&negative_with(&rem(10, 30))).is_empty());
    }

    #[test]
    fn test_reset_allows_relogging() {
        let mut logger = TransitionLogger::default();
        let w = rem(90, 110);
        logger.observe(&positive(&w));
        logger.reset();
        assert_eq!(logger.observe(&positive(&w)).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_exactly_one_start_and_end(pattern in proptest::collection::vec(any::<bool>(), 1..60)) {
            let mut logger = TransitionLogger::default();
            let w = rem(200, 225);
            let mut entries = Vec::new();
            for &is_rem in &pattern {
                let r = if is_rem { positive(&w) } else { negative_with(&w) };
                entries.extend(logger.observe(&r));
            }
            entries.extend(logger.observe(&negative_with(&w)));

            let detected = entries.iter().filter(|e| e.note.starts_with("REM detected")).count();
            let ended = entries.iter().filter(|e| e.note.starts_with("REM ended")).count();
            let any_rem = pattern.iter().any(|&b| b);
            prop_assert_eq!(detected, usize::from(any_rem));
            prop_assert_eq!(ended, usize::from(any_rem));
        }
    }
}
