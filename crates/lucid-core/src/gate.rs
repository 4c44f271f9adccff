//! Strictness-parameterized decision fusion.
//!
//! Two truth tables: one for windows backed by an OS-reported REM stage
//! (explicit path) and a stricter one for cycle-predicted windows
//! (inferred path). Stillness is a hard precondition evaluated before
//! either table.

use serde::Serialize;

use crate::config::{DetectionSettings, Strictness};
use crate::domain::{RemSource, StillnessState};
use crate::support::SupportAssessment;

/// Which table applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GatePath {
    Explicit,
    Inferred,
}

impl From<RemSource> for GatePath {
    fn from(source: RemSource) -> Self {
        match source {
            RemSource::Explicit => GatePath::Explicit,
            RemSource::Inferred => GatePath::Inferred,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateInputs {
    pub hr_in_range: bool,
    pub support_available: bool,
    pub support_ok: bool,
}

impl GateInputs {
    pub fn new(hr_in_range: bool, support: &SupportAssessment) -> Self {
        Self {
            hr_in_range,
            support_available: support.support_available(),
            support_ok: support.support_ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionGate;

impl DetectionGate {
    /// True if stillness is required and not currently satisfied.
    pub fn stillness_blocks(settings: &DetectionSettings, stillness: &StillnessState) -> bool {
        settings.require_stillness && !stillness.satisfies(settings.stillness_minutes)
    }

    pub fn decide(path: GatePath, strictness: Strictness, inputs: GateInputs) -> bool {
        match path {
            GatePath::Explicit => Self::explicit(strictness, inputs),
            GatePath::Inferred => Self::inferred(strictness, inputs),
        }
    }

    fn explicit(strictness: Strictness, i: GateInputs) -> bool {
        match (strictness, i.support_available) {
            (Strictness::Lenient, _) => true,
            (Strictness::Balanced, false) => true,
            (Strictness::Balanced, true) => i.hr_in_range || i.support_ok,
            (Strictness::Strict, false) => i.hr_in_range,
            (Strictness::Strict, true) => i.hr_in_range && i.support_ok,
        }
    }

    fn inferred(strictness: Strictness, i: GateInputs) -> bool {
        match (strictness, i.support_available) {
            (_, false) => i.hr_in_range,
            (Strictness::Lenient, true) => i.hr_in_range || i.support_ok,
            (Strictness::Balanced, true) | (Strictness::Strict, true) => {
                i.hr_in_range && i.support_ok
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(path: GatePath, s: Strictness, hr: bool, available: bool, ok: bool) -> bool {
        DetectionGate::decide(
            path,
            s,
            GateInputs {
                hr_in_range: hr,
                support_available: available,
                support_ok: ok,
            },
        )
    }

    /// One test per (path, strictness, support_available, hr_in_range) cell.
    /// `support_ok` implies availability, so it is only varied when support
    /// is available.
    macro_rules! gate_case {
        ($name:ident, $path:ident, $strict:ident, available = false, hr = $hr:expr => $expect:expr) => {
            #[test]
            fn $name() {
                assert_eq!(
                    decide(GatePath::$path, Strictness::$strict, $hr, false, false),
                    $expect
                );
            }
        };
        ($name:ident, $path:ident, $strict:ident, available = true, hr = $hr:expr => ok: $ok:expr, not_ok: $not_ok:expr) => {
            #[test]
            fn $name() {
                assert_eq!(
                    decide(GatePath::$path, Strictness::$strict, $hr, true, true),
                    $ok,
                    "support_ok = true"
                );
                assert_eq!(
                    decide(GatePath::$path, Strictness::$strict, $hr, true, false),
                    $not_ok,
                    "support_ok = false"
                );
            }
        };
    }

    // Explicit path
    gate_case!(explicit_lenient_no_support_hr_in, Explicit, Lenient, available = false, hr = true => true);
    gate_case!(explicit_lenient_no_support_hr_out, Explicit, Lenient, available = false, hr = false => true);
    gate_case!(explicit_lenient_support_hr_in, Explicit, Lenient, available = true, hr = true => ok: true, not_ok: true);
    gate_case!(explicit_lenient_support_hr_out, Explicit, Lenient, available = true, hr = false => ok: true, not_ok: true);

    gate_case!(explicit_balanced_no_support_hr_in, Explicit, Balanced, available = false, hr = true => true);
    gate_case!(explicit_balanced_no_support_hr_out, Explicit, Balanced, available = false, hr = false => true);
    gate_case!(explicit_balanced_support_hr_in, Explicit, Balanced, available = true, hr = true => ok: true, not_ok: true);
    gate_case!(explicit_balanced_support_hr_out, Explicit, Balanced, available = true, hr = false => ok: true, not_ok: false);

    gate_case!(explicit_strict_no_support_hr_in, Explicit, Strict, available = false, hr = true => true);
    gate_case!(explicit_strict_no_support_hr_out, Explicit, Strict, available = false, hr = false => false);
    gate_case!(explicit_strict_support_hr_in, Explicit, Strict, available = true, hr = true => ok: true, not_ok: false);
    gate_case!(explicit_strict_support_hr_out, Explicit, Strict, available = true, hr = false => ok: false, not_ok: false);

    // Inferred path
    gate_case!(inferred_lenient_no_support_hr_in, Inferred, Lenient, available = false, hr = true => true);
    gate_case!(inferred_lenient_no_support_hr_out, Inferred, Lenient, available = false, hr = false => false);
    gate_case!(inferred_lenient_support_hr_in, Inferred, Lenient, available = true, hr = true => ok: true, not_ok: true);
    gate_case!(inferred_lenient_support_hr_out, Inferred, Lenient, available = true, hr = false => ok: true, not_ok: false);

    gate_case!(inferred_balanced_no_support_hr_in, Inferred, Balanced, available = false, hr = true => true);
    gate_case!(inferred_balanced_no_support_hr_out, Inferred, Balanced, available = false, hr = false => false);
    gate_case!(inferred_balanced_support_hr_in, Inferred, Balanced, available = true, hr = true => ok: true, not_ok: false);
    gate_case!(inferred_balanced_support_hr_out, Inferred, Balanced, available = true, hr = false => ok: false, not_ok: false);

    gate_case!(inferred_strict_no_support_hr_in, Inferred, Strict, available = false, hr = true => true);
    gate_case!(inferred_strict_no_support_hr_out, Inferred, Strict, available = false, hr = false => false);
    gate_case!(inferred_strict_support_hr_in, Inferred, Strict, available = true, hr = true => ok: true, not_ok: false);
    gate_case!(inferred_strict_support_hr_out, Inferred, Strict, available = true, hr = false => ok: false, not_ok: false);

    #[test]
    fn test_stillness_precondition() {
        let settings = DetectionSettings::default();
        let moving = StillnessState {
            is_still: false,
            still_minutes: 0.0,
            moving_minutes: 3.0,
        };
        assert!(DetectionGate::stillness_blocks(&settings, &moving));

        let briefly_still = StillnessState {
            is_still: true,
            still_minutes: 4.0,
            moving_minutes: 0.0,
        };
        assert!(DetectionGate::stillness_blocks(&settings, &briefly_still));

        let settled = StillnessState {
            is_still: true,
            still_minutes: 25.0,
            moving_minutes: 0.0,
        };
        assert!(!DetectionGate::stillness_blocks(&settings, &settled));

        let relaxed = DetectionSettings {
            require_stillness: false,
            ..Default::default()
        };
        assert!(!DetectionGate::stillness_blocks(&relaxed, &moving));
    }

    #[test]
    fn test_inferred_never_more_lenient_than_explicit() {
        for s in Strictness::ALL {
            for hr in [false, true] {
                for (available, ok) in [(false, false), (true, false), (true, true)] {
                    let inferred = decide(GatePath::Inferred, s, hr, available, ok);
                    let explicit = decide(GatePath::Explicit, s, hr, available, ok);
                    assert!(!inferred || explicit, "{:?} hr={} avail={} ok={}", s, hr, available, ok);
                }
            }
        }
    }
}
