//! Recency and plausibility of the auxiliary signals (HRV, respiration).

use serde::Serialize;

use crate::config::{DetectionSettings, SupportConfig};
use crate::domain::SupportSample;

/// Availability and plausibility of each support signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupportAssessment {
    pub hrv_available: bool,
    pub hrv_support: bool,
    pub resp_available: bool,
    pub resp_support: bool,
}

impl SupportAssessment {
    pub fn support_available(&self) -> bool {
        self.hrv_available || self.resp_available
    }

    pub fn support_ok(&self) -> bool {
        self.hrv_support || self.resp_support
    }
}

#[derive(Debug, Clone)]
pub struct SupportSignalEvaluator {
    config: SupportConfig,
}

impl SupportSignalEvaluator {
    pub fn new(config: SupportConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(
        &self,
        hrv: &[SupportSample],
        resp: &[SupportSample],
        settings: &DetectionSettings,
        now_us: i64,
    ) -> SupportAssessment {
        let (hrv_available, hrv_support) = self.assess(
            settings.use_hrv,
            hrv,
            now_us,
            self.config.hrv_min_ms,
            self.config.hrv_max_ms,
        );
        let (resp_available, resp_support) = self.assess(
            settings.use_respiratory_rate,
            resp,
            now_us,
            self.config.resp_min_bpm,
            self.config.resp_max_bpm,
        );
        SupportAssessment {
            hrv_available,
            hrv_support,
            resp_available,
            resp_support,
        }
    }

    /// `(available, supportive)` for one signal.
    fn assess(
        &self,
        enabled: bool,
        samples: &[SupportSample],
        now_us: i64,
        lo: f32,
        hi: f32,
    ) -> (bool, bool) {
        if !enabled {
            return (false, false);
        }
        let horizon = now_us - self.config.recency_us();
        let latest = samples
            .iter()
            .filter(|s| s.start_us <= now_us)
            .max_by_key(|s| s.end_us);
        match latest {
            Some(s) if s.end_us >= horizon => {
                let plausible = s.value.is_finite() && s.value >= lo && s.value <= hi;
                (true, plausible)
            }
            _ => (false, false),
        }
    }
}
