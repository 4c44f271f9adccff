//! Bounded time-series buffers for each incoming signal.
//!
//! Samples may arrive out of order and may repeat. Every ingest appends,
//! re-sorts by start time, then drops samples that ended before
//! `now - lookback`. Duplicates are kept: interval unioning downstream is
//! insensitive to them.

use crate::config::EngineConfig;
use crate::domain::{HeartRateSample, StageSample, SupportKind, SupportSample, Timed};

/// Time-ordered buffer with a lookback horizon.
#[derive(Debug, Clone)]
pub struct SampleBuffer<T> {
    samples: Vec<T>,
    lookback_us: i64,
}

impl<T: Timed + Clone> SampleBuffer<T> {
    pub fn new(lookback_us: i64) -> Self {
        Self {
            samples: Vec::new(),
            lookback_us,
        }
    }

    pub fn ingest(&mut self, sample: T, now_us: i64) {
        self.samples.push(sample);
        // Stable sort keeps arrival order among equal starts.
        self.samples.sort_by_key(|s| s.start_us());
        self.prune(now_us);
    }

    /// Drop samples that ended before the lookback horizon.
    pub fn prune(&mut self, now_us: i64) {
        let cutoff = now_us - self.lookback_us;
        let before = self.samples.len();
        self.samples.retain(|s| s.end_us() >= cutoff);
        let dropped = before - self.samples.len();
        if dropped > 0 {
            log::trace!("Pruned {} samples older than {}us", dropped, cutoff);
        }
    }

    pub fn samples(&self) -> &[T] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Buffer sizes, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BufferCounts {
    pub stage: usize,
    pub heart_rate: usize,
    pub hrv: usize,
    pub respiratory: usize,
}

/// All per-session sample buffers.
#[derive(Debug, Clone)]
pub struct SignalAggregator {
    pub stage: SampleBuffer<StageSample>,
    pub heart_rate: SampleBuffer<HeartRateSample>,
    pub hrv: SampleBuffer<SupportSample>,
    pub respiratory: SampleBuffer<SupportSample>,
}

impl SignalAggregator {
    pub fn new(config: &EngineConfig) -> Self {
        let support_lookback = config.support.recency_us();
        Self {
            stage: SampleBuffer::new(config.windows.stage_lookback_us()),
            heart_rate: SampleBuffer::new(config.heart_rate.lookback_us()),
            hrv: SampleBuffer::new(support_lookback),
            respiratory: SampleBuffer::new(support_lookback),
        }
    }

    pub fn ingest_stage(&mut self, sample: StageSample, now_us: i64) {
        self.stage.ingest(sample, now_us);
    }

    pub fn ingest_heart_rate(&mut self, sample: HeartRateSample, now_us: i64) {
        self.heart_rate.ingest(sample, now_us);
    }

    /// Routes a support sample to the HRV or respiratory buffer.
    pub fn ingest_support(&mut self, sample: SupportSample, now_us: i64) {
        match sample.kind {
            SupportKind::HrvMs => self.hrv.ingest(sample, now_us),
            SupportKind::RespBpm => self.respiratory.ingest(sample, now_us),
        }
    }

    /// Re-apply every horizon without ingesting (used on ticks).
    pub fn prune_all(&mut self, now_us: i64) {
        self.stage.prune(now_us);
        self.heart_rate.prune(now_us);
        self.hrv.prune(now_us);
        self.respiratory.prune(now_us);
    }

    pub fn clear(&mut self) {
        self.stage.clear();
        self.heart_rate.clear();
        self.hrv.clear();
        self.respiratory.clear();
    }

    pub fn counts(&self) -> BufferCounts {
        BufferCounts {
            stage: self.stage.len(),
            heart_rate: self.heart_rate.len(),
            hrv: self.hrv.len(),
            respiratory: self.respiratory.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{minutes, SleepStage};

    #[test]
    fn test_out_of_order_is_sorted() {
        let mut buf = SampleBuffer::new(minutes(60));
        let now = minutes(100);
        buf.ingest(HeartRateSample::at(minutes(90), 60.0), now);
        buf.ingest(HeartRateSample::at(minutes(70), 55.0), now);
        buf.ingest(HeartRateSample::at(minutes(80), 58.0), now);
        let starts: Vec<i64> = buf.samples().iter().map(|s| s.start_us).collect();
        assert_eq!(starts, vec![minutes(70), minutes(80), minutes(90)]);
    }

    #[test]
    fn test_prune_by_lookback() {
        let mut buf = SampleBuffer::new(minutes(30));
        buf.ingest(HeartRateSample::at(minutes(10), 50.0), minutes(10));
        buf.ingest(HeartRateSample::at(minutes(50), 52.0), minutes(50));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.samples()[0].start_us, minutes(50));
    }

    #[test]
    fn test_long_sample_survives_while_it_overlaps_horizon() {
        let mut buf = SampleBuffer::new(minutes(30));
        let long = StageSample::new(0, minutes(100), SleepStage::AsleepCore);
        buf.ingest(long, minutes(120));
        assert_eq!(buf.len(), 1);
        buf.prune(minutes(131));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_duplicates_tolerated() {
        let mut buf = SampleBuffer::new(minutes(60));
        let s = StageSample::new(minutes(1), minutes(5), SleepStage::AsleepRem);
        for _ in 0..3 {
            buf.ingest(s, minutes(10));
        }
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_support_routing() {
        let mut agg = SignalAggregator::new(&EngineConfig::default());
        agg.ingest_support(SupportSample::hrv(minutes(1), 45.0), minutes(2));
        agg.ingest_support(SupportSample::resp(minutes(1), 14.0), minutes(2));
        agg.ingest_support(SupportSample::resp(minutes(2), 13.0), minutes(2));
        let counts = agg.counts();
        assert_eq!(counts.hrv, 1);
        assert_eq!(counts.respiratory, 2);
        agg.clear();
        assert_eq!(agg.counts(), BufferCounts::default());
    }
}
