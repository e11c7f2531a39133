//! Latency histogram for upstream fetches.
//! Every attempt made by the rate-limited fetcher is recorded here.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Values are microseconds.
pub struct LatencyStats {
    inner: Mutex<Option<hdrhistogram::Histogram<u64>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

impl LatencyStats {
    /// 1us to 100s at 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 100_000_000, 3).ok();
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record_us(&self, us: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(h) = guard.as_mut() {
                h.saturating_record(us.max(1));
            }
        }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        self.record_us(us);
    }

    /// (p50_us, p95_us, p99_us). None without samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let s = self.quantiles(&[0.5, 0.95, 0.99]);
        (s[0], s[1], s[2])
    }

    pub fn summary(&self) -> LatencySummary {
        let q = self.quantiles(&[0.5, 0.95, 0.99, 1.0]);
        let ms = |v: Option<u64>| v.map(|us| us as f64 / 1000.0);
        LatencySummary {
            samples: self.len(),
            p50_ms: ms(q[0]),
            p95_ms: ms(q[1]),
            p99_ms: ms(q[2]),
            max_ms: ms(q[3]),
        }
    }

    pub fn len(&self) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|h| h.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn quantiles(&self, qs: &[f64]) -> Vec<Option<u64>> {
        let Ok(guard) = self.inner.lock() else {
            return vec![None; qs.len()];
        };
        match guard.as_ref() {
            Some(h) if h.len() > 0 => qs.iter().map(|q| Some(h.value_at_quantile(*q))).collect(),
            _ => vec![None; qs.len()],
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let s = LatencyStats::new();
        assert_eq!(s.percentiles(), (None, None, None));
        assert_eq!(s.summary().samples, 0);
        assert!(s.is_empty());
    }

    #[test]
    fn percentiles_track_recorded_values() {
        let s = LatencyStats::new();
        for ms in 1..=100u64 {
            s.record(Duration::from_millis(ms));
        }
        let (p50, _, p99) = s.percentiles();
        let p50 = p50.unwrap();
        assert!((49_000..=51_000).contains(&p50), "p50 was {p50}");
        assert!(p99.unwrap() >= 98_000);
        let summary = s.summary();
        assert_eq!(summary.samples, 100);
        assert!(summary.max_ms.unwrap() >= 99.9);
    }
}
