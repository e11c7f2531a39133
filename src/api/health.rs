//! Liveness figures for the /health endpoint.
//! Written by the ingest and collector loops, read by the API.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::collector::{DistributionSyncStats, VolumeSyncStats};
use crate::ingest::BatchSummary;

#[derive(Default)]
pub struct HealthState {
    /// Unix millis of the last completed odds cycle (0 = none yet).
    last_odds_cycle_ms: AtomicI64,
    last_distribution_sync_ms: AtomicI64,
    last_volume_sync_ms: AtomicI64,
    cycles_ok: AtomicU64,
    cycles_failed: AtomicU64,
    events_failed: AtomicU64,
    history_created: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub last_odds_cycle_at: Option<DateTime<Utc>>,
    pub last_distribution_sync_at: Option<DateTime<Utc>>,
    pub last_volume_sync_at: Option<DateTime<Utc>>,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub events_failed: u64,
    pub history_created: u64,
}

fn stamp(cell: &AtomicI64) {
    cell.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
}

fn read(cell: &AtomicI64) -> Option<DateTime<Utc>> {
    match cell.load(Ordering::Relaxed) {
        0 => None,
        ms => Utc.timestamp_millis_opt(ms).single(),
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, summary: &BatchSummary) {
        stamp(&self.last_odds_cycle_ms);
        self.cycles_ok.fetch_add(1, Ordering::Relaxed);
        self.events_failed.fetch_add(summary.failed as u64, Ordering::Relaxed);
        self.history_created.fetch_add(summary.history_created as u64, Ordering::Relaxed);
    }

    pub fn record_cycle_failure(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_distributions(&self, _stats: &DistributionSyncStats) {
        stamp(&self.last_distribution_sync_ms);
    }

    pub fn record_volumes(&self, _stats: &VolumeSyncStats) {
        stamp(&self.last_volume_sync_ms);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            last_odds_cycle_at: read(&self.last_odds_cycle_ms),
            last_distribution_sync_at: read(&self.last_distribution_sync_ms),
            last_volume_sync_at: read(&self.last_volume_sync_ms),
            cycles_ok: self.cycles_ok.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            history_created: self.history_created.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_accumulate() {
        let h = HealthState::new();
        assert!(h.snapshot().last_odds_cycle_at.is_none());
        let s = BatchSummary { succeeded: 9, failed: 1, history_created: 4, ..Default::default() };
        h.record_batch(&s);
        h.record_batch(&s);
        h.record_cycle_failure();
        let snap = h.snapshot();
        assert!(snap.last_odds_cycle_at.is_some());
        assert_eq!(snap.cycles_ok, 2);
        assert_eq!(snap.cycles_failed, 1);
        assert_eq!(snap.events_failed, 2);
        assert_eq!(snap.history_created, 8);
    }
}
