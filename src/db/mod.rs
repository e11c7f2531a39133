//! Persistence seams. The core only talks to these traits; `SqliteStore` is the
//! production adapter and `MemoryStore` backs tests and dry runs.

pub mod memory;
pub mod models;
pub mod sqlite;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::retry_backoff;
use crate::error::Result;
use crate::types::{
    AlertQuery, DistributionHistory, EventRecord, EventVolume, MarketFamily, MarketType,
    MovementAlert, NewEvent, OddsHistoryRecord, OddsKey, OddsSnapshot, OutcomeDistribution,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert the team if unknown; returns its id either way.
    async fn upsert_team(&self, sport: &str, name: &str) -> Result<i64>;
    async fn find_league(&self, sport: &str, competition_code: &str) -> Result<Option<i64>>;
    /// Insert or refresh an event keyed by its external id. A `None` league never
    /// clears a league that is already known.
    async fn upsert_event(&self, event: &NewEvent) -> Result<i64>;
    async fn find_event(&self, event_id: i64) -> Result<Option<EventRecord>>;
    /// Maps known external ids to internal ids. Unknown ids are absent from the map.
    async fn event_ids_by_external(&self, external_ids: &[String]) -> Result<HashMap<String, i64>>;
}

#[async_trait]
pub trait MarketTypeStore: Send + Sync {
    async fn find_market_type(&self, code: &str) -> Result<Option<MarketType>>;
    /// Idempotent: returns the existing row when `code` is already present.
    async fn insert_market_type(&self, code: &str, name: &str, family: MarketFamily) -> Result<MarketType>;
    async fn load_market_types(&self) -> Result<Vec<MarketType>>;
}

#[async_trait]
pub trait OddsStore: Send + Sync {
    async fn fetch_snapshots(&self, event_ids: &[i64]) -> Result<Vec<OddsSnapshot>>;
    /// Bulk upsert. `opening` is written on insert only.
    async fn upsert_snapshots(&self, rows: &[OddsSnapshot]) -> Result<u64>;
    /// Append history rows; returns them with ids assigned, in insertion order.
    async fn insert_history(&self, rows: &[OddsHistoryRecord]) -> Result<Vec<OddsHistoryRecord>>;
    /// History for one key observed at or after `since`, oldest first.
    async fn recent_history(&self, key: &OddsKey, since: DateTime<Utc>) -> Result<Vec<OddsHistoryRecord>>;
}

#[async_trait]
pub trait CrowdStore: Send + Sync {
    async fn fetch_distributions(&self, event_ids: &[i64]) -> Result<Vec<OutcomeDistribution>>;
    async fn upsert_distributions(&self, rows: &[OutcomeDistribution]) -> Result<u64>;
    async fn insert_distribution_history(&self, rows: &[DistributionHistory]) -> Result<u64>;
    async fn upsert_volumes(&self, rows: &[EventVolume]) -> Result<u64>;
    async fn insert_volume_history(&self, rows: &[EventVolume]) -> Result<u64>;
    async fn find_volume(&self, event_id: i64) -> Result<Option<EventVolume>>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Returns the new id, or None when an alert of the same type already exists
    /// for the same history record.
    async fn insert_alert(&self, alert: &MovementAlert) -> Result<Option<i64>>;
    async fn active_alerts(&self, query: &AlertQuery) -> Result<Vec<MovementAlert>>;
    /// Flip `active` off for every alert whose `expires_at` is at or before `now`.
    async fn expire_alerts(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Everything the service needs from one backing store.
pub trait Persistence: EventStore + MarketTypeStore + OddsStore + CrowdStore + AlertStore {}

impl<T> Persistence for T where T: EventStore + MarketTypeStore + OddsStore + CrowdStore + AlertStore {}

/// Run a persistence operation, retrying transient failures on a doubling
/// backoff schedule. `attempts` counts the first try.
pub async fn with_retry<T, F, Fut>(what: &str, attempts: u32, base: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut schedule = retry_backoff(base);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                let Some(wait) = schedule.next_backoff() else {
                    return Err(e);
                };
                warn!("[DB] {what} failed (attempt {attempt}/{attempts}): {e}, retrying in {wait:?}");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = with_retry("test op", 3, Duration::from_millis(100), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::Database(sqlx::Error::PoolTimedOut))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let err = with_retry("test op", 3, Duration::from_millis(100), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(AppError::Database(sqlx::Error::PoolTimedOut))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_double_between_attempts() {
        let start = tokio::time::Instant::now();
        let stamps = std::sync::Mutex::new(Vec::new());
        let _ = with_retry("test op", 3, Duration::from_millis(100), || {
            stamps.lock().unwrap().push(start.elapsed());
            async { Err::<(), _>(AppError::Database(sqlx::Error::PoolTimedOut)) }
        })
        .await;
        let stamps = stamps.into_inner().unwrap();
        assert_eq!(
            stamps,
            vec![Duration::ZERO, Duration::from_millis(100), Duration::from_millis(300)]
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let _ = with_retry("test op", 3, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(AppError::NotFound("x".into()))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
