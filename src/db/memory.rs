use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};

use super::{AlertStore, CrowdStore, EventStore, MarketTypeStore, OddsStore};
use crate::error::{AppError, Result};
use crate::types::{
    AlertQuery, AlertType, DistributionHistory, EventRecord, EventVolume, MarketFamily, MarketType,
    MovementAlert, NewEvent, OddsHistoryRecord, OddsKey, OddsSnapshot, OutcomeDistribution,
};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Concurrent in-memory store with the same contract as the SQLite adapter.
/// Ids come from one shared counter, so they are unique across tables.
#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    /// (sport, name) → team id
    teams: DashMap<(String, String), i64>,
    team_names: DashMap<i64, String>,
    /// (sport, competition code) → league id
    leagues: DashMap<(String, String), i64>,
    events: DashMap<i64, EventRecord>,
    /// external id → event id
    event_ids: DashMap<String, i64>,
    /// code → market type
    market_types: DashMap<String, MarketType>,
    snapshots: DashMap<OddsKey, OddsSnapshot>,
    /// Append-only, per key, in insertion order.
    history: DashMap<OddsKey, Vec<OddsHistoryRecord>>,
    distributions: DashMap<OddsKey, OutcomeDistribution>,
    distribution_history: DashMap<OddsKey, Vec<DistributionHistory>>,
    volumes: DashMap<i64, EventVolume>,
    volume_history: DashMap<i64, Vec<EventVolume>>,
    alerts: DashMap<i64, MovementAlert>,
    /// (history id, alert type) pairs already alerted on
    alert_keys: DashSet<(i64, AlertType)>,
    /// When set, snapshot and history writes fail with a transient error.
    fail_odds_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert_league(&self, sport: &str, competition_code: &str) -> i64 {
        *self
            .leagues
            .entry((sport.to_string(), competition_code.to_string()))
            .or_insert_with(|| self.next_id())
    }

    /// Simulate a storage outage on the odds tables.
    pub fn set_fail_odds_writes(&self, fail: bool) {
        self.fail_odds_writes.store(fail, Ordering::Relaxed);
    }

    pub fn snapshot(&self, key: &OddsKey) -> Option<OddsSnapshot> {
        self.snapshots.get(key).map(|s| s.clone())
    }

    pub fn history_for(&self, key: &OddsKey) -> Vec<OddsHistoryRecord> {
        self.history.get(key).map(|h| h.clone()).unwrap_or_default()
    }

    pub fn history_len(&self) -> usize {
        self.history.iter().map(|e| e.value().len()).sum()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn distribution_history_for(&self, key: &OddsKey) -> Vec<DistributionHistory> {
        self.distribution_history.get(key).map(|h| h.clone()).unwrap_or_default()
    }

    pub fn volume_history_for(&self, event_id: i64) -> Vec<EventVolume> {
        self.volume_history.get(&event_id).map(|h| h.clone()).unwrap_or_default()
    }

    pub fn all_alerts(&self) -> Vec<MovementAlert> {
        let mut out: Vec<MovementAlert> = self.alerts.iter().map(|a| a.value().clone()).collect();
        out.sort_by_key(|a| a.id);
        out
    }

    fn check_odds_writes(&self) -> Result<()> {
        if self.fail_odds_writes.load(Ordering::Relaxed) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_team(&self, sport: &str, name: &str) -> Result<i64> {
        let id = *self
            .teams
            .entry((sport.to_string(), name.to_string()))
            .or_insert_with(|| self.next_id());
        self.team_names.insert(id, name.to_string());
        Ok(id)
    }

    async fn find_league(&self, sport: &str, competition_code: &str) -> Result<Option<i64>> {
        Ok(self
            .leagues
            .get(&(sport.to_string(), competition_code.to_string()))
            .map(|id| *id))
    }

    async fn upsert_event(&self, event: &NewEvent) -> Result<i64> {
        let id = *self
            .event_ids
            .entry(event.external_id.clone())
            .or_insert_with(|| self.next_id());
        let name_of = |team_id: i64| {
            self.team_names
                .get(&team_id)
                .map(|n| n.clone())
                .unwrap_or_default()
        };
        let home_team = name_of(event.home_team_id);
        let away_team = name_of(event.away_team_id);
        let mut entry = self.events.entry(id).or_insert_with(|| EventRecord {
            id,
            external_id: event.external_id.clone(),
            sport: event.sport.clone(),
            home_team: home_team.clone(),
            away_team: away_team.clone(),
            league_id: None,
            start_time: None,
        });
        entry.home_team = home_team;
        entry.away_team = away_team;
        if event.league_id.is_some() {
            entry.league_id = event.league_id;
        }
        if event.start_time.is_some() {
            entry.start_time = event.start_time;
        }
        Ok(id)
    }

    async fn find_event(&self, event_id: i64) -> Result<Option<EventRecord>> {
        Ok(self.events.get(&event_id).map(|e| e.clone()))
    }

    async fn event_ids_by_external(&self, external_ids: &[String]) -> Result<HashMap<String, i64>> {
        Ok(external_ids
            .iter()
            .filter_map(|ext| self.event_ids.get(ext).map(|id| (ext.clone(), *id)))
            .collect())
    }
}

#[async_trait]
impl MarketTypeStore for MemoryStore {
    async fn find_market_type(&self, code: &str) -> Result<Option<MarketType>> {
        Ok(self.market_types.get(code).map(|m| m.clone()))
    }

    async fn insert_market_type(&self, code: &str, name: &str, family: MarketFamily) -> Result<MarketType> {
        let entry = self.market_types.entry(code.to_string()).or_insert_with(|| MarketType {
            id: self.next_id(),
            code: code.to_string(),
            name: name.to_string(),
            family,
        });
        Ok(entry.clone())
    }

    async fn load_market_types(&self) -> Result<Vec<MarketType>> {
        let mut out: Vec<MarketType> = self.market_types.iter().map(|m| m.value().clone()).collect();
        out.sort_by_key(|m| m.id);
        Ok(out)
    }
}

#[async_trait]
impl OddsStore for MemoryStore {
    async fn fetch_snapshots(&self, event_ids: &[i64]) -> Result<Vec<OddsSnapshot>> {
        let mut out: Vec<OddsSnapshot> = self
            .snapshots
            .iter()
            .filter(|s| event_ids.contains(&s.event_id))
            .map(|s| s.value().clone())
            .collect();
        out.sort_by_key(|s| s.key());
        Ok(out)
    }

    async fn upsert_snapshots(&self, rows: &[OddsSnapshot]) -> Result<u64> {
        self.check_odds_writes()?;
        for row in rows {
            let key = row.key();
            match self.snapshots.get_mut(&key) {
                Some(mut existing) => {
                    let opening = existing.opening;
                    *existing = row.clone();
                    existing.opening = opening;
                }
                None => {
                    self.snapshots.insert(key, row.clone());
                }
            }
        }
        Ok(rows.len() as u64)
    }

    async fn insert_history(&self, rows: &[OddsHistoryRecord]) -> Result<Vec<OddsHistoryRecord>> {
        self.check_odds_writes()?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut saved = row.clone();
            saved.id = Some(self.next_id());
            self.history.entry(saved.key()).or_default().push(saved.clone());
            out.push(saved);
        }
        Ok(out)
    }

    async fn recent_history(&self, key: &OddsKey, since: DateTime<Utc>) -> Result<Vec<OddsHistoryRecord>> {
        Ok(self
            .history
            .get(key)
            .map(|rows| rows.iter().filter(|h| h.observed_at >= since).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl CrowdStore for MemoryStore {
    async fn fetch_distributions(&self, event_ids: &[i64]) -> Result<Vec<OutcomeDistribution>> {
        Ok(self
            .distributions
            .iter()
            .filter(|d| event_ids.contains(&d.event_id))
            .map(|d| d.value().clone())
            .collect())
    }

    async fn upsert_distributions(&self, rows: &[OutcomeDistribution]) -> Result<u64> {
        for row in rows {
            self.distributions.insert(row.key(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_distribution_history(&self, rows: &[DistributionHistory]) -> Result<u64> {
        for row in rows {
            let key = OddsKey {
                event_id: row.event_id,
                market_type_id: row.market_type_id,
                outcome: row.outcome.clone(),
            };
            self.distribution_history.entry(key).or_default().push(row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_volumes(&self, rows: &[EventVolume]) -> Result<u64> {
        for row in rows {
            self.volumes.insert(row.event_id, row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_volume_history(&self, rows: &[EventVolume]) -> Result<u64> {
        for row in rows {
            self.volume_history.entry(row.event_id).or_default().push(row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn find_volume(&self, event_id: i64) -> Result<Option<EventVolume>> {
        Ok(self.volumes.get(&event_id).map(|v| v.clone()))
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: &MovementAlert) -> Result<Option<i64>> {
        if !self.alert_keys.insert((alert.history_id, alert.alert_type)) {
            return Ok(None);
        }
        let id = self.next_id();
        let mut saved = alert.clone();
        saved.id = Some(id);
        self.alerts.insert(id, saved);
        Ok(Some(id))
    }

    async fn active_alerts(&self, query: &AlertQuery) -> Result<Vec<MovementAlert>> {
        let mut out: Vec<MovementAlert> = self
            .alerts
            .iter()
            .filter(|a| a.active && a.confidence >= query.min_confidence)
            .filter(|a| query.alert_type.map_or(true, |t| a.alert_type == t))
            .map(|a| a.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out.truncate(usize::try_from(query.limit).unwrap_or(0));
        Ok(out)
    }

    async fn expire_alerts(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut expired = 0;
        for mut alert in self.alerts.iter_mut() {
            if alert.active && alert.expires_at <= now {
                alert.active = false;
                expired += 1;
            }
        }
        Ok(expired)
    }
}
