use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DISTRIBUTION_EPSILON, PERSIST_ATTEMPTS, PERSIST_BACKOFF_MS, WRITE_CHUNK_SIZE};
use crate::db::{with_retry, CrowdStore, EventStore, OddsStore};
use crate::error::Result;
use crate::feed::FeedClient;
use crate::registry::MarketTypeRegistry;
use crate::tracker::outcome_label;
use crate::types::{CrowdVolume, DistributionHistory, EventVolume, OddsKey, OutcomeDistribution};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DistributionSyncStats {
    pub fetched: usize,
    pub unknown_events: usize,
    pub unresolved_markets: usize,
    pub upserted: usize,
    pub history_appended: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VolumeSyncStats {
    pub fetched: usize,
    pub unknown_events: usize,
    pub upserted: usize,
    pub history_appended: usize,
}

/// Rank by share descending, ties by external id ascending. Returned ranks line
/// up with the input slice and start at 1.
pub fn rank_volumes(volumes: &[CrowdVolume]) -> Vec<u32> {
    let mut order: Vec<usize> = (0..volumes.len()).collect();
    order.sort_by(|&a, &b| {
        volumes[b]
            .volume_pct
            .cmp(&volumes[a].volume_pct)
            .then_with(|| volumes[a].external_id.cmp(&volumes[b].external_id))
    });
    let mut ranks = vec![0u32; volumes.len()];
    for (pos, idx) in order.into_iter().enumerate() {
        ranks[idx] = pos as u32 + 1;
    }
    ranks
}

/// Implied probability in percent for decimal odds.
fn implied_probability(odds: Decimal) -> Option<Decimal> {
    if odds <= Decimal::ZERO {
        return None;
    }
    Some((Decimal::ONE_HUNDRED / odds).round_dp(4))
}

/// Pulls public betting distributions and per-event volume shares and keeps
/// the current rows plus their history.
pub struct CrowdCollector {
    feed: Arc<dyn FeedClient>,
    events: Arc<dyn EventStore>,
    odds: Arc<dyn OddsStore>,
    crowd: Arc<dyn CrowdStore>,
    registry: Arc<MarketTypeRegistry>,
}

impl CrowdCollector {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        events: Arc<dyn EventStore>,
        odds: Arc<dyn OddsStore>,
        crowd: Arc<dyn CrowdStore>,
        registry: Arc<MarketTypeRegistry>,
    ) -> Self {
        Self { feed, events, odds, crowd, registry }
    }

    pub async fn sync_distributions(&self, sport: &str) -> Result<DistributionSyncStats> {
        let rows = self.feed.get_distributions(sport).await?;
        let mut stats = DistributionSyncStats { fetched: rows.len(), ..Default::default() };
        if rows.is_empty() {
            return Ok(stats);
        }

        let external: Vec<String> = rows
            .iter()
            .map(|r| r.external_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let ids = self.events.event_ids_by_external(&external).await?;

        let now = Utc::now();
        // Last row wins when upstream repeats a key.
        let mut incoming: BTreeMap<OddsKey, Decimal> = BTreeMap::new();
        for row in rows {
            let Some(&event_id) = ids.get(&row.external_id) else {
                stats.unknown_events += 1;
                continue;
            };
            let market = match self.registry.resolve(&row.market_code, &row.market_name).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(code = %row.market_code, "[COLLECTOR] market type unresolved: {e}");
                    stats.unresolved_markets += 1;
                    continue;
                }
            };
            let key = OddsKey {
                event_id,
                market_type_id: market.id,
                outcome: outcome_label(market.family, &row.outcome, row.special_value.as_deref()),
            };
            incoming.insert(key, row.bet_pct);
        }
        if incoming.is_empty() {
            debug!(sport, unknown = stats.unknown_events, "[COLLECTOR] no known events in distribution payload");
            return Ok(stats);
        }

        let event_ids: Vec<i64> = incoming.keys().map(|k| k.event_id).collect::<HashSet<_>>().into_iter().collect();
        let implied: HashMap<OddsKey, Decimal> = self
            .odds
            .fetch_snapshots(&event_ids)
            .await?
            .into_iter()
            .filter_map(|s| Some((s.key(), implied_probability(s.current)?)))
            .collect();
        let previous: HashMap<OddsKey, Decimal> = self
            .crowd
            .fetch_distributions(&event_ids)
            .await?
            .into_iter()
            .map(|d| (d.key(), d.bet_pct))
            .collect();

        let mut current = Vec::with_capacity(incoming.len());
        let mut history = Vec::new();
        for (key, bet_pct) in incoming {
            let prev = previous.get(&key).copied();
            if prev.map_or(true, |p| (bet_pct - p).abs() > DISTRIBUTION_EPSILON) {
                history.push(DistributionHistory {
                    event_id: key.event_id,
                    market_type_id: key.market_type_id,
                    outcome: key.outcome.clone(),
                    previous_pct: prev,
                    bet_pct,
                    recorded_at: now,
                });
            }
            current.push(OutcomeDistribution {
                implied_probability: implied.get(&key).copied(),
                event_id: key.event_id,
                market_type_id: key.market_type_id,
                outcome: key.outcome,
                bet_pct,
                updated_at: now,
            });
        }

        let backoff = Duration::from_millis(PERSIST_BACKOFF_MS);
        for chunk in current.chunks(WRITE_CHUNK_SIZE) {
            stats.upserted += with_retry("distribution upsert", PERSIST_ATTEMPTS, backoff, || {
                self.crowd.upsert_distributions(chunk)
            })
            .await? as usize;
        }
        for chunk in history.chunks(WRITE_CHUNK_SIZE) {
            stats.history_appended += with_retry("distribution history", PERSIST_ATTEMPTS, backoff, || {
                self.crowd.insert_distribution_history(chunk)
            })
            .await? as usize;
        }

        info!(
            sport,
            fetched = stats.fetched,
            upserted = stats.upserted,
            history = stats.history_appended,
            unknown = stats.unknown_events,
            "[COLLECTOR] distributions for {sport}: {} rows, {} changed",
            stats.upserted, stats.history_appended,
        );
        Ok(stats)
    }

    pub async fn sync_volumes(&self, sport: &str) -> Result<VolumeSyncStats> {
        let volumes = self.feed.get_volumes(sport).await?;
        let mut stats = VolumeSyncStats { fetched: volumes.len(), ..Default::default() };
        if volumes.is_empty() {
            return Ok(stats);
        }

        // Ranks span every returned event, known or not.
        let ranks = rank_volumes(&volumes);
        let external: Vec<String> = volumes.iter().map(|v| v.external_id.clone()).collect();
        let ids = self.events.event_ids_by_external(&external).await?;

        let now = Utc::now();
        let mut rows = Vec::with_capacity(volumes.len());
        for (v, rank) in volumes.iter().zip(ranks) {
            match ids.get(&v.external_id) {
                Some(&event_id) => rows.push(EventVolume {
                    event_id,
                    volume_pct: v.volume_pct,
                    rank,
                    updated_at: now,
                }),
                None => stats.unknown_events += 1,
            }
        }
        if rows.is_empty() {
            debug!(sport, unknown = stats.unknown_events, "[COLLECTOR] no known events in volume payload");
            return Ok(stats);
        }

        let backoff = Duration::from_millis(PERSIST_BACKOFF_MS);
        for chunk in rows.chunks(WRITE_CHUNK_SIZE) {
            stats.upserted +=
                with_retry("volume upsert", PERSIST_ATTEMPTS, backoff, || self.crowd.upsert_volumes(chunk)).await?
                    as usize;
            stats.history_appended +=
                with_retry("volume history", PERSIST_ATTEMPTS, backoff, || self.crowd.insert_volume_history(chunk))
                    .await? as usize;
        }

        info!(
            sport,
            fetched = stats.fetched,
            upserted = stats.upserted,
            unknown = stats.unknown_events,
            "[COLLECTOR] volumes for {sport}: {} events ranked",
            stats.upserted,
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::db::MemoryStore;
    use crate::types::{CrowdDistribution, MarketFamily, NewEvent, OddsSnapshot, SportEvent};

    #[derive(Default)]
    struct CrowdFeed {
        distributions: Mutex<Vec<CrowdDistribution>>,
        volumes: Vec<CrowdVolume>,
    }

    #[async_trait]
    impl FeedClient for CrowdFeed {
        async fn get_events(&self, _sport_id: &str) -> Result<Vec<SportEvent>> {
            Ok(Vec::new())
        }

        async fn get_single_event(&self, _sport_id: &str, _external_id: &str) -> Result<Option<SportEvent>> {
            Ok(None)
        }

        async fn get_distributions(&self, _sport: &str) -> Result<Vec<CrowdDistribution>> {
            Ok(self.distributions.lock().unwrap().clone())
        }

        async fn get_volumes(&self, _sport: &str) -> Result<Vec<CrowdVolume>> {
            Ok(self.volumes.clone())
        }
    }

    fn share(external_id: &str, outcome: &str, pct: Decimal) -> CrowdDistribution {
        CrowdDistribution {
            external_id: external_id.into(),
            market_code: "1x2".into(),
            market_name: "Match Result".into(),
            special_value: None,
            outcome: outcome.into(),
            bet_pct: pct,
        }
    }

    fn volume(external_id: &str, pct: Decimal) -> CrowdVolume {
        CrowdVolume { external_id: external_id.into(), volume_pct: pct }
    }

    async fn seed_event(store: &MemoryStore, external_id: &str) -> i64 {
        store
            .upsert_event(&NewEvent {
                external_id: external_id.into(),
                sport: "football".into(),
                home_team_id: 1,
                away_team_id: 2,
                league_id: None,
                start_time: None,
            })
            .await
            .unwrap()
    }

    fn collector(store: &Arc<MemoryStore>, feed: Arc<CrowdFeed>) -> (CrowdCollector, Arc<MarketTypeRegistry>) {
        let registry = Arc::new(MarketTypeRegistry::new(store.clone()));
        let c = CrowdCollector::new(feed, store.clone(), store.clone(), store.clone(), Arc::clone(&registry));
        (c, registry)
    }

    /// Records the largest batch handed to each write.
    #[derive(Default)]
    struct BatchLog {
        inner: Arc<MemoryStore>,
        calls: AtomicUsize,
        largest: AtomicUsize,
    }

    impl BatchLog {
        fn note(&self, len: usize) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.largest.fetch_max(len, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CrowdStore for BatchLog {
        async fn fetch_distributions(&self, event_ids: &[i64]) -> Result<Vec<OutcomeDistribution>> {
            self.inner.fetch_distributions(event_ids).await
        }

        async fn upsert_distributions(&self, rows: &[OutcomeDistribution]) -> Result<u64> {
            self.note(rows.len());
            self.inner.upsert_distributions(rows).await
        }

        async fn insert_distribution_history(&self, rows: &[DistributionHistory]) -> Result<u64> {
            self.note(rows.len());
            self.inner.insert_distribution_history(rows).await
        }

        async fn upsert_volumes(&self, rows: &[EventVolume]) -> Result<u64> {
            self.note(rows.len());
            self.inner.upsert_volumes(rows).await
        }

        async fn insert_volume_history(&self, rows: &[EventVolume]) -> Result<u64> {
            self.note(rows.len());
            self.inner.insert_volume_history(rows).await
        }

        async fn find_volume(&self, event_id: i64) -> Result<Option<EventVolume>> {
            self.inner.find_volume(event_id).await
        }
    }

    #[test]
    fn ranks_follow_share_descending() {
        let v = vec![volume("a", dec!(10)), volume("b", dec!(40)), volume("c", dec!(25))];
        assert_eq!(rank_volumes(&v), vec![3, 1, 2]);
    }

    #[test]
    fn rank_ties_break_on_external_id() {
        let v = vec![volume("z", dec!(30)), volume("m", dec!(30)), volume("a", dec!(5))];
        assert_eq!(rank_volumes(&v), vec![2, 1, 3]);
    }

    #[test]
    fn implied_probability_from_odds() {
        assert_eq!(implied_probability(dec!(2.0)), Some(dec!(50)));
        assert_eq!(implied_probability(dec!(0)), None);
    }

    #[tokio::test]
    async fn distributions_carry_implied_probability_and_history() {
        let store = MemoryStore::new();
        let event_id = seed_event(&store, "e1").await;
        let feed = Arc::new(CrowdFeed::default());
        *feed.distributions.lock().unwrap() =
            vec![share("e1", "Home", dec!(62.5)), share("e1", "Away", dec!(37.5)), share("ghost", "Home", dec!(50))];
        let (c, registry) = collector(&store, Arc::clone(&feed));

        let market = registry.resolve("1x2", "Match Result").await.unwrap();
        assert_eq!(market.family, MarketFamily::MatchResult);
        let home = OddsKey { event_id, market_type_id: market.id, outcome: "Home".into() };
        store
            .upsert_snapshots(&[OddsSnapshot::first_sighting(home.clone(), dec!(1.6), Utc::now())])
            .await
            .unwrap();

        let stats = c.sync_distributions("football").await.unwrap();
        assert_eq!(stats.fetched, 3);
        assert_eq!(stats.unknown_events, 1);
        assert_eq!(stats.upserted, 2);
        assert_eq!(stats.history_appended, 2);

        let rows = store.fetch_distributions(&[event_id]).await.unwrap();
        let home_row = rows.iter().find(|d| d.outcome == "Home").unwrap();
        assert_eq!(home_row.implied_probability, Some(dec!(62.5)));
        let away_row = rows.iter().find(|d| d.outcome == "Away").unwrap();
        assert_eq!(away_row.implied_probability, None);
    }

    #[tokio::test]
    async fn distribution_history_only_on_real_change() {
        let store = MemoryStore::new();
        let event_id = seed_event(&store, "e1").await;
        let feed = Arc::new(CrowdFeed::default());
        *feed.distributions.lock().unwrap() = vec![share("e1", "Home", dec!(60))];
        let (c, registry) = collector(&store, Arc::clone(&feed));

        c.sync_distributions("football").await.unwrap();
        *feed.distributions.lock().unwrap() = vec![share("e1", "Home", dec!(60.005))];
        let steady = c.sync_distributions("football").await.unwrap();
        assert_eq!(steady.history_appended, 0);

        *feed.distributions.lock().unwrap() = vec![share("e1", "Home", dec!(64))];
        let moved = c.sync_distributions("football").await.unwrap();
        assert_eq!(moved.history_appended, 1);

        let market = registry.resolve("1x2", "Match Result").await.unwrap();
        let key = OddsKey { event_id, market_type_id: market.id, outcome: "Home".into() };
        let history = store.distribution_history_for(&key);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].previous_pct, Some(dec!(60.005)));
        assert_eq!(history[1].bet_pct, dec!(64));
    }

    #[tokio::test]
    async fn volumes_rank_across_all_returned_events() {
        let store = MemoryStore::new();
        let a = seed_event(&store, "a").await;
        let c_id = seed_event(&store, "c").await;
        let feed = Arc::new(CrowdFeed {
            volumes: vec![volume("a", dec!(10)), volume("b", dec!(40)), volume("c", dec!(25))],
            ..Default::default()
        });
        let (c, _) = collector(&store, feed);

        let stats = c.sync_volumes("football").await.unwrap();
        assert_eq!(stats.unknown_events, 1);
        assert_eq!(stats.upserted, 2);
        assert_eq!(store.find_volume(a).await.unwrap().unwrap().rank, 3);
        assert_eq!(store.find_volume(c_id).await.unwrap().unwrap().rank, 2);

        c.sync_volumes("football").await.unwrap();
        assert_eq!(store.volume_history_for(a).len(), 2);
    }

    #[tokio::test]
    async fn large_payloads_are_written_in_chunks() {
        let store = MemoryStore::new();
        seed_event(&store, "e1").await;
        let outcomes = WRITE_CHUNK_SIZE * 2 + 1;
        let feed = Arc::new(CrowdFeed::default());
        *feed.distributions.lock().unwrap() =
            (0..outcomes).map(|i| share("e1", &format!("Outcome {i}"), dec!(1))).collect();
        let log = Arc::new(BatchLog { inner: store.clone(), ..Default::default() });
        let registry = Arc::new(MarketTypeRegistry::new(store.clone()));
        let c = CrowdCollector::new(feed, store.clone(), store.clone(), log.clone(), registry);

        let stats = c.sync_distributions("football").await.unwrap();
        assert_eq!(stats.upserted, outcomes);
        assert_eq!(stats.history_appended, outcomes);
        // three upsert chunks and three history chunks
        assert_eq!(log.calls.load(Ordering::SeqCst), 6);
        assert_eq!(log.largest.load(Ordering::SeqCst), WRITE_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn large_volume_payloads_are_written_in_chunks() {
        let store = MemoryStore::new();
        let count = WRITE_CHUNK_SIZE + 20;
        let mut volumes = Vec::with_capacity(count);
        for i in 0..count {
            let ext = format!("v{i:04}");
            seed_event(&store, &ext).await;
            volumes.push(volume(&ext, Decimal::from(i as u64)));
        }
        let feed = Arc::new(CrowdFeed { volumes, ..Default::default() });
        let log = Arc::new(BatchLog { inner: store.clone(), ..Default::default() });
        let registry = Arc::new(MarketTypeRegistry::new(store.clone()));
        let c = CrowdCollector::new(feed, store.clone(), store.clone(), log.clone(), registry);

        let stats = c.sync_volumes("football").await.unwrap();
        assert_eq!(stats.upserted, count);
        assert_eq!(stats.history_appended, count);
        assert_eq!(log.calls.load(Ordering::SeqCst), 4);
        assert_eq!(log.largest.load(Ordering::SeqCst), WRITE_CHUNK_SIZE);
    }
}
