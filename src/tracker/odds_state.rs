use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ClassifierPolicy, TrackerPolicy, PERSIST_ATTEMPTS, PERSIST_BACKOFF_MS};
use crate::db::{with_retry, CrowdStore, OddsStore};
use crate::detector::signals::volume_direction;
use crate::error::Result;
use crate::registry::MarketTypeRegistry;
use crate::types::{
    MarketFamily, MarketOdds, OddsHistoryRecord, OddsKey, OddsSnapshot, SignificanceLevel,
    VolumeDirection,
};

/// What the tracker needs to know about the event a batch belongs to.
#[derive(Debug, Clone, Copy)]
pub struct EventContext {
    pub event_id: i64,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Snapshot rows written (first sightings plus moved prices).
    pub written: usize,
    pub history_created: usize,
    pub failed_chunks: usize,
    /// Non-positive prices and unresolvable markets.
    pub ignored: usize,
}

impl std::ops::AddAssign for ApplyOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.written += rhs.written;
        self.history_created += rhs.history_created;
        self.failed_chunks += rhs.failed_chunks;
        self.ignored += rhs.ignored;
    }
}

/// Derived figures for one significant price move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceChange {
    pub change: Decimal,
    pub change_pct: Decimal,
    pub multiplier: Decimal,
    pub significance: SignificanceLevel,
}

/// Canonical outcome label: the raw name, qualified by the market line when there is one.
pub fn outcome_label(family: MarketFamily, name: &str, special_value: Option<&str>) -> String {
    let name = name.trim();
    match special_value.map(str::trim).filter(|v| !v.is_empty()) {
        None => name.to_string(),
        Some(v) if family == MarketFamily::OverUnder => format!("{name} {v}"),
        Some(v) => format!("{name} ({v})"),
    }
}

/// None when the move is within epsilon.
pub fn evaluate_change(previous: Decimal, incoming: Decimal, policy: &TrackerPolicy) -> Option<PriceChange> {
    let change = incoming - previous;
    if change.abs() <= policy.epsilon {
        return None;
    }
    let (change_pct, multiplier) = if previous.is_zero() {
        (Decimal::ZERO, Decimal::ONE)
    } else {
        (
            (change / previous * Decimal::ONE_HUNDRED).round_dp(4),
            (incoming / previous).round_dp(4),
        )
    };
    Some(PriceChange {
        change,
        change_pct,
        multiplier,
        significance: SignificanceLevel::from_change_pct(change_pct, policy.high_min_pct, policy.extreme_min_pct),
    })
}

// ---------------------------------------------------------------------------
// OddsStateTracker
// ---------------------------------------------------------------------------

/// Maintains current/opening/highest/lowest per outcome and records significant moves.
///
/// Outcomes of one batch are evaluated sequentially against an in-memory copy of
/// the event's snapshots, so a key repeated within the batch sees its own update.
/// Writes go out afterwards as chunked bulk upserts.
pub struct OddsStateTracker {
    odds: Arc<dyn OddsStore>,
    crowd: Arc<dyn CrowdStore>,
    registry: Arc<MarketTypeRegistry>,
    history_tx: Option<mpsc::Sender<OddsHistoryRecord>>,
    policy: TrackerPolicy,
    classifier: ClassifierPolicy,
}

impl OddsStateTracker {
    pub fn new(
        odds: Arc<dyn OddsStore>,
        crowd: Arc<dyn CrowdStore>,
        registry: Arc<MarketTypeRegistry>,
        policy: TrackerPolicy,
        classifier: ClassifierPolicy,
    ) -> Self {
        Self {
            odds,
            crowd,
            registry,
            history_tx: None,
            policy,
            classifier,
        }
    }

    /// Route created history records to the alert engine.
    pub fn with_history_sender(mut self, tx: mpsc::Sender<OddsHistoryRecord>) -> Self {
        self.history_tx = Some(tx);
        self
    }

    pub async fn apply_markets(&self, event: EventContext, markets: &[MarketOdds]) -> Result<ApplyOutcome> {
        let now = Utc::now();
        let mut outcome = ApplyOutcome::default();

        let mut resolved = Vec::with_capacity(markets.len());
        for market in markets {
            match self.registry.resolve(&market.code, &market.name).await {
                Ok(mt) => resolved.push((mt, market)),
                Err(e) => {
                    warn!(event_id = event.event_id, code = %market.code, "[TRACKER] skipping market {}: {e}", market.code);
                    outcome.ignored += 1;
                }
            }
        }
        if resolved.is_empty() {
            return Ok(outcome);
        }

        let backoff = Duration::from_millis(PERSIST_BACKOFF_MS);
        let event_ids = [event.event_id];
        let mut state: HashMap<OddsKey, OddsSnapshot> = with_retry("snapshot read", PERSIST_ATTEMPTS, backoff, || {
            self.odds.fetch_snapshots(&event_ids)
        })
        .await?
        .into_iter()
        .map(|s| (s.key(), s))
        .collect();

        // Reverse flag input. Missing crowd data only degrades the flag.
        let bet_pct: HashMap<OddsKey, Decimal> = match self.crowd.fetch_distributions(&[event.event_id]).await {
            Ok(rows) => rows.into_iter().map(|d| (d.key(), d.bet_pct)).collect(),
            Err(e) => {
                warn!(event_id = event.event_id, "[TRACKER] distributions unavailable: {e}");
                HashMap::new()
            }
        };

        let minutes_to_kickoff = event.start_time.map(|s| (s - now).num_minutes());
        let mut dirty: Vec<OddsKey> = Vec::new();
        let mut seen: HashSet<OddsKey> = HashSet::new();
        let mut history: Vec<OddsHistoryRecord> = Vec::new();

        for (mt, market) in &resolved {
            for o in &market.outcomes {
                let price = o.odds.round_dp(self.policy.price_scale);
                if price <= Decimal::ZERO {
                    outcome.ignored += 1;
                    continue;
                }
                let key = OddsKey {
                    event_id: event.event_id,
                    market_type_id: mt.id,
                    outcome: outcome_label(mt.family, &o.name, market.special_value.as_deref()),
                };

                let Some(snap) = state.get_mut(&key) else {
                    state.insert(key.clone(), OddsSnapshot::first_sighting(key.clone(), price, now));
                    if seen.insert(key.clone()) {
                        dirty.push(key);
                    }
                    continue;
                };

                let Some(move_) = evaluate_change(snap.current, price, &self.policy) else {
                    continue;
                };
                let reverse = volume_direction(bet_pct.get(&key).copied(), move_.change, &self.classifier)
                    == VolumeDirection::AgainstMovement;

                history.push(OddsHistoryRecord {
                    id: None,
                    event_id: key.event_id,
                    market_type_id: key.market_type_id,
                    outcome: key.outcome.clone(),
                    value: price,
                    previous_value: snap.current,
                    change: move_.change,
                    change_pct: move_.change_pct,
                    multiplier: move_.multiplier,
                    significance: move_.significance,
                    is_reverse_movement: reverse,
                    minutes_to_kickoff,
                    market_params: market.special_value.clone(),
                    observed_at: now,
                });

                snap.previous = Some(snap.current);
                snap.current = price;
                snap.highest = snap.highest.max(price);
                snap.lowest = snap.lowest.min(price);
                snap.updated_at = now;
                if seen.insert(key.clone()) {
                    dirty.push(key);
                }
            }
        }

        let rows: Vec<OddsSnapshot> = dirty.iter().filter_map(|k| state.get(k).cloned()).collect();
        let chunk_size = self.policy.write_chunk_size.max(1);

        let mut committed: HashSet<OddsKey> = HashSet::with_capacity(rows.len());
        for (i, chunk) in rows.chunks(chunk_size).enumerate() {
            match with_retry("snapshot upsert", PERSIST_ATTEMPTS, backoff, || self.odds.upsert_snapshots(chunk)).await {
                Ok(_) => {
                    outcome.written += chunk.len();
                    committed.extend(chunk.iter().map(OddsSnapshot::key));
                }
                Err(e) => {
                    warn!(event_id = event.event_id, chunk = i, rows = chunk.len(), "[TRACKER] snapshot chunk failed: {e}");
                    outcome.failed_chunks += 1;
                }
            }
        }

        // A move whose snapshot did not land is seen again on the next poll.
        let before = history.len();
        history.retain(|h| committed.contains(&h.key()));
        if history.len() < before {
            debug!(
                event_id = event.event_id,
                dropped = before - history.len(),
                "[TRACKER] holding back moves whose snapshot write failed"
            );
        }

        for (i, chunk) in history.chunks(chunk_size).enumerate() {
            match with_retry("history insert", PERSIST_ATTEMPTS, backoff, || self.odds.insert_history(chunk)).await {
                Ok(saved) => {
                    outcome.history_created += saved.len();
                    self.publish(saved);
                }
                Err(e) => {
                    warn!(event_id = event.event_id, chunk = i, rows = chunk.len(), "[TRACKER] history chunk failed: {e}");
                    outcome.failed_chunks += 1;
                }
            }
        }

        if outcome.history_created > 0 {
            info!(
                event_id = event.event_id,
                written = outcome.written,
                history = outcome.history_created,
                "[TRACKER] event {}: {} rows written, {} moves recorded",
                event.event_id, outcome.written, outcome.history_created,
            );
        } else {
            debug!(event_id = event.event_id, written = outcome.written, "[TRACKER] event {} steady", event.event_id);
        }
        Ok(outcome)
    }

    fn publish(&self, saved: Vec<OddsHistoryRecord>) {
        let Some(tx) = &self.history_tx else { return };
        for record in saved {
            match tx.try_send(record) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(r)) => {
                    warn!(history_id = ?r.id, "[TRACKER] alert channel full, dropping history record");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("[TRACKER] alert channel closed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::db::{CrowdStore, MarketTypeStore, MemoryStore};
    use crate::error::AppError;
    use crate::types::{OutcomeDistribution, OutcomeOdds};

    /// Odds store whose snapshot writes and first few reads can be made to fail.
    #[derive(Default)]
    struct FlakyOdds {
        inner: Arc<MemoryStore>,
        fail_snapshot_writes: AtomicBool,
        failing_reads: AtomicU32,
        reads: AtomicU32,
    }

    fn transient() -> AppError {
        AppError::Database(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl OddsStore for FlakyOdds {
        async fn fetch_snapshots(&self, event_ids: &[i64]) -> Result<Vec<OddsSnapshot>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failing_reads.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_reads.store(remaining - 1, Ordering::SeqCst);
                return Err(transient());
            }
            self.inner.fetch_snapshots(event_ids).await
        }

        async fn upsert_snapshots(&self, rows: &[OddsSnapshot]) -> Result<u64> {
            if self.fail_snapshot_writes.load(Ordering::SeqCst) {
                return Err(transient());
            }
            self.inner.upsert_snapshots(rows).await
        }

        async fn insert_history(&self, rows: &[OddsHistoryRecord]) -> Result<Vec<OddsHistoryRecord>> {
            self.inner.insert_history(rows).await
        }

        async fn recent_history(&self, key: &OddsKey, since: DateTime<Utc>) -> Result<Vec<OddsHistoryRecord>> {
            self.inner.recent_history(key, since).await
        }
    }

    fn flaky_tracker(store: &Arc<MemoryStore>, odds: &Arc<FlakyOdds>) -> OddsStateTracker {
        let registry = Arc::new(MarketTypeRegistry::new(store.clone()));
        OddsStateTracker::new(
            odds.clone(),
            store.clone(),
            registry,
            TrackerPolicy::default(),
            ClassifierPolicy::default(),
        )
    }

    fn tracker(store: &Arc<MemoryStore>) -> OddsStateTracker {
        let registry = Arc::new(MarketTypeRegistry::new(store.clone()));
        OddsStateTracker::new(
            store.clone(),
            store.clone(),
            registry,
            TrackerPolicy::default(),
            ClassifierPolicy::default(),
        )
    }

    fn market(code: &str, special: Option<&str>, outcomes: &[(&str, Decimal)]) -> MarketOdds {
        MarketOdds {
            code: code.to_string(),
            name: code.to_string(),
            special_value: special.map(str::to_string),
            outcomes: outcomes
                .iter()
                .map(|(n, o)| OutcomeOdds { name: n.to_string(), odds: *o })
                .collect(),
        }
    }

    const EVENT: EventContext = EventContext { event_id: 7, start_time: None };

    async fn key_for(store: &Arc<MemoryStore>, code: &str, outcome: &str) -> OddsKey {
        let mt = store.find_market_type(code).await.unwrap().unwrap();
        OddsKey { event_id: EVENT.event_id, market_type_id: mt.id, outcome: outcome.to_string() }
    }

    #[test]
    fn labels_follow_market_family() {
        assert_eq!(outcome_label(MarketFamily::MatchResult, "Home", None), "Home");
        assert_eq!(outcome_label(MarketFamily::OverUnder, "Over", Some("2.5")), "Over 2.5");
        assert_eq!(outcome_label(MarketFamily::Handicap, "Home", Some("-1")), "Home (-1)");
        assert_eq!(outcome_label(MarketFamily::Handicap, "Home", Some(" ")), "Home");
    }

    #[test]
    fn epsilon_threshold() {
        let p = TrackerPolicy::default();
        assert!(evaluate_change(dec!(1.900), dec!(1.9005), &p).is_none());
        let c = evaluate_change(dec!(1.900), dec!(1.902), &p).unwrap();
        assert_eq!(c.change, dec!(0.002));
    }

    #[test]
    fn change_figures() {
        let p = TrackerPolicy::default();
        let c = evaluate_change(dec!(2.0), dec!(4.5), &p).unwrap();
        assert_eq!(c.change_pct, dec!(125));
        assert_eq!(c.multiplier, dec!(2.25));
        assert_eq!(c.significance, SignificanceLevel::Extreme);

        let c = evaluate_change(Decimal::ZERO, dec!(1.5), &p).unwrap();
        assert_eq!(c.change_pct, Decimal::ZERO);
        assert_eq!(c.multiplier, Decimal::ONE);
    }

    #[tokio::test]
    async fn first_sighting_sets_all_prices_without_history() {
        let store = MemoryStore::new();
        let t = tracker(&store);
        let out = t
            .apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.10))])])
            .await
            .unwrap();
        assert_eq!(out.written, 1);
        assert_eq!(out.history_created, 0);

        let snap = store.snapshot(&key_for(&store, "1x2", "Home").await).unwrap();
        assert_eq!(snap.opening, dec!(2.10));
        assert_eq!(snap.highest, dec!(2.10));
        assert_eq!(snap.lowest, dec!(2.10));
        assert_eq!(snap.previous, None);
    }

    #[tokio::test]
    async fn applying_the_same_batch_twice_is_idempotent() {
        let store = MemoryStore::new();
        let t = tracker(&store);
        let batch = [market("total", Some("2.5"), &[("Over", dec!(1.85)), ("Under", dec!(1.95))])];

        t.apply_markets(EVENT, &batch).await.unwrap();
        let again = t.apply_markets(EVENT, &batch).await.unwrap();
        assert_eq!(again, ApplyOutcome::default());
        assert_eq!(store.history_len(), 0);

        let snap = store.snapshot(&key_for(&store, "total", "Over 2.5").await).unwrap();
        assert_eq!(snap.current, dec!(1.85));
    }

    #[tokio::test]
    async fn movements_keep_the_range_invariant() {
        let store = MemoryStore::new();
        let t = tracker(&store);
        for price in [dec!(2.0), dec!(2.6), dec!(1.7), dec!(2.2)] {
            t.apply_markets(EVENT, &[market("1x2", None, &[("Home", price)])]).await.unwrap();
        }
        let key = key_for(&store, "1x2", "Home").await;
        let snap = store.snapshot(&key).unwrap();
        assert_eq!(snap.opening, dec!(2.0));
        assert_eq!(snap.highest, dec!(2.6));
        assert_eq!(snap.lowest, dec!(1.7));
        assert_eq!(snap.current, dec!(2.2));
        assert_eq!(snap.previous, Some(dec!(1.7)));
        assert!(snap.lowest <= snap.current && snap.current <= snap.highest);
        assert_eq!(store.history_for(&key).len(), 3);
    }

    #[tokio::test]
    async fn repeated_key_in_one_batch_compares_against_its_own_update() {
        let store = MemoryStore::new();
        let t = tracker(&store);
        t.apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.0))])]).await.unwrap();

        let out = t
            .apply_markets(
                EVENT,
                &[
                    market("1x2", None, &[("Home", dec!(2.2))]),
                    market("1x2", None, &[("Home", dec!(2.5))]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(out.history_created, 2);
        assert_eq!(out.written, 1);

        let hist = store.history_for(&key_for(&store, "1x2", "Home").await);
        assert_eq!(hist[0].previous_value, dec!(2.0));
        assert_eq!(hist[1].previous_value, dec!(2.2));
        assert_eq!(hist[1].value, dec!(2.5));
    }

    #[tokio::test]
    async fn non_positive_prices_are_ignored() {
        let store = MemoryStore::new();
        let t = tracker(&store);
        let out = t
            .apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(0)), ("Away", dec!(-1.2))])])
            .await
            .unwrap();
        assert_eq!(out.ignored, 2);
        assert_eq!(out.written, 0);
    }

    #[tokio::test]
    async fn heavy_public_on_a_drifting_price_flags_reverse() {
        let store = MemoryStore::new();
        let t = tracker(&store);
        t.apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.0))])]).await.unwrap();
        let key = key_for(&store, "1x2", "Home").await;
        store
            .upsert_distributions(&[OutcomeDistribution {
                event_id: key.event_id,
                market_type_id: key.market_type_id,
                outcome: key.outcome.clone(),
                bet_pct: dec!(70),
                implied_probability: Some(dec!(50)),
                updated_at: Utc::now(),
            }])
            .await
            .unwrap();

        t.apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.5))])]).await.unwrap();
        let hist = store.history_for(&key);
        assert!(hist[0].is_reverse_movement);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_chunks_are_counted_not_raised() {
        let store = MemoryStore::new();
        let t = tracker(&store);
        store.set_fail_odds_writes(true);
        let out = t
            .apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.0))])])
            .await
            .unwrap();
        assert_eq!(out.failed_chunks, 1);
        assert_eq!(out.written, 0);
    }

    #[tokio::test]
    async fn created_history_is_published() {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::channel(8);
        let t = tracker(&store).with_history_sender(tx);
        t.apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.0))])]).await.unwrap();
        t.apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.4))])]).await.unwrap();

        let record = rx.try_recv().unwrap();
        assert!(record.id.is_some());
        assert_eq!(record.value, dec!(2.4));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn moves_are_held_back_until_their_snapshot_lands() {
        let store = MemoryStore::new();
        let odds = Arc::new(FlakyOdds { inner: store.clone(), ..Default::default() });
        let (tx, mut rx) = mpsc::channel(8);
        let t = flaky_tracker(&store, &odds).with_history_sender(tx);
        t.apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.0))])]).await.unwrap();
        let key = key_for(&store, "1x2", "Home").await;

        odds.fail_snapshot_writes.store(true, Ordering::SeqCst);
        let failed = t
            .apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.4))])])
            .await
            .unwrap();
        assert_eq!(failed.failed_chunks, 1);
        assert_eq!(failed.history_created, 0);
        assert!(store.history_for(&key).is_empty());
        assert!(rx.try_recv().is_err());

        odds.fail_snapshot_writes.store(false, Ordering::SeqCst);
        let healed = t
            .apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.4))])])
            .await
            .unwrap();
        assert_eq!(healed.history_created, 1);
        assert_eq!(store.history_for(&key).len(), 1);
        assert_eq!(store.snapshot(&key).unwrap().current, dec!(2.4));
        assert_eq!(rx.try_recv().unwrap().previous_value, dec!(2.0));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_snapshot_reads_are_retried() {
        let store = MemoryStore::new();
        let odds = Arc::new(FlakyOdds { inner: store.clone(), ..Default::default() });
        odds.failing_reads.store(2, Ordering::SeqCst);
        let t = flaky_tracker(&store, &odds);

        let out = t
            .apply_markets(EVENT, &[market("1x2", None, &[("Home", dec!(2.0))])])
            .await
            .unwrap();
        assert_eq!(out.written, 1);
        assert_eq!(odds.reads.load(Ordering::SeqCst), 3);
    }
}
