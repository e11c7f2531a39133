use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ClassifierPolicy;
use crate::db::{AlertStore, CrowdStore, EventStore, OddsStore};
use crate::detector::classifier::{assess, triggers, Assessment, MovementContext};
use crate::error::Result;
use crate::registry::MarketTypeRegistry;
use crate::types::{AlertType, EventRecord, MovementAlert, OddsHistoryRecord, OutcomeDistribution, Severity};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AlertStats {
    pub evaluated: u64,
    pub created: u64,
    pub duplicates: u64,
    pub expired: u64,
}

/// Consumes history records from the tracker, classifies them and persists alerts.
///
/// Context lookups that fail are logged and treated as missing data; a record
/// is never rejected because its context is incomplete.
pub struct AlertEngine {
    odds: Arc<dyn OddsStore>,
    crowd: Arc<dyn CrowdStore>,
    events: Arc<dyn EventStore>,
    alerts: Arc<dyn AlertStore>,
    registry: Arc<MarketTypeRegistry>,
    policy: ClassifierPolicy,
    evaluated: AtomicU64,
    created: AtomicU64,
    duplicates: AtomicU64,
    expired: AtomicU64,
}

impl AlertEngine {
    pub fn new(
        odds: Arc<dyn OddsStore>,
        crowd: Arc<dyn CrowdStore>,
        events: Arc<dyn EventStore>,
        alerts: Arc<dyn AlertStore>,
        registry: Arc<MarketTypeRegistry>,
        policy: ClassifierPolicy,
    ) -> Self {
        Self {
            odds,
            crowd,
            events,
            alerts,
            registry,
            policy,
            evaluated: AtomicU64::new(0),
            created: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Drain the tracker channel until every sender is gone.
    pub async fn run(&self, mut rx: mpsc::Receiver<OddsHistoryRecord>) {
        while let Some(record) = rx.recv().await {
            self.evaluate(&record).await;
        }
        info!("[ALERT] history channel closed, engine stopping");
    }

    /// Periodically deactivate alerts past their TTL.
    pub async fn run_sweeper(&self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // consume immediate first tick

        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_expired().await {
                error!("[ALERT] expiry sweep failed: {e}");
            }
        }
    }

    pub async fn sweep_expired(&self) -> Result<u64> {
        let n = self.alerts.expire_alerts(Utc::now()).await?;
        if n > 0 {
            self.expired.fetch_add(n, Ordering::Relaxed);
            info!(expired = n, "[ALERT] expired {n} alerts");
        }
        Ok(n)
    }

    /// Classify one history record and persist any alerts it triggers.
    /// Returns the alerts actually created; duplicates are skipped.
    pub async fn evaluate(&self, record: &OddsHistoryRecord) -> Vec<MovementAlert> {
        self.evaluated.fetch_add(1, Ordering::Relaxed);
        let Some(history_id) = record.id else {
            warn!(event_id = record.event_id, "[ALERT] unpersisted history record, skipping");
            return Vec::new();
        };

        let key = record.key();
        let distribution = match self.crowd.fetch_distributions(&[record.event_id]).await {
            Ok(rows) => rows.into_iter().find(|d| d.key() == key),
            Err(e) => {
                warn!(event_id = record.event_id, "[ALERT] distributions unavailable: {e}");
                None
            }
        };

        let window = chrono::Duration::from_std(self.policy.steam_window).unwrap_or_else(|_| chrono::Duration::hours(1));
        // Moves observed after this record belong to their own evaluation.
        let recent = match self.odds.recent_history(&key, record.observed_at - window).await {
            Ok(rows) => rows.into_iter().filter(|h| h.observed_at <= record.observed_at).collect(),
            Err(e) => {
                warn!(event_id = record.event_id, "[ALERT] recent history unavailable: {e}");
                vec![record.clone()]
            }
        };

        let ctx = MovementContext {
            record,
            family: self.registry.by_id(record.market_type_id).map(|m| m.family),
            distribution: distribution.as_ref(),
            recent: &recent,
        };
        let assessment = assess(&ctx, &self.policy);
        let fired = triggers(record, &assessment, &self.policy);
        if fired.is_empty() {
            return Vec::new();
        }

        let event = self.events.find_event(record.event_id).await.unwrap_or_else(|e| {
            warn!(event_id = record.event_id, "[ALERT] event lookup failed: {e}");
            None
        });
        let label = event_label(record.event_id, event.as_ref());

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.policy.alert_ttl).unwrap_or_else(|_| chrono::Duration::hours(6));
        let mut created = Vec::new();

        for (alert_type, confidence) in fired {
            let (title, message) = describe(alert_type, &label, record, &assessment, distribution.as_ref());
            let mut alert = MovementAlert {
                id: None,
                history_id,
                event_id: record.event_id,
                market_type_id: record.market_type_id,
                outcome: record.outcome.clone(),
                alert_type,
                severity: Severity::from_confidence(confidence),
                title,
                message,
                change_pct: record.change_pct,
                multiplier: record.multiplier,
                confidence,
                minutes_to_kickoff: record.minutes_to_kickoff,
                created_at: now,
                expires_at: now + ttl,
                active: true,
            };
            match self.alerts.insert_alert(&alert).await {
                Ok(Some(id)) => {
                    alert.id = Some(id);
                    self.created.fetch_add(1, Ordering::Relaxed);
                    info!(
                        alert_id = id,
                        alert_type = %alert.alert_type,
                        severity = %alert.severity,
                        confidence = alert.confidence,
                        event_id = alert.event_id,
                        "[ALERT] {} | {} | {}",
                        alert.severity, alert.title, alert.message,
                    );
                    created.push(alert);
                }
                Ok(None) => {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                    debug!(history_id, alert_type = %alert_type, "[ALERT] duplicate suppressed");
                }
                Err(e) => {
                    error!(history_id, alert_type = %alert_type, "[ALERT] failed to persist alert: {e}");
                }
            }
        }
        created
    }
}

fn event_label(event_id: i64, event: Option<&EventRecord>) -> String {
    match event {
        Some(e) if !e.home_team.is_empty() && !e.away_team.is_empty() => {
            format!("{} vs {}", e.home_team, e.away_team)
        }
        _ => format!("Event #{event_id}"),
    }
}

fn describe(
    alert_type: AlertType,
    label: &str,
    r: &OddsHistoryRecord,
    a: &Assessment,
    distribution: Option<&OutcomeDistribution>,
) -> (String, String) {
    let movement = format!(
        "{} {} -> {} ({:+}%)",
        r.outcome,
        r.previous_value.normalize(),
        r.value.normalize(),
        r.change_pct.round_dp(1),
    );
    match alert_type {
        AlertType::BigMover => (
            format!("Big mover: {label}"),
            format!("{movement}, x{}", r.multiplier.round_dp(2)),
        ),
        AlertType::ReverseLine => {
            let public = distribution
                .map(|d| format!(" with {}% of bets on it", d.bet_pct.round_dp(1)))
                .unwrap_or_default();
            (format!("Reverse line: {label}"), format!("{movement}{public}"))
        }
        AlertType::SharpMoney => {
            let patterns = if a.patterns.is_empty() {
                String::new()
            } else {
                let names: Vec<String> = a.patterns.iter().map(|p| p.to_string()).collect();
                format!(" [{}]", names.join(", "))
            };
            (
                format!("Sharp money: {label}"),
                format!("{movement}, confidence {:.2}{patterns}", a.confidence),
            )
        }
        AlertType::ValueSpot => (
            format!("Value spot: {label}"),
            format!("{movement}, public bias {:+.1}pp", a.bias.unwrap_or_default()),
        ),
        AlertType::SteamMove => (
            format!("Steam move: {label}"),
            format!("{movement}, {} same-direction moves in the last hour", a.steam_moves),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerPolicy;
    use crate::db::{AlertStore, CrowdStore, EventStore, MemoryStore, OddsStore};
    use crate::tracker::{EventContext, OddsStateTracker};
    use crate::types::{AlertQuery, MarketOdds, NewEvent, OutcomeOdds, SignificanceLevel};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<MemoryStore>,
        tracker: OddsStateTracker,
        engine: AlertEngine,
        rx: mpsc::Receiver<OddsHistoryRecord>,
        event: EventContext,
    }

    async fn harness() -> Harness {
        let store = MemoryStore::new();
        let registry = Arc::new(MarketTypeRegistry::new(store.clone()));
        let (tx, rx) = mpsc::channel(64);
        let tracker = OddsStateTracker::new(
            store.clone(),
            store.clone(),
            Arc::clone(&registry),
            TrackerPolicy::default(),
            ClassifierPolicy::default(),
        )
        .with_history_sender(tx);
        let engine = AlertEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            registry,
            ClassifierPolicy::default(),
        );
        let home = store.upsert_team("football", "Arsenal").await.unwrap();
        let away = store.upsert_team("football", "Chelsea").await.unwrap();
        let event_id = store
            .upsert_event(&NewEvent {
                external_id: "ev-1".into(),
                sport: "football".into(),
                home_team_id: home,
                away_team_id: away,
                league_id: None,
                start_time: None,
            })
            .await
            .unwrap();
        Harness {
            store,
            tracker,
            engine,
            rx,
            event: EventContext { event_id, start_time: Some(Utc::now() + chrono::Duration::minutes(600)) },
        }
    }

    fn home(price: Decimal) -> Vec<MarketOdds> {
        vec![MarketOdds {
            code: "1x2".into(),
            name: "Match Result".into(),
            special_value: None,
            outcomes: vec![OutcomeOdds { name: "Home".into(), odds: price }],
        }]
    }

    #[tokio::test]
    async fn reverse_line_scenario_end_to_end() {
        let mut h = harness().await;
        h.tracker.apply_markets(h.event, &home(dec!(1.80))).await.unwrap();
        let snap = h.store.fetch_snapshots(&[h.event.event_id]).await.unwrap().remove(0);
        h.store
            .upsert_distributions(&[OutcomeDistribution {
                event_id: snap.event_id,
                market_type_id: snap.market_type_id,
                outcome: snap.outcome.clone(),
                bet_pct: dec!(70),
                implied_probability: Some(dec!(55.56)),
                updated_at: Utc::now(),
            }])
            .await
            .unwrap();

        h.tracker.apply_markets(h.event, &home(dec!(1.95))).await.unwrap();
        let record = h.rx.try_recv().unwrap();
        assert!(record.is_reverse_movement);

        let alerts = h.engine.evaluate(&record).await;
        let reverse = alerts.iter().find(|a| a.alert_type == AlertType::ReverseLine).unwrap();
        assert_eq!(reverse.title, "Reverse line: Arsenal vs Chelsea");
        assert!(reverse.active);
        assert!(reverse.confidence > 0.0 && reverse.confidence <= 1.0);
    }

    #[tokio::test]
    async fn same_record_never_alerts_twice() {
        let mut h = harness().await;
        h.tracker.apply_markets(h.event, &home(dec!(2.0))).await.unwrap();
        h.tracker.apply_markets(h.event, &home(dec!(4.5))).await.unwrap();
        let record = h.rx.try_recv().unwrap();

        let first = h.engine.evaluate(&record).await;
        assert!(first.iter().any(|a| a.alert_type == AlertType::BigMover));
        let second = h.engine.evaluate(&record).await;
        assert!(second.is_empty());
        assert_eq!(h.engine.stats().duplicates, first.len() as u64);
        assert_eq!(h.store.all_alerts().len(), first.len());
    }

    #[tokio::test]
    async fn steam_fires_after_repeated_moves() {
        let mut h = harness().await;
        let mut price = dec!(2.0);
        h.tracker.apply_markets(h.event, &home(price)).await.unwrap();
        for _ in 0..3 {
            price += dec!(0.1);
            h.tracker.apply_markets(h.event, &home(price)).await.unwrap();
        }
        let mut last = None;
        while let Ok(r) = h.rx.try_recv() {
            last = Some(r);
        }
        let alerts = h.engine.evaluate(&last.unwrap()).await;
        let steam = alerts.iter().find(|a| a.alert_type == AlertType::SteamMove).unwrap();
        assert_eq!(steam.confidence, 0.5);
        assert_eq!(steam.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn steam_window_ends_at_the_evaluated_record() {
        let h = harness().await;
        h.tracker.apply_markets(h.event, &home(dec!(2.0))).await.unwrap();
        let key = h.store.fetch_snapshots(&[h.event.event_id]).await.unwrap().remove(0).key();

        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let mut price = dec!(2.0);
        let mut rows = Vec::new();
        for i in 0..4 {
            let next = price + dec!(0.1);
            rows.push(OddsHistoryRecord {
                id: None,
                event_id: key.event_id,
                market_type_id: key.market_type_id,
                outcome: key.outcome.clone(),
                value: next,
                previous_value: price,
                change: next - price,
                change_pct: ((next - price) / price * dec!(100)).round_dp(4),
                multiplier: (next / price).round_dp(4),
                significance: SignificanceLevel::Normal,
                is_reverse_movement: false,
                minutes_to_kickoff: Some(600),
                market_params: None,
                observed_at: t0 + chrono::Duration::minutes(i),
            });
            price = next;
        }
        let saved = h.store.insert_history(&rows).await.unwrap();

        let early = h.engine.evaluate(&saved[1]).await;
        assert!(early.iter().all(|a| a.alert_type != AlertType::SteamMove));
        let late = h.engine.evaluate(&saved[3]).await;
        assert!(late.iter().any(|a| a.alert_type == AlertType::SteamMove));
    }

    #[tokio::test]
    async fn sweep_deactivates_expired_alerts() {
        let mut h = harness().await;
        h.tracker.apply_markets(h.event, &home(dec!(2.0))).await.unwrap();
        h.tracker.apply_markets(h.event, &home(dec!(4.5))).await.unwrap();
        let record = h.rx.try_recv().unwrap();
        h.engine.evaluate(&record).await;

        assert_eq!(h.engine.sweep_expired().await.unwrap(), 0);
        let all = AlertQuery { alert_type: None, min_confidence: 0.0, limit: 50 };
        let active = h.store.active_alerts(&all).await.unwrap();
        assert!(!active.is_empty());

        let later = Utc::now() + chrono::Duration::hours(7);
        assert_eq!(h.store.expire_alerts(later).await.unwrap(), active.len() as u64);
        assert!(h.store.active_alerts(&all).await.unwrap().is_empty());
    }

    #[test]
    fn label_falls_back_to_event_id() {
        assert_eq!(event_label(42, None), "Event #42");
    }
}
