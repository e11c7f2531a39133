use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{IngestPolicy, PERSIST_ATTEMPTS, PERSIST_BACKOFF_MS};
use crate::db::{with_retry, EventStore};
use crate::error::{AppError, Result};
use crate::feed::FeedClient;
use crate::ingest::resolver::EntityResolver;
use crate::tracker::{ApplyOutcome, EventContext, OddsStateTracker};
use crate::types::{MarketOdds, NewEvent, SportEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Not dispatched because the orchestrator was stopped.
    pub skipped: usize,
    #[serde(skip)]
    pub duration: Duration,
    pub odds_written: usize,
    pub history_created: usize,
}

/// Why the detailed per-event fetch was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    LargeMarketSport,
    DeadlineTight,
    AlreadyRich,
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::LargeMarketSport => "large_market_sport",
            SkipReason::DeadlineTight => "deadline_tight",
            SkipReason::AlreadyRich => "already_rich",
            SkipReason::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Decide whether an event is worth a detailed fetch.
pub fn detail_decision(
    policy: &IngestPolicy,
    event: &SportEvent,
    remaining: Duration,
    cancelled: bool,
) -> std::result::Result<(), SkipReason> {
    if cancelled {
        return Err(SkipReason::Cancelled);
    }
    let large = policy
        .large_market_sports
        .iter()
        .any(|s| s.eq_ignore_ascii_case(&event.sport) || s.eq_ignore_ascii_case(&event.sport_id));
    if large {
        return Err(SkipReason::LargeMarketSport);
    }
    if remaining < policy.detail_min_remaining {
        return Err(SkipReason::DeadlineTight);
    }
    if event.markets.len() > policy.max_markets_for_detail {
        return Err(SkipReason::AlreadyRich);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-event worker
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Worker {
    feed: Arc<dyn FeedClient>,
    events: Arc<dyn EventStore>,
    resolver: Arc<dyn EntityResolver>,
    tracker: Arc<OddsStateTracker>,
    policy: Arc<IngestPolicy>,
}

impl Worker {
    async fn process_event(&self, event: SportEvent, deadline: Instant, token: CancellationToken) -> Result<ApplyOutcome> {
        let backoff = Duration::from_millis(PERSIST_BACKOFF_MS);
        let (home_team_id, away_team_id) = try_join(
            with_retry("team upsert", PERSIST_ATTEMPTS, backoff, || {
                self.events.upsert_team(&event.sport, &event.home_team)
            }),
            with_retry("team upsert", PERSIST_ATTEMPTS, backoff, || {
                self.events.upsert_team(&event.sport, &event.away_team)
            }),
        )
        .await?;

        let league_id = match &event.competition_code {
            Some(code) => self.resolver.resolve_league(&event.sport, code).await.unwrap_or_else(|e| {
                warn!(external_id = %event.external_id, "[INGEST] league resolution failed: {e}");
                None
            }),
            None => None,
        };

        let record = NewEvent {
            external_id: event.external_id.clone(),
            sport: event.sport.clone(),
            home_team_id,
            away_team_id,
            league_id,
            start_time: event.start_time,
        };
        let event_id = with_retry("event upsert", PERSIST_ATTEMPTS, backoff, || self.events.upsert_event(&record)).await?;

        let start_time = event.start_time;
        let markets = self.choose_markets(event, deadline, &token).await;
        let outcome = self.tracker.apply_markets(EventContext { event_id, start_time }, &markets).await?;
        if outcome.failed_chunks > 0 {
            return Err(AppError::PartialWrite { event_id, failed_chunks: outcome.failed_chunks });
        }
        Ok(outcome)
    }

    /// Detailed markets when the policy allows and the fetch delivers, the coarse payload otherwise.
    async fn choose_markets(&self, event: SportEvent, deadline: Instant, token: &CancellationToken) -> Vec<MarketOdds> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(reason) = detail_decision(&self.policy, &event, remaining, token.is_cancelled()) {
            debug!(external_id = %event.external_id, reason = %reason, "[INGEST] using coarse markets");
            return event.markets;
        }

        let fetch = self.feed.get_single_event(&event.sport_id, &event.external_id);
        match tokio::time::timeout(self.policy.detail_timeout, fetch).await {
            Ok(Ok(Some(detail))) if !detail.markets.is_empty() => detail.markets,
            Ok(Ok(_)) => {
                debug!(external_id = %event.external_id, "[INGEST] empty detail payload, using coarse markets");
                event.markets
            }
            Ok(Err(e)) => {
                warn!(external_id = %event.external_id, "[INGEST] detail fetch failed, using coarse markets: {e}");
                event.markets
            }
            Err(_) => {
                warn!(external_id = %event.external_id, "[INGEST] detail fetch timed out, using coarse markets");
                event.markets
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives one ingestion cycle: bounded workers, per-event deadlines, partial
/// failure reporting. Stopping cancels undispatched work only.
pub struct Orchestrator {
    worker: Worker,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        events: Arc<dyn EventStore>,
        resolver: Arc<dyn EntityResolver>,
        tracker: Arc<OddsStateTracker>,
        policy: IngestPolicy,
    ) -> Self {
        Self {
            worker: Worker {
                feed,
                events,
                resolver,
                tracker,
                policy: Arc::new(policy),
            },
            cancel: CancellationToken::new(),
        }
    }

    pub fn stop(&self) {
        info!("[INGEST] stop requested");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fetch the coarse batch for one sport and process it.
    pub async fn run_sport(&self, sport_id: &str) -> Result<BatchSummary> {
        let events = self.worker.feed.get_events(sport_id).await?;
        if events.is_empty() {
            debug!(sport_id, "[INGEST] no events for sport {sport_id}");
            return Ok(BatchSummary::default());
        }
        self.process_batch(events).await
    }

    pub async fn process_batch(&self, events: Vec<SportEvent>) -> Result<BatchSummary> {
        let started = Instant::now();
        let total = events.len();
        let mut summary = BatchSummary::default();

        let mut by_sport: BTreeMap<String, Vec<SportEvent>> = BTreeMap::new();
        for ev in events {
            by_sport.entry(ev.sport.clone()).or_default().push(ev);
        }

        let permits = Arc::new(Semaphore::new(self.worker.policy.max_workers.max(1)));
        let mut set: JoinSet<(usize, String, Result<ApplyOutcome>)> = JoinSet::new();
        let mut index = 0usize;

        for (sport, group) in by_sport {
            debug!(sport = %sport, events = group.len(), "[INGEST] dispatching {} {sport} events", group.len());
            for event in group {
                let permit = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    p = Arc::clone(&permits).acquire_owned() => p.ok(),
                };
                let Some(permit) = permit else {
                    summary.skipped += 1;
                    continue;
                };

                let worker = self.worker.clone();
                let token = self.cancel.child_token();
                let i = index;
                index += 1;
                set.spawn(async move {
                    let _permit = permit;
                    let external_id = event.external_id.clone();
                    let deadline = Instant::now() + worker.policy.event_timeout;
                    let result = match tokio::time::timeout_at(deadline, worker.process_event(event, deadline, token)).await {
                        Ok(r) => r,
                        Err(_) => Err(AppError::Timeout(format!("event {external_id}"))),
                    };
                    (i, external_id, result)
                });
            }
        }

        let mut first_error: Option<(usize, AppError)> = None;
        while let Some(joined) = set.join_next().await {
            let (i, external_id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("[INGEST] worker task failed: {e}");
                    summary.failed += 1;
                    if first_error.is_none() {
                        first_error = Some((usize::MAX, AppError::Cancelled(format!("worker task failed: {e}"))));
                    }
                    continue;
                }
            };
            match result {
                Ok(outcome) => {
                    summary.succeeded += 1;
                    summary.odds_written += outcome.written;
                    summary.history_created += outcome.history_created;
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(external_id = %external_id, "[INGEST] event {external_id} failed: {e}");
                    if first_error.as_ref().map_or(true, |(j, _)| i < *j) {
                        first_error = Some((i, e));
                    }
                }
            }
        }

        summary.duration = started.elapsed();
        info!(
            total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            odds_written = summary.odds_written,
            history_created = summary.history_created,
            duration_ms = summary.duration.as_millis() as u64,
            "[INGEST] batch done: {}/{total} ok, {} failed, {} skipped in {:?}",
            summary.succeeded, summary.failed, summary.skipped, summary.duration,
        );

        match first_error {
            Some((_, e)) if summary.succeeded == 0 => Err(e),
            _ => Ok(summary),
        }
    }
}
