use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use odds_sentinel::api::{router, ApiState, HealthState, LatencyStats};
use odds_sentinel::collector::CrowdCollector;
use odds_sentinel::config::{
    Config, ALERT_SWEEP_INTERVAL_SECS, CHANNEL_CAPACITY, DISTRIBUTION_SYNC_INTERVAL_SECS,
    ODDS_SYNC_INTERVAL_SECS, VOLUME_SYNC_INTERVAL_SECS,
};
use odds_sentinel::db::{Persistence, SqliteStore};
use odds_sentinel::detector::AlertEngine;
use odds_sentinel::error::Result;
use odds_sentinel::feed::{FeedClient, HttpFeedClient};
use odds_sentinel::fetcher::RateLimitedFetcher;
use odds_sentinel::ingest::{Orchestrator, StoreResolver};
use odds_sentinel::registry::MarketTypeRegistry;
use odds_sentinel::tracker::OddsStateTracker;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let store = Arc::new(SqliteStore::connect(&cfg.db_path).await?);
    start(cfg, store).await
}

/// Wire every component onto one backing store and serve until shutdown.
async fn start<S: Persistence + 'static>(cfg: Config, store: Arc<S>) -> Result<()> {
    let registry = Arc::new(MarketTypeRegistry::new(store.clone()));
    let preloaded = registry.preload().await?;
    info!("[REGISTRY] {preloaded} market types preloaded");

    // --- Upstream ---
    let latency = Arc::new(LatencyStats::new());
    let fetcher = Arc::new(RateLimitedFetcher::new(cfg.fetcher.clone(), Arc::clone(&latency))?);
    let feed: Arc<dyn FeedClient> = Arc::new(HttpFeedClient::new(cfg.feed_api_url.clone(), Arc::clone(&fetcher)));
    info!("Feed at {} (pace {:?})", cfg.feed_api_url, cfg.fetcher.pace_interval);

    // --- Tracker → alert engine ---
    let (history_tx, history_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let tracker = Arc::new(
        OddsStateTracker::new(
            store.clone(),
            store.clone(),
            Arc::clone(&registry),
            cfg.tracker.clone(),
            cfg.classifier.clone(),
        )
        .with_history_sender(history_tx),
    );

    let engine = Arc::new(AlertEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::clone(&registry),
        cfg.classifier.clone(),
    ));
    let consumer = Arc::clone(&engine);
    tokio::spawn(async move { consumer.run(history_rx).await });
    let sweeper = Arc::clone(&engine);
    tokio::spawn(async move { sweeper.run_sweeper(Duration::from_secs(ALERT_SWEEP_INTERVAL_SECS)).await });

    // --- Ingestion ---
    let health = Arc::new(HealthState::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&feed),
        store.clone(),
        Arc::new(StoreResolver::new(store.clone())),
        tracker,
        cfg.ingest.clone(),
    ));
    tokio::spawn(odds_loop(Arc::clone(&orchestrator), cfg.sport_ids.clone(), Arc::clone(&health)));

    let collector = Arc::new(CrowdCollector::new(
        feed,
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::clone(&registry),
    ));
    tokio::spawn(distribution_loop(Arc::clone(&collector), cfg.crowd_sports.clone(), Arc::clone(&health)));
    tokio::spawn(volume_loop(collector, cfg.crowd_sports.clone(), Arc::clone(&health)));

    // --- Shutdown ---
    let shutdown = CancellationToken::new();
    let stopper = Arc::clone(&orchestrator);
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Signal handler failed: {e}"),
        }
        stopper.stop();
        signal.cancel();
    });

    // HTTP API server
    let api_state = ApiState {
        alerts: store.clone(),
        odds: store.clone(),
        events: store.clone(),
        registry,
        engine,
        fetcher,
        latency,
        health,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// One odds cycle per sport every interval, until the orchestrator is stopped.
async fn odds_loop(orchestrator: Arc<Orchestrator>, sport_ids: Vec<String>, health: Arc<HealthState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(ODDS_SYNC_INTERVAL_SECS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        for sport_id in &sport_ids {
            if orchestrator.is_stopped() {
                info!("[INGEST] stopped, odds loop exiting");
                return;
            }
            match orchestrator.run_sport(sport_id).await {
                Ok(summary) => health.record_batch(&summary),
                Err(e) => {
                    health.record_cycle_failure();
                    error!(sport_id = %sport_id, "[INGEST] cycle for sport {sport_id} failed: {e}");
                }
            }
        }
    }
}

async fn distribution_loop(collector: Arc<CrowdCollector>, sports: Vec<String>, health: Arc<HealthState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(DISTRIBUTION_SYNC_INTERVAL_SECS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        for sport in &sports {
            match collector.sync_distributions(sport).await {
                Ok(stats) => health.record_distributions(&stats),
                Err(e) => error!(sport = %sport, "[COLLECTOR] distribution sync failed: {e}"),
            }
        }
    }
}

async fn volume_loop(collector: Arc<CrowdCollector>, sports: Vec<String>, health: Arc<HealthState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(VOLUME_SYNC_INTERVAL_SECS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        for sport in &sports {
            match collector.sync_volumes(sport).await {
                Ok(stats) => health.record_volumes(&stats),
                Err(e) => error!(sport = %sport, "[COLLECTOR] volume sync failed: {e}"),
            }
        }
    }
}
