use std::time::Duration;

use backoff::ExponentialBackoff;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::{AppError, Result};

pub const FEED_API_URL: &str = "https://feed.example-bookmaker.com/api/v2";

/// Minimum absolute price change (decimal odds) that counts as a movement.
/// Changes at or below this are steady-state polling noise and never written.
pub const ODDS_EPSILON: Decimal = dec!(0.001);

/// Minimum change in bet percentage (percentage points) that appends a distribution history row.
pub const DISTRIBUTION_EPSILON: Decimal = dec!(0.01);

/// Channel capacity for history records routed from the tracker to the alert engine.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Rows per bulk statement. Keeps SQLite well under its bind-parameter limit.
pub const WRITE_CHUNK_SIZE: usize = 500;

/// Persistence retry: attempts per chunk and base backoff.
pub const PERSIST_ATTEMPTS: u32 = 3;
pub const PERSIST_BACKOFF_MS: u64 = 100;

/// Market type creation retry (retries after the first attempt) and base backoff.
pub const MARKET_TYPE_RETRIES: u32 = 2;
pub const MARKET_TYPE_BACKOFF_MS: u64 = 50;

/// Ceiling for a single retry wait.
pub const MAX_RETRY_INTERVAL_SECS: u64 = 30;

/// Deterministic doubling schedule starting at `initial`. Callers cap attempts themselves.
pub fn retry_backoff(initial: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: Duration::from_secs(MAX_RETRY_INTERVAL_SECS),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Background loop intervals (seconds).
pub const ODDS_SYNC_INTERVAL_SECS: u64 = 60;
pub const DISTRIBUTION_SYNC_INTERVAL_SECS: u64 = 300;
pub const VOLUME_SYNC_INTERVAL_SECS: u64 = 300;
pub const ALERT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Significance bucket boundaries on |change %|.
pub mod significance_thresholds {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    pub const EXTREME_MIN_PCT: Decimal = dec!(20);
    pub const HIGH_MIN_PCT: Decimal = dec!(10);
}

#[derive(Debug, Clone)]
pub struct TrackerPolicy {
    pub epsilon: Decimal,
    pub extreme_min_pct: Decimal,
    pub high_min_pct: Decimal,
    /// Incoming prices are rounded to this many decimal places.
    pub price_scale: u32,
    pub write_chunk_size: usize,
}

impl Default for TrackerPolicy {
    fn default() -> Self {
        Self {
            epsilon: ODDS_EPSILON,
            extreme_min_pct: significance_thresholds::EXTREME_MIN_PCT,
            high_min_pct: significance_thresholds::HIGH_MIN_PCT,
            price_scale: 4,
            write_chunk_size: WRITE_CHUNK_SIZE,
        }
    }
}

/// Every threshold and weight the movement classifier uses.
#[derive(Debug, Clone)]
pub struct ClassifierPolicy {
    pub time_weight: f64,

    pub large_move_pct: f64,
    pub large_move_bonus: f64,
    pub medium_move_pct: f64,
    pub medium_move_bonus: f64,
    pub large_multiplier: f64,
    pub large_multiplier_bonus: f64,
    pub medium_multiplier: f64,
    pub medium_multiplier_bonus: f64,

    /// Fixed increment per matched counter-public rule.
    pub pattern_bonus: f64,
    /// Previous price below this is a favourite.
    pub favourite_max_odds: f64,
    /// Previous price at or above this is a big underdog.
    pub underdog_min_odds: f64,

    /// Public share at or above this is "heavy".
    pub heavy_public_pct: f64,
    /// Public share at or below this is "avoided".
    pub light_public_pct: f64,
    pub against_movement_bonus: f64,

    pub public_bias_pp: f64,
    pub public_bias_bonus: f64,

    pub big_mover_pct: f64,
    pub big_mover_multiplier: f64,
    pub sharp_money_confidence: f64,
    pub value_spot_bias_pp: f64,

    pub steam_window: Duration,
    /// Steam fires when more than this many qualifying moves fall inside the window.
    pub steam_min_moves: usize,
    pub steam_min_move_pct: f64,

    pub alert_ttl: Duration,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            time_weight: 0.2,
            large_move_pct: 30.0,
            large_move_bonus: 0.25,
            medium_move_pct: 20.0,
            medium_move_bonus: 0.15,
            large_multiplier: 2.5,
            large_multiplier_bonus: 0.2,
            medium_multiplier: 2.0,
            medium_multiplier_bonus: 0.1,
            pattern_bonus: 0.15,
            favourite_max_odds: 2.0,
            underdog_min_odds: 4.0,
            heavy_public_pct: 60.0,
            light_public_pct: 35.0,
            against_movement_bonus: 0.2,
            public_bias_pp: 20.0,
            public_bias_bonus: 0.15,
            big_mover_pct: 20.0,
            big_mover_multiplier: 2.0,
            sharp_money_confidence: 0.6,
            value_spot_bias_pp: 15.0,
            steam_window: Duration::from_secs(3600),
            steam_min_moves: 2,
            steam_min_move_pct: 2.0,
            alert_ttl: Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherPolicy {
    /// One outbound permit per interval, shared by every worker.
    pub pace_interval: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub breaker_window: Duration,
    pub breaker_min_requests: usize,
    pub breaker_failure_ratio: f64,
    pub breaker_cooldown: Duration,
    pub half_open_max_trials: u32,
    pub half_open_successes_to_close: u32,
}

impl Default for FetcherPolicy {
    fn default() -> Self {
        Self {
            pace_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(20),
            max_retries: 2,
            retry_backoff: Duration::from_millis(200),
            breaker_window: Duration::from_secs(60),
            breaker_min_requests: 3,
            breaker_failure_ratio: 0.6,
            breaker_cooldown: Duration::from_secs(30),
            half_open_max_trials: 3,
            half_open_successes_to_close: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestPolicy {
    pub max_workers: usize,
    pub event_timeout: Duration,
    pub detail_timeout: Duration,
    /// Skip the detailed fetch when less than this remains of the event deadline.
    pub detail_min_remaining: Duration,
    /// Skip the detailed fetch when the coarse payload already has more markets than this.
    pub max_markets_for_detail: usize,
    /// Sports whose detailed payloads are intrinsically huge; always use the coarse payload.
    pub large_market_sports: Vec<String>,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            max_workers: 5,
            event_timeout: Duration::from_secs(60),
            detail_timeout: Duration::from_secs(15),
            detail_min_remaining: Duration::from_secs(30),
            max_markets_for_detail: 40,
            large_market_sports: vec!["basketball".to_string(), "american_football".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub feed_api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Upstream sport ids polled for odds (SPORT_IDS, comma-separated).
    pub sport_ids: Vec<String>,
    /// Sport keys polled for distributions and volumes (CROWD_SPORTS, comma-separated).
    pub crowd_sports: Vec<String>,
    pub tracker: TrackerPolicy,
    pub classifier: ClassifierPolicy,
    pub fetcher: FetcherPolicy,
    pub ingest: IngestPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut tracker = TrackerPolicy::default();
        tracker.extreme_min_pct = env_parse("SIGNIFICANCE_EXTREME_PCT", tracker.extreme_min_pct)?;
        tracker.high_min_pct = env_parse("SIGNIFICANCE_HIGH_PCT", tracker.high_min_pct)?;
        tracker.price_scale = env_parse("PRICE_SCALE", tracker.price_scale)?;
        if tracker.high_min_pct > tracker.extreme_min_pct {
            return Err(AppError::Config(
                "SIGNIFICANCE_HIGH_PCT must not exceed SIGNIFICANCE_EXTREME_PCT".to_string(),
            ));
        }

        let mut classifier = ClassifierPolicy::default();
        classifier.sharp_money_confidence =
            env_parse("SHARP_MONEY_CONFIDENCE", classifier.sharp_money_confidence)?;
        classifier.value_spot_bias_pp = env_parse("VALUE_SPOT_BIAS_PP", classifier.value_spot_bias_pp)?;
        classifier.big_mover_pct = env_parse("BIG_MOVER_PCT", classifier.big_mover_pct)?;
        classifier.steam_min_moves = env_parse("STEAM_MIN_MOVES", classifier.steam_min_moves)?;
        classifier.alert_ttl = Duration::from_secs(env_parse(
            "ALERT_TTL_SECS",
            classifier.alert_ttl.as_secs(),
        )?);

        let mut fetcher = FetcherPolicy::default();
        fetcher.pace_interval = Duration::from_millis(env_parse(
            "FETCH_PACE_MS",
            fetcher.pace_interval.as_millis() as u64,
        )?);

        let mut ingest = IngestPolicy::default();
        ingest.max_workers = env_parse("INGEST_WORKERS", ingest.max_workers)?;
        if ingest.max_workers == 0 {
            return Err(AppError::Config("INGEST_WORKERS must be at least 1".to_string()));
        }
        ingest.event_timeout = Duration::from_secs(env_parse(
            "EVENT_TIMEOUT_SECS",
            ingest.event_timeout.as_secs(),
        )?);
        if let Ok(raw) = std::env::var("LARGE_MARKET_SPORTS") {
            ingest.large_market_sports = split_list(&raw);
        }

        Ok(Self {
            feed_api_url: std::env::var("FEED_API_URL").unwrap_or_else(|_| FEED_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "sentinel.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            sport_ids: split_list(&std::env::var("SPORT_IDS").unwrap_or_else(|_| "1".to_string())),
            crowd_sports: split_list(
                &std::env::var("CROWD_SPORTS").unwrap_or_else(|_| "football".to_string()),
            ),
            tracker,
            classifier,
            fetcher,
            ingest,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
