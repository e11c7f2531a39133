//! Rolling-window circuit breaker for upstream calls.
//!
//! State machine:
//!
//! - **Closed**: calls flow; outcomes are kept for `window`. When at least
//!   `min_requests` outcomes are in the window and the failure ratio reaches
//!   `failure_ratio`, the breaker opens.
//! - **Open**: calls are rejected until `cooldown` has elapsed.
//! - **HalfOpen**: at most `max_trials` trial calls are admitted at a time.
//!   `successes_to_close` trial successes close the breaker; any trial failure
//!   re-opens it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::FetcherPolicy;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub window: Duration,
    pub min_requests: usize,
    pub failure_ratio: f64,
    pub cooldown: Duration,
    pub max_trials: u32,
    pub successes_to_close: u32,
}

impl From<&FetcherPolicy> for BreakerConfig {
    fn from(p: &FetcherPolicy) -> Self {
        Self {
            window: p.breaker_window,
            min_requests: p.breaker_min_requests,
            failure_ratio: p.breaker_failure_ratio,
            cooldown: p.breaker_cooldown,
            max_trials: p.half_open_max_trials,
            successes_to_close: p.half_open_successes_to_close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// What caused a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    FailureRatio,
    CooldownElapsed,
    TrialSucceeded,
    TrialFailed,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::FailureRatio => "failure_ratio",
            Trigger::CooldownElapsed => "cooldown_elapsed",
            Trigger::TrialSucceeded => "trial_succeeded",
            Trigger::TrialFailed => "trial_failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
enum Inner {
    Closed { outcomes: VecDeque<(Instant, bool)> },
    Open { until: Instant },
    HalfOpen { in_flight: u32, successes: u32 },
}

impl Inner {
    fn state(&self) -> BreakerState {
        match self {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
    trips: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner::Closed { outcomes: VecDeque::new() }),
            trips: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.lock() {
            Ok(inner) => inner.state(),
            Err(poisoned) => poisoned.into_inner().state(),
        }
    }

    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Ask to make a call. Returns false when the call must be rejected.
    pub fn admit(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let admitted = match &mut *inner {
            Inner::Closed { .. } => true,
            Inner::Open { until } => {
                if now >= *until {
                    self.transition(&mut inner, Inner::HalfOpen { in_flight: 1, successes: 0 }, Trigger::CooldownElapsed);
                    true
                } else {
                    false
                }
            }
            Inner::HalfOpen { in_flight, .. } => {
                if *in_flight < self.cfg.max_trials {
                    *in_flight += 1;
                    true
                } else {
                    false
                }
            }
        };
        if !admitted {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match &mut *inner {
            Inner::Closed { outcomes } => {
                outcomes.push_back((now, true));
                prune(outcomes, now, self.cfg.window);
            }
            Inner::HalfOpen { in_flight, successes } => {
                *in_flight = in_flight.saturating_sub(1);
                *successes += 1;
                if *successes >= self.cfg.successes_to_close {
                    self.transition(&mut inner, Inner::Closed { outcomes: VecDeque::new() }, Trigger::TrialSucceeded);
                }
            }
            // Late result from a call admitted before the breaker opened.
            Inner::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match &mut *inner {
            Inner::Closed { outcomes } => {
                outcomes.push_back((now, false));
                prune(outcomes, now, self.cfg.window);
                let total = outcomes.len();
                let failures = outcomes.iter().filter(|(_, ok)| !ok).count();
                if total >= self.cfg.min_requests
                    && failures as f64 / total as f64 >= self.cfg.failure_ratio
                {
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        failures,
                        total,
                        "[BREAKER] failure ratio {failures}/{total} reached, opening for {:?}",
                        self.cfg.cooldown,
                    );
                    let until = now + self.cfg.cooldown;
                    self.transition(&mut inner, Inner::Open { until }, Trigger::FailureRatio);
                }
            }
            Inner::HalfOpen { .. } => {
                self.trips.fetch_add(1, Ordering::Relaxed);
                let until = now + self.cfg.cooldown;
                self.transition(&mut inner, Inner::Open { until }, Trigger::TrialFailed);
            }
            Inner::Open { .. } => {}
        }
    }

    fn transition(&self, inner: &mut Inner, next: Inner, trigger: Trigger) {
        let from = inner.state();
        let to = next.state();
        *inner = next;
        info!(from = %from, to = %to, trigger = %trigger, "[BREAKER] {from} -> {to} ({trigger})");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn prune(outcomes: &mut VecDeque<(Instant, bool)>, now: Instant, window: Duration) {
    while let Some(&(at, _)) = outcomes.front() {
        if now.duration_since(at) > window {
            outcomes.pop_front();
        } else {
            break;
        }
    }
}
