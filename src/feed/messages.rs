use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::types::{CrowdDistribution, CrowdVolume, MarketOdds, OutcomeOdds, SportEvent};

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Wire values that failed to parse since startup.
pub fn parse_failures() -> u64 {
    PARSE_FAILURES.load(Ordering::Relaxed)
}

/// Upstream quotes numbers either as JSON numbers or as strings.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum WireNumber {
    Number(serde_json::Number),
    Text(String),
}

impl WireNumber {
    pub fn to_decimal(&self) -> Option<Decimal> {
        let parsed = match self {
            WireNumber::Number(n) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string())),
            WireNumber::Text(s) => Decimal::from_str(s.trim()),
        };
        match parsed {
            Ok(d) => Some(d),
            Err(_) => {
                PARSE_FAILURES.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

/// Event ids arrive as strings or integers.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum WireId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for WireId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireId::Number(n) => write!(f, "{n}"),
            WireId::Text(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Odds payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WireEventList {
    #[serde(default)]
    pub events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
pub struct WireEvent {
    pub id: WireId,
    pub sport: Option<String>,
    pub home: Option<String>,
    pub away: Option<String>,
    #[serde(alias = "league")]
    pub competition: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<WireMarket>,
}

#[derive(Debug, Deserialize)]
pub struct WireMarket {
    pub code: String,
    pub name: Option<String>,
    #[serde(alias = "line")]
    pub special_value: Option<WireNumber>,
    #[serde(default)]
    pub outcomes: Vec<WireOutcome>,
}

#[derive(Debug, Deserialize)]
pub struct WireOutcome {
    pub name: String,
    pub odds: WireNumber,
}

fn special_value_text(v: &WireNumber) -> String {
    match v {
        WireNumber::Number(n) => n.to_string(),
        WireNumber::Text(s) => s.trim().to_string(),
    }
}

impl WireMarket {
    fn into_market(self) -> MarketOdds {
        let outcomes = self
            .outcomes
            .into_iter()
            .filter_map(|o| {
                let odds = o.odds.to_decimal()?;
                Some(OutcomeOdds { name: o.name, odds })
            })
            .collect();
        MarketOdds {
            name: self.name.unwrap_or_else(|| self.code.clone()),
            special_value: self.special_value.as_ref().map(special_value_text).filter(|s| !s.is_empty()),
            code: self.code,
            outcomes,
        }
    }
}

impl WireEvent {
    /// Events without both team names are dropped.
    pub fn into_event(self, sport_id: &str) -> Option<SportEvent> {
        let external_id = self.id.to_string();
        let home = self.home.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let away = self.away.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let (Some(home_team), Some(away_team)) = (home, away) else {
            warn!(external_id = %external_id, "[FEED] event without team names, dropping");
            return None;
        };
        Some(SportEvent {
            external_id,
            sport_id: sport_id.to_string(),
            sport: self.sport.unwrap_or_else(|| sport_id.to_string()),
            home_team,
            away_team,
            competition_code: self.competition.filter(|c| !c.trim().is_empty()),
            start_time: self.start_time,
            markets: self.markets.into_iter().map(WireMarket::into_market).collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Crowd payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WireDistributionList {
    #[serde(default)]
    pub events: Vec<WireDistributionEvent>,
}

#[derive(Debug, Deserialize)]
pub struct WireDistributionEvent {
    pub event_id: WireId,
    #[serde(default)]
    pub markets: Vec<WireDistributionMarket>,
}

#[derive(Debug, Deserialize)]
pub struct WireDistributionMarket {
    pub code: String,
    pub name: Option<String>,
    #[serde(alias = "line")]
    pub special_value: Option<WireNumber>,
    #[serde(default)]
    pub outcomes: Vec<WireShare>,
}

#[derive(Debug, Deserialize)]
pub struct WireShare {
    pub name: String,
    pub pct: WireNumber,
}

impl WireDistributionList {
    /// Flatten event → market → outcome into one row per outcome.
    pub fn flatten(self) -> Vec<CrowdDistribution> {
        let mut out = Vec::new();
        for event in self.events {
            let external_id = event.event_id.to_string();
            for market in event.markets {
                let special = market.special_value.as_ref().map(special_value_text).filter(|s| !s.is_empty());
                let name = market.name.clone().unwrap_or_else(|| market.code.clone());
                for share in market.outcomes {
                    let Some(bet_pct) = share.pct.to_decimal() else { continue };
                    out.push(CrowdDistribution {
                        external_id: external_id.clone(),
                        market_code: market.code.clone(),
                        market_name: name.clone(),
                        special_value: special.clone(),
                        outcome: share.name,
                        bet_pct,
                    });
                }
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
pub struct WireVolumeList {
    #[serde(default)]
    pub events: Vec<WireVolume>,
}

#[derive(Debug, Deserialize)]
pub struct WireVolume {
    pub event_id: WireId,
    pub pct: WireNumber,
}

impl WireVolumeList {
    pub fn into_volumes(self) -> Vec<CrowdVolume> {
        self.events
            .into_iter()
            .filter_map(|v| {
                Some(CrowdVolume {
                    volume_pct: v.pct.to_decimal()?,
                    external_id: v.event_id.to_string(),
                })
            })
            .collect()
    }
}
