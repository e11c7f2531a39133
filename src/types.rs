use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Feed-side event data (already decoded from the wire)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeOdds {
    pub name: String,
    /// Decimal odds as quoted upstream.
    pub odds: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOdds {
    /// Upstream market code, e.g. "1x2", "total", "asian_handicap".
    pub code: String,
    pub name: String,
    /// Line or handicap, e.g. "2.5" or "-1". Absent for plain markets.
    pub special_value: Option<String>,
    pub outcomes: Vec<OutcomeOdds>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SportEvent {
    pub external_id: String,
    pub sport_id: String,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub competition_code: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub markets: Vec<MarketOdds>,
}

/// One outcome's share of bets, as reported by the crowd feed.
#[derive(Debug, Clone, PartialEq)]
pub struct CrowdDistribution {
    pub external_id: String,
    pub market_code: String,
    pub market_name: String,
    pub special_value: Option<String>,
    pub outcome: String,
    pub bet_pct: Decimal,
}

/// One event's share of all bets placed in its sport.
#[derive(Debug, Clone, PartialEq)]
pub struct CrowdVolume {
    pub external_id: String,
    pub volume_pct: Decimal,
}

// ---------------------------------------------------------------------------
// Persisted reference data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketFamily {
    MatchResult,
    OverUnder,
    Handicap,
    Other,
}

impl MarketFamily {
    /// Derive the family from the upstream code, falling back to the display name.
    pub fn classify(code: &str, name: &str) -> Self {
        let haystack = format!("{} {}", code.to_lowercase(), name.to_lowercase());
        if code.eq_ignore_ascii_case("ou")
            || haystack.contains("total")
            || haystack.contains("over")
            || haystack.contains("under")
        {
            MarketFamily::OverUnder
        } else if haystack.contains("handicap") || haystack.contains("spread") || code.eq_ignore_ascii_case("ah") {
            MarketFamily::Handicap
        } else if haystack.contains("1x2")
            || haystack.contains("match_result")
            || haystack.contains("match result")
            || haystack.contains("moneyline")
            || haystack.contains("full time result")
        {
            MarketFamily::MatchResult
        } else {
            MarketFamily::Other
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "match_result" => MarketFamily::MatchResult,
            "over_under" => MarketFamily::OverUnder,
            "handicap" => MarketFamily::Handicap,
            _ => MarketFamily::Other,
        }
    }
}

impl std::fmt::Display for MarketFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketFamily::MatchResult => "match_result",
            MarketFamily::OverUnder => "over_under",
            MarketFamily::Handicap => "handicap",
            MarketFamily::Other => "other",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketType {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub family: MarketFamily,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub external_id: String,
    pub sport: String,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub league_id: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub external_id: String,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub league_id: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Odds state
// ---------------------------------------------------------------------------

/// Identity of one tracked price: (event, market type, canonical outcome label).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OddsKey {
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OddsSnapshot {
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
    pub current: Decimal,
    pub opening: Decimal,
    pub highest: Decimal,
    pub lowest: Decimal,
    /// Value immediately before `current`. None until the first real movement.
    pub previous: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl OddsSnapshot {
    pub fn first_sighting(key: OddsKey, value: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            event_id: key.event_id,
            market_type_id: key.market_type_id,
            outcome: key.outcome,
            current: value,
            opening: value,
            highest: value,
            lowest: value,
            previous: None,
            updated_at: at,
        }
    }

    pub fn key(&self) -> OddsKey {
        OddsKey {
            event_id: self.event_id,
            market_type_id: self.market_type_id,
            outcome: self.outcome.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignificanceLevel {
    Normal,
    High,
    Extreme,
}

impl SignificanceLevel {
    /// Bucket an absolute percentage change. Boundaries are inclusive lower bounds.
    pub fn from_change_pct(pct: Decimal, high_min: Decimal, extreme_min: Decimal) -> Self {
        let magnitude = pct.abs();
        if magnitude >= extreme_min {
            SignificanceLevel::Extreme
        } else if magnitude >= high_min {
            SignificanceLevel::High
        } else {
            SignificanceLevel::Normal
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "extreme" => SignificanceLevel::Extreme,
            "high" => SignificanceLevel::High,
            _ => SignificanceLevel::Normal,
        }
    }
}

impl std::fmt::Display for SignificanceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignificanceLevel::Normal => "normal",
            SignificanceLevel::High => "high",
            SignificanceLevel::Extreme => "extreme",
        };
        write!(f, "{s}")
    }
}

/// One significant price change. `id` is None until persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OddsHistoryRecord {
    pub id: Option<i64>,
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
    pub value: Decimal,
    pub previous_value: Decimal,
    /// Signed: positive when the price lengthened.
    pub change: Decimal,
    pub change_pct: Decimal,
    pub multiplier: Decimal,
    pub significance: SignificanceLevel,
    pub is_reverse_movement: bool,
    /// Negative once the event has kicked off.
    pub minutes_to_kickoff: Option<i64>,
    pub market_params: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl OddsHistoryRecord {
    pub fn key(&self) -> OddsKey {
        OddsKey {
            event_id: self.event_id,
            market_type_id: self.market_type_id,
            outcome: self.outcome.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Crowd-side signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeDistribution {
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
    /// Share of bets on this outcome, 0–100.
    pub bet_pct: Decimal,
    /// `100 / current odds`, when a snapshot exists.
    pub implied_probability: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl OutcomeDistribution {
    pub fn key(&self) -> OddsKey {
        OddsKey {
            event_id: self.event_id,
            market_type_id: self.market_type_id,
            outcome: self.outcome.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistributionHistory {
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
    pub previous_pct: Option<Decimal>,
    pub bet_pct: Decimal,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventVolume {
    pub event_id: i64,
    pub volume_pct: Decimal,
    /// 1 = most bet event of the cycle.
    pub rank: u32,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    BigMover,
    ReverseLine,
    SharpMoney,
    ValueSpot,
    SteamMove,
}

impl AlertType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "big_mover" => Some(AlertType::BigMover),
            "reverse_line" => Some(AlertType::ReverseLine),
            "sharp_money" => Some(AlertType::SharpMoney),
            "value_spot" => Some(AlertType::ValueSpot),
            "steam_move" => Some(AlertType::SteamMove),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertType::BigMover => "big_mover",
            AlertType::ReverseLine => "reverse_line",
            AlertType::SharpMoney => "sharp_money",
            AlertType::ValueSpot => "value_spot",
            AlertType::SteamMove => "steam_move",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Severity::Critical
        } else if confidence >= 0.6 {
            Severity::High
        } else if confidence >= 0.4 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Public betting share relative to the direction of a price move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeDirection {
    /// Money and price disagree: evidence of informed money.
    AgainstMovement,
    WithMovement,
    Neutral,
}

impl std::fmt::Display for VolumeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeDirection::AgainstMovement => write!(f, "against_movement"),
            VolumeDirection::WithMovement => write!(f, "with_movement"),
            VolumeDirection::Neutral => write!(f, "neutral"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementAlert {
    pub id: Option<i64>,
    pub history_id: i64,
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub change_pct: Decimal,
    pub multiplier: Decimal,
    pub confidence: f64,
    pub minutes_to_kickoff: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

/// Read-side filter: active alerts of a type with confidence at or above a floor, newest first.
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub alert_type: Option<AlertType>,
    pub min_confidence: f64,
    pub limit: i64,
}
