//! Database row types for the SQLite schema in `migrations/`.
//! Prices and percentages are stored as TEXT and parsed back into `Decimal`
//! here, so the core never sees a platform-specific numeric type.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{AppError, Result};
use crate::types::{
    AlertType, EventRecord, EventVolume, MarketFamily, MarketType, MovementAlert, OddsHistoryRecord,
    OddsSnapshot, OutcomeDistribution, Severity, SignificanceLevel,
};

pub fn parse_decimal(column: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| {
        AppError::Database(sqlx::Error::Decode(format!("{column}: {e} ({raw:?})").into()))
    })
}

fn parse_opt_decimal(column: &str, raw: Option<&str>) -> Result<Option<Decimal>> {
    raw.map(|r| parse_decimal(column, r)).transpose()
}

#[derive(Debug, sqlx::FromRow)]
pub struct MarketTypeRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub family: String,
}

impl From<MarketTypeRow> for MarketType {
    fn from(r: MarketTypeRow) -> Self {
        MarketType {
            id: r.id,
            code: r.code,
            name: r.name,
            family: MarketFamily::parse(&r.family),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct EventRow {
    pub id: i64,
    pub external_id: String,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub league_id: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
}

impl From<EventRow> for EventRecord {
    fn from(r: EventRow) -> Self {
        EventRecord {
            id: r.id,
            external_id: r.external_id,
            sport: r.sport,
            home_team: r.home_team,
            away_team: r.away_team,
            league_id: r.league_id,
            start_time: r.start_time,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct SnapshotRow {
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
    pub current: String,
    pub opening: String,
    pub highest: String,
    pub lowest: String,
    pub previous: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for OddsSnapshot {
    type Error = AppError;

    fn try_from(r: SnapshotRow) -> Result<Self> {
        Ok(OddsSnapshot {
            current: parse_decimal("current", &r.current)?,
            opening: parse_decimal("opening", &r.opening)?,
            highest: parse_decimal("highest", &r.highest)?,
            lowest: parse_decimal("lowest", &r.lowest)?,
            previous: parse_opt_decimal("previous", r.previous.as_deref())?,
            event_id: r.event_id,
            market_type_id: r.market_type_id,
            outcome: r.outcome,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct HistoryRow {
    pub id: i64,
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
    pub value: String,
    pub previous_value: String,
    pub change: String,
    pub change_pct: String,
    pub multiplier: String,
    pub significance: String,
    pub is_reverse_movement: bool,
    pub minutes_to_kickoff: Option<i64>,
    pub market_params: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for OddsHistoryRecord {
    type Error = AppError;

    fn try_from(r: HistoryRow) -> Result<Self> {
        Ok(OddsHistoryRecord {
            id: Some(r.id),
            value: parse_decimal("value", &r.value)?,
            previous_value: parse_decimal("previous_value", &r.previous_value)?,
            change: parse_decimal("change", &r.change)?,
            change_pct: parse_decimal("change_pct", &r.change_pct)?,
            multiplier: parse_decimal("multiplier", &r.multiplier)?,
            significance: SignificanceLevel::parse(&r.significance),
            event_id: r.event_id,
            market_type_id: r.market_type_id,
            outcome: r.outcome,
            is_reverse_movement: r.is_reverse_movement,
            minutes_to_kickoff: r.minutes_to_kickoff,
            market_params: r.market_params,
            observed_at: r.observed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct DistributionRow {
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
    pub bet_pct: String,
    pub implied_probability: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DistributionRow> for OutcomeDistribution {
    type Error = AppError;

    fn try_from(r: DistributionRow) -> Result<Self> {
        Ok(OutcomeDistribution {
            bet_pct: parse_decimal("bet_pct", &r.bet_pct)?,
            implied_probability: parse_opt_decimal("implied_probability", r.implied_probability.as_deref())?,
            event_id: r.event_id,
            market_type_id: r.market_type_id,
            outcome: r.outcome,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct VolumeRow {
    pub event_id: i64,
    pub volume_pct: String,
    pub rank: i64,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<VolumeRow> for EventVolume {
    type Error = AppError;

    fn try_from(r: VolumeRow) -> Result<Self> {
        Ok(EventVolume {
            event_id: r.event_id,
            volume_pct: parse_decimal("volume_pct", &r.volume_pct)?,
            rank: u32::try_from(r.rank).unwrap_or(u32::MAX),
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct AlertRow {
    pub id: i64,
    pub history_id: i64,
    pub event_id: i64,
    pub market_type_id: i64,
    pub outcome: String,
    pub alert_type: String,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub change_pct: String,
    pub multiplier: String,
    pub confidence: f64,
    pub minutes_to_kickoff: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl TryFrom<AlertRow> for MovementAlert {
    type Error = AppError;

    fn try_from(r: AlertRow) -> Result<Self> {
        let alert_type = AlertType::parse(&r.alert_type).ok_or_else(|| {
            AppError::Database(sqlx::Error::Decode(format!("unknown alert_type {:?}", r.alert_type).into()))
        })?;
        Ok(MovementAlert {
            id: Some(r.id),
            alert_type,
            severity: Severity::parse(&r.severity),
            change_pct: parse_decimal("change_pct", &r.change_pct)?,
            multiplier: parse_decimal("multiplier", &r.multiplier)?,
            history_id: r.history_id,
            event_id: r.event_id,
            market_type_id: r.market_type_id,
            outcome: r.outcome,
            title: r.title,
            message: r.message,
            confidence: r.confidence,
            minutes_to_kickoff: r.minutes_to_kickoff,
            created_at: r.created_at,
            expires_at: r.expires_at,
            active: r.active,
        })
    }
}
