use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use super::models::{AlertRow, DistributionRow, EventRow, HistoryRow, MarketTypeRow, SnapshotRow, VolumeRow};
use super::{AlertStore, CrowdStore, EventStore, MarketTypeStore, OddsStore};
use crate::config::WRITE_CHUNK_SIZE;
use crate::error::Result;
use crate::types::{
    AlertQuery, DistributionHistory, EventRecord, EventVolume, MarketFamily, MarketType,
    MovementAlert, NewEvent, OddsHistoryRecord, OddsKey, OddsSnapshot, OutcomeDistribution,
};

const HISTORY_COLUMNS: &str = "id, event_id, market_type_id, outcome, value, previous_value, change, \
     change_pct, multiplier, significance, is_reverse_movement, minutes_to_kickoff, market_params, observed_at";

const ALERT_COLUMNS: &str = "id, history_id, event_id, market_type_id, outcome, alert_type, severity, \
     title, message, change_pct, multiplier, confidence, minutes_to_kickoff, created_at, expires_at, active";

/// SQLite adapter. All bulk writes are single multi-row statements built with
/// `QueryBuilder`; callers are expected to chunk.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and run migrations.
    pub async fn connect(path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?.create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready at {path}");
        Ok(Self { pool })
    }

    /// Private in-memory database. A single long-lived connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Leagues are reference data owned by an external process; exposed for seeding.
    pub async fn insert_league(&self, sport: &str, competition_code: &str, name: Option<&str>) -> Result<i64> {
        sqlx::query(
            "INSERT INTO leagues (sport, competition_code, name) VALUES (?, ?, ?) \
             ON CONFLICT (sport, competition_code) DO NOTHING",
        )
        .bind(sport)
        .bind(competition_code)
        .bind(name)
        .execute(&self.pool)
        .await?;
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM leagues WHERE sport = ? AND competition_code = ?")
            .bind(sport)
            .bind(competition_code)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }
}

fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    qb.push(" (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(*id);
    }
    sep.push_unseparated(")");
}

// ---------------------------------------------------------------------------
// Events and reference data
// ---------------------------------------------------------------------------

#[async_trait]
impl EventStore for SqliteStore {
    async fn upsert_team(&self, sport: &str, name: &str) -> Result<i64> {
        sqlx::query("INSERT INTO teams (sport, name) VALUES (?, ?) ON CONFLICT (sport, name) DO NOTHING")
            .bind(sport)
            .bind(name)
            .execute(&self.pool)
            .await?;
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM teams WHERE sport = ? AND name = ?")
            .bind(sport)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn find_league(&self, sport: &str, competition_code: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM leagues WHERE sport = ? AND competition_code = ?")
            .bind(sport)
            .bind(competition_code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn upsert_event(&self, event: &NewEvent) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO events (external_id, sport, home_team_id, away_team_id, league_id, start_time, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (external_id) DO UPDATE SET
                home_team_id = excluded.home_team_id,
                away_team_id = excluded.away_team_id,
                league_id    = COALESCE(excluded.league_id, events.league_id),
                start_time   = COALESCE(excluded.start_time, events.start_time),
                updated_at   = excluded.updated_at
            "#,
        )
        .bind(&event.external_id)
        .bind(&event.sport)
        .bind(event.home_team_id)
        .bind(event.away_team_id)
        .bind(event.league_id)
        .bind(event.start_time)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM events WHERE external_id = ?")
            .bind(&event.external_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn find_event(&self, event_id: i64) -> Result<Option<EventRecord>> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT e.id, e.external_id, e.sport, h.name AS home_team, a.name AS away_team,
                   e.league_id, e.start_time
            FROM events e
            JOIN teams h ON h.id = e.home_team_id
            JOIN teams a ON a.id = e.away_team_id
            WHERE e.id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EventRecord::from))
    }

    async fn event_ids_by_external(&self, external_ids: &[String]) -> Result<HashMap<String, i64>> {
        let mut out = HashMap::with_capacity(external_ids.len());
        for chunk in external_ids.chunks(WRITE_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT external_id, id FROM events WHERE external_id IN (");
            let mut sep = qb.separated(", ");
            for ext in chunk {
                sep.push_bind(ext.clone());
            }
            sep.push_unseparated(")");
            let rows: Vec<(String, i64)> = qb.build_query_as().fetch_all(&self.pool).await?;
            out.extend(rows);
        }
        Ok(out)
    }
}

#[async_trait]
impl MarketTypeStore for SqliteStore {
    async fn find_market_type(&self, code: &str) -> Result<Option<MarketType>> {
        let row = sqlx::query_as::<_, MarketTypeRow>("SELECT id, code, name, family FROM market_types WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(MarketType::from))
    }

    async fn insert_market_type(&self, code: &str, name: &str, family: MarketFamily) -> Result<MarketType> {
        sqlx::query("INSERT INTO market_types (code, name, family) VALUES (?, ?, ?) ON CONFLICT (code) DO NOTHING")
            .bind(code)
            .bind(name)
            .bind(family.to_string())
            .execute(&self.pool)
            .await?;
        let row = sqlx::query_as::<_, MarketTypeRow>("SELECT id, code, name, family FROM market_types WHERE code = ?")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn load_market_types(&self) -> Result<Vec<MarketType>> {
        let rows = sqlx::query_as::<_, MarketTypeRow>("SELECT id, code, name, family FROM market_types ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(MarketType::from).collect())
    }
}

// ---------------------------------------------------------------------------
// Odds
// ---------------------------------------------------------------------------

#[async_trait]
impl OddsStore for SqliteStore {
    async fn fetch_snapshots(&self, event_ids: &[i64]) -> Result<Vec<OddsSnapshot>> {
        let mut out = Vec::new();
        for chunk in event_ids.chunks(WRITE_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT event_id, market_type_id, outcome, current, opening, highest, lowest, previous, updated_at \
                 FROM odds_current WHERE event_id IN",
            );
            push_id_list(&mut qb, chunk);
            let rows: Vec<SnapshotRow> = qb.build_query_as().fetch_all(&self.pool).await?;
            for row in rows {
                out.push(OddsSnapshot::try_from(row)?);
            }
        }
        Ok(out)
    }

    async fn upsert_snapshots(&self, rows: &[OddsSnapshot]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO odds_current (event_id, market_type_id, outcome, current, opening, highest, lowest, previous, updated_at) ",
        );
        qb.push_values(rows, |mut b, s| {
            b.push_bind(s.event_id)
                .push_bind(s.market_type_id)
                .push_bind(s.outcome.clone())
                .push_bind(s.current.to_string())
                .push_bind(s.opening.to_string())
                .push_bind(s.highest.to_string())
                .push_bind(s.lowest.to_string())
                .push_bind(s.previous.map(|p| p.to_string()))
                .push_bind(s.updated_at);
        });
        qb.push(
            " ON CONFLICT (event_id, market_type_id, outcome) DO UPDATE SET \
             current = excluded.current, highest = excluded.highest, lowest = excluded.lowest, \
             previous = excluded.previous, updated_at = excluded.updated_at",
        );
        let done = qb.build().execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn insert_history(&self, rows: &[OddsHistoryRecord]) -> Result<Vec<OddsHistoryRecord>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO odds_history (event_id, market_type_id, outcome, value, previous_value, change, \
             change_pct, multiplier, significance, is_reverse_movement, minutes_to_kickoff, market_params, observed_at) ",
        );
        qb.push_values(rows, |mut b, h| {
            b.push_bind(h.event_id)
                .push_bind(h.market_type_id)
                .push_bind(h.outcome.clone())
                .push_bind(h.value.to_string())
                .push_bind(h.previous_value.to_string())
                .push_bind(h.change.to_string())
                .push_bind(h.change_pct.to_string())
                .push_bind(h.multiplier.to_string())
                .push_bind(h.significance.to_string())
                .push_bind(h.is_reverse_movement)
                .push_bind(h.minutes_to_kickoff)
                .push_bind(h.market_params.clone())
                .push_bind(h.observed_at);
        });
        qb.push(" RETURNING ");
        qb.push(HISTORY_COLUMNS);
        let inserted: Vec<HistoryRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut out = inserted
            .into_iter()
            .map(OddsHistoryRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified; ids follow insertion order.
        out.sort_by_key(|h| h.id);
        Ok(out)
    }

    async fn recent_history(&self, key: &OddsKey, since: DateTime<Utc>) -> Result<Vec<OddsHistoryRecord>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM odds_history \
             WHERE event_id = ? AND market_type_id = ? AND outcome = ? AND observed_at >= ? \
             ORDER BY observed_at, id"
        );
        let rows = sqlx::query_as::<_, HistoryRow>(&sql)
            .bind(key.event_id)
            .bind(key.market_type_id)
            .bind(&key.outcome)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OddsHistoryRecord::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// Crowd signals
// ---------------------------------------------------------------------------

#[async_trait]
impl CrowdStore for SqliteStore {
    async fn fetch_distributions(&self, event_ids: &[i64]) -> Result<Vec<OutcomeDistribution>> {
        let mut out = Vec::new();
        for chunk in event_ids.chunks(WRITE_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT event_id, market_type_id, outcome, bet_pct, implied_probability, updated_at \
                 FROM outcome_distributions WHERE event_id IN",
            );
            push_id_list(&mut qb, chunk);
            let rows: Vec<DistributionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
            for row in rows {
                out.push(OutcomeDistribution::try_from(row)?);
            }
        }
        Ok(out)
    }

    async fn upsert_distributions(&self, rows: &[OutcomeDistribution]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO outcome_distributions (event_id, market_type_id, outcome, bet_pct, implied_probability, updated_at) ",
        );
        qb.push_values(rows, |mut b, d| {
            b.push_bind(d.event_id)
                .push_bind(d.market_type_id)
                .push_bind(d.outcome.clone())
                .push_bind(d.bet_pct.to_string())
                .push_bind(d.implied_probability.map(|p| p.to_string()))
                .push_bind(d.updated_at);
        });
        qb.push(
            " ON CONFLICT (event_id, market_type_id, outcome) DO UPDATE SET \
             bet_pct = excluded.bet_pct, implied_probability = excluded.implied_probability, \
             updated_at = excluded.updated_at",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn insert_distribution_history(&self, rows: &[DistributionHistory]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO distribution_history (event_id, market_type_id, outcome, previous_pct, bet_pct, recorded_at) ",
        );
        qb.push_values(rows, |mut b, d| {
            b.push_bind(d.event_id)
                .push_bind(d.market_type_id)
                .push_bind(d.outcome.clone())
                .push_bind(d.previous_pct.map(|p| p.to_string()))
                .push_bind(d.bet_pct.to_string())
                .push_bind(d.recorded_at);
        });
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn upsert_volumes(&self, rows: &[EventVolume]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO event_volumes (event_id, volume_pct, rank, updated_at) ");
        qb.push_values(rows, |mut b, v| {
            b.push_bind(v.event_id)
                .push_bind(v.volume_pct.to_string())
                .push_bind(i64::from(v.rank))
                .push_bind(v.updated_at);
        });
        qb.push(
            " ON CONFLICT (event_id) DO UPDATE SET \
             volume_pct = excluded.volume_pct, rank = excluded.rank, updated_at = excluded.updated_at",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn insert_volume_history(&self, rows: &[EventVolume]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO volume_history (event_id, volume_pct, rank, recorded_at) ");
        qb.push_values(rows, |mut b, v| {
            b.push_bind(v.event_id)
                .push_bind(v.volume_pct.to_string())
                .push_bind(i64::from(v.rank))
                .push_bind(v.updated_at);
        });
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn find_volume(&self, event_id: i64) -> Result<Option<EventVolume>> {
        let row = sqlx::query_as::<_, VolumeRow>(
            "SELECT event_id, volume_pct, rank, updated_at FROM event_volumes WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EventVolume::try_from).transpose()
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[async_trait]
impl AlertStore for SqliteStore {
    async fn insert_alert(&self, alert: &MovementAlert) -> Result<Option<i64>> {
        let done = sqlx::query(
            r#"
            INSERT OR IGNORE INTO movement_alerts (
                history_id, event_id, market_type_id, outcome, alert_type, severity,
                title, message, change_pct, multiplier, confidence, minutes_to_kickoff,
                created_at, expires_at, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.history_id)
        .bind(alert.event_id)
        .bind(alert.market_type_id)
        .bind(&alert.outcome)
        .bind(alert.alert_type.to_string())
        .bind(alert.severity.to_string())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(alert.change_pct.to_string())
        .bind(alert.multiplier.to_string())
        .bind(alert.confidence)
        .bind(alert.minutes_to_kickoff)
        .bind(alert.created_at)
        .bind(alert.expires_at)
        .bind(alert.active)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(done.last_insert_rowid()))
    }

    async fn active_alerts(&self, query: &AlertQuery) -> Result<Vec<MovementAlert>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ALERT_COLUMNS} FROM movement_alerts WHERE active = 1 AND confidence >= "
        ));
        qb.push_bind(query.min_confidence);
        if let Some(t) = query.alert_type {
            qb.push(" AND alert_type = ").push_bind(t.to_string());
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ").push_bind(query.limit);
        let rows: Vec<AlertRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(MovementAlert::try_from).collect()
    }

    async fn expire_alerts(&self, now: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query("UPDATE movement_alerts SET active = 0 WHERE active = 1 AND expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}
