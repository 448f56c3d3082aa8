pub mod seed;
pub use seed::seed_default_overrides;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::models::*;
use crate::services::team_matcher::{ClearedBinding, OverrideTable};

pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    // Strip the "sqlite:" prefix to get the file path, create parent dir if needed
    let file_path = database_url
        .strip_prefix("sqlite:///")
        .or_else(|| database_url.strip_prefix("sqlite://"))
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);

    if let Some(parent) = std::path::Path::new(file_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory database (each sqlite memory connection is
/// its own database, so the pool must not open a second one).
pub async fn create_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

/// Called from the CLI where no pool exists yet.
pub async fn init_database(database_url: &str) -> Result<()> {
    let pool = create_pool(database_url).await?;
    init_database_with_pool(&pool).await?;
    seed_default_overrides(&pool).await
}

pub async fn init_database_with_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS team_ratings (
            season TEXT NOT NULL,
            team_name TEXT NOT NULL COLLATE NOCASE,
            source_name TEXT NOT NULL,
            alternate_names TEXT,
            rating REAL NOT NULL,
            initial_rating REAL NOT NULL,
            games_processed INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL,
            conference TEXT,
            PRIMARY KEY (season, team_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS game_adjustments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            season TEXT NOT NULL,
            game_id TEXT NOT NULL,
            date TEXT NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            is_neutral_site INTEGER NOT NULL,
            home_rating_before REAL NOT NULL,
            away_rating_before REAL NOT NULL,
            projected_spread REAL NOT NULL,
            closing_spread REAL NOT NULL,
            closing_source TEXT NOT NULL,
            difference REAL NOT NULL,
            adjustment REAL NOT NULL,
            home_rating_after REAL NOT NULL,
            away_rating_after REAL NOT NULL,
            UNIQUE (run_id, game_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ratings_snapshots: append-only, full state serialized as JSON
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ratings_snapshots (
            id TEXT PRIMARY KEY,
            season TEXT NOT NULL,
            as_of_date TEXT NOT NULL,
            home_court_advantage REAL NOT NULL,
            closing_source TEXT NOT NULL,
            games_processed INTEGER NOT NULL,
            teams TEXT NOT NULL,
            adjustments TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS team_overrides (
            source_name TEXT PRIMARY KEY COLLATE NOCASE,
            canonical_name TEXT NOT NULL,
            espn_name TEXT,
            odds_api_name TEXT,
            sbr_name TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS games (
            id TEXT PRIMARY KEY,
            season TEXT NOT NULL,
            date TEXT NOT NULL,
            commence_time TEXT NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            venue TEXT,
            event_name TEXT,
            neutral_site INTEGER,
            home_score INTEGER,
            away_score INTEGER,
            status TEXT NOT NULL DEFAULT 'scheduled',
            opening_spread REAL,
            opening_source TEXT,
            opening_lookback_hours INTEGER,
            opening_status TEXT,
            opening_attempted_at TEXT,
            closing_spread REAL,
            closing_source TEXT,
            adjusted_run_id TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // databases created before opening-line attempts were tracked
    ensure_column(pool, "games", "opening_status", "TEXT").await?;
    ensure_column(pool, "games", "opening_attempted_at", "TEXT").await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_season_date ON games(season, date)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_adjustments_season_date ON game_adjustments(season, date)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_season ON ratings_snapshots(season)")
        .execute(pool)
        .await?;

    tracing::info!("Database initialized successfully");
    Ok(())
}

async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, decl: &str) -> Result<()> {
    let present: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(pool)
        .await?;
    if present == 0 {
        tracing::info!("Adding column {}.{}", table, column);
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
            .execute(pool)
            .await?;
    }
    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_ts(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| EngineError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn parse_date(raw: &str) -> EngineResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| EngineError::Corrupt(format!("date '{}': {}", raw, e)))
}

fn parse_source(raw: &str) -> EngineResult<LineSource> {
    raw.parse().map_err(|_| EngineError::Corrupt(format!("line source '{}'", raw)))
}

fn to_json<T: Serialize>(value: &T) -> EngineResult<String> {
    serde_json::to_string(value).map_err(|e| EngineError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> EngineResult<T> {
    serde_json::from_str(raw).map_err(|e| EngineError::Corrupt(e.to_string()))
}

// ── Team ratings ─────────────────────────────────────────────────────────────

pub async fn upsert_team_rating<'e, E>(executor: E, season: &str, team: &TeamRating) -> EngineResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let alternates = team.alternate_names.as_ref().map(to_json).transpose()?;
    sqlx::query(
        r#"
        INSERT INTO team_ratings
        (season, team_name, source_name, alternate_names, rating, initial_rating, games_processed, last_updated, conference)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(season, team_name) DO UPDATE SET
            source_name     = excluded.source_name,
            alternate_names = excluded.alternate_names,
            rating          = excluded.rating,
            games_processed = MAX(team_ratings.games_processed, excluded.games_processed),
            last_updated    = excluded.last_updated,
            conference      = excluded.conference
        "#,
    )
    .bind(season)
    .bind(&team.team_name)
    .bind(&team.source_name)
    .bind(alternates)
    .bind(team.rating)
    .bind(team.initial_rating)
    .bind(team.games_processed as i64)
    .bind(fmt_ts(team.last_updated))
    .bind(&team.conference)
    .execute(executor)
    .await?;
    Ok(())
}

fn team_from_row(row: &SqliteRow) -> EngineResult<TeamRating> {
    let alternates: Option<String> = row.get("alternate_names");
    Ok(TeamRating {
        team_name: row.get("team_name"),
        source_name: row.get("source_name"),
        alternate_names: alternates.as_deref().map(from_json).transpose()?,
        rating: row.get("rating"),
        initial_rating: row.get("initial_rating"),
        games_processed: row.get::<i64, _>("games_processed").max(0) as u32,
        last_updated: parse_ts(&row.get::<String, _>("last_updated"))?,
        conference: row.get("conference"),
    })
}

pub async fn get_team_ratings(pool: &SqlitePool, season: &str) -> EngineResult<Vec<TeamRating>> {
    let rows = sqlx::query("SELECT * FROM team_ratings WHERE season = ? ORDER BY rating DESC, team_name")
        .bind(season)
        .fetch_all(pool)
        .await?;
    rows.iter().map(team_from_row).collect()
}

pub async fn get_team_rating(pool: &SqlitePool, season: &str, team_name: &str) -> EngineResult<Option<TeamRating>> {
    let row = sqlx::query("SELECT * FROM team_ratings WHERE season = ? AND team_name = ?")
        .bind(season)
        .bind(team_name)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(team_from_row).transpose()
}

pub async fn count_team_ratings(pool: &SqlitePool, season: &str) -> EngineResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM team_ratings WHERE season = ?")
        .bind(season)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn delete_season_ratings(pool: &SqlitePool, season: &str) -> EngineResult<u64> {
    let result = sqlx::query("DELETE FROM team_ratings WHERE season = ?")
        .bind(season)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ── Game adjustments ─────────────────────────────────────────────────────────

pub async fn insert_game_adjustment<'e, E>(executor: E, season: &str, adj: &GameAdjustment) -> EngineResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO game_adjustments
        (run_id, season, game_id, date, home_team, away_team, is_neutral_site,
         home_rating_before, away_rating_before, projected_spread, closing_spread, closing_source,
         difference, adjustment, home_rating_after, away_rating_after)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&adj.run_id)
    .bind(season)
    .bind(&adj.game_id)
    .bind(fmt_date(adj.date))
    .bind(&adj.home_team)
    .bind(&adj.away_team)
    .bind(adj.is_neutral_site)
    .bind(adj.home_rating_before)
    .bind(adj.away_rating_before)
    .bind(adj.projected_spread)
    .bind(adj.closing_spread)
    .bind(adj.closing_source.as_str())
    .bind(adj.difference)
    .bind(adj.adjustment)
    .bind(adj.home_rating_after)
    .bind(adj.away_rating_after)
    .execute(executor)
    .await?;
    Ok(())
}

/// Adjustments for a season, optionally bounded by date (inclusive).
pub async fn get_game_adjustments(
    pool: &SqlitePool,
    season: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> EngineResult<Vec<GameAdjustment>> {
    let rows = sqlx::query(
        r#"SELECT * FROM game_adjustments
           WHERE season = ? AND date >= ? AND date <= ?
           ORDER BY date ASC, id ASC"#,
    )
    .bind(season)
    .bind(from.map(fmt_date).unwrap_or_else(|| "0000-01-01".to_string()))
    .bind(to.map(fmt_date).unwrap_or_else(|| "9999-12-31".to_string()))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(GameAdjustment {
                run_id: row.get("run_id"),
                game_id: row.get("game_id"),
                date: parse_date(&row.get::<String, _>("date"))?,
                home_team: row.get("home_team"),
                away_team: row.get("away_team"),
                is_neutral_site: row.get("is_neutral_site"),
                home_rating_before: row.get("home_rating_before"),
                away_rating_before: row.get("away_rating_before"),
                projected_spread: row.get("projected_spread"),
                closing_spread: row.get("closing_spread"),
                closing_source: parse_source(&row.get::<String, _>("closing_source"))?,
                difference: row.get("difference"),
                adjustment: row.get("adjustment"),
                home_rating_after: row.get("home_rating_after"),
                away_rating_after: row.get("away_rating_after"),
            })
        })
        .collect()
}

// ── Snapshots ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub as_of_date: NaiveDate,
    pub games_processed: i64,
    pub home_court_advantage: f64,
    pub closing_source: String,
    pub created_at: DateTime<Utc>,
}

pub async fn insert_snapshot(pool: &SqlitePool, snapshot: &RatingsSnapshot) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ratings_snapshots
        (id, season, as_of_date, home_court_advantage, closing_source, games_processed, teams, adjustments, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&snapshot.id)
    .bind(&snapshot.season)
    .bind(fmt_date(snapshot.as_of_date))
    .bind(snapshot.home_court_advantage)
    .bind(snapshot.closing_source.to_string())
    .bind(snapshot.games_processed as i64)
    .bind(to_json(&snapshot.teams)?)
    .bind(to_json(&snapshot.adjustments)?)
    .bind(fmt_ts(snapshot.created_at))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn latest_snapshot(pool: &SqlitePool, season: &str) -> EngineResult<Option<RatingsSnapshot>> {
    let row = sqlx::query("SELECT * FROM ratings_snapshots WHERE season = ? ORDER BY rowid DESC LIMIT 1")
        .bind(season)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(RatingsSnapshot {
        id: row.get("id"),
        season: row.get("season"),
        as_of_date: parse_date(&row.get::<String, _>("as_of_date"))?,
        home_court_advantage: row.get("home_court_advantage"),
        closing_source: row
            .get::<String, _>("closing_source")
            .parse()
            .map_err(|_| EngineError::Corrupt("snapshot closing_source".into()))?,
        games_processed: row.get::<i64, _>("games_processed").max(0) as u32,
        teams: from_json(&row.get::<String, _>("teams"))?,
        adjustments: from_json(&row.get::<String, _>("adjustments"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    }))
}

/// Snapshot history for a season, oldest first, without the payloads.
pub async fn list_snapshots(pool: &SqlitePool, season: &str) -> EngineResult<Vec<SnapshotSummary>> {
    let rows = sqlx::query(
        r#"SELECT id, as_of_date, games_processed, home_court_advantage, closing_source, created_at
           FROM ratings_snapshots WHERE season = ? ORDER BY rowid ASC"#,
    )
    .bind(season)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(SnapshotSummary {
                id: row.get("id"),
                as_of_date: parse_date(&row.get::<String, _>("as_of_date"))?,
                games_processed: row.get("games_processed"),
                home_court_advantage: row.get("home_court_advantage"),
                closing_source: row.get("closing_source"),
                created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            })
        })
        .collect()
}

// ── Team overrides ───────────────────────────────────────────────────────────

fn provider_column(provider: NameProvider) -> Option<&'static str> {
    match provider {
        NameProvider::Ratings => None,
        NameProvider::Espn => Some("espn_name"),
        NameProvider::OddsApi => Some("odds_api_name"),
        NameProvider::Sbr => Some("sbr_name"),
    }
}

pub async fn get_overrides(pool: &SqlitePool) -> EngineResult<Vec<TeamOverride>> {
    let rows = sqlx::query("SELECT * FROM team_overrides ORDER BY source_name")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| TeamOverride {
            source_name: row.get("source_name"),
            canonical_name: row.get("canonical_name"),
            alternates: AlternateNames {
                espn_name: row.get("espn_name"),
                odds_api_name: row.get("odds_api_name"),
                sbr_name: row.get("sbr_name"),
            },
        })
        .collect())
}

/// Fresh override snapshot for one batch operation.
pub async fn load_override_table(pool: &SqlitePool) -> EngineResult<OverrideTable> {
    Ok(OverrideTable::from_overrides(get_overrides(pool).await?))
}

/// Write an override; any alternate spelling bound to another source name is
/// cleared first so each external name maps to one team. Returns (and logs)
/// what was displaced.
pub async fn upsert_override(pool: &SqlitePool, ov: &TeamOverride) -> EngineResult<Vec<ClearedBinding>> {
    let now = fmt_ts(Utc::now());
    let mut tx = pool.begin().await?;
    let mut cleared = Vec::new();

    for (provider, name) in ov.alternates.bound() {
        let Some(column) = provider_column(provider) else { continue };

        let owners: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT source_name FROM team_overrides WHERE lower({col}) = lower(?) AND source_name != ?",
            col = column
        ))
        .bind(name)
        .bind(&ov.source_name)
        .fetch_all(&mut *tx)
        .await?;

        if owners.is_empty() {
            continue;
        }

        sqlx::query(&format!(
            "UPDATE team_overrides SET {col} = NULL, updated_at = ? WHERE lower({col}) = lower(?) AND source_name != ?",
            col = column
        ))
        .bind(&now)
        .bind(name)
        .bind(&ov.source_name)
        .execute(&mut *tx)
        .await?;

        for owner in owners {
            cleared.push(ClearedBinding { provider, name: name.to_string(), previous_owner: owner });
        }
    }

    let previous: Option<String> =
        sqlx::query_scalar("SELECT canonical_name FROM team_overrides WHERE source_name = ?")
            .bind(&ov.source_name)
            .fetch_optional(&mut *tx)
            .await?;
    if let Some(prev) = previous.filter(|p| !p.eq_ignore_ascii_case(&ov.canonical_name)) {
        cleared.push(ClearedBinding {
            provider: NameProvider::Ratings,
            name: ov.source_name.clone(),
            previous_owner: prev,
        });
    }

    sqlx::query(
        r#"
        INSERT INTO team_overrides (source_name, canonical_name, espn_name, odds_api_name, sbr_name, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_name) DO UPDATE SET
            source_name    = excluded.source_name,
            canonical_name = excluded.canonical_name,
            espn_name      = excluded.espn_name,
            odds_api_name  = excluded.odds_api_name,
            sbr_name       = excluded.sbr_name,
            updated_at     = excluded.updated_at
        "#,
    )
    .bind(&ov.source_name)
    .bind(&ov.canonical_name)
    .bind(&ov.alternates.espn_name)
    .bind(&ov.alternates.odds_api_name)
    .bind(&ov.alternates.sbr_name)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    for c in &cleared {
        tracing::warn!(
            "Override '{}' -> '{}' displaced {:?} binding '{}' (was '{}')",
            ov.source_name,
            ov.canonical_name,
            c.provider,
            c.name,
            c.previous_owner
        );
    }
    Ok(cleared)
}

pub async fn delete_override(pool: &SqlitePool, source_name: &str) -> EngineResult<bool> {
    let result = sqlx::query("DELETE FROM team_overrides WHERE source_name = ?")
        .bind(source_name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── Games ────────────────────────────────────────────────────────────────────

pub async fn insert_game(pool: &SqlitePool, game: &GameRecord) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO games
        (id, season, date, commence_time, home_team, away_team, venue, event_name, neutral_site,
         home_score, away_score, status, opening_spread, opening_source, opening_lookback_hours,
         opening_status, opening_attempted_at, closing_spread, closing_source, adjusted_run_id, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            commence_time = excluded.commence_time,
            venue         = excluded.venue,
            event_name    = excluded.event_name,
            neutral_site  = excluded.neutral_site,
            home_score    = excluded.home_score,
            away_score    = excluded.away_score,
            status        = excluded.status,
            updated_at    = excluded.updated_at
        "#,
    )
    .bind(&game.id)
    .bind(&game.season)
    .bind(fmt_date(game.date))
    .bind(fmt_ts(game.commence_time))
    .bind(&game.home_team)
    .bind(&game.away_team)
    .bind(&game.venue)
    .bind(&game.event_name)
    .bind(game.neutral_site)
    .bind(game.home_score)
    .bind(game.away_score)
    .bind(&game.status)
    .bind(game.opening_spread)
    .bind(game.opening_source.map(|s| s.as_str()))
    .bind(game.opening_lookback_hours)
    .bind(game.opening_status.map(|s| s.as_str()))
    .bind(game.opening_attempted_at.map(fmt_ts))
    .bind(game.closing_spread)
    .bind(game.closing_source.map(|s| s.as_str()))
    .bind(&game.adjusted_run_id)
    .bind(fmt_ts(Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

fn game_from_row(row: &SqliteRow) -> EngineResult<GameRecord> {
    let opening_source: Option<String> = row.get("opening_source");
    let closing_source: Option<String> = row.get("closing_source");
    let opening_status: Option<String> = row.get("opening_status");
    let opening_attempted_at: Option<String> = row.get("opening_attempted_at");
    Ok(GameRecord {
        id: row.get("id"),
        season: row.get("season"),
        date: parse_date(&row.get::<String, _>("date"))?,
        commence_time: parse_ts(&row.get::<String, _>("commence_time"))?,
        home_team: row.get("home_team"),
        away_team: row.get("away_team"),
        venue: row.get("venue"),
        event_name: row.get("event_name"),
        neutral_site: row.get("neutral_site"),
        home_score: row.get("home_score"),
        away_score: row.get("away_score"),
        status: row.get("status"),
        opening_spread: row.get("opening_spread"),
        opening_source: opening_source.as_deref().map(parse_source).transpose()?,
        opening_lookback_hours: row.get("opening_lookback_hours"),
        opening_status: opening_status
            .as_deref()
            .map(|raw| raw.parse().map_err(|_| EngineError::Corrupt(format!("opening status '{}'", raw))))
            .transpose()?,
        opening_attempted_at: opening_attempted_at.as_deref().map(parse_ts).transpose()?,
        closing_spread: row.get("closing_spread"),
        closing_source: closing_source.as_deref().map(parse_source).transpose()?,
        adjusted_run_id: row.get("adjusted_run_id"),
    })
}

pub async fn get_game(pool: &SqlitePool, game_id: &str) -> EngineResult<Option<GameRecord>> {
    let row = sqlx::query("SELECT * FROM games WHERE id = ?")
        .bind(game_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(game_from_row).transpose()
}

/// Final games of `date` not yet consumed by an adjustment run, in tip-off order.
pub async fn get_games_for_adjustment(pool: &SqlitePool, season: &str, date: NaiveDate) -> EngineResult<Vec<GameRecord>> {
    let rows = sqlx::query(
        r#"SELECT * FROM games
           WHERE season = ? AND date = ? AND status = 'final' AND adjusted_run_id IS NULL
           ORDER BY commence_time ASC, id ASC"#,
    )
    .bind(season)
    .bind(fmt_date(date))
    .fetch_all(pool)
    .await?;
    rows.iter().map(game_from_row).collect()
}

/// Games that tipped off before `before` and still lack an opening line.
/// Never-attempted games come first, most recent first; games already
/// marked not found follow, least recently attempted first, so a batch
/// limit cannot pin the queue on the same unfindable games.
pub async fn get_games_missing_opening(
    pool: &SqlitePool,
    season: &str,
    before: DateTime<Utc>,
    limit: i64,
) -> EngineResult<Vec<GameRecord>> {
    let rows = sqlx::query(
        r#"SELECT * FROM games
           WHERE season = ? AND opening_spread IS NULL AND commence_time < ?
           ORDER BY opening_attempted_at IS NOT NULL, opening_attempted_at ASC, commence_time DESC, id ASC
           LIMIT ?"#,
    )
    .bind(season)
    .bind(fmt_ts(before))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(game_from_row).collect()
}

/// Partial update: only the opening-line columns change.
pub async fn set_opening_spread(
    pool: &SqlitePool,
    game_id: &str,
    spread: f64,
    source: LineSource,
    lookback_hours: i64,
) -> EngineResult<()> {
    let now = fmt_ts(Utc::now());
    let result = sqlx::query(
        r#"UPDATE games
           SET opening_spread = ?, opening_source = ?, opening_lookback_hours = ?,
               opening_status = ?, opening_attempted_at = ?, updated_at = ?
           WHERE id = ? AND opening_spread IS NULL"#,
    )
    .bind(spread)
    .bind(source.as_str())
    .bind(lookback_hours)
    .bind(OpeningStatus::Found.as_str())
    .bind(&now)
    .bind(&now)
    .bind(game_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        tracing::debug!("Opening line for {} already set or game missing", game_id);
    }
    Ok(())
}

/// Partial update: every lookback offset came back empty for this game.
pub async fn mark_opening_not_found(pool: &SqlitePool, game_id: &str, attempted_at: DateTime<Utc>) -> EngineResult<()> {
    sqlx::query(
        r#"UPDATE games
           SET opening_status = ?, opening_attempted_at = ?, updated_at = ?
           WHERE id = ? AND opening_spread IS NULL"#,
    )
    .bind(OpeningStatus::NotFound.as_str())
    .bind(fmt_ts(attempted_at))
    .bind(fmt_ts(Utc::now()))
    .bind(game_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist one game's adjustment atomically: the audit row, the closing line
/// and run id on the game, and both teams' new ratings. Nothing is written
/// unless all of it is. A game already claimed by another run is rejected
/// with `AlreadyAdjusted`.
pub async fn commit_game_adjustment(
    pool: &SqlitePool,
    season: &str,
    adj: &GameAdjustment,
    teams: &[&TeamRating],
) -> EngineResult<()> {
    let mut tx = pool.begin().await?;

    insert_game_adjustment(&mut *tx, season, adj).await?;

    let claimed = sqlx::query(
        r#"UPDATE games
           SET closing_spread = ?, closing_source = ?, adjusted_run_id = ?, updated_at = ?
           WHERE id = ? AND adjusted_run_id IS NULL"#,
    )
    .bind(adj.closing_spread)
    .bind(adj.closing_source.as_str())
    .bind(&adj.run_id)
    .bind(fmt_ts(Utc::now()))
    .bind(&adj.game_id)
    .execute(&mut *tx)
    .await?;
    if claimed.rows_affected() == 0 {
        return Err(EngineError::AlreadyAdjusted(adj.game_id.clone()));
    }

    for team in teams {
        upsert_team_rating(&mut *tx, season, team).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn pool() -> SqlitePool {
        let pool = create_memory_pool().await.unwrap();
        init_database_with_pool(&pool).await.unwrap();
        pool
    }

    fn ov(source: &str, canonical: &str, odds_api: Option<&str>) -> TeamOverride {
        TeamOverride {
            source_name: source.to_string(),
            canonical_name: canonical.to_string(),
            alternates: AlternateNames {
                odds_api_name: odds_api.map(str::to_string),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn team_rating_round_trips_with_alternates() {
        let pool = pool().await;
        let mut team = TeamRating::seeded(
            "UConn".into(),
            "Connecticut".into(),
            Some("Big East".into()),
            25.1,
            Utc.with_ymd_and_hms(2024, 11, 4, 0, 0, 0).unwrap(),
        );
        team.alternate_names = Some(AlternateNames {
            espn_name: Some("UConn Huskies".into()),
            ..Default::default()
        });
        upsert_team_rating(&pool, "2024-25", &team).await.unwrap();

        let loaded = get_team_rating(&pool, "2024-25", "uconn").await.unwrap().unwrap();
        assert_eq!(loaded, team);
        assert!(get_team_rating(&pool, "2023-24", "UConn").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn games_processed_never_decreases() {
        let pool = pool().await;
        let mut team = TeamRating::seeded("Duke".into(), "Duke".into(), None, 20.0, Utc::now());
        team.games_processed = 5;
        upsert_team_rating(&pool, "s", &team).await.unwrap();
        team.games_processed = 2;
        team.rating = 21.0;
        upsert_team_rating(&pool, "s", &team).await.unwrap();

        let loaded = get_team_rating(&pool, "s", "Duke").await.unwrap().unwrap();
        assert_eq!(loaded.games_processed, 5);
        assert_eq!(loaded.rating, 21.0);
        assert_eq!(loaded.initial_rating, 20.0);
    }

    #[tokio::test]
    async fn override_write_clears_prior_binding() {
        let pool = pool().await;
        assert!(upsert_override(&pool, &ov("St. Mary's", "Saint Mary's", Some("Saint Mary's Gaels")))
            .await
            .unwrap()
            .is_empty());

        let cleared = upsert_override(&pool, &ov("Saint Marys CA", "Saint Mary's", Some("SAINT MARY'S GAELS")))
            .await
            .unwrap();
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].previous_owner, "St. Mary's");

        let all = get_overrides(&pool).await.unwrap();
        let holders: Vec<_> = all.iter().filter(|o| o.alternates.odds_api_name.is_some()).collect();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].source_name, "Saint Marys CA");
    }

    #[tokio::test]
    async fn override_last_write_wins_case_insensitively() {
        let pool = pool().await;
        upsert_override(&pool, &ov("Miami", "Miami (OH)", None)).await.unwrap();
        let cleared = upsert_override(&pool, &ov("MIAMI", "Miami (FL)", None)).await.unwrap();
        assert_eq!(cleared[0].provider, NameProvider::Ratings);

        let table = load_override_table(&pool).await.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.canonical_for("miami"), Some("Miami (FL)"));

        assert!(delete_override(&pool, "miami").await.unwrap());
        assert!(get_overrides(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn opening_spread_update_is_partial() {
        let pool = pool().await;
        let game = GameRecord {
            id: "g1".into(),
            season: "2024-25".into(),
            date: NaiveDate::from_ymd_opt(2025, 1, 18).unwrap(),
            commence_time: Utc.with_ymd_and_hms(2025, 1, 18, 19, 0, 0).unwrap(),
            home_team: "Purdue".into(),
            away_team: "Indiana".into(),
            venue: Some("Mackey Arena".into()),
            event_name: None,
            neutral_site: Some(false),
            home_score: Some(81),
            away_score: Some(76),
            status: "final".into(),
            opening_spread: None,
            opening_source: None,
            opening_lookback_hours: None,
            opening_status: None,
            opening_attempted_at: None,
            closing_spread: Some(-7.5),
            closing_source: Some(LineSource::SharpBook),
            adjusted_run_id: None,
        };
        insert_game(&pool, &game).await.unwrap();
        set_opening_spread(&pool, "g1", -6.0, LineSource::UsAverage, 36).await.unwrap();
        // a second write never overwrites an existing opening line
        set_opening_spread(&pool, "g1", -9.0, LineSource::SharpBook, 12).await.unwrap();

        let loaded = get_game(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(loaded.opening_spread, Some(-6.0));
        assert_eq!(loaded.opening_source, Some(LineSource::UsAverage));
        assert_eq!(loaded.opening_lookback_hours, Some(36));
        assert_eq!(loaded.closing_spread, Some(-7.5));
        assert_eq!(loaded.venue.as_deref(), Some("Mackey Arena"));
        assert_eq!(loaded.neutral_site, Some(false));
    }

    fn pending_game(id: &str, hour: u32) -> GameRecord {
        GameRecord {
            id: id.into(),
            season: "2024-25".into(),
            date: NaiveDate::from_ymd_opt(2025, 1, 18).unwrap(),
            commence_time: Utc.with_ymd_and_hms(2025, 1, 18, hour, 0, 0).unwrap(),
            home_team: "Purdue".into(),
            away_team: "Indiana".into(),
            venue: None,
            event_name: None,
            neutral_site: Some(false),
            home_score: Some(81),
            away_score: Some(76),
            status: "final".into(),
            opening_spread: None,
            opening_source: None,
            opening_lookback_hours: None,
            opening_status: None,
            opening_attempted_at: None,
            closing_spread: None,
            closing_source: None,
            adjusted_run_id: None,
        }
    }

    fn adjustment(run_id: &str, game_id: &str) -> GameAdjustment {
        GameAdjustment {
            run_id: run_id.into(),
            game_id: game_id.into(),
            date: NaiveDate::from_ymd_opt(2025, 1, 18).unwrap(),
            home_team: "Purdue".into(),
            away_team: "Indiana".into(),
            is_neutral_site: false,
            home_rating_before: 20.0,
            away_rating_before: 12.0,
            projected_spread: -11.0,
            closing_spread: -13.0,
            closing_source: LineSource::SharpBook,
            difference: -2.0,
            adjustment: -1.0,
            home_rating_after: 20.5,
            away_rating_after: 11.5,
        }
    }

    #[tokio::test]
    async fn committed_game_cannot_be_claimed_twice() {
        let pool = pool().await;
        insert_game(&pool, &pending_game("g1", 19)).await.unwrap();
        let mut purdue = TeamRating::seeded("Purdue".into(), "Purdue".into(), None, 20.0, Utc::now());
        let mut indiana = TeamRating::seeded("Indiana".into(), "Indiana".into(), None, 12.0, Utc::now());
        purdue.rating = 20.5;
        indiana.rating = 11.5;
        commit_game_adjustment(&pool, "2024-25", &adjustment("r1", "g1"), &[&purdue, &indiana]).await.unwrap();

        purdue.rating = 99.0;
        let err = commit_game_adjustment(&pool, "2024-25", &adjustment("r2", "g1"), &[&purdue, &indiana])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyAdjusted(ref id) if id == "g1"));

        // the rejected run left neither an audit row nor a rating change
        let stored = get_game_adjustments(&pool, "2024-25", None, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].run_id, "r1");
        let loaded = get_team_rating(&pool, "2024-25", "Purdue").await.unwrap().unwrap();
        assert_eq!(loaded.rating, 20.5);
        let game = get_game(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(game.adjusted_run_id.as_deref(), Some("r1"));
        assert_eq!(game.closing_spread, Some(-13.0));
    }

    #[tokio::test]
    async fn not_found_games_rotate_behind_unattempted_ones() {
        let pool = pool().await;
        for (id, hour) in [("old", 12), ("mid", 15), ("new", 19)] {
            insert_game(&pool, &pending_game(id, hour)).await.unwrap();
        }
        let before = Utc.with_ymd_and_hms(2025, 1, 19, 0, 0, 0).unwrap();

        let ids = |games: Vec<GameRecord>| games.into_iter().map(|g| g.id).collect::<Vec<_>>();
        assert_eq!(ids(get_games_missing_opening(&pool, "2024-25", before, 3).await.unwrap()), vec!["new", "mid", "old"]);

        mark_opening_not_found(&pool, "new", Utc.with_ymd_and_hms(2025, 1, 20, 8, 0, 0).unwrap()).await.unwrap();
        mark_opening_not_found(&pool, "mid", Utc.with_ymd_and_hms(2025, 1, 20, 6, 0, 0).unwrap()).await.unwrap();
        assert_eq!(ids(get_games_missing_opening(&pool, "2024-25", before, 3).await.unwrap()), vec!["old", "mid", "new"]);

        let marked = get_game(&pool, "new").await.unwrap().unwrap();
        assert_eq!(marked.opening_status, Some(OpeningStatus::NotFound));
        assert_eq!(marked.opening_spread, None);

        set_opening_spread(&pool, "mid", -4.5, LineSource::SharpBook, 24).await.unwrap();
        let found = get_game(&pool, "mid").await.unwrap().unwrap();
        assert_eq!(found.opening_status, Some(OpeningStatus::Found));
        assert!(found.opening_attempted_at.is_some());
        // a found line is never downgraded by a later miss
        mark_opening_not_found(&pool, "mid", Utc::now()).await.unwrap();
        let found = get_game(&pool, "mid").await.unwrap().unwrap();
        assert_eq!(found.opening_status, Some(OpeningStatus::Found));
        assert_eq!(ids(get_games_missing_opening(&pool, "2024-25", before, 3).await.unwrap()), vec!["old", "new"]);
    }

    #[tokio::test]
    async fn init_adds_missing_game_columns() {
        let pool = create_memory_pool().await.unwrap();
        sqlx::query("CREATE TABLE games (id TEXT PRIMARY KEY, season TEXT NOT NULL, date TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        init_database_with_pool(&pool).await.unwrap();
        // idempotent on an already migrated schema
        init_database_with_pool(&pool).await.unwrap();

        let cols: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('games') WHERE name IN ('opening_status', 'opening_attempted_at')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(cols, 2);
    }

    #[tokio::test]
    async fn snapshots_are_appended_and_latest_wins() {
        let pool = pool().await;
        let mut snap = RatingsSnapshot {
            id: "a".into(),
            season: "2024-25".into(),
            as_of_date: NaiveDate::from_ymd_opt(2024, 11, 4).unwrap(),
            home_court_advantage: 3.0,
            closing_source: ClosingSourceMode::Pinnacle,
            games_processed: 0,
            teams: vec![],
            adjustments: vec![],
            created_at: Utc::now(),
        };
        insert_snapshot(&pool, &snap).await.unwrap();
        snap.id = "b".into();
        snap.games_processed = 4;
        insert_snapshot(&pool, &snap).await.unwrap();

        let latest = latest_snapshot(&pool, "2024-25").await.unwrap().unwrap();
        assert_eq!(latest.id, "b");
        assert_eq!(latest.games_processed, 4);
        let history = list_snapshots(&pool, "2024-25").await.unwrap();
        assert_eq!(history.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        // the id is the primary key, snapshots are never rewritten
        assert!(insert_snapshot(&pool, &snap).await.is_err());
    }
}
