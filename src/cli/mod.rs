use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::io::Read;
use std::path::Path;

use crate::config::EngineConfig;
use crate::db::{self, create_pool, init_database_with_pool};
use crate::models::{AlternateNames, GameRecord, TeamOverride};
use crate::services::odds_fetcher::{OddsApiClient, OddsProvider};
use crate::services::{opening_line_backfill, rating_adjuster, rating_seed, spread_projector};
use crate::utils::{clean_name, format_spread, parse_timestamp};

async fn open(config: &EngineConfig) -> Result<SqlitePool> {
    let pool = create_pool(&config.database_url).await?;
    init_database_with_pool(&pool).await?;
    Ok(pool)
}

pub async fn init_db(config: &EngineConfig) -> Result<()> {
    println!("🗄️  Initializing database at {}", config.database_url);
    db::init_database(&config.database_url).await?;
    println!("✅ Database ready");
    Ok(())
}

pub async fn seed_season(
    config: &EngineConfig,
    season: &str,
    file: Option<&Path>,
    url: Option<&str>,
    as_of: Option<NaiveDate>,
    force: bool,
) -> Result<()> {
    let pool = open(config).await?;

    let rows = match (file, url) {
        (Some(path), _) => {
            println!("📥 Reading ratings from {}...", path.display());
            rating_seed::load_csv(path)?
        }
        (None, Some(url)) => {
            println!("📥 Fetching ratings from {}...", url);
            rating_seed::fetch_json(url).await?
        }
        (None, None) => return Err(anyhow!("seed needs --file or --url")),
    };

    let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
    let report = rating_seed::initialize_season(&pool, config, season, as_of, &rows, force).await?;

    println!("✅ Seeded {} teams for {}", report.seeded, season);
    if report.renamed > 0 {
        println!("   🔁 {} renamed via overrides", report.renamed);
    }
    if !report.skipped.is_empty() {
        println!("   ⚠️  Skipped {}: {}", report.skipped.len(), report.skipped.join(", "));
    }
    Ok(())
}

pub async fn set_override(
    config: &EngineConfig,
    source: &str,
    canonical: &str,
    espn: Option<String>,
    odds_api: Option<String>,
    sbr: Option<String>,
) -> Result<()> {
    let pool = open(config).await?;
    let ov = TeamOverride {
        source_name: clean_name(source),
        canonical_name: clean_name(canonical),
        alternates: AlternateNames {
            espn_name: espn.map(|n| clean_name(&n)),
            odds_api_name: odds_api.map(|n| clean_name(&n)),
            sbr_name: sbr.map(|n| clean_name(&n)),
        },
    };

    let cleared = db::upsert_override(&pool, &ov).await?;
    println!("✅ {} → {}", ov.source_name, ov.canonical_name);
    for c in cleared {
        println!("   ⚠️  Cleared {:?} binding '{}' from '{}'", c.provider, c.name, c.previous_owner);
    }
    Ok(())
}

pub async fn list_overrides(config: &EngineConfig) -> Result<()> {
    let pool = open(config).await?;
    let overrides = db::get_overrides(&pool).await?;

    if overrides.is_empty() {
        println!("📭 No overrides. Add one with: ratingforge override set --source <name> --canonical <name>");
        return Ok(());
    }

    println!("📋 {} team overrides:\n", overrides.len());
    for ov in overrides {
        println!("   • {} → {}", ov.source_name, ov.canonical_name);
        for (provider, name) in ov.alternates.bound() {
            println!("       {:?}: {}", provider, name);
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct GameRow {
    id: String,
    date: NaiveDate,
    #[serde(default)]
    commence_time: Option<String>,
    home_team: String,
    away_team: String,
    #[serde(default)]
    venue: Option<String>,
    #[serde(default)]
    event_name: Option<String>,
    #[serde(default)]
    neutral_site: Option<bool>,
    #[serde(default)]
    home_score: Option<i32>,
    #[serde(default)]
    away_score: Option<i32>,
    #[serde(default)]
    status: Option<String>,
}

/// Parse a schedule/results CSV. Rows without an explicit tip-off time are
/// placed at midnight UTC of their date.
pub fn read_games_csv<R: Read>(season: &str, reader: R) -> Result<Vec<GameRecord>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut games = Vec::new();

    for (line, record) in rdr.deserialize::<GameRow>().enumerate() {
        let row = record.with_context(|| format!("games CSV row {}", line + 2))?;
        let commence_time = match row.commence_time.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => parse_timestamp(raw).ok_or_else(|| anyhow!("row {}: bad commence_time '{}'", line + 2, raw))?,
            None => row.date.and_hms_opt(0, 0, 0).map(|d| d.and_utc()).ok_or_else(|| anyhow!("row {}: bad date", line + 2))?,
        };
        let status = row.status.filter(|s| !s.is_empty()).unwrap_or_else(|| {
            if row.home_score.is_some() && row.away_score.is_some() { "final".to_string() } else { "scheduled".to_string() }
        });

        games.push(GameRecord {
            id: row.id,
            season: season.to_string(),
            date: row.date,
            commence_time,
            home_team: clean_name(&row.home_team),
            away_team: clean_name(&row.away_team),
            venue: row.venue.filter(|s| !s.is_empty()),
            event_name: row.event_name.filter(|s| !s.is_empty()),
            neutral_site: row.neutral_site,
            home_score: row.home_score,
            away_score: row.away_score,
            status,
            opening_spread: None,
            opening_source: None,
            opening_lookback_hours: None,
            opening_status: None,
            opening_attempted_at: None,
            closing_spread: None,
            closing_source: None,
            adjusted_run_id: None,
        });
    }
    Ok(games)
}

pub async fn import_games(config: &EngineConfig, season: &str, file: &Path) -> Result<()> {
    let pool = open(config).await?;
    let handle = std::fs::File::open(file).with_context(|| format!("Cannot open {}", file.display()))?;
    let games = read_games_csv(season, handle)?;

    println!("📥 Importing {} games into {}...", games.len(), season);
    let mut failed = 0;
    for game in &games {
        if let Err(e) = db::insert_game(&pool, game).await {
            tracing::error!("Failed to import game {}: {}", game.id, e);
            failed += 1;
        }
    }
    println!("✅ Imported {} games ({} failed)", games.len() - failed, failed);
    Ok(())
}

pub async fn recalibrate(config: &EngineConfig, season: &str, date: NaiveDate) -> Result<()> {
    let pool = open(config).await?;
    let client = OddsApiClient::new(config)?;

    println!("⚖️  Recalibrating {} for games on {}...", season, date);
    let report = rating_adjuster::recalibrate(&pool, &client, config, season, date).await?;

    println!("✅ Run {}", report.run_id);
    println!("   Games: {} | Adjusted: {} | Skipped: {} | Errors: {}",
        report.processed,
        report.adjusted,
        report.skipped.len(),
        report.errors
    );
    for skip in &report.skipped {
        println!("   ⏭️  {} ({:?})", skip.game_id, skip.reason);
    }
    Ok(())
}

pub async fn backfill(config: &EngineConfig, season: &str, limit: Option<usize>) -> Result<()> {
    let pool = open(config).await?;
    let client = OddsApiClient::new(config)?;

    println!("⏪ Backfilling opening lines for {}...", season);
    let report = opening_line_backfill::run_backfill(&pool, &client, config, season, limit).await?;

    println!("✅ Processed {} | Updated {} | Not found {} | Errors {}",
        report.processed,
        report.updated,
        report.not_found,
        report.errors
    );
    println!("   📡 {} historical snapshots fetched", report.snapshot_fetches);
    Ok(())
}

pub async fn project(config: &EngineConfig, season: &str, home: &str, away: &str, neutral: bool) -> Result<()> {
    let pool = open(config).await?;
    let client = match OddsApiClient::new(config) {
        Ok(c) => Some(c),
        Err(_) => {
            println!("💡 ODDS_API_KEY not set, projecting without the live market line");
            None
        }
    };
    let provider = client.as_ref().map(|c| c as &dyn OddsProvider);

    let p = spread_projector::project_matchup(&pool, config, provider, season, home, away, neutral).await?;

    println!("🔮 {} {} {}{}",
        p.away_team,
        if p.is_neutral_site { "vs" } else { "@" },
        p.home_team,
        if p.is_neutral_site { " (neutral)" } else { "" }
    );
    println!("   Ratings: {} {:.2} | {} {:.2}", p.home_team, p.home_rating, p.away_team, p.away_rating);
    println!("   Projected: {} {}", p.home_team, format_spread(p.projected_spread));
    if let (Some(market), Some(edge)) = (&p.market, p.edge) {
        if let Some(spread) = market.spread {
            println!("   Market:    {} {} ({})", p.home_team, format_spread(spread), market.source.as_str());
            println!("   Edge:      {:+.1}", edge);
        }
    }
    Ok(())
}

pub async fn show_ratings(config: &EngineConfig, season: &str, top: usize) -> Result<()> {
    let pool = open(config).await?;
    let ratings = db::get_team_ratings(&pool, season).await?;

    if ratings.is_empty() {
        println!("📭 No ratings for {}. Seed it first: ratingforge seed --season {} --file <csv>", season, season);
        return Ok(());
    }

    println!("📊 {} ratings ({} teams):\n", season, ratings.len());
    println!("   {:>4}  {:<28} {:>8} {:>8} {:>6}", "#", "Team", "Rating", "Drift", "Games");
    for (i, team) in ratings.iter().take(top).enumerate() {
        println!("   {:>4}  {:<28} {:>8.2} {:>+8.2} {:>6}",
            i + 1,
            team.team_name,
            team.rating,
            team.drift(),
            team.games_processed
        );
    }
    Ok(())
}
