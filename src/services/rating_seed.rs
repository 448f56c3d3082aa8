use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db;
use crate::error::EngineError;
use crate::models::{RatingsSnapshot, TeamRating};
use crate::services::team_matcher::OverrideTable;
use crate::utils::{clean_name, validate_team_name};

/// One row from the power-rating provider.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SeedRow {
    #[serde(alias = "team_name", alias = "Team")]
    pub team: String,
    #[serde(default, alias = "conf", alias = "Conf")]
    pub conference: Option<String>,
    #[serde(alias = "power_rating", alias = "adj_em", alias = "Rating")]
    pub rating: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SeedReport {
    pub seeded: usize,
    pub renamed: usize,
    pub skipped: Vec<String>,
    pub snapshot_id: Option<String>,
}

pub fn read_csv<R: Read>(reader: R) -> Result<Vec<SeedRow>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut rows = Vec::new();
    for record in rdr.deserialize() {
        let row: SeedRow = record.map_err(EngineError::from)?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn load_csv(path: &Path) -> Result<Vec<SeedRow>> {
    let file = std::fs::File::open(path).with_context(|| format!("Cannot open seed file {}", path.display()))?;
    read_csv(file)
}

pub async fn fetch_json(url: &str) -> Result<Vec<SeedRow>> {
    let resp = Client::new()
        .get(url)
        .timeout(std::time::Duration::from_secs(20))
        .send()
        .await
        .with_context(|| format!("Ratings request failed: {}", url))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(EngineError::Provider { status: status.as_u16(), body }.into());
    }
    let rows: Vec<SeedRow> = resp.json().await.context("Failed to parse ratings payload")?;
    tracing::info!("Fetched {} team ratings from {}", rows.len(), url);
    Ok(rows)
}

/// Map provider rows to canonical `TeamRating`s. Rows with blank names,
/// non-finite ratings or a canonical name already taken are skipped.
pub fn build_ratings(rows: &[SeedRow], overrides: &OverrideTable, report: &mut SeedReport) -> Vec<TeamRating> {
    let now = Utc::now();
    let mut seen = HashSet::new();
    let mut ratings = Vec::with_capacity(rows.len());

    for row in rows {
        let source_name = clean_name(&row.team);
        if !validate_team_name(&source_name) || !row.rating.is_finite() {
            tracing::warn!("Seed: skipping invalid row {:?}", row);
            report.skipped.push(row.team.clone());
            continue;
        }

        let (team_name, alternates) = match overrides.get(&source_name) {
            Some(ov) => {
                report.renamed += usize::from(ov.canonical_name != source_name);
                let alts = (!ov.alternates.is_empty()).then(|| ov.alternates.clone());
                (ov.canonical_name.clone(), alts)
            }
            None => (source_name.clone(), None),
        };

        if !seen.insert(team_name.to_lowercase()) {
            tracing::warn!("Seed: duplicate team '{}' (from '{}'), keeping first", team_name, source_name);
            report.skipped.push(row.team.clone());
            continue;
        }

        let conference = row.conference.as_deref().map(clean_name).filter(|c| !c.is_empty());
        let mut rating = TeamRating::seeded(team_name, source_name, conference, row.rating, now);
        rating.alternate_names = alternates;
        ratings.push(rating);
    }
    ratings
}

/// Season initialization: seed ratings and append the opening snapshot.
pub async fn initialize_season(
    pool: &SqlitePool,
    config: &EngineConfig,
    season: &str,
    as_of_date: NaiveDate,
    rows: &[SeedRow],
    force: bool,
) -> Result<SeedReport> {
    let existing = db::count_team_ratings(pool, season).await?;
    if existing > 0 {
        if !force {
            return Err(EngineError::SeasonAlreadySeeded { season: season.to_string(), teams: existing }.into());
        }
        tracing::warn!("Reseeding {}: dropping {} existing ratings", season, existing);
        db::delete_season_ratings(pool, season).await?;
    }

    let overrides = db::load_override_table(pool).await?;
    let mut report = SeedReport::default();
    let ratings = build_ratings(rows, &overrides, &mut report);

    for team in &ratings {
        db::upsert_team_rating(pool, season, team).await?;
        report.seeded += 1;
    }

    let snapshot = RatingsSnapshot {
        id: Uuid::new_v4().to_string(),
        season: season.to_string(),
        as_of_date,
        home_court_advantage: config.home_court_advantage,
        closing_source: config.closing_source,
        games_processed: 0,
        teams: ratings,
        adjustments: Vec::new(),
        created_at: Utc::now(),
    };
    db::insert_snapshot(pool, &snapshot).await?;
    report.snapshot_id = Some(snapshot.id);

    tracing::info!(
        "Seeded {} with {} teams ({} renamed via overrides, {} skipped)",
        season,
        report.seeded,
        report.renamed,
        report.skipped.len()
    );
    Ok(report)
}
