use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db;
use crate::error::EngineError;
use crate::models::{ClosingSourceMode, GameAdjustment, GameRecord, OddsEvent, RatingsSnapshot, TeamRating};
use crate::services::closing_line::ClosingLineResolver;
use crate::services::odds_fetcher::{OddsProvider, SnapshotCache};
use crate::services::spread_projector::{is_neutral_site, SpreadProjector};
use crate::services::team_matcher::TeamMatcher;

/// A finished game with its closing-odds payload already fetched.
#[derive(Debug, Clone)]
pub struct CompletedGame {
    pub game_id: String,
    pub date: NaiveDate,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    pub venue: Option<String>,
    pub event_name: Option<String>,
    pub neutral_site: Option<bool>,
    pub odds: Option<OddsEvent>,
}

impl CompletedGame {
    pub fn from_record(record: &GameRecord, odds: Option<OddsEvent>) -> Self {
        Self {
            game_id: record.id.clone(),
            date: record.date,
            commence_time: record.commence_time,
            home_team: record.home_team.clone(),
            away_team: record.away_team.clone(),
            venue: record.venue.clone(),
            event_name: record.event_name.clone(),
            neutral_site: record.neutral_site,
            odds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NoOddsEvent,
    NoClosingLine,
    UnknownTeam(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedGame {
    pub game_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub struct AdjustmentOutcome {
    /// Full rating set, in input order
    pub ratings: Vec<TeamRating>,
    pub adjustments: Vec<GameAdjustment>,
    pub skipped: Vec<SkippedGame>,
}

/// Nudges ratings toward the market: each game moves the home/away gap by
/// `damping_factor * (closing - projected)`, split evenly so the pair's sum
/// never changes.
#[derive(Debug, Clone)]
pub struct RatingAdjuster {
    projector: SpreadProjector,
    resolver: ClosingLineResolver,
    damping_factor: f64,
}

impl RatingAdjuster {
    pub fn new(home_court_advantage: f64, damping_factor: f64, resolver: ClosingLineResolver) -> Self {
        Self {
            projector: SpreadProjector::new(home_court_advantage),
            resolver,
            damping_factor,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.home_court_advantage,
            config.damping_factor,
            ClosingLineResolver::from_config(config),
        )
    }

    pub fn home_court_advantage(&self) -> f64 {
        self.projector.home_court_advantage
    }

    /// Apply `games` in the order given. Later games see ratings already
    /// moved by earlier ones, so callers must pass them sorted by tip-off.
    pub fn process(&self, run_id: &str, ratings: Vec<TeamRating>, games: &[CompletedGame]) -> AdjustmentOutcome {
        let mut ratings = ratings;
        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, r) in ratings.iter().enumerate() {
            index.entry(r.source_name.to_lowercase()).or_insert(i);
        }
        // canonical names take precedence over source spellings
        for (i, r) in ratings.iter().enumerate() {
            index.insert(r.team_name.to_lowercase(), i);
        }

        let mut adjustments = Vec::new();
        let mut skipped = Vec::new();
        let mut last_tip: Option<DateTime<Utc>> = None;

        for game in games {
            if last_tip.map(|t| game.commence_time < t).unwrap_or(false) {
                tracing::warn!("Game {} is out of chronological order; processing as given", game.game_id);
            }
            last_tip = Some(game.commence_time);

            let skip = |reason: SkipReason| SkippedGame { game_id: game.game_id.clone(), reason };

            let (home_idx, away_idx) = match (
                index.get(&game.home_team.to_lowercase()),
                index.get(&game.away_team.to_lowercase()),
            ) {
                (Some(h), Some(a)) if h != a => (*h, *a),
                (None, _) => {
                    skipped.push(skip(SkipReason::UnknownTeam(game.home_team.clone())));
                    continue;
                }
                (_, _) => {
                    skipped.push(skip(SkipReason::UnknownTeam(game.away_team.clone())));
                    continue;
                }
            };

            let neutral = is_neutral_site(game.neutral_site, game.venue.as_deref(), game.event_name.as_deref());
            let home_before = ratings[home_idx].rating;
            let away_before = ratings[away_idx].rating;
            let projected = self.projector.project(home_before, away_before, neutral);

            let Some(event) = game.odds.as_ref() else {
                skipped.push(skip(SkipReason::NoOddsEvent));
                continue;
            };
            let line = self.resolver.resolve_event(event, game.commence_time);
            let Some(closing) = line.spread else {
                skipped.push(skip(SkipReason::NoClosingLine));
                continue;
            };

            let difference = closing - projected;
            let adjustment = difference * self.damping_factor;
            let home_after = home_before - adjustment / 2.0;
            let away_after = away_before + adjustment / 2.0;

            for (idx, after) in [(home_idx, home_after), (away_idx, away_after)] {
                let team = &mut ratings[idx];
                team.rating = after;
                team.games_processed += 1;
                team.last_updated = game.commence_time;
            }

            tracing::debug!(
                "{} @ {}: projected {:+.1}, closing {:+.1} ({}), adj {:+.3}",
                game.away_team,
                game.home_team,
                projected,
                closing,
                line.source.as_str(),
                adjustment
            );

            adjustments.push(GameAdjustment {
                run_id: run_id.to_string(),
                game_id: game.game_id.clone(),
                date: game.date,
                home_team: ratings[home_idx].team_name.clone(),
                away_team: ratings[away_idx].team_name.clone(),
                is_neutral_site: neutral,
                home_rating_before: home_before,
                away_rating_before: away_before,
                projected_spread: projected,
                closing_spread: closing,
                closing_source: line.source,
                difference,
                adjustment,
                home_rating_after: home_after,
                away_rating_after: away_after,
            });
        }

        AdjustmentOutcome { ratings, adjustments, skipped }
    }
}

/// Next snapshot in the append-only history: the full rating set plus every
/// adjustment applied since the season seed.
pub fn build_snapshot(
    season: &str,
    as_of_date: NaiveDate,
    home_court_advantage: f64,
    closing_source: ClosingSourceMode,
    previous: Option<&RatingsSnapshot>,
    outcome: &AdjustmentOutcome,
) -> RatingsSnapshot {
    let mut adjustments = previous.map(|p| p.adjustments.clone()).unwrap_or_default();
    adjustments.extend(outcome.adjustments.iter().cloned());
    RatingsSnapshot {
        id: Uuid::new_v4().to_string(),
        season: season.to_string(),
        as_of_date,
        home_court_advantage,
        closing_source,
        games_processed: adjustments.len() as u32,
        teams: outcome.ratings.clone(),
        adjustments,
        created_at: Utc::now(),
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AdjustmentReport {
    pub run_id: String,
    pub processed: usize,
    pub adjusted: usize,
    pub skipped: Vec<SkippedGame>,
    pub errors: usize,
    pub snapshot_id: Option<String>,
}

/// One recalibration run for the completed, not-yet-adjusted games of `date`.
///
/// Odds are fetched up front (historical snapshot at tip-off). Games are then
/// applied one at a time in tip-off order, each committed in its own
/// transaction (audit row, closing line, both ratings). A game whose commit
/// fails is counted in `errors`, leaves no trace, and stays eligible for the
/// next run; later games are projected from the ratings actually stored.
pub async fn recalibrate(
    pool: &SqlitePool,
    provider: &dyn OddsProvider,
    config: &EngineConfig,
    season: &str,
    date: NaiveDate,
) -> Result<AdjustmentReport> {
    let ratings = db::get_team_ratings(pool, season).await?;
    if ratings.is_empty() {
        return Err(EngineError::SeasonNotSeeded(season.to_string()).into());
    }

    let matcher = TeamMatcher::new(db::load_override_table(pool).await?);
    let games = db::get_games_for_adjustment(pool, season, date).await?;
    let run_id = Uuid::new_v4().to_string();
    let mut report = AdjustmentReport {
        run_id: run_id.clone(),
        processed: games.len(),
        ..Default::default()
    };

    if games.is_empty() {
        tracing::info!("Recalibrate {}: no completed games awaiting adjustment on {}", season, date);
        return Ok(report);
    }

    let mut snapshots = SnapshotCache::new();
    let mut completed = Vec::with_capacity(games.len());
    for game in &games {
        let odds = match snapshots.get_or_fetch(provider, game.commence_time).await {
            Some(events) => matcher.find_game(&game.home_team, &game.away_team, events).cloned(),
            None => None,
        };
        completed.push(CompletedGame::from_record(game, odds));
    }

    let adjuster = RatingAdjuster::from_config(config);
    let mut ratings = ratings;
    let mut committed = Vec::new();

    for game in &completed {
        let outcome = adjuster.process(&run_id, ratings.clone(), std::slice::from_ref(game));
        report.skipped.extend(outcome.skipped);
        let Some(adj) = outcome.adjustments.into_iter().next() else {
            continue;
        };

        let result = {
            let moved: Vec<&TeamRating> = outcome
                .ratings
                .iter()
                .filter(|t| t.team_name == adj.home_team || t.team_name == adj.away_team)
                .collect();
            db::commit_game_adjustment(pool, season, &adj, &moved).await
        };
        match result {
            Ok(()) => {
                ratings = outcome.ratings;
                committed.push(adj);
            }
            Err(e) => {
                tracing::error!("Failed to commit adjustment for game {}: {}", adj.game_id, e);
                report.errors += 1;
            }
        }
    }
    report.adjusted = committed.len();

    if !committed.is_empty() {
        let applied = AdjustmentOutcome { ratings, adjustments: committed, skipped: Vec::new() };
        let previous = db::latest_snapshot(pool, season).await?;
        let snapshot = build_snapshot(
            season,
            date,
            adjuster.home_court_advantage(),
            config.closing_source,
            previous.as_ref(),
            &applied,
        );
        match db::insert_snapshot(pool, &snapshot).await {
            Ok(()) => report.snapshot_id = Some(snapshot.id),
            Err(e) => {
                tracing::error!("Failed to append ratings snapshot for {}: {}", season, e);
                report.errors += 1;
            }
        }
    }

    tracing::info!(
        "Recalibrate {} {}: {} games, {} adjusted, {} skipped, {} errors",
        season,
        date,
        report.processed,
        report.adjusted,
        report.skipped.len(),
        report.errors
    );
    Ok(report)
}
