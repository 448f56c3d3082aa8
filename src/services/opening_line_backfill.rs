use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::EngineConfig;
use crate::db;
use crate::models::{GameRecord, LineSource};
use crate::services::closing_line::ClosingLineResolver;
use crate::services::odds_fetcher::{OddsProvider, SnapshotCache};
use crate::services::team_matcher::TeamMatcher;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpeningLine {
    pub spread: f64,
    pub source: LineSource,
    pub lookback_hours: i64,
    pub bookmakers: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BackfillReport {
    pub processed: usize,
    pub updated: usize,
    pub not_found: usize,
    pub errors: usize,
    pub snapshot_fetches: usize,
}

/// Finds pre-game lines for recorded games by walking back through
/// historical odds snapshots. Holds the snapshot cache for one invocation.
pub struct OpeningLineBackfiller<'a> {
    provider: &'a dyn OddsProvider,
    matcher: TeamMatcher,
    resolver: ClosingLineResolver,
    lookback_hours: Vec<i64>,
    snapshots: SnapshotCache,
}

impl<'a> OpeningLineBackfiller<'a> {
    pub fn new(
        provider: &'a dyn OddsProvider,
        matcher: TeamMatcher,
        resolver: ClosingLineResolver,
        lookback_hours: Vec<i64>,
    ) -> Self {
        Self {
            provider,
            matcher,
            resolver,
            lookback_hours,
            snapshots: SnapshotCache::new(),
        }
    }

    /// Try each lookback offset in configured order (longest first) and stop
    /// at the first snapshot that yields a spread.
    pub async fn find_opening_line(&mut self, game: &GameRecord) -> Option<OpeningLine> {
        for &hours in &self.lookback_hours {
            let at = game.commence_time - Duration::hours(hours);
            let Some(events) = self.snapshots.get_or_fetch(self.provider, at).await else {
                continue;
            };
            let Some(event) = self.matcher.find_game(&game.home_team, &game.away_team, events) else {
                tracing::debug!("Backfill {}: no event at -{}h", game.id, hours);
                continue;
            };
            let line = self.resolver.resolve_event(event, at);
            if let Some(spread) = line.spread {
                return Some(OpeningLine {
                    spread,
                    source: line.source,
                    lookback_hours: hours,
                    bookmakers: line.bookmakers,
                });
            }
        }
        None
    }

    pub fn snapshot_fetches(&self) -> usize {
        self.snapshots.fetches()
    }
}

/// One bounded backfill batch for `season`. Each found line is committed on
/// its own. Games with nothing at any offset are marked not found, which
/// moves them behind never-attempted games in the next batch.
pub async fn run_backfill(
    pool: &SqlitePool,
    provider: &dyn OddsProvider,
    config: &EngineConfig,
    season: &str,
    limit: Option<usize>,
) -> Result<BackfillReport> {
    let batch = limit
        .unwrap_or(config.backfill_batch_size)
        .min(config.backfill_batch_size);
    let games = db::get_games_missing_opening(pool, season, Utc::now(), batch as i64).await?;
    let mut report = BackfillReport::default();

    if games.is_empty() {
        tracing::info!("Backfill {}: no games missing an opening line", season);
        return Ok(report);
    }

    let matcher = TeamMatcher::new(db::load_override_table(pool).await?);
    let mut backfiller = OpeningLineBackfiller::new(
        provider,
        matcher,
        ClosingLineResolver::from_config(config),
        config.lookback_hours.clone(),
    );

    for (i, game) in games.iter().enumerate() {
        if i > 0 && !config.backfill_pacing.is_zero() {
            tokio::time::sleep(config.backfill_pacing).await;
        }
        report.processed += 1;

        match backfiller.find_opening_line(game).await {
            Some(line) => {
                match db::set_opening_spread(pool, &game.id, line.spread, line.source, line.lookback_hours).await {
                    Ok(()) => {
                        report.updated += 1;
                        tracing::info!(
                            "Backfill {}: {} @ {} opened {:+.1} ({} at -{}h)",
                            game.id,
                            game.away_team,
                            game.home_team,
                            line.spread,
                            line.source.as_str(),
                            line.lookback_hours
                        );
                    }
                    Err(e) => {
                        report.errors += 1;
                        tracing::error!("Backfill {}: failed to store opening line: {}", game.id, e);
                    }
                }
            }
            None => {
                report.not_found += 1;
                tracing::debug!("Backfill {}: no opening line at any offset", game.id);
                if let Err(e) = db::mark_opening_not_found(pool, &game.id, Utc::now()).await {
                    report.errors += 1;
                    tracing::error!("Backfill {}: failed to mark opening line not found: {}", game.id, e);
                }
            }
        }
    }

    report.snapshot_fetches = backfiller.snapshot_fetches();
    tracing::info!(
        "Backfill {}: processed {}, updated {}, not found {}, errors {}, {} snapshot fetches",
        season,
        report.processed,
        report.updated,
        report.not_found,
        report.errors,
        report.snapshot_fetches
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bookmaker, Market, OddsEvent, Outcome};
    use crate::services::odds_fetcher::tests::FakeOddsProvider;
    use crate::models::OpeningStatus;
    use chrono::{DateTime, TimeZone};

    fn kickoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 18, 19, 0, 0).unwrap()
    }

    fn record(id: &str, home: &str, away: &str) -> GameRecord {
        record_at(id, home, away, kickoff())
    }

    fn record_at(id: &str, home: &str, away: &str, commence_time: DateTime<Utc>) -> GameRecord {
        GameRecord {
            id: id.to_string(),
            season: "2024-25".to_string(),
            date: commence_time.date_naive(),
            commence_time,
            home_team: home.to_string(),
            away_team: away.to_string(),
            venue: None,
            event_name: None,
            neutral_site: None,
            home_score: Some(70),
            away_score: Some(64),
            status: "final".to_string(),
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

    fn event(home: &str, away: &str, book: &str, home_point: f64) -> OddsEvent {
        OddsEvent {
            id: "evt".to_string(),
            home_team: home.to_string(),
            away_team: away.to_string(),
            bookmakers: vec![Bookmaker {
                key: book.to_string(),
                markets: vec![Market {
                    key: "spreads".to_string(),
                    outcomes: vec![Outcome { name: home.to_string(), price: Some(-110.0), point: Some(home_point) }],
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn backfiller(provider: &FakeOddsProvider) -> OpeningLineBackfiller<'_> {
        OpeningLineBackfiller::new(
            provider,
            TeamMatcher::default(),
            ClosingLineResolver::from_config(&EngineConfig::default()),
            vec![48, 36, 24, 12],
        )
    }

    #[tokio::test]
    async fn stops_at_first_offset_with_a_line() {
        let mut provider = FakeOddsProvider::default();
        provider.snapshots.insert(
            kickoff() - Duration::hours(24),
            vec![event("Purdue Boilermakers", "Indiana Hoosiers", "pinnacle", -6.0)],
        );
        provider.snapshots.insert(
            kickoff() - Duration::hours(12),
            vec![event("Purdue Boilermakers", "Indiana Hoosiers", "pinnacle", -7.5)],
        );

        let line = backfiller(&provider)
            .find_opening_line(&record("g1", "Purdue", "Indiana"))
            .await
            .unwrap();

        assert_eq!(line.spread, -6.0);
        assert_eq!(line.lookback_hours, 24);
        assert_eq!(
            provider.calls(),
            vec![
                kickoff() - Duration::hours(48),
                kickoff() - Duration::hours(36),
                kickoff() - Duration::hours(24),
            ]
        );
    }

    #[tokio::test]
    async fn provider_failure_moves_to_next_offset() {
        let mut provider = FakeOddsProvider::default();
        provider.failing.push(kickoff() - Duration::hours(48));
        provider.snapshots.insert(
            kickoff() - Duration::hours(36),
            vec![event("Purdue Boilermakers", "Indiana Hoosiers", "fanduel", -5.0)],
        );

        let line = backfiller(&provider)
            .find_opening_line(&record("g1", "Purdue", "Indiana"))
            .await
            .unwrap();
        assert_eq!(line.lookback_hours, 36);
        assert_eq!(line.source, LineSource::UsAverage);
    }

    #[tokio::test]
    async fn unmatched_game_is_not_found() {
        let mut provider = FakeOddsProvider::default();
        for h in [48, 36, 24, 12] {
            provider.snapshots.insert(
                kickoff() - Duration::hours(h),
                vec![event("Ohio Bobcats", "Kent State Golden Flashes", "pinnacle", -2.0)],
            );
        }
        let mut bf = backfiller(&provider);
        assert!(bf.find_opening_line(&record("g1", "Ohio State Buckeyes", "Kent State")).await.is_none());
        assert_eq!(provider.calls().len(), 4);
    }

    #[tokio::test]
    async fn games_sharing_an_hour_share_one_fetch() {
        let mut provider = FakeOddsProvider::default();
        provider.snapshots.insert(
            kickoff() - Duration::hours(48),
            vec![
                event("Purdue Boilermakers", "Indiana Hoosiers", "pinnacle", -6.0),
                event("Duke Blue Devils", "Virginia Cavaliers", "pinnacle", -8.0),
            ],
        );
        let mut bf = backfiller(&provider);
        let a = bf.find_opening_line(&record("g1", "Purdue", "Indiana")).await.unwrap();
        let b = bf.find_opening_line(&record("g2", "Duke", "Virginia")).await.unwrap();
        assert_eq!((a.spread, b.spread), (-6.0, -8.0));
        assert_eq!(bf.snapshot_fetches(), 1);
    }

    #[tokio::test]
    async fn batch_updates_found_games_and_counts_the_rest() {
        let pool = db::create_memory_pool().await.unwrap();
        db::init_database_with_pool(&pool).await.unwrap();
        db::insert_game(&pool, &record("g1", "Purdue", "Indiana")).await.unwrap();
        db::insert_game(&pool, &record("g2", "Duke", "Virginia")).await.unwrap();

        let mut provider = FakeOddsProvider::default();
        provider.snapshots.insert(
            kickoff() - Duration::hours(24),
            vec![event("Purdue Boilermakers", "Indiana Hoosiers", "pinnacle", -6.0)],
        );
        let config = EngineConfig {
            backfill_pacing: std::time::Duration::ZERO,
            ..EngineConfig::default()
        };

        let report = run_backfill(&pool, &provider, &config, "2024-25", None).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.not_found, 1);
        assert_eq!(report.errors, 0);
        // both games share the same four hour buckets
        assert_eq!(report.snapshot_fetches, 4);

        let g1 = db::get_game(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(g1.opening_spread, Some(-6.0));
        assert_eq!(g1.opening_lookback_hours, Some(24));
        assert_eq!(g1.home_score, Some(70));
        let g2 = db::get_game(&pool, "g2").await.unwrap().unwrap();
        assert_eq!(g2.opening_spread, None);
        assert_eq!(g2.opening_status, Some(OpeningStatus::NotFound));

        // only the unresolved game is picked up again
        let again = run_backfill(&pool, &provider, &config, "2024-25", None).await.unwrap();
        assert_eq!(again.processed, 1);
    }

    #[tokio::test]
    async fn unfindable_recent_game_does_not_starve_older_ones() {
        let pool = db::create_memory_pool().await.unwrap();
        db::init_database_with_pool(&pool).await.unwrap();
        let older = kickoff() - Duration::days(3);
        db::insert_game(&pool, &record_at("older", "Purdue", "Indiana", older)).await.unwrap();
        db::insert_game(&pool, &record_at("newer", "Duke", "Virginia", kickoff())).await.unwrap();

        let mut provider = FakeOddsProvider::default();
        provider.snapshots.insert(
            older - Duration::hours(48),
            vec![event("Purdue Boilermakers", "Indiana Hoosiers", "pinnacle", -6.0)],
        );
        let config = EngineConfig {
            backfill_pacing: std::time::Duration::ZERO,
            ..EngineConfig::default()
        };

        let first = run_backfill(&pool, &provider, &config, "2024-25", Some(1)).await.unwrap();
        assert_eq!((first.processed, first.updated, first.not_found), (1, 0, 1));
        let newer = db::get_game(&pool, "newer").await.unwrap().unwrap();
        assert_eq!(newer.opening_status, Some(OpeningStatus::NotFound));
        assert!(newer.opening_attempted_at.is_some());

        let second = run_backfill(&pool, &provider, &config, "2024-25", Some(1)).await.unwrap();
        assert_eq!((second.processed, second.updated), (1, 1));
        let older = db::get_game(&pool, "older").await.unwrap().unwrap();
        assert_eq!(older.opening_spread, Some(-6.0));
        assert_eq!(older.opening_status, Some(OpeningStatus::Found));
    }

    #[tokio::test]
    async fn failed_write_is_counted_and_batch_continues() {
        let pool = db::create_memory_pool().await.unwrap();
        db::init_database_with_pool(&pool).await.unwrap();
        db::insert_game(&pool, &record("g1", "Purdue", "Indiana")).await.unwrap();
        db::insert_game(&pool, &record("g2", "Duke", "Virginia")).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER fail_g1 BEFORE UPDATE OF opening_spread ON games WHEN NEW.id = 'g1' \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let mut provider = FakeOddsProvider::default();
        provider.snapshots.insert(
            kickoff() - Duration::hours(48),
            vec![
                event("Purdue Boilermakers", "Indiana Hoosiers", "pinnacle", -6.0),
                event("Duke Blue Devils", "Virginia Cavaliers", "pinnacle", -8.0),
            ],
        );
        let config = EngineConfig {
            backfill_pacing: std::time::Duration::ZERO,
            ..EngineConfig::default()
        };

        let report = run_backfill(&pool, &provider, &config, "2024-25", None).await.unwrap();
        assert_eq!((report.processed, report.updated, report.errors), (2, 1, 1));

        let g1 = db::get_game(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(g1.opening_spread, None);
        assert_eq!(g1.opening_status, None);
        let g2 = db::get_game(&pool, "g2").await.unwrap().unwrap();
        assert_eq!(g2.opening_spread, Some(-8.0));
    }
}
