use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::EngineConfig;
use crate::db;
use crate::error::EngineError;
use crate::models::{ClosingLineResult, NameProvider, TeamRating};
use crate::services::closing_line::ClosingLineResolver;
use crate::services::odds_fetcher::OddsProvider;
use crate::services::team_matcher::TeamMatcher;

/// Venue / event keywords that mark a game as neutral-site.
const NEUTRAL_KEYWORDS: [&str; 7] = [
    "tournament",
    "championship",
    "neutral",
    "classic",
    "invitational",
    "showcase",
    "bowl",
];

/// Projected home spread (negative = home favored).
///
/// `(away - home) - hca`, with no home edge on neutral floors.
pub fn project(home_rating: f64, away_rating: f64, hca: f64, is_neutral_site: bool) -> f64 {
    let home_edge = if is_neutral_site { 0.0 } else { hca };
    (away_rating - home_rating) - home_edge
}

/// Neutral-site call for a game: an explicit provider flag wins, otherwise
/// keyword heuristics over venue and event name.
pub fn is_neutral_site(explicit: Option<bool>, venue: Option<&str>, event_name: Option<&str>) -> bool {
    if let Some(flag) = explicit {
        return flag;
    }
    [venue, event_name]
        .into_iter()
        .flatten()
        .map(str::to_lowercase)
        .any(|text| NEUTRAL_KEYWORDS.iter().any(|kw| text.contains(kw)))
}

#[derive(Debug, Clone, Copy)]
pub struct SpreadProjector {
    pub home_court_advantage: f64,
}

impl SpreadProjector {
    pub fn new(home_court_advantage: f64) -> Self {
        Self { home_court_advantage }
    }

    pub fn project(&self, home_rating: f64, away_rating: f64, is_neutral_site: bool) -> f64 {
        project(home_rating, away_rating, self.home_court_advantage, is_neutral_site)
    }
}

/// Forward projection for one matchup, with the live market line when an
/// odds provider is available.
#[derive(Debug, Clone, Serialize)]
pub struct MatchupProjection {
    pub season: String,
    pub home_team: String,
    pub away_team: String,
    pub home_rating: f64,
    pub away_rating: f64,
    pub is_neutral_site: bool,
    pub home_court_advantage: f64,
    pub projected_spread: f64,
    pub market: Option<ClosingLineResult>,
    /// market - projected; negative means the market likes the home side more
    pub edge: Option<f64>,
}

fn find_team<'r>(matcher: &TeamMatcher, ratings: &'r [TeamRating], name: &str) -> Result<&'r TeamRating> {
    let names: Vec<&str> = ratings.iter().map(|r| r.team_name.as_str()).collect();
    match matcher.resolve(name, &names, NameProvider::Ratings) {
        Some(m) => Ok(&ratings[m.index]),
        None => {
            let hint = TeamMatcher::suggest(name, &names)
                .map(|(closest, _)| format!(" (did you mean '{}'?)", closest))
                .unwrap_or_default();
            Err(EngineError::UnknownTeam(format!("{}{}", name, hint)).into())
        }
    }
}

pub async fn project_matchup(
    pool: &SqlitePool,
    config: &EngineConfig,
    provider: Option<&dyn OddsProvider>,
    season: &str,
    home: &str,
    away: &str,
    neutral: bool,
) -> Result<MatchupProjection> {
    let ratings = db::get_team_ratings(pool, season).await?;
    if ratings.is_empty() {
        return Err(EngineError::SeasonNotSeeded(season.to_string()).into());
    }

    let matcher = TeamMatcher::new(db::load_override_table(pool).await?);
    let home_team = find_team(&matcher, &ratings, home)?;
    let away_team = find_team(&matcher, &ratings, away)?;

    let projector = SpreadProjector::new(config.home_court_advantage);
    let projected_spread = projector.project(home_team.rating, away_team.rating, neutral);

    let market = match provider {
        Some(p) => match p.live_odds().await {
            Ok(events) => matcher
                .find_game(&home_team.team_name, &away_team.team_name, &events)
                .map(|event| ClosingLineResolver::from_config(config).resolve_event(event, Utc::now()))
                .filter(|line| line.spread.is_some()),
            Err(e) => {
                tracing::warn!("Live odds unavailable for projection: {:#}", e);
                None
            }
        },
        None => None,
    };
    let edge = market.as_ref().and_then(|m| m.spread).map(|s| s - projected_spread);

    Ok(MatchupProjection {
        season: season.to_string(),
        home_team: home_team.team_name.clone(),
        away_team: away_team.team_name.clone(),
        home_rating: home_team.rating,
        away_rating: away_team.rating,
        is_neutral_site: neutral,
        home_court_advantage: projector.home_court_advantage,
        projected_spread,
        market,
        edge,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_favorite_gets_negative_spread() {
        assert_eq!(project(10.0, 8.0, 1.0, false), -3.0);
        assert_eq!(project(10.0, 8.0, 1.0, true), -2.0);
    }

    #[test]
    fn neutral_and_home_differ_by_hca() {
        let cases = [(10.0, 8.0, 1.0), (-4.5, 12.25, 3.2), (0.0, 0.0, 0.0), (22.0, 22.0, 4.0)];
        for (h, a, hca) in cases {
            let diff = project(h, a, hca, true) - project(h, a, hca, false);
            assert!((diff - hca).abs() < 1e-9, "h={} a={} hca={}", h, a, hca);
        }
    }

    #[test]
    fn explicit_flag_overrides_keywords() {
        assert!(!is_neutral_site(Some(false), Some("Madison Square Garden"), Some("Big East Tournament")));
        assert!(is_neutral_site(Some(true), Some("Cameron Indoor Stadium"), None));
    }

    #[test]
    fn keywords_mark_neutral_site() {
        assert!(is_neutral_site(None, None, Some("NCAA Championship - First Round")));
        assert!(is_neutral_site(None, Some("Neutral site: Barclays Center"), None));
        assert!(is_neutral_site(None, None, Some("Maui Invitational")));
        assert!(!is_neutral_site(None, Some("Allen Fieldhouse"), Some("Regular Season")));
        assert!(!is_neutral_site(None, None, None));
    }

    #[test]
    fn projector_uses_configured_hca() {
        let p = SpreadProjector::new(3.0);
        assert_eq!(p.project(15.0, 15.0, false), -3.0);
        assert_eq!(p.project(15.0, 15.0, true), 0.0);
    }

    async fn seeded_pool() -> SqlitePool {
        let pool = db::create_memory_pool().await.unwrap();
        db::init_database_with_pool(&pool).await.unwrap();
        for (name, rating) in [("Duke", 24.0), ("North Carolina", 19.5)] {
            let team = TeamRating::seeded(name.into(), name.into(), None, rating, Utc::now());
            db::upsert_team_rating(&pool, "2024-25", &team).await.unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn matchup_projection_includes_live_market() {
        use crate::models::{Bookmaker, LineSource, Market, OddsEvent, Outcome};
        use crate::services::odds_fetcher::tests::FakeOddsProvider;

        let pool = seeded_pool().await;
        let provider = FakeOddsProvider {
            live: vec![OddsEvent {
                id: "e1".into(),
                home_team: "Duke Blue Devils".into(),
                away_team: "North Carolina Tar Heels".into(),
                bookmakers: vec![Bookmaker {
                    key: "pinnacle".into(),
                    markets: vec![Market {
                        key: "spreads".into(),
                        outcomes: vec![Outcome {
                            name: "Duke Blue Devils".into(),
                            price: Some(-108.0),
                            point: Some(-9.5),
                        }],
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let config = EngineConfig::default();

        let p = project_matchup(&pool, &config, Some(&provider), "2024-25", "duke", "North Carolina", false)
            .await
            .unwrap();
        assert_eq!(p.home_team, "Duke");
        assert!((p.projected_spread + 7.5).abs() < 1e-9);
        let market = p.market.unwrap();
        assert_eq!(market.source, LineSource::SharpBook);
        assert!((p.edge.unwrap() + 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_team_is_reported() {
        let pool = seeded_pool().await;
        let err = project_matchup(&pool, &EngineConfig::default(), None, "2024-25", "Gonzaga", "Duke", true)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::UnknownTeam(_))));

        let err = project_matchup(&pool, &EngineConfig::default(), None, "2023-24", "Duke", "North Carolina", true)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::SeasonNotSeeded(_))));
    }
}
