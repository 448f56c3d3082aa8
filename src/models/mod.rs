use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// External naming schemes a team name can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameProvider {
    /// The power-rating provider (source of `source_name`)
    Ratings,
    /// Network stats provider (game schedules and results)
    Espn,
    /// The Odds API payloads
    OddsApi,
    /// Sportsbook review site
    Sbr,
}

/// Per-provider alternate spellings for one team.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateNames {
    pub espn_name: Option<String>,
    pub odds_api_name: Option<String>,
    pub sbr_name: Option<String>,
}

impl AlternateNames {
    pub fn for_provider(&self, provider: NameProvider) -> Option<&str> {
        match provider {
            NameProvider::Ratings => None,
            NameProvider::Espn => self.espn_name.as_deref(),
            NameProvider::OddsApi => self.odds_api_name.as_deref(),
            NameProvider::Sbr => self.sbr_name.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.espn_name.is_none() && self.odds_api_name.is_none() && self.sbr_name.is_none()
    }

    /// (provider, name) pairs that are set.
    pub fn bound(&self) -> Vec<(NameProvider, &str)> {
        [NameProvider::Espn, NameProvider::OddsApi, NameProvider::Sbr]
            .into_iter()
            .filter_map(|p| self.for_provider(p).map(|n| (p, n)))
            .collect()
    }

    pub fn clear(&mut self, provider: NameProvider) {
        match provider {
            NameProvider::Ratings => {}
            NameProvider::Espn => self.espn_name = None,
            NameProvider::OddsApi => self.odds_api_name = None,
            NameProvider::Sbr => self.sbr_name = None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamRating {
    pub team_name: String,
    pub source_name: String,
    pub alternate_names: Option<AlternateNames>,
    pub rating: f64,
    pub initial_rating: f64,
    pub games_processed: u32,
    pub last_updated: DateTime<Utc>,
    pub conference: Option<String>,
}

impl TeamRating {
    pub fn seeded(
        team_name: String,
        source_name: String,
        conference: Option<String>,
        rating: f64,
        seeded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            team_name,
            source_name,
            alternate_names: None,
            rating,
            initial_rating: rating,
            games_processed: 0,
            last_updated: seeded_at,
            conference,
        }
    }

    /// Net movement away from the seed value.
    pub fn drift(&self) -> f64 {
        self.rating - self.initial_rating
    }
}

/// Which resolution path produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSource {
    SharpBook,
    UsAverage,
    Unavailable,
}

impl LineSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineSource::SharpBook => "sharp_book",
            LineSource::UsAverage => "us_average",
            LineSource::Unavailable => "unavailable",
        }
    }
}

impl FromStr for LineSource {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sharp_book" => Ok(LineSource::SharpBook),
            "us_average" => Ok(LineSource::UsAverage),
            "unavailable" => Ok(LineSource::Unavailable),
            other => Err(EngineError::InvalidConfig(format!("unknown line source '{}'", other))),
        }
    }
}

/// Outcome of the last opening-line lookup for a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpeningStatus {
    Found,
    NotFound,
}

impl OpeningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpeningStatus::Found => "found",
            OpeningStatus::NotFound => "not_found",
        }
    }
}

impl FromStr for OpeningStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "found" => Ok(OpeningStatus::Found),
            "not_found" => Ok(OpeningStatus::NotFound),
            other => Err(EngineError::InvalidConfig(format!("unknown opening status '{}'", other))),
        }
    }
}

/// Configured closing-line policy (`CLOSING_SOURCE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingSourceMode {
    /// Sharp book first, retail average as fallback
    Pinnacle,
    /// Retail average only
    UsAverage,
}

impl fmt::Display for ClosingSourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosingSourceMode::Pinnacle => write!(f, "pinnacle"),
            ClosingSourceMode::UsAverage => write!(f, "us_average"),
        }
    }
}

impl FromStr for ClosingSourceMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pinnacle" | "sharp" => Ok(ClosingSourceMode::Pinnacle),
            "us_average" | "us-average" | "us" => Ok(ClosingSourceMode::UsAverage),
            other => Err(EngineError::InvalidConfig(format!(
                "CLOSING_SOURCE must be 'pinnacle' or 'us_average', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosingLineResult {
    pub spread: Option<f64>,
    pub source: LineSource,
    pub bookmakers: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ClosingLineResult {
    pub fn unavailable(timestamp: DateTime<Utc>) -> Self {
        Self {
            spread: None,
            source: LineSource::Unavailable,
            bookmakers: Vec::new(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameAdjustment {
    pub run_id: String,
    pub game_id: String,
    pub date: NaiveDate,
    pub home_team: String,
    pub away_team: String,
    pub is_neutral_site: bool,
    pub home_rating_before: f64,
    pub away_rating_before: f64,
    pub projected_spread: f64,
    pub closing_spread: f64,
    pub closing_source: LineSource,
    pub difference: f64,
    pub adjustment: f64,
    pub home_rating_after: f64,
    pub away_rating_after: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingsSnapshot {
    pub id: String,
    pub season: String,
    pub as_of_date: NaiveDate,
    pub home_court_advantage: f64,
    pub closing_source: ClosingSourceMode,
    pub games_processed: u32,
    pub teams: Vec<TeamRating>,
    pub adjustments: Vec<GameAdjustment>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamOverride {
    pub source_name: String,
    pub canonical_name: String,
    #[serde(flatten)]
    pub alternates: AlternateNames,
}

/// A game as recorded from the schedule provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: String,
    pub season: String,
    pub date: NaiveDate,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    pub venue: Option<String>,
    pub event_name: Option<String>,
    pub neutral_site: Option<bool>,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub status: String, // "scheduled", "final"
    pub opening_spread: Option<f64>,
    pub opening_source: Option<LineSource>,
    pub opening_lookback_hours: Option<i64>,
    pub opening_status: Option<OpeningStatus>,
    pub opening_attempted_at: Option<DateTime<Utc>>,
    pub closing_spread: Option<f64>,
    pub closing_source: Option<LineSource>,
    pub adjusted_run_id: Option<String>,
}

// ── Odds API wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OddsEvent {
    pub id: String,
    pub sport_key: String,
    pub commence_time: Option<DateTime<Utc>>,
    pub home_team: String,
    pub away_team: String,
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Bookmaker {
    pub key: String,
    pub title: String,
    pub last_update: Option<DateTime<Utc>>,
    pub markets: Vec<Market>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Market {
    pub key: String,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Outcome {
    pub name: String,
    pub price: Option<f64>,
    pub point: Option<f64>,
}

/// Response of the historical odds endpoint: the odds "as of" `timestamp`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricalOdds {
    pub timestamp: Option<DateTime<Utc>>,
    pub previous_timestamp: Option<DateTime<Utc>>,
    pub next_timestamp: Option<DateTime<Utc>>,
    pub data: Vec<OddsEvent>,
}

// API Response types
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternates_report_only_bound_providers() {
        let alts = AlternateNames {
            espn_name: Some("UConn Huskies".into()),
            odds_api_name: None,
            sbr_name: Some("UConn".into()),
        };
        let bound = alts.bound();
        assert_eq!(bound.len(), 2);
        assert_eq!(alts.for_provider(NameProvider::Sbr), Some("UConn"));
        assert_eq!(alts.for_provider(NameProvider::Ratings), None);
    }

    #[test]
    fn closing_source_mode_parses_aliases() {
        assert_eq!("Pinnacle".parse::<ClosingSourceMode>().unwrap(), ClosingSourceMode::Pinnacle);
        assert_eq!("us-average".parse::<ClosingSourceMode>().unwrap(), ClosingSourceMode::UsAverage);
        assert!("bovada".parse::<ClosingSourceMode>().is_err());
    }

    #[test]
    fn odds_event_tolerates_missing_fields() {
        let json = r#"{"id":"abc","home_team":"Duke Blue Devils","away_team":"UNC Tar Heels",
            "bookmakers":[{"key":"pinnacle","markets":[{"key":"spreads",
            "outcomes":[{"name":"Duke Blue Devils","price":-110,"point":-4.5}]}]}]}"#;
        let event: OddsEvent = serde_json::from_str(json).unwrap();
        assert!(event.commence_time.is_none());
        assert_eq!(event.bookmakers[0].markets[0].outcomes[0].point, Some(-4.5));
    }
}
