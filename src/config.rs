use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::models::ClosingSourceMode;

pub const DEFAULT_RETAIL_BOOKS: [&str; 5] =
    ["draftkings", "fanduel", "betmgm", "williamhill_us", "betrivers"];
pub const DEFAULT_LOOKBACK_HOURS: [i64; 4] = [48, 36, 24, 12];

/// Tunables for projection, closing-line resolution and backfill.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub odds_api_key: Option<String>,
    pub odds_api_base_url: String,
    pub sport_key: String,
    /// Home-court advantage in rating points
    pub home_court_advantage: f64,
    /// Fraction of (closing - projected) applied per game
    pub damping_factor: f64,
    pub closing_source: ClosingSourceMode,
    pub sharp_book: String,
    pub retail_books: Vec<String>,
    pub lookback_hours: Vec<i64>,
    pub backfill_batch_size: usize,
    pub backfill_pacing: Duration,
    pub live_odds_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:../data/ratingforge.db".to_string(),
            odds_api_key: None,
            odds_api_base_url: "https://api.the-odds-api.com".to_string(),
            sport_key: "basketball_ncaab".to_string(),
            home_court_advantage: 3.0,
            damping_factor: 0.1,
            closing_source: ClosingSourceMode::Pinnacle,
            sharp_book: "pinnacle".to_string(),
            retail_books: DEFAULT_RETAIL_BOOKS.iter().map(|b| b.to_string()).collect(),
            lookback_hours: DEFAULT_LOOKBACK_HOURS.to_vec(),
            backfill_batch_size: 50,
            backfill_pacing: Duration::from_millis(500),
            live_odds_ttl: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    /// Build from the process environment (after `dotenv`), falling back to defaults.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            odds_api_key: get("ODDS_API_KEY").map(|k| k.trim().to_string()),
            odds_api_base_url: get("ODDS_API_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.odds_api_base_url),
            sport_key: get("SPORT_KEY").unwrap_or(defaults.sport_key),
            home_court_advantage: parse_or("HOME_COURT_ADVANTAGE", get("HOME_COURT_ADVANTAGE"), defaults.home_court_advantage)?,
            damping_factor: parse_or("DAMPING_FACTOR", get("DAMPING_FACTOR"), defaults.damping_factor)?,
            closing_source: match get("CLOSING_SOURCE") {
                Some(v) => v.parse()?,
                None => defaults.closing_source,
            },
            sharp_book: get("SHARP_BOOK").unwrap_or(defaults.sharp_book),
            retail_books: get("RETAIL_BOOKS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.retail_books),
            lookback_hours: match get("BACKFILL_LOOKBACK_HOURS") {
                Some(v) => split_list(&v)
                    .iter()
                    .map(|h| parse_value("BACKFILL_LOOKBACK_HOURS", h))
                    .collect::<EngineResult<Vec<i64>>>()?,
                None => defaults.lookback_hours,
            },
            backfill_batch_size: parse_or("BACKFILL_BATCH_SIZE", get("BACKFILL_BATCH_SIZE"), defaults.backfill_batch_size)?,
            backfill_pacing: Duration::from_millis(parse_or(
                "BACKFILL_PACING_MS",
                get("BACKFILL_PACING_MS"),
                defaults.backfill_pacing.as_millis() as u64,
            )?),
            live_odds_ttl: Duration::from_secs(parse_or(
                "LIVE_ODDS_TTL_SECS",
                get("LIVE_ODDS_TTL_SECS"),
                defaults.live_odds_ttl.as_secs(),
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !self.home_court_advantage.is_finite() {
            return Err(EngineError::InvalidConfig("HOME_COURT_ADVANTAGE must be finite".into()));
        }
        if !(self.damping_factor > 0.0 && self.damping_factor <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "DAMPING_FACTOR must be in (0, 1], got {}",
                self.damping_factor
            )));
        }
        if self.lookback_hours.is_empty() || self.lookback_hours.iter().any(|h| *h <= 0) {
            return Err(EngineError::InvalidConfig(
                "BACKFILL_LOOKBACK_HOURS must list positive hour offsets".into(),
            ));
        }
        if self.backfill_batch_size == 0 {
            return Err(EngineError::InvalidConfig("BACKFILL_BATCH_SIZE must be > 0".into()));
        }
        if self.retail_books.is_empty() {
            return Err(EngineError::InvalidConfig("RETAIL_BOOKS must not be empty".into()));
        }
        Ok(())
    }

    pub fn require_odds_api_key(&self) -> EngineResult<&str> {
        self.odds_api_key
            .as_deref()
            .ok_or(EngineError::MissingCredential("ODDS_API_KEY"))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> EngineResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| EngineError::InvalidConfig(format!("{} has invalid value '{}'", key, raw)))
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> EngineResult<T> {
    match raw {
        Some(v) => parse_value(key, &v),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> EngineResult<EngineConfig> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EngineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.lookback_hours, vec![48, 36, 24, 12]);
        assert_eq!(config.closing_source, ClosingSourceMode::Pinnacle);
        assert_eq!(config.backfill_batch_size, 50);
        assert!(config.odds_api_key.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("HOME_COURT_ADVANTAGE", "3.5"),
            ("DAMPING_FACTOR", "0.25"),
            ("CLOSING_SOURCE", "us_average"),
            ("RETAIL_BOOKS", "FanDuel, draftkings"),
            ("BACKFILL_LOOKBACK_HOURS", "24,6"),
            ("ODDS_API_BASE_URL", "http://localhost:9000/"),
        ])
        .unwrap();
        assert_eq!(config.home_court_advantage, 3.5);
        assert_eq!(config.damping_factor, 0.25);
        assert_eq!(config.closing_source, ClosingSourceMode::UsAverage);
        assert_eq!(config.retail_books, vec!["fanduel", "draftkings"]);
        assert_eq!(config.lookback_hours, vec![24, 6]);
        assert_eq!(config.odds_api_base_url, "http://localhost:9000");
    }

    #[test]
    fn rejects_out_of_range_damping() {
        assert!(config_from(&[("DAMPING_FACTOR", "1.5")]).is_err());
        assert!(config_from(&[("DAMPING_FACTOR", "0")]).is_err());
        assert!(config_from(&[("DAMPING_FACTOR", "abc")]).is_err());
    }

    #[test]
    fn missing_key_is_reported() {
        let config = config_from(&[]).unwrap();
        assert!(matches!(
            config.require_odds_api_key(),
            Err(EngineError::MissingCredential("ODDS_API_KEY"))
        ));
    }
}
