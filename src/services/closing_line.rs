use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::models::{Bookmaker, ClosingLineResult, ClosingSourceMode, LineSource, OddsEvent};
use crate::utils::{mean, round_to_half};

const SPREADS_MARKET: &str = "spreads";

/// One way of turning a multi-book payload into a single home spread.
#[derive(Debug, Clone, PartialEq)]
pub enum LineStrategy {
    /// Take the named sharp book's home point as-is
    SharpBook { book: String },
    /// Average the home point across a priority set of retail books, to the nearest 0.5
    RetailAverage { books: Vec<String> },
}

impl LineStrategy {
    fn attempt(&self, event: &OddsEvent, home_team: &str, as_of: DateTime<Utc>) -> Option<ClosingLineResult> {
        match self {
            LineStrategy::SharpBook { book } => {
                let bk = event.bookmakers.iter().find(|b| b.key.eq_ignore_ascii_case(book))?;
                let point = home_spread_point(bk, home_team)?;
                Some(ClosingLineResult {
                    spread: Some(point),
                    source: LineSource::SharpBook,
                    bookmakers: vec![bk.key.clone()],
                    timestamp: bk.last_update.unwrap_or(as_of),
                })
            }
            LineStrategy::RetailAverage { books } => {
                let mut points = Vec::new();
                let mut contributors = Vec::new();
                let mut latest: Option<DateTime<Utc>> = None;

                for book in books {
                    let Some(bk) = event.bookmakers.iter().find(|b| b.key.eq_ignore_ascii_case(book)) else {
                        continue;
                    };
                    if let Some(point) = home_spread_point(bk, home_team) {
                        points.push(point);
                        contributors.push(bk.key.clone());
                        latest = latest.max(bk.last_update);
                    }
                }

                let avg = mean(&points)?;
                Some(ClosingLineResult {
                    spread: Some(round_to_half(avg)),
                    source: LineSource::UsAverage,
                    bookmakers: contributors,
                    timestamp: latest.unwrap_or(as_of),
                })
            }
        }
    }
}

/// Ordered fallback chain; the first strategy that yields a point wins.
#[derive(Debug, Clone)]
pub struct ClosingLineResolver {
    strategies: Vec<LineStrategy>,
}

impl ClosingLineResolver {
    pub fn new(strategies: Vec<LineStrategy>) -> Self {
        Self { strategies }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut strategies = Vec::with_capacity(2);
        if config.closing_source == ClosingSourceMode::Pinnacle {
            strategies.push(LineStrategy::SharpBook { book: config.sharp_book.clone() });
        }
        strategies.push(LineStrategy::RetailAverage { books: config.retail_books.clone() });
        Self::new(strategies)
    }

    /// Resolve the home spread for `event`. `home_team` is the home name as
    /// it appears in the payload's outcomes.
    pub fn resolve(&self, event: &OddsEvent, home_team: &str, as_of: DateTime<Utc>) -> ClosingLineResult {
        self.strategies
            .iter()
            .find_map(|s| s.attempt(event, home_team, as_of))
            .unwrap_or_else(|| ClosingLineResult::unavailable(as_of))
    }

    /// Resolve using the event's own home team name.
    pub fn resolve_event(&self, event: &OddsEvent, as_of: DateTime<Utc>) -> ClosingLineResult {
        self.resolve(event, &event.home_team, as_of)
    }
}

fn home_spread_point(bookmaker: &Bookmaker, home_team: &str) -> Option<f64> {
    let home = home_team.trim();
    bookmaker
        .markets
        .iter()
        .find(|m| m.key == SPREADS_MARKET)?
        .outcomes
        .iter()
        .find(|o| o.name.trim().eq_ignore_ascii_case(home))?
        .point
        .filter(|p| p.is_finite())
}
