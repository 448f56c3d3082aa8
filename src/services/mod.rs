pub mod closing_line;
pub mod odds_fetcher;
pub mod opening_line_backfill;
pub mod rating_adjuster;
pub mod rating_seed;
pub mod spread_projector;
pub mod team_matcher;
