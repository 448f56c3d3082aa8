mod api;
mod cache;
mod cli;
mod config;
mod db;
mod error;
mod models;
mod services;
mod utils;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;

#[derive(Parser)]
#[command(name = "ratingforge")]
#[command(about = "Market-calibrated team power ratings and spread projections")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Initialize the database and default name overrides
    InitDb,
    /// Seed a season's starting ratings
    Seed {
        #[arg(short, long)]
        season: String,
        /// CSV with team,conference,rating columns
        #[arg(short, long, conflicts_with = "url")]
        file: Option<PathBuf>,
        /// JSON endpoint returning [{team, conference, rating}]
        #[arg(short, long)]
        url: Option<String>,
        /// Snapshot date (defaults to today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Replace ratings already seeded for this season
        #[arg(long)]
        force: bool,
    },
    /// Manage team name overrides
    Override {
        #[command(subcommand)]
        action: OverrideAction,
    },
    /// Import recorded games from CSV
    ImportGames {
        #[arg(short, long)]
        season: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Adjust ratings against closing lines for one day's games
    Recalibrate {
        #[arg(short, long)]
        season: String,
        #[arg(short, long)]
        date: NaiveDate,
    },
    /// Fill opening spreads from historical odds
    Backfill {
        #[arg(short, long)]
        season: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Project the spread for a matchup
    Project {
        #[arg(short, long)]
        season: String,
        #[arg(long)]
        home: String,
        #[arg(long)]
        away: String,
        #[arg(long)]
        neutral: bool,
    },
    /// Show the current ratings table
    Ratings {
        #[arg(short, long)]
        season: String,
        #[arg(short, long, default_value = "25")]
        top: usize,
    },
}

#[derive(Subcommand)]
enum OverrideAction {
    /// Create or replace an override
    Set {
        #[arg(long)]
        source: String,
        #[arg(long)]
        canonical: String,
        #[arg(long)]
        espn: Option<String>,
        #[arg(long)]
        odds_api: Option<String>,
        #[arg(long)]
        sbr: Option<String>,
    },
    /// List all overrides
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ratingforge=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;

    match cli.command {
        Some(Commands::Serve { port }) => {
            tracing::info!("Starting RatingForge API server on port {}", port);
            api::serve(config, port).await?;
        }
        Some(Commands::InitDb) => {
            tracing::info!("Initializing database...");
            cli::init_db(&config).await?;
        }
        Some(Commands::Seed { season, file, url, as_of, force }) => {
            cli::seed_season(&config, &season, file.as_deref(), url.as_deref(), as_of, force).await?;
        }
        Some(Commands::Override { action }) => match action {
            OverrideAction::Set { source, canonical, espn, odds_api, sbr } => {
                cli::set_override(&config, &source, &canonical, espn, odds_api, sbr).await?;
            }
            OverrideAction::List => cli::list_overrides(&config).await?,
        },
        Some(Commands::ImportGames { season, file }) => {
            cli::import_games(&config, &season, &file).await?;
        }
        Some(Commands::Recalibrate { season, date }) => {
            tracing::info!("Recalibrating {} for {}", season, date);
            cli::recalibrate(&config, &season, date).await?;
        }
        Some(Commands::Backfill { season, limit }) => {
            tracing::info!("Backfilling opening lines for {}", season);
            cli::backfill(&config, &season, limit).await?;
        }
        Some(Commands::Project { season, home, away, neutral }) => {
            cli::project(&config, &season, &home, &away, neutral).await?;
        }
        Some(Commands::Ratings { season, top }) => {
            cli::show_ratings(&config, &season, top).await?;
        }
        None => {
            // Default to serving
            tracing::info!("Starting RatingForge API server on port 3000");
            api::serve(config, 3000).await?;
        }
    }

    Ok(())
}
