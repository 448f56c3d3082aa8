use thiserror::Error;

/// Engine-level failures callers need to branch on.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Season {0} has no ratings; run `seed` first")]
    SeasonNotSeeded(String),

    #[error("Season {season} already has {teams} team ratings (use --force to reseed)")]
    SeasonAlreadySeeded { season: String, teams: i64 },

    #[error("Unknown team: {0}")]
    UnknownTeam(String),

    // Upstream odds / ratings provider answered with a non-2xx status
    #[error("Game {0} was already adjusted by another run")]
    AlreadyAdjusted(String),

    #[error("Provider error (status {status}): {body}")]
    Provider { status: u16, body: String },

    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Seed file error: {0}")]
    Seed(#[from] csv::Error),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
