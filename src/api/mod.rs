use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::EngineConfig;
use crate::db::{self, create_pool, init_database_with_pool, SnapshotSummary};
use crate::error::EngineError;
use crate::models::{ApiResponse, GameAdjustment, TeamOverride, TeamRating};
use crate::services::odds_fetcher::{OddsApiClient, OddsProvider};
use crate::services::spread_projector::{project_matchup, MatchupProjection};
use crate::services::team_matcher::ClearedBinding;
use crate::utils::validate_team_name;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<EngineConfig>,
    /// Shared so the live-odds freshness cache spans requests
    pub odds: Option<Arc<dyn OddsProvider>>,
}

pub async fn serve(config: EngineConfig, port: u16) -> anyhow::Result<()> {
    let pool = create_pool(&config.database_url).await?;
    init_database_with_pool(&pool).await?;

    let odds: Option<Arc<dyn OddsProvider>> = match OddsApiClient::new(&config) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!("Live odds disabled: {}", e);
            None
        }
    };

    let state = AppState { pool, config: Arc::new(config), odds };
    let app = create_router().with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("RatingForge API server listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/seasons/{season}/ratings", get(get_ratings_handler))
        .route("/seasons/{season}/snapshots", get(get_snapshots_handler))
        .route("/seasons/{season}/adjustments", get(get_adjustments_handler))
        .route("/seasons/{season}/projection", get(get_projection_handler))
        .route("/overrides", get(get_overrides_handler).post(upsert_override_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
        )
}

// Health check endpoint
async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("RatingForge API is running"))
}

// GET /seasons/{season}/ratings - current ratings, best first
async fn get_ratings_handler(
    State(state): State<AppState>,
    Path(season): Path<String>,
) -> Result<Json<ApiResponse<Vec<TeamRating>>>, StatusCode> {
    match db::get_team_ratings(&state.pool, &season).await {
        Ok(ratings) if ratings.is_empty() => Err(StatusCode::NOT_FOUND),
        Ok(ratings) => Ok(Json(ApiResponse::success(ratings))),
        Err(e) => {
            tracing::error!("Failed to fetch ratings for {}: {}", season, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// GET /seasons/{season}/snapshots - snapshot history
async fn get_snapshots_handler(
    State(state): State<AppState>,
    Path(season): Path<String>,
) -> Result<Json<ApiResponse<Vec<SnapshotSummary>>>, StatusCode> {
    match db::list_snapshots(&state.pool, &season).await {
        Ok(snapshots) => Ok(Json(ApiResponse::success(snapshots))),
        Err(e) => {
            tracing::error!("Failed to fetch snapshots for {}: {}", season, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Deserialize)]
struct AdjustmentsQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

// GET /seasons/{season}/adjustments?from=&to= - per-game audit trail
async fn get_adjustments_handler(
    State(state): State<AppState>,
    Path(season): Path<String>,
    Query(params): Query<AdjustmentsQuery>,
) -> Result<Json<ApiResponse<Vec<GameAdjustment>>>, StatusCode> {
    match db::get_game_adjustments(&state.pool, &season, params.from, params.to).await {
        Ok(adjustments) => Ok(Json(ApiResponse::success(adjustments))),
        Err(e) => {
            tracing::error!("Failed to fetch adjustments for {}: {}", season, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Deserialize)]
struct ProjectionQuery {
    home: String,
    away: String,
    #[serde(default)]
    neutral: bool,
}

// GET /seasons/{season}/projection?home=&away=&neutral=
async fn get_projection_handler(
    State(state): State<AppState>,
    Path(season): Path<String>,
    Query(params): Query<ProjectionQuery>,
) -> Result<Json<ApiResponse<MatchupProjection>>, (StatusCode, Json<ApiResponse<()>>)> {
    let result = project_matchup(
        &state.pool,
        &state.config,
        state.odds.as_deref(),
        &season,
        &params.home,
        &params.away,
        params.neutral,
    )
    .await;

    match result {
        Ok(projection) => Ok(Json(ApiResponse::success(projection))),
        Err(e) => {
            let status = match e.downcast_ref::<EngineError>() {
                Some(EngineError::UnknownTeam(_)) | Some(EngineError::SeasonNotSeeded(_)) => StatusCode::NOT_FOUND,
                _ => {
                    tracing::error!("Projection failed: {:#}", e);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            Err((status, Json(ApiResponse::error(e.to_string()))))
        }
    }
}

// GET /overrides
async fn get_overrides_handler(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<TeamOverride>>>, StatusCode> {
    match db::get_overrides(&state.pool).await {
        Ok(overrides) => Ok(Json(ApiResponse::success(overrides))),
        Err(e) => {
            tracing::error!("Failed to fetch overrides: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Serialize)]
struct OverrideWriteResult {
    #[serde(rename = "override")]
    saved: TeamOverride,
    cleared: Vec<ClearedBinding>,
}

// POST /overrides - last write wins, displaced bindings are reported back
async fn upsert_override_handler(
    State(state): State<AppState>,
    Json(request): Json<TeamOverride>,
) -> Result<Json<ApiResponse<OverrideWriteResult>>, StatusCode> {
    if !validate_team_name(&request.source_name) || !validate_team_name(&request.canonical_name) {
        return Err(StatusCode::BAD_REQUEST);
    }

    match db::upsert_override(&state.pool, &request).await {
        Ok(cleared) => Ok(Json(ApiResponse::success(OverrideWriteResult { saved: request, cleared }))),
        Err(e) => {
            tracing::error!("Failed to save override {}: {}", request.source_name, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
