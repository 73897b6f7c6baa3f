use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use clickfit_storage::WorkoutError;

use crate::problem::ProblemResponse;
use crate::router::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default)]
    limit: Option<i64>,
}

/// Most recent workouts, newest first, with the author's display name.
pub async fn recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Value>, ProblemResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let workouts = state
        .storage()
        .workouts()
        .list_recent(limit)
        .await
        .map_err(read_problem)?;
    Ok(Json(json!({ "workouts": workouts })))
}

pub async fn totals(State(state): State<AppState>) -> Result<Json<Value>, ProblemResponse> {
    let totals = state
        .storage()
        .workouts()
        .user_totals()
        .await
        .map_err(read_problem)?;
    Ok(Json(json!({ "totals": totals })))
}

fn read_problem(err: WorkoutError) -> ProblemResponse {
    error!(stage = "storage", error = %err, "failed to read workouts");
    ProblemResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "storage_error",
        "failed to read workouts",
    )
}
