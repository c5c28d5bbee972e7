use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_core::{CadenceError, HabitStats, RecurrenceRule, RecurringCompletion, Task};

use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/tasks", post(create_task))
        .route("/api/v1/tasks/:id", get(get_task).delete(delete_task))
        .route(
            "/api/v1/tasks/:id/completions",
            post(record_completion).get(list_completions),
        )
        .route("/api/v1/tasks/:id/completions/skip", post(record_skip))
        .route(
            "/api/v1/tasks/:id/completions/:date",
            delete(delete_completion),
        )
        .route("/api/v1/tasks/:id/stats", get(habit_stats))
        .route("/api/v1/calendar/:token/feed.ics", get(calendar_feed))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn err_json(msg: impl ToString) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: msg.to_string(),
    })
}

fn map_engine_error(err: CadenceError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &err {
        CadenceError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        CadenceError::InvalidOccurrence { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CadenceError::InvalidRecurrenceRule(_) | CadenceError::InvalidInput(_) => {
            StatusCode::BAD_REQUEST
        }
        CadenceError::Storage(_) | CadenceError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err_json(err))
}

fn parse_task_id(raw: &str) -> Result<Uuid, (StatusCode, Json<ErrorBody>)> {
    Uuid::parse_str(raw).map_err(|_| (StatusCode::BAD_REQUEST, err_json("invalid task id")))
}

fn parse_iso_date(raw: &str, field: &str) -> Result<NaiveDate, (StatusCode, Json<ErrorBody>)> {
    raw.trim().parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            err_json(format!("{field} must be a YYYY-MM-DD date")),
        )
    })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ── Tasks ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub notes: Option<String>,
    pub project: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub habit_mode: bool,
    pub recurrence: Option<RecurrenceRule>,
    pub owner_id: Option<Uuid>,
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, err_json("task name cannot be empty")).into_response();
    }

    let mut task = Task::new(req.owner_id.unwrap_or_else(Uuid::nil), req.name)
        .with_tags(req.tags)
        .with_priority(req.priority)
        .with_habit_mode(req.habit_mode);
    task.notes = req.notes;
    task.project = req.project;
    task.due_date = req.due_date;
    if let Some(rule) = req.recurrence {
        task.recurrence = rule;
    }

    match state.engine.create_task(task).await {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(err) => map_engine_error(err).into_response(),
    }
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(reply) => return reply.into_response(),
    };
    match state.engine.get_task(task_id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, err_json("task not found")).into_response(),
        Err(err) => map_engine_error(err).into_response(),
    }
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(reply) => return reply.into_response(),
    };
    match state.engine.delete_task(task_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, err_json("task not found")).into_response(),
        Err(err) => map_engine_error(err).into_response(),
    }
}

// ── Completions ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RecordCompletionRequest {
    pub date: NaiveDate,
    /// Wall-clock completion time; defaults to now. The occurrence this
    /// applies to is `date`, not this timestamp's calendar day.
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct RecordSkipRequest {
    pub date: NaiveDate,
}

#[derive(Serialize)]
pub struct CompletionResponse {
    pub task_id: Uuid,
    pub occurrence_date: NaiveDate,
    pub completed_at: Option<DateTime<Utc>>,
    pub skipped: bool,
}

impl From<RecurringCompletion> for CompletionResponse {
    fn from(record: RecurringCompletion) -> Self {
        Self {
            task_id: record.task_id,
            occurrence_date: record.occurrence_date,
            completed_at: record.completed_at,
            skipped: record.skipped,
        }
    }
}

async fn record_completion(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(req): Json<RecordCompletionRequest>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(reply) => return reply.into_response(),
    };
    let when = req.completed_at.unwrap_or_else(Utc::now);
    match state.engine.record_completion(task_id, req.date, when).await {
        Ok(record) => Json(CompletionResponse::from(record)).into_response(),
        Err(err) => map_engine_error(err).into_response(),
    }
}

async fn record_skip(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(req): Json<RecordSkipRequest>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(reply) => return reply.into_response(),
    };
    match state.engine.record_skip(task_id, req.date).await {
        Ok(record) => Json(CompletionResponse::from(record)).into_response(),
        Err(err) => map_engine_error(err).into_response(),
    }
}

#[derive(Serialize)]
pub struct DeleteCompletionResponse {
    pub deleted: bool,
    /// Streaks recomputed after the delete, since removing a record can
    /// turn a paused streak into a broken one.
    pub stats: HabitStats,
}

async fn delete_completion(
    State(state): State<Arc<AppState>>,
    Path((task_id, raw_date)): Path<(String, String)>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(reply) => return reply.into_response(),
    };
    let date = match parse_iso_date(&raw_date, "date") {
        Ok(date) => date,
        Err(reply) => return reply.into_response(),
    };

    let deleted = match state.engine.delete_completion(task_id, date).await {
        Ok(deleted) => deleted,
        Err(err) => return map_engine_error(err).into_response(),
    };
    if !deleted {
        return (StatusCode::NOT_FOUND, err_json("completion not found")).into_response();
    }

    match state
        .engine
        .habit_stats(task_id, Utc::now().date_naive())
        .await
    {
        Ok(stats) => Json(DeleteCompletionResponse {
            deleted: true,
            stats,
        })
        .into_response(),
        Err(err) => map_engine_error(err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct RangeParams {
    pub from: Option<String>,
    pub to: Option<String>,
}

async fn list_completions(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(reply) => return reply.into_response(),
    };
    let (Some(from_raw), Some(to_raw)) = (params.from, params.to) else {
        return (
            StatusCode::BAD_REQUEST,
            err_json("from and to query parameters are required"),
        )
            .into_response();
    };
    let from = match parse_iso_date(&from_raw, "from") {
        Ok(date) => date,
        Err(reply) => return reply.into_response(),
    };
    let to = match parse_iso_date(&to_raw, "to") {
        Ok(date) => date,
        Err(reply) => return reply.into_response(),
    };
    if from > to {
        return (StatusCode::BAD_REQUEST, err_json("from must not be after to")).into_response();
    }

    match state.engine.completions_in_range(task_id, from, to).await {
        Ok(records) => Json(
            records
                .into_iter()
                .map(CompletionResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => map_engine_error(err).into_response(),
    }
}

// ── Stats ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StatsParams {
    pub until: Option<String>,
}

async fn habit_stats(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(params): Query<StatsParams>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(reply) => return reply.into_response(),
    };
    let until = match params.until {
        Some(raw) => match parse_iso_date(&raw, "until") {
            Ok(date) => date,
            Err(reply) => return reply.into_response(),
        },
        None => Utc::now().date_naive(),
    };

    match state.engine.habit_stats(task_id, until).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => map_engine_error(err).into_response(),
    }
}

// ── Calendar feed ──────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct FeedParams {
    pub include_completed: Option<bool>,
    pub project: Option<String>,
}

/// Token-authenticated, read-only. Not tied to any session: the token is
/// meant to be pasted into a calendar client's subscription URL.
async fn calendar_feed(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(params): Query<FeedParams>,
) -> impl IntoResponse {
    let Some(expected) = state.engine.config.calendar.feed_token.as_deref() else {
        return (StatusCode::NOT_FOUND, err_json("calendar feed is disabled")).into_response();
    };
    if !token_matches(expected, &token) {
        return (StatusCode::FORBIDDEN, err_json("invalid feed token")).into_response();
    }

    let include_completed = params.include_completed.unwrap_or(false);
    match state
        .engine
        .calendar_feed(include_completed, params.project.as_deref(), Utc::now())
        .await
    {
        Ok(document) => (
            [(header::CONTENT_TYPE, "text/calendar; charset=utf-8")],
            document,
        )
            .into_response(),
        Err(err) => map_engine_error(err).into_response(),
    }
}

/// Constant-time token comparison.
fn token_matches(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    if expected.len() != provided.len() {
        return false;
    }
    expected
        .iter()
        .zip(provided)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::token_matches;

    #[test]
    fn token_comparison_requires_exact_match() {
        assert!(token_matches("feed-token", "feed-token"));
        assert!(!token_matches("feed-token", "feed-tokeN"));
        assert!(!token_matches("feed-token", "feed-toke"));
        assert!(!token_matches("feed-token", ""));
    }
}
