//! API route handlers for the gateway.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use punchclock_core::error::PunchError;
use punchclock_scheduler::RunOutcome;

use super::server::AppState;

/// How long a run request waits for an immediate rejection before answering 202.
const ACCEPT_WINDOW: Duration = Duration::from_millis(500);

/// `PunchError` rendered as `{ok: false, kind, error}` with a matching status code.
pub struct ApiError(PunchError);

impl From<PunchError> for ApiError {
    fn from(err: PunchError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PunchError::Settings(_) | PunchError::Config(_) => StatusCode::BAD_REQUEST,
            PunchError::InvalidState(_) | PunchError::Concurrency(_) | PunchError::Recovery(_) => {
                StatusCode::CONFLICT
            }
            PunchError::Planning(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PunchError::Action(_) | PunchError::Notification(_) => StatusCode::BAD_GATEWAY,
            PunchError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            PunchError::Io(_) | PunchError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "ok": false,
            "kind": self.0.kind(),
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn parse_day(raw: Option<&str>) -> Result<Option<NaiveDate>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(day) => NaiveDate::parse_from_str(day, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| PunchError::Settings("Invalid date format. Use YYYY-MM-DD".into()).into()),
    }
}

/// Run a long flow in the background. Early rejections are reported inline;
/// anything still running after [`ACCEPT_WINDOW`] is answered with 202.
async fn spawn_flow<F>(label: &'static str, run_id: String, flow: F) -> ApiResult
where
    F: Future<Output = punchclock_core::Result<RunOutcome>> + Send + 'static,
{
    let mut handle = tokio::spawn(async move {
        let result = flow.await;
        match &result {
            Ok(outcome) => tracing::info!("🏁 {label} {} finished: {}", outcome.run_id, outcome.message),
            Err(e) => tracing::warn!("⚠️ {label} ended: {e}"),
        }
        result
    });

    match tokio::time::timeout(ACCEPT_WINDOW, &mut handle).await {
        Ok(Ok(Ok(outcome))) => Ok(Json(json!({ "ok": outcome.ok, "outcome": outcome })).into_response()),
        Ok(Ok(Err(e))) => Err(e.into()),
        Ok(Err(join)) => Err(PunchError::Action(format!("{label} task aborted: {join}")).into()),
        Err(_) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "ok": true, "accepted": true, "run_id": run_id })),
        )
            .into_response()),
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "punchclock-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "running": state.engine.is_running(),
    }))
}

/// Jobs this instance can run.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "jobs": state.engine.list_jobs() }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub supervision: bool,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Start today's run for `job`.
pub async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(job): Path<String>,
    body: Option<Json<RunRequest>>,
) -> ApiResult {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    if !state.job_secret.is_empty() && req.secret != state.job_secret {
        tracing::warn!("⚠️ Run request for '{job}' refused: bad secret");
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "kind": "unauthorized", "error": "invalid job secret" })),
        )
            .into_response());
    }

    let engine = state.engine.clone();
    let run_id = req
        .run_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("api-{}", engine.now().format("%Y%m%d-%H%M%S")));
    let supervision = req.supervision;
    let id = run_id.clone();
    spawn_flow("Run", run_id, async move { engine.run(&job, supervision, Some(id)).await }).await
}

/// Persisted state plus a human-readable message.
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "status": state.engine.status() }))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    pub day: Option<String>,
}

/// Most recent runtime events.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> ApiResult {
    let day = parse_day(query.day.as_deref())?;
    let events = state.engine.runtime_events(query.limit.unwrap_or(200), day)?;
    Ok(Json(json!({ "ok": true, "count": events.len(), "events": events })).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub day: Option<String>,
}

/// Clicks executed on a day (today by default).
pub async fn click_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let day = parse_day(query.day.as_deref())?.unwrap_or_else(|| state.engine.now().date_naive());
    let clicks = state.engine.daily_click_history(day)?;
    Ok(Json(json!({ "ok": true, "day": day, "clicks": clicks })).into_response())
}

/// Re-enter the flow at the failed action.
pub async fn retry_failed(State(state): State<Arc<AppState>>) -> ApiResult {
    let engine = state.engine.clone();
    let run_id = engine.state().run_id;
    spawn_flow("Retry", run_id, async move { engine.retry_failed_action().await }).await
}

/// Clear a finished or failed day.
pub async fn reset_session(State(state): State<Arc<AppState>>) -> ApiResult {
    let outcome = state.engine.reset_session()?;
    Ok(Json(outcome).into_response())
}

/// Blocked-day range.
pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "settings": state.engine.settings() }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsRequest {
    #[serde(default)]
    pub blocked_start_date: String,
    #[serde(default)]
    pub blocked_end_date: String,
}

/// Replace the blocked-day range. Two empty dates clear it.
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SettingsRequest>,
) -> ApiResult {
    let settings = state
        .engine
        .update_settings(&req.blocked_start_date, &req.blocked_end_date)?;
    tracing::info!(
        "🗓️ Blocked days updated: {:?} → {:?}",
        settings.blocked_start_date,
        settings.blocked_end_date
    );
    Ok(Json(json!({ "ok": true, "settings": settings })).into_response())
}
